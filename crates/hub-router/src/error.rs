use std::time::Duration;

use thiserror::Error;

use hub_common::Priority;
use hub_store::StoreError;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no healthy instance available for {service}")]
    UnavailableDestination { service: String },

    #[error("circuit open for {destination}, retry after {retry_after:?}")]
    CircuitOpen {
        destination: String,
        retry_after: Duration,
    },

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("transaction {txn_id} timed out and was rolled back")]
    TransactionTimeout { txn_id: String },

    #[error("transaction {txn_id}: {message}")]
    TransactionState { txn_id: String, message: String },

    #[error("queue full at {priority} priority (capacity {capacity})")]
    QueueFull { priority: Priority, capacity: usize },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("hub is shutting down")]
    Shutdown,
}

impl HubError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn transaction_state(txn_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransactionState {
            txn_id: txn_id.into(),
            message: message.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, HubError::Persistence(StoreError::Corrupted { .. }))
    }
}
