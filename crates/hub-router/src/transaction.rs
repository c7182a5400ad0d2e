//! TransactionCoordinator - multi-operation atomic units
//!
//! Operations are staged in memory until every participant has acknowledged.
//! Commit writes all staged events, the accepted records of all staged
//! messages and a `hub.txn.committed` trailer as one log batch, so after a
//! crash either the whole transaction is in the log or none of it is.
//! Rollback and timeout discard the staged set; nothing is dispatched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hub_common::{system_events, Envelope, Event, Message, PublishRequest, SendRequest};
use hub_config::TransactionConfig;
use hub_store::EventStore;

use crate::error::HubError;
use crate::router::Router;
use crate::router_metrics;
use crate::Result;

/// Rollback reason recorded when a transaction outlives its timeout
pub const TIMEOUT_REASON: &str = "timeout";

/// Durable description of an open transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub txn_id: String,
    pub participants: Vec<String>,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Open,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
enum StagedOperation {
    Send(Message),
    Publish { event: Event, messages: Vec<Message> },
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionView {
    pub txn_id: String,
    pub status: TransactionStatus,
    pub participants: Vec<String>,
    pub acked: Vec<String>,
    pub failed: BTreeMap<String, String>,
    pub operations: usize,
    pub opened_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of a successful commit
#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub txn_id: String,
    pub operations: usize,
    pub message_ids: Vec<String>,
    pub event_ids: Vec<String>,
}

struct Transaction {
    record: TransactionRecord,
    status: TransactionStatus,
    operations: Vec<StagedOperation>,
    acked: BTreeSet<String>,
    failed: BTreeMap<String, String>,
    opened: Instant,
    closed: Option<Instant>,
    reason: Option<String>,
}

impl Transaction {
    fn view(&self) -> TransactionView {
        TransactionView {
            txn_id: self.record.txn_id.clone(),
            status: self.status,
            participants: self.record.participants.clone(),
            acked: self.acked.iter().cloned().collect(),
            failed: self.failed.clone(),
            operations: self.operations.len(),
            opened_at: self.record.opened_at,
            reason: self.reason.clone(),
        }
    }

    fn stages_message(&self, id: &str) -> bool {
        self.operations.iter().any(|op| match op {
            StagedOperation::Send(message) => message.id == id,
            StagedOperation::Publish { messages, .. } => messages.iter().any(|m| m.id == id),
        })
    }

    fn timed_out(&self) -> bool {
        self.status == TransactionStatus::RolledBack && self.reason.as_deref() == Some(TIMEOUT_REASON)
    }
}

pub struct TransactionCoordinator {
    config: TransactionConfig,
    store: EventStore,
    router: Arc<Router>,
    commit_gate: Arc<RwLock<()>>,
    transactions: DashMap<String, Arc<Mutex<Transaction>>>,
    /// Open transactions, kept in step with the log under the commit gate
    open: DashMap<String, (TransactionRecord, Instant)>,
}

impl TransactionCoordinator {
    pub fn new(
        config: TransactionConfig,
        store: EventStore,
        router: Arc<Router>,
        commit_gate: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            config,
            store,
            router,
            commit_gate,
            transactions: DashMap::new(),
            open: DashMap::new(),
        }
    }

    /// Open a transaction whose commit waits for every named participant
    pub async fn begin(&self, participants: Vec<String>) -> Result<String> {
        let participants: Vec<String> = participants
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let record = TransactionRecord {
            txn_id: uuid::Uuid::new_v4().to_string(),
            participants,
            opened_at: Utc::now(),
        };
        let txn_id = record.txn_id.clone();

        let event = Event::system(
            system_events::TXN_BEGIN,
            txn_id.clone(),
            serde_json::to_value(&record).unwrap_or_default(),
        );
        let opened = Instant::now();
        {
            let _gate = self.commit_gate.read().await;
            self.store.append(event).await?;
            self.open.insert(txn_id.clone(), (record.clone(), opened));
        }

        self.transactions.insert(
            txn_id.clone(),
            Arc::new(Mutex::new(Transaction {
                record,
                status: TransactionStatus::Open,
                operations: Vec::new(),
                acked: BTreeSet::new(),
                failed: BTreeMap::new(),
                opened,
                closed: None,
                reason: None,
            })),
        );

        router_metrics::record_transaction("begun");
        debug!(txn_id = %txn_id, "Transaction opened");
        Ok(txn_id)
    }

    fn get(&self, txn_id: &str) -> Result<Arc<Mutex<Transaction>>> {
        self.transactions
            .get(txn_id)
            .map(|t| t.clone())
            .ok_or_else(|| HubError::not_found("transaction", txn_id))
    }

    /// Ensure `txn` is open and within its timeout; an expired transaction
    /// is rolled back on the spot.
    async fn ensure_open(&self, txn: &mut Transaction) -> Result<()> {
        match txn.status {
            TransactionStatus::Open => {}
            TransactionStatus::RolledBack if txn.timed_out() => {
                return Err(HubError::TransactionTimeout { txn_id: txn.record.txn_id.clone() });
            }
            status => {
                return Err(HubError::transaction_state(
                    txn.record.txn_id.clone(),
                    format!("transaction is {:?}", status),
                ));
            }
        }
        if txn.opened.elapsed() >= self.config.timeout() {
            self.finish_rollback(txn, TIMEOUT_REASON).await?;
            return Err(HubError::TransactionTimeout { txn_id: txn.record.txn_id.clone() });
        }
        Ok(())
    }

    /// Stage an envelope. Returns the id of the staged message or event.
    pub async fn add(&self, txn_id: &str, envelope: Envelope) -> Result<String> {
        let operation = match envelope {
            Envelope::Message(message) => StagedOperation::Send(self.router.prepare_message(message)?),
            Envelope::Event(event) => {
                let (event, messages) = self.router.prepare_publish(PublishRequest {
                    message_type: None,
                    source: event.source,
                    event_type: event.event_type,
                    correlation_id: Some(event.correlation_id),
                    payload: event.payload,
                })?;
                StagedOperation::Publish { event, messages }
            }
        };
        self.stage(txn_id, operation).await
    }

    pub async fn stage_send(&self, txn_id: &str, request: SendRequest) -> Result<String> {
        let message = self.router.prepare_send(request)?;
        self.stage(txn_id, StagedOperation::Send(message)).await
    }

    pub async fn stage_publish(&self, txn_id: &str, request: PublishRequest) -> Result<String> {
        let (event, messages) = self.router.prepare_publish(request)?;
        self.stage(txn_id, StagedOperation::Publish { event, messages }).await
    }

    async fn stage(&self, txn_id: &str, operation: StagedOperation) -> Result<String> {
        let txn = self.get(txn_id)?;
        let mut txn = txn.lock().await;
        self.ensure_open(&mut txn).await?;

        let id = match &operation {
            StagedOperation::Send(message) => message.id.clone(),
            StagedOperation::Publish { event, .. } => event.id.clone(),
        };
        // A message id is accepted once; commit skips ids that become known
        // after staging
        if let StagedOperation::Send(message) = &operation {
            if self.router.is_known(&message.id) || txn.stages_message(&message.id) {
                debug!(txn_id = %txn_id, message_id = %message.id, "Duplicate message not staged");
                return Ok(id);
            }
        }
        txn.operations.push(operation);
        debug!(txn_id = %txn_id, staged_id = %id, operations = txn.operations.len(), "Operation staged");
        Ok(id)
    }

    /// Record that `participant` is ready to commit
    pub async fn ack(&self, txn_id: &str, participant: &str) -> Result<TransactionView> {
        let txn = self.get(txn_id)?;
        let mut txn = txn.lock().await;
        self.ensure_open(&mut txn).await?;
        if !txn.record.participants.iter().any(|p| p == participant) {
            return Err(HubError::validation(format!(
                "{} is not a participant of transaction {}",
                participant, txn_id
            )));
        }
        txn.failed.remove(participant);
        txn.acked.insert(participant.to_string());
        Ok(txn.view())
    }

    /// Record that `participant` cannot commit. The transaction stays open
    /// until it is rolled back or times out.
    pub async fn fail(&self, txn_id: &str, participant: &str, reason: &str) -> Result<TransactionView> {
        let txn = self.get(txn_id)?;
        let mut txn = txn.lock().await;
        self.ensure_open(&mut txn).await?;
        if !txn.record.participants.iter().any(|p| p == participant) {
            return Err(HubError::validation(format!(
                "{} is not a participant of transaction {}",
                participant, txn_id
            )));
        }
        txn.acked.remove(participant);
        txn.failed.insert(participant.to_string(), reason.to_string());
        warn!(txn_id = %txn_id, participant = %participant, reason = %reason, "Transaction participant failed");
        Ok(txn.view())
    }

    pub async fn commit(&self, txn_id: &str) -> Result<CommitReport> {
        let txn = self.get(txn_id)?;
        let mut txn = txn.lock().await;
        self.ensure_open(&mut txn).await?;

        if let Some((participant, reason)) = txn.failed.iter().next() {
            return Err(HubError::transaction_state(
                txn_id,
                format!("participant {} failed: {}", participant, reason),
            ));
        }
        let pending: Vec<&String> = txn
            .record
            .participants
            .iter()
            .filter(|p| !txn.acked.contains(*p))
            .collect();
        if !pending.is_empty() {
            return Err(HubError::transaction_state(
                txn_id,
                format!("awaiting acknowledgement from {:?}", pending),
            ));
        }

        let mut events = Vec::new();
        let mut messages = Vec::new();
        for operation in &txn.operations {
            match operation {
                StagedOperation::Send(message) => messages.push(message.clone()),
                StagedOperation::Publish { event, messages: fan_out } => {
                    events.push(event.clone());
                    messages.extend(fan_out.iter().cloned());
                }
            }
        }
        let operations = txn.operations.len();
        let event_ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let trailer = |admitted: &[Message]| {
            let message_ids: Vec<&str> = admitted.iter().map(|m| m.id.as_str()).collect();
            Some(Event::system(
                system_events::TXN_COMMITTED,
                txn_id.to_string(),
                json!({
                    "txn_id": txn_id,
                    "operations": operations,
                    "message_ids": message_ids,
                }),
            ))
        };

        let open = &self.open;
        let admitted = self
            .router
            .persist_and_admit(events, messages, trailer, || {
                open.remove(txn_id);
            })
            .await?;
        let report = CommitReport {
            txn_id: txn_id.to_string(),
            operations,
            message_ids: admitted.message_ids,
            event_ids,
        };

        txn.status = TransactionStatus::Committed;
        txn.closed = Some(Instant::now());
        txn.operations.clear();
        router_metrics::record_transaction("committed");
        info!(
            txn_id = %txn_id,
            operations = report.operations,
            messages = report.message_ids.len(),
            "Transaction committed"
        );
        Ok(report)
    }

    /// Discard the staged operations. Rolling back twice is a no-op.
    pub async fn rollback(&self, txn_id: &str, reason: &str) -> Result<TransactionView> {
        let txn = self.get(txn_id)?;
        let mut txn = txn.lock().await;
        match txn.status {
            TransactionStatus::RolledBack => return Ok(txn.view()),
            TransactionStatus::Committed => {
                return Err(HubError::transaction_state(txn_id, "transaction already committed"));
            }
            TransactionStatus::Open => {}
        }
        self.finish_rollback(&mut txn, reason).await?;
        Ok(txn.view())
    }

    async fn finish_rollback(&self, txn: &mut Transaction, reason: &str) -> Result<()> {
        let txn_id = txn.record.txn_id.clone();
        let event = Event::system(
            system_events::TXN_ROLLED_BACK,
            txn_id.clone(),
            json!({ "txn_id": txn_id, "reason": reason }),
        );
        {
            let _gate = self.commit_gate.read().await;
            self.store.append(event).await?;
            self.open.remove(&txn_id);
        }

        let discarded = txn.operations.len();
        txn.status = TransactionStatus::RolledBack;
        txn.reason = Some(reason.to_string());
        txn.closed = Some(Instant::now());
        txn.operations.clear();
        router_metrics::record_transaction("rolled_back");
        info!(txn_id = %txn_id, reason = %reason, discarded = discarded, "Transaction rolled back");
        Ok(())
    }

    /// Roll back open transactions past the timeout and forget long-closed
    /// ones. Returns the number rolled back.
    pub async fn expire_stale(&self) -> usize {
        let timeout = self.config.timeout();
        let stale: Vec<String> = self
            .open
            .iter()
            .filter(|e| e.value().1.elapsed() >= timeout)
            .map(|e| e.key().clone())
            .collect();

        let mut rolled_back = 0;
        for txn_id in stale {
            let Ok(txn) = self.get(&txn_id) else {
                continue;
            };
            let mut txn = txn.lock().await;
            if txn.status != TransactionStatus::Open {
                continue;
            }
            match self.finish_rollback(&mut txn, TIMEOUT_REASON).await {
                Ok(()) => rolled_back += 1,
                Err(e) => warn!(txn_id = %txn_id, error = %e, "Failed to roll back expired transaction"),
            }
        }

        // Closed transactions stay visible for a while so late calls get a
        // precise error
        let keep_closed = timeout * 10;
        self.transactions.retain(|_, txn| match txn.try_lock() {
            Ok(t) => t.closed.map(|at| at.elapsed() < keep_closed).unwrap_or(true),
            Err(_) => true,
        });
        rolled_back
    }

    /// Roll back transactions found open during recovery
    pub async fn roll_back_recovered(&self, records: impl IntoIterator<Item = TransactionRecord>) -> Result<usize> {
        let mut count = 0;
        for record in records {
            let txn_id = record.txn_id.clone();
            let mut txn = Transaction {
                record,
                status: TransactionStatus::Open,
                operations: Vec::new(),
                acked: BTreeSet::new(),
                failed: BTreeMap::new(),
                opened: Instant::now(),
                closed: None,
                reason: None,
            };
            self.finish_rollback(&mut txn, TIMEOUT_REASON).await?;
            self.transactions.insert(txn_id, Arc::new(Mutex::new(txn)));
            count += 1;
        }
        Ok(count)
    }

    pub async fn status(&self, txn_id: &str) -> Result<TransactionView> {
        let txn = self.get(txn_id)?;
        let txn = txn.lock().await;
        Ok(txn.view())
    }

    /// Open transactions, for snapshots
    pub fn open_records(&self) -> BTreeMap<String, TransactionRecord> {
        self.open
            .iter()
            .map(|e| (e.key().clone(), e.value().0.clone()))
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
