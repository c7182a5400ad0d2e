//! Crash recovery
//!
//! Rebuilds router, retry and transaction state from the latest snapshot
//! plus the log tail. Only the hub's own bookkeeping events carry state;
//! each event type maps to one handler in a fixed table. Handlers are
//! idempotent so replaying an event already covered by the snapshot is
//! harmless.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use hub_common::{system_events, DeadLetterReason, Event, Message, MessageStatus};
use hub_store::{EventStore, ReplayFrom, StoreError};

use crate::retry::RetryRecord;
use crate::transaction::TransactionRecord;
use crate::Result;

/// State captured by snapshots and rebuilt on startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveredState {
    pub messages: BTreeMap<String, Message>,
    pub retries: BTreeMap<String, RetryRecord>,
    pub transactions: BTreeMap<String, TransactionRecord>,
}

impl RecoveredState {
    /// Drop retry records whose message is finished or unknown
    pub fn normalize(&mut self) {
        let messages = &self.messages;
        self.retries
            .retain(|id, _| messages.get(id).map(|m| !m.is_terminal()).unwrap_or(false));
    }

    pub fn live_messages(&self) -> usize {
        self.messages.values().filter(|m| !m.is_terminal()).count()
    }
}

type EventHandler = fn(&mut RecoveredState, &Event) -> Result<()>;

fn handlers() -> HashMap<&'static str, EventHandler> {
    let mut table: HashMap<&'static str, EventHandler> = HashMap::new();
    table.insert(system_events::MESSAGE_ACCEPTED, apply_accepted);
    table.insert(system_events::MESSAGE_DELIVERED, apply_delivered);
    table.insert(system_events::DEAD_LETTERED_SUFFIX, apply_dead_lettered);
    table.insert(system_events::RETRY_SCHEDULED, apply_retry_scheduled);
    table.insert(system_events::TXN_BEGIN, apply_txn_begin);
    table.insert(system_events::TXN_COMMITTED, apply_txn_closed);
    table.insert(system_events::TXN_ROLLED_BACK, apply_txn_closed);
    table
}

fn handler_key(event_type: &str) -> &str {
    if system_events::is_dead_lettered(event_type) {
        system_events::DEAD_LETTERED_SUFFIX
    } else {
        event_type
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &Event) -> Result<T> {
    serde_json::from_value(event.payload.clone()).map_err(|e| StoreError::from(e).into())
}

fn field<'a>(event: &'a Event, name: &str) -> Option<&'a Value> {
    event.payload.get(name)
}

fn apply_accepted(state: &mut RecoveredState, event: &Event) -> Result<()> {
    let message: Message = decode(event)?;
    state.messages.entry(message.id.clone()).or_insert(message);
    Ok(())
}

fn apply_delivered(state: &mut RecoveredState, event: &Event) -> Result<()> {
    let Some(id) = field(event, "message_id").and_then(Value::as_str) else {
        return Ok(());
    };
    let attempts = field(event, "attempts").and_then(Value::as_u64).unwrap_or(0) as u32;
    if let Some(message) = state.messages.get_mut(id) {
        if message.transition(MessageStatus::Delivered).is_ok() {
            message.delivery_attempts = message.delivery_attempts.max(attempts);
        }
    }
    state.retries.remove(id);
    Ok(())
}

fn apply_dead_lettered(state: &mut RecoveredState, event: &Event) -> Result<()> {
    let Some(id) = field(event, "message_id").and_then(Value::as_str) else {
        return Ok(());
    };
    let attempts = field(event, "attempts").and_then(Value::as_u64).unwrap_or(0) as u32;
    let reason: Option<DeadLetterReason> = field(event, "reason").and_then(|r| serde_json::from_value(r.clone()).ok());
    if let Some(message) = state.messages.get_mut(id) {
        if message.transition(MessageStatus::DeadLettered).is_ok() {
            message.dead_letter_reason = reason;
            message.delivery_attempts = message.delivery_attempts.max(attempts);
        }
    }
    state.retries.remove(id);
    Ok(())
}

fn apply_retry_scheduled(state: &mut RecoveredState, event: &Event) -> Result<()> {
    let record: RetryRecord = decode(event)?;
    let Some(message) = state.messages.get_mut(&record.message_id) else {
        return Ok(());
    };
    if message.is_terminal() {
        return Ok(());
    }
    let _ = message.transition(MessageStatus::Failed);
    message.delivery_attempts = message.delivery_attempts.max(record.attempt_count);
    state.retries.insert(record.message_id.clone(), record);
    Ok(())
}

fn apply_txn_begin(state: &mut RecoveredState, event: &Event) -> Result<()> {
    let record: TransactionRecord = decode(event)?;
    state.transactions.entry(record.txn_id.clone()).or_insert(record);
    Ok(())
}

fn apply_txn_closed(state: &mut RecoveredState, event: &Event) -> Result<()> {
    if let Some(id) = field(event, "txn_id").and_then(Value::as_str) {
        state.transactions.remove(id);
    }
    Ok(())
}

/// Fold one event into `state`. Events from producers carry no hub state.
pub fn apply(state: &mut RecoveredState, event: &Event, table: &HashMap<&'static str, EventHandler>) -> Result<()> {
    if !event.is_system() {
        return Ok(());
    }
    match table.get(handler_key(&event.event_type)) {
        Some(handler) => handler(state, event),
        None => {
            debug!(event_type = %event.event_type, "No recovery handler for system event");
            Ok(())
        }
    }
}

/// Load the latest snapshot and replay everything after it
pub async fn recover(store: &EventStore) -> Result<RecoveredState> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || recover_blocking(&store))
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn recover_blocking(store: &EventStore) -> Result<RecoveredState> {
    let (mut state, from) = match store.latest_snapshot() {
        Some(snapshot) => {
            let state: RecoveredState = match serde_json::from_value(snapshot.state) {
                Ok(state) => state,
                Err(e) => {
                    return Err(StoreError::InvalidSnapshot(format!(
                        "snapshot at sequence {} is not hub state: {}",
                        snapshot.sequence, e
                    ))
                    .into())
                }
            };
            (state, ReplayFrom::Sequence(snapshot.sequence + 1))
        }
        None => (RecoveredState::default(), ReplayFrom::Beginning),
    };

    let table = handlers();
    let mut replayed = 0u64;
    for event in store.replay(from)? {
        let event = event?;
        if let Err(e) = apply(&mut state, &event, &table) {
            warn!(
                sequence_number = event.sequence_number,
                event_type = %event.event_type,
                error = %e,
                "Skipping undecodable system event"
            );
        }
        replayed += 1;
    }
    state.normalize();

    info!(
        replayed = replayed,
        messages = state.messages.len(),
        live_messages = state.live_messages(),
        retries = state.retries.len(),
        open_transactions = state.transactions.len(),
        "Recovered hub state"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hub_common::{Priority, HUB_SOURCE};
    use serde_json::json;

    fn message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            message_type: "image.render".to_string(),
            source: "campaign".to_string(),
            destination: "image".to_string(),
            correlation_id: id.to_string(),
            payload: json!({}),
            priority: Priority::Normal,
            ttl_ms: None,
            deadline: None,
            created_at: Utc::now(),
            delivery_attempts: 0,
            last_attempt_at: None,
            status: MessageStatus::Pending,
            dead_letter_reason: None,
            origin_event_id: None,
        }
    }

    fn system(event_type: &str, payload: Value) -> Event {
        Event::system(event_type, "c", payload)
    }

    #[test]
    fn test_replay_is_idempotent_and_monotonic() {
        let table = handlers();
        let mut state = RecoveredState::default();
        let accepted = system(system_events::MESSAGE_ACCEPTED, serde_json::to_value(message("m-1")).unwrap());
        let dead = system(
            &system_events::dead_lettered("image.render"),
            json!({"message_id": "m-1", "reason": "max_attempts_exceeded", "attempts": 3}),
        );

        apply(&mut state, &accepted, &table).unwrap();
        apply(&mut state, &dead, &table).unwrap();
        // Replaying the accepted record again must not resurrect the message
        apply(&mut state, &accepted, &table).unwrap();
        apply(&mut state, &dead, &table).unwrap();

        let m = &state.messages["m-1"];
        assert_eq!(m.status, MessageStatus::DeadLettered);
        assert_eq!(m.dead_letter_reason, Some(DeadLetterReason::MaxAttemptsExceeded));
        assert_eq!(m.delivery_attempts, 3);
    }

    #[test]
    fn test_retry_records_follow_message_lifecycle() {
        let table = handlers();
        let mut state = RecoveredState::default();
        apply(
            &mut state,
            &system(system_events::MESSAGE_ACCEPTED, serde_json::to_value(message("m-1")).unwrap()),
            &table,
        )
        .unwrap();
        let record = RetryRecord {
            message_id: "m-1".to_string(),
            attempt_count: 2,
            next_retry_at: Utc::now(),
            backoff_base_ms: 100,
            jitter_seed: 9,
        };
        apply(
            &mut state,
            &system(system_events::RETRY_SCHEDULED, serde_json::to_value(&record).unwrap()),
            &table,
        )
        .unwrap();
        assert_eq!(state.retries["m-1"], record);
        assert_eq!(state.messages["m-1"].status, MessageStatus::Failed);
        assert_eq!(state.messages["m-1"].delivery_attempts, 2);

        apply(
            &mut state,
            &system(system_events::MESSAGE_DELIVERED, json!({"message_id": "m-1", "attempts": 3})),
            &table,
        )
        .unwrap();
        assert!(state.retries.is_empty());
        assert_eq!(state.messages["m-1"].status, MessageStatus::Delivered);
    }

    #[test]
    fn test_transactions_close_on_terminal_record() {
        let table = handlers();
        let mut state = RecoveredState::default();
        let record = TransactionRecord {
            txn_id: "t-1".to_string(),
            participants: vec!["campaign".to_string()],
            opened_at: Utc::now(),
        };
        apply(&mut state, &system(system_events::TXN_BEGIN, serde_json::to_value(&record).unwrap()), &table).unwrap();
        assert!(state.transactions.contains_key("t-1"));

        apply(
            &mut state,
            &system(system_events::TXN_ROLLED_BACK, json!({"txn_id": "t-1", "reason": "timeout"})),
            &table,
        )
        .unwrap();
        assert!(state.transactions.is_empty());
    }

    #[test]
    fn test_producer_events_are_ignored() {
        let table = handlers();
        let mut state = RecoveredState::default();
        let forged = Event::new("campaign", system_events::MESSAGE_ACCEPTED, json!({"bogus": true}));
        assert_ne!(forged.source, HUB_SOURCE);
        apply(&mut state, &forged, &table).unwrap();
        assert_eq!(state, RecoveredState::default());
    }
}
