//! Retry scheduling with exponential backoff
//!
//! Every scheduled retry is written to the event log as a
//! `hub.retry.scheduled` record before its timer is armed, so a restart
//! re-arms the same schedule. The jitter applied to attempt `n` is derived
//! from the record's seed and `n` only.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use hub_common::{system_events, Event, Message};
use hub_config::RetryConfig;
use hub_store::EventStore;

use crate::router_metrics;
use crate::timer::TimerQueue;
use crate::Result;

/// Backoff parameters for one message type
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt` completed deliveries:
    /// `min(max_delay, base_delay * 2^(attempt-1))` scaled by `1 ± jitter`.
    pub fn delay_for(&self, attempt: u32, seed: u64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = 2_u32.saturating_pow(exponent);
        let capped = self.base_delay.saturating_mul(multiplier).min(self.max_delay);

        if self.jitter_fraction <= 0.0 {
            return capped;
        }
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(attempt as u64));
        let factor = 1.0 + rng.gen_range(-self.jitter_fraction..=self.jitter_fraction);
        Duration::from_secs_f64((capped.as_secs_f64() * factor).max(0.0))
    }
}

/// Durable redelivery schedule of one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub message_id: String,
    pub attempt_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub backoff_base_ms: u64,
    pub jitter_seed: u64,
}

pub struct RetryManager {
    config: RetryConfig,
    store: EventStore,
    commit_gate: Arc<RwLock<()>>,
    pending: DashMap<String, RetryRecord>,
    timers: TimerQueue<String>,
}

impl RetryManager {
    /// Returns the manager and the feed of message ids whose timers fired
    pub fn new(
        config: RetryConfig,
        store: EventStore,
        commit_gate: Arc<RwLock<()>>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (timers, due) = TimerQueue::new();
        let manager = Self {
            config,
            store,
            commit_gate,
            pending: DashMap::new(),
            timers,
        };
        (manager, due)
    }

    pub fn policy_for(&self, message_type: &str) -> RetryPolicy {
        let mut policy = RetryPolicy {
            max_attempts: self.config.max_attempts,
            base_delay: Duration::from_millis(self.config.base_delay_ms),
            max_delay: Duration::from_millis(self.config.max_delay_ms),
            jitter_fraction: self.config.jitter_fraction,
        };
        if let Some(o) = self.config.per_type.get(message_type) {
            if let Some(max_attempts) = o.max_attempts {
                policy.max_attempts = max_attempts;
            }
            if let Some(base) = o.base_delay_ms {
                policy.base_delay = Duration::from_millis(base);
            }
            if let Some(max) = o.max_delay_ms {
                policy.max_delay = Duration::from_millis(max);
            }
        }
        policy
    }

    /// True once the message has used its last permitted attempt
    pub fn exhausted(&self, message: &Message) -> bool {
        message.delivery_attempts >= self.policy_for(&message.message_type).max_attempts
    }

    /// Persist and arm the next retry of `message`. The timer fires no later
    /// than `expires_at` so TTL expiry is noticed on time.
    pub async fn schedule_retry(&self, message: &Message, expires_at: Option<Instant>) -> Result<RetryRecord> {
        let policy = self.policy_for(&message.message_type);
        let attempt = message.delivery_attempts;
        let seed = self
            .pending
            .get(&message.id)
            .map(|r| r.jitter_seed)
            .unwrap_or_else(rand::random);

        let delay = policy.delay_for(attempt, seed);
        let next_retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let record = RetryRecord {
            message_id: message.id.clone(),
            attempt_count: attempt,
            next_retry_at,
            backoff_base_ms: policy.base_delay.as_millis() as u64,
            jitter_seed: seed,
        };

        let event = Event::system(
            system_events::RETRY_SCHEDULED,
            message.correlation_id.clone(),
            serde_json::to_value(&record).unwrap_or_default(),
        );
        {
            let _gate = self.commit_gate.read().await;
            self.store.append(event).await?;
            self.pending.insert(message.id.clone(), record.clone());
        }

        let due = Instant::now() + delay;
        let fire_at = expires_at.map(|e| e.min(due)).unwrap_or(due);
        self.timers.schedule(message.id.clone(), fire_at);
        router_metrics::record_retry(&message.destination);

        debug!(
            message_id = %message.id,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        Ok(record)
    }

    /// Re-arm the timer of `message_id` without persisting a new record.
    /// Used when a circuit rejection pushes a dispatch back.
    pub fn defer(&self, message_id: &str, at: Instant) {
        self.timers.schedule(message_id.to_string(), at);
    }

    /// Drop any pending retry; a timer that already fired becomes a no-op
    /// for the router because the message is terminal.
    pub fn cancel(&self, message_id: &str) {
        self.timers.cancel(message_id.to_string());
        self.pending.remove(message_id);
    }

    /// Re-arm timers from recovered records; overdue ones fire immediately
    pub fn restore(&self, records: impl IntoIterator<Item = RetryRecord>) {
        let now = Utc::now();
        let mut restored = 0usize;
        for record in records {
            let remaining = (record.next_retry_at - now).to_std().unwrap_or(Duration::ZERO);
            self.timers.schedule(record.message_id.clone(), Instant::now() + remaining);
            self.pending.insert(record.message_id.clone(), record);
            restored += 1;
        }
        if restored > 0 {
            info!(restored = restored, "Re-armed recovered retry timers");
        }
    }

    pub fn record(&self, message_id: &str) -> Option<RetryRecord> {
        self.pending.get(message_id).map(|r| r.clone())
    }

    pub fn records(&self) -> Vec<RetryRecord> {
        let mut records: Vec<RetryRecord> = self.pending.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        records
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter_fraction: jitter,
        }
    }

    #[test]
    fn test_exponential_growth_with_cap() {
        let p = policy(0.0);
        assert_eq!(p.delay_for(1, 7), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, 7), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, 7), Duration::from_millis(400));
        assert_eq!(p.delay_for(4, 7), Duration::from_millis(800));
        assert_eq!(p.delay_for(5, 7), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(40, 7), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_is_reproducible_from_seed() {
        let p = policy(0.3);
        for attempt in 1..6 {
            assert_eq!(p.delay_for(attempt, 42), p.delay_for(attempt, 42));
        }
        let differs = (1..6).any(|a| p.delay_for(a, 42) != p.delay_for(a, 43));
        assert!(differs);
    }

    #[test]
    fn test_jitter_stays_in_bounds_and_increasing() {
        let p = RetryPolicy {
            max_delay: Duration::from_secs(3600),
            ..policy(0.3)
        };
        for seed in 0..50u64 {
            let mut previous = Duration::ZERO;
            for attempt in 1..8 {
                let d = p.delay_for(attempt, seed);
                let nominal = 100.0 * 2f64.powi(attempt as i32 - 1);
                let ms = d.as_secs_f64() * 1000.0;
                assert!(ms >= nominal * 0.7 - 0.001 && ms <= nominal * 1.3 + 0.001);
                assert!(d > previous);
                previous = d;
            }
        }
    }
}
