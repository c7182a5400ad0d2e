//! PriorityQueueManager - multi-level, per-destination scheduling
//!
//! - Four priority levels, each holding one FIFO queue per destination
//! - Effective priority rises one level per `aging_interval` waited and jumps
//!   to the top inside the deadline boost window
//! - Ties break on enqueue order (priority-then-age)
//! - Per-destination dequeue quotas via governor; over-quota work stays queued
//! - Per-level capacity; full levels reject new admissions with `QueueFull`

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use hub_common::Priority;
use hub_config::QueueConfig;

use crate::error::HubError;
use crate::router_metrics;
use crate::Result;

/// A queued reference to a message awaiting dispatch
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message_id: String,
    pub destination: String,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    seq: u64,
}

impl QueuedMessage {
    pub fn new(
        message_id: impl Into<String>,
        destination: impl Into<String>,
        priority: Priority,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            destination: destination.into(),
            priority,
            enqueued_at: Instant::now(),
            deadline,
            seq: 0,
        }
    }

    /// Backdate the entry, e.g. to carry waiting time across a requeue
    pub fn enqueued_at(mut self, at: Instant) -> Self {
        self.enqueued_at = at;
        self
    }
}

#[derive(Default)]
struct DestinationQueues {
    levels: [VecDeque<QueuedMessage>; Priority::LEVELS],
}

impl DestinationQueues {
    fn is_empty(&self) -> bool {
        self.levels.iter().all(|q| q.is_empty())
    }

    fn len(&self) -> usize {
        self.levels.iter().map(|q| q.len()).sum()
    }
}

enum Dequeue {
    Popped(Option<QueuedMessage>),
    Throttled,
}

type LevelDepths = Arc<[AtomicUsize; Priority::LEVELS]>;

/// Capacity held for one admission. Released on drop unless consumed by
/// [`PriorityQueueManager::enqueue`].
pub struct Reservation {
    depths: LevelDepths,
    level: usize,
    armed: bool,
}

impl Reservation {
    pub fn priority(&self) -> Priority {
        Priority::from_level(self.level)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.depths[self.level].fetch_sub(1, Ordering::AcqRel);
        }
    }
}

pub struct PriorityQueueManager {
    config: QueueConfig,
    queues: DashMap<String, Mutex<DestinationQueues>>,
    depths: LevelDepths,
    seq: AtomicU64,
    limiter: Option<DefaultKeyedRateLimiter<String>>,
    work: Notify,
}

impl PriorityQueueManager {
    pub fn new(config: QueueConfig) -> Self {
        let limiter = config.quota_max_dequeues.and_then(|max| {
            let burst = NonZeroU32::new(max)?;
            let period = config.quota_window() / max;
            Quota::with_period(period).map(|q| RateLimiter::keyed(q.allow_burst(burst)))
        });

        Self {
            config,
            queues: DashMap::new(),
            depths: Arc::new(Default::default()),
            seq: AtomicU64::new(0),
            limiter,
            work: Notify::new(),
        }
    }

    /// Hold one slot at `priority`, failing with `QueueFull` at capacity
    pub fn try_reserve(&self, priority: Priority) -> Result<Reservation> {
        let level = priority.level();
        let capacity = self.config.capacity_per_level;
        self.depths[level]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                if d < capacity {
                    Some(d + 1)
                } else {
                    None
                }
            })
            .map_err(|_| HubError::QueueFull { priority, capacity })?;

        Ok(Reservation {
            depths: self.depths.clone(),
            level,
            armed: true,
        })
    }

    /// Admit a message using a slot obtained from [`try_reserve`](Self::try_reserve)
    pub fn enqueue(&self, mut reservation: Reservation, entry: QueuedMessage) {
        reservation.armed = false;
        self.push(entry, reservation.level);
    }

    /// Re-admit a message that was already accepted. Never rejected: the
    /// capacity check applies to new admissions only.
    pub fn requeue(&self, entry: QueuedMessage) {
        let level = entry.priority.level();
        self.depths[level].fetch_add(1, Ordering::AcqRel);
        self.push(entry, level);
    }

    fn push(&self, mut entry: QueuedMessage, level: usize) {
        entry.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        debug!(
            message_id = %entry.message_id,
            destination = %entry.destination,
            priority = %entry.priority,
            "Enqueued message"
        );
        self.queues
            .entry(entry.destination.clone())
            .or_default()
            .lock()
            .levels[level]
            .push_back(entry);
        router_metrics::set_queue_depth(Priority::from_level(level), self.depths[level].load(Ordering::Acquire));
        self.work.notify_one();
    }

    fn effective_level(&self, entry: &QueuedMessage, now: Instant) -> usize {
        if let Some(deadline) = entry.deadline {
            if deadline.saturating_duration_since(now) <= self.config.deadline_boost_window() {
                return 0;
            }
        }
        let aging = self.config.aging_interval().as_millis().max(1);
        let steps = now.saturating_duration_since(entry.enqueued_at).as_millis() / aging;
        entry.priority.level().saturating_sub(steps as usize)
    }

    /// Pop the most urgent message across all destinations whose quota
    /// allows a dequeue right now.
    pub fn try_dequeue(&self, now: Instant) -> Option<QueuedMessage> {
        loop {
            // (effective level, seq, destination, base level)
            let mut candidates: Vec<(usize, u64, String, usize)> = Vec::new();
            for item in self.queues.iter() {
                let queues = item.value().lock();
                for (level, queue) in queues.levels.iter().enumerate() {
                    if let Some(head) = queue.front() {
                        candidates.push((self.effective_level(head, now), head.seq, item.key().clone(), level));
                    }
                }
            }
            if candidates.is_empty() {
                return None;
            }
            candidates.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

            let mut raced = false;
            let mut throttled: Vec<String> = Vec::new();
            for (_, seq, destination, level) in candidates {
                if throttled.contains(&destination) {
                    continue;
                }

                // The head is confirmed before a quota token is spent on it
                let popped = self.queues.get(&destination).map(|q| {
                    let mut queues = q.lock();
                    match queues.levels[level].front() {
                        Some(head) if head.seq == seq => {
                            if self.quota_allows(&destination) {
                                Dequeue::Popped(queues.levels[level].pop_front())
                            } else {
                                Dequeue::Throttled
                            }
                        }
                        _ => Dequeue::Popped(None),
                    }
                });

                match popped {
                    Some(Dequeue::Popped(Some(entry))) => {
                        let depth = self.depths[level].fetch_sub(1, Ordering::AcqRel) - 1;
                        router_metrics::set_queue_depth(Priority::from_level(level), depth);
                        self.prune(&destination);
                        return Some(entry);
                    }
                    Some(Dequeue::Throttled) => throttled.push(destination),
                    Some(Dequeue::Popped(None)) | None => {
                        raced = true;
                        break;
                    }
                }
            }

            if !raced {
                return None;
            }
        }
    }

    fn quota_allows(&self, destination: &str) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check_key(&destination.to_string()).is_ok(),
            None => true,
        }
    }

    /// Forget quota state for destinations idle long enough to be back at
    /// full burst
    pub fn prune_quotas(&self) -> usize {
        let Some(limiter) = &self.limiter else { return 0 };
        let before = limiter.len();
        limiter.retain_recent();
        limiter.shrink_to_fit();
        before.saturating_sub(limiter.len())
    }

    fn prune(&self, destination: &str) {
        self.queues.remove_if(destination, |_, q| q.lock().is_empty());
    }

    /// Wait until something is enqueued or `idle` elapses
    pub async fn wait_for_work(&self, idle: Duration) {
        let _ = tokio::time::timeout(idle, self.work.notified()).await;
    }

    /// Queued messages per level, most urgent first
    pub fn depth(&self) -> [usize; Priority::LEVELS] {
        let mut out = [0; Priority::LEVELS];
        for (i, d) in self.depths.iter().enumerate() {
            out[i] = d.load(Ordering::Acquire);
        }
        out
    }

    pub fn depth_for(&self, destination: &str) -> usize {
        self.queues.get(destination).map(|q| q.lock().len()).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.depth().iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig {
            capacity_per_level: 10,
            aging_interval_ms: 1_000,
            deadline_boost_window_ms: 500,
            quota_max_dequeues: None,
            quota_window_ms: 1_000,
        }
    }

    fn admit(q: &PriorityQueueManager, id: &str, dest: &str, p: Priority) {
        let r = q.try_reserve(p).unwrap();
        q.enqueue(r, QueuedMessage::new(id, dest, p, None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_high_beats_fresh_low() {
        let q = PriorityQueueManager::new(config());
        admit(&q, "low", "svc", Priority::Low);
        admit(&q, "high", "svc", Priority::High);

        assert_eq!(q.try_dequeue(Instant::now()).unwrap().message_id, "high");
        assert_eq!(q.try_dequeue(Instant::now()).unwrap().message_id, "low");
        assert!(q.try_dequeue(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_low_outranks_fresh_normal() {
        let q = PriorityQueueManager::new(config());
        admit(&q, "old-low", "svc-a", Priority::Low);
        tokio::time::advance(Duration::from_millis(2_500)).await;
        admit(&q, "fresh-normal", "svc-b", Priority::Normal);
        admit(&q, "fresh-low", "svc-b", Priority::Low);

        // old-low has aged two levels: low -> high
        assert_eq!(q.try_dequeue(Instant::now()).unwrap().message_id, "old-low");
        assert_eq!(q.try_dequeue(Instant::now()).unwrap().message_id, "fresh-normal");
        assert_eq!(q.try_dequeue(Instant::now()).unwrap().message_id, "fresh-low");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_boost() {
        let q = PriorityQueueManager::new(config());
        admit(&q, "high", "svc", Priority::High);
        let r = q.try_reserve(Priority::Low).unwrap();
        q.enqueue(
            r,
            QueuedMessage::new("urgent", "svc", Priority::Low, Some(Instant::now() + Duration::from_millis(300))),
        );

        assert_eq!(q.try_dequeue(Instant::now()).unwrap().message_id, "urgent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_level_fifo() {
        let q = PriorityQueueManager::new(config());
        for i in 0..5 {
            admit(&q, &format!("m{}", i), "svc", Priority::Normal);
        }
        for i in 0..5 {
            assert_eq!(q.try_dequeue(Instant::now()).unwrap().message_id, format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn test_full_level_rejects_and_reservation_releases() {
        let mut cfg = config();
        cfg.capacity_per_level = 2;
        let q = PriorityQueueManager::new(cfg);

        admit(&q, "a", "svc", Priority::Normal);
        let held = q.try_reserve(Priority::Normal).unwrap();
        assert!(matches!(
            q.try_reserve(Priority::Normal),
            Err(HubError::QueueFull { priority: Priority::Normal, capacity: 2 })
        ));
        // Other levels are independent
        assert!(q.try_reserve(Priority::Low).is_ok());

        drop(held);
        assert!(q.try_reserve(Priority::Normal).is_ok());
        assert_eq!(q.depth()[Priority::Normal.level()], 1);
    }

    #[tokio::test]
    async fn test_requeue_bypasses_capacity() {
        let mut cfg = config();
        cfg.capacity_per_level = 1;
        let q = PriorityQueueManager::new(cfg);
        admit(&q, "a", "svc", Priority::Normal);
        q.requeue(QueuedMessage::new("b", "svc", Priority::Normal, None));
        assert_eq!(q.total(), 2);
        assert_eq!(q.depth_for("svc"), 2);
    }

    #[tokio::test]
    async fn test_quota_leaves_messages_queued() {
        let mut cfg = config();
        cfg.quota_max_dequeues = Some(2);
        cfg.quota_window_ms = 60_000;
        let q = PriorityQueueManager::new(cfg);
        for i in 0..3 {
            admit(&q, &format!("a{}", i), "limited", Priority::Normal);
        }
        admit(&q, "b0", "other", Priority::Low);

        let now = Instant::now();
        assert_eq!(q.try_dequeue(now).unwrap().message_id, "a0");
        assert_eq!(q.try_dequeue(now).unwrap().message_id, "a1");
        // limited is out of quota; the other destination still drains
        assert_eq!(q.try_dequeue(now).unwrap().message_id, "b0");
        assert!(q.try_dequeue(now).is_none());
        assert_eq!(q.depth_for("limited"), 1);
    }

    #[tokio::test]
    async fn test_quota_only_spent_on_dequeued_messages() {
        let mut cfg = config();
        cfg.quota_max_dequeues = Some(1);
        cfg.quota_window_ms = 600_000;
        let q = PriorityQueueManager::new(cfg);

        // Nothing queued for the destination, nothing spent
        assert!(q.try_dequeue(Instant::now()).is_none());
        admit(&q, "a0", "limited", Priority::Normal);
        admit(&q, "a1", "limited", Priority::Normal);
        assert_eq!(q.try_dequeue(Instant::now()).unwrap().message_id, "a0");
        assert!(q.try_dequeue(Instant::now()).is_none());
        assert_eq!(q.depth_for("limited"), 1);
    }

    #[tokio::test]
    async fn test_prune_quotas_keeps_throttled_destinations() {
        let mut cfg = config();
        cfg.quota_max_dequeues = Some(1);
        cfg.quota_window_ms = 600_000;
        let q = PriorityQueueManager::new(cfg);
        admit(&q, "a0", "limited", Priority::Normal);
        admit(&q, "a1", "limited", Priority::Normal);
        assert!(q.try_dequeue(Instant::now()).is_some());

        // Still inside its window, so the spent token must survive a prune
        q.prune_quotas();
        assert!(q.try_dequeue(Instant::now()).is_none());
        assert_eq!(q.prune_quotas(), 0);
    }
}
