//! Per-destination circuit breakers
//!
//! - Closed: failures inside the rolling window are counted; reaching the
//!   threshold opens the circuit
//! - Open: every dispatch is rejected until the reset timeout elapses
//! - HalfOpen: exactly one probe is admitted; success closes the circuit,
//!   failure reopens it with a longer (capped) reset timeout
//!
//! Operators can pin a circuit open or closed through `force_open` and
//! `force_close`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use hub_config::CircuitBreakerConfig;

use crate::error::HubError;
use crate::router_metrics;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "CLOSED",
            CircuitBreakerState::Open => "OPEN",
            CircuitBreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Admission handed out by [`CircuitBreakerRegistry::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPermit {
    Normal,
    /// The single half-open trial; its outcome decides the next state
    Probe,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitTotals {
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub destination: String,
    pub state: CircuitBreakerState,
    /// Failures inside the rolling window
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub reset_timeout_ms: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub forced: bool,
    pub totals: CircuitTotals,
}

struct Circuit {
    state: CircuitBreakerState,
    failures: VecDeque<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    reset_timeout: Duration,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probe_started: Option<Instant>,
    forced: bool,
    totals: CircuitTotals,
}

impl Circuit {
    fn new(reset_timeout: Duration) -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failures: VecDeque::new(),
            last_failure_at: None,
            reset_timeout,
            opened_at: None,
            opened_at_wall: None,
            probe_started: None,
            forced: false,
            totals: CircuitTotals::default(),
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining_open(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|at| self.reset_timeout.saturating_sub(now.duration_since(at)))
            .unwrap_or(self.reset_timeout)
    }

    fn stats(&self, destination: &str) -> CircuitBreakerStats {
        CircuitBreakerStats {
            destination: destination.to_string(),
            state: self.state,
            failure_count: self.failures.len() as u32,
            last_failure_at: self.last_failure_at,
            reset_timeout_ms: self.reset_timeout.as_millis() as u64,
            opened_at: self.opened_at_wall,
            forced: self.forced,
            totals: self.totals.clone(),
        }
    }
}

pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Arc<Mutex<Circuit>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    fn circuit(&self, destination: &str) -> Arc<Mutex<Circuit>> {
        if let Some(c) = self.circuits.get(destination) {
            return c.clone();
        }
        self.circuits
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Circuit::new(self.config.reset_timeout()))))
            .clone()
    }

    /// Ask to dispatch to `destination`. Rejections carry the time left
    /// before the circuit will consider another attempt.
    pub fn try_acquire(&self, destination: &str) -> Result<CircuitPermit> {
        let circuit = self.circuit(destination);
        let mut c = circuit.lock();
        let now = Instant::now();

        let rejected = |c: &mut Circuit, retry_after: Duration| {
            c.totals.rejections += 1;
            Err(HubError::CircuitOpen {
                destination: destination.to_string(),
                retry_after,
            })
        };

        if c.forced {
            let wait = c.reset_timeout;
            return rejected(&mut *c, wait);
        }

        match c.state {
            CircuitBreakerState::Closed => Ok(CircuitPermit::Normal),
            CircuitBreakerState::Open => {
                let remaining = c.remaining_open(now);
                if !remaining.is_zero() {
                    return rejected(&mut *c, remaining);
                }
                self.transition(destination, &mut c, CircuitBreakerState::HalfOpen);
                c.probe_started = Some(now);
                Ok(CircuitPermit::Probe)
            }
            CircuitBreakerState::HalfOpen => {
                // A probe that never reported back frees its slot eventually
                let stale = c
                    .probe_started
                    .map(|at| now.duration_since(at) >= c.reset_timeout)
                    .unwrap_or(true);
                if stale {
                    c.probe_started = Some(now);
                    return Ok(CircuitPermit::Probe);
                }
                rejected(&mut *c, self.config.probe_wait())
            }
        }
    }

    pub fn record_success(&self, destination: &str, permit: CircuitPermit) {
        let circuit = self.circuit(destination);
        let mut c = circuit.lock();
        c.totals.successes += 1;

        if permit == CircuitPermit::Probe && c.state == CircuitBreakerState::HalfOpen {
            c.failures.clear();
            c.reset_timeout = self.config.reset_timeout();
            c.opened_at = None;
            c.opened_at_wall = None;
            c.probe_started = None;
            self.transition(destination, &mut c, CircuitBreakerState::Closed);
            info!(destination = %destination, "Probe succeeded, circuit closed");
        }
    }

    pub fn record_failure(&self, destination: &str, permit: CircuitPermit) {
        let circuit = self.circuit(destination);
        let mut c = circuit.lock();
        let now = Instant::now();
        c.totals.failures += 1;
        c.last_failure_at = Some(Utc::now());

        match (c.state, permit) {
            (CircuitBreakerState::HalfOpen, CircuitPermit::Probe) => {
                let grown = c.reset_timeout.mul_f64(self.config.backoff_multiplier);
                c.reset_timeout = grown.min(self.config.max_reset_timeout());
                self.open(destination, &mut c, now);
                warn!(
                    destination = %destination,
                    reset_timeout_ms = c.reset_timeout.as_millis() as u64,
                    "Probe failed, circuit reopened"
                );
            }
            (CircuitBreakerState::Closed, CircuitPermit::Normal) => {
                c.failures.push_back(now);
                c.prune(now, self.config.window());
                if c.failures.len() as u32 >= self.config.failure_threshold {
                    self.open(destination, &mut c, now);
                    warn!(
                        destination = %destination,
                        failures = c.failures.len(),
                        reset_timeout_ms = c.reset_timeout.as_millis() as u64,
                        "Failure threshold reached, circuit opened"
                    );
                }
            }
            // Late results from dispatches admitted before the circuit opened
            _ => {}
        }
    }

    /// Give back a permit whose dispatch never happened
    pub fn release(&self, destination: &str, permit: CircuitPermit) {
        if permit != CircuitPermit::Probe {
            return;
        }
        let circuit = self.circuit(destination);
        let mut c = circuit.lock();
        if c.state == CircuitBreakerState::HalfOpen {
            c.probe_started = None;
        }
    }

    pub fn force_open(&self, destination: &str) -> CircuitBreakerStats {
        let circuit = self.circuit(destination);
        let mut c = circuit.lock();
        c.forced = true;
        if c.state != CircuitBreakerState::Open {
            self.open(destination, &mut c, Instant::now());
        }
        info!(destination = %destination, "Circuit forced open");
        c.stats(destination)
    }

    pub fn force_close(&self, destination: &str) -> CircuitBreakerStats {
        let circuit = self.circuit(destination);
        let mut c = circuit.lock();
        c.forced = false;
        c.failures.clear();
        c.reset_timeout = self.config.reset_timeout();
        c.opened_at = None;
        c.opened_at_wall = None;
        c.probe_started = None;
        if c.state != CircuitBreakerState::Closed {
            self.transition(destination, &mut c, CircuitBreakerState::Closed);
        }
        info!(destination = %destination, "Circuit forced closed");
        c.stats(destination)
    }

    pub fn get(&self, destination: &str) -> Option<CircuitBreakerStats> {
        self.circuits.get(destination).map(|c| c.lock().stats(destination))
    }

    pub fn list(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> = self
            .circuits
            .iter()
            .map(|e| e.value().lock().stats(e.key()))
            .collect();
        stats.sort_by(|a, b| a.destination.cmp(&b.destination));
        stats
    }

    /// Circuits currently not admitting regular traffic
    pub fn open_count(&self) -> usize {
        self.circuits
            .iter()
            .filter(|e| e.value().lock().state != CircuitBreakerState::Closed)
            .count()
    }

    fn open(&self, destination: &str, c: &mut Circuit, now: Instant) {
        c.opened_at = Some(now);
        c.opened_at_wall = Some(Utc::now());
        c.probe_started = None;
        c.failures.clear();
        self.transition(destination, c, CircuitBreakerState::Open);
    }

    fn transition(&self, destination: &str, c: &mut Circuit, to: CircuitBreakerState) {
        let from = c.state;
        if from == to {
            return;
        }
        c.state = to;
        router_metrics::record_circuit_transition(destination, from, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            window_ms: 60_000,
            reset_timeout_ms: 1_000,
            max_reset_timeout_ms: 3_000,
            backoff_multiplier: 2.0,
            probe_wait_ms: 100,
        }
    }

    fn trip(registry: &CircuitBreakerRegistry, dest: &str) {
        for _ in 0..5 {
            let permit = registry.try_acquire(dest).unwrap();
            registry.record_failure(dest, permit);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_rejects() {
        let registry = CircuitBreakerRegistry::new(config());
        for _ in 0..4 {
            let permit = registry.try_acquire("image").unwrap();
            registry.record_failure("image", permit);
        }
        assert_eq!(registry.get("image").unwrap().state, CircuitBreakerState::Closed);

        let permit = registry.try_acquire("image").unwrap();
        registry.record_failure("image", permit);
        assert_eq!(registry.get("image").unwrap().state, CircuitBreakerState::Open);

        match registry.try_acquire("image") {
            Err(HubError::CircuitOpen { retry_after, .. }) => {
                assert!(retry_after <= Duration::from_millis(1_000));
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected CircuitOpen, got {:?}", other.map(|_| ())),
        }
        assert_eq!(registry.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let mut cfg = config();
        cfg.window_ms = 500;
        let registry = CircuitBreakerRegistry::new(cfg);

        for _ in 0..4 {
            let permit = registry.try_acquire("image").unwrap();
            registry.record_failure("image", permit);
        }
        tokio::time::advance(Duration::from_millis(600)).await;
        let permit = registry.try_acquire("image").unwrap();
        registry.record_failure("image", permit);

        let stats = registry.get("image").unwrap();
        assert_eq!(stats.state, CircuitBreakerState::Closed);
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let registry = CircuitBreakerRegistry::new(config());
        trip(&registry, "image");

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let probe = registry.try_acquire("image").unwrap();
        assert_eq!(probe, CircuitPermit::Probe);
        assert_eq!(registry.get("image").unwrap().state, CircuitBreakerState::HalfOpen);

        // Second caller waits while the probe is in flight
        assert!(matches!(
            registry.try_acquire("image"),
            Err(HubError::CircuitOpen { .. })
        ));

        registry.record_success("image", probe);
        assert_eq!(registry.get("image").unwrap().state, CircuitBreakerState::Closed);
        assert_eq!(registry.try_acquire("image").unwrap(), CircuitPermit::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_backs_off_with_cap() {
        let registry = CircuitBreakerRegistry::new(config());
        trip(&registry, "image");

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let probe = registry.try_acquire("image").unwrap();
        registry.record_failure("image", probe);
        let stats = registry.get("image").unwrap();
        assert_eq!(stats.state, CircuitBreakerState::Open);
        assert_eq!(stats.reset_timeout_ms, 2_000);

        tokio::time::advance(Duration::from_millis(2_001)).await;
        let probe = registry.try_acquire("image").unwrap();
        registry.record_failure("image", probe);
        assert_eq!(registry.get("image").unwrap().reset_timeout_ms, 3_000);

        tokio::time::advance(Duration::from_millis(3_001)).await;
        let probe = registry.try_acquire("image").unwrap();
        registry.record_failure("image", probe);
        assert_eq!(registry.get("image").unwrap().reset_timeout_ms, 3_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_frees_slot() {
        let registry = CircuitBreakerRegistry::new(config());
        trip(&registry, "image");
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let probe = registry.try_acquire("image").unwrap();
        registry.release("image", probe);
        assert_eq!(registry.try_acquire("image").unwrap(), CircuitPermit::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_override() {
        let registry = CircuitBreakerRegistry::new(config());
        registry.force_open("campaign");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(registry.try_acquire("campaign").is_err());
        assert!(registry.get("campaign").unwrap().forced);

        let stats = registry.force_close("campaign");
        assert_eq!(stats.state, CircuitBreakerState::Closed);
        assert!(!stats.forced);
        assert_eq!(registry.try_acquire("campaign").unwrap(), CircuitPermit::Normal);
    }

    #[tokio::test]
    async fn test_circuits_are_independent() {
        let registry = CircuitBreakerRegistry::new(config());
        trip(&registry, "image");
        assert!(registry.try_acquire("image").is_err());
        assert!(registry.try_acquire("character").is_ok());
        assert_eq!(registry.list().len(), 2);
    }
}
