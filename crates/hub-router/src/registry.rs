//! ServiceRegistry - instances, heartbeat health, dependencies and selection
//!
//! Health follows heartbeats with hysteresis:
//! - healthy → degraded on the first missed heartbeat
//! - degraded → unhealthy after `unhealthy_threshold` consecutive misses
//! - degraded → healthy on the next heartbeat
//! - unhealthy → healthy only after `healthy_threshold` consecutive heartbeats
//!
//! Missed heartbeats are detected by an owned [`TimerQueue`]; deregistering
//! an instance cancels its timer. Instances silent past `purge_after` are
//! removed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hub_common::{InstanceHealth, ServiceHealth};
use hub_config::{RegistryConfig, SelectionStrategy};

use crate::error::HubError;
use crate::timer::TimerQueue;
use crate::Result;

/// Smoothing factor of the per-instance delivery failure rate
const FAILURE_RATE_ALPHA: f64 = 0.2;

type InstanceKey = (String, String);

/// A declared "requires" edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub service: String,
    /// Hard dependencies gate readiness; soft ones are informational
    #[serde(default = "default_hard")]
    pub hard: bool,
}

fn default_hard() -> bool {
    true
}

impl Dependency {
    pub fn hard(service: impl Into<String>) -> Self {
        Self { service: service.into(), hard: true }
    }

    pub fn soft(service: impl Into<String>) -> Self {
        Self { service: service.into(), hard: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRegistration {
    pub service: String,
    pub instance_id: String,
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl InstanceRegistration {
    pub fn new(service: impl Into<String>, instance_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instance_id: instance_id.into(),
            endpoints: vec![endpoint.into()],
            dependencies: Vec::new(),
            weight: default_weight(),
        }
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Read-only view of one instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub service: String,
    pub instance_id: String,
    pub endpoints: Vec<String>,
    pub weight: u32,
    pub health: InstanceHealth,
    pub last_heartbeat: DateTime<Utc>,
    pub missed_heartbeats: u32,
    pub failure_rate: f64,
    pub active_connections: u32,
}

struct InstanceState {
    registration: InstanceRegistration,
    health: InstanceHealth,
    last_heartbeat: DateTime<Utc>,
    last_seen: Instant,
    missed: u32,
    healthy_streak: u32,
    failure_rate: f64,
    active: Arc<AtomicU32>,
}

impl InstanceState {
    fn view(&self) -> InstanceView {
        InstanceView {
            service: self.registration.service.clone(),
            instance_id: self.registration.instance_id.clone(),
            endpoints: self.registration.endpoints.clone(),
            weight: self.registration.weight,
            health: self.health,
            last_heartbeat: self.last_heartbeat,
            missed_heartbeats: self.missed,
            failure_rate: self.failure_rate,
            active_connections: self.active.load(Ordering::Acquire),
        }
    }
}

/// Decrements the instance's active connection count when dropped
pub struct ConnectionGuard {
    active: Arc<AtomicU32>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Instance chosen for one delivery
pub struct InstanceTarget {
    pub service: String,
    pub instance_id: String,
    pub endpoint: String,
    _guard: ConnectionGuard,
}

pub struct ServiceRegistry {
    config: RegistryConfig,
    /// One lock per service; instances keyed by id inside
    services: DashMap<String, HashMap<String, InstanceState>>,
    /// "requires" edges declared per service
    graph: RwLock<HashMap<String, Vec<Dependency>>>,
    timers: TimerQueue<InstanceKey>,
    round_robin: DashMap<String, AtomicUsize>,
    rng: Mutex<StdRng>,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let (timers, mut due) = TimerQueue::new();
        let registry = Arc::new(Self {
            config,
            services: DashMap::new(),
            graph: RwLock::new(HashMap::new()),
            timers,
            round_robin: DashMap::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        });

        // Holds a weak reference so the registry (and its timers) can drop
        let weak: Weak<Self> = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while let Some(key) = due.recv().await {
                match weak.upgrade() {
                    Some(registry) => registry.on_missed_heartbeat(key),
                    None => break,
                }
            }
        });

        registry
    }

    /// Register or refresh an instance. Re-registering keeps health state
    /// and counts as a heartbeat.
    pub fn register(&self, registration: InstanceRegistration) -> Result<InstanceView> {
        if registration.service.trim().is_empty() || registration.instance_id.trim().is_empty() {
            return Err(HubError::validation("service and instance_id are required"));
        }
        if registration.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(HubError::validation("at least one endpoint is required"));
        }

        self.set_dependencies(&registration.service, &registration.dependencies)?;

        let key = (registration.service.clone(), registration.instance_id.clone());
        let existing = self
            .services
            .get(&registration.service)
            .map(|s| s.contains_key(&registration.instance_id))
            .unwrap_or(false);

        if existing {
            if let Some(mut service) = self.services.get_mut(&registration.service) {
                if let Some(state) = service.get_mut(&registration.instance_id) {
                    state.registration = registration.clone();
                }
            }
            return self.heartbeat(&key.0, &key.1);
        }

        let state = InstanceState {
            registration: registration.clone(),
            health: InstanceHealth::Healthy,
            last_heartbeat: Utc::now(),
            last_seen: Instant::now(),
            missed: 0,
            healthy_streak: 0,
            failure_rate: 0.0,
            active: Arc::new(AtomicU32::new(0)),
        };
        let view = state.view();
        self.services
            .entry(registration.service.clone())
            .or_default()
            .insert(registration.instance_id.clone(), state);
        self.timers.schedule(key, Instant::now() + self.config.heartbeat_interval());

        info!(
            service = %registration.service,
            instance_id = %registration.instance_id,
            endpoints = ?registration.endpoints,
            "Instance registered"
        );
        Ok(view)
    }

    pub fn deregister(&self, service: &str, instance_id: &str) -> Result<()> {
        let removed = self
            .services
            .get_mut(service)
            .and_then(|mut s| s.remove(instance_id))
            .is_some();
        if !removed {
            return Err(HubError::not_found("instance", format!("{}/{}", service, instance_id)));
        }
        self.timers.cancel((service.to_string(), instance_id.to_string()));
        self.drop_empty_service(service);
        info!(service = %service, instance_id = %instance_id, "Instance deregistered");
        Ok(())
    }

    pub fn heartbeat(&self, service: &str, instance_id: &str) -> Result<InstanceView> {
        let view = {
            let mut entry = self
                .services
                .get_mut(service)
                .ok_or_else(|| HubError::not_found("instance", format!("{}/{}", service, instance_id)))?;
            let state = entry
                .get_mut(instance_id)
                .ok_or_else(|| HubError::not_found("instance", format!("{}/{}", service, instance_id)))?;

            state.missed = 0;
            state.last_heartbeat = Utc::now();
            state.last_seen = Instant::now();
            match state.health {
                InstanceHealth::Healthy => {}
                InstanceHealth::Degraded => {
                    state.health = InstanceHealth::Healthy;
                    debug!(service = %service, instance_id = %instance_id, "Instance recovered from degraded");
                }
                InstanceHealth::Unhealthy => {
                    state.healthy_streak += 1;
                    if state.healthy_streak >= self.config.healthy_threshold {
                        state.health = InstanceHealth::Healthy;
                        state.healthy_streak = 0;
                        info!(service = %service, instance_id = %instance_id, "Instance reinstated");
                    }
                }
            }
            state.view()
        };

        self.timers.schedule(
            (service.to_string(), instance_id.to_string()),
            Instant::now() + self.config.heartbeat_interval(),
        );
        Ok(view)
    }

    fn on_missed_heartbeat(&self, key: InstanceKey) {
        let (service, instance_id) = &key;
        let purge = {
            let mut entry = match self.services.get_mut(service) {
                Some(e) => e,
                None => return,
            };
            let state = match entry.get_mut(instance_id) {
                Some(s) => s,
                None => return,
            };

            state.missed += 1;
            state.healthy_streak = 0;
            let previous = state.health;
            state.health = if state.missed >= self.config.unhealthy_threshold {
                InstanceHealth::Unhealthy
            } else if previous == InstanceHealth::Unhealthy {
                InstanceHealth::Unhealthy
            } else {
                InstanceHealth::Degraded
            };
            if previous != state.health {
                warn!(
                    service = %service,
                    instance_id = %instance_id,
                    missed = state.missed,
                    health = ?state.health,
                    "Instance health changed after missed heartbeat"
                );
            }
            state.last_seen.elapsed() >= self.config.purge_after()
        };

        if purge {
            if let Some(mut entry) = self.services.get_mut(service) {
                entry.remove(instance_id);
            }
            self.drop_empty_service(service);
            info!(service = %service, instance_id = %instance_id, "Purged silent instance");
            return;
        }

        self.timers.schedule(key, Instant::now() + self.config.heartbeat_interval());
    }

    /// Remove every instance silent past the purge TTL. Returns the count.
    pub fn purge_expired(&self) -> usize {
        let purge_after = self.config.purge_after();
        let mut purged = Vec::new();
        for mut entry in self.services.iter_mut() {
            let service = entry.key().clone();
            entry.retain(|id, state| {
                let keep = state.last_seen.elapsed() < purge_after;
                if !keep {
                    purged.push((service.clone(), id.clone()));
                }
                keep
            });
        }
        for key in &purged {
            self.timers.cancel(key.clone());
            self.drop_empty_service(&key.0);
        }
        purged.len()
    }

    fn drop_empty_service(&self, service: &str) {
        if self.services.remove_if(service, |_, s| s.is_empty()).is_some() {
            self.graph.write().remove(service);
            self.round_robin.remove(service);
        }
    }

    /// Feed a delivery outcome into the instance's failure rate
    pub fn record_outcome(&self, service: &str, instance_id: &str, success: bool) {
        if let Some(mut entry) = self.services.get_mut(service) {
            if let Some(state) = entry.get_mut(instance_id) {
                let sample = if success { 0.0 } else { 1.0 };
                state.failure_rate = state.failure_rate * (1.0 - FAILURE_RATE_ALPHA) + sample * FAILURE_RATE_ALPHA;
            }
        }
    }

    // ========================================================================
    // Dependencies
    // ========================================================================

    fn set_dependencies(&self, service: &str, dependencies: &[Dependency]) -> Result<()> {
        let mut graph = self.graph.write();
        for dep in dependencies {
            if dep.service == service {
                return Err(HubError::validation(format!("service {} cannot depend on itself", service)));
            }
            if let Some(path) = find_path(&graph, &dep.service, service) {
                return Err(HubError::validation(format!(
                    "dependency cycle: {} -> {}",
                    service,
                    path.join(" -> ")
                )));
            }
        }
        if dependencies.is_empty() {
            return Ok(());
        }
        // Instances of one service declare into a shared list; a repeated
        // dependency takes the latest hard flag
        let merged = graph.entry(service.to_string()).or_default();
        for dep in dependencies {
            match merged.iter_mut().find(|d| d.service == dep.service) {
                Some(existing) => existing.hard = dep.hard,
                None => merged.push(dep.clone()),
            }
        }
        Ok(())
    }

    /// Readiness of `service`: not ready when a hard dependency has no
    /// selectable instance.
    pub fn readiness(&self, service: &str) -> ServiceHealth {
        let (healthy, degraded, unhealthy) = self.counts(service);
        let deps = self.graph.read().get(service).cloned().unwrap_or_default();
        let unmet: Vec<String> = deps
            .iter()
            .filter(|d| d.hard && self.available(&d.service) == 0)
            .map(|d| d.service.clone())
            .collect();

        ServiceHealth {
            service: service.to_string(),
            healthy,
            degraded,
            unhealthy,
            ready: unmet.is_empty() && healthy + degraded > 0,
            unmet_dependencies: unmet,
        }
    }

    pub fn health(&self, service: &str) -> Result<ServiceHealth> {
        if !self.services.contains_key(service) {
            return Err(HubError::not_found("service", service));
        }
        Ok(self.readiness(service))
    }

    pub fn all_health(&self) -> Vec<ServiceHealth> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names.iter().map(|s| self.readiness(s)).collect()
    }

    fn counts(&self, service: &str) -> (u32, u32, u32) {
        let mut counts = (0, 0, 0);
        if let Some(entry) = self.services.get(service) {
            for state in entry.values() {
                match state.health {
                    InstanceHealth::Healthy => counts.0 += 1,
                    InstanceHealth::Degraded => counts.1 += 1,
                    InstanceHealth::Unhealthy => counts.2 += 1,
                }
            }
        }
        counts
    }

    fn available(&self, service: &str) -> u32 {
        let (healthy, degraded, _) = self.counts(service);
        healthy + degraded
    }

    pub fn list(&self) -> Vec<InstanceView> {
        let mut views: Vec<InstanceView> = self
            .services
            .iter()
            .flat_map(|e| e.values().map(|s| s.view()).collect::<Vec<_>>())
            .collect();
        views.sort_by(|a, b| (&a.service, &a.instance_id).cmp(&(&b.service, &b.instance_id)));
        views
    }

    pub fn get(&self, service: &str, instance_id: &str) -> Option<InstanceView> {
        self.services.get(service).and_then(|e| e.get(instance_id).map(|s| s.view()))
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Choose an instance of `service`. Unhealthy instances are never chosen.
    pub fn select_instance(&self, service: &str, strategy: SelectionStrategy) -> Result<InstanceTarget> {
        let entry = self
            .services
            .get(service)
            .ok_or_else(|| HubError::UnavailableDestination { service: service.to_string() })?;

        let mut candidates: Vec<&InstanceState> = entry
            .values()
            .filter(|s| s.health != InstanceHealth::Unhealthy)
            .collect();
        if candidates.is_empty() {
            return Err(HubError::UnavailableDestination { service: service.to_string() });
        }
        candidates.sort_by(|a, b| a.registration.instance_id.cmp(&b.registration.instance_id));

        let chosen = match strategy {
            SelectionStrategy::RoundRobin => {
                let counter = self
                    .round_robin
                    .entry(service.to_string())
                    .or_insert_with(|| AtomicUsize::new(0))
                    .fetch_add(1, Ordering::Relaxed);
                candidates[counter % candidates.len()]
            }
            SelectionStrategy::LeastConnections => candidates
                .iter()
                .copied()
                .min_by_key(|s| s.active.load(Ordering::Acquire))
                .unwrap_or(candidates[0]),
            SelectionStrategy::Random => {
                let i = self.rng.lock().gen_range(0..candidates.len());
                candidates[i]
            }
            SelectionStrategy::Weighted => {
                let weights: Vec<f64> = candidates.iter().map(|s| s.registration.weight as f64).collect();
                candidates[self.pick_weighted(&weights)]
            }
            SelectionStrategy::HealthAware => {
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|s| {
                        let w = s.registration.weight as f64 * (1.0 - s.failure_rate);
                        if s.health == InstanceHealth::Degraded {
                            w / 2.0
                        } else {
                            w
                        }
                    })
                    .collect();
                candidates[self.pick_weighted(&weights)]
            }
        };

        let endpoint = chosen
            .registration
            .endpoints
            .iter()
            .find(|e| !e.trim().is_empty())
            .cloned()
            .unwrap_or_default();
        chosen.active.fetch_add(1, Ordering::AcqRel);

        Ok(InstanceTarget {
            service: service.to_string(),
            instance_id: chosen.registration.instance_id.clone(),
            endpoint,
            _guard: ConnectionGuard { active: chosen.active.clone() },
        })
    }

    /// Index drawn proportionally to `weights`; uniform when all are zero
    fn pick_weighted(&self, weights: &[f64]) -> usize {
        let total: f64 = weights.iter().sum();
        let mut rng = self.rng.lock();
        if total <= f64::EPSILON {
            return rng.gen_range(0..weights.len());
        }
        let mut point = rng.gen_range(0.0..total);
        for (i, w) in weights.iter().enumerate() {
            if point < *w {
                return i;
            }
            point -= w;
        }
        weights.len() - 1
    }
}

/// Path of services from `from` to `to` along "requires" edges, if any
fn find_path(graph: &HashMap<String, Vec<Dependency>>, from: &str, to: &str) -> Option<Vec<String>> {
    let mut stack = vec![vec![from.to_string()]];
    let mut seen = HashSet::new();
    while let Some(path) = stack.pop() {
        let node = path.last().cloned().unwrap_or_default();
        if node == to {
            return Some(path);
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        for dep in graph.get(&node).into_iter().flatten() {
            let mut next = path.clone();
            next.push(dep.service.clone());
            stack.push(next);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval_ms: 100,
            unhealthy_threshold: 3,
            healthy_threshold: 3,
            purge_after_ms: 10_000,
            default_strategy: SelectionStrategy::HealthAware,
        }
    }

    fn health(registry: &ServiceRegistry, service: &str, id: &str) -> InstanceHealth {
        registry.get(service, id).unwrap().health
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_degrade_then_exclude() {
        let registry = ServiceRegistry::new(config());
        registry.register(InstanceRegistration::new("image", "i-1", "http://i1")).unwrap();

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(health(&registry, "image", "i-1"), InstanceHealth::Degraded);
        // Degraded instances remain selectable
        assert!(registry.select_instance("image", SelectionStrategy::HealthAware).is_ok());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(health(&registry, "image", "i-1"), InstanceHealth::Unhealthy);
        assert!(matches!(
            registry.select_instance("image", SelectionStrategy::RoundRobin),
            Err(HubError::UnavailableDestination { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinstatement_requires_full_streak() {
        let registry = ServiceRegistry::new(config());
        registry.register(InstanceRegistration::new("image", "i-1", "http://i1")).unwrap();
        tokio::time::sleep(Duration::from_millis(310)).await;
        assert_eq!(health(&registry, "image", "i-1"), InstanceHealth::Unhealthy);

        registry.heartbeat("image", "i-1").unwrap();
        assert_eq!(health(&registry, "image", "i-1"), InstanceHealth::Unhealthy);
        assert!(registry.select_instance("image", SelectionStrategy::HealthAware).is_err());

        registry.heartbeat("image", "i-1").unwrap();
        registry.heartbeat("image", "i-1").unwrap();
        assert_eq!(health(&registry, "image", "i-1"), InstanceHealth::Healthy);
        assert!(registry.select_instance("image", SelectionStrategy::HealthAware).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_recovers_on_single_heartbeat() {
        let registry = ServiceRegistry::new(config());
        registry.register(InstanceRegistration::new("image", "i-1", "http://i1")).unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(health(&registry, "image", "i-1"), InstanceHealth::Degraded);

        registry.heartbeat("image", "i-1").unwrap();
        assert_eq!(health(&registry, "image", "i-1"), InstanceHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_instances_are_purged() {
        let mut cfg = config();
        cfg.purge_after_ms = 500;
        let registry = ServiceRegistry::new(cfg);
        registry.register(InstanceRegistration::new("image", "i-1", "http://i1")).unwrap();

        tokio::time::sleep(Duration::from_millis(650)).await;
        assert!(registry.get("image", "i-1").is_none());
        assert!(registry.health("image").is_err());
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = ServiceRegistry::new(config());
        registry.register(InstanceRegistration::new("image", "i-1", "http://old")).unwrap();
        registry.register(InstanceRegistration::new("image", "i-1", "http://new")).unwrap();

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].endpoints, vec!["http://new".to_string()]);
    }

    #[tokio::test]
    async fn test_deregister_unknown_instance() {
        let registry = ServiceRegistry::new(config());
        assert!(matches!(
            registry.deregister("image", "nope"),
            Err(HubError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let registry = ServiceRegistry::new(config());
        for id in ["a", "b", "c"] {
            registry.register(InstanceRegistration::new("svc", id, format!("http://{}", id))).unwrap();
        }
        let picks: Vec<String> = (0..6)
            .map(|_| registry.select_instance("svc", SelectionStrategy::RoundRobin).unwrap().instance_id)
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_least_connections_prefers_idle() {
        let registry = ServiceRegistry::new(config());
        registry.register(InstanceRegistration::new("svc", "a", "http://a")).unwrap();
        registry.register(InstanceRegistration::new("svc", "b", "http://b")).unwrap();

        let held = registry.select_instance("svc", SelectionStrategy::LeastConnections).unwrap();
        assert_eq!(held.instance_id, "a");
        let next = registry.select_instance("svc", SelectionStrategy::LeastConnections).unwrap();
        assert_eq!(next.instance_id, "b");
        drop(next);
        drop(held);
        assert_eq!(registry.get("svc", "a").unwrap().active_connections, 0);
    }

    #[tokio::test]
    async fn test_health_aware_avoids_failing_instance() {
        let registry = ServiceRegistry::new(config());
        registry.register(InstanceRegistration::new("svc", "good", "http://good")).unwrap();
        registry.register(InstanceRegistration::new("svc", "bad", "http://bad")).unwrap();
        for _ in 0..200 {
            registry.record_outcome("svc", "bad", false);
        }

        let bad_picks = (0..200)
            .filter(|_| registry.select_instance("svc", SelectionStrategy::HealthAware).unwrap().instance_id == "bad")
            .count();
        assert!(bad_picks < 5, "bad instance picked {} times", bad_picks);
    }

    #[tokio::test]
    async fn test_dependency_cycle_rejected() {
        let registry = ServiceRegistry::new(config());
        registry
            .register(InstanceRegistration::new("campaign", "c-1", "http://c").with_dependency(Dependency::hard("character")))
            .unwrap();
        registry
            .register(InstanceRegistration::new("character", "ch-1", "http://ch").with_dependency(Dependency::hard("image")))
            .unwrap();

        let err = registry
            .register(InstanceRegistration::new("image", "i-1", "http://i").with_dependency(Dependency::soft("campaign")))
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn test_readiness_flags_unmet_hard_dependency() {
        let registry = ServiceRegistry::new(config());
        registry
            .register(
                InstanceRegistration::new("campaign", "c-1", "http://c")
                    .with_dependency(Dependency::hard("character"))
                    .with_dependency(Dependency::soft("image")),
            )
            .unwrap();

        let health = registry.health("campaign").unwrap();
        assert!(!health.ready);
        assert_eq!(health.unmet_dependencies, vec!["character".to_string()]);

        registry.register(InstanceRegistration::new("character", "ch-1", "http://ch")).unwrap();
        let health = registry.health("campaign").unwrap();
        assert!(health.ready);
        assert!(health.unmet_dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_dependencies_merge_across_instances() {
        let registry = ServiceRegistry::new(config());
        registry
            .register(InstanceRegistration::new("campaign", "c-1", "http://c1").with_dependency(Dependency::hard("character")))
            .unwrap();
        // A later instance without declarations keeps the service's list
        registry.register(InstanceRegistration::new("campaign", "c-2", "http://c2")).unwrap();
        registry
            .register(InstanceRegistration::new("campaign", "c-3", "http://c3").with_dependency(Dependency::hard("image")))
            .unwrap();

        let health = registry.health("campaign").unwrap();
        assert_eq!(
            health.unmet_dependencies,
            vec!["character".to_string(), "image".to_string()]
        );
    }
}
