//! Message Hub Router
//!
//! This crate provides the delivery side of the hub:
//! - Router: admission, fan-out and the dispatch loop
//! - PriorityQueueManager: bounded priority queues with aging and per-destination quotas
//! - ServiceRegistry: instances, heartbeats, dependencies and instance selection
//! - CircuitBreakerRegistry: per-destination circuit breakers
//! - RetryManager: durable exponential backoff with jitter
//! - TransactionCoordinator: atomic multi-envelope commits
//! - HttpMediator: HTTP delivery to service instances
//! - Hub: the facade tying it all together, with crash recovery
//! - Lifecycle: background snapshots, compaction, sweeps and health reports

pub mod circuit_breaker_registry;
pub mod error;
pub mod health;
pub mod hub;
pub mod lifecycle;
pub mod mediator;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod router;
pub mod router_metrics;
pub mod transaction;
mod timer;

pub use circuit_breaker_registry::{
    CircuitBreakerRegistry, CircuitBreakerState, CircuitBreakerStats, CircuitPermit, CircuitTotals,
};
pub use error::HubError;
pub use health::HealthInputs;
pub use hub::Hub;
pub use lifecycle::LifecycleManager;
pub use mediator::{DeliveryTarget, HttpMediator, HttpMediatorConfig, Mediator};
pub use queue::{PriorityQueueManager, QueuedMessage};
pub use recovery::RecoveredState;
pub use registry::{Dependency, InstanceRegistration, InstanceTarget, InstanceView, ServiceRegistry};
pub use retry::{RetryManager, RetryPolicy, RetryRecord};
pub use router::{PushSubscription, Router, RouterParts, Submitted};
pub use transaction::{CommitReport, TransactionCoordinator, TransactionRecord, TransactionStatus, TransactionView};

pub type Result<T> = std::result::Result<T, HubError>;
