//! Hub - the library facade
//!
//! Wires the event store, queues, registry, circuit breakers, retry
//! manager, router and transaction coordinator together, recovers state
//! from the log on open and exposes every operation callers need.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use hub_common::{
    Envelope, HealthReport, MessageStatusView, PublishRequest, PublishResponse, SendRequest, SendResponse,
    ServiceHealth,
};
use hub_config::HubConfig;
use hub_store::{
    CheckpointStore, CompactionReport, EventStore, EventSubscription, FileCheckpointStore, Replay, ReplayFrom,
    Snapshot, SubscriptionSpec,
};

use crate::circuit_breaker_registry::{CircuitBreakerRegistry, CircuitBreakerStats};
use crate::error::HubError;
use crate::health::{self, HealthInputs};
use crate::mediator::Mediator;
use crate::queue::PriorityQueueManager;
use crate::recovery::{self, RecoveredState};
use crate::registry::{InstanceRegistration, InstanceView, ServiceRegistry};
use crate::retry::RetryManager;
use crate::router::{PushSubscription, Router, RouterParts, Submitted};
use crate::transaction::{CommitReport, TransactionCoordinator, TransactionView};
use crate::Result;

pub struct Hub {
    config: HubConfig,
    store: EventStore,
    queue: Arc<PriorityQueueManager>,
    registry: Arc<ServiceRegistry>,
    circuits: Arc<CircuitBreakerRegistry>,
    retry: Arc<RetryManager>,
    router: Arc<Router>,
    transactions: TransactionCoordinator,
    checkpoints: Arc<dyn CheckpointStore>,
    commit_gate: Arc<RwLock<()>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Open the store, recover state and start dispatching
    pub async fn open(config: HubConfig, mediator: Arc<dyn Mediator>) -> Result<Arc<Self>> {
        config.validate().map_err(|e| HubError::validation(e.to_string()))?;

        let store = EventStore::open(&config.store)?;
        let commit_gate = Arc::new(RwLock::new(()));
        let queue = Arc::new(PriorityQueueManager::new(config.queue.clone()));
        let registry = ServiceRegistry::new(config.registry.clone());
        let circuits = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let (retry, due) = RetryManager::new(config.retry.clone(), store.clone(), commit_gate.clone());
        let retry = Arc::new(retry);

        let router = Router::new(
            config.router.clone(),
            config.registry.default_strategy,
            RouterParts {
                store: store.clone(),
                queue: queue.clone(),
                registry: registry.clone(),
                circuits: circuits.clone(),
                retry: retry.clone(),
                mediator,
                commit_gate: commit_gate.clone(),
            },
        );
        for subscription in &config.subscriptions {
            router.add_push_subscription(&subscription.service, &subscription.patterns)?;
        }

        let RecoveredState {
            messages,
            retries,
            transactions: open_transactions,
        } = recovery::recover(&store).await?;

        let transactions = TransactionCoordinator::new(
            config.transaction.clone(),
            store.clone(),
            router.clone(),
            commit_gate.clone(),
        );
        let rolled_back = transactions.roll_back_recovered(open_transactions.into_values()).await?;
        if rolled_back > 0 {
            warn!(rolled_back = rolled_back, "Rolled back transactions left open before restart");
        }

        let requeued = router.restore(messages.into_values(), &|id: &str| retries.contains_key(id));
        retry.restore(retries.into_values());
        let tasks = router.start(due);

        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(FileCheckpointStore::open(config.store.checkpoint_path()).await?);

        info!(
            partition = %config.store.partition,
            head = store.head(),
            requeued = requeued,
            "Hub opened"
        );

        Ok(Arc::new(Self {
            config,
            store,
            queue,
            registry,
            circuits,
            retry,
            router,
            transactions,
            checkpoints,
            commit_gate,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    // ========================================================================
    // Messages and events
    // ========================================================================

    pub async fn send(&self, request: SendRequest) -> Result<SendResponse> {
        self.router.send(request).await
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<PublishResponse> {
        self.router.publish(request).await
    }

    pub async fn submit(&self, envelope: Envelope) -> Result<Submitted> {
        self.router.submit(envelope).await
    }

    pub fn status(&self, message_id: &str) -> Result<MessageStatusView> {
        self.router.status(message_id)
    }

    pub async fn acknowledge(&self, message_id: &str) -> Result<MessageStatusView> {
        self.router.acknowledge(message_id).await
    }

    /// Stream of persisted events matching `spec`. Durable subscriptions
    /// resume after their last acknowledged sequence.
    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<EventSubscription> {
        Ok(self.store.subscribe(spec, Some(self.checkpoints.clone())).await?)
    }

    pub fn replay(&self, from: ReplayFrom) -> Result<Replay> {
        Ok(self.store.replay(from)?)
    }

    pub fn read_range(&self, from: u64, to: u64) -> Result<Vec<hub_common::Event>> {
        Ok(self.store.read_range(from, to)?)
    }

    pub fn add_push_subscription(&self, service: &str, patterns: &[String]) -> Result<()> {
        self.router.add_push_subscription(service, patterns)
    }

    pub fn remove_push_subscription(&self, service: &str) -> bool {
        self.router.remove_push_subscription(service)
    }

    pub fn push_subscriptions(&self) -> Vec<PushSubscription> {
        self.router.push_subscriptions()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn begin(&self, participants: Vec<String>) -> Result<String> {
        self.transactions.begin(participants).await
    }

    pub async fn add(&self, txn_id: &str, envelope: Envelope) -> Result<String> {
        self.transactions.add(txn_id, envelope).await
    }

    pub async fn stage_send(&self, txn_id: &str, request: SendRequest) -> Result<String> {
        self.transactions.stage_send(txn_id, request).await
    }

    pub async fn stage_publish(&self, txn_id: &str, request: PublishRequest) -> Result<String> {
        self.transactions.stage_publish(txn_id, request).await
    }

    pub async fn ack(&self, txn_id: &str, participant: &str) -> Result<TransactionView> {
        self.transactions.ack(txn_id, participant).await
    }

    pub async fn fail(&self, txn_id: &str, participant: &str, reason: &str) -> Result<TransactionView> {
        self.transactions.fail(txn_id, participant, reason).await
    }

    pub async fn commit(&self, txn_id: &str) -> Result<CommitReport> {
        self.transactions.commit(txn_id).await
    }

    pub async fn rollback(&self, txn_id: &str, reason: &str) -> Result<TransactionView> {
        self.transactions.rollback(txn_id, reason).await
    }

    pub async fn transaction_status(&self, txn_id: &str) -> Result<TransactionView> {
        self.transactions.status(txn_id).await
    }

    pub async fn expire_transactions(&self) -> usize {
        self.transactions.expire_stale().await
    }

    // ========================================================================
    // Registry and circuits
    // ========================================================================

    pub fn register(&self, registration: InstanceRegistration) -> Result<InstanceView> {
        self.registry.register(registration)
    }

    pub fn deregister(&self, service: &str, instance_id: &str) -> Result<()> {
        self.registry.deregister(service, instance_id)
    }

    pub fn heartbeat(&self, service: &str, instance_id: &str) -> Result<InstanceView> {
        self.registry.heartbeat(service, instance_id)
    }

    pub fn instances(&self) -> Vec<InstanceView> {
        self.registry.list()
    }

    pub fn service_health(&self, service: &str) -> Result<ServiceHealth> {
        self.registry.health(service)
    }

    pub fn purge_instances(&self) -> usize {
        self.registry.purge_expired()
    }

    pub fn circuits(&self) -> Vec<CircuitBreakerStats> {
        self.circuits.list()
    }

    pub fn circuit(&self, destination: &str) -> Result<CircuitBreakerStats> {
        self.circuits
            .get(destination)
            .ok_or_else(|| HubError::not_found("circuit", destination))
    }

    pub fn force_open(&self, destination: &str) -> CircuitBreakerStats {
        self.circuits.force_open(destination)
    }

    pub fn force_close(&self, destination: &str) -> CircuitBreakerStats {
        self.circuits.force_close(destination)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Persist the current hub state at the current head
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (sequence, state) = {
            let _gate = self.commit_gate.write().await;
            let state = RecoveredState {
                messages: self.router.messages_snapshot(),
                retries: self
                    .retry
                    .records()
                    .into_iter()
                    .map(|r| (r.message_id.clone(), r))
                    .collect(),
                transactions: self.transactions.open_records(),
            };
            (self.store.head(), state)
        };
        let mut state = state;
        state.normalize();
        let value = serde_json::to_value(&state).map_err(hub_store::StoreError::from)?;
        let snapshot = self.store.snapshot(sequence, value).await?;
        info!(
            sequence = sequence,
            messages = state.messages.len(),
            retries = state.retries.len(),
            "Snapshot written"
        );
        Ok(snapshot)
    }

    /// Compact everything the latest snapshot covers and retention allows
    pub async fn compact(&self) -> Result<CompactionReport> {
        Ok(self.store.compact(self.store.head().saturating_add(1)).await?)
    }

    pub fn cleanup_completed(&self) -> usize {
        self.router.cleanup_completed(self.config.router.status_retention())
    }

    /// Drop rate-limiter state of destinations back at full quota
    pub fn prune_quotas(&self) -> usize {
        self.queue.prune_quotas()
    }

    pub fn queue_depth(&self) -> [usize; hub_common::Priority::LEVELS] {
        self.queue.depth()
    }

    pub fn health_report(&self) -> HealthReport {
        health::evaluate(HealthInputs {
            store_writable: self.store.is_writable(),
            last_sequence: self.store.head(),
            queued_messages: self.queue.total() as u64,
            open_circuits: self.circuits.open_count() as u32,
            services: self.registry.all_health(),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.store.is_writable()
    }

    /// Stop dispatching and close the store
    pub async fn shutdown(&self) {
        self.router.shutdown();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(self.config.router.delivery_timeout(), task).await.is_err() {
                warn!("Dispatcher did not stop in time");
            }
        }
        self.store.close().await;
        info!("Hub shut down");
    }
}
