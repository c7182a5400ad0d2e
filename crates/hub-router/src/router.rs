//! Router - admission, fan-out and dispatch
//!
//! Admission validates synchronously, writes the published events and one
//! `hub.message.accepted` record per message as a single log batch, and only
//! then queues the messages. Dispatcher workers drain the priority queues:
//!
//! 1. Expired messages are dead-lettered with `ttl_expired`
//! 2. An open circuit parks the message until the breaker's remaining
//!    timeout, without spending an attempt
//! 3. An instance is selected; none available counts as a failed attempt
//! 4. Success marks the message delivered, a permanent rejection
//!    dead-letters it, anything else goes to the retry manager

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use hub_common::{
    system_events, AcceptStatus, DeadLetterReason, Envelope, EnvelopeKind, Event, MediationOutcome, MediationResult,
    Message, MessageStatus, MessageStatusView, Priority, PublishRequest, PublishResponse, SendRequest, SendResponse,
    HUB_SOURCE,
};
use hub_config::{RouterConfig, SelectionStrategy};
use hub_store::{EventStore, PatternSet};

use crate::circuit_breaker_registry::{CircuitBreakerRegistry, CircuitPermit};
use crate::error::HubError;
use crate::mediator::{DeliveryTarget, Mediator};
use crate::queue::{PriorityQueueManager, QueuedMessage, Reservation};
use crate::registry::ServiceRegistry;
use crate::retry::RetryManager;
use crate::router_metrics;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    /// In a priority queue
    Queued,
    /// Claimed by a dispatcher worker
    InFlight,
    /// Waiting on a retry or circuit timer
    Waiting,
    /// Terminal record being written
    Closing,
    Done,
}

/// Terminal outcome of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Delivered,
    DeadLettered(DeadLetterReason),
}

struct MessageEntry {
    message: Message,
    expires_at: Option<Instant>,
    state: DispatchState,
    completed_at: Option<Instant>,
    /// Outcome whose log record could not be written yet
    unsettled: Option<Settlement>,
}

/// Push subscription: matching published events fan out to `service`
#[derive(Debug, Clone)]
pub struct PushSubscription {
    pub service: String,
    patterns: PatternSet,
}

impl PushSubscription {
    pub fn patterns(&self) -> &[String] {
        self.patterns.patterns()
    }
}

/// What `submit` did with an envelope
#[derive(Debug, Clone)]
pub enum Submitted {
    Sent(SendResponse),
    Published(PublishResponse),
}

/// Result of persisting an admission batch
pub(crate) struct Admitted {
    /// User events with their sequence numbers
    pub events: Vec<Event>,
    /// Messages that were new and are now queued
    pub message_ids: Vec<String>,
}

/// Message ids claimed by an admission that has not finished. Released on
/// drop, by which time admitted ids are in the message table.
struct AdmissionClaims<'a> {
    admitting: &'a DashSet<String>,
    ids: Vec<String>,
}

impl Drop for AdmissionClaims<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.admitting.remove(id);
        }
    }
}

type EnvelopeHandler = for<'a> fn(&'a Router, Envelope) -> BoxFuture<'a, Result<Submitted>>;

/// Collaborators the router orchestrates
pub struct RouterParts {
    pub store: EventStore,
    pub queue: Arc<PriorityQueueManager>,
    pub registry: Arc<ServiceRegistry>,
    pub circuits: Arc<CircuitBreakerRegistry>,
    pub retry: Arc<RetryManager>,
    pub mediator: Arc<dyn Mediator>,
    pub commit_gate: Arc<RwLock<()>>,
}

pub struct Router {
    config: RouterConfig,
    strategy: SelectionStrategy,
    store: EventStore,
    queue: Arc<PriorityQueueManager>,
    registry: Arc<ServiceRegistry>,
    circuits: Arc<CircuitBreakerRegistry>,
    retry: Arc<RetryManager>,
    mediator: Arc<dyn Mediator>,
    /// Held shared around every log append that changes router state, and
    /// exclusively while a snapshot captures that state
    commit_gate: Arc<RwLock<()>>,
    messages: DashMap<String, MessageEntry>,
    admitting: DashSet<String>,
    subscriptions: parking_lot::RwLock<Vec<PushSubscription>>,
    handlers: HashMap<EnvelopeKind, EnvelopeHandler>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Router {
    pub fn new(config: RouterConfig, strategy: SelectionStrategy, parts: RouterParts) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut handlers: HashMap<EnvelopeKind, EnvelopeHandler> = HashMap::new();
        handlers.insert(EnvelopeKind::Message, handle_message);
        handlers.insert(EnvelopeKind::Event, handle_event);

        Arc::new(Self {
            config,
            strategy,
            store: parts.store,
            queue: parts.queue,
            registry: parts.registry,
            circuits: parts.circuits,
            retry: parts.retry,
            mediator: parts.mediator,
            commit_gate: parts.commit_gate,
            messages: DashMap::new(),
            admitting: DashSet::new(),
            subscriptions: parking_lot::RwLock::new(Vec::new()),
            handlers,
            running: AtomicBool::new(true),
            shutdown_tx,
        })
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Route one envelope through the handler registered for its kind
    pub async fn submit(&self, envelope: Envelope) -> Result<Submitted> {
        let handler = self
            .handlers
            .get(&envelope.kind())
            .copied()
            .ok_or_else(|| HubError::validation("no handler for envelope"))?;
        handler(self, envelope).await
    }

    pub async fn send(&self, request: SendRequest) -> Result<SendResponse> {
        let message = self.prepare_send(request)?;
        self.admit_message(message).await
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<PublishResponse> {
        let (event, messages) = self.prepare_publish(request)?;
        let fan_out = messages.len();
        let admitted = self.persist_and_admit(vec![event], messages, |_| None, || {}).await?;
        let event = admitted
            .events
            .into_iter()
            .next()
            .ok_or_else(|| HubError::validation("publish produced no event"))?;

        router_metrics::record_message_accepted("publish");
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            sequence_number = event.sequence_number,
            fan_out = fan_out,
            "Event published"
        );
        Ok(PublishResponse {
            id: event.id,
            sequence_number: event.sequence_number,
            status: AcceptStatus::Accepted,
            fan_out,
        })
    }

    async fn admit_message(&self, message: Message) -> Result<SendResponse> {
        let id = message.id.clone();
        let admitted = self.persist_and_admit(Vec::new(), vec![message], |_| None, || {}).await?;
        if admitted.message_ids.is_empty() {
            debug!(message_id = %id, "Duplicate send ignored");
        } else {
            router_metrics::record_message_accepted("send");
        }
        Ok(SendResponse {
            id,
            status: AcceptStatus::Accepted,
            reason: None,
        })
    }

    /// Validate a send request and stamp the fields the caller left out
    pub fn prepare_send(&self, request: SendRequest) -> Result<Message> {
        let now = Utc::now();
        let id = request
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ttl_ms = request.ttl_ms.or(self.config.default_ttl_ms);

        let message = Message {
            correlation_id: request
                .correlation_id
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| id.clone()),
            id,
            message_type: request.message_type,
            source: request.source,
            destination: request.destination,
            payload: request.payload,
            priority: request.priority.unwrap_or_default(),
            ttl_ms,
            deadline: ttl_ms.map(|ttl| now + chrono::Duration::milliseconds(ttl as i64)),
            created_at: now,
            delivery_attempts: 0,
            last_attempt_at: None,
            status: MessageStatus::Pending,
            dead_letter_reason: None,
            origin_event_id: None,
        };
        self.validate_message(&message)?;
        Ok(message)
    }

    /// Validate a caller-built message, filling in correlation id and deadline
    pub fn prepare_message(&self, mut message: Message) -> Result<Message> {
        if message.id.trim().is_empty() {
            message.id = uuid::Uuid::new_v4().to_string();
        }
        if message.correlation_id.trim().is_empty() {
            message.correlation_id = message.id.clone();
        }
        if message.ttl_ms.is_none() {
            message.ttl_ms = self.config.default_ttl_ms;
        }
        if message.deadline.is_none() {
            message.deadline = message
                .ttl_ms
                .map(|ttl| message.created_at + chrono::Duration::milliseconds(ttl as i64));
        }
        self.validate_message(&message)?;
        Ok(message)
    }

    fn validate_message(&self, message: &Message) -> Result<()> {
        if message.message_type.trim().is_empty() {
            return Err(HubError::validation("type is required"));
        }
        if message.source.trim().is_empty() {
            return Err(HubError::validation("source is required"));
        }
        if message.source == HUB_SOURCE {
            return Err(HubError::validation(format!("source '{}' is reserved", HUB_SOURCE)));
        }
        if message.destination.trim().is_empty() {
            return Err(HubError::validation("destination is required"));
        }
        if message.ttl_ms == Some(0) {
            return Err(HubError::validation("ttl_ms must be positive"));
        }
        if message.is_terminal() {
            return Err(HubError::validation("message is already terminal"));
        }
        self.check_payload(&message.payload)
    }

    fn check_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let size = serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(usize::MAX);
        if size > self.config.max_payload_bytes {
            return Err(HubError::validation(format!(
                "payload is {} bytes, limit is {}",
                size, self.config.max_payload_bytes
            )));
        }
        Ok(())
    }

    /// Validate a publish request and build the event plus one message per
    /// matching push subscription
    pub fn prepare_publish(&self, request: PublishRequest) -> Result<(Event, Vec<Message>)> {
        if request.source.trim().is_empty() {
            return Err(HubError::validation("source is required"));
        }
        if request.source == HUB_SOURCE {
            return Err(HubError::validation(format!("source '{}' is reserved", HUB_SOURCE)));
        }
        if request.event_type.trim().is_empty() {
            return Err(HubError::validation("event_type is required"));
        }
        if request.event_type.starts_with("hub.") {
            return Err(HubError::validation("event types under 'hub.' are reserved"));
        }
        self.check_payload(&request.payload)?;

        let mut event = Event::new(request.source, request.event_type, request.payload);
        if let Some(correlation_id) = request.correlation_id.filter(|c| !c.trim().is_empty()) {
            event = event.with_correlation_id(correlation_id);
        }
        let message_type = request.message_type.unwrap_or_else(|| event.event_type.clone());
        let messages = self.fan_out(&event, &message_type);
        Ok((event, messages))
    }

    fn fan_out(&self, event: &Event, message_type: &str) -> Vec<Message> {
        let ttl_ms = self.config.default_ttl_ms;
        let subscriptions = self.subscriptions.read();
        let mut services: Vec<&str> = subscriptions
            .iter()
            .filter(|s| s.patterns.matches(&event.event_type))
            .map(|s| s.service.as_str())
            .collect();
        services.sort();
        services.dedup();

        services
            .into_iter()
            .map(|service| Message {
                id: format!("{}:{}", event.id, service),
                message_type: message_type.to_string(),
                source: event.source.clone(),
                destination: service.to_string(),
                correlation_id: event.correlation_id.clone(),
                payload: event.payload.clone(),
                priority: Priority::default(),
                ttl_ms,
                deadline: ttl_ms.map(|ttl| event.timestamp + chrono::Duration::milliseconds(ttl as i64)),
                created_at: event.timestamp,
                delivery_attempts: 0,
                last_attempt_at: None,
                status: MessageStatus::Pending,
                dead_letter_reason: None,
                origin_event_id: Some(event.id.clone()),
            })
            .collect()
    }

    /// True when `id` is accepted or being accepted
    pub(crate) fn is_known(&self, id: &str) -> bool {
        self.messages.contains_key(id) || self.admitting.contains(id)
    }

    /// Claim the ids of `messages` for one admission. Ids that are already
    /// accepted, claimed elsewhere or repeated in the batch are dropped.
    fn claim_new(&self, messages: Vec<Message>) -> (Vec<Message>, AdmissionClaims<'_>) {
        let mut claims = AdmissionClaims {
            admitting: &self.admitting,
            ids: Vec::with_capacity(messages.len()),
        };
        let mut fresh = Vec::with_capacity(messages.len());
        for message in messages {
            // Claim before looking at the table: a finished admission
            // inserts into the table before it releases its claim
            if !self.admitting.insert(message.id.clone()) {
                continue;
            }
            if self.messages.contains_key(&message.id) {
                self.admitting.remove(&message.id);
                continue;
            }
            claims.ids.push(message.id.clone());
            fresh.push(message);
        }
        (fresh, claims)
    }

    /// Write `events`, an accepted record per new message and the trailer
    /// built from the admitted messages as one log batch, then queue the
    /// messages. Duplicate ids are skipped. Queue capacity is reserved first
    /// so an accepted message is never dropped. `on_durable` runs once the
    /// batch is in the log, inside the commit gate.
    pub(crate) async fn persist_and_admit<T, F>(
        &self,
        events: Vec<Event>,
        messages: Vec<Message>,
        trailer: T,
        on_durable: F,
    ) -> Result<Admitted>
    where
        T: FnOnce(&[Message]) -> Option<Event> + Send,
        F: FnOnce() + Send,
    {
        let (messages, _claims) = self.claim_new(messages);
        let message_ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();

        let mut reservations: Vec<Reservation> = Vec::with_capacity(messages.len());
        for message in &messages {
            reservations.push(self.queue.try_reserve(message.priority)?);
        }

        let user_events = events.len();
        let mut batch = events;
        for message in &messages {
            batch.push(Event::system(
                system_events::MESSAGE_ACCEPTED,
                message.correlation_id.clone(),
                serde_json::to_value(message).unwrap_or_default(),
            ));
        }
        batch.extend(trailer(&messages));
        let batch_len = batch.len();

        let mut entries = Vec::with_capacity(messages.len());
        let stamped = {
            let _gate = self.commit_gate.read().await;
            let stamped = self.store.append_batch(batch).await?;
            for message in messages {
                let expires_at = expiry_instant(&message);
                entries.push(QueuedMessage::new(
                    message.id.clone(),
                    message.destination.clone(),
                    message.priority,
                    expires_at,
                ));
                self.messages.insert(
                    message.id.clone(),
                    MessageEntry {
                        message,
                        expires_at,
                        state: DispatchState::Queued,
                        completed_at: None,
                        unsettled: None,
                    },
                );
            }
            on_durable();
            stamped
        };
        router_metrics::record_event_appended(batch_len);

        for (reservation, entry) in reservations.into_iter().zip(entries) {
            self.queue.enqueue(reservation, entry);
        }

        Ok(Admitted {
            events: stamped.into_iter().take(user_events).collect(),
            message_ids,
        })
    }

    // ========================================================================
    // Queries and acknowledgement
    // ========================================================================

    pub fn status(&self, message_id: &str) -> Result<MessageStatusView> {
        self.messages
            .get(message_id)
            .map(|e| MessageStatusView::from(&e.message))
            .ok_or_else(|| HubError::not_found("message", message_id))
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.messages.get(message_id).map(|e| e.message.clone())
    }

    /// Out-of-band acknowledgement from the destination: the message counts
    /// as delivered and pending retries are cancelled
    pub async fn acknowledge(&self, message_id: &str) -> Result<MessageStatusView> {
        if !self.messages.contains_key(message_id) {
            return Err(HubError::not_found("message", message_id));
        }
        self.settle_delivered(message_id).await?;
        self.status(message_id)
    }

    pub fn add_push_subscription(&self, service: &str, patterns: &[String]) -> Result<()> {
        if service.trim().is_empty() || patterns.is_empty() {
            return Err(HubError::validation("subscription needs a service and at least one pattern"));
        }
        let patterns = PatternSet::new(patterns).map_err(|e| HubError::validation(e.to_string()))?;
        let mut subscriptions = self.subscriptions.write();
        subscriptions.retain(|s| s.service != service);
        subscriptions.push(PushSubscription {
            service: service.to_string(),
            patterns,
        });
        info!(service = %service, "Push subscription registered");
        Ok(())
    }

    pub fn remove_push_subscription(&self, service: &str) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.service != service);
        subscriptions.len() != before
    }

    pub fn push_subscriptions(&self) -> Vec<PushSubscription> {
        self.subscriptions.read().clone()
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.total()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Spawn the dispatcher workers and the retry/defer timer consumer
    pub fn start(self: &Arc<Self>, mut due: mpsc::UnboundedReceiver<String>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let workers = self.config.dispatch_workers.max(1);

        for worker_id in 0..workers {
            let router = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                debug!(worker_id = worker_id, "Dispatcher started");
                loop {
                    if !router.running.load(Ordering::Acquire) {
                        break;
                    }
                    match router.queue.try_dequeue(Instant::now()) {
                        Some(entry) => router.dispatch(entry).await,
                        None => {
                            tokio::select! {
                                _ = shutdown_rx.recv() => break,
                                _ = router.queue.wait_for_work(router.config.idle_poll()) => {}
                            }
                        }
                    }
                }
                debug!(worker_id = worker_id, "Dispatcher stopped");
            }));
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                let id = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    id = due.recv() => match id {
                        Some(id) => id,
                        None => break,
                    },
                };
                match weak.upgrade() {
                    Some(router) => router.on_due(&id).await,
                    None => break,
                }
            }
        }));

        info!(workers = workers, "Router started");
        handles
    }

    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.shutdown_tx.send(());
            info!("Router shutting down");
        }
    }

    async fn dispatch(&self, entry: QueuedMessage) {
        let id = entry.message_id;

        let (destination, expired) = {
            let Some(e) = self.messages.get(&id) else { return };
            if e.message.is_terminal() || e.state != DispatchState::Queued {
                return;
            }
            (e.message.destination.clone(), e.message.is_expired_at(Utc::now()))
        };
        if expired {
            self.dead_letter(&id, DeadLetterReason::TtlExpired).await;
            return;
        }

        let permit = match self.circuits.try_acquire(&destination) {
            Ok(permit) => permit,
            Err(HubError::CircuitOpen { retry_after, .. }) => {
                self.park(&id, Instant::now() + retry_after);
                return;
            }
            Err(e) => {
                error!(message_id = %id, error = %e, "Unexpected circuit error");
                self.park(&id, Instant::now() + self.config.idle_poll());
                return;
            }
        };

        let message = {
            let Some(mut e) = self.messages.get_mut(&id) else {
                self.circuits.release(&destination, permit);
                return;
            };
            if e.message.is_terminal() || e.state != DispatchState::Queued {
                self.circuits.release(&destination, permit);
                return;
            }
            e.state = DispatchState::InFlight;
            e.message.delivery_attempts += 1;
            e.message.last_attempt_at = Some(Utc::now());
            e.message.clone()
        };

        let target = match self.registry.select_instance(&destination, self.strategy) {
            Ok(target) => target,
            Err(e) => {
                warn!(
                    message_id = %id,
                    destination = %destination,
                    attempt = message.delivery_attempts,
                    "No instance available"
                );
                self.circuits.record_failure(&destination, permit);
                self.handle_failure(&id, MediationOutcome::error_connection(e.to_string())).await;
                return;
            }
        };

        let delivery_target = DeliveryTarget {
            service: target.service.clone(),
            instance_id: target.instance_id.clone(),
            endpoint: target.endpoint.clone(),
        };
        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.config.delivery_timeout(),
            self.mediator.deliver(&message, &delivery_target),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => MediationOutcome::error_connection("delivery timed out".to_string()),
        };
        drop(target);

        router_metrics::record_delivery(&destination, started.elapsed(), outcome.is_success());
        self.registry
            .record_outcome(&delivery_target.service, &delivery_target.instance_id, !outcome.is_retryable());

        match outcome.result {
            MediationResult::Success => {
                self.circuits.record_success(&destination, permit);
                self.mark_delivered(&id).await;
            }
            MediationResult::ErrorConfig => {
                // The destination answered; only the message is bad
                self.circuits.record_success(&destination, permit);
                warn!(
                    message_id = %id,
                    status_code = ?outcome.status_code,
                    error = ?outcome.error_message,
                    "Message rejected by destination"
                );
                self.dead_letter(&id, DeadLetterReason::NonRetryable).await;
            }
            MediationResult::ErrorProcess | MediationResult::ErrorConnection => {
                self.circuits.record_failure(&destination, permit);
                self.handle_failure(&id, outcome).await;
            }
        }
    }

    async fn handle_failure(&self, id: &str, outcome: MediationOutcome) {
        let message = {
            let Some(mut e) = self.messages.get_mut(id) else { return };
            if e.message.is_terminal() || e.state == DispatchState::Closing {
                return;
            }
            if let Err(err) = e.message.transition(MessageStatus::Failed) {
                warn!(error = %err, "Ignoring status transition");
            }
            e.state = DispatchState::Waiting;
            e.message.clone()
        };

        debug!(
            message_id = %id,
            attempt = message.delivery_attempts,
            status_code = ?outcome.status_code,
            error = ?outcome.error_message,
            "Delivery attempt failed"
        );

        if message.is_expired_at(Utc::now()) {
            self.dead_letter(id, DeadLetterReason::TtlExpired).await;
            return;
        }
        if self.retry.exhausted(&message) {
            self.dead_letter(id, DeadLetterReason::MaxAttemptsExceeded).await;
            return;
        }

        let expires_at = expiry_instant(&message);
        if let Err(e) = self.retry.schedule_retry(&message, expires_at).await {
            error!(message_id = %id, error = %e, "Failed to persist retry, retrying after base delay");
            let policy = self.retry.policy_for(&message.message_type);
            self.retry.defer(id, Instant::now() + policy.base_delay);
        }
    }

    /// Hold a message back without spending an attempt
    fn park(&self, id: &str, until: Instant) {
        let fire_at = {
            let Some(mut e) = self.messages.get_mut(id) else { return };
            if e.message.is_terminal() || e.state == DispatchState::Closing {
                return;
            }
            e.state = DispatchState::Waiting;
            e.expires_at.map(|x| x.min(until)).unwrap_or(until)
        };
        debug!(message_id = %id, "Circuit open, dispatch deferred");
        self.retry.defer(id, fire_at);
    }

    async fn on_due(&self, id: &str) {
        let due = {
            let Some(mut e) = self.messages.get_mut(id) else { return };
            if e.state != DispatchState::Waiting || e.message.is_terminal() {
                return;
            }
            if let Some(settlement) = e.unsettled.take() {
                Due::Settle(settlement)
            } else if e.message.is_expired_at(Utc::now()) {
                Due::Settle(Settlement::DeadLettered(DeadLetterReason::TtlExpired))
            } else {
                e.state = DispatchState::Queued;
                // Aging counts from acceptance, not from the last attempt
                Due::Requeue(
                    QueuedMessage::new(id.to_string(), e.message.destination.clone(), e.message.priority, e.expires_at)
                        .enqueued_at(accepted_instant(&e.message)),
                )
            }
        };

        match due {
            Due::Settle(Settlement::Delivered) => self.mark_delivered(id).await,
            Due::Settle(Settlement::DeadLettered(reason)) => self.dead_letter(id, reason).await,
            Due::Requeue(entry) => self.queue.requeue(entry),
        }
    }

    /// Write the terminal record for `id`, then apply `settlement`. The
    /// in-memory status only changes once the record is durable; when the
    /// append fails the message stays live and the write is retried after
    /// the base delay. Returns `None` when the message is unknown, terminal
    /// or already being closed.
    async fn close_message(&self, id: &str, settlement: Settlement) -> Result<Option<Message>> {
        let (next, reason) = match settlement {
            Settlement::Delivered => (MessageStatus::Delivered, None),
            Settlement::DeadLettered(reason) => (MessageStatus::DeadLettered, Some(reason)),
        };
        let _gate = self.commit_gate.read().await;
        let mut closed = {
            let Some(mut e) = self.messages.get_mut(id) else { return Ok(None) };
            if e.state == DispatchState::Closing || !e.message.status.can_transition_to(next) {
                return Ok(None);
            }
            e.state = DispatchState::Closing;
            e.message.clone()
        };
        closed.status = next;
        if reason.is_some() {
            closed.dead_letter_reason = reason;
        }

        let record = match reason {
            Some(reason) => Event::system(
                system_events::dead_lettered(&closed.message_type),
                closed.correlation_id.clone(),
                json!({
                    "message_id": closed.id,
                    "reason": reason.code(),
                    "attempts": closed.delivery_attempts,
                    "destination": closed.destination,
                }),
            ),
            None => Event::system(
                system_events::MESSAGE_DELIVERED,
                closed.correlation_id.clone(),
                json!({
                    "message_id": closed.id,
                    "attempts": closed.delivery_attempts,
                    "destination": closed.destination,
                }),
            ),
        };

        if let Err(e) = self.store.append(record).await {
            if let Some(mut entry) = self.messages.get_mut(id) {
                entry.state = DispatchState::Waiting;
                entry.unsettled = Some(settlement);
            }
            let policy = self.retry.policy_for(&closed.message_type);
            self.retry.defer(id, Instant::now() + policy.base_delay);
            return Err(e.into());
        }

        if let Some(mut entry) = self.messages.get_mut(id) {
            entry.message = closed.clone();
            entry.unsettled = None;
            entry.state = DispatchState::Done;
            entry.completed_at = Some(Instant::now());
        }
        self.retry.cancel(id);
        Ok(Some(closed))
    }

    async fn settle_delivered(&self, id: &str) -> Result<()> {
        if let Some(message) = self.close_message(id, Settlement::Delivered).await? {
            router_metrics::record_message_delivered();
            info!(
                message_id = %id,
                destination = %message.destination,
                attempts = message.delivery_attempts,
                "Message delivered"
            );
        }
        Ok(())
    }

    async fn mark_delivered(&self, id: &str) {
        if let Err(e) = self.settle_delivered(id).await {
            error!(message_id = %id, error = %e, "Delivery record not persisted, will retry");
        }
    }

    async fn dead_letter(&self, id: &str, reason: DeadLetterReason) {
        match self.close_message(id, Settlement::DeadLettered(reason)).await {
            Ok(Some(message)) => {
                router_metrics::record_dead_letter(reason);
                warn!(
                    message_id = %id,
                    message_type = %message.message_type,
                    destination = %message.destination,
                    reason = %reason,
                    attempts = message.delivery_attempts,
                    "Message dead-lettered"
                );
            }
            Ok(None) => {}
            Err(e) => {
                error!(message_id = %id, reason = %reason, error = %e, "Dead-letter record not persisted, will retry");
            }
        }
    }

    // ========================================================================
    // Maintenance and recovery
    // ========================================================================

    /// Forget terminal messages completed longer than `retention` ago
    pub fn cleanup_completed(&self, retention: Duration) -> usize {
        let before = self.messages.len();
        self.messages.retain(|_, e| match e.completed_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        before - self.messages.len()
    }

    /// Current message table, for snapshots
    pub fn messages_snapshot(&self) -> BTreeMap<String, Message> {
        self.messages
            .iter()
            .map(|e| (e.key().clone(), e.message.clone()))
            .collect()
    }

    /// Rebuild the message table after recovery. Messages with a pending
    /// retry wait for its timer; other live messages go straight back into
    /// the queues.
    pub fn restore(&self, messages: impl IntoIterator<Item = Message>, waiting: &dyn Fn(&str) -> bool) -> usize {
        let mut requeued = 0usize;
        for message in messages {
            let expires_at = expiry_instant(&message);
            let (state, completed_at) = if message.is_terminal() {
                (DispatchState::Done, Some(Instant::now()))
            } else if waiting(&message.id) {
                (DispatchState::Waiting, None)
            } else {
                (DispatchState::Queued, None)
            };

            if state == DispatchState::Queued {
                self.queue.requeue(
                    QueuedMessage::new(message.id.clone(), message.destination.clone(), message.priority, expires_at)
                        .enqueued_at(accepted_instant(&message)),
                );
                requeued += 1;
            }
            self.messages.insert(
                message.id.clone(),
                MessageEntry {
                    message,
                    expires_at,
                    state,
                    completed_at,
                    unsettled: None,
                },
            );
        }
        requeued
    }
}

enum Due {
    Requeue(QueuedMessage),
    Settle(Settlement),
}

/// Monotonic instant matching the message's wall-clock creation time, for
/// aging
fn accepted_instant(message: &Message) -> Instant {
    let now = Instant::now();
    let waited = (Utc::now() - message.created_at).to_std().unwrap_or(Duration::ZERO);
    now.checked_sub(waited).unwrap_or(now)
}

/// Monotonic instant matching the message's wall-clock deadline
fn expiry_instant(message: &Message) -> Option<Instant> {
    message.deadline.map(|deadline| {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + remaining
    })
}

fn handle_message(router: &Router, envelope: Envelope) -> BoxFuture<'_, Result<Submitted>> {
    Box::pin(async move {
        let Envelope::Message(message) = envelope else {
            return Err(HubError::validation("expected a message envelope"));
        };
        let message = router.prepare_message(message)?;
        router.admit_message(message).await.map(Submitted::Sent)
    })
}

fn handle_event(router: &Router, envelope: Envelope) -> BoxFuture<'_, Result<Submitted>> {
    Box::pin(async move {
        let Envelope::Event(event) = envelope else {
            return Err(HubError::validation("expected an event envelope"));
        };
        let request = PublishRequest {
            message_type: None,
            source: event.source,
            event_type: event.event_type,
            correlation_id: Some(event.correlation_id),
            payload: event.payload,
        };
        router.publish(request).await.map(Submitted::Published)
    })
}
