use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use utoipa::ToSchema;

pub mod logging;

/// Source stamped on every event the hub itself writes to the log
pub const HUB_SOURCE: &str = "hub";

/// Event types the hub appends for its own bookkeeping.
///
/// Dead-letter notifications are not listed here: they are emitted as
/// `<message type>.dead_lettered` so subscribers can pattern-match on them.
pub mod system_events {
    pub const MESSAGE_ACCEPTED: &str = "hub.message.accepted";
    pub const MESSAGE_DELIVERED: &str = "hub.message.delivered";
    pub const RETRY_SCHEDULED: &str = "hub.retry.scheduled";
    pub const TXN_BEGIN: &str = "hub.txn.begin";
    pub const TXN_COMMITTED: &str = "hub.txn.committed";
    pub const TXN_ROLLED_BACK: &str = "hub.txn.rolled_back";
    pub const DEAD_LETTERED_SUFFIX: &str = ".dead_lettered";

    pub fn dead_lettered(message_type: &str) -> String {
        format!("{}{}", message_type, DEAD_LETTERED_SUFFIX)
    }

    pub fn is_dead_lettered(event_type: &str) -> bool {
        event_type.ends_with(DEAD_LETTERED_SUFFIX)
    }
}

// ============================================================================
// Priority
// ============================================================================

/// Fixed scheduling levels, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];
    pub const LEVELS: usize = 4;

    /// Level index, 0 is the most urgent
    pub fn level(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn from_level(level: usize) -> Self {
        match level {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message
// ============================================================================

/// Delivery status of a message. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Failed,
    Delivered,
    DeadLettered,
}

impl MessageStatus {
    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Failed => 1,
            MessageStatus::Delivered | MessageStatus::DeadLettered => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::DeadLettered)
    }

    /// Failed may repeat (one per failed attempt); terminal states are final.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Failed => "failed",
            MessageStatus::Delivered => "delivered",
            MessageStatus::DeadLettered => "dead_lettered",
        }
    }
}

/// Reason code carried by every dead-letter notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    TtlExpired,
    MaxAttemptsExceeded,
    NonRetryable,
}

impl DeadLetterReason {
    pub fn code(&self) -> &'static str {
        match self {
            DeadLetterReason::TtlExpired => "ttl_expired",
            DeadLetterReason::MaxAttemptsExceeded => "max_attempts_exceeded",
            DeadLetterReason::NonRetryable => "non_retryable",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition for message {message_id}: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub message_id: String,
    pub from: MessageStatus,
    pub to: MessageStatus,
}

/// The core message structure that flows through the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub source: String,
    pub destination: String,
    pub correlation_id: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub ttl_ms: Option<u64>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub delivery_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    pub dead_letter_reason: Option<DeadLetterReason>,
    /// Set when the message is one leg of a publish fan-out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_event_id: Option<String>,
}

impl Message {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition(&mut self, next: MessageStatus) -> std::result::Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                message_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }
}

// ============================================================================
// Event
// ============================================================================

/// An immutable log entry. `sequence_number` is assigned by the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Event {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub sequence_number: u64,
}

impl Event {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            correlation_id: id.clone(),
            id,
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
            sequence_number: 0,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Bookkeeping event written by the hub itself
    pub fn system(event_type: impl Into<String>, correlation_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(HUB_SOURCE, event_type, payload).with_correlation_id(correlation_id)
    }

    pub fn is_system(&self) -> bool {
        self.source == HUB_SOURCE
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Closed union of the traffic the hub carries
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Message(Message),
    Event(Event),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Message,
    Event,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Message(_) => EnvelopeKind::Message,
            Envelope::Event(_) => EnvelopeKind::Event,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Envelope::Message(m) => &m.id,
            Envelope::Event(e) => &e.id,
        }
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// Point-to-point send request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SendRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl SendRequest {
    pub fn new(
        message_type: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            message_type: message_type.into(),
            source: source.into(),
            destination: destination.into(),
            correlation_id: None,
            payload,
            ttl_ms: None,
            priority: None,
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AcceptStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SendResponse {
    pub id: String,
    pub status: AcceptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Event publish request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PublishRequest {
    /// Optional message type used for the fan-out deliveries; defaults to `event_type`
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    pub source: String,
    pub event_type: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

impl PublishRequest {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_type: None,
            source: source.into(),
            event_type: event_type.into(),
            correlation_id: None,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PublishResponse {
    pub id: String,
    pub sequence_number: u64,
    pub status: AcceptStatus,
    /// Number of push deliveries created for matching subscriptions
    pub fan_out: usize,
}

/// Status query result
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageStatusView {
    pub id: String,
    pub status: MessageStatus,
    pub delivery_attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_reason: Option<DeadLetterReason>,
}

impl From<&Message> for MessageStatusView {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id.clone(),
            status: m.status,
            delivery_attempts: m.delivery_attempts,
            last_attempt: m.last_attempt_at,
            dead_letter_reason: m.dead_letter_reason,
        }
    }
}

// ============================================================================
// Service Instances
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum InstanceHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

// ============================================================================
// Mediation Types
// ============================================================================

/// Result of a delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationResult {
    /// Delivered and acknowledged by the destination
    Success,
    /// Destination refused the message permanently (4xx); never retried
    ErrorConfig,
    /// Transient failure (5xx, 408, 429)
    ErrorProcess,
    /// Connection refused, reset or timed out
    ErrorConnection,
}

/// Outcome of a delivery attempt
#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl MediationOutcome {
    pub fn success() -> Self {
        Self {
            result: MediationResult::Success,
            status_code: Some(200),
            error_message: None,
        }
    }

    pub fn error_config(status_code: u16, message: String) -> Self {
        Self {
            result: MediationResult::ErrorConfig,
            status_code: Some(status_code),
            error_message: Some(message),
        }
    }

    pub fn error_process(status_code: Option<u16>, message: String) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            status_code,
            error_message: Some(message),
        }
    }

    pub fn error_connection(message: String) -> Self {
        Self {
            result: MediationResult::ErrorConnection,
            status_code: None,
            error_message: Some(message),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == MediationResult::Success
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.result, MediationResult::ErrorProcess | MediationResult::ErrorConnection)
    }
}

// ============================================================================
// Health Types
// ============================================================================

/// Overall hub health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some issues detected but operational
    Warning,
    /// Significant issues affecting operations
    Degraded,
}

/// Per-service summary of downstream health
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceHealth {
    pub service: String,
    pub healthy: u32,
    pub degraded: u32,
    pub unhealthy: u32,
    /// False when a hard dependency has no healthy instance
    pub ready: bool,
    pub unmet_dependencies: Vec<String>,
}

/// Detailed health report
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store_writable: bool,
    pub last_sequence: u64,
    pub queued_messages: u64,
    pub open_circuits: u32,
    pub services: Vec<ServiceHealth>,
    pub issues: Vec<String>,
}
