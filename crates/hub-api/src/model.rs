//! Request and response bodies that are specific to the HTTP surface.
//! Message and event bodies reuse the shared types from `hub-common`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::{IntoParams, ToSchema};

use hub_common::{InstanceHealth, PublishRequest, SendRequest};
use hub_router::{
    CircuitBreakerStats, CommitReport, Dependency, InstanceRegistration, InstanceView, PushSubscription,
    TransactionView,
};

// ============================================================================
// Health
// ============================================================================

/// Simple health response for basic health check
#[derive(Debug, Serialize, ToSchema)]
pub struct SimpleHealthResponse {
    /// Health status: UP, DEGRADED
    pub status: String,
    /// Application version
    pub version: String,
}

/// Kubernetes probe response
#[derive(Debug, Serialize, ToSchema)]
pub struct ProbeResponse {
    /// Probe status: LIVE, READY, NOT_READY
    pub status: String,
}

// ============================================================================
// Events
// ============================================================================

/// Range query over the event log
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EventRangeQuery {
    /// First sequence number, inclusive
    pub from: u64,
    /// Last sequence number, inclusive; defaults to `from + limit - 1`
    pub to: Option<u64>,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_limit() -> u64 {
    100
}

pub const MAX_EVENT_RANGE: u64 = 1_000;

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DependencyRequest {
    pub service: String,
    /// Hard dependencies gate readiness; soft ones are informational
    #[serde(default = "default_hard")]
    pub hard: bool,
}

fn default_hard() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RegisterInstanceRequest {
    pub service: String,
    pub instance_id: String,
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyRequest>,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl RegisterInstanceRequest {
    pub fn into_registration(self) -> InstanceRegistration {
        let mut endpoints = self.endpoints.into_iter();
        let first = endpoints.next().unwrap_or_default();
        let mut registration = InstanceRegistration::new(self.service, self.instance_id, first);
        registration.endpoints.extend(endpoints);
        for dep in self.dependencies {
            registration = registration.with_dependency(if dep.hard {
                Dependency::hard(dep.service)
            } else {
                Dependency::soft(dep.service)
            });
        }
        if let Some(weight) = self.weight {
            registration = registration.with_weight(weight);
        }
        registration
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InstanceResponse {
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

impl From<InstanceView> for InstanceResponse {
    fn from(v: InstanceView) -> Self {
        Self {
            service: v.service,
            instance_id: v.instance_id,
            endpoints: v.endpoints,
            weight: v.weight,
            health: v.health,
            last_heartbeat: v.last_heartbeat,
            missed_heartbeats: v.missed_heartbeats,
            failure_rate: v.failure_rate,
            active_connections: v.active_connections,
        }
    }
}

// ============================================================================
// Circuits
// ============================================================================

#[derive(Debug, Serialize, ToSchema)]
pub struct CircuitResponse {
    pub destination: String,
    /// CLOSED, OPEN or HALF_OPEN
    pub state: String,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub reset_timeout_ms: u64,
    /// Held open by an operator
    pub forced: bool,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

impl From<CircuitBreakerStats> for CircuitResponse {
    fn from(s: CircuitBreakerStats) -> Self {
        Self {
            destination: s.destination,
            state: s.state.as_str().to_string(),
            failure_count: s.failure_count,
            last_failure_at: s.last_failure_at,
            opened_at: s.opened_at,
            reset_timeout_ms: s.reset_timeout_ms,
            forced: s.forced,
            total_successes: s.totals.successes,
            total_failures: s.totals.failures,
            total_rejections: s.totals.rejections,
        }
    }
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct BeginTransactionRequest {
    /// Services that must acknowledge before the commit goes through
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BeginTransactionResponse {
    pub txn_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StagedResponse {
    pub txn_id: String,
    /// Id of the staged message or event
    pub id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ParticipantRequest {
    pub participant: String,
    /// Failure reason; only read by the fail endpoint
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RollbackRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TransactionResponse {
    pub txn_id: String,
    /// open, committed or rolled_back
    pub status: String,
    pub participants: Vec<String>,
    pub acked: Vec<String>,
    pub failed: BTreeMap<String, String>,
    pub operations: usize,
    pub opened_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<TransactionView> for TransactionResponse {
    fn from(v: TransactionView) -> Self {
        let status = serde_json::to_value(v.status)
            .ok()
            .and_then(|s| s.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            txn_id: v.txn_id,
            status,
            participants: v.participants,
            acked: v.acked,
            failed: v.failed,
            operations: v.operations,
            opened_at: v.opened_at,
            reason: v.reason,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CommitResponse {
    pub txn_id: String,
    pub operations: usize,
    pub message_ids: Vec<String>,
    pub event_ids: Vec<String>,
}

impl From<CommitReport> for CommitResponse {
    fn from(r: CommitReport) -> Self {
        Self {
            txn_id: r.txn_id,
            operations: r.operations,
            message_ids: r.message_ids,
            event_ids: r.event_ids,
        }
    }
}

// ============================================================================
// Push subscriptions
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct PushSubscriptionRequest {
    /// Glob patterns over event types, e.g. `character.*`
    pub patterns: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PushSubscriptionResponse {
    pub service: String,
    pub patterns: Vec<String>,
}

impl From<PushSubscription> for PushSubscriptionResponse {
    fn from(s: PushSubscription) -> Self {
        Self {
            patterns: s.patterns().to_vec(),
            service: s.service,
        }
    }
}

/// Bodies accepted by the staging endpoints
pub type StageSendRequest = SendRequest;
pub type StagePublishRequest = PublishRequest;
