//! Message Hub API
//!
//! HTTP API endpoints for:
//! - Sending messages and publishing events
//! - Message status and out-of-band acknowledgement
//! - Transactions
//! - Service registry and circuit breakers
//! - Push subscriptions
//! - Health, Kubernetes probes and Prometheus metrics
//!
//! Callers are trusted as pre-validated; an `x-caller-id` header is only
//! logged.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use utoipa::OpenApi;

use hub_common::{
    AcceptStatus, Event, HealthReport, HealthStatus, MessageStatusView, PublishRequest, PublishResponse,
    SendRequest, SendResponse, ServiceHealth,
};
use hub_router::{Hub, HubError};

pub mod error;
pub mod model;

pub use error::{ApiError, ApiResult, ErrorResponse};
use model::*;

const CALLER_HEADER: &str = "x-caller-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    /// Renders `/metrics`; absent when no recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

/// Create the full router with all endpoints
pub fn create_router(hub: Arc<Hub>, metrics: Option<PrometheusHandle>) -> Router {
    let state = AppState { hub, metrics };

    Router::new()
        // Health
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/monitoring/health", get(health_report_handler))
        .route("/metrics", get(metrics_handler))
        // Messages
        .route("/messages", post(send_message))
        .route("/messages/:id", get(message_status))
        .route("/messages/:id/ack", post(acknowledge_message))
        // Events
        .route("/events", post(publish_event).get(read_events))
        // Transactions
        .route("/transactions", post(begin_transaction))
        .route("/transactions/:txn_id", get(transaction_status))
        .route("/transactions/:txn_id/messages", post(stage_message))
        .route("/transactions/:txn_id/events", post(stage_event))
        .route("/transactions/:txn_id/ack", post(ack_transaction))
        .route("/transactions/:txn_id/fail", post(fail_transaction))
        .route("/transactions/:txn_id/commit", post(commit_transaction))
        .route("/transactions/:txn_id/rollback", post(rollback_transaction))
        // Registry
        .route("/registry", get(list_instances))
        .route("/registry/instances", post(register_instance))
        .route("/registry/instances/:service/:instance_id", delete(deregister_instance))
        .route("/registry/instances/:service/:instance_id/heartbeat", post(heartbeat))
        .route("/registry/:service/health", get(service_health))
        // Circuits
        .route("/circuits", get(list_circuits))
        .route("/circuits/:destination", get(get_circuit))
        .route("/circuits/:destination/open", post(open_circuit))
        .route("/circuits/:destination/close", post(close_circuit))
        // Push subscriptions
        .route("/subscriptions", get(list_subscriptions))
        .route(
            "/subscriptions/:service",
            put(put_subscription).delete(delete_subscription),
        )
        // OpenAPI document
        .route("/api-doc/openapi.json", get(openapi_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn caller(headers: &HeaderMap) -> &str {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
}

// ============================================================================
// Health Endpoints
// ============================================================================

/// Health check endpoint
#[utoipa::path(get, path = "/health", tag = "health",
    responses((status = 200, description = "Service status", body = SimpleHealthResponse)))]
async fn health_handler(State(state): State<AppState>) -> Json<SimpleHealthResponse> {
    let status = match state.hub.health_report().status {
        HealthStatus::Healthy | HealthStatus::Warning => "UP",
        HealthStatus::Degraded => "DEGRADED",
    };
    Json(SimpleHealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Kubernetes liveness probe - returns 200 if the process is running
#[utoipa::path(get, path = "/health/live", tag = "health",
    responses((status = 200, description = "Process is alive", body = ProbeResponse)))]
async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse { status: "LIVE".to_string() })
}

/// Kubernetes readiness probe - returns 200 while the store accepts writes
#[utoipa::path(get, path = "/health/ready", tag = "health",
    responses(
        (status = 200, description = "Ready for traffic", body = ProbeResponse),
        (status = 503, description = "Not ready", body = ProbeResponse)
    ))]
async fn readiness_probe(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    let report = state.hub.health_report();
    if state.hub.is_ready() && report.status != HealthStatus::Degraded {
        (StatusCode::OK, Json(ProbeResponse { status: "READY".to_string() }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse { status: "NOT_READY".to_string() }),
        )
    }
}

/// Detailed health report
#[utoipa::path(get, path = "/monitoring/health", tag = "health",
    responses((status = 200, description = "Health report", body = HealthReport)))]
async fn health_report_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.hub.health_report())
}

/// Prometheus metrics endpoint
#[utoipa::path(get, path = "/metrics", tag = "monitoring",
    responses((status = 200, description = "Prometheus text exposition")))]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.as_ref().map(|h| h.render()).unwrap_or_default();
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ============================================================================
// Messages
// ============================================================================

/// Send a point-to-point message
#[utoipa::path(post, path = "/messages", tag = "messages",
    request_body = SendRequest,
    responses(
        (status = 202, description = "Accepted for delivery", body = SendResponse),
        (status = 400, description = "Rejected by validation", body = SendResponse),
        (status = 429, description = "Queue full", body = SendResponse),
        (status = 500, description = "Persistence failure", body = ErrorResponse)
    ))]
async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> ApiResult<(StatusCode, Json<SendResponse>)> {
    debug!(
        caller = %caller(&headers),
        message_type = %request.message_type,
        destination = %request.destination,
        "Send request"
    );
    let requested_id = request.id.clone().unwrap_or_default();
    match state.hub.send(request).await {
        Ok(response) => Ok((StatusCode::ACCEPTED, Json(response))),
        Err(e @ (HubError::Validation(_) | HubError::QueueFull { .. })) => {
            let (status, _) = error::classify(&e);
            Ok((
                status,
                Json(SendResponse {
                    id: requested_id,
                    status: AcceptStatus::Rejected,
                    reason: Some(e.to_string()),
                }),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

/// Delivery status of a message
#[utoipa::path(get, path = "/messages/{id}", tag = "messages",
    params(("id" = String, Path, description = "Message id")),
    responses(
        (status = 200, description = "Current status", body = MessageStatusView),
        (status = 404, description = "Unknown message", body = ErrorResponse)
    ))]
async fn message_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageStatusView>> {
    Ok(Json(state.hub.status(&id)?))
}

/// Acknowledge a message out of band; pending retries are cancelled
#[utoipa::path(post, path = "/messages/{id}/ack", tag = "messages",
    params(("id" = String, Path, description = "Message id")),
    responses(
        (status = 200, description = "Status after acknowledgement", body = MessageStatusView),
        (status = 404, description = "Unknown message", body = ErrorResponse)
    ))]
async fn acknowledge_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageStatusView>> {
    Ok(Json(state.hub.acknowledge(&id).await?))
}

// ============================================================================
// Events
// ============================================================================

/// Publish an event; matching push subscriptions receive a delivery each
#[utoipa::path(post, path = "/events", tag = "events",
    request_body = PublishRequest,
    responses(
        (status = 202, description = "Persisted", body = PublishResponse),
        (status = 400, description = "Rejected by validation", body = ErrorResponse)
    ))]
async fn publish_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> ApiResult<(StatusCode, Json<PublishResponse>)> {
    debug!(caller = %caller(&headers), event_type = %request.event_type, "Publish request");
    let response = state.hub.publish(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Read a range of the event log
#[utoipa::path(get, path = "/events", tag = "events",
    params(EventRangeQuery),
    responses(
        (status = 200, description = "Events in sequence order", body = Vec<Event>),
        (status = 400, description = "Range starts in a compacted segment", body = ErrorResponse)
    ))]
async fn read_events(
    State(state): State<AppState>,
    Query(query): Query<EventRangeQuery>,
) -> ApiResult<Json<Vec<Event>>> {
    let limit = query.limit.clamp(1, MAX_EVENT_RANGE);
    let to = query
        .to
        .unwrap_or_else(|| query.from.saturating_add(limit - 1))
        .min(query.from.saturating_add(limit - 1));
    let events = state.hub.read_range(query.from, to).map_err(|e| match e {
        HubError::Persistence(hub_store::StoreError::Compacted { .. }) => HubError::validation(e.to_string()),
        other => other,
    })?;
    Ok(Json(events))
}

// ============================================================================
// Transactions
// ============================================================================

/// Open a transaction
#[utoipa::path(post, path = "/transactions", tag = "transactions",
    request_body = BeginTransactionRequest,
    responses((status = 201, description = "Transaction opened", body = BeginTransactionResponse)))]
async fn begin_transaction(
    State(state): State<AppState>,
    Json(request): Json<BeginTransactionRequest>,
) -> ApiResult<(StatusCode, Json<BeginTransactionResponse>)> {
    let txn_id = state.hub.begin(request.participants).await?;
    Ok((StatusCode::CREATED, Json(BeginTransactionResponse { txn_id })))
}

#[utoipa::path(get, path = "/transactions/{txn_id}", tag = "transactions",
    params(("txn_id" = String, Path, description = "Transaction id")),
    responses(
        (status = 200, description = "Transaction state", body = TransactionResponse),
        (status = 404, description = "Unknown transaction", body = ErrorResponse)
    ))]
async fn transaction_status(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
) -> ApiResult<Json<TransactionResponse>> {
    Ok(Json(state.hub.transaction_status(&txn_id).await?.into()))
}

/// Stage a send inside a transaction
#[utoipa::path(post, path = "/transactions/{txn_id}/messages", tag = "transactions",
    params(("txn_id" = String, Path, description = "Transaction id")),
    request_body = SendRequest,
    responses((status = 200, description = "Staged", body = StagedResponse)))]
async fn stage_message(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
    Json(request): Json<StageSendRequest>,
) -> ApiResult<Json<StagedResponse>> {
    let id = state.hub.stage_send(&txn_id, request).await?;
    Ok(Json(StagedResponse { txn_id, id }))
}

/// Stage a publish inside a transaction
#[utoipa::path(post, path = "/transactions/{txn_id}/events", tag = "transactions",
    params(("txn_id" = String, Path, description = "Transaction id")),
    request_body = PublishRequest,
    responses((status = 200, description = "Staged", body = StagedResponse)))]
async fn stage_event(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
    Json(request): Json<StagePublishRequest>,
) -> ApiResult<Json<StagedResponse>> {
    let id = state.hub.stage_publish(&txn_id, request).await?;
    Ok(Json(StagedResponse { txn_id, id }))
}

#[utoipa::path(post, path = "/transactions/{txn_id}/ack", tag = "transactions",
    params(("txn_id" = String, Path, description = "Transaction id")),
    request_body = ParticipantRequest,
    responses((status = 200, description = "Participant ready", body = TransactionResponse)))]
async fn ack_transaction(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
    Json(request): Json<ParticipantRequest>,
) -> ApiResult<Json<TransactionResponse>> {
    Ok(Json(state.hub.ack(&txn_id, &request.participant).await?.into()))
}

#[utoipa::path(post, path = "/transactions/{txn_id}/fail", tag = "transactions",
    params(("txn_id" = String, Path, description = "Transaction id")),
    request_body = ParticipantRequest,
    responses((status = 200, description = "Participant failure recorded", body = TransactionResponse)))]
async fn fail_transaction(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
    Json(request): Json<ParticipantRequest>,
) -> ApiResult<Json<TransactionResponse>> {
    let reason = request.reason.as_deref().unwrap_or("unspecified");
    Ok(Json(state.hub.fail(&txn_id, &request.participant, reason).await?.into()))
}

#[utoipa::path(post, path = "/transactions/{txn_id}/commit", tag = "transactions",
    params(("txn_id" = String, Path, description = "Transaction id")),
    responses(
        (status = 200, description = "Committed", body = CommitResponse),
        (status = 409, description = "Not committable", body = ErrorResponse)
    ))]
async fn commit_transaction(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
) -> ApiResult<Json<CommitResponse>> {
    let report = state.hub.commit(&txn_id).await?;
    info!(txn_id = %txn_id, operations = report.operations, "Transaction committed via API");
    Ok(Json(report.into()))
}

#[utoipa::path(post, path = "/transactions/{txn_id}/rollback", tag = "transactions",
    params(("txn_id" = String, Path, description = "Transaction id")),
    request_body = RollbackRequest,
    responses((status = 200, description = "Rolled back", body = TransactionResponse)))]
async fn rollback_transaction(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
    request: Option<Json<RollbackRequest>>,
) -> ApiResult<Json<TransactionResponse>> {
    let reason = request
        .and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "requested".to_string());
    Ok(Json(state.hub.rollback(&txn_id, &reason).await?.into()))
}

// ============================================================================
// Registry
// ============================================================================

#[utoipa::path(get, path = "/registry", tag = "registry",
    responses((status = 200, description = "All registered instances", body = Vec<InstanceResponse>)))]
async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceResponse>> {
    Json(state.hub.instances().into_iter().map(InstanceResponse::from).collect())
}

#[utoipa::path(post, path = "/registry/instances", tag = "registry",
    request_body = RegisterInstanceRequest,
    responses(
        (status = 201, description = "Registered or refreshed", body = InstanceResponse),
        (status = 400, description = "Invalid registration or dependency cycle", body = ErrorResponse)
    ))]
async fn register_instance(
    State(state): State<AppState>,
    Json(request): Json<RegisterInstanceRequest>,
) -> ApiResult<(StatusCode, Json<InstanceResponse>)> {
    let view = state.hub.register(request.into_registration())?;
    Ok((StatusCode::CREATED, Json(view.into())))
}

#[utoipa::path(delete, path = "/registry/instances/{service}/{instance_id}", tag = "registry",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance_id" = String, Path, description = "Instance id")
    ),
    responses(
        (status = 204, description = "Deregistered"),
        (status = 404, description = "Unknown instance", body = ErrorResponse)
    ))]
async fn deregister_instance(
    State(state): State<AppState>,
    Path((service, instance_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.hub.deregister(&service, &instance_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(post, path = "/registry/instances/{service}/{instance_id}/heartbeat", tag = "registry",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance_id" = String, Path, description = "Instance id")
    ),
    responses(
        (status = 200, description = "Heartbeat recorded", body = InstanceResponse),
        (status = 404, description = "Unknown instance", body = ErrorResponse)
    ))]
async fn heartbeat(
    State(state): State<AppState>,
    Path((service, instance_id)): Path<(String, String)>,
) -> ApiResult<Json<InstanceResponse>> {
    Ok(Json(state.hub.heartbeat(&service, &instance_id)?.into()))
}

#[utoipa::path(get, path = "/registry/{service}/health", tag = "registry",
    params(("service" = String, Path, description = "Service name")),
    responses(
        (status = 200, description = "Instance counts and readiness", body = ServiceHealth),
        (status = 404, description = "Unknown service", body = ErrorResponse)
    ))]
async fn service_health(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<Json<ServiceHealth>> {
    Ok(Json(state.hub.service_health(&service)?))
}

// ============================================================================
// Circuits
// ============================================================================

#[utoipa::path(get, path = "/circuits", tag = "circuits",
    responses((status = 200, description = "Every known circuit", body = Vec<CircuitResponse>)))]
async fn list_circuits(State(state): State<AppState>) -> Json<Vec<CircuitResponse>> {
    Json(state.hub.circuits().into_iter().map(CircuitResponse::from).collect())
}

#[utoipa::path(get, path = "/circuits/{destination}", tag = "circuits",
    params(("destination" = String, Path, description = "Destination service")),
    responses(
        (status = 200, description = "Circuit state", body = CircuitResponse),
        (status = 404, description = "No traffic seen for destination", body = ErrorResponse)
    ))]
async fn get_circuit(
    State(state): State<AppState>,
    Path(destination): Path<String>,
) -> ApiResult<Json<CircuitResponse>> {
    Ok(Json(state.hub.circuit(&destination)?.into()))
}

/// Hold a circuit open until it is closed again
#[utoipa::path(post, path = "/circuits/{destination}/open", tag = "circuits",
    params(("destination" = String, Path, description = "Destination service")),
    responses((status = 200, description = "Circuit forced open", body = CircuitResponse)))]
async fn open_circuit(
    State(state): State<AppState>,
    Path(destination): Path<String>,
) -> Json<CircuitResponse> {
    info!(destination = %destination, "Circuit forced open via API");
    Json(state.hub.force_open(&destination).into())
}

#[utoipa::path(post, path = "/circuits/{destination}/close", tag = "circuits",
    params(("destination" = String, Path, description = "Destination service")),
    responses((status = 200, description = "Circuit closed", body = CircuitResponse)))]
async fn close_circuit(
    State(state): State<AppState>,
    Path(destination): Path<String>,
) -> Json<CircuitResponse> {
    info!(destination = %destination, "Circuit forced closed via API");
    Json(state.hub.force_close(&destination).into())
}

// ============================================================================
// Push subscriptions
// ============================================================================

#[utoipa::path(get, path = "/subscriptions", tag = "subscriptions",
    responses((status = 200, description = "Push subscriptions", body = Vec<PushSubscriptionResponse>)))]
async fn list_subscriptions(State(state): State<AppState>) -> Json<Vec<PushSubscriptionResponse>> {
    Json(
        state
            .hub
            .push_subscriptions()
            .into_iter()
            .map(PushSubscriptionResponse::from)
            .collect(),
    )
}

/// Create or replace the push subscription of a service
#[utoipa::path(put, path = "/subscriptions/{service}", tag = "subscriptions",
    params(("service" = String, Path, description = "Subscribing service")),
    request_body = PushSubscriptionRequest,
    responses(
        (status = 200, description = "Subscription stored", body = PushSubscriptionResponse),
        (status = 400, description = "Invalid pattern", body = ErrorResponse)
    ))]
async fn put_subscription(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Json(request): Json<PushSubscriptionRequest>,
) -> ApiResult<Json<PushSubscriptionResponse>> {
    state.hub.add_push_subscription(&service, &request.patterns)?;
    Ok(Json(PushSubscriptionResponse {
        service,
        patterns: request.patterns,
    }))
}

#[utoipa::path(delete, path = "/subscriptions/{service}", tag = "subscriptions",
    params(("service" = String, Path, description = "Subscribing service")),
    responses(
        (status = 204, description = "Removed"),
        (status = 404, description = "No subscription for service", body = ErrorResponse)
    ))]
async fn delete_subscription(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<StatusCode> {
    if state.hub.remove_push_subscription(&service) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(HubError::not_found("subscription", service).into())
    }
}

// ============================================================================
// OpenAPI
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Message Hub API",
        description = "Messages, events, transactions, registry and circuit breakers"
    ),
    tags(
        (name = "messages", description = "Point-to-point messages"),
        (name = "events", description = "Published events and the event log"),
        (name = "transactions", description = "Atomic multi-message commits"),
        (name = "registry", description = "Service instances and heartbeats"),
        (name = "circuits", description = "Per-destination circuit breakers"),
        (name = "subscriptions", description = "Push subscriptions"),
        (name = "health", description = "Health and probes"),
        (name = "monitoring", description = "Metrics")
    ),
    paths(
        health_handler,
        liveness_probe,
        readiness_probe,
        health_report_handler,
        metrics_handler,
        send_message,
        message_status,
        acknowledge_message,
        publish_event,
        read_events,
        begin_transaction,
        transaction_status,
        stage_message,
        stage_event,
        ack_transaction,
        fail_transaction,
        commit_transaction,
        rollback_transaction,
        list_instances,
        register_instance,
        deregister_instance,
        heartbeat,
        service_health,
        list_circuits,
        get_circuit,
        open_circuit,
        close_circuit,
        list_subscriptions,
        put_subscription,
        delete_subscription,
    )
)]
pub struct ApiDoc;

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
