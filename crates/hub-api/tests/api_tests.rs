//! HTTP API tests
//!
//! Drives the router in-process with `tower::ServiceExt::oneshot` and checks
//! status codes and bodies for each endpoint group.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use hub_api::create_router;
use hub_common::{MediationOutcome, Message};
use hub_config::HubConfig;
use hub_router::{DeliveryTarget, Hub, Mediator};

struct CountingMediator {
    calls: AtomicU32,
}

#[async_trait]
impl Mediator for CountingMediator {
    async fn deliver(&self, _message: &Message, _target: &DeliveryTarget) -> MediationOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        MediationOutcome::success()
    }
}

struct TestApp {
    router: Router,
    hub: Arc<Hub>,
    _dir: tempfile::TempDir,
}

async fn app_with(configure: impl FnOnce(&mut HubConfig)) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = HubConfig::default();
    config.store.data_dir = dir.path().to_path_buf();
    config.store.fsync = false;
    config.router.idle_poll_ms = 10;
    config.retry.base_delay_ms = 10;
    config.retry.jitter_fraction = 0.0;
    configure(&mut config);

    let mediator = Arc::new(CountingMediator {
        calls: AtomicU32::new(0),
    });
    let hub = Hub::open(config, mediator).await.unwrap();
    TestApp {
        router: create_router(hub.clone(), None),
        hub,
        _dir: dir,
    }
}

async fn app() -> TestApp {
    app_with(|_| {}).await
}

async fn call(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn send_body(id: &str) -> Value {
    json!({
        "id": id,
        "type": "image.render",
        "source": "campaign",
        "destination": "image",
        "payload": { "prompt": "a dragon" }
    })
}

async fn register_image(app: &TestApp) {
    let (status, _) = call(
        app,
        Method::POST,
        "/registry/instances",
        Some(json!({
            "service": "image",
            "instance_id": "image-1",
            "endpoints": ["http://image-1.local"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let app = app().await;

    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "UP");

    let (status, body) = call(&app, Method::GET, "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "LIVE");

    let (status, body) = call(&app, Method::GET, "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "READY");

    let (status, body) = call(&app, Method::GET, "/monitoring/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "HEALTHY");
}

#[tokio::test]
async fn test_openapi_document_lists_paths() {
    let app = app().await;
    let (status, body) = call(&app, Method::GET, "/api-doc/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/messages"].is_object());
    assert!(body["paths"]["/transactions/{txn_id}/commit"].is_object());
}

// ============================================================================
// Messages
// ============================================================================

#[tokio::test]
async fn test_send_then_status() {
    let app = app().await;
    register_image(&app).await;

    let (status, body) = call(&app, Method::POST, "/messages", Some(send_body("m-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["id"], "m-1");
    assert_eq!(body["status"], "accepted");

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let (status, body) = call(&app, Method::GET, "/messages/m-1", None).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == "delivered" {
            assert_eq!(body["delivery_attempts"], 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "never delivered: {}", body);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_invalid_send_is_rejected_with_400() {
    let app = app().await;
    let mut body = send_body("m-bad");
    body["destination"] = json!("");

    let (status, body) = call(&app, Method::POST, "/messages", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "rejected");
    assert!(body["reason"].as_str().unwrap().contains("validation"));
    assert_eq!(app.hub.store().head(), 0);
}

#[tokio::test]
async fn test_unknown_message_is_404() {
    let app = app().await;
    let (status, body) = call(&app, Method::GET, "/messages/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_publish_and_read_range() {
    let app = app().await;

    for i in 0..3 {
        let (status, body) = call(
            &app,
            Method::POST,
            "/events",
            Some(json!({
                "source": "campaign",
                "event_type": "character.created",
                "payload": { "n": i }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["fan_out"], 0);
    }

    let (status, body) = call(&app, Method::GET, "/events?from=1&limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["payload"]["n"], 0);
    assert_eq!(events[1]["payload"]["n"], 1);
}

#[tokio::test]
async fn test_reserved_event_type_is_400() {
    let app = app().await;
    let (status, body) = call(
        &app,
        Method::POST,
        "/events",
        Some(json!({
            "source": "campaign",
            "event_type": "hub.internal",
            "payload": {}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
}

// ============================================================================
// Registry and circuits
// ============================================================================

#[tokio::test]
async fn test_registry_lifecycle() {
    let app = app().await;
    register_image(&app).await;

    let (status, body) = call(&app, Method::GET, "/registry", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["health"], "healthy");

    let (status, _) = call(
        &app,
        Method::POST,
        "/registry/instances/image/image-1/heartbeat",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, Method::GET, "/registry/image/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);

    let (status, _) = call(&app, Method::DELETE, "/registry/instances/image/image-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&app, Method::DELETE, "/registry/instances/image/image-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_circuit_force_open_and_close() {
    let app = app().await;

    let (status, _) = call(&app, Method::GET, "/circuits/image", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, Method::POST, "/circuits/image/open", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "OPEN");
    assert_eq!(body["forced"], true);

    let (status, body) = call(&app, Method::POST, "/circuits/image/close", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "CLOSED");
    assert_eq!(body["forced"], false);

    let (_, body) = call(&app, Method::GET, "/circuits", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn test_transaction_commit_requires_acks() {
    let app = app().await;
    register_image(&app).await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/transactions",
        Some(json!({ "participants": ["billing"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let txn_id = body["txn_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/transactions/{}/messages", txn_id),
        Some(send_body("t-1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "t-1");

    // Staged messages are invisible until commit
    let (status, _) = call(&app, Method::GET, "/messages/t-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let commit = format!("/transactions/{}/commit", txn_id);
    let (status, body) = call(&app, Method::POST, &commit, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "TRANSACTION_STATE");

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/transactions/{}/ack", txn_id),
        Some(json!({ "participant": "billing" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["acked"][0], "billing");

    let (status, body) = call(&app, Method::POST, &commit, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["operations"], 1);
    assert_eq!(body["message_ids"][0], "t-1");

    let (status, body) = call(&app, Method::GET, &format!("/transactions/{}", txn_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "committed");
}

#[tokio::test]
async fn test_transaction_rollback_without_body() {
    let app = app().await;
    let (_, body) = call(&app, Method::POST, "/transactions", Some(json!({}))).await;
    let txn_id = body["txn_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/transactions/{}/rollback", txn_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "rolled_back");

    let (status, _) = call(&app, Method::POST, &format!("/transactions/{}/commit", txn_id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// ============================================================================
// Push subscriptions
// ============================================================================

#[tokio::test]
async fn test_push_subscription_fans_out_publish() {
    let app = app().await;
    register_image(&app).await;

    let (status, body) = call(
        &app,
        Method::PUT,
        "/subscriptions/image",
        Some(json!({ "patterns": ["character.*"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "image");

    let (status, body) = call(
        &app,
        Method::POST,
        "/events",
        Some(json!({
            "source": "campaign",
            "event_type": "character.created",
            "payload": {}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["fan_out"], 1);

    let (_, body) = call(&app, Method::GET, "/subscriptions", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = call(&app, Method::DELETE, "/subscriptions/image", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::DELETE, "/subscriptions/image", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_full_is_429() {
    let app = app_with(|config| {
        config.queue.capacity_per_level = 1;
        // One dequeue per window; everything after the first stays queued
        config.queue.quota_max_dequeues = Some(1);
        config.queue.quota_window_ms = 600_000;
    })
    .await;

    let mut last = StatusCode::ACCEPTED;
    for i in 0..5 {
        let (status, _) = call(&app, Method::POST, "/messages", Some(send_body(&format!("q-{}", i)))).await;
        last = status;
        if status != StatusCode::ACCEPTED {
            break;
        }
    }
    assert_eq!(last, StatusCode::TOO_MANY_REQUESTS);
}
