//! Delivery of messages to destination instances
//!
//! The router only sees [`MediationOutcome`]s; how a message reaches an
//! instance is behind the [`Mediator`] trait. [`HttpMediator`] posts the
//! message as JSON to the instance endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info_span, warn, Instrument};

use hub_common::{MediationOutcome, Message};

/// Where a single delivery attempt goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub service: String,
    pub instance_id: String,
    pub endpoint: String,
}

#[async_trait]
pub trait Mediator: Send + Sync {
    /// Attempt one delivery. Failures are reported through the outcome,
    /// never as a panic or error.
    async fn deliver(&self, message: &Message, target: &DeliveryTarget) -> MediationOutcome;
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("message-hub/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

pub struct HttpMediator {
    client: reqwest::Client,
}

impl HttpMediator {
    pub fn new(config: HttpMediatorConfig) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn deliver(&self, message: &Message, target: &DeliveryTarget) -> MediationOutcome {
        let span = info_span!(
            "deliver",
            message_id = %message.id,
            destination = %target.service,
            instance_id = %target.instance_id,
            attempt = message.delivery_attempts
        );

        async move {
            let started = Instant::now();
            let response = self
                .client
                .post(&target.endpoint)
                .header("x-hub-message-id", &message.id)
                .header("x-hub-correlation-id", &message.correlation_id)
                .header("x-hub-message-type", &message.message_type)
                .header("x-hub-attempt", message.delivery_attempts.to_string())
                .json(message)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, elapsed_ms = started.elapsed().as_millis() as u64, "Delivery request failed");
                    if e.is_timeout() {
                        return MediationOutcome::error_connection(format!("timed out: {}", e));
                    }
                    return MediationOutcome::error_connection(e.to_string());
                }
            };

            let status = response.status().as_u16();
            debug!(status = status, elapsed_ms = started.elapsed().as_millis() as u64, "Received response");

            match status {
                200..=299 => MediationOutcome::success(),
                408 | 429 => MediationOutcome::error_process(Some(status), format!("HTTP {}", status)),
                400..=499 => {
                    let body = response.text().await.unwrap_or_default();
                    warn!(status = status, "Destination rejected message");
                    MediationOutcome::error_config(status, truncate(&body, 512))
                }
                _ => MediationOutcome::error_process(Some(status), format!("HTTP {}", status)),
            }
        }
        .instrument(span)
        .await
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hub_common::{MediationResult, MessageStatus, Priority};
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn message() -> Message {
        Message {
            id: "m-1".to_string(),
            message_type: "image.render".to_string(),
            source: "campaign".to_string(),
            destination: "image".to_string(),
            correlation_id: "req-1".to_string(),
            payload: json!({ "prompt": "a dragon" }),
            priority: Priority::High,
            ttl_ms: None,
            deadline: None,
            created_at: Utc::now(),
            delivery_attempts: 2,
            last_attempt_at: None,
            status: MessageStatus::Pending,
            dead_letter_reason: None,
            origin_event_id: None,
        }
    }

    fn target(server: &MockServer) -> DeliveryTarget {
        DeliveryTarget {
            service: "image".to_string(),
            instance_id: "image-1".to_string(),
            endpoint: format!("{}/deliver", server.uri()),
        }
    }

    fn mediator() -> HttpMediator {
        HttpMediator::new(HttpMediatorConfig {
            timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_carries_hub_headers() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/deliver"))
            .and(matchers::header("x-hub-message-id", "m-1"))
            .and(matchers::header("x-hub-correlation-id", "req-1"))
            .and(matchers::header("x-hub-attempt", "2"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = mediator().deliver(&message(), &target(&server)).await;
        assert_eq!(outcome.result, MediationResult::Success);
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("prompt too long"))
            .mount(&server)
            .await;

        let outcome = mediator().deliver(&message(), &target(&server)).await;
        assert_eq!(outcome.result, MediationResult::ErrorConfig);
        assert_eq!(outcome.status_code, Some(400));
        assert_eq!(outcome.error_message.as_deref(), Some("prompt too long"));
        assert!(!outcome.is_retryable());
    }

    #[tokio::test]
    async fn throttling_and_server_errors_are_retryable() {
        for status in [429u16, 408, 500, 503] {
            let server = MockServer::start().await;
            Mock::given(matchers::method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let outcome = mediator().deliver(&message(), &target(&server)).await;
            assert_eq!(outcome.result, MediationResult::ErrorProcess, "status {}", status);
            assert!(outcome.is_retryable());
        }
    }

    #[tokio::test]
    async fn slow_destination_times_out() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let outcome = mediator().deliver(&message(), &target(&server)).await;
        assert_eq!(outcome.result, MediationResult::ErrorConnection);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééé", 3), "é...");
    }
}
