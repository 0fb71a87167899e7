//! HTTP transport against a mock ingestion endpoint

use std::time::Duration;

use crashrelay_core::domain::Envelope;
use crashrelay_core::ports::IEnvelopeTransport;
use crashrelay_delivery::DeliveryError;
use serde_json::json;
use wiremock::matchers::{header, header_regex, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

fn error_envelope() -> Envelope {
    Envelope::from_event(json!({"message": "boom"}), &[])
}

#[tokio::test]
async fn test_posts_envelope_with_auth_header() {
    let (server, transport) = common::setup_ingest_mock().await;

    Mock::given(method("POST"))
        .and(path(common::ENVELOPE_PATH))
        .and(header("content-type", "application/x-sentry-envelope"))
        .and(header_regex("x-sentry-auth", "sentry_key=testkey"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let body = error_envelope().to_bytes().unwrap();
    let response = transport.send(body).await.expect("send failed");
    assert!(response.is_success());

    let received = common::received_envelopes(&server).await;
    assert_eq!(received[0].items[0].payload_json().unwrap()["message"], "boom");
}

#[tokio::test]
async fn test_returns_rate_limit_headers() {
    let (server, transport) = common::setup_ingest_mock().await;

    Mock::given(method("POST"))
        .and(path(common::ENVELOPE_PATH))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-sentry-rate-limits", "60:error:organization")
                .insert_header("retry-after", "60"),
        )
        .mount(&server)
        .await;

    let response = transport
        .send(error_envelope().to_bytes().unwrap())
        .await
        .unwrap();
    assert_eq!(response.status, 429);
    assert_eq!(response.rate_limits.as_deref(), Some("60:error:organization"));
    assert_eq!(response.retry_after.as_deref(), Some("60"));
}

#[tokio::test]
async fn test_rate_limited_category_is_not_sent_again() {
    let (server, transport) = common::setup_ingest_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let delivery = common::delivery_service(transport, dir.path());

    Mock::given(method("POST"))
        .and(path(common::ENVELOPE_PATH))
        .respond_with(
            ResponseTemplate::new(429).insert_header("x-sentry-rate-limits", "120:error:key"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let first = delivery.send(error_envelope()).await;
    assert!(matches!(first, Err(DeliveryError::RateLimited { .. })));

    let second = delivery.send(error_envelope()).await;
    match second {
        Err(DeliveryError::RateLimited { retry_after, .. }) => {
            assert!(retry_after > Duration::from_secs(100));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert!(delivery.queue().is_empty().await);
}

#[tokio::test]
async fn test_rejected_envelope_is_dropped() {
    let (server, transport) = common::setup_ingest_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let delivery = common::delivery_service(transport, dir.path());
    common::mount_envelope_status(&server, 400).await;

    let result = delivery.send(error_envelope()).await;
    assert!(matches!(result, Err(DeliveryError::Rejected(400))));
    assert!(delivery.queue().is_empty().await);
}
