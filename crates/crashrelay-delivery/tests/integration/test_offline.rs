//! Send-or-queue behavior when the endpoint is unavailable

use std::time::Duration;

use crashrelay_core::domain::Envelope;
use crashrelay_delivery::DeliveryError;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

#[tokio::test]
async fn test_server_error_queues_and_flush_delivers() {
    let (server, transport) = common::setup_ingest_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let delivery = common::delivery_service(transport, dir.path());

    Mock::given(method("POST"))
        .and(path(common::ENVELOPE_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    common::mount_envelope_status(&server, 200).await;

    let envelope = Envelope::from_event(json!({"message": "offline"}), &[]);
    let result = delivery.send(envelope).await;
    assert!(matches!(result, Err(DeliveryError::Server(503))));
    assert_eq!(delivery.queue().len().await, 1);

    assert_eq!(delivery.flush_queue().await, 1);
    assert!(delivery.queue().is_empty().await);

    let received = common::received_envelopes(&server).await;
    assert_eq!(received.len(), 2);
    assert_eq!(received[1].items[0].payload_json().unwrap()["message"], "offline");
}

#[tokio::test]
async fn test_flush_stops_at_first_failure() {
    let (server, transport) = common::setup_ingest_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let delivery = common::delivery_service(transport, dir.path());
    common::mount_envelope_status(&server, 500).await;

    for i in 0..3 {
        let envelope = Envelope::from_event(json!({"message": format!("e{i}")}), &[]);
        let _ = delivery.send(envelope).await;
    }
    assert_eq!(delivery.queue().len().await, 3);

    assert_eq!(delivery.flush_queue().await, 0);
    assert_eq!(delivery.queue().len().await, 3);
    // three initial sends plus one flush attempt
    assert_eq!(common::received_envelopes(&server).await.len(), 4);
}

#[tokio::test]
async fn test_flush_loop_drains_at_startup() {
    let (server, transport) = common::setup_ingest_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let delivery = common::delivery_service(transport, dir.path());

    let envelope = Envelope::from_event(json!({"message": "left over"}), &[]);
    delivery.queue().insert(&envelope).await;
    common::mount_envelope_status(&server, 200).await;

    let shutdown = CancellationToken::new();
    let flusher = tokio::spawn(
        delivery
            .clone()
            .run_flush_loop(Duration::from_secs(3600), shutdown.clone()),
    );

    for _ in 0..50 {
        if delivery.queue().is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    flusher.await.unwrap();

    assert!(delivery.queue().is_empty().await);
    assert_eq!(common::received_envelopes(&server).await.len(), 1);
}
