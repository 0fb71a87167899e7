//! Shared helpers for the ingestion-endpoint integration tests
//!
//! Each helper starts a wiremock server playing the envelope endpoint of
//! project `42` and returns transports and services pointed at it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use crashrelay_core::domain::{Dsn, Envelope, ProcessId};
use crashrelay_core::ports::IProcessHost;
use crashrelay_delivery::{DeliveryService, HttpTransport};
use crashrelay_store::{OfflineQueue, QueueLimits};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ENVELOPE_PATH: &str = "/api/42/envelope/";
pub const PUBLIC_KEY: &str = "testkey";

/// DSN pointing at the mock server
pub fn dsn_for(server: &MockServer) -> String {
    let uri = server.uri();
    let host = uri.trim_start_matches("http://");
    format!("http://{PUBLIC_KEY}@{host}/42")
}

/// Starts a mock server and a transport posting to it
pub async fn setup_ingest_mock() -> (MockServer, Arc<HttpTransport>) {
    let server = MockServer::start().await;
    let dsn = Dsn::parse(&dsn_for(&server)).expect("mock DSN should parse");
    let transport = HttpTransport::new(&dsn).expect("transport should build");
    (server, Arc::new(transport))
}

/// Mounts an envelope endpoint answering every request with `status`
pub async fn mount_envelope_status(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path(ENVELOPE_PATH))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Delivery service with an offline queue under `dir`
pub fn delivery_service(transport: Arc<HttpTransport>, dir: &Path) -> Arc<DeliveryService> {
    let queue = Arc::new(OfflineQueue::new(dir.join("queue"), QueueLimits::default()));
    Arc::new(DeliveryService::new(Some(transport), queue))
}

/// Envelopes received by the mock server, decoded
pub async fn received_envelopes(server: &MockServer) -> Vec<Envelope> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| Envelope::parse(&request.body).expect("body should be an envelope"))
        .collect()
}

/// Host with no subordinate processes
pub struct EmptyHost;

#[async_trait]
impl IProcessHost for EmptyHost {
    async fn live_processes(&self) -> Vec<ProcessId> {
        Vec::new()
    }

    async fn query_identifier(&self, _pid: ProcessId) -> Option<String> {
        None
    }

    async fn process_name(&self, _pid: ProcessId) -> String {
        "unknown".to_string()
    }
}
