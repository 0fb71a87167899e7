//! Outbound envelope transport port

use async_trait::async_trait;

/// What the ingestion endpoint answered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Raw `X-Sentry-Rate-Limits` header
    pub rate_limits: Option<String>,
    /// Raw `Retry-After` header
    pub retry_after: Option<String>,
}

impl TransportResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends serialized envelopes to the remote endpoint.
///
/// An `Err` means the request never produced a response (connection refused,
/// timeout, DNS); every HTTP status is reported through [`TransportResponse`].
#[async_trait]
pub trait IEnvelopeTransport: Send + Sync {
    async fn send(&self, body: Vec<u8>) -> anyhow::Result<TransportResponse>;
}
