//! HTTP envelope transport
//!
//! Posts serialized envelopes to the DSN's envelope endpoint with the
//! `X-Sentry-Auth` header. Rate-limit headers are passed back untouched for
//! [`crate::rate_limit::RateLimits`] to interpret.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use crashrelay_core::domain::event::{SDK_NAME, SDK_VERSION};
use crashrelay_core::domain::Dsn;
use crashrelay_core::ports::{IEnvelopeTransport, TransportResponse};
use reqwest::Client;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ENVELOPE_CONTENT_TYPE: &str = "application/x-sentry-envelope";

/// `reqwest`-backed [`IEnvelopeTransport`]
pub struct HttpTransport {
    client: Client,
    url: String,
    auth: String,
}

impl HttpTransport {
    pub fn new(dsn: &Dsn) -> Result<Self> {
        Self::with_url(dsn.envelope_url(), dsn.public_key())
    }

    /// Creates a transport posting to an explicit URL (useful for testing)
    pub fn with_url(url: impl Into<String>, public_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("{SDK_NAME}/{SDK_VERSION}"))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            auth: format!(
                "Sentry sentry_version=7, sentry_key={public_key}, sentry_client={SDK_NAME}/{SDK_VERSION}"
            ),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IEnvelopeTransport for HttpTransport {
    async fn send(&self, body: Vec<u8>) -> Result<TransportResponse> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, ENVELOPE_CONTENT_TYPE)
            .header("X-Sentry-Auth", &self.auth)
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let result = TransportResponse {
            status: response.status().as_u16(),
            rate_limits: header("x-sentry-rate-limits"),
            retry_after: header("retry-after"),
        };
        debug!(status = result.status, "Envelope posted");
        Ok(result)
    }
}
