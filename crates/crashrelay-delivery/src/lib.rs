//! Crashrelay Delivery - Getting telemetry to the ingestion endpoint
//!
//! Provides:
//! - [`http`] - `reqwest` transport for serialized envelopes
//! - [`rate_limit`] - Per-category rate limits from response headers
//! - [`service`] - Send-or-queue delivery path and the background flush
//! - [`sessions`] - Crash-aware session lifecycle
//! - [`anr`] - Hang detection from subordinate status reports
//! - [`coordinator`] - Orchestration of dumps, scope, sessions and the
//!   messages subordinate processes send

pub mod anr;
pub mod coordinator;
pub mod http;
pub mod rate_limit;
pub mod service;
pub mod sessions;

use std::time::Duration;

use crashrelay_core::domain::DomainError;
use thiserror::Error;

pub use anr::{AnrMonitor, Hang};
pub use coordinator::Coordinator;
pub use http::HttpTransport;
pub use rate_limit::RateLimits;
pub use service::DeliveryService;
pub use sessions::SessionManager;

/// Outcome of a failed delivery attempt
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Every category in the envelope is currently rate limited
    #[error("Rate limited for {categories:?}, retry after {retry_after:?}")]
    RateLimited {
        categories: Vec<String>,
        retry_after: Duration,
    },

    /// No DSN is configured
    #[error("Delivery disabled")]
    Disabled,

    /// The request produced no response
    #[error("Network error: {0}")]
    Network(String),

    /// The endpoint failed (5xx)
    #[error("Server error: HTTP {0}")]
    Server(u16),

    /// The endpoint refused the envelope (4xx other than 429)
    #[error("Envelope rejected: HTTP {0}")]
    Rejected(u16),

    #[error("Envelope encoding failed: {0}")]
    Encoding(#[from] DomainError),
}

impl DeliveryError {
    /// Returns true if the envelope should go to the offline queue
    pub fn should_queue(&self) -> bool {
        matches!(self, DeliveryError::Network(_) | DeliveryError::Server(_))
    }
}
