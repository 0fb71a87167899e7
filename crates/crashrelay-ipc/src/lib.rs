//! Crashrelay IPC - Subordinate-to-coordinator transport
//!
//! Moves the six message kinds of [`message::MessageKind`] from subordinate
//! processes to the coordinator over one or both bindings:
//!
//! - **Direct channel**: length-delimited frames over a Unix socket, with a
//!   `start`/ack handshake ([`direct`])
//! - **Fallback channel**: `POST /{namespace}/{route}` requests on a loopback
//!   HTTP listener, attributed to a process by an identifier header
//!   ([`fallback`])
//!
//! Both bindings decode into [`IpcMessage`] and pass through a single
//! [`Dispatcher`], which applies the per-process binding policy of the
//! [`ProcessRegistry`] before handing the message to the coordinator.
//!
//! ## Key Components
//!
//! - [`IpcChannel`] - Subordinate-side sender, selected once from config
//! - [`RendererArena`] - Last-known url/title per process with a destroy
//!   grace period

use std::time::Duration;

pub mod channel;
pub mod direct;
pub mod dispatch;
pub mod fallback;
pub mod message;
pub mod registry;
pub mod renderers;

pub use channel::{connect, IpcChannel};
pub use direct::{DirectClient, DirectServer};
pub use dispatch::{Dispatcher, IMessageHandler};
pub use fallback::{FallbackClient, FallbackServer, PROCESS_HEADER};
pub use message::{IpcMessage, MessageKind, ProcessStatus, StatusReport};
pub use registry::{Binding, Origin, ProcessRegistry, RegisteredProcess, TokenResolver};
pub use renderers::{RendererArena, RendererRecord};

/// Pause after a failed `accept` before listening again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Unwraps an accepted connection, or logs the error and backs off
///
/// Accept failures such as `EMFILE` or `ECONNABORTED` are transient; the
/// listener stays up and the caller goes back to accepting.
pub(crate) async fn accepted<T>(result: std::io::Result<T>, binding: registry::Binding) -> Option<T> {
    match result {
        Ok(conn) => Some(conn),
        Err(e) => {
            tracing::warn!(binding = %binding, error = %e, "Accept failed, retrying");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

/// Errors raised by the inter-process transport
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Payload could not be decoded for its declared kind
    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: MessageKind, reason: String },

    /// Frame tag or route does not name a message kind
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    /// The coordinator did not acknowledge `start` in time
    #[error("Handshake not acknowledged within {0:?}")]
    HandshakeTimeout(Duration),

    /// The peer closed the connection
    #[error("Connection closed")]
    Closed,

    /// No binding could be established
    #[error("Coordinator unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
