//! Subordinate-side channel strategy
//!
//! The binding is chosen once, when the subordinate connects, and every
//! later send goes through the same [`IpcChannel`].

use std::time::Duration;

use async_trait::async_trait;
use crashrelay_core::config::IpcConfig;
use tracing::debug;

use crate::direct::DirectClient;
use crate::fallback::FallbackClient;
use crate::message::IpcMessage;
use crate::registry::Binding;
use crate::IpcError;

#[async_trait]
pub trait IpcChannel: Send + Sync {
    fn binding(&self) -> Binding;

    /// Handshake; the only call that waits for the coordinator
    async fn start(&self) -> Result<(), IpcError>;

    async fn send(&self, message: &IpcMessage) -> Result<(), IpcError>;
}

#[async_trait]
impl IpcChannel for DirectClient {
    fn binding(&self) -> Binding {
        Binding::Direct
    }

    async fn start(&self) -> Result<(), IpcError> {
        DirectClient::start(self).await
    }

    async fn send(&self, message: &IpcMessage) -> Result<(), IpcError> {
        DirectClient::send(self, message).await
    }
}

#[async_trait]
impl IpcChannel for FallbackClient {
    fn binding(&self) -> Binding {
        Binding::Fallback
    }

    async fn start(&self) -> Result<(), IpcError> {
        FallbackClient::send(self, &IpcMessage::Start).await
    }

    async fn send(&self, message: &IpcMessage) -> Result<(), IpcError> {
        FallbackClient::send(self, message).await
    }
}

/// Picks the binding for this process from the configured mode.
///
/// With both bindings enabled the direct channel is tried first and the
/// fallback is used when the socket cannot be reached.
pub async fn connect(config: &IpcConfig, token: Option<String>) -> Result<Box<dyn IpcChannel>, IpcError> {
    if config.mode.direct_enabled() {
        let timeout = Duration::from_millis(config.handshake_timeout_ms);
        match DirectClient::connect(&config.socket_path, timeout).await {
            Ok(client) => return Ok(Box::new(client)),
            Err(e) if config.mode.fallback_enabled() => {
                debug!(error = %e, "Direct channel unavailable, using fallback");
            }
            Err(e) => return Err(IpcError::Unavailable(e.to_string())),
        }
    }

    Ok(Box::new(FallbackClient::new(
        &config.fallback_addr,
        &config.namespace,
        token,
    )))
}
