//! Message dispatch shared by both bindings

use std::sync::Arc;

use async_trait::async_trait;
use crashrelay_core::ports::IProcessHost;
use tracing::trace;

use crate::message::{IpcMessage, MessageKind};
use crate::registry::{Origin, ProcessRegistry};

/// Receives decoded messages; implemented by the coordinator
#[async_trait]
pub trait IMessageHandler: Send + Sync {
    async fn handle(&self, origin: Origin, message: IpcMessage);
}

/// Applies the registry's binding policy, then forwards to the handler
pub struct Dispatcher {
    registry: Arc<ProcessRegistry>,
    host: Arc<dyn IProcessHost>,
    handler: Arc<dyn IMessageHandler>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        host: Arc<dyn IProcessHost>,
        handler: Arc<dyn IMessageHandler>,
    ) -> Self {
        Self {
            registry,
            host,
            handler,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Returns false when the message was dropped as a duplicate
    pub async fn dispatch(&self, origin: Origin, message: IpcMessage) -> bool {
        let kind = message.kind();

        let mut name = None;
        if kind == MessageKind::Start {
            if let Some(pid) = origin.pid {
                if self.registry.get(pid).is_none() {
                    name = Some(self.host.process_name(pid).await);
                }
            }
        }

        if !self
            .registry
            .admit(origin, kind, move || name.unwrap_or_default())
        {
            return false;
        }

        trace!(kind = %kind, binding = %origin.binding, "Dispatching message");
        self.handler.handle(origin, message).await;
        true
    }
}
