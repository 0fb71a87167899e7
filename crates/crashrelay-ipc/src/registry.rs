//! Process registry
//!
//! Tracks which subordinate processes completed the `start` handshake, on
//! which binding, and under which human-meaningful name.
//!
//! When both bindings are served, the same process could deliver a message
//! twice. The first binding on which a process completes `start` becomes its
//! binding; later traffic from that process on the other binding is dropped.
//! Messages whose origin process cannot be resolved are always accepted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crashrelay_core::domain::ProcessId;
use crashrelay_core::ports::IProcessHost;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::message::MessageKind;

/// Transport binding a message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    Direct,
    Fallback,
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Binding::Direct => write!(f, "direct"),
            Binding::Fallback => write!(f, "fallback"),
        }
    }
}

/// Where a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub pid: Option<ProcessId>,
    pub binding: Binding,
}

/// A process that completed the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredProcess {
    pub pid: ProcessId,
    pub binding: Binding,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

/// Registry of handshaken processes, keyed by process id
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: DashMap<ProcessId, RegisteredProcess>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides whether a message is processed.
    ///
    /// A `start` registers the process on its binding unless it is already
    /// bound to the other one.
    pub fn admit(&self, origin: Origin, kind: MessageKind, name: impl FnOnce() -> String) -> bool {
        let Some(pid) = origin.pid else {
            return true;
        };

        // One entry guard covers the check and the claim
        match self.processes.entry(pid) {
            Entry::Occupied(existing) => {
                if existing.get().binding != origin.binding {
                    debug!(
                        pid = %pid,
                        bound = %existing.get().binding,
                        received = %origin.binding,
                        kind = %kind,
                        "Dropping duplicate message from other binding"
                    );
                    return false;
                }
                true
            }
            Entry::Vacant(slot) => {
                if kind == MessageKind::Start {
                    let name = name();
                    debug!(pid = %pid, binding = %origin.binding, name = %name, "Process registered");
                    slot.insert(RegisteredProcess {
                        pid,
                        binding: origin.binding,
                        name,
                        started_at: Utc::now(),
                    });
                }
                true
            }
        }
    }

    pub fn get(&self, pid: ProcessId) -> Option<RegisteredProcess> {
        self.processes.get(&pid).map(|p| p.clone())
    }

    /// Registered name of `pid`, if it completed the handshake
    pub fn name_of(&self, pid: ProcessId) -> Option<String> {
        self.processes.get(&pid).map(|p| p.name.clone())
    }

    pub fn remove(&self, pid: ProcessId) -> Option<RegisteredProcess> {
        self.processes.remove(&pid).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

/// Maps fallback-channel tokens to process ids.
///
/// A token is resolved by asking the host for the identifier of each live
/// process and caching the match.
pub struct TokenResolver {
    host: Arc<dyn IProcessHost>,
    tokens: DashMap<String, ProcessId>,
}

impl TokenResolver {
    pub fn new(host: Arc<dyn IProcessHost>) -> Self {
        Self {
            host,
            tokens: DashMap::new(),
        }
    }

    pub async fn resolve(&self, token: &str) -> Option<ProcessId> {
        if let Some(pid) = self.tokens.get(token) {
            return Some(*pid);
        }
        for pid in self.host.live_processes().await {
            if self.host.query_identifier(pid).await.as_deref() == Some(token) {
                self.tokens.insert(token.to_string(), pid);
                return Some(pid);
            }
        }
        debug!(token = %token, "Could not resolve fallback origin");
        None
    }

    /// Drops cached tokens of a destroyed process
    pub fn forget(&self, pid: ProcessId) {
        self.tokens.retain(|_, p| *p != pid);
    }

    pub fn host(&self) -> &Arc<dyn IProcessHost> {
        &self.host
    }
}
