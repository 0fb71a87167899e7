//! Process host port (driven/secondary port)
//!
//! The coordinator does not spawn or own the subordinate processes; it asks
//! the host about them. On Linux the daemon answers from `/proc`, tests use
//! an in-memory host.
//!
//! ## Design Notes
//!
//! - `query_identifier` is how the fallback channel ties a request to its
//!   origin process: the host evaluates a per-process value (an environment
//!   variable, a page global) and the coordinator compares it with the token
//!   the request carries.
//! - Host notifications are delivered as [`HostEvent`] values rather than
//!   by intercepting a generic dispatch function.

use serde::{Deserialize, Serialize};

use crate::domain::ProcessId;

/// Why a subordinate process went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    CleanExit,
    AbnormalExit,
    Killed,
    Crashed,
    Oom,
    LaunchFailed,
    IntegrityFailure,
}

impl ExitReason {
    /// Reasons that leave a crash dump behind
    pub fn is_crash(&self) -> bool {
        matches!(self, ExitReason::Crashed | ExitReason::Oom)
    }

    /// Wire name, as used in the `exit.reason` tag
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::CleanExit => "clean-exit",
            ExitReason::AbnormalExit => "abnormal-exit",
            ExitReason::Killed => "killed",
            ExitReason::Crashed => "crashed",
            ExitReason::Oom => "oom",
            ExitReason::LaunchFailed => "launch-failed",
            ExitReason::IntegrityFailure => "integrity-failure",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications about subordinate processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Created(ProcessId),
    Navigated { pid: ProcessId, url: String },
    TitleChanged { pid: ProcessId, title: String },
    Gone { pid: ProcessId, reason: ExitReason },
    Destroyed(ProcessId),
}

/// Facts about subordinate processes
#[async_trait::async_trait]
pub trait IProcessHost: Send + Sync {
    /// Processes currently known to the host
    async fn live_processes(&self) -> Vec<ProcessId>;

    /// Evaluates the per-process identifier inside `pid`, if it has one
    async fn query_identifier(&self, pid: ProcessId) -> Option<String>;

    /// Human-meaningful name of `pid` (e.g. "renderer", "gpu")
    async fn process_name(&self, pid: ProcessId) -> String;
}
