//! `/proc`-backed process host
//!
//! Subordinate processes are the ones started with `CRASHRELAY_PROCESS_ID`
//! in their environment; its value is the token they present on the
//! fallback channel. `CRASHRELAY_PROCESS_TYPE`, when set, names the process
//! (`renderer`, `gpu`, ...), otherwise the kernel's `comm` is used.
//!
//! The host cannot observe the exit status of processes it did not spawn, so
//! [`watch`] reports every vanished subordinate as `abnormal-exit` and then
//! destroyed. The coordinator only produces a crash event for it when a dump
//! turns up.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crashrelay_core::domain::ProcessId;
use crashrelay_core::ports::{ExitReason, HostEvent, IProcessHost};
use crashrelay_delivery::Coordinator;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Environment variable carrying the per-process token
pub const PROCESS_ID_VAR: &str = "CRASHRELAY_PROCESS_ID";

/// Environment variable carrying the process type
pub const PROCESS_TYPE_VAR: &str = "CRASHRELAY_PROCESS_TYPE";

pub struct ProcHost {
    root: PathBuf,
}

impl ProcHost {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Reads process information from `root` instead of `/proc`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn environ_var(&self, pid: ProcessId, name: &str) -> Option<String> {
        let environ = tokio::fs::read(self.root.join(pid.get().to_string()).join("environ"))
            .await
            .ok()?;
        environ_lookup(&environ, name)
    }
}

impl Default for ProcHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IProcessHost for ProcHost {
    async fn live_processes(&self) -> Vec<ProcessId> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            return Vec::new();
        };

        let mut pids = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
                .map(ProcessId::new)
            else {
                continue;
            };
            if self.environ_var(pid, PROCESS_ID_VAR).await.is_some() {
                pids.push(pid);
            }
        }
        pids
    }

    async fn query_identifier(&self, pid: ProcessId) -> Option<String> {
        self.environ_var(pid, PROCESS_ID_VAR).await
    }

    async fn process_name(&self, pid: ProcessId) -> String {
        if let Some(name) = self.environ_var(pid, PROCESS_TYPE_VAR).await {
            return name;
        }
        match tokio::fs::read_to_string(self.root.join(pid.get().to_string()).join("comm")).await {
            Ok(comm) if !comm.trim().is_empty() => comm.trim().to_string(),
            _ => "unknown".to_string(),
        }
    }
}

/// Finds `name` in a NUL-separated `KEY=value` environment block
fn environ_lookup(environ: &[u8], name: &str) -> Option<String> {
    environ
        .split(|b| *b == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .find_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            (key == name).then(|| value.to_string())
        })
}

/// Host events implied by going from `before` to `after`
fn diff(before: &BTreeSet<ProcessId>, after: &BTreeSet<ProcessId>) -> Vec<HostEvent> {
    let mut events: Vec<HostEvent> = after
        .difference(before)
        .map(|pid| HostEvent::Created(*pid))
        .collect();
    for pid in before.difference(after) {
        events.push(HostEvent::Gone {
            pid: *pid,
            reason: ExitReason::AbnormalExit,
        });
        events.push(HostEvent::Destroyed(*pid));
    }
    events
}

/// Polls the host and feeds process changes to the coordinator
pub async fn watch(
    host: Arc<dyn IProcessHost>,
    coordinator: Arc<Coordinator>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut known = BTreeSet::new();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        let live: BTreeSet<ProcessId> = host.live_processes().await.into_iter().collect();
        for event in diff(&known, &live) {
            debug!(event = ?event, "Host event");
            coordinator.on_host_event(event).await;
        }
        known = live;
    }
    debug!("Host watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_process(root: &std::path::Path, pid: u32, environ: &[&str], comm: &str) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("environ"), environ.join("\0")).unwrap();
        std::fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
    }

    #[test]
    fn test_environ_lookup() {
        let environ = b"PATH=/usr/bin\0CRASHRELAY_PROCESS_ID=tok=1\0EMPTY=";
        assert_eq!(environ_lookup(environ, PROCESS_ID_VAR).as_deref(), Some("tok=1"));
        assert_eq!(environ_lookup(environ, "EMPTY").as_deref(), Some(""));
        assert!(environ_lookup(environ, "HOME").is_none());
    }

    #[test]
    fn test_diff_reports_new_and_vanished() {
        let before = BTreeSet::from([ProcessId::new(1), ProcessId::new(2)]);
        let after = BTreeSet::from([ProcessId::new(2), ProcessId::new(3)]);

        let events = diff(&before, &after);
        assert_eq!(
            events,
            vec![
                HostEvent::Created(ProcessId::new(3)),
                HostEvent::Gone {
                    pid: ProcessId::new(1),
                    reason: ExitReason::AbnormalExit,
                },
                HostEvent::Destroyed(ProcessId::new(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_only_tagged_processes_are_live() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 10, &["CRASHRELAY_PROCESS_ID=a"], "app");
        fake_process(root.path(), 11, &["HOME=/root"], "bash");
        std::fs::create_dir_all(root.path().join("self")).unwrap();

        let host = ProcHost::with_root(root.path());
        assert_eq!(host.live_processes().await, vec![ProcessId::new(10)]);
        assert_eq!(
            host.query_identifier(ProcessId::new(10)).await.as_deref(),
            Some("a")
        );
        assert!(host.query_identifier(ProcessId::new(11)).await.is_none());
    }

    #[tokio::test]
    async fn test_process_name_prefers_type_variable() {
        let root = tempfile::tempdir().unwrap();
        fake_process(
            root.path(),
            20,
            &["CRASHRELAY_PROCESS_ID=b", "CRASHRELAY_PROCESS_TYPE=renderer"],
            "app",
        );
        fake_process(root.path(), 21, &["CRASHRELAY_PROCESS_ID=c"], "gpu-helper");

        let host = ProcHost::with_root(root.path());
        assert_eq!(host.process_name(ProcessId::new(20)).await, "renderer");
        assert_eq!(host.process_name(ProcessId::new(21)).await, "gpu-helper");
        assert_eq!(host.process_name(ProcessId::new(99)).await, "unknown");
    }
}
