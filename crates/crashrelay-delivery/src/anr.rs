//! Hang detection for subordinate processes
//!
//! A subordinate that opts in sends an `alive` status every poll interval and
//! a `visible`/`hidden` status whenever its visibility changes. Its first
//! report arms a watchdog; every report resets it. A visible process that
//! stays silent for the threshold it announced is reported once as a
//! [`Hang`]. The next report re-arms the watchdog. Hidden processes are not
//! watched, since a throttled background page stops polling.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crashrelay_core::domain::ProcessId;
use crashrelay_ipc::{ProcessStatus, StatusReport};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Threshold used when a status report does not announce one
pub const DEFAULT_ANR_THRESHOLD: Duration = Duration::from_millis(5_000);

/// How often armed watchdogs are checked
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// A process that stopped reporting while visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hang {
    pub pid: ProcessId,
    /// The silence that triggered the report
    pub blocked: Duration,
}

#[derive(Debug)]
struct Watchdog {
    threshold: Duration,
    last_poll: Instant,
    enabled: bool,
    triggered: bool,
}

impl Watchdog {
    fn poll(&mut self, now: Instant) {
        self.last_poll = now;
        self.triggered = false;
    }

    /// Fires at most once per silence
    fn check(&mut self, now: Instant) -> Option<Duration> {
        if !self.enabled || self.triggered {
            return None;
        }
        if now.duration_since(self.last_poll) < self.threshold {
            return None;
        }
        self.triggered = true;
        Some(self.threshold)
    }
}

/// Per-process watchdogs fed by status reports
pub struct AnrMonitor {
    watchdogs: Arc<DashMap<ProcessId, Watchdog>>,
    hangs: mpsc::UnboundedSender<Hang>,
}

impl AnrMonitor {
    /// Creates the monitor and the receiving end of its hang reports
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Hang>) {
        let (hangs, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            watchdogs: Arc::new(DashMap::new()),
            hangs,
        };
        (monitor, rx)
    }

    /// Records a status report from `pid`, arming its watchdog on first contact
    pub fn on_status(&self, pid: ProcessId, report: &StatusReport) {
        let now = Instant::now();
        let mut armed = false;
        {
            let mut watchdog = self.watchdogs.entry(pid).or_insert_with(|| {
                armed = true;
                Watchdog {
                    threshold: announced_threshold(&report.config),
                    last_poll: now,
                    enabled: true,
                    triggered: false,
                }
            });
            watchdog.poll(now);
            match report.status {
                ProcessStatus::Alive => {}
                ProcessStatus::Visible => watchdog.enabled = true,
                ProcessStatus::Hidden => watchdog.enabled = false,
            }
        }

        if armed {
            debug!(pid = pid.get(), config = %report.config, "Watching process for hangs");
            self.spawn_watch(pid);
        }
    }

    /// Stops watching `pid`
    pub fn forget(&self, pid: ProcessId) {
        if self.watchdogs.remove(&pid).is_some() {
            debug!(pid = pid.get(), "Stopped watching process for hangs");
        }
    }

    pub fn is_watching(&self, pid: ProcessId) -> bool {
        self.watchdogs.contains_key(&pid)
    }

    fn spawn_watch(&self, pid: ProcessId) {
        let watchdogs: Weak<DashMap<ProcessId, Watchdog>> = Arc::downgrade(&self.watchdogs);
        let hangs = self.hangs.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(watchdogs) = watchdogs.upgrade() else { break };
                let fired = match watchdogs.get_mut(&pid) {
                    Some(mut watchdog) => watchdog.check(Instant::now()),
                    None => break,
                };
                if let Some(blocked) = fired {
                    info!(pid = pid.get(), blocked_ms = blocked.as_millis() as u64, "Process not responding");
                    if hangs.send(Hang { pid, blocked }).is_err() {
                        break;
                    }
                }
            }
        });
    }
}

/// `anrThreshold` in milliseconds from a status report's config
fn announced_threshold(config: &Value) -> Duration {
    config
        .get("anrThreshold")
        .and_then(Value::as_u64)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_ANR_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn report(status: ProcessStatus) -> StatusReport {
        StatusReport {
            status,
            config: json!({"anrThreshold": 1000, "pollInterval": 200}),
        }
    }

    #[test]
    fn test_announced_threshold() {
        assert_eq!(announced_threshold(&json!({"anrThreshold": 250})), Duration::from_millis(250));
        assert_eq!(announced_threshold(&json!({})), DEFAULT_ANR_THRESHOLD);
        assert_eq!(announced_threshold(&json!({"anrThreshold": 0})), DEFAULT_ANR_THRESHOLD);
        assert_eq!(announced_threshold(&Value::Null), DEFAULT_ANR_THRESHOLD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_visible_process_reported_once() {
        let (monitor, mut hangs) = AnrMonitor::new();
        let pid = ProcessId::new(7);
        monitor.on_status(pid, &report(ProcessStatus::Visible));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let hang = hangs.try_recv().unwrap();
        assert_eq!(hang.pid, pid);
        assert_eq!(hang.blocked, Duration::from_millis(1000));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(hangs.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_process_healthy() {
        let (monitor, mut hangs) = AnrMonitor::new();
        let pid = ProcessId::new(7);
        monitor.on_status(pid, &report(ProcessStatus::Visible));

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            monitor.on_status(pid, &report(ProcessStatus::Alive));
        }
        assert!(hangs.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_process_not_reported() {
        let (monitor, mut hangs) = AnrMonitor::new();
        let pid = ProcessId::new(7);
        monitor.on_status(pid, &report(ProcessStatus::Hidden));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(hangs.try_recv().is_err());

        monitor.on_status(pid, &report(ProcessStatus::Visible));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(hangs.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_after_hang_rearms() {
        let (monitor, mut hangs) = AnrMonitor::new();
        let pid = ProcessId::new(7);
        monitor.on_status(pid, &report(ProcessStatus::Visible));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(hangs.try_recv().is_ok());

        monitor.on_status(pid, &report(ProcessStatus::Alive));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(hangs.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forgotten_process_not_reported() {
        let (monitor, mut hangs) = AnrMonitor::new();
        let pid = ProcessId::new(7);
        monitor.on_status(pid, &report(ProcessStatus::Visible));
        monitor.forget(pid);
        assert!(!monitor.is_watching(pid));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(hangs.try_recv().is_err());
    }
}
