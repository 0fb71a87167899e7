//! Renderer arena
//!
//! Last-known url and title of each subordinate process, keyed by process
//! id. Records are inserted when the host reports a process created and
//! removed a grace period after it is destroyed, so a crash signal that
//! arrives late can still be attributed to the page the process showed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crashrelay_core::domain::ProcessId;
use crashrelay_core::ports::HostEvent;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererRecord {
    pub pid: ProcessId,
    pub url: Option<String>,
    pub title: Option<String>,
    /// Bumped on every insert so a stale removal never drops a reused pid
    generation: u64,
}

#[derive(Debug)]
pub struct RendererArena {
    records: DashMap<ProcessId, RendererRecord>,
    grace: Duration,
    generations: AtomicU64,
}

impl RendererArena {
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
            grace,
            generations: AtomicU64::new(0),
        })
    }

    pub fn insert(&self, pid: ProcessId) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        self.records.insert(
            pid,
            RendererRecord {
                pid,
                url: None,
                title: None,
                generation,
            },
        );
    }

    pub fn set_url(&self, pid: ProcessId, url: impl Into<String>) {
        self.entry(pid).url = Some(url.into());
    }

    pub fn set_title(&self, pid: ProcessId, title: impl Into<String>) {
        self.entry(pid).title = Some(title.into());
    }

    pub fn get(&self, pid: ProcessId) -> Option<RendererRecord> {
        self.records.get(&pid).map(|r| r.clone())
    }

    pub fn url_of(&self, pid: ProcessId) -> Option<String> {
        self.records.get(&pid).and_then(|r| r.url.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Removes `pid` after the grace period.
    ///
    /// Resolves to true if the record was removed; false if the process id
    /// was reinserted in the meantime.
    pub fn schedule_remove(self: &Arc<Self>, pid: ProcessId) -> JoinHandle<bool> {
        let generation = self.records.get(&pid).map(|r| r.generation);
        let arena = Arc::clone(self);

        tokio::spawn(async move {
            tokio::time::sleep(arena.grace).await;
            let Some(generation) = generation else {
                return false;
            };
            let removed = arena
                .records
                .remove_if(&pid, |_, r| r.generation == generation)
                .is_some();
            if removed {
                debug!(pid = %pid, "Renderer forgotten");
            }
            removed
        })
    }

    /// Applies host bookkeeping events; `Destroyed` schedules removal.
    pub fn observe(self: &Arc<Self>, event: &HostEvent) -> Option<JoinHandle<bool>> {
        match event {
            HostEvent::Created(pid) => self.insert(*pid),
            HostEvent::Navigated { pid, url } => self.set_url(*pid, url.clone()),
            HostEvent::TitleChanged { pid, title } => self.set_title(*pid, title.clone()),
            HostEvent::Destroyed(pid) => return Some(self.schedule_remove(*pid)),
            HostEvent::Gone { .. } => {}
        }
        None
    }

    fn entry(&self, pid: ProcessId) -> dashmap::mapref::one::RefMut<'_, ProcessId, RendererRecord> {
        self.records.entry(pid).or_insert_with(|| RendererRecord {
            pid,
            url: None,
            title: None,
            generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u32) -> ProcessId {
        ProcessId::new(n)
    }

    #[test]
    fn test_navigation_updates_record() {
        let arena = RendererArena::new(Duration::from_secs(5));
        arena.observe(&HostEvent::Created(pid(1)));
        arena.observe(&HostEvent::Navigated {
            pid: pid(1),
            url: "app://index.html".into(),
        });
        arena.observe(&HostEvent::TitleChanged {
            pid: pid(1),
            title: "Main".into(),
        });

        let record = arena.get(pid(1)).unwrap();
        assert_eq!(record.url.as_deref(), Some("app://index.html"));
        assert_eq!(record.title.as_deref(), Some("Main"));
    }

    #[test]
    fn test_set_url_without_create_inserts() {
        let arena = RendererArena::new(Duration::from_secs(5));
        arena.set_url(pid(2), "app://late");
        assert_eq!(arena.url_of(pid(2)).as_deref(), Some("app://late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroyed_kept_during_grace() {
        let arena = RendererArena::new(Duration::from_millis(5_000));
        arena.insert(pid(3));
        arena.set_url(pid(3), "app://crashy");

        let handle = arena.observe(&HostEvent::Destroyed(pid(3))).unwrap();
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert_eq!(arena.url_of(pid(3)).as_deref(), Some("app://crashy"));

        assert!(handle.await.unwrap());
        assert!(arena.get(pid(3)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_pid_survives_stale_removal() {
        let arena = RendererArena::new(Duration::from_millis(100));
        arena.insert(pid(4));
        let handle = arena.schedule_remove(pid(4));
        arena.insert(pid(4));

        assert!(!handle.await.unwrap());
        assert!(arena.get(pid(4)).is_some());
    }
}
