//! Offline envelope queue
//!
//! Envelopes that could not be sent are written to individual body files in
//! the queue directory; their `{id, date}` entries live in an index kept in a
//! [`Store`] next to the bodies. The index is the source of truth:
//!
//! - insert writes the body, then records the index entry
//! - pop removes the index entry, then reads and unlinks the body
//!
//! so a crash can leave an orphaned body (see [`OfflineQueue::remove_orphans`])
//! but never an index entry without a body.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use crashrelay_core::domain::Envelope;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::Store;

/// Store id of the queue index
pub const INDEX_ID: &str = "queue-v2";

/// Default maximum age of a queued envelope
pub const DEFAULT_MAX_AGE_DAYS: u32 = 30;

/// Default maximum number of queued envelopes
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 30;

/// Index entry for one queued envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEnvelope {
    /// Opaque id; also the body file name
    pub id: String,
    #[serde(rename = "date")]
    pub enqueued_at: DateTime<Utc>,
}

/// Bounds applied on every insert and pop
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_age_days: u32,
    pub max_queue_size: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_age_days: DEFAULT_MAX_AGE_DAYS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

/// Where an insert places the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertAt {
    Back,
    Front,
}

/// Durable, bounded FIFO of envelopes
pub struct OfflineQueue {
    dir: PathBuf,
    index: Store<Vec<QueuedEnvelope>>,
    limits: QueueLimits,
    /// Date of the entry most recently popped, reused by `unshift`
    last_popped: Mutex<Option<DateTime<Utc>>>,
}

impl OfflineQueue {
    /// Opens (or creates on first write) the queue in `dir`
    pub fn new(dir: impl Into<PathBuf>, limits: QueueLimits) -> Self {
        let dir = dir.into();
        let index = Store::new(&dir, INDEX_ID, Vec::new());
        Self {
            dir,
            index,
            limits,
            last_popped: Mutex::new(None),
        }
    }

    /// Directory holding the index and body files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of indexed envelopes, including stale ones not yet pruned
    pub async fn len(&self) -> usize {
        self.index.get().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Appends an envelope. Dropped silently once the queue is full.
    pub async fn insert(&self, envelope: &Envelope) {
        self.insert_at(envelope, InsertAt::Back, None).await;
    }

    /// Puts an envelope back at the head of the queue.
    ///
    /// Keeps the date of the most recently popped entry, so a failed resend
    /// does not re-date it. Not subject to the size bound.
    pub async fn unshift(&self, envelope: &Envelope) {
        let previous = *self
            .last_popped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.insert_at(envelope, InsertAt::Front, previous).await;
    }

    async fn insert_at(
        &self,
        envelope: &Envelope,
        at: InsertAt,
        previous_date: Option<DateTime<Utc>>,
    ) {
        let id = Uuid::new_v4().to_string();
        let body = self.dir.join(&id);

        let data = match envelope.to_bytes() {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to serialize envelope for offline queue");
                return;
            }
        };
        if let Err(e) = write_body(&self.dir, &body, &data).await {
            warn!(path = %body.display(), error = %e, "Failed to save envelope body");
            return;
        }

        let date = previous_date
            .or(envelope.header.sent_at)
            .unwrap_or_else(Utc::now);
        let entry = QueuedEnvelope {
            id: id.clone(),
            enqueued_at: date,
        };
        let limits = self.limits;

        let (stale, accepted) = self
            .index
            .update(|queue| {
                if at == InsertAt::Front {
                    queue.insert(0, entry);
                    return (Vec::new(), true);
                }
                let stale = remove_stale(queue, limits.max_age_days);
                if queue.len() >= limits.max_queue_size {
                    return (stale, false);
                }
                queue.push(entry);
                (stale, true)
            })
            .await;

        remove_bodies(&self.dir, &stale).await;
        if accepted {
            debug!(id = %id, "Envelope queued");
        } else {
            info!(max = limits.max_queue_size, "Offline queue full, dropping envelope");
            remove_body(&body).await;
        }
    }

    /// Removes and returns the oldest envelope, or `None` when empty.
    ///
    /// Entries whose body is missing or unreadable are skipped.
    pub async fn pop(&self) -> Option<Envelope> {
        loop {
            let limits = self.limits;
            let (stale, entry) = self
                .index
                .update(|queue| {
                    let stale = remove_stale(queue, limits.max_age_days);
                    let entry = if queue.is_empty() {
                        None
                    } else {
                        Some(queue.remove(0))
                    };
                    (stale, entry)
                })
                .await;
            remove_bodies(&self.dir, &stale).await;

            let entry = entry?;
            let body = self.dir.join(&entry.id);
            let parsed = match tokio::fs::read(&body).await {
                Ok(data) => Envelope::parse(&data).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            remove_body(&body).await;

            match parsed {
                Ok(envelope) => {
                    *self
                        .last_popped
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner) =
                        Some(entry.enqueued_at);
                    return Some(envelope);
                }
                Err(e) => {
                    warn!(id = %entry.id, error = %e, "Failed to read queued envelope, skipping");
                }
            }
        }
    }

    /// Unlinks body files that have no index entry. Returns how many were removed.
    pub async fn remove_orphans(&self) -> usize {
        let known: HashSet<String> = self.index.get().await.into_iter().map(|e| e.id).collect();
        let index_file = self.index.path().file_name().map(|n| n.to_os_string());

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if Some(&name) == index_file.as_ref() {
                continue;
            }
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(".tmp") || known.contains(name) {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                remove_body(&entry.path()).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Removed orphaned queue bodies");
        }
        removed
    }
}

/// Drops leading entries older than `max_age_days`, returning them
fn remove_stale(queue: &mut Vec<QueuedEnvelope>, max_age_days: u32) -> Vec<QueuedEnvelope> {
    let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
    let count = queue
        .iter()
        .take_while(|e| e.enqueued_at < cutoff)
        .count();
    let stale: Vec<_> = queue.drain(..count).collect();
    for entry in &stale {
        debug!(id = %entry.id, date = %entry.enqueued_at, "Removing stale envelope");
    }
    stale
}

async fn write_body(dir: &Path, body: &Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(body, data).await
}

async fn remove_body(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove queue body");
        }
    }
}

async fn remove_bodies(dir: &Path, entries: &[QueuedEnvelope]) {
    for entry in entries {
        remove_body(&dir.join(&entry.id)).await;
    }
}

#[cfg(test)]
mod tests {
    use crashrelay_core::domain::{EnvelopeHeader, EnvelopeItem};
    use serde_json::json;

    use super::*;

    fn envelope(n: usize, sent_at: DateTime<Utc>) -> Envelope {
        let mut env = Envelope::new(EnvelopeHeader {
            sent_at: Some(sent_at),
            ..EnvelopeHeader::default()
        });
        env.add_item(EnvelopeItem::json("event", json!({ "n": n })));
        env
    }

    fn n_of(env: &Envelope) -> u64 {
        env.event_with_attachments().unwrap().event["n"].as_u64().unwrap()
    }

    fn body_count(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| !e.file_name().to_string_lossy().ends_with(".json"))
            .count()
    }

    #[tokio::test]
    async fn test_fifo_with_size_bound() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(
            dir.path(),
            QueueLimits {
                max_age_days: 30,
                max_queue_size: 30,
            },
        );

        for n in 0..40 {
            queue.insert(&envelope(n, Utc::now())).await;
        }
        assert_eq!(body_count(dir.path()), 30);

        let mut seen = Vec::new();
        while let Some(env) = queue.pop().await {
            seen.push(n_of(&env));
        }
        assert_eq!(seen, (0..30).collect::<Vec<u64>>());
        assert_eq!(body_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_age_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(
            dir.path(),
            QueueLimits {
                max_age_days: 1,
                max_queue_size: 30,
            },
        );

        let old = Utc::now() - Duration::days(2);
        for n in 0..3 {
            queue.insert(&envelope(n, old)).await;
        }
        queue.insert(&envelope(99, Utc::now())).await;

        let first = queue.pop().await.unwrap();
        assert_eq!(n_of(&first), 99);
        assert!(queue.pop().await.is_none());
        assert_eq!(body_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = OfflineQueue::new(dir.path(), QueueLimits::default());
            queue.insert(&envelope(1, Utc::now())).await;
            queue.insert(&envelope(2, Utc::now())).await;
        }
        let queue = OfflineQueue::new(dir.path(), QueueLimits::default());
        assert_eq!(queue.len().await, 2);
        assert_eq!(n_of(&queue.pop().await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_unshift_keeps_order_and_date() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path(), QueueLimits::default());
        let date = Utc::now() - Duration::hours(3);
        queue.insert(&envelope(1, date)).await;
        queue.insert(&envelope(2, Utc::now())).await;

        let popped = queue.pop().await.unwrap();
        let mut resent = popped.clone();
        resent.header.sent_at = Some(Utc::now());
        queue.unshift(&resent).await;

        let index = queue.index.get().await;
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].enqueued_at, date);
        assert_eq!(n_of(&queue.pop().await.unwrap()), 1);
        assert_eq!(n_of(&queue.pop().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_missing_body_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path(), QueueLimits::default());
        queue.insert(&envelope(1, Utc::now())).await;
        queue.insert(&envelope(2, Utc::now())).await;

        let first_id = queue.index.get().await[0].id.clone();
        std::fs::remove_file(dir.path().join(first_id)).unwrap();

        assert_eq!(n_of(&queue.pop().await.unwrap()), 2);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_remove_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let queue = OfflineQueue::new(dir.path(), QueueLimits::default());
        queue.insert(&envelope(1, Utc::now())).await;
        std::fs::write(dir.path().join("orphan"), b"junk").unwrap();

        assert_eq!(queue.remove_orphans().await, 1);
        assert!(!dir.path().join("orphan").exists());
        assert_eq!(queue.len().await, 1);
        assert_eq!(body_count(dir.path()), 1);
    }
}
