//! Durable keyed JSON store
//!
//! One JSON file per key under an app-scoped directory. Reads never fail:
//! a missing, unreadable or corrupt file yields the caller-supplied initial
//! value and a warning. Writes go through a temporary file and a rename so
//! an abrupt exit leaves either the old or the new value on disk.
//!
//! [`Store::set`] is buffered: the first call schedules a write after the
//! throttle window and later calls within the window only replace the
//! pending value. [`Store::force_set`] and [`Store::update`] write before
//! returning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::StoreError;

/// Default window in which buffered writes collapse into one
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(500);

struct State<T> {
    /// Last value read or written; `None` until first access
    cached: Option<T>,
    /// Value waiting for the scheduled flush
    pending: Option<T>,
}

struct Inner<T> {
    path: PathBuf,
    initial: T,
    throttle: Duration,
    state: Mutex<State<T>>,
}

/// Persistent value of type `T` stored as `{dir}/{id}.json`
///
/// Cloning is cheap; clones share the cache and the pending write.
pub struct Store<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates a store with the default throttle window
    pub fn new(dir: impl AsRef<Path>, id: &str, initial: T) -> Self {
        Self::with_throttle(dir, id, initial, DEFAULT_THROTTLE)
    }

    /// Creates a store whose buffered writes are delayed by `throttle`
    pub fn with_throttle(dir: impl AsRef<Path>, id: &str, initial: T, throttle: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: dir.as_ref().join(format!("{id}.json")),
                initial,
                throttle,
                state: Mutex::new(State {
                    cached: None,
                    pending: None,
                }),
            }),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Returns the current value, reading the file on first access
    pub async fn get(&self) -> T {
        let mut state = self.inner.state.lock().await;
        self.ensure_loaded(&mut state).await;
        state
            .cached
            .clone()
            .unwrap_or_else(|| self.inner.initial.clone())
    }

    /// Buffered write: schedules a flush after the throttle window
    pub async fn set(&self, value: T) {
        let mut state = self.inner.state.lock().await;
        state.cached = Some(value.clone());
        let schedule = state.pending.is_none();
        state.pending = Some(value);

        if schedule {
            let store = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(store.inner.throttle).await;
                store.flush().await;
            });
        }
    }

    /// Writes the pending value now, if there is one
    pub async fn flush(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(value) = state.pending.take() {
            self.persist(&value).await;
        }
    }

    /// Writes `value` before returning, discarding any pending buffered write
    pub async fn force_set(&self, value: T) {
        let mut state = self.inner.state.lock().await;
        state.pending = None;
        self.persist(&value).await;
        state.cached = Some(value);
    }

    /// Read-modify-write under the store lock, written through to disk.
    ///
    /// Overlapping calls are serialized, so no update is lost.
    pub async fn update<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut state = self.inner.state.lock().await;
        self.ensure_loaded(&mut state).await;

        let mut value = state
            .cached
            .take()
            .unwrap_or_else(|| self.inner.initial.clone());
        let result = f(&mut value);

        state.pending = None;
        self.persist(&value).await;
        state.cached = Some(value);
        result
    }

    /// Deletes the backing file; the next `get` returns the initial value
    pub async fn clear(&self) {
        let mut state = self.inner.state.lock().await;
        state.cached = None;
        state.pending = None;

        match tokio::fs::remove_file(&self.inner.path).await {
            Ok(()) => debug!(path = %self.inner.path.display(), "Store cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.inner.path.display(), error = %e, "Failed to clear store"),
        }
    }

    /// Last modification time of the backing file
    pub async fn modified_date(&self) -> Option<DateTime<Utc>> {
        let metadata = tokio::fs::metadata(&self.inner.path).await.ok()?;
        metadata.modified().ok().map(DateTime::<Utc>::from)
    }

    async fn ensure_loaded(&self, state: &mut State<T>) {
        if state.cached.is_some() {
            return;
        }
        let value = match self.read_file().await {
            Ok(Some(value)) => value,
            Ok(None) => self.inner.initial.clone(),
            Err(e) => {
                warn!(
                    path = %self.inner.path.display(),
                    error = %e,
                    "Failed to read store, using initial value"
                );
                self.inner.initial.clone()
            }
        };
        state.cached = Some(value);
    }

    async fn read_file(&self) -> Result<Option<T>, StoreError> {
        let bytes = match tokio::fs::read(&self.inner.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Writes and logs failures; the value then lives only in memory
    async fn persist(&self, value: &T) {
        if let Err(e) = self.write_file(value).await {
            warn!(
                path = %self.inner.path.display(),
                error = %e,
                "Failed to write store, value kept in memory only"
            );
        }
    }

    async fn write_file(&self, value: &T) -> Result<(), StoreError> {
        let data = serde_json::to_vec(value)?;
        if let Some(parent) = self.inner.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.inner.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.inner.path).await?;
        Ok(())
    }
}
