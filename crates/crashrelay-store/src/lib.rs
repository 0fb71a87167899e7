//! Crashrelay Store - Durable local state
//!
//! File-backed persistence for state that must survive restarts:
//! - Scope snapshots and the persisted session
//! - The offline envelope queue and its index
//!
//! ## Key Components
//!
//! - [`Store`] - Keyed JSON value with buffered and forced writes
//! - [`OfflineQueue`] - Bounded FIFO of envelopes awaiting delivery
//! - [`StoreError`] - Error types for store I/O
//!
//! ## Usage
//!
//! ```no_run
//! use crashrelay_store::{OfflineQueue, QueueLimits, Store};
//!
//! # async fn example(envelope: crashrelay_core::domain::Envelope) {
//! let store = Store::new("/var/cache/crashrelay", "session", None::<String>);
//! store.force_set(Some("value".to_string())).await;
//!
//! let queue = OfflineQueue::new("/var/cache/crashrelay/queue", QueueLimits::default());
//! queue.insert(&envelope).await;
//! # }
//! ```

pub mod queue;
pub mod store;

pub use queue::{OfflineQueue, QueueLimits, QueuedEnvelope};
pub use store::Store;

/// Errors that can occur during store operations
///
/// These never escape the public API: failed reads fall back to the initial
/// value and failed writes keep the value in memory, both with a warning.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
