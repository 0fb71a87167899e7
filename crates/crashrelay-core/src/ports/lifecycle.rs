//! Application lifecycle hooks
//!
//! An explicit subscribe/unsubscribe registry for named lifecycle events.
//! Listeners run sequentially in subscription order; any of them may call
//! [`QuitEvent::prevent_default`] to abort the quit, or
//! [`QuitEvent::request_exit`] to confirm it after doing its own work.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;

/// Named lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Quit has been requested; listeners may still abort it
    BeforeQuit,
    /// All windows closed; the process exits after this unless prevented
    WillQuit,
}

/// Event object passed to quit listeners
#[derive(Debug, Default)]
pub struct QuitEvent {
    prevented: AtomicBool,
    exit_requested: AtomicBool,
}

impl QuitEvent {
    /// Stops the default quit behaviour
    pub fn prevent_default(&self) {
        self.prevented.store(true, Ordering::SeqCst);
    }

    pub fn is_default_prevented(&self) -> bool {
        self.prevented.load(Ordering::SeqCst)
    }

    /// Asks the host to exit now, regardless of `prevent_default`
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// True when the host should go ahead and terminate
    pub fn should_exit(&self) -> bool {
        self.exit_requested() || !self.is_default_prevented()
    }
}

/// Handle returned by [`LifecycleHooks::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(Arc<QuitEvent>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry {
    id: ListenerId,
    event: LifecycleEvent,
    listener: Listener,
}

/// Subscription registry for lifecycle events
#[derive(Default)]
pub struct LifecycleHooks {
    listeners: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener for `event`
    pub fn subscribe<F>(&self, event: LifecycleEvent, listener: F) -> ListenerId
    where
        F: Fn(Arc<QuitEvent>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock().push(Entry {
            id,
            event,
            listener: Arc::new(listener),
        });
        id
    }

    /// Removes a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|e| e.id != id);
        listeners.len() != before
    }

    /// Moves a listener to the end of its event's list
    pub fn move_to_back(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        match listeners.iter().position(|e| e.id == id) {
            Some(pos) => {
                let entry = listeners.remove(pos);
                listeners.push(entry);
                true
            }
            None => false,
        }
    }

    /// Number of listeners subscribed to `event`
    pub fn listener_count(&self, event: LifecycleEvent) -> usize {
        self.lock().iter().filter(|e| e.event == event).count()
    }

    /// Runs every listener for `event` in order and returns the shared event object.
    ///
    /// The listener list is snapshotted per step so listeners may subscribe or
    /// reorder while the event is being delivered.
    pub async fn emit(&self, event: LifecycleEvent) -> Arc<QuitEvent> {
        let quit = Arc::new(QuitEvent::default());
        let mut done: Vec<ListenerId> = Vec::new();

        loop {
            let next = {
                let listeners = self.lock();
                listeners
                    .iter()
                    .find(|e| e.event == event && !done.contains(&e.id))
                    .map(|e| (e.id, Arc::clone(&e.listener)))
            };
            let Some((id, listener)) = next else {
                break;
            };
            done.push(id);
            listener(Arc::clone(&quit)).await;
        }

        quit
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("listeners", &self.lock().len())
            .finish()
    }
}
