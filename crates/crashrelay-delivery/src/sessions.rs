//! Session lifecycle
//!
//! The current session lives in memory and in the `session` store key. While
//! it is `ok` it is re-persisted every `persist_interval`; a terminal
//! transition stops that and is written (or, for a clean exit, cleared)
//! before the call returns, so an abrupt exit right after cannot lose it.
//!
//! A session still `ok` in the store at startup means the previous run never
//! ended cleanly; [`SessionManager::check_previous_session`] reports it as
//! `abnormal`, or `crashed` when a dump confirms the crash.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crashrelay_core::domain::{DomainError, Session, SessionAttributes, SessionStatus};
use crashrelay_core::ports::{LifecycleEvent, LifecycleHooks, QuitEvent};
use crashrelay_store::Store;
use futures_util::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::DeliveryService;

/// Store key of the persisted session
pub const SESSION_KEY: &str = "session";

/// Overlap allowed before the last persist when attributing a crash
const PERSIST_OVERLAP: Duration = Duration::from_secs(2);

pub struct SessionManager {
    store: Store<Option<Session>>,
    delivery: Arc<DeliveryService>,
    attrs: SessionAttributes,
    persist_interval: Duration,
    send_on_create: bool,
    current: Mutex<Option<Session>>,
    /// Session left over by the previous run, until it is checked
    previous: Mutex<Option<Session>>,
    /// Store mtime observed before this run wrote to it
    previous_modified: Option<DateTime<Utc>>,
    persist_timer: StdMutex<Option<CancellationToken>>,
}

impl SessionManager {
    /// Opens the session store and picks up the previous run's session
    pub async fn open(
        store: Store<Option<Session>>,
        delivery: Arc<DeliveryService>,
        attrs: SessionAttributes,
        persist_interval: Duration,
        send_on_create: bool,
    ) -> Arc<Self> {
        let previous_modified = store.modified_date().await;
        let previous = store.get().await;
        if let Some(previous) = &previous {
            debug!(sid = %previous.sid, status = %previous.status, "Found persisted session");
        }

        Arc::new(Self {
            store,
            delivery,
            attrs,
            persist_interval,
            send_on_create,
            current: Mutex::new(None),
            previous: Mutex::new(previous),
            previous_modified,
            persist_timer: StdMutex::new(None),
        })
    }

    pub async fn current(&self) -> Option<Session> {
        self.current.lock().await.clone()
    }

    /// Starts an `ok` session and persists it immediately.
    ///
    /// Starting while a session is still `ok` is a programming error.
    pub async fn start_session(self: &Arc<Self>) -> Result<Session, DomainError> {
        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref().filter(|s| !s.status.is_terminal()) {
            return Err(DomainError::InvalidState {
                from: existing.status.to_string(),
                to: SessionStatus::Ok.to_string(),
            });
        }

        let session = Session::new(self.attrs.clone(), None);
        info!(sid = %session.sid, "Session started");
        self.store.force_set(Some(session.clone())).await;
        *current = Some(session.clone());
        drop(current);

        if self.send_on_create {
            self.send(&session).await;
        }
        self.start_persisting();
        Ok(session)
    }

    /// `ok -> exited`; the stored session is removed
    pub async fn end_session(&self) {
        self.stop_persisting();

        // Session store writes happen under `current`, as do persist ticks
        let ended = {
            let mut current = self.current.lock().await;
            let ended = match current.as_mut() {
                Some(session) => {
                    if session.end() {
                        Some(session.clone())
                    } else {
                        debug!("Session was already ended");
                        None
                    }
                }
                None => {
                    debug!("No session");
                    None
                }
            };
            self.store.clear().await;
            ended
        };

        if let Some(session) = ended {
            info!(sid = %session.sid, "Session ended");
            self.send(&session).await;
        }
    }

    /// `ok -> crashed`; no-op once terminal
    pub async fn mark_crashed(&self) -> bool {
        self.terminate(|s| s.mark_crashed()).await
    }

    /// `ok -> abnormal` with a mechanism such as `anr_foreground`; no-op once terminal
    pub async fn mark_abnormal(&self, mechanism: Option<&str>) -> bool {
        self.terminate(|s| s.mark_abnormal(mechanism)).await
    }

    /// Counts an error against the current `ok` session
    pub async fn record_error(&self) {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_mut() {
            session.record_error();
        }
    }

    async fn terminate(&self, transition: impl FnOnce(&mut Session) -> bool) -> bool {
        self.stop_persisting();

        let changed = {
            let mut current = self.current.lock().await;
            match current.as_mut() {
                Some(session) => {
                    if transition(session) {
                        self.store.force_set(Some(session.clone())).await;
                        Some(session.clone())
                    } else {
                        debug!(status = %session.status, "Session already ended");
                        None
                    }
                }
                None => {
                    debug!("No session to update");
                    None
                }
            }
        };

        match changed {
            Some(session) => {
                info!(sid = %session.sid, status = %session.status, "Session terminated");
                self.send(&session).await;
                true
            }
            None => false,
        }
    }

    /// Reports the previous run's session if it never ended.
    ///
    /// An `ok` session becomes `crashed` when `crashed` is true and `abnormal`
    /// otherwise, counts one error, is sent, and is removed from the store.
    /// Returns the reported session.
    pub async fn check_previous_session(&self, crashed: bool) -> Option<Session> {
        let mut previous = self.previous.lock().await.take()?;
        if previous.status.is_terminal() {
            return None;
        }

        if crashed {
            previous.mark_crashed();
        } else {
            previous.mark_abnormal(None);
            previous.errors += 1;
        }
        info!(sid = %previous.sid, status = %previous.status, "Reporting previous session");

        self.store.clear().await;
        self.send(&previous).await;
        Some(previous)
    }

    /// Whether a crash at `crash_date` likely happened during the previous
    /// run's session: after its last persist, before its estimated end.
    pub fn unreported_during_last_session(&self, crash_date: Option<DateTime<Utc>>) -> bool {
        let (Some(crash), Some(modified)) = (crash_date, self.previous_modified) else {
            return false;
        };
        let overlap = chrono::Duration::from_std(PERSIST_OVERLAP).unwrap_or_default();
        let interval = chrono::Duration::from_std(self.persist_interval).unwrap_or_default();
        crash > modified - overlap && crash < modified + interval
    }

    /// Keeps the exit handler the last `will-quit` listener.
    ///
    /// The handler is re-queued behind user listeners on every `before-quit`.
    /// If a user listener prevented the quit the handler does nothing;
    /// otherwise it holds the exit until the session has ended and been sent.
    pub fn install_exit_handler(self: &Arc<Self>, hooks: &Arc<LifecycleHooks>) {
        let manager = Arc::downgrade(self);
        let exit_id = hooks.subscribe(LifecycleEvent::WillQuit, move |event: Arc<QuitEvent>| {
            let manager = manager.clone();
            async move {
                if event.is_default_prevented() {
                    return;
                }
                event.prevent_default();
                if let Some(manager) = manager.upgrade() {
                    debug!("Exit handler ending session");
                    manager.end_session().await;
                }
                event.request_exit();
            }
            .boxed()
        });

        let weak_hooks: Weak<LifecycleHooks> = Arc::downgrade(hooks);
        hooks.subscribe(LifecycleEvent::BeforeQuit, move |_| {
            if let Some(hooks) = weak_hooks.upgrade() {
                hooks.move_to_back(exit_id);
            }
            async {}.boxed()
        });
    }

    fn start_persisting(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(old) = self.timer().replace(token.clone()) {
            old.cancel();
        }

        let manager = Arc::downgrade(self);
        let period = self.persist_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => break,
                }
                let Some(manager) = manager.upgrade() else { break };
                let current = manager.current.lock().await;
                match current.as_ref() {
                    Some(session) if session.status == SessionStatus::Ok => {
                        manager.store.set(Some(session.clone())).await;
                    }
                    _ => break,
                }
            }
        });
    }

    fn stop_persisting(&self) {
        if let Some(token) = self.timer().take() {
            token.cancel();
        }
    }

    fn timer(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.persist_timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, session: &Session) {
        if let Err(e) = self.delivery.send(session.to_envelope()).await {
            warn!(sid = %session.sid, error = %e, "Failed to send session");
        }
    }
}
