//! Coordinator: the composition root of the delivery pipeline
//!
//! Owns the pieces every path goes through and decides what happens to each
//! input:
//!
//! - native dumps found on disk become `fatal` native events with the dump
//!   attached
//! - messages from subordinate processes are enriched with the coordinator's
//!   release, scope and process attribution before delivery
//! - host notifications about subordinate processes drive the renderer arena,
//!   the process registry and crash attribution for the session
//!
//! ## Startup
//!
//! [`Coordinator::startup`] sends dumps left by the previous run first. A dump
//! written while the previous session was still being persisted confirms
//! that session crashed. Only then does the new session start.
//!
//! ## Hangs
//!
//! Status reports feed the [`AnrMonitor`]. A visible process that stops
//! reporting produces an `ApplicationNotResponding` event and ends the
//! session as `abnormal` with the `anr_foreground` mechanism.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crashrelay_core::config::Config;
use crashrelay_core::domain::event::{
    anr_event, enrich_log, log_envelope, native_crash_event, prepare_subordinate_event, SDK_NAME,
    SDK_VERSION,
};
use crashrelay_core::domain::{
    Attachment, DomainError, Dsn, Envelope, EnvelopeItem, ProcessId, ReleaseInfo, ScopeSnapshot,
    ScopeUpdate, SessionAttributes, SessionStatus, DEFAULT_MAX_BREADCRUMBS,
};
use crashrelay_core::ports::{ExitReason, HostEvent, IEnvelopeTransport, IProcessHost};
use crashrelay_ipc::{
    Dispatcher, IMessageHandler, IpcMessage, Origin, ProcessRegistry, RendererArena, TokenResolver,
};
use crashrelay_minidump::{LoaderOptions, MinidumpLoader};
use crashrelay_store::{OfflineQueue, QueueLimits, Store};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::anr::{AnrMonitor, Hang};
use crate::service::DeliveryService;
use crate::sessions::{SessionManager, SESSION_KEY};

/// Store key of the scope snapshot
pub const SCOPE_KEY: &str = "scope_v3";

/// Process tag of events about the coordinator's own process
const COORDINATOR_PROCESS: &str = "browser";

/// Name used when an origin cannot be attributed to a process
const UNKNOWN_PROCESS: &str = "unknown";

/// Session mechanism recorded for a hang in a visible process
const ANR_MECHANISM: &str = "anr_foreground";

pub struct Coordinator {
    release: ReleaseInfo,
    public_key: Option<String>,
    host: Arc<dyn IProcessHost>,
    registry: Arc<ProcessRegistry>,
    resolver: Arc<TokenResolver>,
    arena: Arc<RendererArena>,
    scope_store: Store<ScopeSnapshot>,
    scope: Mutex<ScopeSnapshot>,
    /// Snapshot written by the previous run, read before this run's first write
    previous_scope: Option<ScopeSnapshot>,
    max_breadcrumbs: usize,
    loader: MinidumpLoader,
    minidumps_remaining: AtomicU32,
    delivery: Arc<DeliveryService>,
    sessions: Arc<SessionManager>,
    anr: AnrMonitor,
    /// Taken by the hang reporter at startup
    hangs: Mutex<Option<mpsc::UnboundedReceiver<Hang>>>,
    started: AtomicBool,
}

impl Coordinator {
    /// Wires the pipeline from configuration.
    ///
    /// `transport` is `None` when no DSN is configured; delivery is then
    /// disabled and discovered dumps are discarded.
    pub async fn from_config(
        config: &Config,
        host: Arc<dyn IProcessHost>,
        transport: Option<Arc<dyn IEnvelopeTransport>>,
    ) -> Arc<Self> {
        let release = ReleaseInfo {
            release: config.release.clone(),
            environment: Some(config.environment.clone()),
        };
        let public_key = config
            .dsn
            .as_deref()
            .and_then(|raw| Dsn::parse(raw).ok())
            .map(|dsn| dsn.public_key().to_string());
        let throttle = Duration::from_millis(config.store.throttle_ms);

        let queue = Arc::new(OfflineQueue::new(
            config.queue_dir(),
            QueueLimits {
                max_age_days: config.queue.max_age_days,
                max_queue_size: config.queue.max_queue_size,
            },
        ));
        let delivery = Arc::new(DeliveryService::new(transport, queue));

        let session_store = Store::with_throttle(&config.cache_dir, SESSION_KEY, None, throttle);
        let sessions = SessionManager::open(
            session_store,
            delivery.clone(),
            SessionAttributes {
                release: release.release.clone(),
                environment: release.environment.clone(),
            },
            Duration::from_secs(config.session.persist_interval_secs),
            config.session.send_on_create,
        )
        .await;

        // The previous snapshot must be read before this run overwrites it
        let scope_store =
            Store::with_throttle(&config.cache_dir, SCOPE_KEY, ScopeSnapshot::default(), throttle);
        let previous_scope = if scope_store.modified_date().await.is_some() {
            Some(scope_store.get().await)
        } else {
            None
        };
        let current = ScopeSnapshot {
            release: release.release.clone(),
            environment: release.environment.clone(),
            ..ScopeSnapshot::default()
        };
        scope_store.force_set(current.clone()).await;

        let grace = Duration::from_millis(config.ipc.destroy_grace_ms);
        let (anr, hangs) = AnrMonitor::new();
        Arc::new(Self {
            release,
            public_key,
            resolver: Arc::new(TokenResolver::new(host.clone())),
            host,
            registry: Arc::new(ProcessRegistry::new()),
            arena: RendererArena::new(grace),
            scope_store,
            scope: Mutex::new(current),
            previous_scope,
            max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
            loader: MinidumpLoader::new(LoaderOptions::from(&config.minidumps)),
            minidumps_remaining: AtomicU32::new(config.minidumps.max_per_session),
            delivery,
            sessions,
            anr,
            hangs: Mutex::new(Some(hangs)),
            started: AtomicBool::new(false),
        })
    }

    pub fn delivery(&self) -> &Arc<DeliveryService> {
        &self.delivery
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<TokenResolver> {
        &self.resolver
    }

    pub fn arena(&self) -> &Arc<RendererArena> {
        &self.arena
    }

    pub fn anr(&self) -> &AnrMonitor {
        &self.anr
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Current scope with this run's release identity
    pub async fn scope(&self) -> ScopeSnapshot {
        self.scope.lock().await.clone()
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Sends the previous run's dumps, reports its session, starts a new one.
    ///
    /// Runs once; a second call is an `InvalidState`.
    pub async fn startup(self: &Arc<Self>) -> Result<(), DomainError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DomainError::InvalidState {
                from: "started".into(),
                to: "starting".into(),
            });
        }

        let orphans = self.delivery.queue().remove_orphans().await;
        if orphans > 0 {
            debug!(count = orphans, "Removed orphaned queue bodies");
        }

        let newest_crash = self
            .send_native_crashes(native_crash_event(COORDINATOR_PROCESS, None, None))
            .await;
        let crashed = self.sessions.unreported_during_last_session(newest_crash);
        if let Some(previous) = self.sessions.check_previous_session(crashed).await {
            info!(sid = %previous.sid, status = %previous.status, "Reported previous session");
        }
        self.sessions.start_session().await?;
        self.spawn_hang_reporter().await;

        info!(
            release = self.release.release.as_deref().unwrap_or("-"),
            delivery = self.delivery.is_enabled(),
            "Coordinator started"
        );
        Ok(())
    }

    /// Builds a dispatcher that hands decoded IPC messages to this coordinator.
    ///
    /// Serving either binding before [`Coordinator::startup`] is an
    /// `InvalidState`.
    pub fn dispatcher(self: &Arc<Self>) -> Result<Arc<Dispatcher>, DomainError> {
        if !self.is_started() {
            return Err(DomainError::InvalidState {
                from: "created".into(),
                to: "serving".into(),
            });
        }
        let handler: Arc<dyn IMessageHandler> = self.clone();
        Ok(Arc::new(Dispatcher::new(
            self.registry.clone(),
            self.host.clone(),
            handler,
        )))
    }

    // ========================================================================
    // Native crashes
    // ========================================================================

    /// Discovers dumps and sends each one attached to a copy of `event`.
    ///
    /// Every discovered dump is unlinked whatever happens to it. Returns the
    /// write time of the newest valid dump, even when the per-session cap
    /// kept it from being sent; `None` when no valid dump was found.
    pub async fn send_native_crashes(&self, event: Value) -> Option<DateTime<Utc>> {
        let dumps = self.loader.discover().await;
        if dumps.is_empty() {
            return None;
        }

        let remaining = self.minidumps_remaining.load(Ordering::SeqCst);
        if !self.delivery.is_enabled() || remaining == 0 {
            debug!(count = dumps.len(), "Discarding minidumps without sending");
            for dump in &dumps {
                self.loader.delete(dump).await;
            }
            return None;
        }

        let is_coordinator = event_process_tag(&event) == Some(COORDINATOR_PROCESS);
        let mut newest: Option<DateTime<Utc>> = None;

        for dump in dumps {
            let loaded = match self.loader.load(&dump).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(path = %dump.path().display(), error = %e, "Dropping minidump");
                    self.loader.delete(&dump).await;
                    continue;
                }
            };
            newest = newest.max(Some(dump.modified_date()));

            if !self.take_minidump_slot() {
                debug!(path = %dump.path().display(), "Minidump limit reached for this session");
                self.loader.delete(&dump).await;
                continue;
            }

            let mut event = event.clone();
            if let Some(process) = loaded
                .parsed
                .crashpad_annotations
                .as_ref()
                .and_then(|a| a.process_type())
            {
                set_tag(&mut event, "event.process", process);
            }

            if is_coordinator {
                if let Some(previous) = &self.previous_scope {
                    previous.apply_to_event(&mut event);
                }
            } else {
                self.scope.lock().await.apply_to_event(&mut event);
            }
            self.release.apply_to_event(&mut event);
            add_sdk_info(&mut event);

            let envelope = Envelope::from_event(event, &[loaded.to_attachment()]);
            match self.delivery.send(envelope).await {
                Ok(()) => info!(path = %dump.path().display(), "Sent minidump"),
                Err(e) => debug!(path = %dump.path().display(), error = %e, "Minidump not sent"),
            }
            self.loader.mark_delivered(&dump).await;
        }

        newest
    }

    fn take_minidump_slot(&self) -> bool {
        self.minidumps_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    // ========================================================================
    // Host notifications
    // ========================================================================

    /// Applies a host notification about a subordinate process
    pub async fn on_host_event(self: &Arc<Self>, event: HostEvent) {
        match event {
            HostEvent::Gone { pid, reason } => {
                self.anr.forget(pid);
                self.on_process_gone(pid, reason).await;
            }
            HostEvent::Destroyed(pid) => {
                self.anr.forget(pid);
                let Some(removal) = self.arena.observe(&event) else {
                    return;
                };
                let coordinator = Arc::downgrade(self);
                tokio::spawn(async move {
                    if !matches!(removal.await, Ok(true)) {
                        return;
                    }
                    if let Some(coordinator) = coordinator.upgrade() {
                        coordinator.registry.remove(pid);
                        coordinator.resolver.forget(pid);
                        debug!(pid = pid.get(), "Forgot destroyed process");
                    }
                });
            }
            other => {
                self.arena.observe(&other);
            }
        }
    }

    async fn on_process_gone(&self, pid: ProcessId, reason: ExitReason) {
        if reason == ExitReason::CleanExit {
            debug!(pid = pid.get(), "Process exited cleanly");
            return;
        }

        let name = match self.registry.name_of(pid) {
            Some(name) => name,
            None => self.host.process_name(pid).await,
        };
        let url = self.arena.url_of(pid);
        info!(pid = pid.get(), process = %name, reason = %reason, "Subordinate process gone");

        let event = native_crash_event(
            &name,
            Some(reason.as_str()),
            Some(url.as_deref().unwrap_or(UNKNOWN_PROCESS)),
        );
        if self.send_native_crashes(event).await.is_some() {
            self.sessions.mark_crashed().await;
        }
    }

    // ========================================================================
    // Hangs
    // ========================================================================

    async fn spawn_hang_reporter(self: &Arc<Self>) {
        let Some(mut hangs) = self.hangs.lock().await.take() else {
            return;
        };
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(hang) = hangs.recv().await {
                let Some(coordinator) = coordinator.upgrade() else { break };
                coordinator.on_hang(hang).await;
            }
        });
    }

    /// Ends the session as `abnormal` and reports the hang
    pub async fn on_hang(&self, hang: Hang) {
        let name = match self.registry.name_of(hang.pid) {
            Some(name) => name,
            None => self.host.process_name(hang.pid).await,
        };
        let blocked_ms = u64::try_from(hang.blocked.as_millis()).unwrap_or(u64::MAX);
        warn!(pid = hang.pid.get(), process = %name, blocked_ms, "Subordinate not responding");

        self.sessions.mark_abnormal(Some(ANR_MECHANISM)).await;
        self.capture(anr_event(&name, blocked_ms), Vec::new(), None, None)
            .await;
    }

    // ========================================================================
    // Subordinate messages
    // ========================================================================

    fn process_name(&self, origin: &Origin) -> String {
        origin
            .pid
            .and_then(|pid| self.registry.name_of(pid))
            .unwrap_or_else(|| UNKNOWN_PROCESS.to_string())
    }

    async fn on_scope(&self, update: ScopeUpdate) {
        let snapshot = {
            let mut scope = self.scope.lock().await;
            scope.scope.apply_update(update, self.max_breadcrumbs);
            scope.clone()
        };
        self.scope_store.set(snapshot).await;
    }

    async fn on_event(&self, origin: &Origin, mut event: Value) {
        let name = self.process_name(origin);
        let url = origin.pid.and_then(|pid| self.arena.url_of(pid));
        prepare_subordinate_event(&mut event, &name, url.as_deref());
        self.capture(event, Vec::new(), None, None).await;
    }

    async fn on_envelope(&self, origin: &Origin, bytes: &[u8]) {
        let mut envelope = match Envelope::parse(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed envelope from subordinate");
                return;
            }
        };

        if let Some(Value::Object(trace)) = envelope.header.extra.get_mut("trace") {
            self.stamp_trace(trace);
        }

        match envelope.event_with_attachments() {
            Some(mut extracted) => {
                let name = self.process_name(origin);
                let url = origin.pid.and_then(|pid| self.arena.url_of(pid));
                prepare_subordinate_event(&mut extracted.event, &name, url.as_deref());
                let trace = envelope.header.extra.get("trace").cloned();
                self.capture(extracted.event, extracted.attachments, extracted.profile, trace)
                    .await;
            }
            None => {
                debug!(categories = ?envelope.categories(), "Forwarding envelope");
                if let Err(e) = self.delivery.send(envelope).await {
                    debug!(error = %e, "Forwarded envelope not sent");
                }
            }
        }
    }

    async fn on_structured_log(&self, mut log: Value) {
        enrich_log(&mut log, &self.release);
        if let Err(e) = self.delivery.send(log_envelope(vec![log])).await {
            debug!(error = %e, "Log not sent");
        }
    }

    fn stamp_trace(&self, trace: &mut Map<String, Value>) {
        if let Some(release) = &self.release.release {
            trace.insert("release".into(), json!(release));
        }
        if let Some(environment) = &self.release.environment {
            trace.insert("environment".into(), json!(environment));
        }
        if let Some(key) = &self.public_key {
            trace.insert("public_key".into(), json!(key));
        }
    }

    /// Applies scope and release, then delivers the event.
    ///
    /// Events carrying an exception count as an error on the session.
    async fn capture(
        &self,
        mut event: Value,
        mut attachments: Vec<Attachment>,
        profile: Option<Value>,
        trace: Option<Value>,
    ) {
        {
            let scope = self.scope.lock().await;
            scope.apply_to_event(&mut event);
            attachments.extend(scope.scope.attachments.iter().cloned());
        }
        self.release.apply_to_event(&mut event);
        add_sdk_info(&mut event);

        let has_exception = event.get("exception").is_some();
        let mut envelope = Envelope::from_event(event, &attachments);
        if let Some(trace) = trace {
            envelope.header.extra.insert("trace".into(), trace);
        }
        if let Some(profile) = profile {
            envelope.add_item(EnvelopeItem::json("profile", profile));
        }

        if has_exception
            && self.sessions.current().await.map(|s| s.status) == Some(SessionStatus::Ok)
        {
            self.sessions.record_error().await;
        }

        if let Err(e) = self.delivery.send(envelope).await {
            debug!(error = %e, "Event not sent");
        }
    }
}

#[async_trait]
impl IMessageHandler for Coordinator {
    async fn handle(&self, origin: Origin, message: IpcMessage) {
        match message {
            IpcMessage::Start => {
                debug!(pid = ?origin.pid.map(ProcessId::get), binding = %origin.binding, "Subordinate started");
            }
            IpcMessage::Scope(update) => self.on_scope(update).await,
            IpcMessage::Event(event) => self.on_event(&origin, event).await,
            IpcMessage::Envelope(bytes) => self.on_envelope(&origin, &bytes).await,
            IpcMessage::Status(report) => match origin.pid {
                Some(pid) => self.anr.on_status(pid, &report),
                None => debug!(status = ?report.status, "Ignoring status from unknown process"),
            },
            IpcMessage::StructuredLog(log) => self.on_structured_log(log).await,
        }
    }
}

fn event_process_tag(event: &Value) -> Option<&str> {
    crashrelay_core::domain::event::event_process(event)
}

fn set_tag(event: &mut Value, key: &str, value: &str) {
    if let Some(Value::Object(tags)) = event.get_mut("tags") {
        tags.insert(key.into(), json!(value));
    }
}

fn add_sdk_info(event: &mut Value) {
    if let Some(obj) = event.as_object_mut() {
        obj.entry("sdk")
            .or_insert_with(|| json!({ "name": SDK_NAME, "version": SDK_VERSION }));
    }
}
