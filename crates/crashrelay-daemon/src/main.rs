//! crashrelay daemon - Crash and telemetry coordinator
//!
//! This binary runs next to the application it monitors and handles:
//! - Native crash dumps left by the previous run
//! - Messages from subordinate processes over the direct and fallback
//!   channels
//! - The offline queue flush
//! - Session shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon builds a [`Coordinator`] from configuration, runs its startup
//! sequence, then serves the IPC bindings, the queue flusher and the host
//! watch as tasks sharing one `CancellationToken`. Shutdown goes through the
//! lifecycle hooks so the session exit handler runs after every other
//! listener.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crashrelay_core::config::Config;
use crashrelay_core::domain::Dsn;
use crashrelay_core::ports::{IEnvelopeTransport, IProcessHost, LifecycleEvent, LifecycleHooks};
use crashrelay_delivery::{Coordinator, HttpTransport};
use crashrelay_ipc::{DirectServer, FallbackServer};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod host;

use host::ProcHost;

/// How often the host is polled for subordinate processes
const HOST_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on waiting for serving tasks after shutdown
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "crashrelayd", version, about = "Crash and telemetry coordinator")]
struct Cli {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,
}

// ============================================================================
// DaemonService
// ============================================================================

/// Owns the coordinator and the tasks serving it
struct DaemonService {
    config: Config,
    host: Arc<dyn IProcessHost>,
    coordinator: Arc<Coordinator>,
    hooks: Arc<LifecycleHooks>,
    shutdown: CancellationToken,
}

impl DaemonService {
    async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let transport = build_transport(&config)?;
        let host: Arc<dyn IProcessHost> = Arc::new(ProcHost::new());
        let coordinator = Coordinator::from_config(&config, host.clone(), transport).await;

        Ok(Self {
            config,
            host,
            coordinator,
            hooks: Arc::new(LifecycleHooks::new()),
            shutdown,
        })
    }

    /// Runs startup, serves until cancelled, then quits through the hooks
    async fn run(&self) -> Result<()> {
        self.coordinator
            .startup()
            .await
            .context("Coordinator startup failed")?;
        self.coordinator.sessions().install_exit_handler(&self.hooks);

        let mut tasks = self.spawn_tasks()?;

        self.shutdown.cancelled().await;
        info!("Shutting down");

        self.hooks.emit(LifecycleEvent::BeforeQuit).await;
        let quit = self.hooks.emit(LifecycleEvent::WillQuit).await;
        if !quit.should_exit() {
            warn!("Quit was prevented by a listener, exiting anyway");
        }

        let drained = tokio::time::timeout(TASK_DRAIN_TIMEOUT, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Task ended abnormally");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Tasks did not stop in time");
        }
        Ok(())
    }

    fn spawn_tasks(&self) -> Result<JoinSet<()>> {
        let ipc = &self.config.ipc;
        let dispatcher = self.coordinator.dispatcher()?;
        let mut tasks = JoinSet::new();

        if ipc.mode.direct_enabled() {
            let server = DirectServer::new(ipc.socket_path.clone(), dispatcher.clone());
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = server.run(shutdown).await {
                    error!(error = %e, "Direct channel failed");
                }
            });
        }

        if ipc.mode.fallback_enabled() {
            let server = Arc::new(FallbackServer::new(
                ipc.namespace.clone(),
                dispatcher,
                self.coordinator.resolver().clone(),
            ));
            let addr = ipc.fallback_addr.clone();
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = server.run(&addr, shutdown).await {
                    error!(error = %e, addr = %addr, "Fallback channel failed");
                }
            });
        }

        tasks.spawn(self.coordinator.delivery().clone().run_flush_loop(
            Duration::from_secs(self.config.queue.flush_interval_secs),
            self.shutdown.clone(),
        ));

        tasks.spawn(host::watch(
            self.host.clone(),
            self.coordinator.clone(),
            HOST_POLL_INTERVAL,
            self.shutdown.clone(),
        ));

        Ok(tasks)
    }
}

/// HTTP transport for the configured DSN, or `None` when delivery is disabled
fn build_transport(config: &Config) -> Result<Option<Arc<dyn IEnvelopeTransport>>> {
    let Some(raw) = config.dsn.as_deref() else {
        warn!("No DSN configured, delivery disabled");
        return Ok(None);
    };
    let dsn = Dsn::parse(raw).context("Invalid DSN")?;
    let transport = HttpTransport::new(&dsn)?;
    info!(url = transport.url(), "Delivering to ingestion endpoint");
    Ok(Some(Arc::new(transport)))
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow::bail!("Invalid configuration: {}", details.join("; "));
    }
    Ok(config)
}

fn init_tracing(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    init_tracing(&config);

    info!(release = config.release.as_deref().unwrap_or("-"), "crashrelay daemon starting");

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, shutdown_token).await?;
    let result = service.run().await;

    match &result {
        Ok(()) => info!("crashrelay daemon shut down gracefully"),
        Err(e) => error!(error = %e, "crashrelay daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
