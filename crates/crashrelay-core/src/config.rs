//! Configuration module for CrashRelay.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for CrashRelay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ingestion endpoint DSN. `None` disables outbound delivery entirely.
    pub dsn: Option<String>,
    /// Release name attached to sessions and events.
    pub release: Option<String>,
    /// Environment name attached to sessions and events.
    pub environment: String,
    /// App-scoped directory holding store files and the offline queue.
    pub cache_dir: PathBuf,
    pub ipc: IpcConfig,
    pub queue: QueueConfig,
    pub minidumps: MinidumpConfig,
    pub session: SessionConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

/// Which inter-process bindings the coordinator serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcMode {
    /// Direct message channel only
    Direct,
    /// Scheme-based request fallback only
    Fallback,
    /// Both bindings, for maximum compatibility
    Both,
}

impl IpcMode {
    /// Returns true if the direct channel should be served.
    pub fn direct_enabled(self) -> bool {
        matches!(self, IpcMode::Direct | IpcMode::Both)
    }

    /// Returns true if the fallback channel should be served.
    pub fn fallback_enabled(self) -> bool {
        matches!(self, IpcMode::Fallback | IpcMode::Both)
    }
}

/// Inter-process transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub mode: IpcMode,
    /// Namespace prefixed to every fallback route, e.g. `crashrelay-ipc`.
    pub namespace: String,
    /// Unix socket path for the direct channel.
    pub socket_path: PathBuf,
    /// Loopback address the fallback channel listens on; subordinates post to it.
    pub fallback_addr: String,
    /// How long a subordinate waits for the handshake acknowledgement.
    pub handshake_timeout_ms: u64,
    /// Delay before a destroyed process is forgotten.
    pub destroy_grace_ms: u64,
}

/// Offline queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Envelopes older than this are dropped.
    pub max_age_days: u32,
    /// Maximum number of queued envelopes; further inserts are dropped.
    pub max_queue_size: usize,
    /// Seconds between background flush attempts.
    pub flush_interval_secs: u64,
}

/// On-disk layout used by the native crash facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashLayout {
    /// Dumps are moved into a `completed`/`reports` sub-directory.
    Crashpad,
    /// Dumps sit directly in the crash directory next to metadata files.
    Breakpad,
}

/// Native crash-dump discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinidumpConfig {
    pub crashes_dir: PathBuf,
    pub layout: CrashLayout,
    /// Dumps older than this are deleted without being sent.
    pub max_age_days: u32,
    /// Maximum number of dumps sent per run.
    pub max_per_session: u32,
    /// A dump must not have been modified for this long before it is read.
    pub settle_ms: u64,
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds between re-persists of an `ok` session.
    pub persist_interval_secs: u64,
    /// Whether a freshly started session is dispatched immediately.
    pub send_on_create: bool,
}

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Buffered writes within this window collapse into one.
    pub throttle_ms: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `pretty` or `json`.
    pub format: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/crashrelay/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("crashrelay")
            .join("config.yaml")
    }

    /// Directory holding the offline queue bodies and index.
    pub fn queue_dir(&self) -> PathBuf {
        self.cache_dir.join("queue")
    }
}

// ---------------------------------------------------------------------------
// Config::default()
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            dsn: None,
            release: None,
            environment: "production".to_string(),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("~/.cache"))
                .join("crashrelay"),
            ipc: IpcConfig::default(),
            queue: QueueConfig::default(),
            minidumps: MinidumpConfig::default(),
            session: SessionConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        let runtime_dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            mode: IpcMode::Both,
            namespace: "crashrelay-ipc".to_string(),
            socket_path: runtime_dir.join("crashrelay.sock"),
            fallback_addr: "127.0.0.1:48620".to_string(),
            handshake_timeout_ms: 1_000,
            destroy_grace_ms: 5_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_queue_size: 30,
            flush_interval_secs: 60,
        }
    }
}

impl Default for MinidumpConfig {
    fn default() -> Self {
        Self {
            crashes_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("crashrelay")
                .join("Crashpad"),
            layout: CrashLayout::Crashpad,
            max_age_days: 30,
            max_per_session: 10,
            settle_ms: 1_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persist_interval_secs: 60,
            send_on_create: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { throttle_ms: 500 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"queue.max_queue_size"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- dsn ---
        if let Some(dsn) = &self.dsn {
            if let Err(e) = crate::domain::Dsn::parse(dsn) {
                errors.push(ValidationError {
                    field: "dsn".into(),
                    message: e.to_string(),
                });
            }
        }

        // --- ipc ---
        if self.ipc.namespace.is_empty() || self.ipc.namespace.contains('/') {
            errors.push(ValidationError {
                field: "ipc.namespace".into(),
                message: "must be a non-empty name without '/'".into(),
            });
        }
        if self.ipc.mode.fallback_enabled()
            && self.ipc.fallback_addr.parse::<std::net::SocketAddr>().is_err()
        {
            errors.push(ValidationError {
                field: "ipc.fallback_addr".into(),
                message: format!("invalid socket address '{}'", self.ipc.fallback_addr),
            });
        }
        if self.ipc.handshake_timeout_ms == 0 {
            errors.push(ValidationError {
                field: "ipc.handshake_timeout_ms".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- queue ---
        if self.queue.max_age_days == 0 {
            errors.push(ValidationError {
                field: "queue.max_age_days".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.queue.max_queue_size == 0 {
            errors.push(ValidationError {
                field: "queue.max_queue_size".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.queue.flush_interval_secs == 0 {
            errors.push(ValidationError {
                field: "queue.flush_interval_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- minidumps ---
        if self.minidumps.max_age_days == 0 {
            errors.push(ValidationError {
                field: "minidumps.max_age_days".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- session ---
        if self.session.persist_interval_secs == 0 {
            errors.push(ValidationError {
                field: "session.persist_interval_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use crashrelay_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .dsn("https://public@ingest.example.com/42")
///     .cache_dir(PathBuf::from("/tmp/crashrelay"))
///     .queue_max_size(50)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn dsn(mut self, dsn: impl Into<String>) -> Self {
        self.config.dsn = Some(dsn.into());
        self
    }

    pub fn release(mut self, release: impl Into<String>) -> Self {
        self.config.release = Some(release.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.config.environment = environment.into();
        self
    }

    pub fn cache_dir(mut self, dir: PathBuf) -> Self {
        self.config.cache_dir = dir;
        self
    }

    // --- ipc ---

    pub fn ipc_mode(mut self, mode: IpcMode) -> Self {
        self.config.ipc.mode = mode;
        self
    }

    pub fn ipc_socket_path(mut self, path: PathBuf) -> Self {
        self.config.ipc.socket_path = path;
        self
    }

    pub fn ipc_fallback_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.ipc.fallback_addr = addr.into();
        self
    }

    // --- queue ---

    pub fn queue_max_age_days(mut self, days: u32) -> Self {
        self.config.queue.max_age_days = days;
        self
    }

    pub fn queue_max_size(mut self, size: usize) -> Self {
        self.config.queue.max_queue_size = size;
        self
    }

    // --- minidumps ---

    pub fn crashes_dir(mut self, dir: PathBuf) -> Self {
        self.config.minidumps.crashes_dir = dir;
        self
    }

    pub fn crash_layout(mut self, layout: CrashLayout) -> Self {
        self.config.minidumps.layout = layout;
        self
    }

    pub fn minidump_settle_ms(mut self, ms: u64) -> Self {
        self.config.minidumps.settle_ms = ms;
        self
    }

    pub fn max_minidumps_per_session(mut self, n: u32) -> Self {
        self.config.minidumps.max_per_session = n;
        self
    }

    // --- session / store ---

    pub fn session_persist_interval_secs(mut self, secs: u64) -> Self {
        self.config.session.persist_interval_secs = secs;
        self
    }

    pub fn store_throttle_ms(mut self, ms: u64) -> Self {
        self.config.store.throttle_ms = ms;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert!(cfg.dsn.is_none());
        assert_eq!(cfg.environment, "production");
        assert_eq!(cfg.ipc.mode, IpcMode::Both);
        assert_eq!(cfg.queue.max_age_days, 30);
        assert_eq!(cfg.queue.max_queue_size, 30);
        assert_eq!(cfg.minidumps.max_age_days, 30);
        assert_eq!(cfg.minidumps.max_per_session, 10);
        assert_eq!(cfg.session.persist_interval_secs, 60);
        assert_eq!(cfg.store.throttle_ms, 500);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn queue_dir_is_under_cache_dir() {
        let cfg = ConfigBuilder::new()
            .cache_dir(PathBuf::from("/tmp/relay"))
            .build();
        assert_eq!(cfg.queue_dir(), PathBuf::from("/tmp/relay/queue"));
    }

    #[test]
    fn ipc_mode_flags() {
        assert!(IpcMode::Direct.direct_enabled());
        assert!(!IpcMode::Direct.fallback_enabled());
        assert!(IpcMode::Fallback.fallback_enabled());
        assert!(IpcMode::Both.direct_enabled() && IpcMode::Both.fallback_enabled());
    }

    #[test]
    fn load_partial_yaml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "dsn: https://abc@ingest.example.com/7\nqueue:\n  max_age_days: 5\n  max_queue_size: 12\n  flush_interval_secs: 10\nipc:\n  mode: direct\n  namespace: relay\n  socket_path: /tmp/relay.sock\n  fallback_addr: 127.0.0.1:0\n  handshake_timeout_ms: 250\n  destroy_grace_ms: 100"
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.dsn.as_deref(), Some("https://abc@ingest.example.com/7"));
        assert_eq!(cfg.queue.max_queue_size, 12);
        assert_eq!(cfg.ipc.mode, IpcMode::Direct);
        assert_eq!(cfg.minidumps.max_per_session, 10);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_or_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/crashrelay.yaml"));
        assert_eq!(cfg.queue.max_queue_size, 30);
    }

    #[test]
    fn validate_reports_every_error() {
        let mut cfg = Config::default();
        cfg.dsn = Some("not a dsn".into());
        cfg.queue.max_queue_size = 0;
        cfg.logging.level = "loud".into();
        cfg.ipc.fallback_addr = "nowhere".into();

        let errors = cfg.validate();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"dsn"));
        assert!(fields.contains(&"queue.max_queue_size"));
        assert!(fields.contains(&"logging.level"));
        assert!(fields.contains(&"ipc.fallback_addr"));
    }

    #[test]
    fn builder_validated_rejects_invalid() {
        let result = ConfigBuilder::new().queue_max_size(0).build_validated();
        assert!(result.is_err());
    }
}
