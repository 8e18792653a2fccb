//! Configuration loading
//!
//! Backends are listed in order; the order is kept for reporting. Durations are
//! written in milliseconds in config files (`*_ms` keys).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

/// Config file names searched for by [`OrchestratorConfig::load`]
const CONFIG_FILE_NAMES: &[&str] = &["orchestrator.toml", "orchestrator.json"];

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. Global config at ~/.config/tool-orchestrator/
fn find_config_file(filenames: &[&str]) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        for filename in filenames {
            let candidate = current.join(filename);
            if candidate.exists() {
                return Some(candidate);
            }
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    let config_dir = dirs::config_dir()?.join("tool-orchestrator");
    filenames
        .iter()
        .map(|filename| config_dir.join(filename))
        .find(|path| path.exists())
}

// ============================================================================
// Backend Configuration
// ============================================================================

/// Configuration for a single backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name
    pub name: String,

    /// Disabled backends are never connected, checked or reported
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Connection parameters, interpreted only by the client factory
    #[serde(default)]
    pub connection: Value,

    /// Per-call timeout; falls back to the global default
    #[serde(
        default,
        rename = "timeout_ms",
        with = "duration_millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// Connection retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff
    #[serde(
        default = "default_backoff_base",
        rename = "retry_backoff_base_ms",
        with = "duration_millis"
    )]
    pub retry_backoff_base: Duration,

    /// Backoff ceiling
    #[serde(
        default = "default_backoff_max",
        rename = "retry_backoff_max_ms",
        with = "duration_millis"
    )]
    pub retry_backoff_max: Duration,
}

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

impl BackendConfig {
    /// Create an enabled backend with default retry policy
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: default_enabled(),
            connection: Value::Null,
            timeout: None,
            max_retries: default_max_retries(),
            retry_backoff_base: default_backoff_base(),
            retry_backoff_max: default_backoff_max(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_connection(mut self, connection: Value) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base = base;
        self.retry_backoff_max = max;
        self
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_backoff_base
            .saturating_mul(factor)
            .min(self.retry_backoff_max)
    }
}

// ============================================================================
// Circuit Breaker / Health Configuration
// ============================================================================

/// Circuit breaker thresholds, shared by all backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls before admitting a probe
    #[serde(
        default = "default_open_duration",
        rename = "open_duration_ms",
        with = "duration_millis"
    )]
    pub open_duration: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration() -> Duration {
    Duration::from_secs(30)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration: default_open_duration(),
        }
    }
}

/// Health probe behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Extra probe attempts before a backend is reported unhealthy
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,

    #[serde(
        default = "default_probe_retry_delay",
        rename = "probe_retry_delay_ms",
        with = "duration_millis"
    )]
    pub probe_retry_delay: Duration,
}

fn default_probe_retries() -> u32 {
    2
}

fn default_probe_retry_delay() -> Duration {
    Duration::from_millis(200)
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_retries: default_probe_retries(),
            probe_retry_delay: default_probe_retry_delay(),
        }
    }
}

// ============================================================================
// Orchestrator Configuration
// ============================================================================

/// Top-level orchestrator configuration (from orchestrator.toml / orchestrator.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(
        default = "default_timeout",
        rename = "default_timeout_ms",
        with = "duration_millis"
    )]
    pub default_timeout: Duration,

    /// Ceiling on concurrently running calls in parallel batches
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Ceiling on concurrent connection attempts
    #[serde(default = "default_max_concurrent_connects")]
    pub max_concurrent_connects: usize,

    #[serde(
        default = "default_health_check_interval",
        rename = "health_check_interval_ms",
        with = "duration_millis"
    )]
    pub health_check_interval: Duration,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// How long `stop()` waits for in-flight calls before cancelling them
    #[serde(
        default = "default_shutdown_grace",
        rename = "shutdown_grace_ms",
        with = "duration_millis"
    )]
    pub shutdown_grace: Duration,

    /// Reconnect backends whose connection was lost, from the health loop
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_concurrent_connects() -> usize {
    4
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_auto_reconnect() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            default_timeout: default_timeout(),
            max_concurrency: default_max_concurrency(),
            max_concurrent_connects: default_max_concurrent_connects(),
            health_check_interval: default_health_check_interval(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
            shutdown_grace: default_shutdown_grace(),
            auto_reconnect: default_auto_reconnect(),
        }
    }
}

impl OrchestratorConfig {
    /// Config with the given backends and default global settings
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self {
            backends,
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    /// Look up a backend by name (enabled or not)
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Enabled backends, in configuration order
    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter().filter(|b| b.enabled)
    }

    /// Timeout for a backend: its own, else the global default
    pub fn effective_timeout(&self, backend: &BackendConfig) -> Duration {
        backend.timeout.unwrap_or(self.default_timeout)
    }

    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(ConfigError::Invalid("backend name cannot be empty".into()));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
        }
        for (field, value) in [
            ("max_concurrency", self.max_concurrency),
            ("max_concurrent_connects", self.max_concurrent_connects),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", field)));
            }
            if value > Semaphore::MAX_PERMITS {
                return Err(ConfigError::Invalid(format!(
                    "{} must be at most {}",
                    field,
                    Semaphore::MAX_PERMITS
                )));
            }
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "health_check_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Load config from orchestrator.toml / orchestrator.json
    ///
    /// Search order:
    /// 1. Walk up directory tree from cwd
    /// 2. Check ~/.config/tool-orchestrator/ (global fallback)
    pub fn load() -> Result<Option<Self>, ConfigError> {
        if let Some(config_path) = find_config_file(CONFIG_FILE_NAMES) {
            tracing::debug!("Loading orchestrator config from: {}", config_path.display());
            return Self::load_from_path(&config_path).map(Some);
        }

        tracing::debug!("No orchestrator config found");
        Ok(None)
    }

    /// Load from a specific path; `.toml` files are parsed as TOML, anything else as JSON
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let config: OrchestratorConfig = if is_toml {
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        config.validate()?;
        Ok(config)
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            duration.map(|d| d.as_millis() as u64).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let millis = Option::<u64>::deserialize(deserializer)?;
            Ok(millis.map(Duration::from_millis))
        }
    }
}
