//! Error taxonomy for the orchestrator
//!
//! Every call-level error names the backend and tool it concerns so a caller
//! can trace and decide on retry without inspecting transport details.

use std::time::Duration;

use crate::client::BackendError;
use crate::config::ConfigError;
use crate::connection::ConnectReport;

/// Result alias used across the crate
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by the orchestrator facade and its components
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The backend name is not present in the configuration
    #[error("unknown backend '{backend}'")]
    UnknownBackend { backend: String },

    /// Malformed tool name or parameters; nothing was sent
    #[error("invalid call to '{tool}' on backend '{backend}': {message}")]
    Validation {
        backend: String,
        tool: String,
        message: String,
    },

    /// Backend is not connected (or could not be connected)
    #[error("backend '{backend}' unavailable{}: {message}", tool_suffix(.tool))]
    Connection {
        backend: String,
        tool: Option<String>,
        message: String,
    },

    /// The call exceeded its deadline
    #[error("tool '{tool}' on backend '{backend}' timed out after {timeout:?}")]
    Timeout {
        backend: String,
        tool: String,
        timeout: Duration,
        elapsed: Duration,
    },

    /// Rejected by the backend's circuit breaker without a network attempt
    #[error("circuit open for backend '{backend}' (tool '{tool}'), retry in {retry_in:?}")]
    CircuitOpen {
        backend: String,
        tool: String,
        retry_in: Duration,
    },

    /// The backend ran the call and reported a failure
    #[error("tool '{tool}' on backend '{backend}' failed after {elapsed:?}: {source}")]
    ToolExecution {
        backend: String,
        tool: String,
        elapsed: Duration,
        source: BackendError,
    },

    /// The call was cancelled before producing an outcome
    #[error("call to '{tool}' on backend '{backend}' was cancelled")]
    Cancelled { backend: String, tool: String },

    /// Every enabled backend failed to connect
    #[error("no backends available: {} of {} failed to connect", .report.failed.len(), .report.attempted())]
    NoBackendsAvailable { report: Box<ConnectReport> },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn tool_suffix(tool: &Option<String>) -> String {
    match tool {
        Some(tool) => format!(" for tool '{}'", tool),
        None => String::new(),
    }
}

impl OrchestratorError {
    pub(crate) fn unknown(backend: &str) -> Self {
        Self::UnknownBackend {
            backend: backend.to_string(),
        }
    }

    pub(crate) fn not_connected(backend: &str, tool: Option<&str>) -> Self {
        Self::Connection {
            backend: backend.to_string(),
            tool: tool.map(str::to_string),
            message: "not connected".to_string(),
        }
    }

    pub(crate) fn validation(backend: &str, tool: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            backend: backend.to_string(),
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn cancelled(backend: &str, tool: &str) -> Self {
        Self::Cancelled {
            backend: backend.to_string(),
            tool: tool.to_string(),
        }
    }

    /// Short stable label, used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownBackend { .. } => "unknown_backend",
            Self::Validation { .. } => "validation",
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ToolExecution { .. } => "tool_execution",
            Self::Cancelled { .. } => "cancelled",
            Self::NoBackendsAvailable { .. } => "no_backends_available",
            Self::Config(_) => "config",
        }
    }

    /// Backend the error concerns, if any
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::UnknownBackend { backend }
            | Self::Validation { backend, .. }
            | Self::Connection { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::CircuitOpen { backend, .. }
            | Self::ToolExecution { backend, .. }
            | Self::Cancelled { backend, .. } => Some(backend),
            Self::NoBackendsAvailable { .. } | Self::Config(_) => None,
        }
    }

    /// Whether the failure is infrastructure-level and may succeed on a retry.
    ///
    /// Domain-level tool rejections, validation errors and open circuits are
    /// never transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::ToolExecution { source, .. } => source.is_transport(),
            _ => false,
        }
    }
}
