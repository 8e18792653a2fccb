//! Resilient tool orchestration over several independent backends
//!
//! This crate provides:
//! - A connection manager with retry, backoff and reconnect-on-loss
//! - Per-backend circuit breakers with a single half-open probe
//! - A tool router that validates, times out and dispatches single calls
//! - A parallel executor for batches with a shared concurrency ceiling
//! - A health monitor feeding the breakers, with an optional background loop
//!
//! Backends are reached only through the [`BackendClient`] trait; adapters
//! are produced by a [`ClientFactory`] handed to [`Orchestrator::new`].
//!
//! # Example
//!
//! ```rust,ignore
//! use tool_orchestrator::{Orchestrator, OrchestratorConfig, ToolCall};
//!
//! let orchestrator = Orchestrator::new(config, factory)?;
//! let results = orchestrator
//!     .run_scoped(|orch| async move {
//!         orch.call_tools_parallel(vec![
//!             ToolCall::new("downloads", "list", json!({})),
//!             ToolCall::new("library", "scan", json!({"path": "/media"})),
//!         ])
//!         .await
//!     })
//!     .await?;
//! ```

pub mod circuit;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod router;
pub mod types;

pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use client::{BackendClient, BackendError, ClientFactory, ToolInfo, ToolOutput};
pub use config::{BackendConfig, CircuitBreakerConfig, ConfigError, HealthConfig, OrchestratorConfig};
pub use connection::{ConnectFailure, ConnectReport, ConnectionInfo, ConnectionState};
pub use error::{OrchestratorError, OrchestratorResult};
pub use executor::{BatchMode, BatchOptions, BatchProgress};
pub use health::HealthStatus;
pub use metrics::{BackendMetrics, OrchestratorStats};
pub use orchestrator::Orchestrator;
pub use types::{ToolCall, ToolResult};

/// Re-exported so adapters can implement [`BackendClient`] without their own dependency
pub use async_trait::async_trait;
