//! Backend client capability contract
//!
//! Every backend adapter implements [`BackendClient`]. The orchestrator never
//! talks to a backend except through this trait, and obtains clients only
//! through a [`ClientFactory`] supplied at construction.
//!
//! # Example
//!
//! ```rust,ignore
//! use tool_orchestrator::{async_trait, BackendClient, BackendError, ToolInfo, ToolOutput};
//!
//! struct EchoClient;
//!
//! #[async_trait]
//! impl BackendClient for EchoClient {
//!     async fn connect(&self) -> Result<(), BackendError> { Ok(()) }
//!     async fn disconnect(&self) -> Result<(), BackendError> { Ok(()) }
//!     fn is_connected(&self) -> bool { true }
//!     async fn health_check(&self) -> Result<(), BackendError> { Ok(()) }
//!     async fn list_tools(&self) -> Result<Vec<ToolInfo>, BackendError> {
//!         Ok(vec![ToolInfo::new("echo")])
//!     }
//!     async fn call_tool(&self, tool: &str, params: &Map<String, Value>, _timeout: Duration)
//!         -> Result<ToolOutput, BackendError>
//!     {
//!         Ok(ToolOutput::new(Value::Object(params.clone())))
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::BackendConfig;

/// Errors reported by a backend adapter
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The client has no live session
    #[error("not connected")]
    NotConnected,

    /// Transport or protocol failure (process died, pipe closed, bad frame)
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend ran the tool and reported a failure
    #[error("tool error: {0}")]
    Tool(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    /// Whether the failure happened below the tool's own logic
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Tool(_))
    }
}

/// A tool exposed by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Raw output of a tool call as returned by the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// Result payload
    pub content: Value,
    /// The backend flagged the result as a tool-level failure
    pub is_error: bool,
    /// Backend-reported metadata
    pub metadata: Map<String, Value>,
}

impl ToolOutput {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            is_error: false,
            metadata: Map::new(),
        }
    }

    pub fn error(content: Value) -> Self {
        Self {
            content,
            is_error: true,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Capability contract for a backend session
///
/// All methods take `&self`; adapters keep their session state behind
/// interior mutability so calls can run concurrently with each other.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to support concurrent tool calls
/// from multiple async tasks.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Establish the session
    async fn connect(&self) -> Result<(), BackendError>;

    /// Close the session. Errors are logged by the caller and never propagated.
    async fn disconnect(&self) -> Result<(), BackendError>;

    /// Whether the session is currently live
    fn is_connected(&self) -> bool;

    /// Lightweight probe; `Ok` means healthy
    async fn health_check(&self) -> Result<(), BackendError>;

    /// Tools the backend exposes
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, BackendError>;

    /// Invoke a tool. `timeout` is advisory; the orchestrator enforces it as well.
    async fn call_tool(
        &self,
        tool: &str,
        params: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<ToolOutput, BackendError>;
}

/// Builds a client for a configured backend
pub trait ClientFactory: Send + Sync {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn BackendClient>, BackendError>;
}

impl<F> ClientFactory for F
where
    F: Fn(&BackendConfig) -> Result<Arc<dyn BackendClient>, BackendError> + Send + Sync,
{
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn BackendClient>, BackendError> {
        self(config)
    }
}
