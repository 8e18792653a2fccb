//! Call and result value types

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::duration_millis;
use crate::error::OrchestratorError;

/// One tool invocation, built by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub backend: String,
    pub tool: String,
    /// Parameter object; `null` is treated as an empty object
    #[serde(default)]
    pub params: Value,
    /// Overrides the backend and global timeouts
    #[serde(
        default,
        rename = "timeout_ms",
        with = "duration_millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Safe to retry on transient failures
    #[serde(default)]
    pub idempotent: bool,
}

impl ToolCall {
    pub fn new(backend: impl Into<String>, tool: impl Into<String>, params: Value) -> Self {
        Self {
            backend: backend.into(),
            tool: tool.into(),
            params,
            timeout: None,
            idempotent: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Parameters as a JSON object, or `None` if they are not one
    pub(crate) fn params_object(&self) -> Option<Map<String, Value>> {
        match &self.params {
            Value::Null => Some(Map::new()),
            Value::Object(map) => Some(map.clone()),
            _ => None,
        }
    }
}

/// Outcome of one [`ToolCall`]
#[derive(Debug)]
pub struct ToolResult {
    /// The originating call
    pub call: ToolCall,
    /// Payload on success, structured error otherwise
    pub outcome: Result<Value, OrchestratorError>,
    /// Wall time spent on the call, including retries
    pub elapsed: Duration,
    /// Backend-reported metadata
    pub metadata: Map<String, Value>,
}

impl ToolResult {
    pub(crate) fn failed(call: ToolCall, error: OrchestratorError, elapsed: Duration) -> Self {
        Self {
            call,
            outcome: Err(error),
            elapsed,
            metadata: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&OrchestratorError> {
        self.outcome.as_ref().err()
    }

    /// Serializable summary, used by the CLI
    pub fn to_json(&self) -> Value {
        let mut summary = serde_json::json!({
            "backend": self.call.backend,
            "tool": self.call.tool,
            "success": self.is_success(),
            "elapsed_ms": self.elapsed.as_millis() as u64,
        });
        match &self.outcome {
            Ok(payload) => summary["result"] = payload.clone(),
            Err(e) => {
                summary["error"] = Value::String(e.to_string());
                summary["error_kind"] = Value::String(e.kind().to_string());
            }
        }
        if !self.metadata.is_empty() {
            summary["metadata"] = Value::Object(self.metadata.clone());
        }
        summary
    }
}
