//! MCP stdio backend for the tool orchestrator
//!
//! Spawns an MCP server as a child process and keeps one session open for
//! the lifetime of the connection. Tool calls, discovery and health probes
//! all go over that session.
//!
//! A backend's `connection` table describes the server:
//!
//! ```toml
//! [[backends]]
//! name = "sysinfo"
//!
//! [backends.connection]
//! command = "sysinfo-mcp"
//! args = ["--quiet"]
//! env = { HOME_DIR = "${HOME}" }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, RawContent},
    service::RunningService,
    transport::TokioChildProcess,
    RoleClient, ServiceError, ServiceExt,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::Mutex;
use tool_orchestrator::{
    BackendClient, BackendConfig, BackendError, ClientFactory, ToolInfo, ToolOutput,
};

type Session = RunningService<RoleClient, ()>;

/// How to launch an MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioServerConfig {
    /// Executable to run. `~` and `$VARS` are expanded.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment; values may reference `$VARS` from the parent
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl StdioServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// Read the server definition out of a backend's connection table
    pub fn from_backend(config: &BackendConfig) -> Result<Self, BackendError> {
        let server: Self = serde_json::from_value(config.connection.clone()).with_context(|| {
            format!(
                "backend '{}' needs a connection table with a 'command'",
                config.name
            )
        })?;

        if server.command.trim().is_empty() {
            return Err(anyhow::anyhow!("backend '{}' has an empty command", config.name).into());
        }
        Ok(server)
    }

    fn expanded_command(&self) -> String {
        shellexpand::full(&self.command)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| self.command.clone())
    }

    fn expanded_env(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(key, value)| {
                let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
                (key.clone(), expanded.into_owned())
            })
            .collect()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.expanded_command());
        if !self.args.is_empty() {
            cmd.args(&self.args);
        }
        for (key, value) in self.expanded_env() {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

/// One MCP server session
pub struct McpStdioClient {
    name: String,
    server: StdioServerConfig,
    session: Mutex<Option<Arc<Session>>>,
    connected: AtomicBool,
}

impl McpStdioClient {
    pub fn new(name: impl Into<String>, server: StdioServerConfig) -> Self {
        Self {
            name: name.into(),
            server,
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &StdioServerConfig {
        &self.server
    }

    async fn session(&self) -> Result<Arc<Session>, BackendError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BackendError::NotConnected);
        }
        self.session
            .lock()
            .await
            .clone()
            .ok_or(BackendError::NotConnected)
    }

    /// JSON-RPC errors are the server refusing the request; anything else
    /// means the session itself is gone.
    fn map_service_error(&self, err: ServiceError) -> BackendError {
        match err {
            ServiceError::McpError(data) => BackendError::Tool(data.message.to_string()),
            other => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    tracing::warn!(backend = %self.name, error = %other, "MCP session lost");
                }
                BackendError::Transport(other.to_string())
            }
        }
    }
}

#[async_trait]
impl BackendClient for McpStdioClient {
    async fn connect(&self) -> Result<(), BackendError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!(backend = %self.name, command = %self.server.command, "Spawning MCP server");

        let transport = TokioChildProcess::new(self.server.command()).map_err(|e| {
            BackendError::Transport(format!("failed to spawn '{}': {}", self.server.command, e))
        })?;
        let service = ()
            .serve(transport)
            .await
            .map_err(|e| BackendError::Transport(format!("MCP handshake failed: {}", e)))?;

        *slot = Some(Arc::new(service));
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(backend = %self.name, "MCP session established");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        self.connected.store(false, Ordering::SeqCst);
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        match Arc::try_unwrap(session) {
            Ok(service) => {
                service
                    .cancel()
                    .await
                    .map_err(|e| BackendError::Transport(format!("shutdown failed: {}", e)))?;
                tracing::debug!(backend = %self.name, "MCP session closed");
            }
            Err(_shared) => {
                // Requests still hold the session; it closes when the last one drops it
                tracing::debug!(backend = %self.name, "MCP session released with calls outstanding");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let session = self.session().await?;
        session
            .list_tools(Default::default())
            .await
            .map(|_| ())
            .map_err(|e| self.map_service_error(e))
    }

    async fn list_tools(&self) -> Result<Vec<ToolInfo>, BackendError> {
        let session = self.session().await?;
        let response = session
            .list_tools(Default::default())
            .await
            .map_err(|e| self.map_service_error(e))?;

        Ok(response
            .tools
            .into_iter()
            .map(|t| ToolInfo {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                input_schema: serde_json::to_value(&t.input_schema).ok(),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        tool: &str,
        params: &Map<String, Value>,
        _timeout: Duration,
    ) -> Result<ToolOutput, BackendError> {
        let session = self.session().await?;
        let result = session
            .call_tool(CallToolRequestParam {
                name: tool.to_string().into(),
                arguments: Some(params.clone()),
                task: None,
            })
            .await
            .map_err(|e| self.map_service_error(e))?;

        Ok(into_output(result))
    }
}

/// Collapse MCP content blocks into a single JSON payload.
///
/// Structured content wins. Otherwise a lone text block that parses as JSON
/// is returned parsed, text blocks are joined with newlines, and any other
/// block kind is kept as its wire representation.
fn into_output(result: CallToolResult) -> ToolOutput {
    let blocks = result.content.len();
    let content = match result.structured_content {
        Some(structured) => structured,
        None => collapse_content(&result.content),
    };

    let output = if result.is_error.unwrap_or(false) {
        ToolOutput::error(content)
    } else {
        ToolOutput::new(content)
    };
    output.with_metadata("content_blocks", Value::from(blocks))
}

fn collapse_content(content: &[rmcp::model::Content]) -> Value {
    let mut texts = Vec::new();
    let mut others = Vec::new();
    for block in content {
        match &block.raw {
            RawContent::Text(text) => texts.push(text.text.to_string()),
            _ => others.push(serde_json::to_value(block).unwrap_or(Value::Null)),
        }
    }

    if others.is_empty() {
        return match texts.as_slice() {
            [] => Value::Null,
            [single] => serde_json::from_str(single).unwrap_or_else(|_| Value::String(single.clone())),
            many => Value::String(many.join("\n")),
        };
    }

    let mut items: Vec<Value> = texts.into_iter().map(Value::String).collect();
    items.extend(others);
    Value::Array(items)
}

/// Creates an [`McpStdioClient`] for every configured backend
#[derive(Debug, Clone, Copy, Default)]
pub struct McpStdioFactory;

impl ClientFactory for McpStdioFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn BackendClient>, BackendError> {
        let server = StdioServerConfig::from_backend(config)?;
        Ok(Arc::new(McpStdioClient::new(config.name.clone(), server)))
    }
}
