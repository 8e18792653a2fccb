//! Tool Router
//!
//! Validates a single call, gates it through the backend's circuit breaker and
//! dispatches it to the leased client with the effective timeout. Validation
//! failures never reach the backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::circuit::CircuitRegistry;
use crate::client::{BackendError, ToolInfo, ToolOutput};
use crate::connection::ConnectionManager;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics::CallMetrics;
use crate::types::{ToolCall, ToolResult};

// =============================================================================
// In-flight tracking
// =============================================================================

/// Counts calls in flight and lets shutdown wait for or cancel them
#[derive(Debug)]
pub(crate) struct CallTracker {
    in_flight: AtomicUsize,
    idle: Notify,
    cancel: RwLock<CancellationToken>,
}

impl CallTracker {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    fn begin(self: &Arc<Self>) -> (InFlightGuard, CancellationToken) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            tracker: Arc::clone(self),
        };
        (guard, self.cancel.read().clone())
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once no call is in flight
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancel every call currently in flight
    pub(crate) fn cancel_all(&self) {
        self.cancel.read().cancel();
    }

    /// Fresh token for calls issued after a shutdown
    pub(crate) fn renew(&self) {
        let mut token = self.cancel.write();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }
}

struct InFlightGuard {
    tracker: Arc<CallTracker>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Routes single tool calls to their backend
#[derive(Clone)]
pub struct ToolRouter {
    connections: Arc<ConnectionManager>,
    breakers: Arc<CircuitRegistry>,
    metrics: Arc<CallMetrics>,
    tracker: Arc<CallTracker>,
}

impl ToolRouter {
    pub(crate) fn new(
        connections: Arc<ConnectionManager>,
        breakers: Arc<CircuitRegistry>,
        metrics: Arc<CallMetrics>,
        tracker: Arc<CallTracker>,
    ) -> Self {
        Self {
            connections,
            breakers,
            metrics,
            tracker,
        }
    }

    /// Call a tool; failures are returned as errors
    pub async fn call_tool(&self, call: ToolCall) -> OrchestratorResult<ToolResult> {
        let result = self.dispatch(call).await;
        match result.outcome {
            Ok(_) => Ok(result),
            Err(e) => Err(e),
        }
    }

    /// Call a tool; failures are recorded in the returned result
    pub async fn dispatch(&self, call: ToolCall) -> ToolResult {
        let started = Instant::now();
        let (_guard, cancel) = self.tracker.begin();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::cancelled(&call.backend, &call.tool)),
            outcome = self.dispatch_with_retry(&call) => outcome,
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(output) => {
                self.metrics.record_success(&call.backend, &call.tool, elapsed);
                ToolResult {
                    call,
                    outcome: Ok(output.content),
                    elapsed,
                    metadata: output.metadata,
                }
            }
            Err(e) => {
                self.metrics.record_error(&call.backend, &call.tool, elapsed, &e);
                ToolResult::failed(call, e, elapsed)
            }
        }
    }

    /// Retry idempotent calls on transient failures, with the backend's backoff
    async fn dispatch_with_retry(&self, call: &ToolCall) -> OrchestratorResult<ToolOutput> {
        let mut attempt = 0;
        loop {
            match self.dispatch_once(call).await {
                Ok(output) => return Ok(output),
                Err(e) if call.idempotent && e.is_retryable() => {
                    let Some(backend) = self.connections.backend_config(&call.backend) else {
                        return Err(e);
                    };
                    if attempt >= backend.max_retries {
                        return Err(e);
                    }
                    let delay = backend.backoff_delay(attempt);
                    tracing::info!(
                        backend = %call.backend,
                        tool = %call.tool,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying idempotent call: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch_once(&self, call: &ToolCall) -> OrchestratorResult<ToolOutput> {
        let backend = call.backend.as_str();
        let tool = call.tool.as_str();

        // 1. Known backend
        if !self.connections.is_configured(backend) {
            return Err(OrchestratorError::unknown(backend));
        }

        // 2. Connected
        let client = self.connections.lease(backend, Some(tool))?;

        // 3. Circuit not open
        let breaker = self.breakers.ensure(backend);
        let permit = breaker
            .try_acquire()
            .map_err(|retry_in| OrchestratorError::CircuitOpen {
                backend: backend.to_string(),
                tool: tool.to_string(),
                retry_in,
            })?;

        // 4. Tool name
        if tool.trim().is_empty() {
            return Err(OrchestratorError::validation(backend, tool, "tool name cannot be empty"));
        }

        // 5. Parameters
        let params = call.params_object().ok_or_else(|| {
            OrchestratorError::validation(backend, tool, "params must be a JSON object")
        })?;

        let timeout = call
            .timeout
            .unwrap_or_else(|| self.connections.timeout_for(backend));

        tracing::debug!(backend = %backend, tool = %tool, timeout_ms = timeout.as_millis() as u64, "Dispatching tool call");
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, client.call_tool(tool, &params, timeout)).await;
        let elapsed = started.elapsed();

        match result {
            Err(_) => {
                permit.failure();
                Err(OrchestratorError::Timeout {
                    backend: backend.to_string(),
                    tool: tool.to_string(),
                    timeout,
                    elapsed,
                })
            }
            Ok(Err(source)) => {
                permit.failure();
                if matches!(source, BackendError::NotConnected) {
                    self.connections.mark_lost(backend);
                }
                Err(OrchestratorError::ToolExecution {
                    backend: backend.to_string(),
                    tool: tool.to_string(),
                    elapsed,
                    source,
                })
            }
            Ok(Ok(output)) if output.is_error => {
                permit.failure();
                Err(OrchestratorError::ToolExecution {
                    backend: backend.to_string(),
                    tool: tool.to_string(),
                    elapsed,
                    source: BackendError::Tool(error_text(&output.content)),
                })
            }
            Ok(Ok(output)) => {
                permit.success();
                Ok(output)
            }
        }
    }

    /// List tools from one connected backend (cached per connection)
    pub async fn list_tools(&self, backend: &str) -> OrchestratorResult<Vec<ToolInfo>> {
        if !self.connections.is_configured(backend) {
            return Err(OrchestratorError::unknown(backend));
        }
        let client = self.connections.lease(backend, None)?;

        if let Some(tools) = self.connections.cached_tools(backend) {
            return Ok(tools);
        }

        let timeout = self.connections.timeout_for(backend);
        let started = Instant::now();
        let tools = match tokio::time::timeout(timeout, client.list_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(source)) => {
                return Err(OrchestratorError::ToolExecution {
                    backend: backend.to_string(),
                    tool: "list_tools".to_string(),
                    elapsed: started.elapsed(),
                    source,
                })
            }
            Err(_) => {
                return Err(OrchestratorError::Timeout {
                    backend: backend.to_string(),
                    tool: "list_tools".to_string(),
                    timeout,
                    elapsed: started.elapsed(),
                })
            }
        };

        self.connections.store_tools(backend, &tools);
        tracing::info!(backend = %backend, count = tools.len(), "Tools discovered (cached)");
        Ok(tools)
    }

    /// List tools from every connected backend; failures are logged and skipped
    pub async fn list_all_tools(&self) -> BTreeMap<String, Vec<ToolInfo>> {
        let connected: Vec<&String> = self
            .connections
            .backend_names()
            .iter()
            .filter(|name| self.connections.is_connected(name))
            .collect();

        let results = join_all(connected.iter().map(|name| self.list_tools(name))).await;

        let mut all = BTreeMap::new();
        for (name, result) in connected.into_iter().zip(results) {
            match result {
                Ok(tools) => {
                    all.insert(name.clone(), tools);
                }
                Err(e) => {
                    tracing::warn!(backend = %name, "Failed to list tools: {}", e);
                }
            }
        }
        all
    }
}

fn error_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Null => "backend reported an error".to_string(),
        other => other.to_string(),
    }
}
