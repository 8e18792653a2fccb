//! Orchestrator facade
//!
//! Composes the connection manager, router, executor and health monitor behind
//! one cloneable handle with an explicit `start`/`stop` lifecycle.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Mutex;

use crate::circuit::{CircuitRegistry, CircuitSnapshot};
use crate::client::{ClientFactory, ToolInfo};
use crate::config::OrchestratorConfig;
use crate::connection::{ConnectReport, ConnectionInfo, ConnectionManager};
use crate::error::OrchestratorResult;
use crate::executor::{BatchOptions, ParallelExecutor};
use crate::health::{HealthLoop, HealthMonitor, HealthStatus};
use crate::metrics::{CallMetrics, OrchestratorStats};
use crate::router::{CallTracker, ToolRouter};
use crate::types::{ToolCall, ToolResult};

struct Lifecycle {
    running: bool,
    health_loop: Option<HealthLoop>,
}

struct Inner {
    config: Arc<OrchestratorConfig>,
    connections: Arc<ConnectionManager>,
    breakers: Arc<CircuitRegistry>,
    router: ToolRouter,
    executor: ParallelExecutor,
    health: Arc<HealthMonitor>,
    metrics: Arc<CallMetrics>,
    tracker: Arc<CallTracker>,
    lifecycle: Mutex<Lifecycle>,
}

/// Entry point for connecting to backends and calling their tools.
///
/// Cloning is cheap; all clones share the same connections and lifecycle.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator. Nothing is connected until [`start`](Self::start)
    /// or [`connect_all`](Self::connect_all).
    pub fn new(config: OrchestratorConfig, factory: Arc<dyn ClientFactory>) -> OrchestratorResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let breakers = Arc::new(CircuitRegistry::new(config.circuit_breaker.clone()));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&config),
            factory,
            Arc::clone(&breakers),
        ));
        let metrics = Arc::new(CallMetrics::new());
        let tracker = Arc::new(CallTracker::new());
        let router = ToolRouter::new(
            Arc::clone(&connections),
            Arc::clone(&breakers),
            Arc::clone(&metrics),
            Arc::clone(&tracker),
        );
        let executor = ParallelExecutor::new(router.clone(), config.max_concurrency);
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&connections),
            Arc::clone(&breakers),
            config.health.clone(),
        ));

        tracing::debug!(
            backends = config.backends.len(),
            enabled = connections.backend_names().len(),
            "Orchestrator created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connections,
                breakers,
                router,
                executor,
                health,
                metrics,
                tracker,
                lifecycle: Mutex::new(Lifecycle {
                    running: false,
                    health_loop: None,
                }),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connect all backends and start the health loop. Calling it again while
    /// running only connects backends that are not connected yet.
    pub async fn start(&self) -> OrchestratorResult<ConnectReport> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.tracker.renew();

        let report = self.inner.connections.connect_all().await?;

        if lifecycle.health_loop.is_none() {
            lifecycle.health_loop = Some(HealthLoop::spawn(
                Arc::clone(&self.inner.health),
                self.inner.config.health_check_interval,
                self.inner.config.auto_reconnect,
            ));
        }
        lifecycle.running = true;

        tracing::info!(
            connected = report.connected.len() + report.already_connected.len(),
            failed = report.failed.len(),
            "Orchestrator started"
        );
        Ok(report)
    }

    /// Stop the health loop, drain in-flight calls and disconnect everything.
    ///
    /// Calls still running after `shutdown_grace` are cancelled. Safe to call
    /// any number of times.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !lifecycle.running && self.inner.connections.active_count() == 0 {
            tracing::debug!("Orchestrator already stopped");
            return;
        }

        if let Some(health_loop) = lifecycle.health_loop.take() {
            health_loop.stop().await;
        }

        let tracker = &self.inner.tracker;
        let grace = self.inner.config.shutdown_grace;
        if tracker.in_flight() > 0 {
            tracing::info!(in_flight = tracker.in_flight(), "Waiting for in-flight calls");
            if tokio::time::timeout(grace, tracker.wait_idle()).await.is_err() {
                tracing::warn!(
                    remaining = tracker.in_flight(),
                    grace_ms = grace.as_millis() as u64,
                    "Grace period elapsed, cancelling in-flight calls"
                );
                tracker.cancel_all();
                if tokio::time::timeout(grace, tracker.wait_idle()).await.is_err() {
                    tracing::warn!(remaining = tracker.in_flight(), "Cancelled calls did not unwind");
                }
            }
        }

        self.inner.connections.disconnect_all().await;
        // Cancellation covers only the calls drained above
        tracker.renew();
        lifecycle.running = false;
        tracing::info!("Orchestrator stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().await.running
    }

    /// Start, run `f`, then stop on every exit path.
    ///
    /// `stop()` runs after a normal return and after a panic (the panic is
    /// resumed once shutdown is done). If the returned future is dropped
    /// early, shutdown is spawned onto the current runtime.
    pub async fn run_scoped<F, Fut, T>(&self, f: F) -> OrchestratorResult<T>
    where
        F: FnOnce(Orchestrator) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut guard = StopOnDrop(Some(self.clone()));
        if let Err(e) = self.start().await {
            self.stop().await;
            guard.disarm();
            return Err(e);
        }

        let outcome = AssertUnwindSafe(f(self.clone())).catch_unwind().await;
        self.stop().await;
        guard.disarm();

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => {
                tracing::error!("Scoped task panicked; orchestrator stopped");
                std::panic::resume_unwind(panic)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    pub async fn connect_all(&self) -> OrchestratorResult<ConnectReport> {
        self.inner.connections.connect_all().await
    }

    pub async fn disconnect_all(&self) {
        self.inner.connections.disconnect_all().await
    }

    pub async fn reconnect(&self, backend: &str) -> OrchestratorResult<()> {
        self.inner.connections.reconnect(backend).await
    }

    pub fn is_connected(&self, backend: &str) -> bool {
        self.inner.connections.is_connected(backend)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.connections.connections()
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    /// Call one tool. `timeout` overrides the backend's timeout for this call.
    pub async fn call_tool(
        &self,
        backend: &str,
        tool: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> OrchestratorResult<ToolResult> {
        let mut call = ToolCall::new(backend, tool, params);
        call.timeout = timeout;
        self.inner.router.call_tool(call).await
    }

    /// Call one tool described by a prepared [`ToolCall`]
    pub async fn call(&self, call: ToolCall) -> OrchestratorResult<ToolResult> {
        self.inner.router.call_tool(call).await
    }

    /// Run a batch with graceful degradation; results follow input order
    pub async fn call_tools_parallel(&self, calls: Vec<ToolCall>) -> Vec<ToolResult> {
        self.inner.executor.execute(calls, BatchOptions::default()).await
    }

    pub async fn call_tools_parallel_with(
        &self,
        calls: Vec<ToolCall>,
        options: BatchOptions,
    ) -> Vec<ToolResult> {
        self.inner.executor.execute(calls, options).await
    }

    pub async fn list_tools(&self, backend: &str) -> OrchestratorResult<Vec<ToolInfo>> {
        self.inner.router.list_tools(backend).await
    }

    pub async fn list_all_tools(&self) -> BTreeMap<String, Vec<ToolInfo>> {
        self.inner.router.list_all_tools().await
    }

    // -------------------------------------------------------------------------
    // Health & stats
    // -------------------------------------------------------------------------

    pub async fn health_check(&self, backend: &str) -> OrchestratorResult<HealthStatus> {
        self.inner.health.health_check(backend).await
    }

    pub async fn health_check_all(&self) -> BTreeMap<String, HealthStatus> {
        self.inner.health.health_check_all().await
    }

    /// Latest cached health status, if the backend was ever checked
    pub fn last_health(&self, backend: &str) -> Option<HealthStatus> {
        self.inner.health.last_status(backend)
    }

    pub fn circuit(&self, backend: &str) -> Option<CircuitSnapshot> {
        self.inner.breakers.get(backend).map(|b| b.snapshot())
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.inner.breakers.snapshots()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            active_connections: self.inner.connections.active_count(),
            total_calls: self.inner.metrics.total_calls(),
            total_failures: self.inner.metrics.total_errors(),
            in_flight: self.inner.tracker.in_flight(),
            backends: self.inner.metrics.snapshot(),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut();
        if let Some(health_loop) = lifecycle.health_loop.take() {
            health_loop.abort();
        }
        if !lifecycle.running {
            return;
        }

        tracing::warn!("Orchestrator dropped while running; cancelling in-flight calls");
        self.tracker.cancel_all();

        match Handle::try_current() {
            Ok(handle) => {
                let connections = Arc::clone(&self.connections);
                handle.spawn(async move {
                    connections.disconnect_all().await;
                });
            }
            Err(_) => {
                tracing::warn!("No runtime available; backend connections closed without disconnect");
            }
        }
    }
}

/// Spawns `stop()` if a scope is left without reaching its own shutdown
struct StopOnDrop(Option<Orchestrator>);

impl StopOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        let Some(orchestrator) = self.0.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("Scope cancelled; stopping orchestrator in the background");
                handle.spawn(async move {
                    orchestrator.stop().await;
                });
            }
            Err(_) => tracing::warn!("Scope cancelled outside a runtime; orchestrator not stopped"),
        }
    }
}
