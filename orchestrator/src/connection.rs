//! Connection Manager
//!
//! Owns one client handle per enabled backend. Connects run concurrently and
//! independently, each retrying with exponential backoff; a per-backend
//! lifecycle lock serialises connect/disconnect so concurrent callers never
//! create a second handle for the same backend.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::circuit::CircuitRegistry;
use crate::client::{BackendClient, ClientFactory, ToolInfo};
use crate::config::{BackendConfig, OrchestratorConfig};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Lifecycle state of a backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// A backend that could not be connected
#[derive(Debug, Clone, Serialize)]
pub struct ConnectFailure {
    pub backend: String,
    pub attempts: u32,
    pub error: String,
}

/// Per-backend outcome of [`ConnectionManager::connect_all`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectReport {
    /// Newly connected by this call
    pub connected: Vec<String>,
    /// Already connected before this call
    pub already_connected: Vec<String>,
    pub failed: Vec<ConnectFailure>,
}

impl ConnectReport {
    /// Number of enabled backends this call covered
    pub fn attempted(&self) -> usize {
        self.connected.len() + self.already_connected.len() + self.failed.len()
    }

    /// At least one backend is usable
    pub fn is_usable(&self) -> bool {
        !self.connected.is_empty() || !self.already_connected.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Status line for one connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub backend: String,
    pub state: ConnectionState,
    pub idle_secs: Option<u64>,
}

enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    Failed { attempts: u32, error: String },
}

// =============================================================================
// Managed Connection (internal)
// =============================================================================

struct Connection {
    client: Option<Arc<dyn BackendClient>>,
    state: ConnectionState,
    last_activity: Option<Instant>,
    /// Was connected, then the client reported the session gone
    lost: bool,
    tools_cache: Option<Vec<ToolInfo>>,
}

struct Slot {
    config: BackendConfig,
    lifecycle: Mutex<()>,
    conn: RwLock<Connection>,
}

impl Slot {
    fn new(config: BackendConfig) -> Self {
        Self {
            config,
            lifecycle: Mutex::new(()),
            conn: RwLock::new(Connection {
                client: None,
                state: ConnectionState::Disconnected,
                last_activity: None,
                lost: false,
                tools_cache: None,
            }),
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_live(&self) -> bool {
        let conn = self.conn.read();
        conn.state == ConnectionState::Connected && conn.client.is_some()
    }

    fn set_state(&self, state: ConnectionState) {
        self.conn.write().state = state;
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Owns the client handles for all configured backends
pub struct ConnectionManager {
    config: Arc<OrchestratorConfig>,
    factory: Arc<dyn ClientFactory>,
    slots: HashMap<String, Arc<Slot>>,
    /// Enabled backend names in configuration order
    order: Vec<String>,
    connect_permits: Semaphore,
    breakers: Arc<CircuitRegistry>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        factory: Arc<dyn ClientFactory>,
        breakers: Arc<CircuitRegistry>,
    ) -> Self {
        let order: Vec<String> = config.enabled_backends().map(|b| b.name.clone()).collect();
        let slots = config
            .enabled_backends()
            .map(|b| (b.name.clone(), Arc::new(Slot::new(b.clone()))))
            .collect();
        let connect_permits = Semaphore::new(config.max_concurrent_connects);

        Self {
            config,
            factory,
            slots,
            order,
            connect_permits,
            breakers,
        }
    }

    /// Enabled backend names, in configuration order
    pub fn backend_names(&self) -> &[String] {
        &self.order
    }

    /// Resolve a name to its slot; disabled backends are a connection error
    fn slot(&self, name: &str, tool: Option<&str>) -> OrchestratorResult<&Arc<Slot>> {
        match self.slots.get(name) {
            Some(slot) => Ok(slot),
            None if self.config.backend(name).is_some() => Err(OrchestratorError::Connection {
                backend: name.to_string(),
                tool: tool.map(str::to_string),
                message: "backend is disabled".to_string(),
            }),
            None => Err(OrchestratorError::unknown(name)),
        }
    }

    /// Whether `name` is present in the configuration at all
    pub fn is_configured(&self, name: &str) -> bool {
        self.config.backend(name).is_some()
    }

    /// Connect every enabled backend.
    ///
    /// Individual failures are collected into the report; the call only fails
    /// when backends are enabled and none of them is usable.
    pub async fn connect_all(&self) -> OrchestratorResult<ConnectReport> {
        for name in &self.order {
            self.breakers.ensure(name);
        }

        let outcomes = join_all(
            self.order
                .iter()
                .map(|name| self.connect_slot(&self.slots[name], false)),
        )
        .await;

        let mut report = ConnectReport::default();
        for (name, outcome) in self.order.iter().zip(outcomes) {
            match outcome {
                ConnectOutcome::Connected => report.connected.push(name.clone()),
                ConnectOutcome::AlreadyConnected => report.already_connected.push(name.clone()),
                ConnectOutcome::Failed { attempts, error } => report.failed.push(ConnectFailure {
                    backend: name.clone(),
                    attempts,
                    error,
                }),
            }
        }

        for failure in &report.failed {
            tracing::warn!(
                backend = %failure.backend,
                attempts = failure.attempts,
                "Backend failed to connect: {}",
                failure.error
            );
        }
        tracing::info!(
            connected = report.connected.len(),
            already_connected = report.already_connected.len(),
            failed = report.failed.len(),
            "connect_all finished"
        );

        if !report.is_usable() && report.attempted() > 0 {
            return Err(OrchestratorError::NoBackendsAvailable {
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    /// Disconnect and re-establish one backend
    pub async fn reconnect(&self, name: &str) -> OrchestratorResult<()> {
        let slot = self.slot(name, None)?;
        self.breakers.ensure(name);

        match self.connect_slot(slot, true).await {
            ConnectOutcome::Connected | ConnectOutcome::AlreadyConnected => Ok(()),
            ConnectOutcome::Failed { attempts, error } => Err(OrchestratorError::Connection {
                backend: name.to_string(),
                tool: None,
                message: format!("reconnect failed after {} attempts: {}", attempts, error),
            }),
        }
    }

    /// Close every live connection. Never fails; errors are logged.
    pub async fn disconnect_all(&self) {
        join_all(self.order.iter().map(|name| async move {
            let slot = &self.slots[name];
            let _guard = slot.lifecycle.lock().await;
            self.close_locked(slot).await;
        }))
        .await;

        self.breakers.clear();
        tracing::info!("All backends disconnected");
    }

    /// Pure state read: connected and the client agrees
    ///
    /// A session the client reports as gone reads as disconnected here but is
    /// only recorded as lost by [`detect_lost`](Self::detect_lost) or by the
    /// next operation that leases the client.
    pub fn is_connected(&self, name: &str) -> bool {
        self.connected_client(name)
            .map(|client| client.is_connected())
            .unwrap_or(false)
    }

    fn connected_client(&self, name: &str) -> Option<Arc<dyn BackendClient>> {
        let conn = self.slots.get(name)?.conn.read();
        match (&conn.client, conn.state) {
            (Some(client), ConnectionState::Connected) => Some(Arc::clone(client)),
            _ => None,
        }
    }

    /// Mark every connected backend whose client dropped its session as lost
    pub fn detect_lost(&self) {
        for name in &self.order {
            if let Some(client) = self.connected_client(name) {
                if !client.is_connected() {
                    self.mark_lost(name);
                }
            }
        }
    }

    /// Record that a connected backend's session went away
    pub fn mark_lost(&self, name: &str) {
        if let Some(slot) = self.slots.get(name) {
            let mut conn = slot.conn.write();
            if conn.state == ConnectionState::Connected {
                tracing::warn!(backend = %name, "Connection lost");
                conn.state = ConnectionState::Disconnected;
                conn.lost = true;
            }
        }
    }

    /// Backends whose connection was lost and not yet re-established
    pub fn lost_backends(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| {
                let conn = self.slots[*name].conn.read();
                conn.lost && conn.state == ConnectionState::Disconnected
            })
            .cloned()
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<ConnectionState> {
        self.slots.get(name).map(|slot| slot.conn.read().state)
    }

    /// Number of backends currently connected
    pub fn active_count(&self) -> usize {
        self.order.iter().filter(|name| self.is_connected(name)).count()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.order
            .iter()
            .map(|name| {
                let conn = self.slots[name].conn.read();
                ConnectionInfo {
                    backend: name.clone(),
                    state: conn.state,
                    idle_secs: conn.last_activity.map(|t| t.elapsed().as_secs()),
                }
            })
            .collect()
    }

    /// Effective call timeout for a backend
    pub fn timeout_for(&self, name: &str) -> Duration {
        self.config
            .backend(name)
            .map(|b| self.config.effective_timeout(b))
            .unwrap_or(self.config.default_timeout)
    }

    pub(crate) fn backend_config(&self, name: &str) -> Option<&BackendConfig> {
        self.slots.get(name).map(|slot| &slot.config)
    }

    /// Tool list cached since the current connection was established
    pub(crate) fn cached_tools(&self, name: &str) -> Option<Vec<ToolInfo>> {
        self.slots.get(name)?.conn.read().tools_cache.clone()
    }

    pub(crate) fn store_tools(&self, name: &str, tools: &[ToolInfo]) {
        if let Some(slot) = self.slots.get(name) {
            let mut conn = slot.conn.write();
            if conn.state == ConnectionState::Connected {
                conn.tools_cache = Some(tools.to_vec());
            }
        }
    }

    /// Short-lived access to a connected client for a single operation
    ///
    /// The handle stays owned by the manager; callers drop the lease as soon as
    /// the operation completes.
    pub(crate) fn lease(
        &self,
        name: &str,
        tool: Option<&str>,
    ) -> OrchestratorResult<Arc<dyn BackendClient>> {
        let slot = self.slot(name, tool)?;
        let Some(client) = self.connected_client(name) else {
            return Err(OrchestratorError::not_connected(name, tool));
        };
        if !client.is_connected() {
            self.mark_lost(name);
            return Err(OrchestratorError::not_connected(name, tool));
        }

        slot.conn.write().last_activity = Some(Instant::now());
        Ok(client)
    }

    async fn connect_slot(&self, slot: &Slot, reconnect: bool) -> ConnectOutcome {
        let _guard = slot.lifecycle.lock().await;

        if reconnect {
            self.close_locked(slot).await;
        } else if slot.is_live() {
            tracing::debug!(backend = %slot.name(), "Already connected");
            return ConnectOutcome::AlreadyConnected;
        }

        let state = if reconnect {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        self.establish_locked(slot, state).await
    }

    /// Create a client and connect it with retry. Lifecycle lock must be held.
    async fn establish_locked(&self, slot: &Slot, state: ConnectionState) -> ConnectOutcome {
        let name = slot.name();
        slot.set_state(state);

        let client = match self.factory.create(&slot.config) {
            Ok(client) => client,
            Err(e) => {
                slot.set_state(ConnectionState::Disconnected);
                return ConnectOutcome::Failed {
                    attempts: 0,
                    error: format!("failed to create client: {}", e),
                };
            }
        };

        let timeout = self.config.effective_timeout(&slot.config);
        let max_attempts = slot.config.max_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = slot.config.backoff_delay(attempt - 1);
                tracing::debug!(backend = %name, attempt, delay_ms = delay.as_millis() as u64, "Retrying connect");
                tokio::time::sleep(delay).await;
            }

            let result = {
                let _permit = match self.connect_permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        last_error = "connection manager closed".to_string();
                        break;
                    }
                };
                tokio::time::timeout(timeout, client.connect()).await
            };

            match result {
                Ok(Ok(())) => {
                    {
                        let mut conn = slot.conn.write();
                        conn.client = Some(client);
                        conn.state = ConnectionState::Connected;
                        conn.last_activity = Some(Instant::now());
                        conn.lost = false;
                    }
                    self.breakers.ensure(name).reset();
                    tracing::info!(backend = %name, attempts = attempt + 1, "Backend connected");
                    return ConnectOutcome::Connected;
                }
                Ok(Err(e)) => {
                    tracing::debug!(backend = %name, attempt = attempt + 1, "Connect attempt failed: {}", e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    tracing::debug!(backend = %name, attempt = attempt + 1, "Connect attempt timed out");
                    last_error = format!("connect timed out after {:?}", timeout);
                }
            }
        }

        self.shutdown_client(slot, client).await;
        slot.set_state(ConnectionState::Disconnected);

        ConnectOutcome::Failed {
            attempts: max_attempts,
            error: last_error,
        }
    }

    /// Take the client out of the slot and disconnect it. Lifecycle lock must be held.
    async fn close_locked(&self, slot: &Slot) {
        let name = slot.name();
        let client = {
            let mut conn = slot.conn.write();
            conn.state = ConnectionState::Disconnected;
            conn.lost = false;
            conn.tools_cache = None;
            conn.client.take()
        };

        let Some(client) = client else {
            return;
        };

        tracing::info!(backend = %name, "Disconnecting backend");
        self.shutdown_client(slot, client).await;
    }

    /// Disconnect a client, bounded by the backend timeout. Errors and panics
    /// are logged and never propagate.
    async fn shutdown_client(&self, slot: &Slot, client: Arc<dyn BackendClient>) {
        let name = slot.name();
        let timeout = self.config.effective_timeout(&slot.config);
        let disconnect = AssertUnwindSafe(client.disconnect()).catch_unwind();

        match tokio::time::timeout(timeout, disconnect).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(backend = %name, "Error disconnecting: {}", e),
            Ok(Err(_)) => tracing::error!(backend = %name, "Client panicked during disconnect"),
            Err(_) => tracing::warn!(backend = %name, "Disconnect timed out after {:?}", timeout),
        }
    }
}
