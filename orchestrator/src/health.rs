//! Health Monitor
//!
//! On-demand and periodic health checks. A check leases the backend's client,
//! runs its probe with a bounded number of retries, and feeds the final
//! outcome to the backend's circuit breaker. Disconnected backends are
//! reported unhealthy without a probe.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::circuit::{CircuitRegistry, CircuitState};
use crate::client::BackendError;
use crate::config::HealthConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Result of one health check
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub backend: String,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    /// Latency of the successful probe
    #[serde(
        rename = "latency_ms",
        serialize_with = "crate::config::duration_millis::option::serialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub latency: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Probes sent (0 when the backend was not probed)
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitState>,
}

impl HealthStatus {
    fn unprobed(backend: &str, error: impl Into<String>) -> Self {
        Self {
            backend: backend.to_string(),
            healthy: false,
            checked_at: Utc::now(),
            latency: None,
            error: Some(error.into()),
            attempts: 0,
            connection: None,
            circuit: None,
        }
    }
}

/// Runs health checks and keeps the latest status per backend
pub struct HealthMonitor {
    connections: Arc<ConnectionManager>,
    breakers: Arc<CircuitRegistry>,
    config: HealthConfig,
    statuses: RwLock<HashMap<String, HealthStatus>>,
}

impl HealthMonitor {
    pub(crate) fn new(
        connections: Arc<ConnectionManager>,
        breakers: Arc<CircuitRegistry>,
        config: HealthConfig,
    ) -> Self {
        Self {
            connections,
            breakers,
            config,
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Check one backend. Fails only for names that are not configured.
    pub async fn health_check(&self, backend: &str) -> OrchestratorResult<HealthStatus> {
        if !self.connections.is_configured(backend) {
            return Err(OrchestratorError::unknown(backend));
        }
        let status = self.check(backend).await;
        self.statuses
            .write()
            .insert(backend.to_string(), status.clone());
        Ok(status)
    }

    /// Check every enabled backend concurrently. Never fails.
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthStatus> {
        let names = self.connections.backend_names();
        let statuses = join_all(names.iter().map(|name| self.check(name))).await;

        let mut cache = self.statuses.write();
        names
            .iter()
            .cloned()
            .zip(statuses)
            .map(|(name, status)| {
                cache.insert(name.clone(), status.clone());
                (name, status)
            })
            .collect()
    }

    /// Most recent status recorded for a backend
    pub fn last_status(&self, backend: &str) -> Option<HealthStatus> {
        self.statuses.read().get(backend).cloned()
    }

    async fn check(&self, backend: &str) -> HealthStatus {
        let Some(state) = self.connections.state(backend) else {
            return HealthStatus::unprobed(backend, "backend is disabled");
        };

        let client = match self.connections.lease(backend, None) {
            Ok(client) => client,
            Err(_) => {
                let mut status = HealthStatus::unprobed(backend, "not connected");
                status.connection = self.connections.state(backend).or(Some(state));
                status.circuit = self.breakers.get(backend).map(|b| b.state());
                return status;
            }
        };

        let timeout = self.connections.timeout_for(backend);
        let max_attempts = self.config.probe_retries.saturating_add(1);
        let mut attempts = 0;
        let mut latency = None;
        let mut last_error = None;
        let mut lost = false;

        while attempts < max_attempts {
            if attempts > 0 {
                tokio::time::sleep(self.config.probe_retry_delay).await;
            }
            attempts += 1;

            let started = Instant::now();
            match tokio::time::timeout(timeout, client.health_check()).await {
                Ok(Ok(())) => {
                    latency = Some(started.elapsed());
                    last_error = None;
                    break;
                }
                Ok(Err(BackendError::NotConnected)) => {
                    self.connections.mark_lost(backend);
                    lost = true;
                    last_error = Some(BackendError::NotConnected.to_string());
                    break;
                }
                Ok(Err(e)) => {
                    tracing::debug!(backend = %backend, attempt = attempts, "Health probe failed: {}", e);
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    tracing::debug!(backend = %backend, attempt = attempts, "Health probe timed out");
                    last_error = Some(format!("health probe timed out after {:?}", timeout));
                }
            }
        }
        drop(client);

        let healthy = last_error.is_none();
        let breaker = self.breakers.ensure(backend);
        if healthy {
            breaker.record_success();
        } else if lost {
            // Calls fail fast until a reconnect resets the breaker
            breaker.force_open();
        } else {
            tracing::warn!(
                backend = %backend,
                attempts,
                "Backend unhealthy: {}",
                last_error.as_deref().unwrap_or_default()
            );
            breaker.record_failure();
        }

        HealthStatus {
            backend: backend.to_string(),
            healthy,
            checked_at: Utc::now(),
            latency,
            error: last_error,
            attempts,
            connection: self.connections.state(backend),
            circuit: Some(breaker.state()),
        }
    }

    /// One pass of the background loop
    async fn run_cycle(&self, auto_reconnect: bool) {
        self.connections.detect_lost();
        if auto_reconnect {
            let lost = self.connections.lost_backends();
            if !lost.is_empty() {
                tracing::info!(backends = ?lost, "Reconnecting lost backends");
                let results = join_all(lost.iter().map(|name| self.connections.reconnect(name))).await;
                for (name, result) in lost.iter().zip(results) {
                    if let Err(e) = result {
                        tracing::warn!(backend = %name, "Reconnect failed: {}", e);
                    }
                }
            }
        }

        let statuses = self.health_check_all().await;
        let unhealthy = statuses.values().filter(|s| !s.healthy).count();
        tracing::debug!(backends = statuses.len(), unhealthy, "Health cycle complete");
    }
}

/// Handle to the background health loop
pub(crate) struct HealthLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthLoop {
    /// Spawn the loop; the first cycle runs one interval after spawning
    pub(crate) fn spawn(monitor: Arc<HealthMonitor>, interval: Duration, auto_reconnect: bool) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_ms = interval.as_millis() as u64, "Health loop started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = monitor.run_cycle(auto_reconnect) => {}
                }
            }

            tracing::info!("Health loop stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the loop and wait for it to exit
    pub(crate) async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!("Health loop panicked: {}", e);
            }
        }
    }

    /// Stop without waiting
    pub(crate) fn abort(&self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}
