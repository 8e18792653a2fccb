//! Tool call metrics and observability
//!
//! Tracks per-backend counts and durations for tool calls. Metrics are
//! in-memory only, advisory, and never consulted for control decisions.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::OrchestratorError;

// ============================================================================
// Per-Backend Metrics
// ============================================================================

/// Metrics for a single backend
#[derive(Debug, Clone, Serialize)]
pub struct BackendMetrics {
    pub backend: String,
    pub total_calls: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub circuit_rejections: u64,
    pub total_duration_ms: u64,
    pub last_error: Option<String>,
    pub last_error_kind: Option<&'static str>,
    /// Average duration in milliseconds (computed)
    pub avg_duration_ms: u64,
}

impl BackendMetrics {
    fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            total_calls: 0,
            success_count: 0,
            error_count: 0,
            timeout_count: 0,
            circuit_rejections: 0,
            total_duration_ms: 0,
            last_error: None,
            last_error_kind: None,
            avg_duration_ms: 0,
        }
    }

    fn record_success(&mut self, duration_ms: u64) {
        self.total_calls += 1;
        self.success_count += 1;
        self.total_duration_ms += duration_ms;
        self.update_avg();
    }

    fn record_error(&mut self, duration_ms: u64, error: &OrchestratorError) {
        self.total_calls += 1;
        self.error_count += 1;
        self.total_duration_ms += duration_ms;
        self.last_error = Some(error.to_string());
        self.last_error_kind = Some(error.kind());
        match error {
            OrchestratorError::Timeout { .. } => self.timeout_count += 1,
            OrchestratorError::CircuitOpen { .. } => self.circuit_rejections += 1,
            _ => {}
        }
        self.update_avg();
    }

    fn update_avg(&mut self) {
        if self.total_calls > 0 {
            self.avg_duration_ms = self.total_duration_ms / self.total_calls;
        }
    }

    /// Success rate as a percentage (0.0 - 100.0)
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 100.0;
        }
        (self.success_count as f64 / self.total_calls as f64) * 100.0
    }
}

// ============================================================================
// Metrics Tracker
// ============================================================================

/// Tracks metrics across all backends
#[derive(Debug, Default)]
pub struct CallMetrics {
    backends: Mutex<HashMap<String, BackendMetrics>>,
}

impl CallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful tool call
    pub fn record_success(&self, backend: &str, tool: &str, duration: Duration) {
        let duration_ms = duration.as_millis() as u64;
        tracing::debug!(
            backend = backend,
            tool = tool,
            duration_ms = duration_ms,
            "Tool call succeeded"
        );
        self.backends
            .lock()
            .entry(backend.to_string())
            .or_insert_with(|| BackendMetrics::new(backend))
            .record_success(duration_ms);
    }

    /// Record a failed tool call
    pub fn record_error(&self, backend: &str, tool: &str, duration: Duration, error: &OrchestratorError) {
        let duration_ms = duration.as_millis() as u64;
        tracing::warn!(
            backend = backend,
            tool = tool,
            duration_ms = duration_ms,
            error_kind = error.kind(),
            "Tool call failed: {}",
            error
        );
        self.backends
            .lock()
            .entry(backend.to_string())
            .or_insert_with(|| BackendMetrics::new(backend))
            .record_error(duration_ms, error);
    }

    /// Get metrics for a specific backend
    pub fn get_backend(&self, backend: &str) -> Option<BackendMetrics> {
        self.backends.lock().get(backend).cloned()
    }

    /// Get a snapshot of all metrics, sorted by backend name
    pub fn snapshot(&self) -> Vec<BackendMetrics> {
        let mut all: Vec<_> = self.backends.lock().values().cloned().collect();
        all.sort_by(|a, b| a.backend.cmp(&b.backend));
        all
    }

    /// Get total calls across all backends
    pub fn total_calls(&self) -> u64 {
        self.backends.lock().values().map(|s| s.total_calls).sum()
    }

    /// Get total errors across all backends
    pub fn total_errors(&self) -> u64 {
        self.backends.lock().values().map(|s| s.error_count).sum()
    }
}

/// Aggregate statistics exposed by the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub active_connections: usize,
    pub total_calls: u64,
    pub total_failures: u64,
    pub in_flight: usize,
    pub backends: Vec<BackendMetrics>,
}

// ============================================================================
// Tests
// ============================================================================
