//! Per-backend circuit breakers
//!
//! Three states:
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls are rejected without touching the backend
//! - HalfOpen: a single probe call is admitted to test recovery
//!
//! ```text
//! Closed   → Open:     consecutive failures >= failure_threshold
//! Open     → HalfOpen: open_duration elapsed (checked lazily)
//! HalfOpen → Closed:   probe succeeds
//! HalfOpen → Open:     probe fails (timer restarts)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub backend: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub last_transition: Instant,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_transition: Instant,
    probe_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_transition: Instant::now(),
            probe_in_flight: false,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.last_transition = Instant::now();
        self.probe_in_flight = false;
        if to == CircuitState::Closed {
            self.consecutive_failures = 0;
        }
    }
}

/// Circuit breaker for one backend
pub struct CircuitBreaker {
    backend: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(backend: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            backend: backend.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Apply the time-based Open → HalfOpen transition
    fn refresh(&self, state: &mut BreakerState) {
        if state.state == CircuitState::Open
            && state.last_transition.elapsed() >= self.config.open_duration
        {
            info!(backend = %self.backend, "Circuit transitioning from Open to HalfOpen");
            state.transition(CircuitState::HalfOpen);
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        state.state
    }

    /// Whether a call would currently be rejected
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => true,
            CircuitState::HalfOpen => state.probe_in_flight,
        }
    }

    /// Admit a call, or return how long until a probe will be allowed.
    ///
    /// The returned permit must be settled with [`CallPermit::success`] or
    /// [`CallPermit::failure`]; dropping it unsettled frees the probe slot.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, Duration> {
        let mut state = self.state.lock();
        self.refresh(&mut state);

        match state.state {
            CircuitState::Closed => Ok(CallPermit::new(Arc::clone(self), false)),
            CircuitState::Open => Err(self
                .config
                .open_duration
                .saturating_sub(state.last_transition.elapsed())),
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(Duration::ZERO)
                } else {
                    debug!(backend = %self.backend, "Admitting half-open probe");
                    state.probe_in_flight = true;
                    Ok(CallPermit::new(Arc::clone(self), true))
                }
            }
        }
    }

    /// Record a success that did not go through a permit (health checks)
    pub fn record_success(&self) {
        self.on_success(false);
    }

    /// Record a failure that did not go through a permit (health checks)
    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    fn on_success(&self, probe: bool) {
        let mut state = self.state.lock();
        self.refresh(&mut state);

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen if probe || !state.probe_in_flight => {
                info!(backend = %self.backend, "Circuit transitioning from HalfOpen to Closed");
                state.transition(CircuitState::Closed);
            }
            _ => {
                debug!(backend = %self.backend, state = %state.state, "Ignoring late success");
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        state.last_failure = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                debug!(
                    backend = %self.backend,
                    consecutive_failures = state.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Failure recorded in Closed state"
                );
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        backend = %self.backend,
                        consecutive_failures = state.consecutive_failures,
                        "Circuit transitioning from Closed to Open"
                    );
                    state.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if probe || !state.probe_in_flight => {
                state.consecutive_failures += 1;
                warn!(backend = %self.backend, "Probe failed - reopening circuit");
                state.transition(CircuitState::Open);
            }
            _ => {
                state.consecutive_failures += 1;
            }
        }
    }

    fn release_probe(&self) {
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen {
            debug!(backend = %self.backend, "Probe abandoned - slot released");
            state.probe_in_flight = false;
        }
    }

    /// Open the circuit regardless of the failure count
    pub fn force_open(&self) {
        let mut state = self.state.lock();
        if state.state != CircuitState::Open {
            warn!(backend = %self.backend, "Circuit forced open");
            state.transition(CircuitState::Open);
        }
    }

    /// Return to Closed with a zero failure count
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.state != CircuitState::Closed || state.consecutive_failures > 0 {
            debug!(backend = %self.backend, "Circuit reset");
        }
        state.transition(CircuitState::Closed);
        state.last_failure = None;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut state = self.state.lock();
        self.refresh(&mut state);
        CircuitSnapshot {
            backend: self.backend.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            last_failure: state.last_failure,
            last_transition: state.last_transition,
        }
    }
}

/// Admission ticket for one call through a breaker
#[must_use = "settle the permit with success() or failure()"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    fn new(breaker: Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Breakers for all backends, created on first connect
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the breaker for a backend, creating it if needed
    pub fn ensure(&self, backend: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(backend) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(backend.to_string()).or_insert_with(|| {
            debug!(backend = %backend, "Registering circuit breaker");
            Arc::new(CircuitBreaker::new(backend, self.config.clone()))
        }))
    }

    pub fn get(&self, backend: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(backend).cloned()
    }

    pub fn contains(&self, backend: &str) -> bool {
        self.breakers.read().contains_key(backend)
    }

    /// Drop every breaker
    pub fn clear(&self) {
        self.breakers.write().clear();
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.backend.cmp(&b.backend));
        snapshots
    }
}
