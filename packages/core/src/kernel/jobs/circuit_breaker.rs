//! Circuit Breaker Registry (§4.2) — one `closed -> open -> half-open ->
//! closed` state machine per provider id, process-local and shared.
//!
//! Grounded on the three-state design described in `other_examples`'
//! circuit-breaker module, reduced to the spec's simpler shape: no tower
//! middleware layering, no generic telemetry callbacks, just an
//! `admit`/`record` façade behind a small thread-safe cell per provider
//! (§9: "isolate it behind a small thread-safe façade rather than ambient
//! globals, so tests can inject a fresh one").

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, open_timeout: Duration::from_secs(60) }
    }
}

struct Cell {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Whether the single half-open probe is currently in flight. Caps
    /// admission at exactly one probe per half-open window (§4.2:
    /// `half_open_probe = 1`).
    probe_in_flight: bool,
}

impl Cell {
    fn new() -> Self {
        Self { state: CircuitState::Closed, consecutive_failures: 0, opened_at: None, probe_in_flight: false }
    }
}

/// Per-provider circuit breaker state, shared across the process and
/// rebuilt on restart (it is explicitly not persisted, §3).
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    cells: Mutex<HashMap<String, Cell>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, cells: Mutex::new(HashMap::new()) }
    }

    /// Must be called before any provider request (§4.2).
    pub fn admit(&self, provider: &str) -> Admission {
        let mut cells = self.cells.lock().expect("circuit breaker mutex poisoned");
        let cell = cells.entry(provider.to_string()).or_insert_with(Cell::new);

        match cell.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = cell.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.open_timeout && !cell.probe_in_flight {
                    cell.state = CircuitState::HalfOpen;
                    cell.probe_in_flight = true;
                    info!(provider, "circuit breaker transitioning to half-open, admitting probe");
                    Admission::Allowed
                } else {
                    Admission::Denied
                }
            }
            CircuitState::HalfOpen => {
                // Only the probe that flipped us into half-open is ever
                // admitted; every other concurrent caller is denied until
                // that probe settles via `record`.
                Admission::Denied
            }
        }
    }

    /// Thread-safe; may be called concurrently with reads from `admit`.
    pub fn record(&self, provider: &str, outcome: Outcome) {
        let mut cells = self.cells.lock().expect("circuit breaker mutex poisoned");
        let cell = cells.entry(provider.to_string()).or_insert_with(Cell::new);

        match (cell.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                cell.consecutive_failures = 0;
            }
            (CircuitState::Closed, Outcome::Failure) => {
                cell.consecutive_failures += 1;
                if cell.consecutive_failures >= self.config.failure_threshold {
                    cell.state = CircuitState::Open;
                    cell.opened_at = Some(Instant::now());
                    warn!(provider, failures = cell.consecutive_failures, "circuit breaker opened");
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                cell.state = CircuitState::Closed;
                cell.consecutive_failures = 0;
                cell.probe_in_flight = false;
                info!(provider, "circuit breaker closed after successful probe");
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                cell.state = CircuitState::Open;
                cell.opened_at = Some(Instant::now());
                cell.probe_in_flight = false;
                warn!(provider, "circuit breaker probe failed, reopening");
            }
            (CircuitState::Open, _) => {
                // A stray result from a request that raced the open
                // transition; state is already authoritative.
            }
        }
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        self.cells
            .lock()
            .expect("circuit breaker mutex poisoned")
            .get(provider)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
