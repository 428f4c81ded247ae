//! Process-wide circuit breaker guarding the backend.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: probe requests allowed after the cooldown
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     consecutive failures >= failure_threshold
//! Open     → HalfOpen: cooldown elapsed since last failure (checked on read)
//! HalfOpen → Closed:   consecutive successes >= success_threshold
//! HalfOpen → Open:     any failure
//! ```
//!
//! One breaker covers the whole backend. All reads and writes go through a
//! single mutex, including the lazy Open → HalfOpen transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds for the circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time since the last failure before a probe is allowed.
    pub cooldown: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Point-in-time view of the breaker for logging and status screens.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerDiagnostics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    last_failure_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
}

impl BreakerInner {
    /// Apply the time-based Open → HalfOpen transition.
    fn refresh(&mut self, cooldown: Duration) {
        if self.state != CircuitState::Open {
            return;
        }
        let cooled_down = self
            .last_failure_at
            .map_or(true, |at| at.elapsed() >= cooldown);
        if cooled_down {
            info!("Circuit breaker cooldown elapsed, entering half-open");
            self.state = CircuitState::HalfOpen;
            self.half_open_successes = 0;
        }
    }
}

/// Failure fuse shared by every request to the backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_successes: 0,
                last_failure_at: None,
                last_failure: None,
                last_success: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, applying the cooldown transition if due.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        inner.refresh(self.config.cooldown);
        inner.state
    }

    /// Whether a request may be sent now.
    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Record a successful response.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.refresh(self.config.cooldown);
        inner.last_success = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    info!(
                        "Circuit breaker closed after {} successful probes",
                        inner.half_open_successes
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_successes = 0;
                }
            }
            CircuitState::Open => {
                // A request admitted before the circuit opened came back fine.
                debug!("Ignoring late success while circuit is open");
            }
        }
    }

    /// Record a failed request (transport failure or 5xx).
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.refresh(self.config.cooldown);
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());
        inner.last_failure = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker opened after {} consecutive failures",
                        inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!("Probe failed while half-open, re-opening circuit");
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Snapshot of state and counters.
    pub fn diagnostics(&self) -> BreakerDiagnostics {
        let mut inner = self.lock();
        inner.refresh(self.config.cooldown);
        BreakerDiagnostics {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure: inner.last_failure,
            last_success: inner.last_success,
        }
    }

    /// Get the breaker configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn quick_breaker(cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            cooldown: Duration::from_millis(cooldown_ms),
            ..BreakerConfig::default()
        })
    }

    #[test]
    fn test_starts_closed() {
        let breaker = CircuitBreaker::default();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_four_failures_keep_circuit_closed() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.diagnostics().failure_count, 4);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    proptest! {
        #[test]
        fn prop_opens_after_threshold(failures in 5u32..50) {
            let breaker = CircuitBreaker::default();
            for _ in 0..failures {
                breaker.record_failure();
            }
            prop_assert_eq!(breaker.state(), CircuitState::Open);
            prop_assert!(!breaker.allow_request());
        }
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let breaker = quick_breaker(20);
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(!breaker.allow_request());

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_two_probe_successes_close_circuit() {
        let breaker = quick_breaker(50);
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(80));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();

        let diagnostics = breaker.diagnostics();
        assert_eq!(diagnostics.state, CircuitState::Closed);
        assert_eq!(diagnostics.failure_count, 0);
    }

    #[test]
    fn test_probe_failure_reopens_immediately() {
        let breaker = quick_breaker(50);
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.diagnostics().last_failure.is_some());
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let breaker = std::sync::Arc::new(CircuitBreaker::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || breaker.record_failure())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let diagnostics = breaker.diagnostics();
        assert_eq!(diagnostics.state, CircuitState::Open);
        assert_eq!(diagnostics.failure_count, 8);
    }
}
