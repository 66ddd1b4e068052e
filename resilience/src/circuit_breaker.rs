//! Circuit breaker for per-provider fault isolation.
//!
//! States:
//! - CLOSED: normal operation
//! - OPEN: provider disabled, requests fail fast
//! - HALF_OPEN: probing recovery with a bounded success window
//!
//! The OPEN to HALF_OPEN transition happens lazily inside `is_available`
//! once the recovery timeout has elapsed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Error returned when the breaker is open and the provider is unavailable.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker '{name}' is {state}, service unavailable")]
pub struct CircuitBreakerError {
    pub name: String,
    pub state: CircuitState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds and windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Time to wait in OPEN before probing recovery.
    pub recovery_timeout: Duration,
    /// Successes required in HALF_OPEN before closing.
    pub success_threshold: u32,
    /// Per-call timeout applied by callers that wrap provider invocations.
    pub timeout_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            timeout_duration: Duration::from_secs(30),
        }
    }
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Seconds since the last recorded failure, if any.
    pub seconds_since_last_failure: Option<f64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

/// Per-provider fault isolation state machine.
///
/// The breaker never fails its own operations; it is a pure state object.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!("Circuit breaker '{}' initialized", name);
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether the provider may be called. May transition
    /// OPEN to HALF_OPEN when the recovery timeout has elapsed.
    pub fn is_available(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_time
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(false);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!(
                        "Circuit breaker '{}' transitioning to half-open for recovery testing",
                        self.name
                    );
                    true
                } else {
                    false
                }
            }
            // Limited requests are allowed through while probing.
            CircuitState::HalfOpen => true,
        }
    }

    /// Fail fast with `CircuitBreakerError` when the provider is unavailable.
    pub fn check_and_raise(&self) -> Result<(), CircuitBreakerError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CircuitBreakerError { name: self.name.clone(), state: self.state() })
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!("Circuit breaker '{}' closed - service recovered", self.name);
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.success_count = 0;
                    warn!(
                        "Circuit breaker '{}' opened due to {} failures",
                        self.name, inner.failure_count
                    );
                }
            }
            // Any failure while probing sends the breaker back to OPEN.
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                warn!("Circuit breaker '{}' re-opened during recovery probe", self.name);
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        info!("Circuit breaker '{}' manually reset", self.name);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            seconds_since_last_failure: inner.last_failure_time.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            success_threshold: 2,
            timeout_duration: Duration::from_secs(30),
        }
    }

    #[test]
    fn fresh_breaker_is_available_without_side_effects() {
        let cb = CircuitBreaker::new("test", quick_config());
        assert!(cb.is_available());
        assert_eq!(cb.state(), CircuitState::Closed);
        let stats = cb.stats();
        assert_eq!(stats.failure_count, 0);
        assert!(stats.seconds_since_last_failure.is_none());
    }

    #[test]
    fn opens_at_failure_threshold() {
        let cb = CircuitBreaker::new("test", quick_config());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_available());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_available());
        assert!(cb.check_and_raise().is_err());
    }

    #[test]
    fn success_in_closed_resets_failure_count() {
        let cb = CircuitBreaker::new("test", quick_config());
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        // Only two consecutive failures since the success; still closed.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn recovers_through_half_open() {
        let cb = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.is_available());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn failure_in_half_open_reopens() {
        let cb = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.is_available());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_available());
    }

    #[test]
    fn reset_returns_to_initial_state() {
        let cb = CircuitBreaker::new("test", quick_config());
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_available());
        assert_eq!(cb.stats().failure_count, 0);
    }
}
