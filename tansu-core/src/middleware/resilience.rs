//! Resilience middleware for fault tolerance and reliability
//!
//! This module provides circuit breaker, retry, and bulkhead patterns
//! to ensure service stability and graceful degradation.

use std::time::Duration;

#[cfg(feature = "resilience")]
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
#[cfg(feature = "resilience")]
use std::sync::Mutex;
#[cfg(feature = "resilience")]
use std::time::Instant;

/// Configuration for resilience patterns
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Enable circuit breaker
    pub circuit_breaker_enabled: bool,
    /// Failure threshold before circuit opens (0.0-1.0)
    pub circuit_breaker_threshold: f64,
    /// Minimum requests before calculating failure rate
    pub circuit_breaker_min_requests: u64,
    /// Duration to wait before attempting to close circuit
    pub circuit_breaker_wait_duration: Duration,

    /// Enable retry logic
    pub retry_enabled: bool,
    /// Maximum number of retry attempts
    pub retry_max_attempts: usize,
    /// Base delay for exponential backoff
    pub retry_base_delay: Duration,
    /// Maximum delay for exponential backoff
    pub retry_max_delay: Duration,

    /// Enable bulkhead (concurrency limiting)
    pub bulkhead_enabled: bool,
    /// Maximum concurrent requests
    pub bulkhead_max_concurrent: usize,
    /// Maximum queued requests
    pub bulkhead_max_queued: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: 0.5, // 50% failure rate
            circuit_breaker_min_requests: 10,
            circuit_breaker_wait_duration: Duration::from_secs(30),

            retry_enabled: true,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(10),

            bulkhead_enabled: true,
            bulkhead_max_concurrent: 100,
            bulkhead_max_queued: 200,
        }
    }
}

impl ResilienceConfig {
    /// Create a new resilience configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set circuit breaker enabled
    pub fn with_circuit_breaker(mut self, enabled: bool) -> Self {
        self.circuit_breaker_enabled = enabled;
        self
    }

    /// Set circuit breaker threshold
    pub fn with_circuit_breaker_threshold(mut self, threshold: f64) -> Self {
        self.circuit_breaker_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set retry enabled
    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    /// Set maximum retry attempts
    pub fn with_retry_max_attempts(mut self, attempts: usize) -> Self {
        self.retry_max_attempts = attempts;
        self
    }

    /// Set bulkhead enabled
    pub fn with_bulkhead(mut self, enabled: bool) -> Self {
        self.bulkhead_enabled = enabled;
        self
    }

    /// Set bulkhead maximum concurrent requests
    pub fn with_bulkhead_max_concurrent(mut self, max: usize) -> Self {
        self.bulkhead_max_concurrent = max;
        self
    }
}

/// Count-based circuit breaker keyed per upstream route. Trips to `Open`
/// once `circuit_breaker_min_requests` have been observed and the failure
/// rate crosses `circuit_breaker_threshold`; stays open for
/// `circuit_breaker_wait_duration` before allowing a single probe
/// (`HalfOpen`) whose outcome closes or re-opens the circuit.
#[cfg(feature = "resilience")]
pub struct CircuitBreaker {
    config: ResilienceConfig,
    state: AtomicU8,
    requests: AtomicU64,
    failures: AtomicU64,
    opened_at: Mutex<Option<Instant>>,
}

#[cfg(feature = "resilience")]
const STATE_CLOSED: u8 = 0;
#[cfg(feature = "resilience")]
const STATE_OPEN: u8 = 1;
#[cfg(feature = "resilience")]
const STATE_HALF_OPEN: u8 = 2;

#[cfg(feature = "resilience")]
impl CircuitBreaker {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(STATE_CLOSED),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            opened_at: Mutex::new(None),
        }
    }

    /// Whether a call should be rejected without attempting the upstream.
    /// Transitions `Open` -> `HalfOpen` once the wait duration has elapsed,
    /// admitting exactly one probe request.
    pub fn is_open(&self) -> bool {
        if !self.config.circuit_breaker_enabled {
            return false;
        }

        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return false;
        }

        let mut opened_at = self.opened_at.lock().unwrap();
        let elapsed = opened_at.map(|at| at.elapsed()).unwrap_or(Duration::ZERO);
        if elapsed >= self.config.circuit_breaker_wait_duration {
            self.state.store(STATE_HALF_OPEN, Ordering::Release);
            *opened_at = None;
            false
        } else {
            true
        }
    }

    pub fn record_success(&self) {
        if !self.config.circuit_breaker_enabled {
            return;
        }
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) != STATE_CLOSED {
            self.requests.store(0, Ordering::Relaxed);
            self.failures.store(0, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self) {
        if !self.config.circuit_breaker_enabled {
            return;
        }

        if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
            self.trip();
            return;
        }

        let requests = self.requests.fetch_add(1, Ordering::AcqRel) + 1;
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;

        if requests >= self.config.circuit_breaker_min_requests
            && (failures as f64 / requests as f64) >= self.config.circuit_breaker_threshold
        {
            self.trip();
        }
    }

    fn trip(&self) {
        self.state.store(STATE_OPEN, Ordering::Release);
        *self.opened_at.lock().unwrap() = Some(Instant::now());
        self.requests.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ResilienceConfig::default();
        assert!(config.circuit_breaker_enabled);
        assert!(config.retry_enabled);
        assert!(config.bulkhead_enabled);
    }

    #[test]
    fn test_builder_pattern() {
        let config = ResilienceConfig::new()
            .with_circuit_breaker(false)
            .with_retry_max_attempts(5)
            .with_bulkhead_max_concurrent(50);

        assert!(!config.circuit_breaker_enabled);
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.bulkhead_max_concurrent, 50);
    }

    #[test]
    fn test_threshold_clamping() {
        let config = ResilienceConfig::new()
            .with_circuit_breaker_threshold(1.5);

        assert_eq!(config.circuit_breaker_threshold, 1.0);

        let config = ResilienceConfig::new()
            .with_circuit_breaker_threshold(-0.5);

        assert_eq!(config.circuit_breaker_threshold, 0.0);
    }

    #[cfg(feature = "resilience")]
    fn breaker_config() -> ResilienceConfig {
        ResilienceConfig {
            circuit_breaker_min_requests: 2,
            circuit_breaker_threshold: 0.5,
            circuit_breaker_wait_duration: Duration::from_millis(20),
            ..ResilienceConfig::default()
        }
    }

    #[cfg(feature = "resilience")]
    #[test]
    fn breaker_stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new(breaker_config());
        breaker.record_failure();
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[cfg(feature = "resilience")]
    #[test]
    fn breaker_trips_once_threshold_and_min_requests_are_met() {
        let breaker = CircuitBreaker::new(breaker_config());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[cfg(feature = "resilience")]
    #[test]
    fn breaker_half_opens_after_wait_duration_and_closes_on_success() {
        let breaker = CircuitBreaker::new(breaker_config());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(25));
        assert!(!breaker.is_open());

        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[cfg(feature = "resilience")]
    #[test]
    fn breaker_reopens_if_half_open_probe_fails() {
        let breaker = CircuitBreaker::new(breaker_config());
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[cfg(feature = "resilience")]
    #[test]
    fn disabled_breaker_never_opens() {
        let config = ResilienceConfig { circuit_breaker_enabled: false, ..breaker_config() };
        let breaker = CircuitBreaker::new(config);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }
}
