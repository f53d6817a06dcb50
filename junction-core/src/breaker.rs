//! Per-backend circuit breaker: closed/open/half-open state machine
//! protecting a backend from being hammered once it starts failing.
//!
//! The state machine and its atomics-plus-async-`RwLock` split (hot counters
//! on `Atomic*`, the timestamp that gates the open→half-open transition
//! behind an async lock) are adapted from a straightforward circuit-breaker
//! implementation, swapping its `log` calls for `tracing` to match the rest
//! of this crate. Two trip conditions are supported: consecutive failures
//! (as in that implementation) and a failure-rate-over-a-window variant,
//! selected via [`Trip`].

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// How the breaker decides to trip from `Closed` to `Open`.
#[derive(Debug, Clone, Copy)]
pub enum Trip {
    /// Trip after `threshold` consecutive failures with no intervening
    /// success.
    ConsecutiveFailures { threshold: u64 },
    /// Trip when at least `min_requests` requests have been observed in the
    /// trailing `window` and the failure ratio among them is at or above
    /// `ratio` (0.0-1.0).
    FailureRate { min_requests: u64, window: Duration, ratio: f64 },
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub trip: Trip,
    pub success_threshold: u64,
    pub reset_timeout: Duration,
    /// K: how many concurrent probes `half-open` admits before rejecting
    /// the rest outright.
    pub half_open_max_probes: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            trip: Trip::ConsecutiveFailures { threshold: 5 },
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

/// A single backend's breaker. Shared via `Arc` across every request that
/// dispatches to the same backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    half_open_probes: AtomicUsize,
    last_failure_time: RwLock<Option<Instant>>,
    window: RwLock<Vec<(Instant, bool)>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            half_open_probes: AtomicUsize::new(0),
            last_failure_time: RwLock::new(None),
            window: RwLock::new(Vec::new()),
        })
    }

    /// Whether a request should be allowed through right now. If the
    /// circuit is open but `reset_timeout` has elapsed since the last
    /// recorded failure, transitions to half-open and admits this request
    /// as one of up to `half_open_max_probes` concurrent probes; requests
    /// beyond that cap are rejected until a probe resolves.
    pub async fn allow_request(&self) -> bool {
        match CircuitState::from(self.state.load(Ordering::Relaxed)) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.try_take_probe_slot(),
            CircuitState::Open => {
                let last_failure = *self.last_failure_time.read().await;
                if let Some(last) = last_failure {
                    if last.elapsed() >= self.config.reset_timeout {
                        if self
                            .state
                            .compare_exchange(
                                CircuitState::Open as u8,
                                CircuitState::HalfOpen as u8,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.success_count.store(0, Ordering::Relaxed);
                            self.half_open_probes.store(0, Ordering::Relaxed);
                            tracing::info!(breaker = %self.name, "circuit breaker half-open, probing");
                        }
                        return self.try_take_probe_slot();
                    }
                }
                false
            }
        }
    }

    /// CAS loop admitting at most `half_open_max_probes` concurrent callers.
    fn try_take_probe_slot(&self) -> bool {
        loop {
            let probes = self.half_open_probes.load(Ordering::Acquire);
            if probes >= self.config.half_open_max_probes {
                return false;
            }
            if self
                .half_open_probes
                .compare_exchange(probes, probes + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_probe_slot(&self) {
        let _ = self.half_open_probes.fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(1)));
    }

    pub async fn on_success(&self) {
        match CircuitState::from(self.state.load(Ordering::Relaxed)) {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
                self.record_window(true).await;
            }
            CircuitState::HalfOpen => {
                self.release_probe_slot();
                let successes = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.config.success_threshold {
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn on_failure(&self) {
        *self.last_failure_time.write().await = Some(Instant::now());

        match CircuitState::from(self.state.load(Ordering::Relaxed)) {
            CircuitState::Closed => {
                self.record_window(false).await;
                let tripped = match self.config.trip {
                    Trip::ConsecutiveFailures { threshold } => {
                        self.failure_count.fetch_add(1, Ordering::Relaxed) + 1 >= threshold
                    }
                    Trip::FailureRate { min_requests, window, ratio } => {
                        self.rate_tripped(min_requests, window, ratio).await
                    }
                };
                if tripped {
                    self.transition_to_open().await;
                }
            }
            CircuitState::HalfOpen => {
                self.release_probe_slot();
                self.transition_to_open().await;
            }
            CircuitState::Open => {}
        }
    }

    async fn record_window(&self, success: bool) {
        let mut w = self.window.write().await;
        w.push((Instant::now(), success));
    }

    async fn rate_tripped(&self, min_requests: u64, window: Duration, ratio: f64) -> bool {
        let mut w = self.window.write().await;
        let now = Instant::now();
        w.retain(|(t, _)| now.duration_since(*t) < window);
        if (w.len() as u64) < min_requests {
            return false;
        }
        let failures = w.iter().filter(|(_, ok)| !ok).count();
        (failures as f64 / w.len() as f64) >= ratio
    }

    async fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        self.half_open_probes.store(0, Ordering::Relaxed);
        tracing::warn!(breaker = %self.name, "circuit breaker opened");
    }

    async fn transition_to_closed(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        tracing::info!(breaker = %self.name, "circuit breaker closed, backend recovered");
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Relaxed))
    }
}

/// Looks up or lazily creates the breaker for a (route, host) pair — or for
/// whatever explicit shared key a route configures instead, letting several
/// routes share one breaker. Held by the proxy transport, not by a filter:
/// the breaker is consulted directly around backend dispatch rather than
/// exposed as a user-configurable filter.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: std::sync::Mutex<std::collections::HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers.entry(key.to_string()).or_insert_with(|| CircuitBreaker::new(key, config.clone())).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_consecutive_failure_threshold() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            trip: Trip::ConsecutiveFailures { threshold: 2 },
            ..Default::default()
        });
        assert!(cb.allow_request().await);
        cb.on_failure().await;
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.on_failure().await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request().await);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failure_count() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            trip: Trip::ConsecutiveFailures { threshold: 2 },
            ..Default::default()
        });
        cb.on_failure().await;
        cb.on_success().await;
        cb.on_failure().await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            trip: Trip::ConsecutiveFailures { threshold: 1 },
            success_threshold: 2,
            reset_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        cb.on_failure().await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cb.allow_request().await);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success().await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn any_failure_in_half_open_reopens() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            trip: Trip::ConsecutiveFailures { threshold: 1 },
            reset_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        cb.on_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.allow_request().await);
        cb.on_failure().await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn failure_rate_trips_once_minimum_sample_and_ratio_met() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            trip: Trip::FailureRate { min_requests: 4, window: Duration::from_secs(10), ratio: 0.5 },
            ..Default::default()
        });
        cb.on_success().await;
        cb.on_failure().await;
        assert_eq!(cb.state(), CircuitState::Closed); // only 2 samples so far, below min_requests
        cb.on_success().await;
        cb.on_failure().await;
        assert_eq!(cb.state(), CircuitState::Open); // 4 samples, 2 failures = 50%
    }

    #[tokio::test]
    async fn half_open_admits_only_up_to_max_probes() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig {
            trip: Trip::ConsecutiveFailures { threshold: 1 },
            reset_timeout: Duration::from_millis(10),
            half_open_max_probes: 2,
            ..Default::default()
        });
        cb.on_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.allow_request().await);
        assert!(cb.allow_request().await);
        assert!(!cb.allow_request().await, "third concurrent probe must be rejected");
        cb.on_success().await;
        assert!(cb.allow_request().await, "a resolved probe frees its slot");
    }

    #[test]
    fn registry_shares_one_breaker_per_key() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create("route1/host1", &CircuitBreakerConfig::default());
        let b = registry.get_or_create("route1/host1", &CircuitBreakerConfig::default());
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.get_or_create("route1/host2", &CircuitBreakerConfig::default());
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
