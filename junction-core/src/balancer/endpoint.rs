//! Endpoint health and in-flight tracking shared by the hand-rolled
//! algorithms (power-of-two-choices, least-requests) that
//! `pingora_load_balancing` has no selection strategy for.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A single backend endpoint's live state. `pingora_load_balancing`'s
/// `Backend` type has no notion of in-flight request counts or a
/// continuous health signal beyond up/down, so this sits alongside it
/// rather than replacing it.
#[derive(Debug)]
pub struct Endpoint {
    pub address: String,
    in_flight: AtomicU32,
    consecutive_failures: AtomicU64,
}

/// Health classification derived from recent outcomes. `Fading` endpoints
/// are still selectable but de-weighted; `Failing` endpoints are skipped
/// entirely until they recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Fading,
    Failing,
}

const FAILING_THRESHOLD: u64 = 5;

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), in_flight: AtomicU32::new(0), consecutive_failures: AtomicU64::new(0) }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self, success: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn health(&self) -> Health {
        match self.consecutive_failures.load(Ordering::Relaxed) {
            0 => Health::Healthy,
            n if n < FAILING_THRESHOLD => Health::Fading,
            _ => Health::Failing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_in_flight_count_across_requests() {
        let e = Endpoint::new("10.0.0.1:8080");
        assert_eq!(e.in_flight(), 0);
        e.begin_request();
        e.begin_request();
        assert_eq!(e.in_flight(), 2);
        e.end_request(true);
        assert_eq!(e.in_flight(), 1);
    }

    #[test]
    fn health_degrades_with_consecutive_failures_and_recovers_on_success() {
        let e = Endpoint::new("10.0.0.1:8080");
        assert_eq!(e.health(), Health::Healthy);
        e.begin_request();
        e.end_request(false);
        assert_eq!(e.health(), Health::Fading);
        for _ in 0..10 {
            e.begin_request();
            e.end_request(false);
        }
        assert_eq!(e.health(), Health::Failing);
        e.begin_request();
        e.end_request(true);
        assert_eq!(e.health(), Health::Healthy);
    }
}
