//! Metrics facade exposed to filters through `FilterContext::metrics()`.
//! Concrete metrics back-ends are out of scope; this module only defines
//! the trait every filter call site is written against plus a
//! `tracing`-backed implementation so the binary has something real to wire
//! up: counters are logged through `tracing` rather than a dedicated
//! metrics crate.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter/gauge/histogram sink with route-scoped prefixing.
pub trait Metrics: Send + Sync {
    fn incr_counter(&self, name: &str, route_id: &str);
    fn observe_duration(&self, name: &str, route_id: &str, duration: std::time::Duration);
    fn set_gauge(&self, name: &str, route_id: &str, value: i64);
}

/// Discards everything; used in unit tests and as a safe default.
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr_counter(&self, _name: &str, _route_id: &str) {}
    fn observe_duration(&self, _name: &str, _route_id: &str, _duration: std::time::Duration) {}
    fn set_gauge(&self, _name: &str, _route_id: &str, _value: i64) {}
}

/// Emits every call as a `tracing` event at `debug` level. Suitable as the
/// binary's default sink until a real metrics backend is wired in.
pub struct TracingMetrics {
    route_miss_total: AtomicU64,
}

impl Default for TracingMetrics {
    fn default() -> Self {
        Self { route_miss_total: AtomicU64::new(0) }
    }
}

impl Metrics for TracingMetrics {
    fn incr_counter(&self, name: &str, route_id: &str) {
        if name == "route-miss" {
            self.route_miss_total.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(metric = name, route_id, "counter incremented");
    }

    fn observe_duration(&self, name: &str, route_id: &str, duration: std::time::Duration) {
        tracing::debug!(metric = name, route_id, ?duration, "duration observed");
    }

    fn set_gauge(&self, name: &str, route_id: &str, value: i64) {
        tracing::debug!(metric = name, route_id, value, "gauge set");
    }
}

impl TracingMetrics {
    pub fn route_miss_total(&self) -> u64 {
        self.route_miss_total.load(Ordering::Relaxed)
    }
}
