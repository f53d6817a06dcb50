//! A small sampling logger for high-frequency, low-value error conditions
//! (rate-limiter storage errors, backend-dial failures under load): log the
//! first few occurrences in full, then fall back to one line per interval
//! so a failing backend cannot flood the log at request rate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Tracks occurrence count and last-logged time for one error class.
/// `log` is cheap to call on every occurrence: the decision to actually
/// emit is a couple of atomic loads.
pub struct SamplingLog {
    burst: u64,
    interval: Duration,
    count: AtomicU64,
    last_logged_millis: AtomicU64,
    started: Instant,
}

impl SamplingLog {
    /// `burst` occurrences are logged unconditionally; after that, at most
    /// one log line is emitted per `interval`.
    pub fn new(burst: u64, interval: Duration) -> Self {
        Self {
            burst,
            interval,
            count: AtomicU64::new(0),
            last_logged_millis: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Returns `true` if the caller should log this occurrence now.
    pub fn should_log(&self) -> bool {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if n <= self.burst {
            return true;
        }

        let now_millis = self.started.elapsed().as_millis() as u64;
        let last = self.last_logged_millis.load(Ordering::Relaxed);
        if now_millis.saturating_sub(last) >= self.interval.as_millis() as u64 {
            self.last_logged_millis.store(now_millis, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn occurrences(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_every_occurrence_within_the_burst() {
        let log = SamplingLog::new(3, Duration::from_secs(60));
        assert!(log.should_log());
        assert!(log.should_log());
        assert!(log.should_log());
        assert!(!log.should_log());
    }

    #[test]
    fn occurrences_counts_every_call_regardless_of_logging() {
        let log = SamplingLog::new(1, Duration::from_secs(60));
        for _ in 0..5 {
            log.should_log();
        }
        assert_eq!(log.occurrences(), 5);
    }
}
