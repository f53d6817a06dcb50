//! The cluster rate limiter: a sliding-window admission check over a shared
//! store, keyed by whatever a filter derives from the request (client IP,
//! API key, header value — key extraction itself is a filter concern and
//! out of scope here).
//!
//! The storage trait is shaped after the proxy's token-bucket
//! `RateLimitStorage`/`MemoryStorage` (same `moka::future::Cache`-backed
//! per-key entry, same async `check`-and-mutate-in-place pattern), but the
//! admission algorithm is a sliding-window log rather than a token bucket:
//! each admitted hit records its own timestamp, and a request is admitted
//! only while the count of not-yet-expired timestamps is under the limit.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Builds the shared-store key as `group:hash(cleartext)`. Hashing (rather
/// than storing the cleartext key verbatim) keeps arbitrary request-derived
/// values - client IPs, API keys, header values - out of the store's key
/// space; `DefaultHasher` is good enough for this and avoids pulling in a
/// dedicated hashing crate the rest of the stack does not otherwise need,
/// the same call `balancer`'s power-of-two sampling makes.
pub fn storage_key(group: &str, cleartext: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    cleartext.hash(&mut hasher);
    format!("{group}:{:016x}", hasher.finish())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: usize,
    pub retry_after: Duration,
}

#[derive(Debug, thiserror::Error)]
#[error("rate limit storage error: {0}")]
pub struct RateLimitStorageError(pub String);

#[async_trait]
pub trait RateLimitStorage: Send + Sync + Debug {
    /// Admits or rejects one hit of cost `cost` for `key`, given a window
    /// of `window` and a `max_hits` ceiling. Returns how many hits remain
    /// available in the current window and, if rejected, how long until
    /// the oldest hit in the window expires.
    async fn check(
        &self,
        key: &str,
        max_hits: usize,
        window: Duration,
        cost: usize,
    ) -> Result<RateLimitDecision, RateLimitStorageError>;
}

/// An in-process sliding-window store. Entries idle past `cleanup_interval`
/// are evicted by `moka` so abandoned keys don't accumulate forever.
#[derive(Debug)]
pub struct MemoryRateLimitStorage {
    cache: Cache<String, Arc<Mutex<Vec<Instant>>>>,
}

impl MemoryRateLimitStorage {
    pub fn new(max_keys: u64, cleanup_interval: Duration) -> Self {
        let cache = Cache::builder().max_capacity(max_keys).time_to_idle(cleanup_interval).build();
        Self { cache }
    }
}

#[async_trait]
impl RateLimitStorage for MemoryRateLimitStorage {
    async fn check(
        &self,
        key: &str,
        max_hits: usize,
        window: Duration,
        cost: usize,
    ) -> Result<RateLimitDecision, RateLimitStorageError> {
        let entry = self
            .cache
            .get_with(key.to_string(), async { Arc::new(Mutex::new(Vec::new())) })
            .await;

        let now = Instant::now();
        let mut hits = entry.lock().await;
        hits.retain(|t| now.duration_since(*t) < window);

        if hits.len() + cost > max_hits {
            let retry_after = hits
                .first()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window)
                .max(Duration::from_secs(1));
            return Ok(RateLimitDecision { allowed: false, remaining: max_hits.saturating_sub(hits.len()), retry_after });
        }

        for _ in 0..cost {
            hits.push(now);
        }

        Ok(RateLimitDecision { allowed: true, remaining: max_hits - hits.len(), retry_after: Duration::ZERO })
    }
}

/// What to do when the storage backend itself errors (as opposed to
/// rejecting the request on the merits): failing open keeps the proxy
/// serving traffic at the cost of a temporarily unenforced limit; failing
/// closed protects the backend at the cost of availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    FailOpen,
    FailClosed,
}

/// The policy layer above storage: fixed `max_hits`/`window`/`cost`, plus
/// the decision of what to do when `storage` itself errors. A
/// [`crate::logging::SamplingLog`] keeps storage errors from flooding the
/// log under sustained backend trouble.
pub struct RateLimiter {
    group: String,
    storage: Arc<dyn RateLimitStorage>,
    max_hits: usize,
    window: Duration,
    cost: usize,
    failure_policy: FailurePolicy,
    storage_error_log: crate::logging::SamplingLog,
}

impl RateLimiter {
    pub fn new(
        group: impl Into<String>,
        storage: Arc<dyn RateLimitStorage>,
        max_hits: usize,
        window: Duration,
        cost: usize,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            group: group.into(),
            storage,
            max_hits,
            window,
            cost,
            failure_policy,
            storage_error_log: crate::logging::SamplingLog::new(5, Duration::from_secs(30)),
        }
    }

    /// Admits one hit of `cleartext_key` (a client IP, API key, header
    /// value - whatever a filter derived), under this limiter's group.
    /// The cleartext is hashed into the storage key per
    /// [`storage_key`]; only the hash ever reaches `storage`.
    pub async fn check(&self, cleartext_key: &str) -> RateLimitDecision {
        let key = storage_key(&self.group, cleartext_key);
        match self.storage.check(&key, self.max_hits, self.window, self.cost).await {
            Ok(decision) => decision,
            Err(e) => {
                if self.storage_error_log.should_log() {
                    tracing::error!(error = %e, occurrences = self.storage_error_log.occurrences(), "rate limit storage error");
                }
                match self.failure_policy {
                    FailurePolicy::FailOpen => {
                        RateLimitDecision { allowed: true, remaining: self.max_hits, retry_after: Duration::ZERO }
                    }
                    FailurePolicy::FailClosed => {
                        RateLimitDecision { allowed: false, remaining: 0, retry_after: self.window }
                    }
                }
            }
        }
    }
}
