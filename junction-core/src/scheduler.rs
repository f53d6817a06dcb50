//! The scheduler: bounded admission-control queues (`fifo`/`lifo` filters)
//! and the post-processor that creates, reconfigures and retires them as
//! routes change.
//!
//! Grounded on the same shape as [`crate::breaker::CircuitBreaker`] — hot
//! counters on atomics, a short-lived lock only around the waiter list —
//! but the state machine is a waiter queue rather than a three-state
//! machine. Queue identity is separated from queue *generation*: a `Queue`
//! is a stable handle a filter instance holds for its whole lifetime; a
//! reconfiguration swaps in a new
//! `Generation` under that handle and schedules the old one for delayed
//! close, mirroring how `engine.rs` swaps `Snapshot`s under a
//! `SnapshotStore` without tearing down in-flight readers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::engine::PreProcessor;
use crate::error::ArgError;
use crate::filter::{Filter, FilterSpec};
use crate::route::RouteDef;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    Fifo,
    Lifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub active: usize,
    pub pending: usize,
    pub closed: bool,
    pub generation: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("queue is full")]
    Full,
    #[error("timed out waiting for queue admission")]
    TimedOut,
}

struct Waiter {
    notify: Notify,
    admitted: std::sync::atomic::AtomicBool,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self { notify: Notify::new(), admitted: std::sync::atomic::AtomicBool::new(false) })
    }
}

/// One version of a queue's configuration and live counters. Replaced
/// wholesale on reconfiguration; never mutated except for its own
/// active/waiter bookkeeping.
struct Generation {
    id: u64,
    policy: QueuePolicy,
    max_concurrency: usize,
    max_queue_size: usize,
    active: AtomicUsize,
    waiters: StdMutex<VecDeque<Arc<Waiter>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Generation {
    fn new(id: u64, policy: QueuePolicy, max_concurrency: usize, max_queue_size: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            policy,
            max_concurrency,
            max_queue_size,
            active: AtomicUsize::new(0),
            waiters: StdMutex::new(VecDeque::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn try_admit_immediately(&self) -> bool {
        loop {
            let active = self.active.load(Ordering::Acquire);
            if active >= self.max_concurrency {
                return false;
            }
            if self
                .active
                .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn pending(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            active: self.active.load(Ordering::Acquire),
            pending: self.pending(),
            closed: self.closed.load(Ordering::Acquire),
            generation: self.id,
        }
    }

    /// Releases one admission slot, handing it directly to the next
    /// waiter (if any) instead of letting it go through `try_admit`'s CAS
    /// path, so FIFO/LIFO ordering among already-queued waiters is exact.
    fn release_slot(&self) {
        let next = self.waiters.lock().unwrap().pop_front();
        match next {
            Some(w) => {
                w.admitted.store(true, Ordering::Release);
                w.notify.notify_one();
            }
            None => {
                self.active.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

/// Removes its waiter from the queue on drop unless it was admitted,
/// covering both the timeout path and outright cancellation (the proxy
/// transport dropping the `admit` future because the client disconnected).
struct WaiterGuard {
    generation: Arc<Generation>,
    waiter: Arc<Waiter>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let still_queued = {
            let mut waiters = self.generation.waiters.lock().unwrap();
            let before = waiters.len();
            waiters.retain(|w| !Arc::ptr_eq(w, &self.waiter));
            before != waiters.len()
        };
        if !still_queued && self.waiter.admitted.load(Ordering::Acquire) {
            // Dequeued and handed a slot by a concurrent `release_slot`
            // just as we gave up waiting for it (timeout race): give the
            // slot back rather than leaking it.
            self.generation.release_slot();
        }
    }
}

/// A stable queue handle: the identity a `QueueFilter` instance and the
/// scheduler post-processor both hold. The live [`Generation`] underneath
/// can be swapped by [`Queue::reconfigure`] without invalidating either
/// side's reference.
pub struct Queue {
    pub name: String,
    generation: ArcSwap<Generation>,
    next_generation_id: AtomicU64,
}

pub struct Permit {
    generation: Arc<Generation>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.generation.release_slot();
    }
}

impl Queue {
    pub fn new(name: impl Into<String>, policy: QueuePolicy, max_concurrency: usize, max_queue_size: usize) -> Arc<Self> {
        let generation = Generation::new(0, policy, max_concurrency, max_queue_size);
        Arc::new(Self { name: name.into(), generation: ArcSwap::new(generation), next_generation_id: AtomicU64::new(1) })
    }

    pub fn status(&self) -> QueueStatus {
        self.generation.load().status()
    }

    /// Swaps in a fresh generation with new capacity/policy; the previous
    /// generation's in-flight admissions drain on their own and its
    /// waiters are left queued against it (a live `Generation` Arc keeps
    /// working correctly even once no longer "current").
    pub fn reconfigure(&self, policy: QueuePolicy, max_concurrency: usize, max_queue_size: usize) {
        let id = self.next_generation_id.fetch_add(1, Ordering::AcqRel);
        self.generation.store(Generation::new(id, policy, max_concurrency, max_queue_size));
    }

    /// Marks the current generation closed: no further admissions are
    /// accepted, but in-flight `Permit`s already handed out still release
    /// normally. Used by the registry once a queue has no surviving route.
    pub fn close(&self) {
        self.generation.load().closed.store(true, Ordering::Release);
    }

    /// Admits one request, or waits according to the queue's policy until
    /// admitted, the per-request `timeout` elapses, or the caller drops
    /// the returned future (client disconnect) — in which case the waiter
    /// is removed via [`WaiterGuard`]'s `Drop`.
    pub async fn admit(&self, timeout: Duration) -> Result<Permit, AdmitError> {
        let generation = self.generation.load_full();

        if generation.try_admit_immediately() {
            return Ok(Permit { generation });
        }

        if generation.closed.load(Ordering::Acquire) {
            return Err(AdmitError::Full);
        }

        let waiter = Waiter::new();
        {
            let mut waiters = generation.waiters.lock().unwrap();
            if waiters.len() >= generation.max_queue_size {
                return Err(AdmitError::Full);
            }
            match generation.policy {
                QueuePolicy::Fifo => waiters.push_back(waiter.clone()),
                QueuePolicy::Lifo => waiters.push_front(waiter.clone()),
            }
        }
        let guard = WaiterGuard { generation: generation.clone(), waiter: waiter.clone() };

        let wait = async {
            loop {
                waiter.notify.notified().await;
                if waiter.admitted.load(Ordering::Acquire) {
                    return;
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => {
                std::mem::forget(guard);
                Ok(Permit { generation })
            }
            Err(_) => Err(AdmitError::TimedOut),
        }
    }
}

/// One `fifo(...)`/`lifo(...)` filter instance. Holds only a handle to its
/// [`Queue`] — bound in after compilation by [`SchedulerPostProcessor`] —
/// so that filter instances never own the queue's live state directly.
pub struct QueueFilter {
    pub key: QueueKey,
    pub policy: QueuePolicy,
    pub max_concurrency: usize,
    pub max_queue_size: usize,
    pub timeout: Duration,
    queue: ArcSwap<Option<Arc<Queue>>>,
}

impl QueueFilter {
    fn bind(&self, queue: Arc<Queue>) {
        self.queue.store(Arc::new(Some(queue)));
    }

    pub fn bound_queue(&self) -> Option<Arc<Queue>> {
        (**self.queue.load()).clone()
    }
}

#[async_trait]
impl Filter for QueueFilter {
    async fn on_request(&self, ctx: &mut crate::context::FilterContext) {
        let Some(queue) = self.bound_queue() else {
            // Not yet bound by a post-processor pass (e.g. direct unit
            // test of a compiled-but-not-reconciled route): fail open
            // rather than admitting nothing at all.
            return;
        };
        match queue.admit(self.timeout).await {
            Ok(permit) => {
                let key = Self::permit_key(ctx);
                ctx.state_set(&key, PermitHolder(permit));
            }
            Err(AdmitError::Full) | Err(AdmitError::TimedOut) => {
                ctx.serve(crate::context::ResponseParts::new(http::StatusCode::SERVICE_UNAVAILABLE));
            }
        }
    }

    async fn on_response(&self, ctx: &mut crate::context::FilterContext) {
        // Dropping the stored permit releases the slot; nothing else to do.
        let key = Self::permit_key(ctx);
        ctx.state_bag().remove(&key);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct PermitHolder(Permit);

impl QueueFilter {
    fn permit_key(ctx: &crate::context::FilterContext) -> String {
        format!("scheduler_permit::{}", ctx.route_id)
    }
}

/// Identifies which physical [`Queue`] a `QueueFilter` instance shares in
/// with others: either unique to one (route id, filter position), or
/// shared across every filter naming the same `group`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKey {
    Route { route_id: String, filter_index: usize },
    Group(String),
}

macro_rules! queue_filter_spec {
    ($spec:ident, $name:literal, $policy:expr) => {
        pub struct $spec;

        impl FilterSpec for $spec {
            fn name(&self) -> &'static str {
                $name
            }

            fn create(&self, args: &[Value]) -> Result<Arc<dyn Filter>, ArgError> {
                let mut a = crate::value::Args::new($name, args);
                let max_concurrency = a.integer();
                let max_queue_size = a.integer();
                let timeout = a.duration(crate::value::NumericDurationUnit::Millis);
                let group = a.optional_string();
                a.no_more();
                a.finish()?;

                let key = match group {
                    Some(g) => QueueKey::Group(g),
                    // filter_index is patched in by the compiler once it
                    // knows this filter's position in the route; 0 is a
                    // placeholder overwritten before the post-processor
                    // ever reads it in the ungrouped case.
                    None => QueueKey::Route { route_id: String::new(), filter_index: 0 },
                };

                Ok(Arc::new(QueueFilter {
                    key,
                    policy: $policy,
                    max_concurrency: max_concurrency.unwrap_or(0).max(0) as usize,
                    max_queue_size: max_queue_size.unwrap_or(0).max(0) as usize,
                    timeout: timeout.unwrap_or(Duration::from_secs(1)),
                    queue: ArcSwap::from_pointee(None),
                }))
            }
        }
    };
}

queue_filter_spec!(FifoFilterSpec, "fifo", QueuePolicy::Fifo);
queue_filter_spec!(LifoFilterSpec, "lifo", QueuePolicy::Lifo);

/// Walks compiled routes, creating, reconfiguring and retiring [`Queue`]s
/// so that every `QueueFilter` instance ends up bound to the right shared
/// queue.
pub struct SchedulerPostProcessor {
    queues: StdMutex<HashMap<QueueKey, Arc<Queue>>>,
    applied: StdMutex<HashMap<QueueKey, WantedConfig>>,
    retiring: StdMutex<Vec<(Instant, Arc<Queue>)>>,
    queue_close_delay: Duration,
}

impl SchedulerPostProcessor {
    pub fn new(queue_close_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            queues: StdMutex::new(HashMap::new()),
            applied: StdMutex::new(HashMap::new()),
            retiring: StdMutex::new(Vec::new()),
            queue_close_delay,
        })
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().unwrap().len()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct WantedConfig {
    policy: QueuePolicy,
    max_concurrency: usize,
    max_queue_size: usize,
}

impl crate::engine::PostProcessor for SchedulerPostProcessor {
    fn process(&self, routes: Vec<Arc<crate::route::Route>>) -> Vec<Arc<crate::route::Route>> {
        let mut wanted: HashMap<QueueKey, WantedConfig> = HashMap::new();
        let mut dropped: std::collections::HashSet<String> = std::collections::HashSet::new();

        for route in &routes {
            for (idx, filter) in route.filters.iter().enumerate() {
                let Some(qf) = filter.as_any().downcast_ref::<QueueFilter>() else { continue };
                let key = match &qf.key {
                    QueueKey::Group(g) => QueueKey::Group(g.clone()),
                    QueueKey::Route { .. } => QueueKey::Route { route_id: route.id.clone(), filter_index: idx },
                };
                let cfg = WantedConfig { policy: qf.policy, max_concurrency: qf.max_concurrency, max_queue_size: qf.max_queue_size };

                if let Some(existing) = wanted.get(&key) {
                    if existing.max_concurrency != cfg.max_concurrency
                        || existing.max_queue_size != cfg.max_queue_size
                        || existing.policy != cfg.policy
                    {
                        tracing::warn!(route_id = %route.id, ?key, "conflicting queue group config, route dropped");
                        dropped.insert(route.id.clone());
                        continue;
                    }
                } else {
                    wanted.insert(key, cfg);
                }
            }
        }

        let mut queues = self.queues.lock().unwrap();
        let mut applied = self.applied.lock().unwrap();
        let mut retiring = self.retiring.lock().unwrap();

        // Sweep queues retired at least `queue_close_delay` ago; this call
        // itself is the next snapshot publication the delayed-close contract
        // waits for, so age alone gates removal.
        let now = Instant::now();
        retiring.retain(|(deadline, _)| *deadline > now);

        for (key, cfg) in &wanted {
            match queues.get(key) {
                Some(existing) => {
                    // Only a real configuration change creates a new
                    // generation (and so resets its counters).
                    if applied.get(key) != Some(cfg) {
                        existing.reconfigure(cfg.policy, cfg.max_concurrency, cfg.max_queue_size);
                    }
                }
                None => {
                    let name = match key {
                        QueueKey::Group(g) => format!("group:{g}"),
                        QueueKey::Route { route_id, filter_index } => format!("{route_id}#{filter_index}"),
                    };
                    queues.insert(key.clone(), Queue::new(name, cfg.policy, cfg.max_concurrency, cfg.max_queue_size));
                }
            }
            applied.insert(key.clone(), cfg.clone());
        }
        applied.retain(|k, _| wanted.contains_key(k));

        let stale: Vec<QueueKey> = queues.keys().filter(|k| !wanted.contains_key(*k)).cloned().collect();
        for key in stale {
            if let Some(q) = queues.remove(&key) {
                q.close();
                retiring.push((now + self.queue_close_delay, q));
            }
        }

        drop(queues);
        drop(retiring);

        let queues = self.queues.lock().unwrap();
        for route in &routes {
            if dropped.contains(&route.id) {
                continue;
            }
            for (idx, filter) in route.filters.iter().enumerate() {
                let Some(qf) = filter.as_any().downcast_ref::<QueueFilter>() else { continue };
                let key = match &qf.key {
                    QueueKey::Group(g) => QueueKey::Group(g.clone()),
                    QueueKey::Route { .. } => QueueKey::Route { route_id: route.id.clone(), filter_index: idx },
                };
                if let Some(queue) = queues.get(&key) {
                    qf.bind(queue.clone());
                }
            }
        }

        routes.into_iter().filter(|r| !dropped.contains(&r.id)).collect()
    }
}

/// Collapses consecutive `fifo`/`lifo` filter references in a route's
/// filter chain into the last one, so only the effective queue a request
/// actually waits behind gets bound.
pub struct SchedulerPreProcessor;

impl PreProcessor for SchedulerPreProcessor {
    fn process(&self, routes: Vec<RouteDef>) -> Vec<RouteDef> {
        routes
            .into_iter()
            .map(|mut def| {
                let mut collapsed: Vec<crate::route::SpecRef> = Vec::with_capacity(def.filters.len());
                for spec_ref in def.filters.drain(..) {
                    let is_queue = spec_ref.name == "fifo" || spec_ref.name == "lifo";
                    if is_queue {
                        if let Some(last) = collapsed.last() {
                            if last.name == "fifo" || last.name == "lifo" {
                                collapsed.pop();
                            }
                        }
                    }
                    collapsed.push(spec_ref);
                }
                def.filters = collapsed;
                def
            })
            .collect()
    }
}
