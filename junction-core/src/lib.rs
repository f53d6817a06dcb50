//! `junction-core`: the routing engine, filter runtime and proxy transport
//! that back the `junction` reverse proxy binary.
//!
//! Modules are ordered roughly by dependency, leaves first: route model and
//! registries have none; the path tree depends on the route model; the
//! routing engine depends on the path tree, registries and data-client
//! interface; the load balancer, scheduler and breaker depend on the filter
//! context and route model; the proxy transport sits on top of all of it.

pub mod balancer;
pub mod breaker;
pub mod context;
pub mod engine;
pub mod error;
pub mod filter;
pub mod filters;
pub mod logging;
pub mod metrics;
pub mod path_tree;
pub mod predicate;
pub mod proxy;
pub mod ratelimit;
pub mod request_facts;
pub mod route;
pub mod scheduler;
pub mod snapshot;
pub mod value;

pub use engine::Engine;
pub use error::ProxyError;
pub use snapshot::SnapshotStore;

/// Builds a [`predicate::PredicateRegistry`] carrying the core's `Path` and
/// `Weight` predicates. Route-specific business predicates (header match,
/// CIDR, cookie) are left out of the core and register separately.
pub fn core_predicates() -> predicate::PredicateRegistry {
    let mut registry = predicate::PredicateRegistry::new();
    registry.register(std::sync::Arc::new(predicate::PathPredicateSpec));
    registry.register(std::sync::Arc::new(predicate::WeightPredicateSpec));
    registry
}

/// Builds a [`filter::FilterRegistry`] carrying every reference filter this
/// crate ships (see [`filters`]).
pub fn core_filters() -> filter::FilterRegistry {
    let mut registry = filter::FilterRegistry::new();
    filters::register_all(&mut registry);
    registry
}

/// Builds the standard pre/post-processor pipeline: the scheduler's
/// consecutive-queue-filter collapse as a pre-processor, and its queue
/// lifecycle reconciliation as a post-processor.
pub fn core_processors(
    queue_close_delay: std::time::Duration,
) -> (Vec<std::sync::Arc<dyn engine::PreProcessor>>, Vec<std::sync::Arc<dyn engine::PostProcessor>>) {
    let pre: Vec<std::sync::Arc<dyn engine::PreProcessor>> = vec![std::sync::Arc::new(scheduler::SchedulerPreProcessor)];
    let post: Vec<std::sync::Arc<dyn engine::PostProcessor>> = vec![scheduler::SchedulerPostProcessor::new(queue_close_delay)];
    (pre, post)
}
