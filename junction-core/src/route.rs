//! The immutable, published route.
//!
//! A [`Route`] is built once by the routing engine during compilation and is
//! never mutated afterwards; it is shared via `Arc` so that it is destroyed
//! only once the last holding request (and the last snapshot referencing it)
//! drops its reference.

use std::sync::Arc;

use crate::filter::Filter;
use crate::predicate::Predicate;

/// One (predicate name, argument, compiled instance, weight) tuple, kept in
/// declared order for deterministic iteration.
pub struct CompiledPredicate {
    pub name: String,
    pub instance: Arc<dyn Predicate>,
    /// Specificity contribution used to order candidates at a path-tree leaf.
    /// An ordered tie-breaker, not an absolute priority — see DESIGN.md.
    pub weight: u32,
}

/// The target of a matched route.
#[derive(Clone, Debug)]
pub enum Backend {
    /// A single network endpoint, addressed as `scheme://host:port`.
    Network(String),
    /// Re-enter the routing engine with the current request.
    Loopback,
    /// Backend URL is supplied at runtime by an earlier filter via the
    /// state bag.
    Dynamic,
    /// Produce a response locally without network dispatch. `final_response`
    /// mirrors the DSL's ability to mark a shunt as terminal (no further
    /// loopback/split re-entry expected from it).
    Shunt { final_response: bool },
    /// A named set of endpoints dispatched through a load-balancer
    /// algorithm.
    LoadBalanced { endpoints: Vec<String>, algorithm: crate::balancer::Algorithm },
}

/// A compiled, immutable route as published in a routing snapshot.
pub struct Route {
    pub id: String,
    pub predicates: Vec<CompiledPredicate>,
    pub filters: Vec<Arc<dyn Filter>>,
    pub backend: Backend,
    /// Host regexps kept for observability only; matching a host is a
    /// business-predicate concern handled elsewhere.
    pub host_regexps: Vec<regex::Regex>,
    /// When true, the proxy transport leaves the client's original `Host`
    /// header untouched instead of rewriting it to the backend's authority.
    pub preserve_host: bool,
}

impl Route {
    /// Total specificity: the sum of this route's predicate weights.
    pub fn weight(&self) -> u32 {
        self.predicates.iter().map(|p| p.weight).sum()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("predicate_count", &self.predicates.len())
            .field("filter_count", &self.filters.len())
            .field("backend", &self.backend)
            .field("weight", &self.weight())
            .finish()
    }
}

/// One uncompiled (name, args) reference, as handed out by a data client
/// before the engine resolves it against a registry.
#[derive(Debug, Clone)]
pub struct SpecRef {
    pub name: String,
    pub args: Vec<crate::value::Value>,
}

/// An uncompiled backend description, mirroring [`Backend`] but before
/// endpoint/algorithm resolution against live configuration.
#[derive(Debug, Clone)]
pub enum BackendDef {
    Network(String),
    Loopback,
    Dynamic,
    Shunt { final_response: bool },
    LoadBalanced { endpoints: Vec<String>, algorithm: crate::balancer::Algorithm },
}

/// A route as handed to the engine by a data client: a path pattern plus
/// uncompiled predicate/filter references and an uncompiled backend. The
/// engine's compiler resolves every [`SpecRef`] against the predicate and
/// filter registries, producing a [`Route`].
#[derive(Debug, Clone)]
pub struct RouteDef {
    pub id: String,
    pub path: Option<String>,
    pub predicates: Vec<SpecRef>,
    pub filters: Vec<SpecRef>,
    pub backend: BackendDef,
    pub preserve_host: bool,
}
