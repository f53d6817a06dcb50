//! The routing engine: pulls route definitions from one or more data
//! clients, compiles them against the predicate/filter registries, and
//! publishes the result as a [`Snapshot`].
//!
//! Grounded on the reload-and-swap loop in the proxy's config file watcher:
//! a background task wakes up (here, on a fixed poll interval rather than an
//! filesystem-event channel), reloads, and on success swaps a fresh,
//! fully-built value into an `ArcSwap`-backed store while leaving the
//! previous value live for any request still in flight. A failed reload
//! logs a warning and keeps serving the last good snapshot rather than
//! tearing down the proxy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::filter::FilterRegistry;
use crate::path_tree::PathTree;
use crate::predicate::PredicateRegistry;
use crate::route::{Backend, BackendDef, CompiledPredicate, Route, RouteDef};
use crate::snapshot::{Snapshot, SnapshotStore};

/// A source of route definitions. Implementations own whatever watches or
/// polls an external system (file, KV store, cluster API); concrete
/// production clients are out of scope here, but the trait and a trivial
/// in-memory client are shipped so the engine is fully testable.
#[async_trait]
pub trait DataClient: Send + Sync {
    /// A short, stable label used in logs to attribute load errors.
    fn name(&self) -> &str;

    /// Loads the full, current set of routes this client is responsible
    /// for. Called once at startup and again on every poll tick.
    async fn load_all(&self) -> Result<Vec<RouteDef>, DataClientError>;
}

#[derive(Debug, thiserror::Error)]
#[error("data client '{client}' failed to load routes: {message}")]
pub struct DataClientError {
    pub client: String,
    pub message: String,
}

/// Runs over a route definition before compilation, e.g. to inject a
/// default predicate or annotate an id. Errors drop the single route they
/// apply to rather than failing the whole compile cycle.
pub trait PreProcessor: Send + Sync {
    fn process(&self, routes: Vec<RouteDef>) -> Vec<RouteDef>;
}

/// Runs over the fully compiled route list before publication, e.g. to
/// inject synthetic diagnostic routes or drop routes that fail a global
/// invariant.
pub trait PostProcessor: Send + Sync {
    fn process(&self, routes: Vec<Arc<Route>>) -> Vec<Arc<Route>>;
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("route '{0}': duplicate id")]
    DuplicateId(String),
    #[error("route '{route_id}': unknown predicate '{name}'")]
    UnknownPredicate { route_id: String, name: String },
    #[error("route '{route_id}': unknown filter '{name}'")]
    UnknownFilter { route_id: String, name: String },
    #[error("route '{route_id}': predicate '{name}': {source}")]
    PredicateArgument { route_id: String, name: String, #[source] source: crate::error::ArgError },
    #[error("route '{route_id}': filter '{name}': {source}")]
    FilterArgument { route_id: String, name: String, #[source] source: crate::error::ArgError },
    #[error("path tree insertion failed for route '{route_id}': {source}")]
    PathTree { route_id: String, #[source] source: crate::path_tree::InsertError },
}

/// Resolves every [`RouteDef`] against the registries, producing one
/// [`Route`] per definition. Definitions are merged by id before this is
/// called; a definition that fails to compile is reported but does not
/// abort compilation of the rest (matching the one-bad-apple tolerance the
/// file watcher shows when a single proxy config fails to reload).
pub fn compile(
    defs: Vec<RouteDef>,
    predicates: &PredicateRegistry,
    filters: &FilterRegistry,
) -> (Vec<Arc<Route>>, Vec<CompileError>) {
    let mut seen_ids = std::collections::HashSet::new();
    let mut compiled = Vec::with_capacity(defs.len());
    let mut errors = Vec::new();

    for def in defs {
        if !seen_ids.insert(def.id.clone()) {
            errors.push(CompileError::DuplicateId(def.id.clone()));
            continue;
        }
        match compile_one(&def, predicates, filters) {
            Ok(route) => compiled.push(Arc::new(route)),
            Err(e) => errors.push(e),
        }
    }

    (compiled, errors)
}

fn compile_one(
    def: &RouteDef,
    predicates: &PredicateRegistry,
    filters: &FilterRegistry,
) -> Result<Route, CompileError> {
    let mut compiled_predicates = Vec::with_capacity(def.predicates.len());
    for spec_ref in &def.predicates {
        let (instance, weight) = predicates.create(&spec_ref.name, &spec_ref.args).map_err(|e| match e {
            crate::predicate::CreateError::Unknown(name) => {
                CompileError::UnknownPredicate { route_id: def.id.clone(), name }
            }
            crate::predicate::CreateError::Argument(source) => {
                CompileError::PredicateArgument { route_id: def.id.clone(), name: spec_ref.name.clone(), source }
            }
        })?;
        compiled_predicates.push(CompiledPredicate { name: spec_ref.name.clone(), instance, weight });
    }

    if let Some(path) = &def.path {
        let (instance, weight) =
            crate::predicate::PathPredicateSpec
                .create(&[crate::value::Value::String(path.clone())])
                .map_err(|source| CompileError::PredicateArgument {
                    route_id: def.id.clone(),
                    name: "Path".to_string(),
                    source,
                })?;
        compiled_predicates.push(CompiledPredicate { name: "Path".to_string(), instance, weight });
    }

    let mut compiled_filters = Vec::with_capacity(def.filters.len());
    for spec_ref in &def.filters {
        let instance = filters.create(&spec_ref.name, &spec_ref.args).map_err(|e| match e {
            crate::filter::CreateError::Unknown(name) => {
                CompileError::UnknownFilter { route_id: def.id.clone(), name }
            }
            crate::filter::CreateError::Argument(source) => {
                CompileError::FilterArgument { route_id: def.id.clone(), name: spec_ref.name.clone(), source }
            }
        })?;
        compiled_filters.push(instance);
    }

    let backend = match &def.backend {
        BackendDef::Network(addr) => Backend::Network(addr.clone()),
        BackendDef::Loopback => Backend::Loopback,
        BackendDef::Dynamic => Backend::Dynamic,
        BackendDef::Shunt { final_response } => Backend::Shunt { final_response: *final_response },
        BackendDef::LoadBalanced { endpoints, algorithm } => {
            Backend::LoadBalanced { endpoints: endpoints.clone(), algorithm: algorithm.clone() }
        }
    };

    Ok(Route {
        id: def.id.clone(),
        predicates: compiled_predicates,
        filters: compiled_filters,
        backend,
        host_regexps: Vec::new(),
        preserve_host: def.preserve_host,
    })
}

/// Splits compiled routes into the path tree (routes that carry a `Path`
/// pseudo-predicate, i.e. came from a `RouteDef` with `path: Some(_)`) and
/// the fallback list (everything else), and builds a [`Snapshot`].
///
/// Within the tree and within the fallback list, routes are sorted by
/// descending weight so [`Snapshot::route_for`] can take the first match.
fn build_snapshot(routes: Vec<Arc<Route>>, path_by_id: &HashMap<String, String>) -> Result<Snapshot, CompileError> {
    let mut by_path: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
    let mut fallback = Vec::new();

    for route in routes {
        if let Some(path) = path_by_id.get(&route.id) {
            by_path.entry(path.clone()).or_default().push(route);
        } else {
            fallback.push(route);
        }
    }

    let mut tree = PathTree::new();
    for (path, mut candidates) in by_path {
        candidates.sort_by(|a, b| b.weight().cmp(&a.weight()));
        for candidate in candidates {
            let route_id = candidate.id.clone();
            tree.insert(&path, candidate).map_err(|source| CompileError::PathTree { route_id, source })?;
        }
    }

    fallback.sort_by(|a, b| b.weight().cmp(&a.weight()));

    Ok(Snapshot::new(tree, fallback))
}

/// Owns the data clients, registries and processors, and runs the
/// poll-compile-publish loop. `first_load` resolves once the very first
/// compile cycle has published a snapshot, so callers can block startup
/// until there is at least one route table to serve.
pub struct Engine {
    clients: Vec<Arc<dyn DataClient>>,
    pre_processors: Vec<Arc<dyn PreProcessor>>,
    post_processors: Vec<Arc<dyn PostProcessor>>,
    predicates: Arc<PredicateRegistry>,
    filters: Arc<FilterRegistry>,
    store: SnapshotStore,
    first_load: Arc<Notify>,
    first_load_done: std::sync::atomic::AtomicBool,
    poll_interval: Duration,
}

impl Engine {
    pub fn new(
        clients: Vec<Arc<dyn DataClient>>,
        pre_processors: Vec<Arc<dyn PreProcessor>>,
        post_processors: Vec<Arc<dyn PostProcessor>>,
        predicates: PredicateRegistry,
        filters: FilterRegistry,
        poll_interval: Duration,
    ) -> Self {
        Self {
            clients,
            pre_processors,
            post_processors,
            predicates: Arc::new(predicates),
            filters: Arc::new(filters),
            store: SnapshotStore::new(Snapshot::new(PathTree::new(), Vec::new())),
            first_load: Arc::new(Notify::new()),
            first_load_done: std::sync::atomic::AtomicBool::new(false),
            poll_interval,
        }
    }

    pub fn store(&self) -> SnapshotStore {
        self.store.clone()
    }

    /// Resolves once the first successful compile cycle has published.
    pub async fn wait_first_load(&self) {
        if self.first_load_done.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
        self.first_load.notified().await;
    }

    /// One load-compile-publish cycle. Public so tests and a manual
    /// "reload now" admin hook can drive it without waiting on the timer.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) {
        let loads = futures_util::future::join_all(self.clients.iter().map(|c| {
            let c = c.clone();
            async move { (c.name().to_string(), c.load_all().await) }
        }))
        .await;

        let mut merged: HashMap<String, (String, RouteDef)> = HashMap::new();
        let mut any_ok = false;
        for (client_name, result) in loads {
            match result {
                Ok(defs) => {
                    any_ok = true;
                    for def in defs {
                        let id = def.id.clone();
                        if let Some((losing_client, _)) = merged.insert(id.clone(), (client_name.clone(), def)) {
                            tracing::warn!(
                                route_id = %id,
                                winning_client = %client_name,
                                losing_client = %losing_client,
                                "route id conflict across data clients, last client wins"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(client = %client_name, error = %e, "data client load failed, keeping previous snapshot contribution");
                }
            }
        }

        if !any_ok && !self.clients.is_empty() {
            tracing::warn!("every data client failed this cycle, retaining previous snapshot");
            return;
        }

        let mut defs: Vec<RouteDef> = merged.into_values().map(|(_, def)| def).collect();
        for pp in &self.pre_processors {
            defs = pp.process(defs);
        }

        let path_by_id: HashMap<String, String> =
            defs.iter().filter_map(|d| d.path.clone().map(|p| (d.id.clone(), p))).collect();

        let (compiled, errors) = compile(defs, &self.predicates, &self.filters);
        for e in &errors {
            tracing::warn!(error = %e, "route dropped at compile time");
        }

        let mut compiled = compiled;
        for pp in &self.post_processors {
            compiled = pp.process(compiled);
        }

        match build_snapshot(compiled, &path_by_id) {
            Ok(snapshot) => {
                let route_count = snapshot.route_count();
                self.store.store(snapshot);
                tracing::info!(route_count, "published new routing snapshot");
                if !self.first_load_done.swap(true, std::sync::atomic::Ordering::AcqRel) {
                    self.first_load.notify_waiters();
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "snapshot build failed, retaining previous snapshot");
            }
        }
    }

    /// Runs [`Engine::tick`] once immediately and then on every
    /// `poll_interval`, forever. Intended to be spawned as a background
    /// task alongside the pingora server.
    pub async fn run(self: Arc<Self>) {
        self.tick().await;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.tick().await; // first tick fires immediately; skip the duplicate
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}

/// A data client that never reloads: its constructor argument is the whole
/// route set, handed back verbatim on every `load_all`. Used by the
/// reference binary's minimal demo config and by engine tests.
pub struct InMemoryDataClient {
    name: String,
    routes: Vec<RouteDef>,
}

impl InMemoryDataClient {
    pub fn new(name: impl Into<String>, routes: Vec<RouteDef>) -> Self {
        Self { name: name.into(), routes }
    }
}

#[async_trait]
impl DataClient for InMemoryDataClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_all(&self) -> Result<Vec<RouteDef>, DataClientError> {
        Ok(self.routes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterRegistry;
    use crate::predicate::PredicateRegistry;
    use crate::request_facts::OwnedRequestFacts;
    use crate::route::{BackendDef, SpecRef};
    use crate::value::Value;

    fn shunt_route(id: &str, path: &str) -> RouteDef {
        RouteDef {
            id: id.to_string(),
            path: Some(path.to_string()),
            predicates: Vec::new(),
            filters: Vec::new(),
            backend: BackendDef::Shunt { final_response: true },
            preserve_host: false,
        }
    }

    fn registries() -> (PredicateRegistry, FilterRegistry) {
        let mut predicates = PredicateRegistry::new();
        predicates.register(Arc::new(crate::predicate::PathPredicateSpec));
        predicates.register(Arc::new(crate::predicate::WeightPredicateSpec));
        (predicates, FilterRegistry::new())
    }

    #[test]
    fn compile_resolves_path_pseudo_predicate() {
        let (predicates, filters) = registries();
        let (routes, errors) = compile(vec![shunt_route("r1", "/ok")], &predicates, &filters);
        assert!(errors.is_empty());
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].predicates.len(), 1);
    }

    #[test]
    fn compile_reports_unknown_predicate_without_aborting_others() {
        let (predicates, filters) = registries();
        let mut bad = shunt_route("bad", "/bad");
        bad.predicates.push(SpecRef { name: "Bogus".to_string(), args: vec![] });
        let good = shunt_route("good", "/good");
        let (routes, errors) = compile(vec![bad, good], &predicates, &filters);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].id, "good");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn duplicate_ids_are_rejected_keeping_the_first() {
        let (predicates, filters) = registries();
        let (routes, errors) =
            compile(vec![shunt_route("dup", "/a"), shunt_route("dup", "/b")], &predicates, &filters);
        assert_eq!(routes.len(), 1);
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn engine_publishes_and_signals_first_load() {
        let (predicates, filters) = registries();
        let client: Arc<dyn DataClient> =
            Arc::new(InMemoryDataClient::new("mem", vec![shunt_route("r1", "/ok")]));
        let engine = Arc::new(Engine::new(
            vec![client],
            Vec::new(),
            Vec::new(),
            predicates,
            filters,
            Duration::from_secs(3600),
        ));

        engine.tick().await;
        tokio::time::timeout(Duration::from_secs(1), engine.wait_first_load()).await.unwrap();

        let snap = engine.store().load();
        let req = OwnedRequestFacts::get("GET", "/ok");
        assert!(snap.route_for(&req).is_some());
    }

    #[tokio::test]
    async fn failed_client_load_retains_previous_snapshot() {
        struct FlakyClient;
        #[async_trait]
        impl DataClient for FlakyClient {
            fn name(&self) -> &str {
                "flaky"
            }
            async fn load_all(&self) -> Result<Vec<RouteDef>, DataClientError> {
                Err(DataClientError { client: "flaky".into(), message: "boom".into() })
            }
        }

        let (predicates, filters) = registries();
        let good: Arc<dyn DataClient> =
            Arc::new(InMemoryDataClient::new("mem", vec![shunt_route("r1", "/ok")]));
        let engine = Arc::new(Engine::new(
            vec![good],
            Vec::new(),
            Vec::new(),
            predicates,
            filters,
            Duration::from_secs(3600),
        ));
        engine.tick().await;

        let flaky_only: Vec<Arc<dyn DataClient>> = vec![Arc::new(FlakyClient)];
        let (predicates2, filters2) = registries();
        let engine2 = Arc::new(Engine::new(flaky_only, Vec::new(), Vec::new(), predicates2, filters2, Duration::from_secs(3600)));
        engine2.tick().await;
        assert_eq!(engine2.store().load().route_count(), 0);
    }

    #[tokio::test]
    async fn conflicting_route_ids_across_clients_resolve_last_client_wins() {
        let (predicates, filters) = registries();
        let first: Arc<dyn DataClient> = Arc::new(InMemoryDataClient::new("first", vec![shunt_route("r1", "/a")]));
        let second: Arc<dyn DataClient> = Arc::new(InMemoryDataClient::new("second", vec![shunt_route("r1", "/b")]));
        let engine = Arc::new(Engine::new(vec![first, second], Vec::new(), Vec::new(), predicates, filters, Duration::from_secs(3600)));

        engine.tick().await;

        let snap = engine.store().load();
        assert_eq!(snap.route_count(), 1, "the conflicting id collapses to a single route");
        assert!(snap.route_for(&OwnedRequestFacts::get("GET", "/b")).is_some(), "the later client's definition wins");
        assert!(snap.route_for(&OwnedRequestFacts::get("GET", "/a")).is_none(), "the earlier client's definition is dropped");
    }
}
