//! The compiled routing table and its atomic publication.
//!
//! A [`Snapshot`] is produced once per successful compile cycle and then
//! never mutated; readers hold an `Arc<Snapshot>` for the duration of a
//! request so that a concurrent republish never invalidates state mid-flight.
//! Publication itself goes through `arc-swap`'s `ArcSwap`, the same way a
//! live proxy service swaps in a freshly reloaded routing table.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::path_tree::PathTree;
use crate::request_facts::RequestFacts;
use crate::route::Route;

/// An immutable, fully compiled routing table: the path tree holding every
/// route whose predicate set is (or includes) a `Path`/`PathSubtree` match,
/// plus a fallback list of routes that carry no path predicate at all and
/// so must be tried against every request regardless of path.
pub struct Snapshot {
    tree: PathTree<Arc<Route>>,
    fallback: Vec<Arc<Route>>,
}

impl Snapshot {
    pub fn new(tree: PathTree<Arc<Route>>, fallback: Vec<Arc<Route>>) -> Self {
        Self { tree, fallback }
    }

    /// Finds the best matching route for `request`: tries path-tree leaves
    /// first (falling back across siblings when a leaf's candidates all
    /// fail their non-path predicates), then falls through to path-less
    /// routes in declared order. Within a leaf or within the fallback list,
    /// candidates are tried from highest weight to lowest so the most
    /// specific match wins ties.
    pub fn route_for<'s>(
        &'s self,
        request: &dyn RequestFacts,
    ) -> Option<(&'s Arc<Route>, std::collections::HashMap<String, String>)> {
        let found = self.tree.lookup(request.path(), |candidates| {
            best_match(candidates, request).is_some()
        });

        if let Some((candidates, params)) = found {
            if let Some(route) = best_match(candidates, request) {
                return Some((route, params));
            }
        }

        best_match(&self.fallback, request).map(|r| (r, std::collections::HashMap::new()))
    }

    pub fn route_count(&self) -> usize {
        self.fallback.len() + self.tree.len()
    }
}

/// Picks the highest-weight route among `candidates` whose every predicate
/// matches `request`, in order (ties keep first-registered precedence since
/// the compiler sorts candidates by descending weight before publication).
fn best_match<'a>(candidates: &'a [Arc<Route>], request: &dyn RequestFacts) -> Option<&'a Arc<Route>> {
    candidates
        .iter()
        .find(|route| route.predicates.iter().all(|p| p.instance.matches(request)))
}

/// Atomically published holder for the current [`Snapshot`]. Readers call
/// [`SnapshotStore::load`] once per request and route against that handle;
/// the engine calls [`SnapshotStore::store`] after every successful compile.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<ArcSwap<Snapshot>>,
}

impl SnapshotStore {
    pub fn new(initial: Snapshot) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(initial)) }
    }

    pub fn load(&self) -> arc_swap::Guard<Arc<Snapshot>> {
        self.inner.load()
    }

    pub fn store(&self, snapshot: Snapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{Predicate, WEIGHT_GENERIC};
    use crate::request_facts::OwnedRequestFacts;
    use crate::route::{Backend, CompiledPredicate};

    struct AlwaysTrue;
    impl Predicate for AlwaysTrue {
        fn matches(&self, _request: &dyn RequestFacts) -> bool {
            true
        }
    }

    struct AlwaysFalse;
    impl Predicate for AlwaysFalse {
        fn matches(&self, _request: &dyn RequestFacts) -> bool {
            false
        }
    }

    fn route(id: &str, matches: bool, weight: u32) -> Arc<Route> {
        let instance: Arc<dyn Predicate> = if matches { Arc::new(AlwaysTrue) } else { Arc::new(AlwaysFalse) };
        Arc::new(Route {
            id: id.to_string(),
            predicates: vec![CompiledPredicate { name: "always".into(), instance, weight }],
            filters: Vec::new(),
            backend: Backend::Shunt { final_response: true },
            host_regexps: Vec::new(),
            preserve_host: false,
        })
    }

    #[test]
    fn path_tree_match_wins_over_fallback() {
        let mut tree = PathTree::new();
        tree.insert("/ok", route("path-route", true, WEIGHT_GENERIC)).unwrap();
        let fallback = vec![route("fallback-route", true, WEIGHT_GENERIC)];
        let snap = Snapshot::new(tree, fallback);

        let req = OwnedRequestFacts::get("GET", "/ok");
        let (matched, _) = snap.route_for(&req).unwrap();
        assert_eq!(matched.id, "path-route");
    }

    #[test]
    fn falls_back_when_path_tree_has_no_match() {
        let tree = PathTree::new();
        let fallback = vec![route("fallback-route", true, WEIGHT_GENERIC)];
        let snap = Snapshot::new(tree, fallback);

        let req = OwnedRequestFacts::get("GET", "/anything");
        let (matched, _) = snap.route_for(&req).unwrap();
        assert_eq!(matched.id, "fallback-route");
    }

    #[test]
    fn leaf_backtracks_to_second_candidate_when_first_predicate_rejects() {
        let mut tree = PathTree::new();
        tree.insert("/ok", route("rejects", false, WEIGHT_GENERIC)).unwrap();
        tree.insert("/ok", route("accepts", true, WEIGHT_GENERIC)).unwrap();
        let snap = Snapshot::new(tree, Vec::new());

        let req = OwnedRequestFacts::get("GET", "/ok");
        let (matched, _) = snap.route_for(&req).unwrap();
        assert_eq!(matched.id, "accepts");
    }

    #[test]
    fn no_match_anywhere_returns_none() {
        let snap = Snapshot::new(PathTree::new(), Vec::new());
        let req = OwnedRequestFacts::get("GET", "/nope");
        assert!(snap.route_for(&req).is_none());
    }

    #[test]
    fn store_replaces_the_published_snapshot() {
        let store = SnapshotStore::new(Snapshot::new(PathTree::new(), Vec::new()));
        assert_eq!(store.load().route_count(), 0);
        store.store(Snapshot::new(PathTree::new(), vec![route("r1", true, WEIGHT_GENERIC)]));
        assert_eq!(store.load().route_count(), 1);
    }
}
