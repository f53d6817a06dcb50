//! Predicate instances and the predicate spec registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ArgError;
use crate::request_facts::RequestFacts;
use crate::value::Value;

/// A boolean function over request-visible state, pure and stateless across
/// requests.
pub trait Predicate: Send + Sync {
    fn matches(&self, request: &dyn RequestFacts) -> bool;
}

/// Specificity contributed by a predicate kind when none is overridden by an
/// explicit `Weight(n)` predicate. These are ordered tie-breakers, not an
/// absolute formula — see DESIGN.md.
pub const WEIGHT_GENERIC: u32 = 1;
pub const WEIGHT_METHOD: u32 = 10;
pub const WEIGHT_HOST: u32 = 20;
pub const WEIGHT_EXPLICIT_BASE: u32 = 1_000;

/// `name() -> String`, `create(args) -> (instance, weight)`.
pub trait PredicateSpec: Send + Sync {
    fn name(&self) -> &'static str;
    fn create(&self, args: &[Value]) -> Result<(Arc<dyn Predicate>, u32), ArgError>;
}

/// Name → spec mapping.
#[derive(Default)]
pub struct PredicateRegistry {
    specs: HashMap<&'static str, Arc<dyn PredicateSpec>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: Arc<dyn PredicateSpec>) {
        self.specs.insert(spec.name(), spec);
    }

    pub fn create(
        &self,
        name: &str,
        args: &[Value],
    ) -> Result<(Arc<dyn Predicate>, u32), CreateError> {
        let spec = self.specs.get(name).ok_or_else(|| CreateError::Unknown(name.to_string()))?;
        spec.create(args).map_err(CreateError::Argument)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("predicate '{0}' is not registered")]
    Unknown(String),
    #[error(transparent)]
    Argument(#[from] ArgError),
}

/// `Path(pattern)`: the one concrete predicate the core ships — path
/// matching is core territory even though other business predicates are
/// out of scope. Route compilation normally folds `Path(...)` into path-tree
/// insertion rather than evaluating it per request; this spec object exists
/// so `Path(...)` can also appear as an ordinary predicate for routes that
/// share a path-tree leaf and need a literal re-check (e.g. after a
/// loopback rewrites the path). See [`PathPredicate`].
pub struct PathPredicateSpec;

pub struct PathPredicate {
    pattern: String,
}

impl Predicate for PathPredicate {
    fn matches(&self, request: &dyn RequestFacts) -> bool {
        crate::path_tree::path_matches_pattern(&self.pattern, request.path())
    }
}

impl PredicateSpec for PathPredicateSpec {
    fn name(&self) -> &'static str {
        "Path"
    }

    fn create(&self, args: &[Value]) -> Result<(Arc<dyn Predicate>, u32), ArgError> {
        let mut a = crate::value::Args::new("Path", args);
        let pattern = a.string();
        a.no_more();
        a.finish()?;
        Ok((Arc::new(PathPredicate { pattern: pattern.unwrap() }), WEIGHT_GENERIC))
    }
}

/// `Weight(n)`: an explicit specificity override. Always matches; its sole
/// purpose is contributing to the route's total weight.
pub struct WeightPredicateSpec;

pub struct WeightPredicate;

impl Predicate for WeightPredicate {
    fn matches(&self, _request: &dyn RequestFacts) -> bool {
        true
    }
}

impl PredicateSpec for WeightPredicateSpec {
    fn name(&self) -> &'static str {
        "Weight"
    }

    fn create(&self, args: &[Value]) -> Result<(Arc<dyn Predicate>, u32), ArgError> {
        let mut a = crate::value::Args::new("Weight", args);
        let n = a.integer();
        a.no_more();
        a.finish()?;
        let n = n.unwrap_or(0).max(0) as u32;
        Ok((Arc::new(WeightPredicate), WEIGHT_EXPLICIT_BASE + n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unknown_predicate() {
        let reg = PredicateRegistry::new();
        let err = reg.create("Bogus", &[]).unwrap_err();
        assert!(matches!(err, CreateError::Unknown(_)));
    }

    #[test]
    fn path_predicate_matches_literal() {
        let spec = PathPredicateSpec;
        let (pred, weight) = spec.create(&[Value::String("/ok".into())]).unwrap();
        assert_eq!(weight, WEIGHT_GENERIC);
        let req = crate::request_facts::OwnedRequestFacts::get("GET", "/ok");
        assert!(pred.matches(&req));
        let req2 = crate::request_facts::OwnedRequestFacts::get("GET", "/not-ok");
        assert!(!pred.matches(&req2));
    }

    #[test]
    fn weight_predicate_always_matches_and_contributes_weight() {
        let spec = WeightPredicateSpec;
        let (pred, weight) = spec.create(&[Value::Number(5.0)]).unwrap();
        assert_eq!(weight, WEIGHT_EXPLICIT_BASE + 5);
        let req = crate::request_facts::OwnedRequestFacts::get("GET", "/anything");
        assert!(pred.matches(&req));
    }
}
