//! Filter instances and the filter spec registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::FilterContext;
use crate::error::ArgError;
use crate::value::Value;

/// Polymorphic over the capability set `{on_request, on_response}`: a filter
/// overrides only the phases it cares about. Both methods may suspend
/// (backend dial happens elsewhere, but queue admission and rate-limiter
/// round-trips are filters in their own right), hence `async_trait`.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn on_request(&self, _ctx: &mut FilterContext) {}
    async fn on_response(&self, _ctx: &mut FilterContext) {}

    /// Escape hatch for post-processors that need to recognize and bind
    /// shared route-scoped resources (a queue, a breaker) into a specific
    /// filter instance after compilation — see `scheduler::QueueFilter`.
    /// `dyn Filter` is implicitly `'static` (object safety requires it for
    /// a trait with no other lifetime bound), so this default is callable
    /// through the trait object too.
    fn as_any(&self) -> &dyn std::any::Any
    where
        Self: 'static,
    {
        self
    }
}

/// `name() -> String`, `create(args) -> (instance, error)`.
pub trait FilterSpec: Send + Sync {
    fn name(&self) -> &'static str;
    fn create(&self, args: &[Value]) -> Result<Arc<dyn Filter>, ArgError>;
}

/// Name → spec mapping.
#[derive(Default)]
pub struct FilterRegistry {
    specs: HashMap<&'static str, Arc<dyn FilterSpec>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: Arc<dyn FilterSpec>) {
        self.specs.insert(spec.name(), spec);
    }

    pub fn create(&self, name: &str, args: &[Value]) -> Result<Arc<dyn Filter>, CreateError> {
        let spec = self.specs.get(name).ok_or_else(|| CreateError::Unknown(name.to_string()))?;
        spec.create(args).map_err(CreateError::Argument)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.specs.keys().copied().collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("filter '{0}' is not registered")]
    Unknown(String),
    #[error(transparent)]
    Argument(#[from] ArgError),
}
