//! The per-request filter context.
//!
//! `FilterContext` is transport-agnostic: the proxy transport (`proxy.rs`)
//! is responsible for translating between a live `pingora_http` session and
//! this struct at the phase boundaries. Keeping the two separate lets the
//! filter runtime (this module, `filter.rs`, `engine.rs`) be unit tested
//! without standing up a real TCP listener, the same separation
//! `KeySourceContext` draws from `pingora_http::RequestHeader`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method, StatusCode, Uri};

use crate::metrics::Metrics;
use crate::request_facts::RequestFacts;

/// Well-known state-bag keys.
pub mod state_keys {
    pub const BACKEND_TIMEOUT: &str = "backend_timeout";
    pub const READ_TIMEOUT: &str = "read_timeout";
    pub const WRITE_TIMEOUT: &str = "write_timeout";
    pub const DYNAMIC_BACKEND: &str = "dynamic_backend";
    pub const ROUTE_ANNOTATIONS: &str = "route_annotations";
    pub const TRACE_SPAN_NAME: &str = "trace_span_name";
}

/// A request as seen/mutated by filters. Body is represented as an opaque,
/// possibly-fallible transform chain rather than an in-memory buffer:
/// filters register a [`BodyTransform`], and the proxy transport applies the
/// chain while streaming.
#[derive(Clone)]
pub struct RequestParts {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestFacts for RequestParts {
    fn method(&self) -> &str {
        self.method.as_str()
    }

    fn path(&self) -> &str {
        self.uri.path()
    }

    fn host(&self) -> Option<&str> {
        self.uri.host().or_else(|| self.headers.get(http::header::HOST)?.to_str().ok())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    fn is_tls(&self) -> bool {
        self.uri.scheme_str() == Some("https")
    }

    fn content_length(&self) -> Option<u64> {
        self.headers.get(http::header::CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
    }
}

#[derive(Clone)]
pub struct ResponseParts {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ResponseParts {
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), body: Vec::new() }
    }
}

/// A streamed byte transform that may abort. `None` signals the stream
/// should be cut short.
pub trait BodyTransform: Send + Sync {
    fn transform(&self, chunk: bytes::Bytes) -> Option<bytes::Bytes>;
}

type StateBag = HashMap<String, Box<dyn Any + Send + Sync>>;

/// Outcome of running one phase, used by the proxy transport to decide
/// whether to proceed to backend dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Continue,
    Served,
}

/// Per-request, single-owner context passed to every filter invocation.
/// Never aliased across threads: `split()` hands a cloned, independent
/// context to a background task instead of sharing `self`.
pub struct FilterContext {
    pub route_id: String,
    request: RequestParts,
    original_request: RequestParts,
    response: Option<ResponseParts>,
    original_response: Option<ResponseParts>,
    state: StateBag,
    path_params: HashMap<String, String>,
    metrics: Arc<dyn Metrics>,
    outgoing_host: Option<String>,
    served: bool,
    loopback_requested: bool,
    loop_count: u32,
    loop_cap: u32,
    request_body_transforms: Vec<Arc<dyn BodyTransform>>,
    response_body_transforms: Vec<Arc<dyn BodyTransform>>,
    pending_splits: Vec<FilterContext>,
}

impl FilterContext {
    pub fn new(
        route_id: String,
        request: RequestParts,
        path_params: HashMap<String, String>,
        metrics: Arc<dyn Metrics>,
        loop_count: u32,
        loop_cap: u32,
    ) -> Self {
        let original_request = request.clone();
        Self {
            route_id,
            request,
            original_request,
            response: None,
            original_response: None,
            state: HashMap::new(),
            path_params,
            metrics,
            outgoing_host: None,
            served: false,
            loopback_requested: false,
            loop_count,
            loop_cap,
            request_body_transforms: Vec::new(),
            response_body_transforms: Vec::new(),
            pending_splits: Vec::new(),
        }
    }

    pub fn request(&self) -> &RequestParts {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut RequestParts {
        &mut self.request
    }

    /// Response handle, populated after backend dispatch or after `serve`.
    pub fn response(&self) -> Option<&ResponseParts> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut ResponseParts> {
        self.response.as_mut()
    }

    pub fn set_response(&mut self, response: ResponseParts) {
        self.response = Some(response);
    }

    pub fn original_request(&self) -> &RequestParts {
        &self.original_request
    }

    pub fn original_response(&self) -> Option<&ResponseParts> {
        self.original_response.as_ref()
    }

    pub fn capture_original_response(&mut self) {
        self.original_response = self.response.clone();
    }

    pub fn state_bag(&mut self) -> &mut StateBag {
        &mut self.state
    }

    pub fn state_get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.state.get(key).and_then(|b| b.downcast_ref::<T>())
    }

    pub fn state_set<T: Send + Sync + 'static>(&mut self, key: &str, value: T) {
        self.state.insert(key.to_string(), Box::new(value));
    }

    pub fn backend_timeout(&self) -> Option<Duration> {
        self.state_get::<Duration>(state_keys::BACKEND_TIMEOUT).copied()
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(|s| s.as_str())
    }

    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }

    /// Tracing span for this request, named from the well-known
    /// `state_keys::TRACE_SPAN_NAME` state-bag entry if a filter has set one,
    /// falling back to the route id. Concrete span back-ends (propagation to
    /// a collector) are out of scope; this is the same "resolves to
    /// something real, backed by `tracing`" stance [`Metrics`] takes.
    pub fn tracer(&self) -> tracing::Span {
        let name = self.state_get::<String>(state_keys::TRACE_SPAN_NAME).map(|s| s.as_str()).unwrap_or("request");
        tracing::info_span!("filter_span", name = %name, route_id = %self.route_id)
    }

    pub fn outgoing_host(&self) -> Option<&str> {
        self.outgoing_host.as_deref()
    }

    pub fn set_outgoing_host(&mut self, host: impl Into<String>) {
        self.outgoing_host = Some(host.into());
    }

    /// Short-circuits backend dispatch: once `serve` is called, the backend
    /// step is skipped but response-phase filters still run.
    pub fn serve(&mut self, response: ResponseParts) {
        self.response = Some(response);
        self.served = true;
    }

    pub fn served(&self) -> bool {
        self.served
    }

    /// Signals loopback re-entry. The proxy transport checks
    /// [`FilterContext::loopback_requested`] after the request phase and,
    /// if set and the cap has not been exceeded, resubmits
    /// [`FilterContext::original_request`]-derived state to the routing
    /// engine.
    pub fn loopback(&mut self) {
        self.loopback_requested = true;
    }

    pub fn loopback_requested(&self) -> bool {
        self.loopback_requested
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn loop_cap_exceeded(&self) -> bool {
        self.loop_count > self.loop_cap
    }

    /// Advances the loop counter by one, called by the transport each time
    /// `loopback` sends the request back through the routing engine.
    pub fn bump_loop_count(&mut self) {
        self.loop_count += 1;
    }

    /// Produces an independent context for a background shadow dispatch and
    /// queues it for the proxy transport to pick up once this phase finishes.
    /// The clone shares no mutable state with `self`: the caller's filter
    /// chain keeps running on `self`, while the returned context - still
    /// mutable here so the calling filter can finish shaping it - has its
    /// request phase run, and its response discarded, on a background task.
    pub fn split(&mut self) -> &mut FilterContext {
        let split = Self {
            route_id: self.route_id.clone(),
            request: self.request.clone(),
            original_request: self.original_request.clone(),
            response: None,
            original_response: None,
            state: HashMap::new(),
            path_params: self.path_params.clone(),
            metrics: self.metrics.clone(),
            outgoing_host: self.outgoing_host.clone(),
            served: false,
            loopback_requested: false,
            loop_count: self.loop_count,
            loop_cap: self.loop_cap,
            request_body_transforms: Vec::new(),
            response_body_transforms: Vec::new(),
            pending_splits: Vec::new(),
        };
        self.pending_splits.push(split);
        self.pending_splits.last_mut().expect("just pushed")
    }

    /// Drains the splits queued by [`FilterContext::split`] since the last
    /// call. The proxy transport calls this after each request-phase run to
    /// hand each one to a background task.
    pub fn take_pending_splits(&mut self) -> Vec<FilterContext> {
        std::mem::take(&mut self.pending_splits)
    }

    /// Re-targets this context at a newly matched route after a loopback,
    /// keeping `original_request`/state history intact while resetting the
    /// per-route outcome flags so the new route's filters run clean. The
    /// transport is responsible for incrementing `loop_count` beforehand via
    /// a fresh context built with the bumped counter; this just swaps the
    /// route identity and path captures in place.
    pub fn reroute(&mut self, route_id: String, path_params: HashMap<String, String>) {
        self.route_id = route_id;
        self.path_params = path_params;
        self.served = false;
        self.loopback_requested = false;
    }

    pub fn add_request_body_transform(&mut self, t: Arc<dyn BodyTransform>) {
        self.request_body_transforms.push(t);
    }

    pub fn add_response_body_transform(&mut self, t: Arc<dyn BodyTransform>) {
        self.response_body_transforms.push(t);
    }

    pub fn request_body_transforms(&self) -> &[Arc<dyn BodyTransform>] {
        &self.request_body_transforms
    }

    pub fn response_body_transforms(&self) -> &[Arc<dyn BodyTransform>] {
        &self.response_body_transforms
    }
}
