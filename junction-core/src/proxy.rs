//! The proxy transport: wires a routing [`Snapshot`], the filter runtime and
//! the backend-dispatch primitives (load balancer, circuit breaker) into a
//! `pingora_proxy::ProxyHttp` implementation.
//!
//! Grounded directly on `MotyaProxyService`'s `ProxyHttp` impl
//! (`proxy/mod.rs`): `new_ctx` loads the shared routing state, `request_filter`
//! matches and runs request-phase filters (short-circuiting for a served or
//! shunt response exactly like its `SimpleResponse` path), `upstream_peer`
//! resolves the backend into an `HttpPeer`, and
//! `upstream_request_filter`/`upstream_response_filter` apply the mutated
//! header state in each direction. Backend selection and breaker/endpoint
//! accounting dispatch per request against several backend kinds rather than
//! through one pre-built `UpstreamRouter`+`Balancer` pair resolved once at
//! config load, and are grounded instead on this crate's own
//! `balancer`/`breaker` modules.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use http::{HeaderMap, Method, StatusCode, Uri};
use pingora_core::prelude::HttpPeer;
use pingora_core::{Error, ErrorType, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::balancer::{Algorithm, BalancerRegistry};
use crate::breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig};
use crate::context::{state_keys, BodyTransform, FilterContext, RequestParts, ResponseParts};
use crate::filter::Filter;
use crate::metrics::Metrics;
use crate::request_facts::RequestFacts;
use crate::route::{Backend, Route};
use crate::snapshot::SnapshotStore;

/// Adapts a live `pingora_http::RequestHeader` (plus the client's socket
/// address) into [`RequestFacts`] so predicates and the path tree never see
/// a transport type directly — the same decoupling `SessionInfo<'a>` gives
/// `KeySourceContext`.
struct SessionFacts<'a> {
    header: &'a RequestHeader,
}

impl<'a> RequestFacts for SessionFacts<'a> {
    fn method(&self) -> &str {
        self.header.method.as_str()
    }

    fn path(&self) -> &str {
        self.header.uri.path()
    }

    fn host(&self) -> Option<&str> {
        self.header.uri.host().or_else(|| self.header.headers.get(http::header::HOST)?.to_str().ok())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.header.headers.get(name)?.to_str().ok()
    }

    fn query(&self) -> Option<&str> {
        self.header.uri.query()
    }

    fn is_tls(&self) -> bool {
        self.header.uri.scheme_str() == Some("https")
    }

    fn content_length(&self) -> Option<u64> {
        self.header.headers.get(http::header::CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
    }
}

fn request_parts_from_header(header: &RequestHeader) -> RequestParts {
    RequestParts { method: header.method.clone(), uri: header.uri.clone(), headers: header.headers.clone() }
}

/// Per-request scratch state carried between `ProxyHttp` hooks. Grounded on
/// `MotyaContext`, extended with dispatch accounting `upstream_peer` there
/// never needed since it just asks a pre-built balancer for a peer.
pub struct JunctionCtx {
    filter_ctx: Option<FilterContext>,
    route: Option<Arc<Route>>,
    ran_filters: usize,
    endpoint: Option<Arc<crate::balancer::endpoint::Endpoint>>,
    breaker: Option<Arc<CircuitBreaker>>,
    dispatch_started: Option<Instant>,
    accounted: bool,
    retries_left: usize,
    /// Correlates every log line this request produces across hooks;
    /// minted once per request so every hook can tag with it rather than
    /// only a single call site along the way.
    request_id: uuid::Uuid,
}

impl Default for JunctionCtx {
    fn default() -> Self {
        Self {
            filter_ctx: None,
            route: None,
            ran_filters: 0,
            endpoint: None,
            breaker: None,
            dispatch_started: None,
            accounted: false,
            retries_left: 1,
            request_id: uuid::Uuid::new_v4(),
        }
    }
}

/// The proxy service itself. One instance is registered with the `pingora`
/// server and handles every request; all mutable per-request state lives in
/// [`JunctionCtx`].
pub struct JunctionProxy {
    snapshots: SnapshotStore,
    metrics: Arc<dyn Metrics>,
    breakers: Arc<BreakerRegistry>,
    balancers: Arc<BalancerRegistry>,
    loop_cap: u32,
    breaker_config: CircuitBreakerConfig,
}

impl JunctionProxy {
    pub fn new(snapshots: SnapshotStore, metrics: Arc<dyn Metrics>, loop_cap: u32) -> Self {
        Self {
            snapshots,
            metrics,
            breakers: Arc::new(BreakerRegistry::new()),
            balancers: Arc::new(BalancerRegistry::new()),
            loop_cap,
            breaker_config: CircuitBreakerConfig::default(),
        }
    }

    fn breaker_key(route_id: &str, host: &str) -> String {
        format!("{route_id}::{host}")
    }

    /// Builds a locally-generated response (route miss, loop detected, an
    /// argument/compile-time error surfaced late) without going through a
    /// route's filter chain.
    fn plain_response(status: StatusCode, body: impl Into<Vec<u8>>) -> ResponseParts {
        let mut parts = ResponseParts::new(status);
        parts.body = body.into();
        parts
    }

    async fn write_direct_response(session: &mut Session, response: &ResponseParts) -> Result<()> {
        let mut header = ResponseHeader::build(response.status, Some(response.headers.len() + 1))?;
        for (name, value) in response.headers.iter() {
            header.insert_header(name.clone(), value.clone())?;
        }
        header.insert_header("content-length", response.body.len().to_string())?;
        session.write_response_header(Box::new(header), false).await?;
        session.write_response_body(Some(Bytes::from(response.body.clone())), true).await?;
        session.set_keepalive(None);
        Ok(())
    }

    /// Runs the request-phase filters for `route` in declared order,
    /// catching a panicking filter the way a panicking request handler would
    /// otherwise take the whole connection down with it. Returns the number
    /// of filters whose `on_request` actually ran, which bounds the
    /// response-phase rewind.
    async fn run_request_phase(route: &Arc<Route>, ctx: &mut FilterContext) -> std::result::Result<usize, usize> {
        for (index, filter) in route.filters.iter().enumerate() {
            if !call_on_request(filter, ctx).await {
                return Err(index);
            }
            if ctx.served() || ctx.loopback_requested() {
                return Ok(index + 1);
            }
        }
        Ok(route.filters.len())
    }

    /// Runs the response-phase filters for the first `ran` filters of
    /// `route`, in reverse declared order.
    async fn run_response_phase(route: &Arc<Route>, ran: usize, ctx: &mut FilterContext) -> std::result::Result<(), usize> {
        ctx.capture_original_response();
        for index in (0..ran.min(route.filters.len())).rev() {
            if !call_on_response(&route.filters[index], ctx).await {
                return Err(index);
            }
        }
        Ok(())
    }

    /// Hands every split queued by `filter_ctx` since the last drain to a
    /// background task, each running independently of `filter_ctx`'s own
    /// dispatch from here on.
    fn spawn_pending_splits(&self, route: &Arc<Route>, filter_ctx: &mut FilterContext) {
        for split_ctx in filter_ctx.take_pending_splits() {
            tokio::spawn(run_split_dispatch(self.snapshots.clone(), self.metrics.clone(), route.clone(), split_ctx));
        }
    }
}

/// Runs a split context's request-phase filter chain to completion,
/// including its own bounded loopback re-entry, then drops it. Mirrors the
/// loopback loop in `request_filter`, but never writes a response or
/// proceeds to backend dispatch: a split's only observable effect is
/// whatever its filters did to shared state (metrics, external calls) along
/// the way.
async fn run_split_dispatch(snapshots: SnapshotStore, metrics: Arc<dyn Metrics>, route: Arc<Route>, mut ctx: FilterContext) {
    let mut route = route;
    if JunctionProxy::run_request_phase(&route, &mut ctx).await.is_err() {
        metrics.incr_counter("filter-panic", &route.id);
        return;
    }

    for nested in ctx.take_pending_splits() {
        tokio::spawn(run_split_dispatch(snapshots.clone(), metrics.clone(), route.clone(), nested));
    }

    while !ctx.served() && ctx.loopback_requested() {
        ctx.bump_loop_count();
        if ctx.loop_cap_exceeded() {
            metrics.incr_counter("loop-detected", &route.id);
            break;
        }

        let snapshot = snapshots.load();
        let facts = ctx.request().clone();
        let Some((next_route, next_params)) = snapshot.route_for(&facts) else {
            metrics.incr_counter("route-miss", &route.id);
            break;
        };
        route = next_route.clone();
        ctx.reroute(route.id.clone(), next_params);

        if JunctionProxy::run_request_phase(&route, &mut ctx).await.is_err() {
            metrics.incr_counter("filter-panic", &route.id);
            break;
        }
        for nested in ctx.take_pending_splits() {
            tokio::spawn(run_split_dispatch(snapshots.clone(), metrics.clone(), route.clone(), nested));
        }
    }
}

/// Calls `filter.on_request(ctx)`, catching a panic and reporting it as a
/// clean `false` rather than unwinding across the `pingora` task boundary.
async fn call_on_request(filter: &Arc<dyn Filter>, ctx: &mut FilterContext) -> bool {
    AssertUnwindSafe(filter.on_request(ctx)).catch_unwind().await.is_ok()
}

async fn call_on_response(filter: &Arc<dyn Filter>, ctx: &mut FilterContext) -> bool {
    AssertUnwindSafe(filter.on_response(ctx)).catch_unwind().await.is_ok()
}

/// Parses a `scheme://host:port` network backend address into the pieces
/// `HttpPeer::new` wants. Falls back to treating the whole string as a bare
/// `host:port` authority (no scheme) when it does not parse as a URI with a
/// host, matching how `LoadBalanced` endpoint strings are already consumed
/// as bare authorities in `balancer::EndpointBalancer`.
fn peer_address_parts(addr: &str) -> (String, bool, String) {
    if let Ok(uri) = addr.parse::<Uri>() {
        if let Some(host) = uri.host() {
            let tls = uri.scheme_str() == Some("https");
            let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
            let sni = if tls { host.to_string() } else { String::new() };
            return (format!("{host}:{port}"), tls, sni);
        }
    }
    (addr.to_string(), false, String::new())
}

fn apply_dispatch_timeouts(peer: &mut HttpPeer, ctx: &FilterContext) {
    if let Some(d) = ctx.backend_timeout() {
        peer.options.connection_timeout = Some(d);
    }
    if let Some(d) = ctx.state_get::<Duration>(state_keys::READ_TIMEOUT) {
        peer.options.read_timeout = Some(*d);
    }
    if let Some(d) = ctx.state_get::<Duration>(state_keys::WRITE_TIMEOUT) {
        peer.options.write_timeout = Some(*d);
    }
}

#[async_trait]
impl ProxyHttp for JunctionProxy {
    type CTX = JunctionCtx;

    fn new_ctx(&self) -> Self::CTX {
        JunctionCtx::default()
    }

    /// Matches the request against the current snapshot, runs the
    /// request-phase filter chain (including bounded loopback re-entry), and
    /// either writes a response directly (route miss, `serve`, a
    /// `final_response` shunt, loop cap exceeded) or stashes the resolved
    /// route and context in `ctx` for the backend-dispatch hooks below.
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let snapshot = self.snapshots.load();
        let facts = SessionFacts { header: session.req_header() };

        let Some((route, path_params)) = snapshot.route_for(&facts) else {
            self.metrics.incr_counter("route-miss", "-");
            let response = Self::plain_response(StatusCode::NOT_FOUND, &b"not found"[..]);
            Self::write_direct_response(session, &response).await?;
            return Ok(true);
        };

        let mut route = route.clone();
        let mut filter_ctx = FilterContext::new(
            route.id.clone(),
            request_parts_from_header(session.req_header()),
            path_params,
            self.metrics.clone(),
            0,
            self.loop_cap,
        );

        let mut ran = match Self::run_request_phase(&route, &mut filter_ctx).await {
            Ok(ran) => ran,
            Err(index) => {
                self.metrics.incr_counter("filter-panic", &route.id);
                tracing::warn!(request_id = %ctx.request_id, route_id = %route.id, filter_index = index, "request-phase filter panicked");
                filter_ctx.serve(Self::plain_response(StatusCode::INTERNAL_SERVER_ERROR, &b"filter panicked"[..]));
                0
            }
        };
        self.spawn_pending_splits(&route, &mut filter_ctx);

        while !filter_ctx.served() && (filter_ctx.loopback_requested() || matches!(route.backend, Backend::Loopback)) {
            filter_ctx.bump_loop_count();
            if filter_ctx.loop_cap_exceeded() {
                self.metrics.incr_counter("loop-detected", &route.id);
                filter_ctx.serve(Self::plain_response(StatusCode::INTERNAL_SERVER_ERROR, &b"loop detected"[..]));
                break;
            }

            let facts_for_reroute = filter_ctx.request().clone();
            let Some((next_route, next_params)) = snapshot.route_for(&facts_for_reroute) else {
                self.metrics.incr_counter("route-miss", &route.id);
                filter_ctx.serve(Self::plain_response(StatusCode::NOT_FOUND, &b"not found"[..]));
                break;
            };
            route = next_route.clone();
            filter_ctx.reroute(route.id.clone(), next_params);

            ran = match Self::run_request_phase(&route, &mut filter_ctx).await {
                Ok(ran) => ran,
                Err(index) => {
                    self.metrics.incr_counter("filter-panic", &route.id);
                    tracing::warn!(request_id = %ctx.request_id, route_id = %route.id, filter_index = index, "request-phase filter panicked");
                    filter_ctx.serve(Self::plain_response(StatusCode::INTERNAL_SERVER_ERROR, &b"filter panicked"[..]));
                    0
                }
            };
            self.spawn_pending_splits(&route, &mut filter_ctx);
        }

        let is_final_shunt = matches!(route.backend, Backend::Shunt { .. }) && !filter_ctx.served();
        if is_final_shunt && filter_ctx.response().is_none() {
            filter_ctx.serve(Self::plain_response(StatusCode::NOT_FOUND, &b"shunt route produced no response"[..]));
        } else if is_final_shunt {
            // A filter already populated a response without calling `serve`
            // (e.g. a shunt route whose only filter sets headers); treat it
            // as served so the response phase and direct write below run.
            if let Some(existing) = filter_ctx.response().cloned() {
                filter_ctx.serve(existing);
            }
        }

        if filter_ctx.served() {
            if Self::run_response_phase(&route, ran, &mut filter_ctx).await.is_err() {
                self.metrics.incr_counter("filter-panic", &route.id);
            }
            let response = filter_ctx.response().cloned().unwrap_or_else(|| {
                Self::plain_response(StatusCode::INTERNAL_SERVER_ERROR, &b"no response produced"[..])
            });
            Self::write_direct_response(session, &response).await?;
            return Ok(true);
        }

        ctx.ran_filters = ran;
        ctx.route = Some(route);
        ctx.filter_ctx = Some(filter_ctx);
        Ok(false)
    }

    async fn upstream_peer(&self, _session: &mut Session, ctx: &mut Self::CTX) -> Result<Box<HttpPeer>> {
        let route = ctx.route.clone().ok_or_else(|| Error::explain(ErrorType::InternalError, "no route resolved"))?;
        let filter_ctx = ctx.filter_ctx.as_ref().ok_or_else(|| Error::explain(ErrorType::InternalError, "no filter context"))?;

        let host = filter_ctx.outgoing_host().map(str::to_string).or_else(|| filter_ctx.request().host().map(str::to_string));
        let breaker_key = Self::breaker_key(&route.id, host.as_deref().unwrap_or("-"));
        let breaker = self.breakers.get_or_create(&breaker_key, &self.breaker_config);
        if !breaker.allow_request().await {
            self.metrics.incr_counter("breaker-open", &route.id);
            return Err(Error::explain(ErrorType::HTTPStatus(503), "circuit breaker open"));
        }
        ctx.breaker = Some(breaker);
        ctx.dispatch_started = Some(Instant::now());

        let mut peer = match &route.backend {
            Backend::Network(addr) => {
                let (address, tls, sni) = peer_address_parts(addr);
                Box::new(HttpPeer::new(address, tls, sni))
            }
            Backend::LoadBalanced { endpoints, algorithm } => {
                let balancer = self.balancers.get_or_create(&route.id, endpoints, algorithm).await;
                let hash_key = consistent_hash_key(filter_ctx, *algorithm == Algorithm::ConsistentHash);
                let endpoint = balancer.select(&hash_key).ok_or_else(|| {
                    Error::explain(ErrorType::HTTPStatus(502), "no healthy endpoint available")
                })?;
                endpoint.begin_request();
                let (address, tls, sni) = peer_address_parts(&endpoint.address);
                ctx.endpoint = Some(endpoint);
                Box::new(HttpPeer::new(address, tls, sni))
            }
            Backend::Dynamic => {
                let dynamic = filter_ctx.state_get::<String>(state_keys::DYNAMIC_BACKEND).cloned().ok_or_else(|| {
                    Error::explain(ErrorType::HTTPStatus(502), "dynamic backend requested but no filter supplied one")
                })?;
                let (address, tls, sni) = peer_address_parts(&dynamic);
                Box::new(HttpPeer::new(address, tls, sni))
            }
            Backend::Loopback | Backend::Shunt { .. } => {
                return Err(Error::explain(ErrorType::InternalError, "loopback/shunt backend reached upstream_peer"));
            }
        };

        apply_dispatch_timeouts(&mut peer, filter_ctx);
        Ok(peer)
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        header: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(filter_ctx) = ctx.filter_ctx.as_ref() else { return Ok(()) };
        let mutated = filter_ctx.request();
        header.set_method(mutated.method.clone())?;
        header.set_uri(mutated.uri.clone());

        let route = ctx.route.as_ref();
        let preserve_host = route.map(|r| r.preserve_host).unwrap_or(false);
        if !preserve_host {
            if let Some(host) = filter_ctx.outgoing_host() {
                header.insert_header("host", host)?;
            }
        }

        for (name, value) in mutated.headers.iter() {
            if name == http::header::HOST && preserve_host {
                continue;
            }
            header.insert_header(name.clone(), value.clone())?;
        }
        Ok(())
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        _end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        apply_body_transforms(body, ctx.filter_ctx.as_ref().map(|f| f.request_body_transforms()).unwrap_or(&[]));
        Ok(())
    }

    /// Copies the upstream's status/headers into the filter context, runs
    /// the response-phase filter chain in reverse order, then writes the
    /// mutated status/headers back onto the header `pingora` is about to
    /// send downstream.
    async fn upstream_response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let route = ctx.route.clone();
        let ran = ctx.ran_filters;
        let Some(filter_ctx) = ctx.filter_ctx.as_mut() else { return Ok(()) };
        let Some(route) = route else { return Ok(()) };

        let status = upstream_response.status;
        self.record_backend_outcome(ctx, status).await;

        let mut headers = HeaderMap::new();
        for (name, value) in upstream_response.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        filter_ctx.set_response(ResponseParts { status, headers, body: Vec::new() });

        if JunctionProxy::run_response_phase(&route, ran, filter_ctx).await.is_err() {
            self.metrics.incr_counter("filter-panic", &route.id);
        }

        if let Some(response) = filter_ctx.response() {
            upstream_response.set_status(response.status)?;
            for name in header_names(upstream_response) {
                upstream_response.remove_header(&name);
            }
            for (name, value) in response.headers.iter() {
                upstream_response.insert_header(name.clone(), value.clone())?;
            }
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        _end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        apply_body_transforms(body, ctx.filter_ctx.as_ref().map(|f| f.response_body_transforms()).unwrap_or(&[]));
        Ok(None)
    }

    async fn fail_to_connect(&self, _session: &mut Session, _peer: &HttpPeer, ctx: &mut Self::CTX, mut e: Box<Error>) -> Box<Error> {
        if let Some(endpoint) = &ctx.endpoint {
            endpoint.end_request(false);
        }
        if let Some(breaker) = &ctx.breaker {
            breaker.on_failure().await;
        }
        ctx.accounted = true;
        let retrying = ctx.retries_left > 0;
        if retrying {
            ctx.retries_left -= 1;
            e.set_retry(true);
        }
        if let Some(route) = &ctx.route {
            self.metrics.incr_counter("backend-dial", &route.id);
            tracing::error!(request_id = %ctx.request_id, route_id = %route.id, retrying, "failed to connect to backend: {e}");
        }
        e
    }

    async fn logging(&self, _session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        if !ctx.accounted {
            let success = e.is_none();
            if let Some(endpoint) = &ctx.endpoint {
                endpoint.end_request(success);
            }
            if let Some(breaker) = &ctx.breaker {
                if success {
                    breaker.on_success().await;
                } else {
                    breaker.on_failure().await;
                }
            }
        }
        if let (Some(route), Some(started)) = (&ctx.route, ctx.dispatch_started) {
            self.metrics.observe_duration("backend-dispatch", &route.id, started.elapsed());
        }
    }
}

impl JunctionProxy {
    /// Records a breaker outcome based on the upstream's status code as soon
    /// as headers arrive, ahead of the final `logging` accounting, so a
    /// backend that returns a stream of 5xx responses trips the breaker
    /// without waiting for the connection to fully close.
    async fn record_backend_outcome(&self, ctx: &mut JunctionCtx, status: StatusCode) {
        let success = status.as_u16() < 500;
        if let Some(endpoint) = &ctx.endpoint {
            endpoint.end_request(success);
        }
        if let Some(breaker) = &ctx.breaker {
            if success {
                breaker.on_success().await;
            } else {
                breaker.on_failure().await;
            }
        }
        ctx.accounted = true;
    }
}

fn header_names(header: &ResponseHeader) -> Vec<http::HeaderName> {
    header.headers.keys().cloned().collect()
}

fn apply_body_transforms(body: &mut Option<Bytes>, transforms: &[Arc<dyn BodyTransform>]) {
    if transforms.is_empty() {
        return;
    }
    let Some(chunk) = body.take() else { return };
    let mut current = Some(chunk);
    for transform in transforms {
        current = match current {
            Some(c) => transform.transform(c),
            None => None,
        };
        if current.is_none() {
            break;
        }
    }
    *body = current;
}

/// Derives the bytes a `ConsistentHash`-selected balancer hashes on: the
/// request path, falling back to an empty key for every other algorithm
/// (which ignore it, per `EndpointBalancer::select`).
fn consistent_hash_key(ctx: &FilterContext, needs_key: bool) -> Vec<u8> {
    if needs_key {
        ctx.request().path().as_bytes().to_vec()
    } else {
        Vec::new()
    }
}

/// Builds the `pingora` HTTP proxy service for a [`JunctionProxy`].
pub fn service(
    proxy: JunctionProxy,
    server_conf: &std::sync::Arc<pingora_core::server::configuration::ServerConf>,
) -> pingora_proxy::HttpProxy<JunctionProxy> {
    pingora_proxy::http_proxy_service(server_conf, proxy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::collections::HashMap as StdHashMap;

    fn ctx_with_request(path: &str) -> FilterContext {
        let req = RequestParts { method: Method::GET, uri: path.parse().unwrap(), headers: HeaderMap::new() };
        FilterContext::new("r1".into(), req, StdHashMap::new(), Arc::new(NoopMetrics), 0, 5)
    }

    #[test]
    fn consistent_hash_key_is_empty_when_algorithm_does_not_need_one() {
        let ctx = ctx_with_request("/a/b");
        assert!(consistent_hash_key(&ctx, false).is_empty());
        assert_eq!(consistent_hash_key(&ctx, true), b"/a/b".to_vec());
    }

    struct UppercaseTransform;
    impl BodyTransform for UppercaseTransform {
        fn transform(&self, chunk: Bytes) -> Option<Bytes> {
            Some(Bytes::from(chunk.to_ascii_uppercase()))
        }
    }

    struct DropTransform;
    impl BodyTransform for DropTransform {
        fn transform(&self, _chunk: Bytes) -> Option<Bytes> {
            None
        }
    }

    #[test]
    fn body_transforms_apply_in_order() {
        let transforms: Vec<Arc<dyn BodyTransform>> = vec![Arc::new(UppercaseTransform)];
        let mut body = Some(Bytes::from_static(b"hello"));
        apply_body_transforms(&mut body, &transforms);
        assert_eq!(body.unwrap(), Bytes::from_static(b"HELLO"));
    }

    #[test]
    fn a_transform_returning_none_cuts_the_chunk() {
        let transforms: Vec<Arc<dyn BodyTransform>> = vec![Arc::new(DropTransform), Arc::new(UppercaseTransform)];
        let mut body = Some(Bytes::from_static(b"hello"));
        apply_body_transforms(&mut body, &transforms);
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn split_dispatch_runs_the_request_phase_on_its_own_context() {
        use crate::snapshot::{Snapshot, SnapshotStore};
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingFilter(Arc<AtomicUsize>);
        #[async_trait]
        impl Filter for CountingFilter {
            async fn on_request(&self, _ctx: &mut FilterContext) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let route = Arc::new(Route {
            id: "split-target".into(),
            predicates: Vec::new(),
            filters: vec![Arc::new(CountingFilter(hits.clone()))],
            backend: Backend::Shunt { final_response: true },
            host_regexps: Vec::new(),
            preserve_host: false,
        });

        let ctx = ctx_with_request("/a");
        let snapshots = SnapshotStore::new(Snapshot::new(crate::path_tree::PathTree::new(), Vec::new()));
        run_split_dispatch(snapshots, Arc::new(NoopMetrics), route, ctx).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn peer_address_parts_splits_scheme_host_port() {
        let (addr, tls, sni) = peer_address_parts("https://backend.internal:8443");
        assert_eq!(addr, "backend.internal:8443");
        assert!(tls);
        assert_eq!(sni, "backend.internal");

        let (addr, tls, _sni) = peer_address_parts("10.0.0.5:9000");
        assert_eq!(addr, "10.0.0.5:9000");
        assert!(!tls);
    }
}
