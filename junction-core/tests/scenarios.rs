//! End-to-end scenarios with literal inputs, one test per numbered case.
//!
//! Each scenario drives the same request/response filter-phase algorithm the
//! proxy transport runs (forward on `on_request`, bounded loopback re-entry,
//! reverse on `on_response`), reimplemented here against the public surface
//! of each module since the transport itself needs a live `pingora` session.
//! Load balancing, scheduling and breaker scenarios go straight at their own
//! public APIs, the same things the transport's `upstream_peer` hook
//! consults around backend dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};

use junction_core::balancer::{Algorithm, BalancerRegistry};
use junction_core::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Trip};
use junction_core::context::{FilterContext, RequestParts};
use junction_core::engine::{Engine, InMemoryDataClient};
use junction_core::filter::Filter;
use junction_core::filters::{SetPathFilterSpec, SetResponseHeaderFilterSpec, StatusFilterSpec};
use junction_core::metrics::NoopMetrics;
use junction_core::route::{Backend, BackendDef, Route, RouteDef, SpecRef};
use junction_core::scheduler::{AdmitError, Queue, QueuePolicy};
use junction_core::value::Value;
use junction_core::{core_filters, core_predicates, core_processors};

fn request(path: &str) -> RequestParts {
    RequestParts { method: Method::GET, uri: path.parse().unwrap(), headers: HeaderMap::new() }
}

fn ctx(route_id: &str, path: &str, loop_cap: u32) -> FilterContext {
    FilterContext::new(route_id.to_string(), request(path), HashMap::new(), Arc::new(NoopMetrics), 0, loop_cap)
}

async fn run_request_filters(route: &Route, ctx: &mut FilterContext) {
    for f in &route.filters {
        f.on_request(ctx).await;
        if ctx.served() || ctx.loopback_requested() {
            break;
        }
    }
}

/// 1. Shunt with status filter: `Path("/ok") -> status(204) -> <shunt>`.
#[tokio::test]
async fn shunt_with_status_filter_returns_configured_code_and_no_dial() {
    let status_filter = StatusFilterSpec.create(&[Value::Number(204.0)]).unwrap();
    let route = Arc::new(Route {
        id: "r".to_string(),
        predicates: Vec::new(),
        filters: vec![status_filter],
        backend: Backend::Shunt { final_response: true },
        host_regexps: Vec::new(),
        preserve_host: false,
    });

    let mut ctx = ctx(&route.id, "/ok", 9);
    run_request_filters(&route, &mut ctx).await;

    assert!(ctx.served(), "status filter must short-circuit via serve()");
    let response = ctx.response().unwrap();
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert!(response.body.is_empty());
}

/// 2. LB with one endpoint: two dispatches observe the endpoint's in-flight
/// counter at 1 during dispatch and 0 after.
#[tokio::test]
async fn load_balanced_single_endpoint_tracks_in_flight_around_dispatch() {
    let route = Arc::new(Route {
        id: "lb-route".to_string(),
        predicates: Vec::new(),
        filters: Vec::new(),
        backend: Backend::LoadBalanced { endpoints: vec!["10.0.0.1:80".to_string()], algorithm: Algorithm::RoundRobin },
        host_regexps: Vec::new(),
        preserve_host: false,
    });
    let Backend::LoadBalanced { endpoints, algorithm } = &route.backend else { unreachable!() };

    let balancers = BalancerRegistry::new();
    for _ in 0..2 {
        let balancer = balancers.get_or_create(&route.id, endpoints, algorithm).await;
        let endpoint = balancer.select(b"").expect("single endpoint always selectable");
        endpoint.begin_request();
        assert_eq!(endpoint.in_flight(), 1, "in-flight counter observed during dispatch");
        endpoint.end_request(true);
        assert_eq!(endpoint.in_flight(), 0, "in-flight counter observed after dispatch");
    }
}

/// 3. FIFO saturation: `fifo(2, 2, "3s")`. Four concurrent admits fill
/// active=2, pending=2; a fifth is rejected immediately, well within the
/// filter's own 3s timeout.
#[tokio::test]
async fn fifo_queue_saturates_then_rejects_a_fifth_admission() {
    let queue = Queue::new("scenario-3", QueuePolicy::Fifo, 2, 2);
    let timeout = Duration::from_secs(3);

    let mut permits = Vec::new();
    for _ in 0..2 {
        permits.push(queue.admit(timeout).await.expect("first two admit immediately"));
    }

    let pending_a = tokio::spawn({
        let queue = queue.clone();
        async move { queue.admit(timeout).await }
    });
    let pending_b = tokio::spawn({
        let queue = queue.clone();
        async move { queue.admit(timeout).await }
    });
    // Give the two pending admits a chance to enqueue before checking status.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    let status = queue.status();
    assert_eq!(status.active, 2);
    assert_eq!(status.pending, 2);

    let fifth = tokio::time::timeout(Duration::from_millis(200), queue.admit(timeout)).await;
    match fifth {
        Ok(Err(AdmitError::Full)) => {}
        other => panic!("fifth admission should be rejected as full well within its timeout, got {other:?}"),
    }

    // Draining the two held permits frees the queue for the two pending waiters.
    permits.clear();
    pending_a.await.unwrap().expect("first pending waiter eventually admitted");
    pending_b.await.unwrap().expect("second pending waiter eventually admitted");
}

/// 4. Loopback cap: `Path("/loop") -> setPath("/loop") -> <loopback>`
/// repeatedly re-enters the same route until the cap is exceeded, then
/// serves 500 with a "loop detected" body.
#[tokio::test]
async fn loopback_backend_past_its_cap_serves_500() {
    let loop_cap = 9u32;
    let predicates = core_predicates();
    let filters = core_filters();
    let (pre, post) = core_processors(Duration::from_secs(60));

    let route_def = RouteDef {
        id: "a".to_string(),
        path: Some("/loop".to_string()),
        predicates: Vec::new(),
        filters: vec![SpecRef { name: "setPath".to_string(), args: vec![Value::String("/loop".to_string())] }],
        backend: BackendDef::Loopback,
        preserve_host: false,
    };
    let client = Arc::new(InMemoryDataClient::new("mem", vec![route_def]));
    let engine = Engine::new(vec![client], pre, post, predicates, filters, Duration::from_secs(3600));
    engine.tick().await;

    let snapshot = engine.store().load();
    let (route, params) = snapshot.route_for(&request("/loop")).expect("route matches its own path");
    let mut route = route.clone();
    let mut filter_ctx = FilterContext::new(route.id.clone(), request("/loop"), params, Arc::new(NoopMetrics), 0, loop_cap);

    run_request_filters(&route, &mut filter_ctx).await;
    while !filter_ctx.served() && matches!(route.backend, Backend::Loopback) {
        filter_ctx.bump_loop_count();
        if filter_ctx.loop_cap_exceeded() {
            filter_ctx.serve(junction_core::context::ResponseParts::new(StatusCode::INTERNAL_SERVER_ERROR));
            break;
        }
        let facts = filter_ctx.request().clone();
        let (next_route, next_params) = snapshot.route_for(&facts).expect("loopback keeps matching /loop");
        route = next_route.clone();
        filter_ctx.reroute(route.id.clone(), next_params);
        run_request_filters(&route, &mut filter_ctx).await;
    }

    assert!(filter_ctx.served());
    assert_eq!(filter_ctx.response().unwrap().status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(filter_ctx.loop_count(), loop_cap + 1, "cap is exceeded by exactly one iteration");
}

/// 5. Response filter reverse order:
/// `setResponseHeader("A","1") -> setResponseHeader("B","2") -> "http://backend"`.
/// `on_response` runs in reverse declared order, i.e. B before A.
#[tokio::test]
async fn response_filters_observe_reverse_declared_order() {
    let a = SetResponseHeaderFilterSpec.create(&[Value::String("A".into()), Value::String("1".into())]).unwrap();
    let b = SetResponseHeaderFilterSpec.create(&[Value::String("B".into()), Value::String("2".into())]).unwrap();
    let route = Arc::new(Route {
        id: "r".to_string(),
        predicates: Vec::new(),
        filters: vec![a, b],
        backend: Backend::Network("http://backend".to_string()),
        host_regexps: Vec::new(),
        preserve_host: false,
    });

    let mut filter_ctx = ctx(&route.id, "/r", 9);
    filter_ctx.set_response(junction_core::context::ResponseParts::new(StatusCode::OK));

    for index in (0..route.filters.len()).rev() {
        route.filters[index].on_response(&mut filter_ctx).await;
    }

    let response = filter_ctx.response().unwrap();
    assert_eq!(response.headers.get("A").unwrap(), "1");
    assert_eq!(response.headers.get("B").unwrap(), "2");
}

/// 6. Breaker open -> half-open -> closed: consecutive-failure threshold 3,
/// reset_timeout 100ms, one half-open probe.
#[tokio::test]
async fn breaker_cycles_through_open_half_open_and_closed() {
    let cb = CircuitBreaker::new(
        "scenario-6",
        CircuitBreakerConfig {
            trip: Trip::ConsecutiveFailures { threshold: 3 },
            success_threshold: 1,
            reset_timeout: Duration::from_millis(100),
            half_open_max_probes: 1,
        },
    );

    assert!(cb.allow_request().await);
    cb.on_failure().await;
    cb.on_failure().await;
    assert_eq!(cb.state(), CircuitState::Closed, "below threshold, still closed");
    cb.on_failure().await;
    assert_eq!(cb.state(), CircuitState::Open, "third consecutive failure trips the breaker");

    // t < reset_timeout: still rejected, no dial attempted.
    assert!(!cb.allow_request().await);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(cb.allow_request().await, "one probe allowed past reset_timeout");
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    cb.on_success().await;
    assert_eq!(cb.state(), CircuitState::Closed, "success in half-open closes the breaker");

    // The consecutive-failure streak was reset by the close: one more
    // failure alone must not reopen it.
    cb.on_failure().await;
    assert_eq!(cb.state(), CircuitState::Closed);
}
