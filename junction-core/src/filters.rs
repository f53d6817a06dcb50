//! Reference filters: the small set of mechanical (not business) filters
//! the core ships so end-to-end scenarios have something concrete to
//! exercise. Header manipulation beyond this, redirects, authentication and
//! rate-limiting filters are left to whatever register them through
//! [`crate::filter::FilterSpec`].

use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderName, HeaderValue, StatusCode};

use crate::context::{FilterContext, ResponseParts};
use crate::error::ArgError;
use crate::filter::{Filter, FilterSpec};
use crate::value::{Args, NumericDurationUnit, Value};

/// `status(code)`: shorts the request straight to a response of `code` with
/// an empty body. A filter rather than a backend kind, since the status is
/// route-authored data rather than a dispatch strategy.
pub struct StatusFilter {
    status: StatusCode,
}

#[async_trait]
impl Filter for StatusFilter {
    async fn on_request(&self, ctx: &mut FilterContext) {
        ctx.serve(ResponseParts::new(self.status));
    }
}

pub struct StatusFilterSpec;

impl FilterSpec for StatusFilterSpec {
    fn name(&self) -> &'static str {
        "status"
    }

    fn create(&self, args: &[Value]) -> Result<Arc<dyn Filter>, ArgError> {
        let mut a = Args::new("status", args);
        let code = a.integer();
        a.no_more();
        a.finish()?;

        let code = code.unwrap_or(200);
        let status = u16::try_from(code)
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or(StatusCode::OK);
        Ok(Arc::new(StatusFilter { status }))
    }
}

/// `setPath(path)`: rewrites the request's path in place, ahead of loopback
/// re-entry or backend dispatch.
pub struct SetPathFilter {
    path: String,
}

#[async_trait]
impl Filter for SetPathFilter {
    async fn on_request(&self, ctx: &mut FilterContext) {
        let query = ctx.request().uri.query().map(|q| q.to_string());
        let path_and_query = match &query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        };

        let mut parts = ctx.request().uri.clone().into_parts();
        match path_and_query.parse() {
            Ok(p) => {
                parts.path_and_query = Some(p);
                match http::Uri::from_parts(parts) {
                    Ok(uri) => ctx.request_mut().uri = uri,
                    Err(e) => tracing::warn!(error = %e, "setPath: failed to reassemble uri"),
                }
            }
            Err(e) => tracing::warn!(error = %e, path = %self.path, "setPath: invalid path"),
        }
    }
}

pub struct SetPathFilterSpec;

impl FilterSpec for SetPathFilterSpec {
    fn name(&self) -> &'static str {
        "setPath"
    }

    fn create(&self, args: &[Value]) -> Result<Arc<dyn Filter>, ArgError> {
        let mut a = Args::new("setPath", args);
        let path = a.string();
        a.no_more();
        a.finish()?;
        Ok(Arc::new(SetPathFilter { path: path.unwrap() }))
    }
}

/// `setResponseHeader(name, value)`: inserts or replaces a response header.
/// Runs in `on_response`, so reverse-declared-order invocation is purely a
/// property of the filter chain, not of this filter's own logic.
pub struct SetResponseHeaderFilter {
    name: HeaderName,
    value: HeaderValue,
}

#[async_trait]
impl Filter for SetResponseHeaderFilter {
    async fn on_response(&self, ctx: &mut FilterContext) {
        if let Some(response) = ctx.response_mut() {
            response.headers.insert(self.name.clone(), self.value.clone());
        }
    }
}

pub struct SetResponseHeaderFilterSpec;

impl FilterSpec for SetResponseHeaderFilterSpec {
    fn name(&self) -> &'static str {
        "setResponseHeader"
    }

    fn create(&self, args: &[Value]) -> Result<Arc<dyn Filter>, ArgError> {
        let mut a = Args::new("setResponseHeader", args);
        let name = a.string();
        let value = a.string();
        a.no_more();
        a.finish()?;

        let mut errors = ArgError::new("setResponseHeader");
        let name = name.as_deref().and_then(|n| {
            HeaderName::try_from(n)
                .map_err(|e| errors.push(0, format!("invalid header name '{n}': {e}")))
                .ok()
        });
        let value = value.as_deref().and_then(|v| {
            HeaderValue::try_from(v)
                .map_err(|e| errors.push(1, format!("invalid header value '{v}': {e}")))
                .ok()
        });
        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Arc::new(SetResponseHeaderFilter { name: name.unwrap(), value: value.unwrap() }))
    }
}

/// `timeout(backend_ms, read_ms, write_ms)`: populates the well-known
/// state-bag timeout keys, so routes can override the proxy transport's
/// defaults per request. A zero value means "leave the transport's default
/// in place" for that leg.
pub struct TimeoutFilter {
    backend: Option<std::time::Duration>,
    read: Option<std::time::Duration>,
    write: Option<std::time::Duration>,
}

#[async_trait]
impl Filter for TimeoutFilter {
    async fn on_request(&self, ctx: &mut FilterContext) {
        if let Some(d) = self.backend {
            ctx.state_set(crate::context::state_keys::BACKEND_TIMEOUT, d);
        }
        if let Some(d) = self.read {
            ctx.state_set(crate::context::state_keys::READ_TIMEOUT, d);
        }
        if let Some(d) = self.write {
            ctx.state_set(crate::context::state_keys::WRITE_TIMEOUT, d);
        }
    }
}

pub struct TimeoutFilterSpec;

impl FilterSpec for TimeoutFilterSpec {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn create(&self, args: &[Value]) -> Result<Arc<dyn Filter>, ArgError> {
        let mut a = Args::new("timeout", args);
        let backend = a.duration(NumericDurationUnit::Millis);
        let read = a.duration(NumericDurationUnit::Millis);
        let write = a.duration(NumericDurationUnit::Millis);
        a.no_more();
        a.finish()?;

        let nonzero = |d: Option<std::time::Duration>| d.filter(|d| !d.is_zero());
        Ok(Arc::new(TimeoutFilter { backend: nonzero(backend), read: nonzero(read), write: nonzero(write) }))
    }
}

/// Registers every reference filter spec this module ships into `registry`.
pub fn register_all(registry: &mut crate::filter::FilterRegistry) {
    registry.register(Arc::new(StatusFilterSpec));
    registry.register(Arc::new(SetPathFilterSpec));
    registry.register(Arc::new(SetResponseHeaderFilterSpec));
    registry.register(Arc::new(TimeoutFilterSpec));
    registry.register(Arc::new(crate::scheduler::FifoFilterSpec));
    registry.register(Arc::new(crate::scheduler::LifoFilterSpec));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_facts::OwnedRequestFacts;
    use http::{HeaderMap, Method};
    use std::collections::HashMap;

    fn ctx(path: &str) -> FilterContext {
        let req = crate::context::RequestParts {
            method: Method::GET,
            uri: path.parse().unwrap(),
            headers: HeaderMap::new(),
        };
        FilterContext::new("r".into(), req, HashMap::new(), Arc::new(crate::metrics::NoopMetrics), 0, 9)
    }

    #[tokio::test]
    async fn status_filter_serves_configured_code() {
        let f = StatusFilterSpec.create(&[Value::Number(204.0)]).unwrap();
        let mut c = ctx("/ok");
        f.on_request(&mut c).await;
        assert!(c.served());
        assert_eq!(c.response().unwrap().status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn set_path_rewrites_uri_preserving_query() {
        let f = SetPathFilterSpec.create(&[Value::String("/new".into())]).unwrap();
        let mut c = ctx("/old?x=1");
        f.on_request(&mut c).await;
        assert_eq!(c.request().uri.path(), "/new");
        assert_eq!(c.request().uri.query(), Some("x=1"));
    }

    #[tokio::test]
    async fn set_response_header_inserts_into_response() {
        let f = SetResponseHeaderFilterSpec
            .create(&[Value::String("X-A".into()), Value::String("1".into())])
            .unwrap();
        let mut c = ctx("/ok");
        c.set_response(ResponseParts::new(StatusCode::OK));
        f.on_response(&mut c).await;
        assert_eq!(c.response().unwrap().headers.get("X-A").unwrap(), "1");
    }

    #[tokio::test]
    async fn response_filters_run_in_reverse_and_both_headers_land() {
        let a = SetResponseHeaderFilterSpec
            .create(&[Value::String("A".into()), Value::String("1".into())])
            .unwrap();
        let b = SetResponseHeaderFilterSpec
            .create(&[Value::String("B".into()), Value::String("2".into())])
            .unwrap();
        let mut c = ctx("/r");
        c.set_response(ResponseParts::new(StatusCode::OK));
        // Proxy transport runs on_response in reverse declared order.
        b.on_response(&mut c).await;
        a.on_response(&mut c).await;
        assert_eq!(c.response().unwrap().headers.get("A").unwrap(), "1");
        assert_eq!(c.response().unwrap().headers.get("B").unwrap(), "2");
    }

    #[test]
    fn set_response_header_rejects_invalid_header_name() {
        let err = SetResponseHeaderFilterSpec
            .create(&[Value::String("bad header".into()), Value::String("v".into())])
            .unwrap_err();
        assert_eq!(err.problems.len(), 1);
    }

    #[tokio::test]
    async fn timeout_filter_sets_only_nonzero_legs() {
        let f = TimeoutFilterSpec
            .create(&[Value::Number(100.0), Value::Number(0.0), Value::Number(50.0)])
            .unwrap();
        let mut c = ctx("/ok");
        f.on_request(&mut c).await;
        assert_eq!(c.backend_timeout(), Some(std::time::Duration::from_millis(100)));
        assert!(c.state_get::<std::time::Duration>(crate::context::state_keys::READ_TIMEOUT).is_none());
        assert_eq!(
            c.state_get::<std::time::Duration>(crate::context::state_keys::WRITE_TIMEOUT).copied(),
            Some(std::time::Duration::from_millis(50))
        );
    }
}
