//! The request-visible state predicates are pure functions over: method,
//! path, host, headers, query, TLS flag, content-length.
//!
//! Predicates and the path tree never see the full `pingora_http::RequestHeader`
//! type directly; they go through this trait so that unit tests can supply a
//! plain struct instead of standing up a real session (mirrors how
//! `KeySourceContext` decouples `proxy/key_selector.rs` from
//! `pingora_http::RequestHeader`).

pub trait RequestFacts {
    fn method(&self) -> &str;
    fn path(&self) -> &str;
    fn host(&self) -> Option<&str>;
    fn header(&self, name: &str) -> Option<&str>;
    fn query(&self) -> Option<&str>;
    fn is_tls(&self) -> bool;
    fn content_length(&self) -> Option<u64>;
}

/// A plain, owned implementation used by tests and by the in-memory data
/// client fixtures; production call sites adapt a live `pingora_http::RequestHeader`.
#[derive(Debug, Clone, Default)]
pub struct OwnedRequestFacts {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub headers: Vec<(String, String)>,
    pub query: Option<String>,
    pub tls: bool,
    pub content_length: Option<u64>,
}

impl RequestFacts for OwnedRequestFacts {
    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    fn is_tls(&self) -> bool {
        self.tls
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }
}

impl OwnedRequestFacts {
    pub fn get(method: &str, path: &str) -> Self {
        Self { method: method.to_string(), path: path.to_string(), ..Default::default() }
    }
}
