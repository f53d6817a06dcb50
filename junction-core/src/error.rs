//! Error taxonomy surfaced at the proxy boundary.

use std::fmt;

use thiserror::Error;

/// Every failure mode the engine and proxy transport can produce. Each kind
/// maps to a client-visible status via [`ProxyError::status`].
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no route matched the request")]
    RouteMiss,

    #[error("filter argument error: {0}")]
    FilterArgument(#[from] ArgError),

    #[error("filter '{route_id}'/{filter_index} panicked")]
    FilterPanic { route_id: String, filter_index: usize },

    #[error("dial failure to backend: {0}")]
    BackendDial(String),

    #[error("backend timeout after {0:?}")]
    BackendTimeout(std::time::Duration),

    #[error("queue is full")]
    QueueFull { retry_after: std::time::Duration },

    #[error("circuit breaker is open")]
    BreakerOpen,

    #[error("rate limit exceeded")]
    RateLimitReject { retry_after: std::time::Duration },

    #[error("loopback cap exceeded")]
    LoopDetected,

    #[error("client disconnected")]
    ClientGone,
}

impl ProxyError {
    /// HTTP status this error maps to when written to the client.
    /// `ClientGone` has no mapping: nothing is written.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProxyError::RouteMiss => Some(404),
            ProxyError::FilterArgument(_) => None, // route dropped at compile time
            ProxyError::FilterPanic { .. } => Some(500),
            ProxyError::BackendDial(_) => Some(502),
            ProxyError::BackendTimeout(_) => Some(504),
            ProxyError::QueueFull { .. } => Some(503),
            ProxyError::BreakerOpen => Some(503),
            ProxyError::RateLimitReject { .. } => Some(429),
            ProxyError::LoopDetected => Some(500),
            ProxyError::ClientGone => None,
        }
    }

    /// A stable, low-cardinality label used to increment a metrics counter
    /// per kind and per route id.
    pub fn metric_kind(&self) -> &'static str {
        match self {
            ProxyError::RouteMiss => "route-miss",
            ProxyError::FilterArgument(_) => "filter-argument",
            ProxyError::FilterPanic { .. } => "filter-panic",
            ProxyError::BackendDial(_) => "backend-dial",
            ProxyError::BackendTimeout(_) => "backend-timeout",
            ProxyError::QueueFull { .. } => "queue-full",
            ProxyError::BreakerOpen => "breaker-open",
            ProxyError::RateLimitReject { .. } => "ratelimit-reject",
            ProxyError::LoopDetected => "loop-detected",
            ProxyError::ClientGone => "client-gone",
        }
    }
}

/// Accumulated argument-coercion failure: every offending position is
/// recorded rather than failing on the first mismatch.
#[derive(Debug, Error)]
pub struct ArgError {
    pub spec_name: String,
    pub problems: Vec<ArgProblem>,
}

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}': ", self.spec_name)?;
        for (i, p) in self.problems.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{p}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ArgProblem {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for ArgProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "argument {}: {}", self.position, self.message)
    }
}

impl ArgError {
    pub fn new(spec_name: impl Into<String>) -> Self {
        Self { spec_name: spec_name.into(), problems: Vec::new() }
    }

    pub fn push(&mut self, position: usize, message: impl Into<String>) {
        self.problems.push(ArgProblem { position, message: message.into() });
    }

    pub fn too_few(spec_name: impl Into<String>, expected: usize) -> Self {
        let mut e = Self::new(spec_name);
        e.push(0, format!("expects {expected} arguments"));
        e
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }
}
