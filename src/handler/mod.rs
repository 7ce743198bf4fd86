//! Handler signatures and the control signals they return.
//!
//! Routes, filters, error handlers and `not_found` handlers all share one
//! shape: a function of the per-request [`RequestContext`] returning a
//! [`Signal`] or a [`HandlerError`]. `halt` and `pass` are ordinary return
//! values, so the dispatch loop decides stop-or-continue with a `match`.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::context::RequestContext;
use crate::http::{Body, StatusCode};

/// Type-erased, shared handler.
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so the same closure can back
/// several routes (a `GET` route and its implicit `HEAD` twin) and be shared
/// across threads. Registration methods accept any matching closure.
pub type Handler = Arc<dyn Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static>;

/// A route condition; a route whose condition fails is skipped like a `pass`.
pub type Condition = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync + 'static>;

/// What every handler returns.
pub type HandlerResult = Result<Signal, HandlerError>;

/// The outcome of running a handler or filter.
///
/// # Examples
///
/// ```
/// use croon::handler::Signal;
/// use croon::http::StatusCode;
///
/// let done = Signal::body("hello");
/// let stop = Signal::halt_with(StatusCode::FORBIDDEN, "go away");
/// let skip = Signal::Pass;
/// let carry_on = Signal::next();
///
/// assert!(matches!(done, Signal::Normal(_)));
/// assert!(matches!(stop, Signal::Halt { status: Some(s), .. } if s == StatusCode::FORBIDDEN));
/// assert!(skip.is_pass());
/// assert!(!carry_on.is_halt());
/// ```
pub enum Signal {
    /// The handler produced a body; the status is whatever the context holds.
    Normal(Body),
    /// Finish the response now. Missing parts keep their current values.
    Halt {
        status: Option<StatusCode>,
        body: Option<Body>,
    },
    /// Not handling this request; try the next candidate route.
    Pass,
}

impl Signal {
    /// A normal result with `body`.
    pub fn body(body: impl Into<Body>) -> Self {
        Self::Normal(body.into())
    }

    /// Let the pipeline carry on. This is what a filter returns when it does
    /// not halt; the body a filter returns in a `Normal` is discarded.
    pub fn next() -> Self {
        Self::Normal(Body::empty())
    }

    /// Stop here, keeping the status and body already written to the context.
    pub fn done() -> Self {
        Self::Halt {
            status: None,
            body: None,
        }
    }

    /// Halt with `status`, keeping the current body.
    pub fn halt(status: impl Into<StatusCode>) -> Self {
        Self::Halt {
            status: Some(status.into()),
            body: None,
        }
    }

    /// Halt with `status` and `body`.
    pub fn halt_with(status: impl Into<StatusCode>, body: impl Into<Body>) -> Self {
        Self::Halt {
            status: Some(status.into()),
            body: Some(body.into()),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halt { .. })
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal(body) => f.debug_tuple("Normal").field(body).finish(),
            Self::Halt { status, body } => f
                .debug_struct("Halt")
                .field("status", status)
                .field("body", body)
                .finish(),
            Self::Pass => f.write_str("Pass"),
        }
    }
}

/// A failure raised by a handler or filter.
///
/// The `kind` selects which registered error handler renders the response;
/// the optional status replaces the default `500`.
///
/// # Examples
///
/// ```
/// use croon::handler::HandlerError;
/// use croon::http::StatusCode;
///
/// let err = HandlerError::new("RecordNotFound", "no user 42")
///     .with_status(StatusCode::NOT_FOUND);
/// assert_eq!(err.kind(), "RecordNotFound");
/// assert_eq!(err.status(), StatusCode::NOT_FOUND);
/// assert_eq!(err.to_string(), "RecordNotFound: no user 42");
/// ```
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    kind: String,
    message: String,
    status: Option<StatusCode>,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<StatusCode>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The response status this failure maps to; `500` unless overridden.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("JsonError", err.to_string()).with_status(StatusCode::BAD_REQUEST)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::new("IoError", err.to_string())
    }
}

/// Erase a closure into a shared [`Handler`].
pub(crate) fn boxed<F>(handler: F) -> Handler
where
    F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(handler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_500() {
        let err = HandlerError::new("Boom", "it broke");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "it broke");
    }

    #[test]
    fn json_errors_are_bad_requests() {
        let err: HandlerError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "JsonError");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn signal_predicates() {
        assert!(Signal::halt(StatusCode::NOT_FOUND).is_halt());
        assert!(Signal::done().is_halt());
        assert!(!Signal::body("x").is_halt());
        assert!(Signal::Pass.is_pass());
    }
}
