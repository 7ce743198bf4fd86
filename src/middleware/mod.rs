//! Stages: the boundary protocol between the pipeline and whatever hosts it.
//!
//! A stage turns an [`Environment`] into a [`Response`]. Stages compose by
//! wrapping: an outer stage may answer on its own, delegate to the stage it
//! wraps, or decorate the response it gets back.
//!
//! ## Core types
//!
//! - [`Stage`] — trait implemented by everything that can answer a request.
//!   Closures `Fn(Environment) -> Response` and [`Application`] are stages.
//! - [`Middleware`] — an application mounted in front of an optional
//!   downstream stage.
//! - [`Logger`] — logs method, path, status and duration of every request.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::app::Application;
use crate::http::{Environment, Response};

/// Anything that answers a request.
///
/// Implementations **must** be `Send + Sync`: the server shares one stage
/// across all connections and calls it from Tokio's blocking pool.
///
/// # Examples
///
/// ```
/// use croon::http::{Environment, Method, Response, StatusCode};
/// use croon::middleware::Stage;
///
/// let teapot = |_env: Environment| Response::new(StatusCode::from(418));
/// let response = Stage::call(&teapot, Environment::new(Method::Get, "/"));
/// assert_eq!(response.status().canonical_reason(), "I'm a teapot");
/// ```
pub trait Stage: Send + Sync {
    fn call(&self, env: Environment) -> Response;
}

impl<F> Stage for F
where
    F: Fn(Environment) -> Response + Send + Sync,
{
    fn call(&self, env: Environment) -> Response {
        self(env)
    }
}

impl Stage for Application {
    fn call(&self, env: Environment) -> Response {
        crate::dispatch::dispatch(self, env)
    }
}

/// An application mounted in a stage chain.
///
/// Requests for which the application has no candidate route (no route
/// matches both method and path) go to the downstream stage untouched: the
/// application's filters do not run and the downstream response is returned
/// as is. Every other request is dispatched by the application, including
/// ones where all candidates pass, which end in the application's own 404.
///
/// # Examples
///
/// ```
/// use croon::app::App;
/// use croon::handler::Signal;
/// use croon::http::{Environment, Method, Response, StatusCode};
/// use croon::middleware::{Middleware, Stage};
///
/// let mut api = App::new();
/// api.set("environment", "test");
/// api.get("/api/ping", |_| Ok(Signal::body("pong"))).unwrap();
///
/// let fallback = |_env: Environment| Response::new(StatusCode::OK).body("static");
/// let stage = Middleware::wrap(api.build(), fallback);
///
/// let ping = stage.call(Environment::new(Method::Get, "/api/ping"));
/// assert_eq!(ping.into_body().into_bytes(), "pong");
///
/// let other = stage.call(Environment::new(Method::Get, "/index.html"));
/// assert_eq!(other.into_body().into_bytes(), "static");
/// ```
pub struct Middleware {
    app: Application,
    downstream: Option<Arc<dyn Stage>>,
}

impl Middleware {
    /// A terminating stage: unmatched requests get the application's 404.
    pub fn new(app: Application) -> Self {
        Self {
            app,
            downstream: None,
        }
    }

    /// Mount `app` in front of `downstream`.
    pub fn wrap(app: Application, downstream: impl Stage + 'static) -> Self {
        Self {
            app,
            downstream: Some(Arc::new(downstream)),
        }
    }

    pub fn app(&self) -> &Application {
        &self.app
    }

    pub fn has_downstream(&self) -> bool {
        self.downstream.is_some()
    }
}

impl Stage for Middleware {
    fn call(&self, env: Environment) -> Response {
        if let Some(downstream) = &self.downstream {
            if !self.app.has_route(env.method(), env.path()) {
                debug!(
                    method = %env.method(),
                    path = env.path(),
                    "no candidate route; delegating downstream"
                );
                return downstream.call(env);
            }
        }
        self.app.call(env)
    }
}

/// Stage wrapper that logs each request's method, path, status and duration.
///
/// Emits a single `tracing::info!` record after the inner stage returns:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
///
/// `Logger` never answers on its own; it always delegates and returns the
/// inner response unchanged. The duration covers the inner stage only, not
/// the time a transport spends draining a streaming body.
///
/// # Examples
///
/// ```
/// use croon::http::{Environment, Method, Response, StatusCode};
/// use croon::middleware::{Logger, Stage};
///
/// let stage = Logger::new(|_env: Environment| Response::new(StatusCode::NO_CONTENT));
/// let response = stage.call(Environment::new(Method::Delete, "/items/1"));
/// assert_eq!(response.status(), StatusCode::NO_CONTENT);
/// ```
pub struct Logger<S> {
    inner: S,
}

impl<S: Stage> Logger<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Stage> Stage for Logger<S> {
    fn call(&self, env: Environment) -> Response {
        let start = Instant::now();
        let method = env.method().clone();
        let path = env.path().to_owned();

        let response = self.inner.call(env);

        let duration = start.elapsed();
        info!(
            method = %method,
            path = path.as_str(),
            status = response.status().as_u16(),
            ?duration,
            "{} {} - {} ({:?})",
            method,
            path,
            response.status(),
            duration
        );

        response
    }
}
