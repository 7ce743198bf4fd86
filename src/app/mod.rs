//! Application definitions: the registration surface and the frozen graph
//! the dispatcher walks.
//!
//! An [`App`] is mutable while routes, filters, settings and error handlers
//! are being registered. [`App::build`] freezes it into an [`Application`],
//! a cheap-to-clone handle that can be shared across threads and used as a
//! parent for further definitions with [`App::extend`].
//!
//! Lookups follow the lineage: routes and error handlers are searched in the
//! child first, filters run root first, and settings are resolved root first
//! with later definitions overriding earlier ones.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::context::{Params, RequestContext};
use crate::handler::{self, Condition, Handler, HandlerResult};
use crate::http::{Environment, Method, Response, StatusCode};
use crate::pattern::{MatchOptions, PatternError, PatternSpec};
use crate::router::{Filter, FilterKind, Guard, Route, RouteId, RouteTable};
use crate::settings::{Configure, Settings, SettingsStore};

#[derive(Default)]
struct ErrorHandlers {
    by_kind: HashMap<String, Handler>,
    by_status: HashMap<StatusCode, Handler>,
    any: Option<Handler>,
}

impl fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandlers")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .field("statuses", &self.by_status.keys().collect::<Vec<_>>())
            .field("any", &self.any.is_some())
            .finish()
    }
}

/// One node of the definition graph.
#[derive(Debug)]
struct Definition {
    parent: Option<Application>,
    table: RouteTable,
    settings: SettingsStore,
    errors: ErrorHandlers,
}

/// A mutable application definition.
///
/// # Examples
///
/// ```
/// use croon::app::App;
/// use croon::handler::Signal;
/// use croon::http::{Environment, Method};
///
/// let mut app = App::new();
/// app.set("environment", "test");
/// app.get("/hello/:name", |ctx| {
///     let name = ctx.param("name").unwrap_or("world").to_owned();
///     Ok(Signal::body(format!("Hello, {name}!")))
/// })
/// .unwrap();
///
/// let app = app.build();
/// let response = app.call(Environment::new(Method::Get, "/hello/ferris"));
/// assert_eq!(response.status(), 200);
/// assert_eq!(response.into_body().into_bytes(), "Hello, ferris!");
/// ```
#[derive(Debug, Default)]
pub struct App {
    definition: Definition,
}

impl Default for Definition {
    fn default() -> Self {
        Self {
            parent: None,
            table: RouteTable::new(),
            settings: SettingsStore::new(),
            errors: ErrorHandlers::default(),
        }
    }
}

impl App {
    /// A new root definition.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new definition inheriting from `parent`.
    ///
    /// The child sees every route, filter, setting and error handler of the
    /// parent, and anything it registers itself takes precedence. The parent
    /// is not affected.
    pub fn extend(parent: &Application) -> Self {
        Self {
            definition: Definition {
                parent: Some(parent.clone()),
                ..Definition::default()
            },
        }
    }

    // ── routes ────────────────────────────────────────────────────────────────

    /// Register `handler` for `method` requests matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns the [`PatternError`] when `pattern` does not compile; nothing
    /// is registered in that case.
    pub fn route<F>(
        &mut self,
        method: Method,
        pattern: impl Into<PatternSpec>,
        handler: F,
    ) -> Result<RouteId, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.route_when(method, pattern, Vec::new(), handler)
    }

    /// Like [`route`](Self::route), but the route is only considered when
    /// every condition accepts the request.
    pub fn route_when<F>(
        &mut self,
        method: Method,
        pattern: impl Into<PatternSpec>,
        conditions: Vec<Condition>,
        handler: F,
    ) -> Result<RouteId, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(method, pattern.into(), conditions, handler::boxed(handler))
    }

    /// Register a `GET` route. A `HEAD` route sharing the handler is added
    /// right after it; its response body is dropped at finalization.
    pub fn get<F>(&mut self, pattern: impl Into<PatternSpec>, handler: F) -> Result<RouteId, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        let spec = pattern.into();
        let handler = handler::boxed(handler);
        let id = self.register(Method::Get, spec.clone(), Vec::new(), Arc::clone(&handler))?;
        self.register(Method::Head, spec, Vec::new(), handler)?;
        Ok(id)
    }

    pub fn post<F>(&mut self, pattern: impl Into<PatternSpec>, handler: F) -> Result<RouteId, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.route(Method::Post, pattern, handler)
    }

    pub fn put<F>(&mut self, pattern: impl Into<PatternSpec>, handler: F) -> Result<RouteId, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.route(Method::Put, pattern, handler)
    }

    pub fn patch<F>(&mut self, pattern: impl Into<PatternSpec>, handler: F) -> Result<RouteId, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.route(Method::Patch, pattern, handler)
    }

    pub fn delete<F>(&mut self, pattern: impl Into<PatternSpec>, handler: F) -> Result<RouteId, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.route(Method::Delete, pattern, handler)
    }

    pub fn options<F>(&mut self, pattern: impl Into<PatternSpec>, handler: F) -> Result<RouteId, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.route(Method::Options, pattern, handler)
    }

    pub fn head<F>(&mut self, pattern: impl Into<PatternSpec>, handler: F) -> Result<RouteId, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.route(Method::Head, pattern, handler)
    }

    fn register(
        &mut self,
        method: Method,
        spec: PatternSpec,
        conditions: Vec<Condition>,
        handler: Handler,
    ) -> Result<RouteId, PatternError> {
        self.definition
            .table
            .register(method, spec, handler, conditions)
    }

    // ── filters ───────────────────────────────────────────────────────────────

    /// Run `handler` before the route loop of every request.
    pub fn before<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.filter(FilterKind::Before, Guard::any(), handler)
    }

    /// Run `handler` after the route loop of every request.
    pub fn after<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.filter(FilterKind::After, Guard::any(), handler)
    }

    /// Run `handler` before the route loop of requests whose path matches
    /// `pattern`. The pattern's captures are visible only to the filter.
    pub fn before_at<F>(
        &mut self,
        pattern: impl Into<PatternSpec>,
        handler: F,
    ) -> Result<&mut Self, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        let guard = Guard::path(pattern)?;
        Ok(self.filter(FilterKind::Before, guard, handler))
    }

    /// The `after` counterpart of [`before_at`](Self::before_at).
    pub fn after_at<F>(
        &mut self,
        pattern: impl Into<PatternSpec>,
        handler: F,
    ) -> Result<&mut Self, PatternError>
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        let guard = Guard::path(pattern)?;
        Ok(self.filter(FilterKind::After, guard, handler))
    }

    /// Register a filter with an arbitrary guard.
    pub fn filter<F>(&mut self, kind: FilterKind, guard: Guard, handler: F) -> &mut Self
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.definition
            .table
            .add_filter(kind, guard, handler::boxed(handler));
        self
    }

    // ── settings ──────────────────────────────────────────────────────────────

    /// Set `key` for every environment.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.definition.settings.set(key, value);
        self
    }

    /// Record settings that only apply in `environments` (all when empty).
    pub fn configure<F>(&mut self, environments: &[&str], block: F) -> &mut Self
    where
        F: FnOnce(&mut Configure),
    {
        self.definition.settings.configure(environments, block);
        self
    }

    /// Settings as they resolve right now, including everything inherited.
    pub fn settings(&self) -> Arc<Settings> {
        let mut ancestors: Vec<&SettingsStore> = match &self.definition.parent {
            Some(parent) => parent.lineage().map(|d| &d.settings).collect(),
            None => Vec::new(),
        };
        ancestors.reverse();
        self.definition.settings.resolve(&ancestors)
    }

    // ── error handlers ────────────────────────────────────────────────────────

    /// Handle failures whose [`kind`](crate::handler::HandlerError::kind) is `kind`.
    pub fn error<F>(&mut self, kind: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.definition
            .errors
            .by_kind
            .insert(kind.into(), handler::boxed(handler));
        self
    }

    /// Handle failures no kind-specific handler claimed.
    pub fn error_any<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.definition.errors.any = Some(handler::boxed(handler));
        self
    }

    /// Render responses that end with `status`.
    pub fn error_status<F>(&mut self, status: impl Into<StatusCode>, handler: F) -> &mut Self
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.definition
            .errors
            .by_status
            .insert(status.into(), handler::boxed(handler));
        self
    }

    /// Render requests no route handled; shorthand for a `404` status handler.
    pub fn not_found<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.error_status(StatusCode::NOT_FOUND, handler)
    }

    /// Freeze the definition.
    pub fn build(self) -> Application {
        Application {
            inner: Arc::new(self.definition),
        }
    }
}

/// A frozen application definition.
///
/// Cloning is cheap; every clone refers to the same definition. An
/// `Application` is `Send + Sync` and can serve many requests at once.
#[derive(Clone)]
pub struct Application {
    inner: Arc<Definition>,
}

impl Application {
    /// The definition this one extends, if any.
    pub fn parent(&self) -> Option<&Application> {
        self.inner.parent.as_ref()
    }

    /// Resolved settings. Resolved once, then cached.
    pub fn settings(&self) -> Arc<Settings> {
        let mut ancestors: Vec<&SettingsStore> =
            self.lineage().skip(1).map(|d| &d.settings).collect();
        ancestors.reverse();
        self.inner.settings.resolve(&ancestors)
    }

    // Child first, root last.
    fn lineage(&self) -> impl Iterator<Item = &Definition> {
        std::iter::successors(Some(&*self.inner), |definition| {
            definition.parent.as_ref().map(|parent| &*parent.inner)
        })
    }

    /// Candidate routes for a request, own routes before inherited ones,
    /// each in registration order.
    pub fn routes<'a>(
        &'a self,
        method: &'a Method,
        path: &'a str,
        options: MatchOptions,
    ) -> impl Iterator<Item = (&'a Route, Params)> + 'a {
        self.lineage()
            .flat_map(move |definition| definition.table.matches(method, path, options))
    }

    /// `true` when at least one route matches `method` and `path`.
    pub fn has_route(&self, method: &Method, path: &str) -> bool {
        let options = self.settings().match_options();
        self.routes(method, path, options).next().is_some()
    }

    /// Filters of `kind` accepting the request, inherited ones first.
    pub fn filters<'a>(
        &'a self,
        kind: FilterKind,
        method: &'a Method,
        path: &'a str,
        options: MatchOptions,
    ) -> impl Iterator<Item = (&'a Filter, Params)> + 'a {
        let mut lineage: Vec<&Definition> = self.lineage().collect();
        lineage.reverse();
        lineage
            .into_iter()
            .flat_map(move |definition| definition.table.filters(kind, method, path, options))
    }

    /// The nearest handler registered for failures of `kind`.
    pub fn error_handler(&self, kind: &str) -> Option<&Handler> {
        self.lineage()
            .find_map(|definition| definition.errors.by_kind.get(kind))
    }

    /// The nearest catch-all failure handler.
    pub fn any_error_handler(&self) -> Option<&Handler> {
        self.lineage()
            .find_map(|definition| definition.errors.any.as_ref())
    }

    /// The nearest handler registered for `status`.
    pub fn status_handler(&self, status: StatusCode) -> Option<&Handler> {
        self.lineage()
            .find_map(|definition| definition.errors.by_status.get(&status))
    }

    /// Dispatch one request.
    pub fn call(&self, env: Environment) -> Response {
        crate::dispatch::dispatch(self, env)
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("routes", &self.inner.table.len())
            .field("filters", &self.inner.table.filter_count())
            .field("parent", &self.inner.parent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Signal;

    fn ok(_ctx: &mut RequestContext) -> HandlerResult {
        Ok(Signal::body("ok"))
    }

    #[test]
    fn get_registers_head_twin() {
        let mut app = App::new();
        app.get("/", ok).unwrap();
        let app = app.build();
        assert!(app.has_route(&Method::Get, "/"));
        assert!(app.has_route(&Method::Head, "/"));
        assert!(!app.has_route(&Method::Post, "/"));
    }

    #[test]
    fn bad_pattern_registers_nothing() {
        let mut app = App::new();
        assert!(app.route(Method::Get, PatternSpec::regex("(unclosed"), ok).is_err());
        assert!(app.get("/:bad-name", ok).is_err());
        let app = app.build();
        assert!(!app.has_route(&Method::Get, "/anything"));
    }

    #[test]
    fn child_routes_come_first() {
        let mut parent = App::new();
        parent.get("/shared", ok).unwrap();
        parent.get("/parent-only", ok).unwrap();
        let parent = parent.build();

        let mut child = App::extend(&parent);
        child.get("/shared", ok).unwrap();
        let child = child.build();

        let options = MatchOptions::default();
        let ids: Vec<_> = child
            .routes(&Method::Get, "/shared", options)
            .map(|(route, _)| route.id().index())
            .collect();
        // child's own route (index 0) then the parent's (index 0 in its table)
        assert_eq!(ids.len(), 2);
        assert!(child.has_route(&Method::Get, "/parent-only"));
        assert_eq!(parent.routes(&Method::Get, "/shared", options).count(), 1);
    }

    #[test]
    fn filters_run_root_first() {
        let mut parent = App::new();
        parent.before(|ctx| {
            ctx.write("parent;");
            Ok(Signal::next())
        });
        let parent = parent.build();

        let mut child = App::extend(&parent);
        child.before(|ctx| {
            ctx.write("child;");
            Ok(Signal::next())
        });
        let child = child.build();

        let settings = Arc::new(Settings::default());
        let mut ctx =
            RequestContext::new(Environment::new(Method::Get, "/"), settings);
        for (filter, _) in child.filters(FilterKind::Before, &Method::Get, "/", MatchOptions::default()) {
            (filter.handler())(&mut ctx).unwrap();
        }
        assert_eq!(ctx.take_body().into_bytes(), "parent;child;");
    }

    #[test]
    fn settings_inherit_and_override() {
        let mut parent = App::new();
        parent.set("environment", "test").set("title", "parent").set("per_page", 10);
        let parent = parent.build();

        let mut child = App::extend(&parent);
        child.set("title", "child");
        assert_eq!(child.settings().string("title"), Some("child"));
        let child = child.build();

        let settings = child.settings();
        assert_eq!(settings.string("title"), Some("child"));
        assert_eq!(settings.get("per_page"), Some(&Value::from(10)));
        assert_eq!(settings.environment(), "test");
        assert_eq!(parent.settings().string("title"), Some("parent"));
    }

    #[test]
    fn error_handlers_resolve_child_first() {
        let mut parent = App::new();
        parent.error("Boom", ok).error_any(ok).not_found(ok);
        let parent = parent.build();

        let mut child = App::extend(&parent);
        child.error("Boom", ok);
        let child = child.build();

        let own = child.error_handler("Boom").unwrap();
        let inherited = parent.error_handler("Boom").unwrap();
        assert!(!Arc::ptr_eq(own, inherited));
        assert!(child.any_error_handler().is_some());
        assert!(child.status_handler(StatusCode::NOT_FOUND).is_some());
        assert!(child.status_handler(StatusCode::INTERNAL_SERVER_ERROR).is_none());
        assert!(child.error_handler("Other").is_none());
    }

    #[test]
    fn application_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Application>();
    }
}
