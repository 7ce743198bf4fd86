//! The route table — registered routes and before/after filters.
//!
//! Routes are kept in registration order and never reordered: the order is
//! the match priority. [`RouteTable::matches`] is lazy, so the dispatch loop
//! only evaluates patterns up to the first route whose handler accepts the
//! request.
//!
//! Filters live in the same table but are looked up separately with
//! [`RouteTable::filters`]: they ignore the routing method and apply only
//! their own [`Guard`].

use std::fmt;

pub mod conditions;

use crate::context::{Params, RequestContext};
use crate::handler::{Condition, Handler};
use crate::http::Method;
use crate::pattern::{MatchOptions, Pattern, PatternError, PatternSpec};

/// Position of a route in its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(usize);

impl RouteId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A single registered route binding a method + pattern to a handler.
pub struct Route {
    id: RouteId,
    method: Method,
    pattern: Pattern,
    handler: Handler,
    conditions: Vec<Condition>,
}

impl Route {
    pub fn id(&self) -> RouteId {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// `true` when every condition accepts the request.
    pub fn conditions_hold(&self, ctx: &RequestContext) -> bool {
        self.conditions.iter().all(|condition| condition(ctx))
    }

    // Returns `Some(params)` when both the HTTP method and path pattern match.
    fn matches(&self, method: &Method, path: &str, options: MatchOptions) -> Option<Params> {
        if &self.method == method {
            self.pattern.matches(path, options)
        } else {
            None
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("conditions", &self.conditions.len())
            .finish()
    }
}

/// Which side of the route loop a filter runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Before,
    After,
}

/// Restricts a filter to some paths and/or methods. The default guard
/// accepts every request.
///
/// # Examples
///
/// ```
/// use croon::http::Method;
/// use croon::pattern::MatchOptions;
/// use croon::router::Guard;
///
/// let guard = Guard::path("/admin/*").unwrap().method(Method::Post);
/// let opts = MatchOptions::default();
/// assert!(guard.matches(&Method::Post, "/admin/users", opts).is_some());
/// assert!(guard.matches(&Method::Get, "/admin/users", opts).is_none());
/// assert!(guard.matches(&Method::Post, "/public", opts).is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Guard {
    pattern: Option<Pattern>,
    methods: Vec<Method>,
}

impl Guard {
    /// A guard that accepts every request.
    pub fn any() -> Self {
        Self::default()
    }

    /// A guard that accepts paths matching `spec`.
    pub fn path(spec: impl Into<PatternSpec>) -> Result<Self, PatternError> {
        Ok(Self {
            pattern: Some(Pattern::compile(spec)?),
            methods: Vec::new(),
        })
    }

    /// Also require one of the added methods.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    /// Captured params when the guard accepts, `None` otherwise.
    pub fn matches(&self, method: &Method, path: &str, options: MatchOptions) -> Option<Params> {
        if !self.methods.is_empty() && !self.methods.contains(method) {
            return None;
        }
        match &self.pattern {
            Some(pattern) => pattern.matches(path, options),
            None => Some(Params::new()),
        }
    }
}

/// A before or after hook.
pub struct Filter {
    kind: FilterKind,
    guard: Guard,
    handler: Handler,
}

impl Filter {
    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("kind", &self.kind)
            .field("guard", &self.guard)
            .finish()
    }
}

/// Ordered routes and filters of one application definition.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    filters: Vec<Filter>,
}

impl RouteTable {
    /// Create a new, empty table.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use croon::router::RouteTable;
    ///
    /// let table = RouteTable::new();
    /// assert!(table.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `spec` and append a route.
    ///
    /// # Errors
    ///
    /// Returns the [`PatternError`] from compilation; the table is left
    /// unchanged.
    pub fn register(
        &mut self,
        method: Method,
        spec: impl Into<PatternSpec>,
        handler: Handler,
        conditions: Vec<Condition>,
    ) -> Result<RouteId, PatternError> {
        let pattern = Pattern::compile(spec)?;
        let id = RouteId(self.routes.len());
        self.routes.push(Route {
            id,
            method,
            pattern,
            handler,
            conditions,
        });
        Ok(id)
    }

    /// Append a filter.
    pub fn add_filter(&mut self, kind: FilterKind, guard: Guard, handler: Handler) {
        self.filters.push(Filter {
            kind,
            guard,
            handler,
        });
    }

    /// Candidate routes for `method` + `path`, in registration order.
    ///
    /// The iterator is lazy: patterns after the point where the caller stops
    /// are never evaluated.
    pub fn matches<'a>(
        &'a self,
        method: &'a Method,
        path: &'a str,
        options: MatchOptions,
    ) -> impl Iterator<Item = (&'a Route, Params)> + 'a {
        self.routes
            .iter()
            .filter_map(move |route| route.matches(method, path, options).map(|params| (route, params)))
    }

    /// Every route registered for `method`, in registration order.
    pub fn routes_for<'a>(&'a self, method: &'a Method) -> impl Iterator<Item = &'a Route> + 'a {
        self.routes.iter().filter(move |route| &route.method == method)
    }

    /// Filters of `kind` whose guard accepts the request, in registration order.
    pub fn filters<'a>(
        &'a self,
        kind: FilterKind,
        method: &'a Method,
        path: &'a str,
        options: MatchOptions,
    ) -> impl Iterator<Item = (&'a Filter, Params)> + 'a {
        self.filters
            .iter()
            .filter(move |filter| filter.kind == kind)
            .filter_map(move |filter| {
                filter
                    .guard
                    .matches(method, path, options)
                    .map(|params| (filter, params))
            })
    }

    pub fn route(&self, id: RouteId) -> Option<&Route> {
        self.routes.get(id.0)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Number of registered routes (filters are not counted).
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::handler::{Signal, boxed};
    use crate::http::Environment;

    fn noop() -> Handler {
        boxed(|_ctx| Ok(Signal::body("")))
    }

    fn opts() -> MatchOptions {
        MatchOptions::default()
    }

    #[test]
    fn table_starts_empty() {
        let table = RouteTable::default();
        assert!(table.is_empty());
        assert_eq!(table.len(), 0);
        assert_eq!(table.filter_count(), 0);
    }

    #[test]
    fn register_assigns_sequential_ids() {
        let mut table = RouteTable::new();
        let a = table.register(Method::Get, "/a", noop(), vec![]).unwrap();
        let b = table.register(Method::Post, "/b", noop(), vec![]).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(table.route(b).unwrap().pattern().source(), "/b");
    }

    #[test]
    fn bad_pattern_is_not_added() {
        let mut table = RouteTable::new();
        let err = table.register(Method::Get, "/:id/:id", noop(), vec![]);
        assert!(err.is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn matches_in_registration_order() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/users/:id", noop(), vec![]).unwrap();
        table.register(Method::Get, "/users/*", noop(), vec![]).unwrap();
        table.register(Method::Get, "/users/me", noop(), vec![]).unwrap();

        let hits: Vec<_> = table
            .matches(&Method::Get, "/users/me", opts())
            .map(|(route, _)| route.id().index())
            .collect();
        assert_eq!(hits, vec![0, 1, 2]);
    }

    #[test]
    fn method_must_match() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/hello", noop(), vec![]).unwrap();
        assert_eq!(table.matches(&Method::Post, "/hello", opts()).count(), 0);
        assert_eq!(table.matches(&Method::Get, "/hello", opts()).count(), 1);
    }

    #[test]
    fn matches_carry_captures() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/users/:id", noop(), vec![]).unwrap();
        let (_, params) = table.matches(&Method::Get, "/users/42", opts()).next().unwrap();
        assert_eq!(params.get("id"), Some("42"));
    }

    #[test]
    fn matching_stops_at_first_accepted_candidate() {
        let checks = Arc::new(AtomicUsize::new(0));
        let mut table = RouteTable::new();
        for _ in 0..3 {
            let counter = Arc::clone(&checks);
            let condition: Condition = Arc::new(move |_ctx: &RequestContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            });
            table
                .register(Method::Get, "/x", noop(), vec![condition])
                .unwrap();
        }

        let ctx = RequestContext::new(Environment::new(Method::Get, "/x"), Default::default());
        let accepted = table
            .matches(&Method::Get, "/x", opts())
            .find(|(route, _)| route.conditions_hold(&ctx));
        assert_eq!(accepted.map(|(route, _)| route.id().index()), Some(0));
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn routes_for_method() {
        let mut table = RouteTable::new();
        table.register(Method::Get, "/a", noop(), vec![]).unwrap();
        table.register(Method::Put, "/a", noop(), vec![]).unwrap();
        table.register(Method::Get, "/b", noop(), vec![]).unwrap();
        let sources: Vec<_> = table
            .routes_for(&Method::Get)
            .map(|route| route.pattern().source().to_owned())
            .collect();
        assert_eq!(sources, vec!["/a", "/b"]);
    }

    #[test]
    fn filters_ignore_routing_method_but_honour_guard() {
        let mut table = RouteTable::new();
        table.add_filter(FilterKind::Before, Guard::any(), noop());
        table.add_filter(FilterKind::Before, Guard::path("/admin/*").unwrap(), noop());
        table.add_filter(FilterKind::After, Guard::any(), noop());
        table.add_filter(
            FilterKind::Before,
            Guard::any().method(Method::Delete),
            noop(),
        );

        assert_eq!(
            table.filters(FilterKind::Before, &Method::Post, "/", opts()).count(),
            1
        );
        assert_eq!(
            table
                .filters(FilterKind::Before, &Method::Get, "/admin/users", opts())
                .count(),
            2
        );
        assert_eq!(
            table
                .filters(FilterKind::Before, &Method::Delete, "/admin/x", opts())
                .count(),
            3
        );
        assert_eq!(
            table.filters(FilterKind::After, &Method::Get, "/anything", opts()).count(),
            1
        );
    }

    #[test]
    fn guard_captures_are_returned() {
        let mut table = RouteTable::new();
        table.add_filter(FilterKind::Before, Guard::path("/shop/:shop/*").unwrap(), noop());
        let (_, params) = table
            .filters(FilterKind::Before, &Method::Get, "/shop/acme/cart", opts())
            .next()
            .unwrap();
        assert_eq!(params.get("shop"), Some("acme"));
        assert_eq!(params.splat(), ["cart"]);
    }
}
