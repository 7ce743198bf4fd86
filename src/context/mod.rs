//! Per-request state shared by filters, the matched handler and error handlers.
//!
//! A [`RequestContext`] is created fresh for every dispatch and dropped when
//! the response is returned. Nothing in it is shared with other requests:
//! routes, filters and settings live in the application definition, which is
//! immutable by the time requests arrive.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;

use crate::handler::{HandlerError, Signal};
use crate::http::{Body, Environment, Headers, Method, Response, StatusCode};
use crate::settings::Settings;

/// A single parameter: one string, or an ordered list of strings
/// (splats, `key[]=` query arrays, positional regex groups).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    One(String),
    Many(Vec<String>),
}

impl ParamValue {
    /// The string of a single-valued parameter.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::One(value) => Some(value.as_str()),
            Self::Many(_) => None,
        }
    }

    /// Every value, in order. A single value is a one-element slice.
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        }
    }
}

/// Request parameters gathered from path captures, the query string and a
/// url-encoded body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    map: BTreeMap<String, ParamValue>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a single value, replacing any previous value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), ParamValue::One(value.into()));
    }

    /// Insert an ordered list of values, replacing any previous value for `key`.
    pub fn insert_many(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.map.insert(key.into(), ParamValue::Many(values));
    }

    /// Single value for `key`; `None` when absent or list-valued.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).and_then(ParamValue::as_str)
    }

    /// All values for `key`; empty when absent.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.map.get(key).map(ParamValue::as_slice).unwrap_or_default()
    }

    pub fn value(&self, key: &str) -> Option<&ParamValue> {
        self.map.get(key)
    }

    /// The segments captured by `*` splats.
    pub fn splat(&self) -> &[String] {
        self.get_all(crate::pattern::SPLAT)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.map.remove(key)
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merge(&mut self, other: Params) {
        self.map.extend(other.map);
    }

    /// Like [`merge`](Self::merge), but returns what each key of `other`
    /// held before so the overlay can be undone with [`unwind`](Self::unwind).
    pub(crate) fn overlay(&mut self, other: Params) -> Vec<(String, Option<ParamValue>)> {
        other
            .map
            .into_iter()
            .map(|(key, value)| {
                let previous = self.map.insert(key.clone(), value);
                (key, previous)
            })
            .collect()
    }

    pub(crate) fn unwind(&mut self, shadowed: Vec<(String, Option<ParamValue>)>) {
        for (key, previous) in shadowed {
            match previous {
                Some(value) => self.map.insert(key, value),
                None => self.map.remove(&key),
            };
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parse `application/x-www-form-urlencoded` data.
    ///
    /// `+` decodes to a space. A repeated plain key keeps its last value;
    /// keys ending in `[]` accumulate into a list under the bare name.
    pub fn parse_urlencoded(input: &str) -> Self {
        let mut params = Self::new();
        for pair in input.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = form_decode(key);
            let value = form_decode(value);

            let list_key = key.strip_suffix("[]").map(str::to_owned);
            match list_key {
                Some(base) => match params.map.get_mut(&base) {
                    Some(ParamValue::Many(values)) => values.push(value),
                    _ => params.insert_many(base, vec![value]),
                },
                None => params.insert(key, value),
            }
        }
        params
    }
}

fn form_decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// An "instance variable" bag: values of any type, stored by name, shared
/// by the filters and the handler of one request.
///
/// # Examples
///
/// ```
/// use croon::context::Locals;
///
/// let mut locals = Locals::new();
/// locals.insert("user_id", 42_u64);
/// assert_eq!(locals.get::<u64>("user_id"), Some(&42));
/// assert_eq!(locals.get::<String>("user_id"), None);
/// ```
///
/// Values are reference counted, so saving the bag before a candidate route
/// is cheap. Mutating a value that a saved copy still shares clones it
/// first, which is why `get_mut` and `remove` need `T: Clone`.
#[derive(Default, Clone)]
pub struct Locals {
    map: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Locals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing whatever was there.
    pub fn insert<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(key.into(), Arc::new(value));
    }

    /// The value under `key`, if present and of type `T`.
    pub fn get<T>(&self, key: &str) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map.get(key).and_then(|value| (**value).downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self, key: &str) -> Option<&mut T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let slot = self.map.get_mut(key)?;
        if Arc::get_mut(slot).is_none() {
            let copy = (**slot).downcast_ref::<T>()?.clone();
            *slot = Arc::new(copy);
        }
        Arc::get_mut(slot)?.downcast_mut::<T>()
    }

    /// Remove and return the value under `key` if it is a `T`.
    pub fn remove<T>(&mut self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if !self.map.get(key).is_some_and(|value| (**value).is::<T>()) {
            return None;
        }
        let value = self.map.remove(key)?.downcast::<T>().ok()?;
        Some(Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Locals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}

/// Per-request context: the request as seen by handlers plus the response
/// being built.
pub struct RequestContext {
    env: Environment,
    params: Params,
    status: StatusCode,
    headers: Headers,
    body: Body,
    locals: Locals,
    settings: Arc<Settings>,
    error: Option<HandlerError>,
}

impl RequestContext {
    /// Build a fresh context for `env`.
    ///
    /// Params are seeded from a url-encoded body and then the query string,
    /// so query values shadow body values of the same name. Path captures are
    /// merged later, per candidate route, and shadow both.
    pub fn new(env: Environment, settings: Arc<Settings>) -> Self {
        let mut params = Params::new();
        if env.media_type().as_deref() == Some("application/x-www-form-urlencoded") {
            let body = String::from_utf8_lossy(env.raw_body());
            params.merge(Params::parse_urlencoded(&body));
        }
        if let Some(query) = env.query_string() {
            params.merge(Params::parse_urlencoded(query));
        }

        Self {
            env,
            params,
            status: StatusCode::OK,
            headers: Headers::new(),
            body: Body::empty(),
            locals: Locals::new(),
            settings,
            error: None,
        }
    }

    // ── request side ──────────────────────────────────────────────────────────

    pub fn method(&self) -> &Method {
        self.env.method()
    }

    pub fn path(&self) -> &str {
        self.env.path()
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// A request header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.env.headers().get(name)
    }

    pub fn request_headers(&self) -> &Headers {
        self.env.headers()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// Shorthand for `params().get(key)`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    /// Deserialize the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(self.env.raw_body())
    }

    // ── response side ─────────────────────────────────────────────────────────

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: impl Into<StatusCode>) {
        self.status = status.into();
    }

    /// Response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Set a response header, replacing previous values.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn content_type(&mut self, media_type: impl Into<String>) {
        self.headers.set("Content-Type", media_type);
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Append a chunk to the response body.
    pub fn write(&mut self, chunk: impl Into<bytes::Bytes>) {
        self.body.push(chunk);
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// Set `Location` and return a halt with `302 Found`.
    ///
    /// ```
    /// use croon::handler::Signal;
    /// # use croon::{context::RequestContext, http::{Environment, Method}};
    /// # let mut ctx = RequestContext::new(Environment::new(Method::Post, "/login"), Default::default());
    /// let signal = ctx.redirect("/dashboard");
    /// assert!(signal.is_halt());
    /// assert_eq!(ctx.headers().get("location"), Some("/dashboard"));
    /// ```
    pub fn redirect(&mut self, location: impl Into<String>) -> Signal {
        self.headers.set("Location", location);
        Signal::halt(StatusCode::FOUND)
    }

    // ── shared state ──────────────────────────────────────────────────────────

    pub fn locals(&self) -> &Locals {
        &self.locals
    }

    pub fn locals_mut(&mut self) -> &mut Locals {
        &mut self.locals
    }

    /// The application's resolved settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The failure being handled, inside an error handler.
    pub fn error(&self) -> Option<&HandlerError> {
        self.error.as_ref()
    }

    pub(crate) fn set_error(&mut self, error: HandlerError) {
        self.error = Some(error);
    }

    /// Capture the state a passing route must not leave behind.
    ///
    /// A streaming body cannot be copied, so it is moved into the snapshot
    /// and the candidate starts from an empty body.
    pub(crate) fn snapshot(&mut self) -> Snapshot {
        let body = match self.body.try_clone() {
            Some(copy) => SavedBody::Copied(copy),
            None => SavedBody::Moved(self.take_body()),
        };
        Snapshot {
            status: self.status,
            headers: self.headers.clone(),
            body,
            params: self.params.clone(),
            locals: self.locals.clone(),
        }
    }

    /// Roll back to `snapshot`.
    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        self.status = snapshot.status;
        self.headers = snapshot.headers;
        self.params = snapshot.params;
        self.locals = snapshot.locals;
        self.body = match snapshot.body {
            SavedBody::Copied(body) | SavedBody::Moved(body) => body,
        };
    }

    /// Keep the candidate's changes. A stream moved aside by [`snapshot`]
    /// goes back in front of whatever the candidate wrote, unless the
    /// candidate installed a stream of its own.
    ///
    /// [`snapshot`]: Self::snapshot
    pub(crate) fn commit(&mut self, snapshot: Snapshot) {
        let SavedBody::Moved(stream) = snapshot.body else {
            return;
        };
        let written = self.take_body();
        if written.is_streaming() {
            self.body = written;
            return;
        }
        self.body = stream;
        for chunk in written {
            self.body.push(chunk);
        }
    }

    /// Finish the request and hand out the response parts.
    pub(crate) fn into_response(self) -> Response {
        Response::from_parts(self.status, self.headers, self.body)
    }
}

/// State saved before trying a candidate route.
pub(crate) struct Snapshot {
    status: StatusCode,
    headers: Headers,
    body: SavedBody,
    params: Params,
    locals: Locals,
}

enum SavedBody {
    Copied(Body),
    Moved(Body),
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", self.method())
            .field("path", &self.path())
            .field("params", &self.params)
            .field("status", &self.status)
            .field("locals", &self.locals)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(env: Environment) -> RequestContext {
        RequestContext::new(env, Arc::new(Settings::default()))
    }

    #[test]
    fn query_params_are_decoded() {
        let ctx = context(Environment::new(Method::Get, "/s?q=rust+lang&tag=%23async"));
        assert_eq!(ctx.param("q"), Some("rust lang"));
        assert_eq!(ctx.param("tag"), Some("#async"));
    }

    #[test]
    fn bracketed_keys_collect_lists() {
        let params = Params::parse_urlencoded("ids[]=1&ids[]=2&name=a&name=b");
        assert_eq!(params.get_all("ids"), ["1", "2"]);
        assert_eq!(params.get("ids"), None);
        assert_eq!(params.get("name"), Some("b"));
    }

    #[test]
    fn key_without_value_is_empty_string() {
        let params = Params::parse_urlencoded("flag&x=");
        assert_eq!(params.get("flag"), Some(""));
        assert_eq!(params.get("x"), Some(""));
    }

    #[test]
    fn query_shadows_form_body() {
        let env = Environment::new(Method::Post, "/form?name=query")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body("name=body&extra=1");
        let ctx = context(env);
        assert_eq!(ctx.param("name"), Some("query"));
        assert_eq!(ctx.param("extra"), Some("1"));
    }

    #[test]
    fn non_form_body_is_not_parsed() {
        let env = Environment::new(Method::Post, "/")
            .header("Content-Type", "application/json")
            .body("a=1");
        assert!(context(env).params().is_empty());
    }

    #[test]
    fn merge_overrides_existing_keys() {
        let mut base = Params::parse_urlencoded("id=query&page=2");
        let mut captures = Params::new();
        captures.insert("id", "42");
        base.merge(captures);
        assert_eq!(base.get("id"), Some("42"));
        assert_eq!(base.get("page"), Some("2"));
    }

    #[test]
    fn locals_are_typed_by_name() {
        let mut locals = Locals::new();
        locals.insert("user", String::from("alice"));
        assert_eq!(locals.get::<String>("user").map(String::as_str), Some("alice"));
        assert!(locals.get::<u32>("user").is_none());

        locals.get_mut::<String>("user").unwrap().push_str("!");
        assert_eq!(locals.remove::<u32>("user"), None);
        assert!(locals.contains("user"));
        assert_eq!(locals.remove::<String>("user").as_deref(), Some("alice!"));
        assert!(locals.is_empty());
    }

    #[test]
    fn json_body() {
        #[derive(serde::Deserialize)]
        struct Payload {
            name: String,
        }
        let env = Environment::new(Method::Post, "/").body(r#"{"name":"croon"}"#);
        let payload: Payload = context(env).json().unwrap();
        assert_eq!(payload.name, "croon");
    }

    #[test]
    fn write_appends_chunks() {
        let mut ctx = context(Environment::new(Method::Get, "/"));
        ctx.write("a");
        ctx.write("b");
        assert_eq!(ctx.take_body().into_bytes().as_ref(), b"ab");
        assert!(ctx.body().is_empty());
    }

    #[test]
    fn restore_undoes_a_candidate() {
        let mut ctx = context(Environment::new(Method::Get, "/?page=1"));
        ctx.set_body("before");
        let snapshot = ctx.snapshot();

        ctx.set_status(StatusCode::CREATED);
        ctx.set_header("X-Tried", "yes");
        ctx.params_mut().insert("page", "2");
        ctx.params_mut().insert("id", "7");
        ctx.write(" and after");
        ctx.locals_mut().insert("tried", true);

        ctx.restore(snapshot);
        assert_eq!(ctx.status(), StatusCode::OK);
        assert!(ctx.headers().is_empty());
        assert_eq!(ctx.param("page"), Some("1"));
        assert!(!ctx.params().contains("id"));
        assert_eq!(ctx.take_body().into_bytes().as_ref(), b"before");
        assert!(!ctx.locals().contains("tried"));
    }

    #[test]
    fn restore_brings_back_a_streaming_body() {
        let mut ctx = context(Environment::new(Method::Get, "/"));
        ctx.set_body(Body::stream(vec![bytes::Bytes::from_static(b"early")]));
        let snapshot = ctx.snapshot();
        assert!(!ctx.body().is_streaming());

        ctx.write(" tried");
        ctx.restore(snapshot);
        assert!(ctx.body().is_streaming());
        assert_eq!(ctx.take_body().into_bytes().as_ref(), b"early");
    }

    #[test]
    fn commit_chains_writes_after_a_moved_stream() {
        let mut ctx = context(Environment::new(Method::Get, "/"));
        ctx.set_body(Body::stream(vec![bytes::Bytes::from_static(b"early")]));
        let snapshot = ctx.snapshot();

        ctx.write(" late");
        ctx.commit(snapshot);
        assert_eq!(ctx.take_body().into_bytes().as_ref(), b"early late");
    }

    #[test]
    fn shared_locals_are_copied_on_write() {
        let mut locals = Locals::new();
        locals.insert("count", 1_u32);
        let saved = locals.clone();

        *locals.get_mut::<u32>("count").unwrap() += 1;
        assert_eq!(locals.get::<u32>("count"), Some(&2));
        assert_eq!(saved.get::<u32>("count"), Some(&1));
        assert_eq!(locals.remove::<u32>("count"), Some(2));
        assert_eq!(saved.get::<u32>("count"), Some(&1));
    }

    #[test]
    fn overlay_unwinds_to_previous_values() {
        let mut params = Params::parse_urlencoded("id=query&q=x");
        let mut captures = Params::new();
        captures.insert("id", "path");
        captures.insert("extra", "1");

        let shadowed = params.overlay(captures);
        assert_eq!(params.get("id"), Some("path"));
        assert_eq!(params.get("extra"), Some("1"));

        params.unwind(shadowed);
        assert_eq!(params, Params::parse_urlencoded("id=query&q=x"));
    }
}
