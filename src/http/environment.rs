//! The request side of the boundary protocol.
//!
//! An [`Environment`] is everything a stage gets to see about a request: the
//! request line split into method, path and query string, the headers, the
//! raw body, and a free-form string map for values that upstream stages want
//! to hand down (remote address, request id, ...).

use std::collections::BTreeMap;

use bytes::Bytes;

use super::{Headers, Method};

/// An abstract HTTP request as passed between stages.
///
/// # Examples
///
/// ```
/// use croon::http::{Environment, Method};
///
/// let env = Environment::new(Method::Get, "/search?q=rust")
///     .header("Accept", "text/html")
///     .var("remote_addr", "127.0.0.1");
///
/// assert_eq!(env.path(), "/search");
/// assert_eq!(env.query_string(), Some("q=rust"));
/// assert_eq!(env.headers().get("accept"), Some("text/html"));
/// assert_eq!(env.get_var("remote_addr"), Some("127.0.0.1"));
/// ```
#[derive(Debug, Clone)]
pub struct Environment {
    method: Method,
    path: String,
    query: Option<String>,
    headers: Headers,
    body: Bytes,
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Builds an environment from a method and a request target
    /// (path with an optional `?query`).
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };

        Self {
            method,
            path,
            query,
            headers: Headers::new(),
            body: Bytes::new(),
            vars: BTreeMap::new(),
        }
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces all request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the raw request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a free-form environment value.
    #[must_use]
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path, still percent-encoded, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.body
    }

    pub fn get_var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Inserts a free-form value in place, for stages that decorate the
    /// environment before handing it downstream.
    pub fn insert_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// The media type of the body, without parameters, lowercased.
    pub fn media_type(&self) -> Option<String> {
        self.headers.get("content-type").map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_without_query() {
        let env = Environment::new(Method::Post, "/users");
        assert_eq!(env.path(), "/users");
        assert_eq!(env.query_string(), None);
        assert!(env.raw_body().is_empty());
    }

    #[test]
    fn empty_query_is_kept() {
        let env = Environment::new(Method::Get, "/users?");
        assert_eq!(env.query_string(), Some(""));
    }

    #[test]
    fn media_type_strips_parameters() {
        let env = Environment::new(Method::Post, "/")
            .header("Content-Type", "Application/X-WWW-Form-Urlencoded; charset=utf-8");
        assert_eq!(
            env.media_type().as_deref(),
            Some("application/x-www-form-urlencoded")
        );
    }
}
