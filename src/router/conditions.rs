//! Ready-made route conditions.
//!
//! A condition is checked after a route's pattern matched and its captures
//! were merged into the params; when it returns `false` the route is skipped
//! exactly as if its handler had returned [`Signal::Pass`](crate::handler::Signal::Pass).

use std::sync::Arc;

use regex::Regex;

use crate::handler::Condition;

/// Require the `Host` header (without port) to equal `name`, ignoring case.
/// IPv6 literals may be given with or without their brackets.
pub fn host_name(name: impl Into<String>) -> Condition {
    let name = unbracket(&name.into()).to_owned();
    Arc::new(move |ctx| {
        ctx.header("host")
            .map(|host| unbracket(strip_port(host)))
            .is_some_and(|host| host.eq_ignore_ascii_case(&name))
    })
}

// "[::1]:8080" -> "[::1]", "example.com:80" -> "example.com". A bare IPv6
// literal has several colons and no port.
fn strip_port(host: &str) -> &str {
    let tail = &host[host.rfind(']').map_or(0, |end| end + 1)..];
    let has_port =
        tail.contains(':') && (host.starts_with('[') || host.matches(':').count() == 1);
    match host.rsplit_once(':') {
        Some((name, _port)) if has_port => name,
        _ => host,
    }
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host)
}

/// Require the `User-Agent` header to match `pattern`.
///
/// # Errors
///
/// Returns the regex error when `pattern` does not compile.
pub fn user_agent(pattern: &str) -> Result<Condition, regex::Error> {
    let regex = Regex::new(pattern)?;
    Ok(Arc::new(move |ctx| {
        ctx.header("user-agent")
            .is_some_and(|agent| regex.is_match(agent))
    }))
}

/// Require the `Accept` header to admit `media_type` (`*/*` and `type/*`
/// wildcards count; a missing header accepts everything).
pub fn provides(media_type: impl Into<String>) -> Condition {
    let media_type = media_type.into().to_ascii_lowercase();
    Arc::new(move |ctx| {
        let Some(accept) = ctx.header("accept") else {
            return true;
        };
        accept.split(',').any(|entry| {
            let range = entry
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            range == "*/*"
                || range == media_type
                || range
                    .strip_suffix("/*")
                    .is_some_and(|major| media_type.split('/').next() == Some(major))
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::RequestContext;
    use crate::http::{Environment, Method};
    use crate::settings::Settings;

    fn ctx_with(name: &str, value: &str) -> RequestContext {
        let env = Environment::new(Method::Get, "/").header(name, value);
        RequestContext::new(env, Arc::new(Settings::default()))
    }

    #[test]
    fn host_name_ignores_port_and_case() {
        let condition = host_name("example.com");
        assert!(condition(&ctx_with("Host", "Example.COM:8080")));
        assert!(!condition(&ctx_with("Host", "other.com")));
    }

    #[test]
    fn host_name_keeps_ipv6_literals_whole() {
        let condition = host_name("::1");
        assert!(condition(&ctx_with("Host", "[::1]:8080")));
        assert!(condition(&ctx_with("Host", "[::1]")));
        assert!(condition(&ctx_with("Host", "::1")));
        assert!(!condition(&ctx_with("Host", "[::2]:8080")));

        let bracketed = host_name("[fe80::1]");
        assert!(bracketed(&ctx_with("Host", "[FE80::1]:443")));
    }

    #[test]
    fn user_agent_regex() {
        let condition = user_agent("^curl/").unwrap();
        assert!(condition(&ctx_with("User-Agent", "curl/8.4.0")));
        assert!(!condition(&ctx_with("User-Agent", "Mozilla/5.0")));
        assert!(user_agent("(").is_err());
    }

    #[test]
    fn provides_understands_wildcards() {
        let json = provides("application/json");
        assert!(json(&ctx_with("Accept", "text/html, application/json;q=0.9")));
        assert!(json(&ctx_with("Accept", "application/*")));
        assert!(json(&ctx_with("Accept", "*/*")));
        assert!(!json(&ctx_with("Accept", "text/html")));
    }
}
