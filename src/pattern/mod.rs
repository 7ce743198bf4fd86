//! Route pattern compilation and matching.
//!
//! A [`Pattern`] is compiled once, at registration time, from either a path
//! template or a raw regular expression:
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/users`             | `/users`                   | *(none)*                        |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `/files/*`           | `/files/docs/readme.txt`   | `splat → ["docs", "readme.txt"]`|
//! | `^/(\d+)$` (regex)   | `/42`                      | `captures → ["42"]`             |
//!
//! Matching is always anchored at both ends of the path. Case sensitivity and
//! trailing-slash tolerance are [`MatchOptions`] supplied at match time, so
//! the same compiled pattern can serve applications configured differently.
//!
//! When a template holds several splats, earlier splats take as few segments
//! as they can and the last one receives whatever is left; every splatted
//! segment ends up, in path order, under the single `splat` key.

use std::collections::HashSet;
use std::fmt;

use percent_encoding::percent_decode_str;
use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::context::Params;

/// Key under which splat segments are exposed.
pub const SPLAT: &str = "splat";

/// Key under which unnamed regex groups are exposed.
pub const CAPTURES: &str = "captures";

/// Errors raised while compiling a route pattern.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid regular expression `{pattern}`: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid capture name `{name}` in pattern `{pattern}`")]
    InvalidCapture { pattern: String, name: String },

    #[error("duplicate capture name `{name}` in pattern `{pattern}`")]
    DuplicateCapture { pattern: String, name: String },
}

/// What a route was registered with, before compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSpec {
    /// A path template with `:name` captures and `*` splats.
    Path(String),
    /// A raw regular expression matched against the decoded path.
    Regex(String),
}

impl PatternSpec {
    pub fn regex(source: impl Into<String>) -> Self {
        Self::Regex(source.into())
    }
}

impl From<&str> for PatternSpec {
    fn from(template: &str) -> Self {
        Self::Path(template.to_owned())
    }
}

impl From<String> for PatternSpec {
    fn from(template: String) -> Self {
        Self::Path(template)
    }
}

impl From<Regex> for PatternSpec {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex.as_str().to_owned())
    }
}

/// Match-time options, read from the application's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    /// Compare static segments (and regexes) case-sensitively.
    pub case_sensitive: bool,
    /// Require the path's trailing slash to agree with the pattern's.
    pub strict_paths: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            strict_paths: false,
        }
    }
}

/// One piece of a compiled path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text, already percent-decoded.
    Static(String),
    /// `:name` — exactly one non-empty path segment.
    Capture(String),
    /// `*` — zero or more path segments.
    Splat,
}

#[derive(Clone)]
enum Matcher {
    Segments {
        segments: Vec<Segment>,
        trailing_slash: bool,
    },
    Regex {
        exact: Regex,
        folded: Regex,
        named: bool,
    },
}

/// A compiled, immutable route pattern.
///
/// # Examples
///
/// ```
/// use croon::pattern::{MatchOptions, Pattern};
///
/// let pattern = Pattern::compile("/users/:id").unwrap();
/// let params = pattern.matches("/users/42", MatchOptions::default()).unwrap();
/// assert_eq!(params.get("id"), Some("42"));
///
/// assert!(pattern.matches("/users/42/posts", MatchOptions::default()).is_none());
/// ```
#[derive(Clone)]
pub struct Pattern {
    source: String,
    names: Vec<String>,
    matcher: Matcher,
}

impl Pattern {
    /// Compile a pattern specification.
    ///
    /// # Errors
    ///
    /// - [`PatternError::Regex`] — the regular expression does not parse.
    /// - [`PatternError::InvalidCapture`] — a `:name` piece has an empty or
    ///   non-identifier name.
    /// - [`PatternError::DuplicateCapture`] — a capture name appears twice.
    pub fn compile(spec: impl Into<PatternSpec>) -> Result<Self, PatternError> {
        match spec.into() {
            PatternSpec::Path(template) => Self::compile_template(template),
            PatternSpec::Regex(source) => Self::compile_regex(source),
        }
    }

    fn compile_template(source: String) -> Result<Self, PatternError> {
        let trimmed = source.strip_prefix('/').unwrap_or(&source);
        let trailing_slash = trimmed.ends_with('/');
        let body = trimmed.strip_suffix('/').unwrap_or(trimmed);

        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut segments = Vec::new();

        for piece in body.split('/').filter(|_| !body.is_empty()) {
            let segment = if piece == "*" {
                if seen.insert(SPLAT.to_owned()) {
                    names.push(SPLAT.to_owned());
                }
                Segment::Splat
            } else if let Some(name) = piece.strip_prefix(':') {
                if !is_identifier(name) {
                    return Err(PatternError::InvalidCapture {
                        pattern: source.clone(),
                        name: name.to_owned(),
                    });
                }
                if !seen.insert(name.to_owned()) {
                    return Err(PatternError::DuplicateCapture {
                        pattern: source.clone(),
                        name: name.to_owned(),
                    });
                }
                names.push(name.to_owned());
                Segment::Capture(name.to_owned())
            } else {
                Segment::Static(decode(piece))
            };
            segments.push(segment);
        }

        // A capture literally named `splat` collides with the splat key.
        if segments.contains(&Segment::Splat)
            && segments.contains(&Segment::Capture(SPLAT.to_owned()))
        {
            return Err(PatternError::DuplicateCapture {
                pattern: source,
                name: SPLAT.to_owned(),
            });
        }

        Ok(Self {
            source,
            names,
            matcher: Matcher::Segments {
                segments,
                trailing_slash,
            },
        })
    }

    fn compile_regex(source: String) -> Result<Self, PatternError> {
        let anchored = format!("^(?:{source})$");
        let build = |case_insensitive: bool| {
            RegexBuilder::new(&anchored)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|e| PatternError::Regex {
                    pattern: source.clone(),
                    source: e,
                })
        };
        let exact = build(false)?;
        let folded = build(true)?;

        let named: Vec<String> = exact.capture_names().flatten().map(str::to_owned).collect();
        let is_named = !named.is_empty();
        let names = if is_named {
            named
        } else if exact.captures_len() > 1 {
            vec![CAPTURES.to_owned()]
        } else {
            Vec::new()
        };

        Ok(Self {
            source,
            names,
            matcher: Matcher::Regex {
                exact,
                folded,
                named: is_named,
            },
        })
    }

    /// The pattern as it was registered.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parameter keys this pattern can produce, in pattern order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The compiled segments of a path template, or `None` for a regex.
    pub fn segments(&self) -> Option<&[Segment]> {
        match &self.matcher {
            Matcher::Segments { segments, .. } => Some(segments),
            Matcher::Regex { .. } => None,
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(self.matcher, Matcher::Regex { .. })
    }

    /// Match `path` (still percent-encoded) against this pattern.
    ///
    /// Returns the captured parameters, or `None` if the path does not match.
    pub fn matches(&self, path: &str, options: MatchOptions) -> Option<Params> {
        match &self.matcher {
            Matcher::Segments {
                segments,
                trailing_slash,
            } => {
                let trimmed = path.strip_prefix('/').unwrap_or(path);
                if options.strict_paths && trimmed.ends_with('/') != *trailing_slash {
                    return None;
                }
                let body = trimmed.strip_suffix('/').unwrap_or(trimmed);
                let parts: Vec<String> = if body.is_empty() {
                    Vec::new()
                } else {
                    body.split('/').map(decode).collect()
                };

                let mut bindings = Vec::new();
                if !match_segments(segments, &parts, options, &mut bindings) {
                    return None;
                }
                Some(collect_bindings(bindings))
            }
            Matcher::Regex {
                exact,
                folded,
                named,
            } => {
                let regex = if options.case_sensitive { exact } else { folded };
                let decoded = decode(path);
                let caps = regex.captures(&decoded)?;
                let mut params = Params::new();
                if *named {
                    for name in exact.capture_names().flatten() {
                        if let Some(value) = caps.name(name) {
                            params.insert(name, value.as_str());
                        }
                    }
                } else if caps.len() > 1 {
                    let values = caps
                        .iter()
                        .skip(1)
                        .map(|m| m.map(|m| m.as_str().to_owned()).unwrap_or_default())
                        .collect();
                    params.insert_many(CAPTURES, values);
                }
                Some(params)
            }
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("source", &self.source)
            .field("regex", &self.is_regex())
            .field("names", &self.names)
            .finish()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

enum Binding<'p> {
    One(&'p str, &'p str),
    Splat(&'p [String]),
}

// Depth-first match with backtracking over splat lengths. On failure every
// level leaves `out` exactly as it found it.
fn match_segments<'p>(
    segments: &'p [Segment],
    parts: &'p [String],
    options: MatchOptions,
    out: &mut Vec<Binding<'p>>,
) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return parts.is_empty();
    };

    match first {
        Segment::Static(literal) => {
            let Some((part, tail)) = parts.split_first() else {
                return false;
            };
            let equal = if options.case_sensitive {
                literal == part
            } else {
                literal.to_lowercase() == part.to_lowercase()
            };
            equal && match_segments(rest, tail, options, out)
        }
        Segment::Capture(name) => {
            let Some((part, tail)) = parts.split_first() else {
                return false;
            };
            if part.is_empty() {
                return false;
            }
            out.push(Binding::One(name, part));
            if match_segments(rest, tail, options, out) {
                return true;
            }
            out.pop();
            false
        }
        Segment::Splat => {
            for take in 0..=parts.len() {
                out.push(Binding::Splat(&parts[..take]));
                if match_segments(rest, &parts[take..], options, out) {
                    return true;
                }
                out.pop();
            }
            false
        }
    }
}

fn collect_bindings(bindings: Vec<Binding<'_>>) -> Params {
    let mut params = Params::new();
    let mut splat: Option<Vec<String>> = None;
    for binding in bindings {
        match binding {
            Binding::One(name, value) => params.insert(name, value),
            Binding::Splat(parts) => splat.get_or_insert_with(Vec::new).extend_from_slice(parts),
        }
    }
    if let Some(splat) = splat {
        params.insert_many(SPLAT, splat);
    }
    params
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

pub(crate) fn decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
