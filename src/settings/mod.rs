//! Application settings with inheritance and environment-specific blocks.
//!
//! Every application definition owns a [`SettingsStore`]: an ordered log of
//! `set` calls and `configure` blocks. Resolving a definition replays the
//! logs of its whole lineage, root first, into an immutable [`Settings`]
//! snapshot. A derived application therefore sees every inherited key and
//! may override any of them, but can never remove one.
//!
//! The running environment comes from the `environment` setting, which
//! defaults to `$APP_ENV` (or `"development"`). `configure` blocks recorded
//! for other environments are skipped during resolution.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tracing::warn;

use crate::pattern::MatchOptions;

/// Name of the setting holding the running environment.
pub const ENVIRONMENT: &str = "environment";

/// Environment variable consulted for the default environment.
pub const ENVIRONMENT_VAR: &str = "APP_ENV";

const DEFAULT_ENVIRONMENT: &str = "development";

/// A resolved, read-only settings snapshot.
///
/// # Examples
///
/// ```
/// use croon::settings::SettingsStore;
///
/// let mut store = SettingsStore::new();
/// store.set("environment", "production");
/// store.set("workers", 4);
///
/// let settings = store.resolve(&[]);
/// assert_eq!(settings.environment(), "production");
/// assert_eq!(settings.get("workers").and_then(|v| v.as_u64()), Some(4));
/// assert!(!settings.flag("show_exceptions"));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    values: BTreeMap<String, Value>,
}

impl Settings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Boolean value of `key`; absent or non-boolean values read as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// String value of `key`, if it holds one.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// The running environment name.
    pub fn environment(&self) -> &str {
        self.string(ENVIRONMENT).unwrap_or(DEFAULT_ENVIRONMENT)
    }

    pub fn is_environment(&self, name: &str) -> bool {
        self.environment() == name
    }

    /// Route-matching options derived from `case_sensitive` and `strict_paths`.
    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            case_sensitive: self
                .get("case_sensitive")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            strict_paths: self.flag("strict_paths"),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone)]
enum SettingOp {
    Set(String, Value),
    Configure {
        environments: Vec<String>,
        entries: Vec<(String, Value)>,
    },
}

/// Collects the `set` calls of one `configure` block.
#[derive(Debug, Default)]
pub struct Configure {
    entries: Vec<(String, Value)>,
}

impl Configure {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.entries.push((key.into(), value.into()));
        self
    }
}

/// The recorded settings operations of one application definition.
///
/// The resolved snapshot is cached; recording another operation after
/// resolution drops the cache so the next resolution sees it.
#[derive(Debug, Default)]
pub struct SettingsStore {
    ops: Vec<SettingOp>,
    cache: OnceLock<Arc<Settings>>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key = value` for every environment.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.invalidate(&key);
        self.ops.push(SettingOp::Set(key, value.into()));
    }

    /// Record the `set` calls made by `block`, to be applied only when the
    /// running environment is one of `environments`. An empty list means
    /// every environment.
    pub fn configure<F>(&mut self, environments: &[&str], block: F)
    where
        F: FnOnce(&mut Configure),
    {
        let mut scope = Configure::default();
        block(&mut scope);
        if let Some((key, _)) = scope.entries.first() {
            let key = key.clone();
            self.invalidate(&key);
        }
        self.ops.push(SettingOp::Configure {
            environments: environments.iter().map(|e| (*e).to_owned()).collect(),
            entries: scope.entries,
        });
    }

    /// Resolve this store on top of `ancestors` (root first, excluding `self`).
    ///
    /// The result is cached; callers must pass the same ancestry every time,
    /// which holds because a definition's parent is fixed at construction.
    pub fn resolve(&self, ancestors: &[&SettingsStore]) -> Arc<Settings> {
        let settings = self.cache.get_or_init(|| {
            let mut lineage = ancestors.to_vec();
            lineage.push(self);
            Arc::new(resolve(&lineage))
        });
        Arc::clone(settings)
    }

    pub fn is_resolved(&self) -> bool {
        self.cache.get().is_some()
    }

    fn invalidate(&mut self, key: &str) {
        if self.cache.take().is_some() {
            warn!(setting = key, "settings changed after resolution; snapshot invalidated");
        }
    }
}

/// Replay `lineage` (root first) into a snapshot, without caching.
pub fn resolve(lineage: &[&SettingsStore]) -> Settings {
    let ops = || lineage.iter().flat_map(|store| store.ops.iter());

    // The environment decides which configure blocks apply, so it is fixed
    // from unconditional sets alone.
    let environment = ops()
        .filter_map(|op| match op {
            SettingOp::Set(key, value) if key == ENVIRONMENT => value.as_str(),
            _ => None,
        })
        .last()
        .map(str::to_owned)
        .unwrap_or_else(default_environment);

    let mut values = defaults(&environment);

    for op in ops() {
        match op {
            SettingOp::Set(key, value) => {
                values.insert(key.clone(), value.clone());
            }
            SettingOp::Configure {
                environments,
                entries,
            } => {
                if environments.is_empty() || environments.iter().any(|e| *e == environment) {
                    for (key, value) in entries {
                        values.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }

    Settings { values }
}

fn default_environment() -> String {
    std::env::var(ENVIRONMENT_VAR)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_owned())
}

fn defaults(environment: &str) -> BTreeMap<String, Value> {
    let development = environment == DEFAULT_ENVIRONMENT;
    BTreeMap::from([
        (ENVIRONMENT.to_owned(), Value::from(environment)),
        ("show_exceptions".to_owned(), Value::from(development)),
        ("dump_errors".to_owned(), Value::from(development)),
        ("case_sensitive".to_owned(), Value::from(true)),
        ("strict_paths".to_owned(), Value::from(false)),
        (
            "default_content_type".to_owned(),
            Value::from("text/html;charset=utf-8"),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(environment: &str) -> SettingsStore {
        let mut store = SettingsStore::new();
        store.set(ENVIRONMENT, environment);
        store
    }

    #[test]
    fn defaults_follow_environment() {
        let dev = store_in("development").resolve(&[]);
        assert!(dev.flag("show_exceptions"));
        assert!(dev.flag("dump_errors"));

        let prod = store_in("production").resolve(&[]);
        assert!(!prod.flag("show_exceptions"));
        assert_eq!(prod.string("default_content_type"), Some("text/html;charset=utf-8"));
        assert_eq!(prod.match_options(), MatchOptions::default());
    }

    #[test]
    fn later_set_wins() {
        let mut store = store_in("test");
        store.set("name", "first");
        store.set("name", "second");
        assert_eq!(store.resolve(&[]).string("name"), Some("second"));
    }

    #[test]
    fn child_overrides_and_inherits() {
        let mut parent = store_in("test");
        parent.set("title", "parent");
        parent.set("per_page", 20);

        let mut child = SettingsStore::new();
        child.set("title", "child");

        let settings = child.resolve(&[&parent]);
        assert_eq!(settings.string("title"), Some("child"));
        assert_eq!(settings.get("per_page"), Some(&Value::from(20)));
        assert_eq!(settings.environment(), "test");

        // the parent's own snapshot is unaffected
        assert_eq!(parent.resolve(&[]).string("title"), Some("parent"));
    }

    #[test]
    fn configure_applies_only_in_matching_environment() {
        let mut store = store_in("production");
        store.configure(&["development", "test"], |c| {
            c.set("verbose", true);
        });
        store.configure(&["production"], |c| {
            c.set("cache", true).set("verbose", false);
        });

        let settings = store.resolve(&[]);
        assert!(settings.flag("cache"));
        assert!(!settings.flag("verbose"));
    }

    #[test]
    fn configure_without_environments_always_applies() {
        let mut store = store_in("staging");
        store.configure(&[], |c| {
            c.set("everywhere", "yes");
        });
        assert_eq!(store.resolve(&[]).string("everywhere"), Some("yes"));
    }

    #[test]
    fn child_environment_selects_parent_configure_blocks() {
        let mut parent = store_in("development");
        parent.configure(&["production"], |c| {
            c.set("cdn", "https://cdn.example.com");
        });

        let mut child = SettingsStore::new();
        child.set(ENVIRONMENT, "production");

        assert_eq!(
            child.resolve(&[&parent]).string("cdn"),
            Some("https://cdn.example.com")
        );
        assert!(parent.resolve(&[]).get("cdn").is_none());
    }

    #[test]
    fn set_after_resolution_invalidates_cache() {
        let mut store = store_in("test");
        store.set("port", 80);
        assert_eq!(store.resolve(&[]).get("port"), Some(&Value::from(80)));
        assert!(store.is_resolved());

        store.set("port", 8080);
        assert!(!store.is_resolved());
        assert_eq!(store.resolve(&[]).get("port"), Some(&Value::from(8080)));
    }

    #[test]
    fn resolution_is_cached() {
        let store = store_in("test");
        let first = store.resolve(&[]);
        let second = store.resolve(&[]);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn match_options_from_settings() {
        let mut store = store_in("test");
        store.set("case_sensitive", false);
        store.set("strict_paths", true);
        let options = store.resolve(&[]).match_options();
        assert!(!options.case_sensitive);
        assert!(options.strict_paths);
    }
}
