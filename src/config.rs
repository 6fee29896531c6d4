//! Configuration for the mock server.
//!
//! The JSON file is deserialized into raw structs and normalized into an
//! immutable [`Config`]: routes are compiled, proxy call entries are resolved
//! into [`CallRule`]s. [`ConfigStore`] keeps the current config and re-reads
//! the file once its freshness window has passed.

use crate::error::ConfigError;
use crate::matcher::RouteSpec;
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default interval after which the config file is read again.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_millis(2000);

/// How malformed route placeholders, call entries and directive lines are
/// treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Warn and carry on with a best-effort interpretation
    #[default]
    Lenient,
    /// Reject the config or the rendered document
    Strict,
}

/// Effective configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Compiled routes in declaration order
    pub routes: Vec<RouteSpec>,
    /// Proxy policy; `None` means every call is mocked
    pub proxy: Option<ProxyPolicyConfig>,
    /// Shared template variables, exposed as `vars`
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Add permissive CORS headers and answer OPTIONS directly
    pub cors: bool,
    /// Wrap bodies for `callback`/`jsonp` query parameters
    pub jsonp: bool,
    /// Delay applied before every dispatch
    pub simulated_lag: Duration,
    /// Strictness for malformed input
    pub validation: ValidationPolicy,
}

/// Normalized proxy section.
#[derive(Debug, Clone, Default)]
pub struct ProxyPolicyConfig {
    /// Decision for calls without a matching rule
    pub default: bool,
    /// Rules keyed by request path
    pub calls: HashMap<String, CallRule>,
    /// Upstream base url, e.g. `http://api.example.com`
    pub server: Option<String>,
}

/// Proxy rule for one request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallRule {
    /// Same decision for every method
    Always(bool),
    /// Decision per lower-cased method; missing methods use the default
    PerMethod(HashMap<String, bool>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    #[serde(default)]
    routes: Vec<String>,
    #[serde(default)]
    proxy: Option<RawProxy>,
    #[serde(default)]
    variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    cors: bool,
    #[serde(default)]
    jsonp: bool,
    #[serde(default)]
    simulated_lag: u64,
    #[serde(default)]
    validation: ValidationPolicy,
}

#[derive(Debug, Default, Deserialize)]
struct RawProxy {
    #[serde(default)]
    default: bool,
    #[serde(default)]
    calls: HashMap<String, RawCallEntry>,
    #[serde(default)]
    server: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCallEntry {
    Bool(bool),
    PerMethod(serde_json::Map<String, serde_json::Value>),
    Other(serde_json::Value),
}

impl Config {
    /// Parse and normalize a JSON config document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    /// Load a config file from disk.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Load a config file, treating every lenient fallback as an error.
    pub fn validate_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut raw: RawConfig = serde_json::from_str(&content)?;
        raw.validation = ValidationPolicy::Strict;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let policy = raw.validation;

        let routes = raw
            .routes
            .iter()
            .map(|route| RouteSpec::compile(route, policy))
            .collect::<Result<Vec<_>, _>>()?;

        let proxy = match raw.proxy {
            Some(proxy) => Some(normalize_proxy(proxy, policy)?),
            None => None,
        };

        Ok(Self {
            routes,
            proxy,
            variables: raw.variables,
            cors: raw.cors,
            jsonp: raw.jsonp,
            simulated_lag: Duration::from_millis(raw.simulated_lag),
            validation: policy,
        })
    }
}

fn normalize_proxy(raw: RawProxy, policy: ValidationPolicy) -> Result<ProxyPolicyConfig, ConfigError> {
    let mut calls = HashMap::with_capacity(raw.calls.len());

    for (path, entry) in raw.calls {
        let rule = match entry {
            RawCallEntry::Bool(value) => CallRule::Always(value),
            RawCallEntry::PerMethod(methods) => CallRule::PerMethod(
                methods
                    .into_iter()
                    .filter_map(|(method, value)| value.as_bool().map(|b| (method.to_lowercase(), b)))
                    .collect(),
            ),
            RawCallEntry::Other(_) if policy == ValidationPolicy::Strict => {
                return Err(ConfigError::ProxyCall { path });
            }
            RawCallEntry::Other(value) => {
                warn!(path = %path, value = %value, "Ignoring proxy call entry, expected boolean or object");
                continue;
            }
        };
        calls.insert(path, rule);
    }

    Ok(ProxyPolicyConfig {
        default: raw.default,
        calls,
        server: raw.server,
    })
}

struct Snapshot {
    loaded_at: Option<Instant>,
    config: Arc<Config>,
}

/// Soft cache over the config file.
///
/// Readers always see a complete config: a reload builds a fresh
/// [`Config`] and swaps the pointer. At most one caller reloads per window;
/// others keep reading the previous snapshot meanwhile.
pub struct ConfigStore {
    path: PathBuf,
    freshness: Duration,
    current: ArcSwap<Snapshot>,
    loads: AtomicU64,
}

impl ConfigStore {
    /// Store reading `path` with the default freshness window.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_freshness(path, DEFAULT_FRESHNESS)
    }

    /// Store reading `path` with a custom freshness window.
    pub fn with_freshness(path: impl Into<PathBuf>, freshness: Duration) -> Self {
        Self {
            path: path.into(),
            freshness,
            current: ArcSwap::from_pointee(Snapshot {
                loaded_at: None,
                config: Arc::new(Config::default()),
            }),
            loads: AtomicU64::new(0),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current config, reloading it first if the window has passed.
    ///
    /// The reload is a synchronous read of the (small) config file, done by
    /// at most one caller per window. Callers that take one snapshot per
    /// request block for that read at most once.
    pub fn get(&self) -> Arc<Config> {
        let snapshot = self.current.load_full();
        let stale = snapshot
            .loaded_at
            .map_or(true, |at| at.elapsed() > self.freshness);
        if !stale {
            return Arc::clone(&snapshot.config);
        }

        // Claim the reload by stamping the snapshot; losers keep the old config.
        let now = Instant::now();
        let claim = Arc::new(Snapshot {
            loaded_at: Some(now),
            config: Arc::clone(&snapshot.config),
        });
        let previous = self.current.compare_and_swap(&snapshot, claim);
        if !Arc::ptr_eq(&*previous, &snapshot) {
            return Arc::clone(&self.current.load().config);
        }

        let config = Arc::new(self.read());
        self.current.store(Arc::new(Snapshot {
            loaded_at: Some(now),
            config: Arc::clone(&config),
        }));
        config
    }

    /// Number of times the backing file has been read.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    fn read(&self) -> Config {
        self.loads.fetch_add(1, Ordering::Relaxed);
        match Config::from_file(&self.path) {
            Ok(config) => {
                debug!(
                    path = %self.path.display(),
                    routes = config.routes.len(),
                    proxy = config.proxy.is_some(),
                    "Configuration loaded"
                );
                config
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to load configuration, using empty config");
                Config::default()
            }
        }
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .field("freshness", &self.freshness)
            .field("loads", &self.load_count())
            .finish()
    }
}

/// Log a one-line summary of a config, used at startup.
pub fn log_summary(config: &Config) {
    info!(
        routes = config.routes.len(),
        proxy = config.proxy.is_some(),
        upstream = config.proxy.as_ref().and_then(|p| p.server.as_deref()).unwrap_or("-"),
        cors = config.cors,
        jsonp = config.jsonp,
        simulated_lag_ms = config.simulated_lag.as_millis() as u64,
        "Configuration"
    );
}
