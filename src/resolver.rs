//! Request resolution.
//!
//! Maps a request to the mock file that answers it. Configured routes are
//! tried in declaration order and the first match wins; without a match the
//! request path itself names the file.

use crate::config::{Config, ConfigStore};
use crate::matcher::RouteSpec;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Suffix stripped from request paths before matching.
const API_SUFFIX: &str = ".json";

/// Extension of mock files on disk.
const MOCK_EXTENSION: &str = "json";

/// An inbound request, reduced to what resolution and rendering need.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
}

impl RequestDescriptor {
    /// Build a descriptor from request parts.
    pub fn new(method: &str, path: &str, query_string: Option<&str>) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: parse_query_string(query_string.unwrap_or("")),
            headers: HashMap::new(),
        }
    }

    /// Attach headers; names are lower-cased.
    pub fn with_headers<'a>(mut self, headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        self.headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect();
        self
    }
}

/// Where a request's mock lives.
#[derive(Debug, Clone)]
pub struct ResolvedLocation {
    /// Concrete mock file, e.g. `<root>/users/id_get.json`
    pub file_path: PathBuf,
    /// Route that matched, if any
    pub matched_route: Option<RouteSpec>,
    /// Parameters extracted by the matched route
    pub params: HashMap<String, String>,
    escapes_root: bool,
}

impl ResolvedLocation {
    /// Whether the mock file exists; a miss falls back to static serving.
    pub fn is_present(&self) -> bool {
        !self.escapes_root && self.file_path.is_file()
    }
}

/// Resolves requests against the routes of the current config.
#[derive(Debug, Clone)]
pub struct Resolver {
    store: Arc<ConfigStore>,
    root: PathBuf,
}

impl Resolver {
    pub fn new(store: Arc<ConfigStore>, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    /// Root directory holding the mock files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a request against the current config.
    pub fn resolve(&self, request: &RequestDescriptor) -> ResolvedLocation {
        let config = self.store.get();
        resolve_with(&config, &self.root, &request.method, &request.path)
    }
}

/// Resolve `method` and `path` against `config`, relative to `root`.
pub fn resolve_with(config: &Config, root: &Path, method: &str, path: &str) -> ResolvedLocation {
    let path = path.strip_suffix(API_SUFFIX).unwrap_or(path);

    let mut base = path;
    let mut matched_route = None;
    let mut params = HashMap::new();

    for route in &config.routes {
        if let Some(captured) = route.captures(path) {
            trace!(route = %route.raw_pattern, path, "Route matched");
            base = &route.file_path_template;
            params = captured;
            matched_route = Some(route.clone());
            break;
        }
    }

    ResolvedLocation {
        file_path: mock_file_path(root, base, method),
        matched_route,
        params,
        escapes_root: is_traversal(path),
    }
}

/// `<root><base>_<method>.json`.
fn mock_file_path(root: &Path, base: &str, method: &str) -> PathBuf {
    let mut file: OsString = root.join(base.trim_start_matches('/')).into_os_string();
    file.push(format!("_{}.{}", method.to_lowercase(), MOCK_EXTENSION));
    PathBuf::from(file)
}

/// Whether a request path tries to leave the mock root.
pub fn is_traversal(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

/// Parse a query string into key-value pairs.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(s: &str) -> String {
    let s = s.replace('+', " ");
    let decoded = urlencoding::decode(&s).map(|d| d.into_owned());
    decoded.unwrap_or(s)
}
