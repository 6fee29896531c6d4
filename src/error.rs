//! Error types shared across the mock engine.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to produce a [`Config`](crate::config::Config) from the backing file.
///
/// Never fatal at request time: the store logs it and serves an empty config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Route(#[from] RouteCompileError),

    #[error("proxy call entry for {path} must be a boolean or an object of booleans")]
    ProxyCall { path: String },
}

/// A route pattern that could not be compiled under the strict policy.
#[derive(Debug, Error)]
pub enum RouteCompileError {
    #[error("route {pattern}: unknown matcher kind '{kind}' for parameter '{param}'")]
    UnknownMatcher {
        pattern: String,
        param: String,
        kind: String,
    },

    #[error("route {pattern}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Failure to render a mock file.
///
/// Template expansion errors are not represented here; they degrade to the
/// raw file text.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to read mock file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed directive '{line}': {reason}")]
    Directive { line: String, reason: String },
}

impl RenderError {
    /// Whether the mock file itself was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RenderError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Failure to forward a request to the upstream server.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no upstream server configured")]
    NoServer,

    #[error("invalid upstream url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}
