//! Forwarding to the real upstream API.

use crate::error::UpstreamError;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName};
use hyper::{Request, Response};
use std::time::Duration;
use tracing::debug;

/// Headers that describe a single connection and are not forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Destination for proxied calls.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` to `server` (a base url) and return its response.
    async fn forward(
        &self,
        server: &str,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, UpstreamError>;
}

/// [`Upstream`] backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(
        &self,
        server: &str,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, UpstreamError> {
        let url = upstream_url(server, &request)?;
        let (parts, body) = request.into_parts();

        debug!(method = %parts.method, url = %url, "Forwarding to upstream");

        let response = self
            .client
            .request(parts.method, url)
            .headers(forwardable(&parts.headers, &["host"]))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let headers = forwardable(response.headers(), &[]);
        let body = response.bytes().await?;

        let mut out = Response::new(body);
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

/// Join the upstream base url with the request's path and query.
pub fn upstream_url(server: &str, request: &Request<Bytes>) -> Result<reqwest::Url, UpstreamError> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let raw = format!("{}{}", server.trim_end_matches('/'), path_and_query);

    let url = reqwest::Url::parse(&raw).map_err(|e| UpstreamError::InvalidUrl {
        url: raw.clone(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(UpstreamError::InvalidUrl {
            url: raw,
            reason: "scheme must be http or https".to_string(),
        });
    }
    Ok(url)
}

fn forwardable(headers: &HeaderMap, extra: &[&str]) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_excluded(name, extra))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn is_excluded(name: &HeaderName, extra: &[&str]) -> bool {
    let name = name.as_str();
    HOP_BY_HOP.contains(&name) || extra.contains(&name)
}
