//! HTTP front end.
//!
//! Accepts connections with hyper and dispatches each request either to the
//! upstream or to the mock engine, after the configured lag.

use crate::config::{Config, ConfigStore};
use crate::docs;
use crate::document::MockResponse;
use crate::proxy;
use crate::resolver::{is_traversal, parse_query_string, resolve_with, RequestDescriptor};
use crate::template::{RenderMode, TemplateRenderer};
use crate::upstream::Upstream;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use regex::Regex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Directory below the mock root holding `@static` assets.
pub const STATIC_DIR: &str = "_static";

/// Path of the documentation listing.
pub const DOCUMENTATION_PATH: &str = "/_documentation";

const DEFAULT_CONTENT_TYPE: &str = "application/json";
const JSONP_CONTENT_TYPE: &str = "application/javascript";

static CALLBACK_REGEX: OnceLock<Regex> = OnceLock::new();

fn callback_regex() -> &'static Regex {
    CALLBACK_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*(\.[A-Za-z_$][A-Za-z0-9_$]*)*$")
            .expect("callback regex is valid")
    })
}

/// The mock server: config, resolution, rendering and dispatch.
pub struct MockServer {
    store: Arc<ConfigStore>,
    renderer: Arc<TemplateRenderer>,
    upstream: Arc<dyn Upstream>,
    root: PathBuf,
}

impl MockServer {
    /// Server for mocks below `root`, forwarding proxied calls to `upstream`.
    pub fn new(store: Arc<ConfigStore>, root: impl Into<PathBuf>, upstream: Arc<dyn Upstream>) -> Self {
        let root = root.into();
        Self {
            renderer: Arc::new(TemplateRenderer::new(Arc::clone(&store), &root)),
            store,
            upstream,
            root,
        }
    }

    /// Bind `addr` and serve until the listener fails.
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            root = %self.root.display(),
            config = %self.store.path().display(),
            "Mock server listening"
        );

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });

                // Dropping the service future on disconnect cancels any pending lag.
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(remote = %remote_addr, error = %err, "Connection closed with error");
                }
            });
        }
    }

    /// Answer one request.
    ///
    /// The whole request sees the config snapshot taken on entry. CORS
    /// handling belongs to the mock side; proxied calls, preflights included,
    /// get the upstream's answer untouched.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let config = self.store.get();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if path == DOCUMENTATION_PATH || path.starts_with("/_documentation/") {
            let mut response = self.documentation(&config).await;
            if config.cors {
                add_cors_headers(response.headers_mut());
            }
            return response;
        }

        let decision = proxy::decide(&config, &path, method.as_str());
        info!(
            method = %method,
            path = %path,
            proxy = decision.should_proxy,
            lag_ms = decision.lag.as_millis() as u64,
            "Request"
        );

        if !decision.lag.is_zero() {
            tokio::time::sleep(decision.lag).await;
        }

        if decision.should_proxy {
            return self.forward(&config, req).await;
        }

        let mut response = if config.cors && method == Method::OPTIONS {
            empty_response(StatusCode::OK)
        } else {
            self.mock(&config, req).await
        };
        if config.cors {
            add_cors_headers(response.headers_mut());
        }
        response
    }

    async fn forward<B>(&self, config: &Config, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let Some(server) = config.proxy.as_ref().and_then(|p| p.server.clone()) else {
            error!(path = %req.uri().path(), "Proxy requested but no upstream server configured");
            return error_response(StatusCode::BAD_GATEWAY, "no upstream server configured");
        };

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };

        match self.upstream.forward(&server, Request::from_parts(parts, body)).await {
            Ok(response) => response.map(Full::new),
            Err(e) => {
                error!(server = %server, error = %e, "Failed to forward request to upstream");
                error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    async fn mock<B>(&self, config: &Arc<Config>, req: Request<B>) -> Response<Full<Bytes>> {
        let request = descriptor(&req);
        let location = resolve_with(config, &self.root, &request.method, &request.path);

        if !location.is_present() {
            debug!(file = %location.file_path.display(), "No mock file, trying static");
            return self.static_file(&request.path).await;
        }

        info!(file = %location.file_path.display(), "Serving mock");

        let renderer = Arc::clone(&self.renderer);
        let snapshot = Arc::clone(config);
        let file = location.file_path.clone();
        let params = location.params.clone();
        let for_render = request.clone();
        let rendered = tokio::task::spawn_blocking(move || {
            renderer.render_for(&snapshot, &file, &for_render, &params, RenderMode::Response)
        })
        .await;

        let doc = match rendered {
            Ok(Ok(doc)) => doc,
            Ok(Err(e)) if e.is_not_found() => return empty_response(StatusCode::NOT_FOUND),
            Ok(Err(e)) => {
                error!(file = %location.file_path.display(), error = %e, "Failed to render mock");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
            Err(e) => {
                error!(error = %e, "Render task failed");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "render failed");
            }
        };

        self.mock_response(config, &request, doc.response).await
    }

    async fn mock_response(
        &self,
        config: &Config,
        request: &RequestDescriptor,
        mut mock: MockResponse,
    ) -> Response<Full<Bytes>> {
        if mock.header(CACHE_CONTROL.as_str()).is_none() {
            mock.set_header(CACHE_CONTROL.as_str(), "no-cache");
        }
        let status = StatusCode::from_u16(mock.status).unwrap_or(StatusCode::OK);

        if let Some(asset) = mock.static_asset.take() {
            let path = self.root.join(STATIC_DIR).join(&asset);
            if is_traversal(&asset) {
                warn!(asset = %asset, "Rejecting static asset outside the static directory");
                return empty_response(StatusCode::NOT_FOUND);
            }
            return match tokio::fs::read(&path).await {
                Ok(content) => {
                    if mock.header(CONTENT_TYPE.as_str()).is_none() {
                        mock.set_header(CONTENT_TYPE.as_str(), &content_type_for(&path));
                    }
                    build_response(status, &mock.headers, Bytes::from(content))
                }
                Err(e) => {
                    warn!(asset = %path.display(), error = %e, "Static asset not found");
                    empty_response(StatusCode::NOT_FOUND)
                }
            };
        }

        let mut body = std::mem::take(&mut mock.body);
        if config.jsonp {
            if let Some(callback) = jsonp_callback(request) {
                body = wrap_jsonp(callback, &body);
                if mock.header(CONTENT_TYPE.as_str()).is_none() {
                    mock.set_header(CONTENT_TYPE.as_str(), JSONP_CONTENT_TYPE);
                }
            }
        }
        if mock.header(CONTENT_TYPE.as_str()).is_none() {
            mock.set_header(CONTENT_TYPE.as_str(), DEFAULT_CONTENT_TYPE);
        }

        build_response(status, &mock.headers, Bytes::from(body))
    }

    async fn static_file(&self, request_path: &str) -> Response<Full<Bytes>> {
        if is_traversal(request_path) {
            return empty_response(StatusCode::NOT_FOUND);
        }
        let path = self.root.join(request_path.trim_start_matches('/'));
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => match tokio::fs::read(&path).await {
                Ok(content) => {
                    let headers = vec![(CONTENT_TYPE.to_string(), content_type_for(&path))];
                    build_response(StatusCode::OK, &headers, Bytes::from(content))
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Failed to read static file");
                    empty_response(StatusCode::NOT_FOUND)
                }
            },
            _ => empty_response(StatusCode::NOT_FOUND),
        }
    }

    async fn documentation(&self, config: &Arc<Config>) -> Response<Full<Bytes>> {
        let config = Arc::clone(config);
        let renderer = Arc::clone(&self.renderer);
        let root = self.root.clone();

        let calls = tokio::task::spawn_blocking(move || docs::collect(&config, &root, &renderer)).await;
        match calls.map(|calls| serde_json::to_vec_pretty(&calls)) {
            Ok(Ok(json)) => {
                let headers = vec![(CONTENT_TYPE.to_string(), DEFAULT_CONTENT_TYPE.to_string())];
                build_response(StatusCode::OK, &headers, Bytes::from(json))
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to serialize documentation");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "documentation failed")
            }
            Err(e) => {
                error!(error = %e, "Documentation task failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "documentation failed")
            }
        }
    }
}

fn descriptor<B>(req: &Request<B>) -> RequestDescriptor {
    RequestDescriptor {
        method: req.method().as_str().to_string(),
        path: req.uri().path().to_string(),
        query: parse_query_string(req.uri().query().unwrap_or("")),
        headers: req
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
            .collect(),
    }
}

fn jsonp_callback(request: &RequestDescriptor) -> Option<&str> {
    let name = request
        .query
        .get("callback")
        .or_else(|| request.query.get("jsonp"))?;
    if callback_regex().is_match(name) {
        Some(name.as_str())
    } else {
        warn!(callback = %name, "Ignoring invalid JSONP callback name");
        None
    }
}

/// `name(body);`, with JSON bodies re-serialized compactly.
fn wrap_jsonp(callback: &str, body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) => format!("{}({});", callback, json),
        Err(_) => format!("{}({});", callback, body),
    }
}

fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,PUT,POST,DELETE"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

fn build_response(status: StatusCode, headers: &[(String, String)], body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;

    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid response header"),
        }
    }
    response
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    let headers = vec![(CONTENT_TYPE.to_string(), DEFAULT_CONTENT_TYPE.to_string())];
    build_response(status, &headers, Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingUpstream {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl Upstream for RecordingUpstream {
        async fn forward(
            &self,
            server: &str,
            request: Request<Bytes>,
        ) -> Result<Response<Bytes>, UpstreamError> {
            let body = String::from_utf8_lossy(request.body()).to_string();
            self.calls.lock().unwrap().push((
                server.to_string(),
                request.uri().to_string(),
                body,
            ));
            let mut response = Response::new(Bytes::from_static(b"from upstream"));
            *response.status_mut() = StatusCode::ACCEPTED;
            response.headers_mut().insert(
                "access-control-allow-origin",
                HeaderValue::from_static("https://app.example"),
            );
            Ok(response)
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        upstream: Arc<RecordingUpstream>,
        server: MockServer,
    }

    impl Fixture {
        fn new(config: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("config.json"), config).unwrap();
            for sub in ["_templates", STATIC_DIR, "users"] {
                fs::create_dir(dir.path().join(sub)).unwrap();
            }
            let store = Arc::new(ConfigStore::new(dir.path().join("config.json")));
            let upstream = Arc::new(RecordingUpstream::default());
            let server = MockServer::new(store, dir.path(), upstream.clone());
            Self { dir, upstream, server }
        }

        fn write(&self, name: &str, content: &str) {
            fs::write(self.dir.path().join(name), content).unwrap();
        }

        async fn call(&self, method: &str, uri: &str) -> (StatusCode, HeaderMap, String) {
            self.call_with_body(method, uri, "").await
        }

        async fn call_with_body(&self, method: &str, uri: &str, body: &str) -> (StatusCode, HeaderMap, String) {
            let req = Request::builder()
                .method(method)
                .uri(uri)
                .header("x-client", "tests")
                .body(Full::new(Bytes::from(body.to_string())))
                .unwrap();
            let response = self.server.handle(req).await;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            (status, headers, String::from_utf8(body.to_vec()).unwrap())
        }
    }

    #[tokio::test]
    async fn test_serves_rendered_mock() {
        let fx = Fixture::new(r#"{ "routes": ["/users/:id:num"] }"#);
        fx.write(
            "users/id_get.json",
            "# A user\n< @status 201\n< @header X-Test: abc\n{\"id\": {{params.id}}, \"q\": \"{{query.q}}\", \"c\": \"{{headers.x-client}}\" }\n",
        );

        let (status, headers, body) = fx.call("GET", "/users/42?q=hi").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers["x-test"], "abc");
        assert_eq!(headers["cache-control"], "no-cache");
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(body, r#"{"id": 42, "q": "hi", "c": "tests" }"#);
    }

    #[tokio::test]
    async fn test_directive_cache_control_wins() {
        let fx = Fixture::new("{}");
        fx.write("cached_get.json", "< @header Cache-Control: max-age=60\n{}");

        let (_, headers, _) = fx.call("GET", "/cached").await;
        assert_eq!(headers["cache-control"], "max-age=60");
        assert_eq!(headers.get_all("cache-control").iter().count(), 1);
    }

    #[tokio::test]
    async fn test_json_suffix_and_method_select_file() {
        let fx = Fixture::new("{}");
        fx.write("items_post.json", "created");
        fx.write("items_get.json", "listed");

        assert_eq!(fx.call("POST", "/items.json").await.2, "created");
        assert_eq!(fx.call("GET", "/items").await.2, "listed");
        assert_eq!(fx.call("DELETE", "/items").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_miss_falls_back_to_static_then_404() {
        let fx = Fixture::new("{}");
        fx.write("index.html", "<h1>hi</h1>");

        let (status, headers, body) = fx.call("GET", "/index.html").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "text/html");
        assert_eq!(body, "<h1>hi</h1>");

        assert_eq!(fx.call("GET", "/missing").await.0, StatusCode::NOT_FOUND);
        assert_eq!(fx.call("GET", "/users").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traversal_is_not_served() {
        let fx = Fixture::new("{}");
        let (status, _, _) = fx.call("GET", "/users/../config.json").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_asset_directive() {
        let fx = Fixture::new("{}");
        fx.write("_static/logo.png", "PNG");
        fx.write("logo_get.json", "< @status 203\n< @static logo.png\nignored body");
        fx.write("gone_get.json", "< @static nothing.png\n");

        let (status, headers, body) = fx.call("GET", "/logo").await;
        assert_eq!(status, StatusCode::NON_AUTHORITATIVE_INFORMATION);
        assert_eq!(headers["content-type"], "image/png");
        assert_eq!(headers["cache-control"], "no-cache");
        assert_eq!(body, "PNG");

        assert_eq!(fx.call("GET", "/gone").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors() {
        let fx = Fixture::new(r#"{ "cors": true }"#);
        fx.write("thing_get.json", "{}");

        let (status, headers, body) = fx.call("OPTIONS", "/thing").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(headers["access-control-allow-origin"], "*");

        let (_, headers, _) = fx.call("GET", "/thing").await;
        assert_eq!(headers["access-control-allow-methods"], "GET,PUT,POST,DELETE");
        assert_eq!(headers["access-control-allow-headers"], "Content-Type, Authorization");
    }

    #[tokio::test]
    async fn test_no_cors_headers_when_disabled() {
        let fx = Fixture::new("{}");
        fx.write("thing_get.json", "{}");
        let (_, headers, _) = fx.call("GET", "/thing").await;
        assert!(!headers.contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_jsonp() {
        let fx = Fixture::new(r#"{ "jsonp": true }"#);
        fx.write("data_get.json", "{ \"a\": [1, 2] }\n");

        let (_, headers, body) = fx.call("GET", "/data?callback=handle").await;
        assert_eq!(headers["content-type"], "application/javascript");
        assert_eq!(body, r#"handle({"a":[1,2]});"#);

        let (_, _, body) = fx.call("GET", "/data?jsonp=ns.cb").await;
        assert_eq!(body, r#"ns.cb({"a":[1,2]});"#);

        let (_, headers, body) = fx.call("GET", "/data?callback=alert(1)").await;
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(body, "{ \"a\": [1, 2] }");

        let (_, _, body) = fx.call("GET", "/data").await;
        assert_eq!(body, "{ \"a\": [1, 2] }");
    }

    #[tokio::test]
    async fn test_jsonp_disabled_ignores_callback() {
        let fx = Fixture::new("{}");
        fx.write("data_get.json", "[1]");
        let (_, _, body) = fx.call("GET", "/data?callback=cb").await;
        assert_eq!(body, "[1]");
    }

    #[tokio::test]
    async fn test_proxied_call_reaches_upstream() {
        let fx = Fixture::new(
            r#"{ "proxy": { "server": "http://api.test", "calls": { "/login": { "post": true } } } }"#,
        );
        fx.write("login_get.json", "mocked");

        let (status, _, body) = fx.call_with_body("POST", "/login?x=1", "secret").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, "from upstream");

        let (_, _, body) = fx.call("GET", "/login").await;
        assert_eq!(body, "mocked");

        let calls = fx.upstream.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "http://api.test");
        assert_eq!(calls[0].1, "/login?x=1");
        assert_eq!(calls[0].2, "secret");
    }

    #[tokio::test]
    async fn test_proxy_without_server_is_bad_gateway() {
        let fx = Fixture::new(r#"{ "proxy": { "default": true } }"#);
        let (status, _, body) = fx.call("GET", "/anything").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.contains("no upstream server"));
        assert!(fx.upstream.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_lag_applies_to_proxied_calls() {
        let fx = Fixture::new(
            r#"{ "simulated-lag": 300, "proxy": { "default": true, "server": "http://api.test" } }"#,
        );

        let start = tokio::time::Instant::now();
        let (status, _, _) = fx.call("GET", "/slow").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_does_not_serialize_requests() {
        let fx = Fixture::new(
            r#"{ "simulated-lag": 1000, "proxy": { "default": true, "server": "http://api.test" } }"#,
        );

        let start = tokio::time::Instant::now();
        let (a, b) = tokio::join!(fx.call("GET", "/a"), fx.call("GET", "/b"));
        assert_eq!(a.0, StatusCode::ACCEPTED);
        assert_eq!(b.0, StatusCode::ACCEPTED);
        assert!(start.elapsed() < Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_lag_applies_to_mocked_calls() {
        let fx = Fixture::new(r#"{ "simulated-lag": 400 }"#);
        fx.write("slow_get.json", "{}");

        let start = tokio::time::Instant::now();
        let (status, _, _) = fx.call("GET", "/slow").await;
        assert_eq!(status, StatusCode::OK);
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_never_reaches_upstream() {
        let fx = Fixture::new(
            r#"{ "simulated-lag": 1000, "proxy": { "default": true, "server": "http://api.test" } }"#,
        );

        let result = tokio::time::timeout(Duration::from_millis(500), fx.call("GET", "/slow")).await;
        assert!(result.is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(fx.upstream.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preflight_on_proxied_path_goes_upstream() {
        let fx = Fixture::new(
            r#"{ "cors": true, "simulated-lag": 500,
                 "proxy": { "server": "http://api.test", "calls": { "/login": true } } }"#,
        );

        let start = tokio::time::Instant::now();
        let (status, headers, _) = fx.call("OPTIONS", "/login").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(fx.upstream.calls.lock().unwrap().len(), 1);
        assert_eq!(headers["access-control-allow-origin"], "https://app.example");

        let (_, headers, _) = fx.call("GET", "/login").await;
        assert_eq!(headers["access-control-allow-origin"], "https://app.example");
        assert!(!headers.contains_key("access-control-allow-methods"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_uses_config_snapshot_taken_on_entry() {
        let fx = Fixture::new(r#"{ "simulated-lag": 3000, "variables": { "who": "old" } }"#);
        fx.write("who_get.json", "{{vars.who}}");

        let (response, _) = tokio::join!(fx.call("GET", "/who"), async {
            fx.write("config.json", r#"{ "variables": { "who": "new" } }"#);
        });
        assert_eq!(response.2, "old");

        let (_, _, body) = fx.call("GET", "/who").await;
        assert_eq!(body, "new");
    }

    #[tokio::test]
    async fn test_strict_directive_error_is_server_error() {
        let fx = Fixture::new(r#"{ "validation": "strict" }"#);
        fx.write("bad_get.json", "< @status teapot\n{}");
        let (status, _, body) = fx.call("GET", "/bad").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("malformed directive"));
    }

    #[tokio::test]
    async fn test_documentation_listing() {
        let fx = Fixture::new(r#"{ "routes": ["/users/:id"] }"#);
        fx.write("users/id_get.json", "# Fetch a user\n{\"id\": {{params.id}} }");

        let (status, headers, body) = fx.call("GET", "/_documentation/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "application/json");

        let calls: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(calls[0]["method"], "GET");
        assert_eq!(calls[0]["path"], "/users/:id");
        assert_eq!(calls[0]["description"][0], "Fetch a user");
        assert_eq!(calls[0]["response"], "{\"id\": 1 }");
    }

    #[test]
    fn test_wrap_jsonp() {
        assert_eq!(wrap_jsonp("cb", "{\n  \"a\": 1\n}"), r#"cb({"a":1});"#);
        assert_eq!(wrap_jsonp("cb", "not json"), "cb(not json);");
    }

    #[test]
    fn test_invalid_header_is_skipped() {
        let headers = vec![
            ("X-Ok".to_string(), "1".to_string()),
            ("X-Bad".to_string(), "line\nbreak".to_string()),
        ];
        let response = build_response(StatusCode::OK, &headers, Bytes::new());
        assert_eq!(response.headers().len(), 1);
        assert_eq!(response.headers()["x-ok"], "1");
    }

    #[test]
    fn test_error_response_is_json() {
        let response = error_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        tokio_test::block_on(async {
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], br#"{"error":"Bad Gateway"}"#);
        });
    }
}
