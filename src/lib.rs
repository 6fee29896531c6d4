//! Mock Proxy Server
//!
//! A file-backed mock HTTP API server. Each request is answered from a mock
//! file on disk or forwarded to a real upstream, per the proxy policy in
//! `config.json`.
//!
//! # Features
//!
//! - **File Mocks**: `GET /users` is answered by `<root>/users_get.json`
//! - **Routes**: `/users/:id:num` maps many paths onto one mock file
//! - **Templates**: Handlebars with `params`, `query`, `headers`, `vars` and
//!   `{{load "name"}}` for shared fragments in `_templates/`
//! - **Directives**: `< @status`, `< @header` and `< @static` lines in mocks
//! - **Proxying**: Forward selected calls to the real API
//! - **Latency Simulation**: Fixed delay before every response
//! - **Hot Reload**: The config is re-read at most every two seconds
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "routes": ["/users/:id:num", "/files/:path:any"],
//!   "proxy": {
//!     "server": "https://api.example.com",
//!     "default": false,
//!     "calls": { "/login": true, "/items": { "post": true } }
//!   },
//!   "variables": { "host": "localhost" },
//!   "cors": true,
//!   "jsonp": false,
//!   "simulated-lag": 150
//! }
//! ```

pub mod config;
pub mod docs;
pub mod document;
pub mod error;
pub mod matcher;
pub mod proxy;
pub mod resolver;
pub mod server;
pub mod template;
pub mod upstream;

pub use config::{Config, ConfigStore, ValidationPolicy};
pub use error::{ConfigError, RenderError, RouteCompileError, UpstreamError};
pub use server::MockServer;
pub use upstream::{HttpUpstream, Upstream};
