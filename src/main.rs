//! Mock Proxy Server - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use mock_proxy_server::config::log_summary;
use mock_proxy_server::{Config, ConfigStore, HttpUpstream, MockServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-proxy-server",
    about = "File-backed mock API server with selective proxying to a real upstream",
    version
)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: std::net::IpAddr,

    /// Root directory holding the mock files
    #[arg(long, default_value = ".")]
    path: PathBuf,

    /// Configuration file (defaults to <path>/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Timeout for proxied requests, in seconds
    #[arg(long, default_value_t = 30)]
    upstream_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.path.join("config.json"));

    // Validate and exit if requested
    if args.validate {
        let config = Config::validate_file(&config_path)
            .with_context(|| format!("invalid configuration {}", config_path.display()))?;
        println!(
            "Configuration is valid ({} routes, {} proxy rules)",
            config.routes.len(),
            config.proxy.as_ref().map_or(0, |p| p.calls.len())
        );
        return Ok(());
    }

    if !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, mocking every call");
    }
    let store = Arc::new(ConfigStore::new(config_path));
    log_summary(&store.get());

    let upstream = HttpUpstream::new(Duration::from_secs(args.upstream_timeout))
        .context("failed to build upstream client")?;
    let server = Arc::new(MockServer::new(store, args.path, Arc::new(upstream)));

    let addr = SocketAddr::new(args.host, args.port);
    tokio::select! {
        result = server.run(addr) => result.with_context(|| format!("server on {} failed", addr))?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
