//! camo-proxy - HMAC-signed media reverse proxy
//!
//! Loads configuration from a TOML file, applies command line overrides and
//! serves signed media URLs over HTTP and optionally HTTPS.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures_util::future::join_all;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use camo_proxy::config::Config;
use camo_proxy::http_listener::{build_router, run_http_listener, run_https_listener, AppState};
use camo_proxy::metrics::ProxyMetrics;
use camo_proxy::proxy::CamoProxy;
use camo_proxy::stats::{MetricsCollector, ProxyStats};

/// camo-proxy - HMAC-signed media reverse proxy
#[derive(Parser, Debug)]
#[command(name = "camo-proxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CAMO_CONFIG")]
    config: Option<PathBuf>,

    /// HMAC key used to verify signed URLs
    #[arg(short, long, env = "CAMO_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Plain HTTP listen address (empty string disables)
    #[arg(long, env = "CAMO_LISTEN")]
    listen: Option<String>,

    /// TLS listen address
    #[arg(long, env = "CAMO_SSL_LISTEN")]
    ssl_listen: Option<String>,

    /// PEM certificate chain for the TLS listener
    #[arg(long, env = "CAMO_SSL_CERT")]
    ssl_cert: Option<PathBuf>,

    /// PEM private key for the TLS listener
    #[arg(long, env = "CAMO_SSL_KEY")]
    ssl_key: Option<PathBuf>,

    /// Extra response header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Maximum response size in KB (0 for unlimited)
    #[arg(long, env = "CAMO_MAX_SIZE")]
    max_size: Option<u64>,

    /// Upstream request timeout in milliseconds
    #[arg(long, env = "CAMO_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Maximum redirects followed per request
    #[arg(long, env = "CAMO_MAX_REDIRECTS")]
    max_redirects: Option<usize>,

    /// Enable the /status endpoint
    #[arg(long)]
    stats: bool,

    /// Enable the /metrics endpoint
    #[arg(long)]
    metrics: bool,

    /// Also proxy video/* content
    #[arg(long)]
    allow_content_video: bool,

    /// Also proxy audio/* content
    #[arg(long)]
    allow_content_audio: bool,

    /// Allow target URLs with embedded credentials
    #[arg(long)]
    allow_credential_urls: bool,

    /// Send X-Forwarded-For upstream
    #[arg(long = "enable-xfwd4")]
    enable_xfwd_for: bool,

    /// Disable front-end keep-alives
    #[arg(long = "no-fk")]
    no_frontend_keepalive: bool,

    /// Disable back-end keep-alives
    #[arg(long = "no-bk")]
    no_backend_keepalive: bool,

    /// Allow/deny rule file
    #[arg(long, env = "CAMO_FILTER_RULESET")]
    filter_ruleset: Option<PathBuf>,

    /// Name used for Server, User-Agent and Via
    #[arg(long, env = "CAMO_SERVER_NAME")]
    server_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CAMO_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text or json)
    #[arg(long, env = "CAMO_LOG_FORMAT")]
    log_format: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    verbose: bool,

    /// Run configuration validation only (don't start server)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls CryptoProvider before any TLS operations
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    init_logging(&config.logging.level, config.logging.is_json())?;

    info!("Starting camo-proxy v{}", camo_proxy::VERSION);
    if let Some(path) = &args.config {
        info!("Configuration file: {:?}", path);
    }

    config.validate()?;
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    let config = Arc::new(config);
    run(config).await
}

/// Fold command line flags over the file configuration
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(key) = &args.key {
        config.proxy.hmac_key = Some(key.clone());
    }
    if let Some(listen) = &args.listen {
        config.server.listen = listen.clone();
    }
    if let Some(listen) = &args.ssl_listen {
        config.server.ssl_listen = listen.clone();
    }
    if let Some(cert) = &args.ssl_cert {
        config.server.ssl_cert = Some(cert.clone());
    }
    if let Some(key) = &args.ssl_key {
        config.server.ssl_key = Some(key.clone());
    }
    config.server.headers.extend(args.headers.iter().cloned());
    if let Some(name) = &args.server_name {
        config.server.server_name = name.clone();
    }
    if args.no_frontend_keepalive {
        config.server.disable_keepalives_fe = true;
    }

    if let Some(size) = args.max_size {
        config.proxy.max_size_kb = size;
    }
    if let Some(timeout) = args.timeout_ms {
        config.proxy.timeout_ms = timeout;
    }
    if let Some(redirects) = args.max_redirects {
        config.proxy.max_redirects = redirects;
    }
    if args.allow_content_video {
        config.proxy.allow_content_video = true;
    }
    if args.allow_content_audio {
        config.proxy.allow_content_audio = true;
    }
    if args.allow_credential_urls {
        config.proxy.allow_credential_urls = true;
    }
    if args.enable_xfwd_for {
        config.proxy.enable_xfwd_for = true;
    }
    if args.no_backend_keepalive {
        config.proxy.disable_keepalives_be = true;
    }
    if let Some(path) = &args.filter_ruleset {
        config.proxy.filter_ruleset = Some(path.clone());
    }

    if args.stats {
        config.metrics.stats = true;
    }
    if args.metrics {
        config.metrics.prometheus = true;
    }

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    if let Some(format) = &args.log_format {
        config.logging.format = format.clone();
    }
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let upstream = config.upstream_proxy().await;
    if upstream.has_proxy() {
        info!("Routing upstream requests through configured proxy");
    }
    let filters = config.filters()?;
    let filter_count = filters.len();

    let metrics = Arc::new(ProxyMetrics::new());
    let stats = config.metrics.stats.then(|| Arc::new(ProxyStats::new()));

    let mut proxy = CamoProxy::new(config.proxy_settings()?, upstream, filters)
        .context("failed to build proxy")?
        .with_metrics(metrics);
    if let Some(stats) = &stats {
        proxy = proxy.with_collector(stats.clone() as Arc<dyn MetricsCollector>);
    }

    let mut state = AppState::new(Arc::new(proxy))
        .with_metrics_endpoint(config.metrics.prometheus)
        .with_headers(config.server.response_headers())
        .with_connection_close(config.server.disable_keepalives_fe);
    if let Some(stats) = stats {
        state = state.with_stats(stats);
    }
    let app = build_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(2);
    let tls_handle = axum_server::Handle::new();
    let mut listeners = Vec::new();

    let listen = config.server.listen_addr()?;
    if let Some(addr) = listen {
        let app = app.clone();
        let fatal = fatal_tx.clone();
        let mut rx = shutdown_rx.clone();
        listeners.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(e) = run_http_listener(addr, app, shutdown).await {
                error!("HTTP listener error: {:#}", e);
                let _ = fatal.send(e).await;
            }
        }));
    }

    let ssl_listen = config.server.ssl_listen_addr()?;
    if let (Some(addr), Some(cert), Some(key)) = (
        ssl_listen,
        config.server.ssl_cert.clone(),
        config.server.ssl_key.clone(),
    ) {
        let app = app.clone();
        let fatal = fatal_tx.clone();
        let handle = tls_handle.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = run_https_listener(addr, &cert, &key, app, handle).await {
                error!("HTTPS listener error: {:#}", e);
                let _ = fatal.send(e).await;
            }
        }));
    }
    drop(fatal_tx);

    print_startup_summary(&config, filter_count);

    info!("Press Ctrl+C to shutdown gracefully");
    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
            Ok(())
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            Ok(())
        }
        Some(e) = fatal_rx.recv() => Err(e),
    };

    info!("Shutting down...");
    let grace = Duration::from_secs(config.server.graceful_shutdown_timeout_secs);
    let _ = shutdown_tx.send(true);
    tls_handle.graceful_shutdown(Some(grace));

    if tokio::time::timeout(grace, join_all(listeners)).await.is_err() {
        warn!("Listeners did not drain within {:?}", grace);
    }

    info!("camo-proxy shutdown complete");
    outcome
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()?;
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigquit) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) {
        (Ok(term), Ok(quit)) => (term, quit),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to install signal handlers: {}", e);
            return std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}

/// Print startup summary
fn print_startup_summary(config: &Config, filter_count: usize) {
    let enabled = |on: bool| if on { "✅ Yes" } else { "❌ No" };

    info!("═══════════════════════════════════════════════════════════════");
    info!("  camo-proxy v{}", camo_proxy::VERSION);
    info!("═══════════════════════════════════════════════════════════════");
    if !config.server.listen.is_empty() {
        info!("  HTTP:          {}", config.server.listen);
    }
    if !config.server.ssl_listen.is_empty() {
        info!("  HTTPS:         {}", config.server.ssl_listen);
    }
    info!("  Server name:   {}", config.server.server_name);
    info!("  Max size:      {} KB", config.proxy.max_size_kb);
    info!("  Timeout:       {} ms", config.proxy.timeout_ms);
    info!("  Max redirects: {}", config.proxy.max_redirects);
    info!("  Video:         {}", enabled(config.proxy.allow_content_video));
    info!("  Audio:         {}", enabled(config.proxy.allow_content_audio));
    info!("  Filters:       {} configured", filter_count);
    info!("  /status:       {}", enabled(config.metrics.stats));
    info!("  /metrics:      {}", enabled(config.metrics.prometheus));
    info!("═══════════════════════════════════════════════════════════════");
}
