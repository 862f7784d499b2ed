//! Configuration module with TOML parsing
//!
//! Values come from an optional TOML file, are overridden by command-line
//! flags and environment variables in `main`, validated once and then frozen.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderName, HeaderValue};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::filter::{load_rules_file, FilterChain};
use crate::proxy::ProxySettings;
use crate::upstream_proxy::UpstreamProxy;

/// Headers added to every response unless overridden
pub const DEFAULT_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (
        "content-security-policy",
        "default-src 'none'; img-src data:; style-src 'unsafe-inline'",
    ),
];

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain HTTP listen address (empty disables)
    pub listen: String,
    /// TLS listen address (empty disables)
    pub ssl_listen: String,
    /// PEM certificate chain for the TLS listener
    pub ssl_cert: Option<PathBuf>,
    /// PEM private key for the TLS listener
    pub ssl_key: Option<PathBuf>,
    /// Used for `Server`, `User-Agent` and `Via`
    pub server_name: String,
    /// Extra response headers, as `Name: value`
    pub headers: Vec<String>,
    /// Send `Connection: close` on every response
    pub disable_keepalives_fe: bool,
    /// Seconds to wait for in-flight requests on shutdown
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            ssl_listen: String::new(),
            ssl_cert: None,
            ssl_key: None,
            server_name: crate::NAME.to_string(),
            headers: Vec::new(),
            disable_keepalives_fe: false,
            graceful_shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        parse_addr("server.listen", &self.listen)
    }

    pub fn ssl_listen_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        parse_addr("server.ssl_listen", &self.ssl_listen)
    }

    /// Default security headers merged with the configured extras
    ///
    /// Malformed entries are skipped with a warning.
    pub fn response_headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut out: Vec<(HeaderName, HeaderValue)> = DEFAULT_HEADERS
            .iter()
            .map(|&(name, value)| {
                (
                    HeaderName::from_static(name),
                    HeaderValue::from_static(value),
                )
            })
            .collect();

        for entry in &self.headers {
            match parse_header(entry) {
                Some((name, value)) => {
                    out.retain(|(existing, _)| *existing != name);
                    out.push((name, value));
                }
                None => warn!("ignoring bad header: {:?}", entry),
            }
        }
        out
    }
}

fn parse_addr(field: &str, value: &str) -> anyhow::Result<Option<SocketAddr>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .with_context(|| format!("invalid {} address {:?}", field, value))
}

/// Parse a `Name: value` header entry
pub fn parse_header(entry: &str) -> Option<(HeaderName, HeaderValue)> {
    let (name, value) = entry.split_once(':')?;
    let (name, value) = (name.trim(), value.trim());
    if name.is_empty() || value.is_empty() {
        return None;
    }
    let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
    let value = HeaderValue::from_str(value).ok()?;
    Some((name, value))
}

/// Fetch pipeline configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// HMAC key; usually supplied through `CAMO_KEY` instead
    #[serde(skip_serializing)]
    pub hmac_key: Option<String>,
    /// Maximum response size in KiB, 0 for unlimited
    pub max_size_kb: u64,
    /// Upstream request timeout in milliseconds
    pub timeout_ms: u64,
    pub max_redirects: usize,
    pub allow_content_video: bool,
    pub allow_content_audio: bool,
    pub allow_credential_urls: bool,
    pub enable_xfwd_for: bool,
    pub disable_keepalives_be: bool,
    /// Rule file with `allow|` and `deny|` lines
    pub filter_ruleset: Option<PathBuf>,
    /// Networks exempted from the outbound address policy
    pub allowed_networks: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hmac_key: None,
            max_size_kb: 5120,
            timeout_ms: 4000,
            max_redirects: 3,
            allow_content_video: false,
            allow_content_audio: false,
            allow_credential_urls: false,
            enable_xfwd_for: false,
            disable_keepalives_be: false,
            filter_ruleset: None,
            allowed_networks: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("hmac_key", &self.hmac_key.as_ref().map(|_| "<redacted>"))
            .field("max_size_kb", &self.max_size_kb)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_redirects", &self.max_redirects)
            .field("allow_content_video", &self.allow_content_video)
            .field("allow_content_audio", &self.allow_content_audio)
            .field("allow_credential_urls", &self.allow_credential_urls)
            .field("enable_xfwd_for", &self.enable_xfwd_for)
            .field("disable_keepalives_be", &self.disable_keepalives_be)
            .field("filter_ruleset", &self.filter_ruleset)
            .field("allowed_networks", &self.allowed_networks)
            .finish()
    }
}

impl ProxyConfig {
    pub fn allowed_networks(&self) -> anyhow::Result<Vec<IpNet>> {
        self.allowed_networks
            .iter()
            .map(|net| {
                net.trim()
                    .parse::<IpNet>()
                    .with_context(|| format!("invalid allowed network {:?}", net))
            })
            .collect()
    }
}

/// Upstream forward proxy; unset fields fall back to the standard environment variables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl UpstreamConfig {
    pub fn is_configured(&self) -> bool {
        self.http_proxy.is_some() || self.https_proxy.is_some() || self.no_proxy.is_some()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: json or text
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Status and metrics endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve served-clients/bytes counters at `/status`
    pub stats: bool,
    /// Serve Prometheus metrics at `/metrics`
    pub prometheus: bool,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml(&content).with_context(|| format!("failed to parse config file {:?}", path))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.proxy.hmac_key.as_deref() {
            Some(key) if !key.is_empty() => {}
            _ => anyhow::bail!("HMAC key required (set --key or CAMO_KEY)"),
        }

        let listen = self.server.listen_addr()?;
        let ssl_listen = self.server.ssl_listen_addr()?;
        if listen.is_none() && ssl_listen.is_none() {
            anyhow::bail!("one of server.listen or server.ssl_listen is required");
        }
        if ssl_listen.is_some() {
            if self.server.ssl_cert.is_none() {
                anyhow::bail!("server.ssl_cert is required when ssl_listen is set");
            }
            if self.server.ssl_key.is_none() {
                anyhow::bail!("server.ssl_key is required when ssl_listen is set");
            }
        }

        HeaderValue::from_str(&self.server.server_name)
            .with_context(|| format!("invalid server name {:?}", self.server.server_name))?;
        if self.server.server_name.is_empty() {
            anyhow::bail!("server.server_name must not be empty");
        }

        if self.proxy.timeout_ms == 0 {
            anyhow::bail!("proxy.timeout_ms must be greater than zero");
        }
        self.proxy.allowed_networks()?;
        if !self.proxy.allowed_networks.is_empty() {
            warn!(
                "outbound address policy exempts {:?}",
                self.proxy.allowed_networks
            );
        }

        if let Some(path) = &self.proxy.filter_ruleset {
            if !path.exists() {
                anyhow::bail!("filter ruleset {:?} does not exist", path);
            }
        }

        match self.logging.format.to_ascii_lowercase().as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("unknown log format {:?} (expected json or text)", other),
        }

        Ok(())
    }

    /// Settings for [`crate::proxy::CamoProxy`]
    pub fn proxy_settings(&self) -> anyhow::Result<ProxySettings> {
        let key = self
            .proxy
            .hmac_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .context("HMAC key required")?;

        Ok(ProxySettings {
            hmac_key: key.as_bytes().to_vec(),
            max_size: self.proxy.max_size_kb.saturating_mul(1024),
            max_redirects: self.proxy.max_redirects,
            request_timeout: Duration::from_millis(self.proxy.timeout_ms),
            allow_video: self.proxy.allow_content_video,
            allow_audio: self.proxy.allow_content_audio,
            allow_credential_urls: self.proxy.allow_credential_urls,
            enable_xfwd_for: self.proxy.enable_xfwd_for,
            disable_keepalives_be: self.proxy.disable_keepalives_be,
            server_name: self.server.server_name.clone(),
            allowed_networks: self.proxy.allowed_networks()?,
        })
    }

    /// Upstream proxy from the config file, or from the environment
    pub async fn upstream_proxy(&self) -> UpstreamProxy {
        if self.upstream.is_configured() {
            UpstreamProxy::from_settings(
                self.upstream.http_proxy.as_deref(),
                self.upstream.https_proxy.as_deref(),
                self.upstream.no_proxy.as_deref(),
            )
            .await
        } else {
            UpstreamProxy::from_env().await
        }
    }

    /// URL filters from the configured rule file
    pub fn filters(&self) -> anyhow::Result<FilterChain> {
        match &self.proxy.filter_ruleset {
            Some(path) => Ok(load_rules_file(path)?.into_iter().collect()),
            None => Ok(FilterChain::new()),
        }
    }
}
