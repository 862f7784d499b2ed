//! camo-proxy - HMAC-signed media reverse proxy
//!
//! Serves images (and optionally video and audio) from third-party URLs
//! embedded in signed request paths:
//! - Verifies HMAC-SHA1 signatures over hex or base64 encoded target URLs
//! - Refuses loopback, private and otherwise internal destinations, both
//!   before the request and again when dialing
//! - Applies operator allow/deny rules over hostnames and paths
//! - Streams responses with a size ceiling and strict content-type checks

pub mod body;
pub mod config;
pub mod connector;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod htrie;
pub mod http_listener;
pub mod media_type;
pub mod metrics;
pub mod proxy;
pub mod security;
pub mod stats;
pub mod upstream_proxy;

// Re-export commonly used types
pub use config::Config;
pub use encoding::{decode_url, encode_url, Codec, UrlSigner};
pub use error::{CheckError, DecodeError, ProxyConfigError, RuleError};
pub use filter::{FilterChain, UrlFilter};
pub use http_listener::{build_router, run_http_listener, run_https_listener, AppState};
pub use metrics::ProxyMetrics;
pub use proxy::{CamoProxy, ProxySettings};
pub use stats::{MetricsCollector, ProxyStats};
pub use upstream_proxy::UpstreamProxy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
