//! Error types for the proxy core
//!
//! Every error that can terminate a proxied request is a variant here, and the
//! mapping from variant to HTTP status and body text lives in one place
//! (`proxy`).

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Failure to verify or decode a signed URL
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("digest is not valid {0}")]
    Digest(&'static str),
    #[error("url payload is not valid {0}")]
    Payload(&'static str),
    #[error("signature mismatch")]
    Mismatch,
    #[error("decoded url is not valid utf-8")]
    Utf8,
}

/// Failure to build the HMAC signer
#[derive(Debug, Error)]
#[error("invalid hmac key length")]
pub struct InvalidKey;

/// Rule parse failures and hostname normalization failures in the matching engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("bad rule format: {0:?}")]
    Format(String),
    #[error("bad host pattern {pattern:?}: {reason}")]
    Host { pattern: String, reason: &'static str },
    #[error("bad path pattern {pattern:?}: {reason}")]
    Path { pattern: String, reason: &'static str },
    #[error("hostname {0:?} failed idna normalization")]
    Idna(String),
}

/// URL legality failures
///
/// The display strings are returned verbatim to clients.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error("Bad url scheme")]
    Scheme,
    #[error("Bad url host")]
    Host,
    #[error("Userinfo URL rejected")]
    UserInfo,
    #[error("Denylist host failure")]
    Denylist,
    #[error("Rejected due to filter-ruleset")]
    Filtered,
}

/// Failures raised by the dial-time connector
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("upstream uri has no host")]
    MissingHost,
    #[error("ip address {0} is denied")]
    Denied(IpAddr),
    #[error("dns lookup for {host} failed: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("dns lookup for {0} returned no addresses")]
    NoAddresses(String),
    #[error("connect timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    Io(#[from] io::Error),
    #[error("upstream proxy handshake failed: {0}")]
    ProxyHandshake(String),
}

/// Failures while fetching the upstream resource
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("bad redirect: {0}")]
    BadRedirect(String),
    #[error("upstream request timed out")]
    Timeout,
    #[error("failed to build upstream request: {0}")]
    Build(#[from] axum::http::Error),
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
}

/// Media type parse failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaTypeError {
    #[error("no media type")]
    Empty,
    #[error("expected slash after first token")]
    MissingSlash,
    #[error("expected token after slash")]
    MissingSubtype,
    #[error("invalid media type token")]
    InvalidToken,
    #[error("invalid media parameter")]
    InvalidParameter,
    #[error("duplicate parameter name {0:?}")]
    DuplicateParameter(String),
}

/// Invalid proxy construction settings
#[derive(Debug, Error)]
pub enum ProxyConfigError {
    #[error("hmac key is required")]
    MissingKey,
    #[error(transparent)]
    Key(#[from] InvalidKey),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error("invalid header value for {name}: {value:?}")]
    Header { name: String, value: String },
    #[error("tls client configuration: {0}")]
    Tls(#[from] rustls::Error),
}
