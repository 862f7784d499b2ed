//! Upstream forward proxy settings
//!
//! Reads HTTP_PROXY / HTTPS_PROXY / NO_PROXY (or explicit settings), resolves
//! each proxy to its addresses once at startup, and answers two questions:
//! which proxy (if any) a target should be fetched through, and whether an
//! address is the proxy itself. The latter exempts the proxy, usually on a
//! private address, from the outbound address policy.

use std::net::IpAddr;

use axum::http::HeaderValue;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ipnet::IpNet;
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};
use url::{Host, Url};

/// Transport used to reach the upstream proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

impl ProxyScheme {
    fn from_url_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "socks5" => Some(Self::Socks5),
            _ => None,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
            Self::Socks5 => 1080,
        }
    }
}

/// A single configured proxy
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    credentials: Option<(String, String)>,
}

impl ProxyEndpoint {
    /// Parse a proxy setting, resolving its host
    ///
    /// Settings without a recognised scheme are read as `http://<setting>`.
    pub async fn parse(setting: &str) -> Result<Self, url::ParseError> {
        let url = match Url::parse(setting) {
            Ok(url) if ProxyScheme::from_url_scheme(url.scheme()).is_some() => url,
            _ => Url::parse(&format!("http://{}", setting))?,
        };
        let scheme = ProxyScheme::from_url_scheme(url.scheme()).unwrap_or(ProxyScheme::Http);

        let (host, literal) = match url.host() {
            Some(Host::Domain(d)) => (d.to_ascii_lowercase(), None),
            Some(Host::Ipv4(ip)) => (ip.to_string(), Some(IpAddr::V4(ip))),
            Some(Host::Ipv6(ip)) => (ip.to_string(), Some(IpAddr::V6(ip))),
            None => return Err(url::ParseError::EmptyHost),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let addresses = match literal {
            Some(ip) => vec![ip],
            None => match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => {
                    let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                    ips.sort();
                    ips.dedup();
                    ips
                }
                Err(e) => {
                    warn!("could not resolve upstream proxy {}: {}", host, e);
                    Vec::new()
                }
            },
        };

        let credentials = if url.username().is_empty() {
            None
        } else {
            let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
            Some((
                decode(url.username()),
                decode(url.password().unwrap_or_default()),
            ))
        };

        Ok(Self {
            scheme,
            host,
            port,
            addresses,
            credentials,
        })
    }

    pub fn matches_ip(&self, ip: IpAddr, port: u16) -> bool {
        self.port == port && self.addresses.contains(&ip)
    }

    pub fn matches_host(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }

    /// `Proxy-Authorization` value for http proxies with credentials
    pub fn authorization(&self) -> Option<HeaderValue> {
        let (user, pass) = self.credentials.as_ref()?;
        let token = STANDARD.encode(format!("{}:{}", user, pass));
        HeaderValue::from_str(&format!("Basic {}", token)).ok()
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.credentials
            .as_ref()
            .map(|(u, p)| (u.as_str(), p.as_str()))
    }
}

#[derive(Debug, Clone, Default)]
struct NoProxy {
    all: bool,
    domains: Vec<String>,
    networks: Vec<IpNet>,
}

impl NoProxy {
    fn parse(setting: &str) -> Self {
        let mut out = Self::default();
        for entry in setting.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry == "*" {
                out.all = true;
            } else if let Ok(net) = entry.parse::<IpNet>() {
                out.networks.push(net);
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                out.networks.extend(IpNet::new(ip, prefix).ok());
            } else {
                let host = entry.rsplit_once(':').map_or(entry, |(h, _)| h);
                let host = host.trim_start_matches("*.").trim_start_matches('.');
                out.domains.push(host.to_ascii_lowercase());
            }
        }
        out
    }

    fn bypass(&self, host: &str) -> bool {
        if self.all {
            return true;
        }
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return ip.is_loopback() || self.networks.iter().any(|n| n.contains(&ip));
        }
        let host = host.to_ascii_lowercase();
        host == "localhost"
            || self.domains.iter().any(|suffix| {
                host == *suffix
                    || (host.ends_with(suffix.as_str())
                        && host[..host.len() - suffix.len()].ends_with('.'))
            })
    }
}

/// Configured upstream proxies
#[derive(Debug, Clone, Default)]
pub struct UpstreamProxy {
    http: Option<ProxyEndpoint>,
    https: Option<ProxyEndpoint>,
    no_proxy: NoProxy,
}

fn env_setting(upper: &str, lower: &str) -> Option<String> {
    std::env::var(upper)
        .or_else(|_| std::env::var(lower))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

impl UpstreamProxy {
    /// No upstream proxy
    pub fn none() -> Self {
        Self::default()
    }

    /// Read HTTP_PROXY, HTTPS_PROXY and NO_PROXY (or their lowercase forms)
    pub async fn from_env() -> Self {
        Self::from_settings(
            env_setting("HTTP_PROXY", "http_proxy").as_deref(),
            env_setting("HTTPS_PROXY", "https_proxy").as_deref(),
            env_setting("NO_PROXY", "no_proxy").as_deref(),
        )
        .await
    }

    /// Build from explicit settings; unparseable proxies are logged and skipped
    pub async fn from_settings(
        http: Option<&str>,
        https: Option<&str>,
        no_proxy: Option<&str>,
    ) -> Self {
        async fn endpoint(kind: &str, setting: Option<&str>) -> Option<ProxyEndpoint> {
            let setting = setting?.trim();
            if setting.is_empty() {
                return None;
            }
            match ProxyEndpoint::parse(setting).await {
                Ok(ep) => {
                    debug!(
                        "{} upstream proxy {}:{} ({:?}) resolved to {:?}",
                        kind, ep.host, ep.port, ep.scheme, ep.addresses
                    );
                    Some(ep)
                }
                Err(e) => {
                    warn!("invalid {} proxy address {:?}: {}", kind, setting, e);
                    None
                }
            }
        }

        Self {
            http: endpoint("http", http).await,
            https: endpoint("https", https).await,
            no_proxy: no_proxy.map(NoProxy::parse).unwrap_or_default(),
        }
    }

    pub fn has_proxy(&self) -> bool {
        self.http.is_some() || self.https.is_some()
    }

    fn endpoints(&self) -> impl Iterator<Item = &ProxyEndpoint> {
        self.http.iter().chain(self.https.iter())
    }

    pub fn matches_ip(&self, ip: IpAddr, port: u16) -> bool {
        self.endpoints().any(|ep| ep.matches_ip(ip, port))
    }

    pub fn matches_host(&self, host: &str, port: u16) -> bool {
        self.endpoints().any(|ep| ep.matches_host(host, port))
    }

    /// Whether `address` (host name or IP) with `port` (default 80) is a
    /// configured proxy, resolving names when the host comparison fails
    pub async fn matches_any(&self, address: &str, port: Option<u16>) -> bool {
        if !self.has_proxy() {
            return false;
        }
        let port = port.unwrap_or(80);
        if self.matches_host(address, port) {
            return true;
        }

        let address = address.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = address.parse::<IpAddr>() {
            return self.matches_ip(ip, port);
        }
        match tokio::net::lookup_host((address, port)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).any(|ip| self.matches_ip(ip, port)),
            Err(_) => false,
        }
    }

    /// The proxy a request for `url` should go through, if any
    pub fn endpoint_for(&self, url: &Url) -> Option<&ProxyEndpoint> {
        self.endpoint_for_target(url.scheme(), url.host_str()?)
    }

    /// The proxy for a `scheme` target on `host` (IPv6 hosts may be bracketed)
    pub fn endpoint_for_target(&self, scheme: &str, host: &str) -> Option<&ProxyEndpoint> {
        if !self.has_proxy() || self.no_proxy.bypass(host) {
            return None;
        }
        match scheme {
            "https" => self.https.as_ref(),
            "http" => self.http.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str, port: u16, addresses: &[&str]) -> ProxyEndpoint {
        ProxyEndpoint {
            scheme: ProxyScheme::Http,
            host: host.to_string(),
            port,
            addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
            credentials: None,
        }
    }

    #[tokio::test]
    async fn test_proxy_parsing() {
        let proxy = UpstreamProxy::from_settings(
            Some("127.0.0.1"),
            Some("socks5://localhost:9999"),
            None,
        )
        .await;
        assert!(proxy.has_proxy());

        let http = proxy.http.as_ref().unwrap();
        assert_eq!(http.scheme, ProxyScheme::Http);
        assert_eq!(http.host, "127.0.0.1");
        assert_eq!(http.port, 80);
        assert_eq!(http.addresses, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);

        let https = proxy.https.as_ref().unwrap();
        assert_eq!(https.scheme, ProxyScheme::Socks5);
        assert_eq!(https.host, "localhost");
        assert_eq!(https.port, 9999);
        assert!(https.addresses.iter().all(|ip| ip.is_loopback()));
    }

    #[tokio::test]
    async fn test_proxy_parsing_bare_host_port_and_credentials() {
        let ep = ProxyEndpoint::parse("user:p%40ss@10.1.2.3:3128").await.unwrap();
        assert_eq!(ep.scheme, ProxyScheme::Http);
        assert_eq!(ep.host, "10.1.2.3");
        assert_eq!(ep.port, 3128);
        assert_eq!(ep.credentials(), Some(("user", "p@ss")));
        assert_eq!(
            ep.authorization().unwrap(),
            HeaderValue::from_static("Basic dXNlcjpwQHNz")
        );

        let ep = ProxyEndpoint::parse("[::1]:8888").await.unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 8888);
        assert!(ep.authorization().is_none());
    }

    #[tokio::test]
    async fn test_empty_settings_mean_no_proxy() {
        let proxy = UpstreamProxy::from_settings(Some(""), None, Some("*")).await;
        assert!(!proxy.has_proxy());
        assert!(!proxy.matches_any("127.0.0.1", None).await);
    }

    #[tokio::test]
    async fn test_proxy_matching() {
        let proxy = UpstreamProxy {
            http: Some(endpoint("localhost", 80, &["::1", "127.0.0.1"])),
            ..UpstreamProxy::default()
        };
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();

        assert!(proxy.matches_host("localhost", 80));
        assert!(!proxy.matches_host("localhostx", 80));
        assert!(!proxy.matches_host("loopback", 80));
        assert!(!proxy.matches_host("localhost", 90));
        assert!(!proxy.matches_host("127.0.0.1", 80));
        assert!(!proxy.matches_host("::1", 80));

        assert!(proxy.matches_ip(ip("127.0.0.1"), 80));
        assert!(proxy.matches_ip(ip("::1"), 80));
        assert!(!proxy.matches_ip(ip("127.0.0.2"), 80));
        assert!(!proxy.matches_ip(ip("127.0.0.1"), 90));
        assert!(!proxy.matches_ip(ip("::2"), 80));
        assert!(!proxy.matches_ip(ip("::1"), 90));

        assert!(proxy.matches_any("127.0.0.1", Some(80)).await);
        assert!(proxy.matches_any("127.0.0.1", None).await);
        assert!(proxy.matches_any("::1", Some(80)).await);
        assert!(proxy.matches_any("[::1]", Some(80)).await);
        assert!(proxy.matches_any("localhost", Some(80)).await);
        assert!(!proxy.matches_any("localhost", Some(90)).await);
        assert!(!proxy.matches_any("127.0.0.2", Some(80)).await);
        assert!(!proxy.matches_any("127.0.0.1", Some(90)).await);
        assert!(!proxy.matches_any("1.1.1.1", Some(80)).await);
        assert!(!proxy.matches_any("255.255.255.255", Some(80)).await);
        assert!(!proxy.matches_any("::1", Some(90)).await);
    }

    #[test]
    fn test_endpoint_selection_and_no_proxy() {
        let proxy = UpstreamProxy {
            http: Some(endpoint("proxy.internal", 3128, &["10.0.0.5"])),
            https: None,
            no_proxy: NoProxy::parse("example.com, .internal.net, 10.0.0.0/8, 192.168.1.1"),
        };
        let url = |s: &str| Url::parse(s).unwrap();

        assert!(proxy.endpoint_for(&url("http://cdn.example.org/a.png")).is_some());
        assert!(proxy.endpoint_for(&url("https://cdn.example.org/a.png")).is_none());
        assert!(proxy.endpoint_for(&url("http://example.com/a.png")).is_none());
        assert!(proxy.endpoint_for(&url("http://img.example.com/a.png")).is_none());
        assert!(proxy.endpoint_for(&url("http://notexample.com/a.png")).is_some());
        assert!(proxy.endpoint_for(&url("http://a.internal.net/a.png")).is_none());
        assert!(proxy.endpoint_for(&url("http://10.2.3.4/a.png")).is_none());
        assert!(proxy.endpoint_for(&url("http://192.168.1.1/a.png")).is_none());
        assert!(proxy.endpoint_for(&url("http://localhost/a.png")).is_none());
        assert!(proxy.endpoint_for(&url("http://127.0.0.1/a.png")).is_none());
    }
}
