//! Address policy for outbound connections
//!
//! Classifies IP addresses that the proxy must never connect to: loopback,
//! link-local, private, multicast and the other special-purpose ranges. The
//! same policy backs the pre-flight URL check, the X-Forwarded-For decision
//! and the authoritative dial-time check in the connector.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tracing::warn;

const REJECTED_V4: &[&str] = &[
    "0.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "255.255.255.255/32",
];

const REJECTED_V6: &[&str] = &[
    // unspecified and loopback
    "::/128",
    "::1/128",
    // ipv4-mapped
    "::ffff:0:0/96",
    // discard prefix
    "100::/64",
    // documentation
    "2001:db8::/32",
    // unique local
    "fc00::/7",
    // link-local and deprecated site-local
    "fe80::/10",
    "fec0::/10",
    // multicast
    "ff00::/8",
];

fn parse_nets<N: std::str::FromStr>(table: &[&str]) -> Vec<N> {
    table
        .iter()
        .filter_map(|cidr| match cidr.parse() {
            Ok(net) => Some(net),
            Err(_) => {
                warn!("ignoring unparseable network {}", cidr);
                None
            }
        })
        .collect()
}

/// Networks the proxy refuses to connect to
#[derive(Debug, Clone)]
pub struct AddressPolicy {
    rejected_v4: Vec<Ipv4Net>,
    rejected_v6: Vec<Ipv6Net>,
    /// Operator exemptions, checked before the reject tables
    allowed: Vec<IpNet>,
}

impl Default for AddressPolicy {
    fn default() -> Self {
        Self {
            rejected_v4: parse_nets(REJECTED_V4),
            rejected_v6: parse_nets(REJECTED_V6),
            allowed: Vec::new(),
        }
    }
}

impl AddressPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exempt `allowed` networks from rejection
    pub fn with_allowed(mut self, allowed: impl IntoIterator<Item = IpNet>) -> Self {
        self.allowed.extend(allowed);
        self
    }

    /// Whether connecting to `ip` is forbidden
    pub fn is_rejected(&self, ip: IpAddr) -> bool {
        if self.allowed.iter().any(|net| net.contains(&ip)) {
            return false;
        }
        match ip {
            IpAddr::V4(v4) => self.rejected_v4.iter().any(|net| net.contains(&v4)),
            IpAddr::V6(v6) => self.rejected_v6.iter().any(|net| net.contains(&v6)),
        }
    }

    /// The first of `ips` that is forbidden
    pub fn any_rejected<I>(&self, ips: I) -> Option<IpAddr>
    where
        I: IntoIterator<Item = IpAddr>,
    {
        ips.into_iter().find(|ip| self.is_rejected(*ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_tables_parse() {
        let policy = AddressPolicy::new();
        assert_eq!(policy.rejected_v4.len(), REJECTED_V4.len());
        assert_eq!(policy.rejected_v6.len(), REJECTED_V6.len());
    }

    #[test]
    fn test_rejects_special_v4() {
        let policy = AddressPolicy::new();
        for addr in [
            "0.0.0.0",
            "127.0.0.1",
            "127.255.0.1",
            "169.254.1.1",
            "169.254.169.254",
            "10.0.0.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "224.0.0.1",
            "239.255.255.255",
            "255.255.255.255",
        ] {
            assert!(policy.is_rejected(ip(addr)), "{addr} should be rejected");
        }
    }

    #[test]
    fn test_accepts_public_v4() {
        let policy = AddressPolicy::new();
        for addr in ["1.1.1.1", "8.8.8.8", "172.32.0.1", "192.169.0.1", "93.184.216.34"] {
            assert!(!policy.is_rejected(ip(addr)), "{addr} should be accepted");
        }
    }

    #[test]
    fn test_rejects_special_v6() {
        let policy = AddressPolicy::new();
        for addr in [
            "::",
            "::1",
            "::ffff:127.0.0.1",
            "::ffff:8.8.8.8",
            "100::1",
            "2001:db8::1",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
            "fec0::1",
            "ff02::1",
        ] {
            assert!(policy.is_rejected(ip(addr)), "{addr} should be rejected");
        }
        assert!(!policy.is_rejected(ip("2606:4700:4700::1111")));
    }

    #[test]
    fn test_allowed_networks_take_precedence() {
        let policy = AddressPolicy::new().with_allowed(["127.0.0.1/32".parse().unwrap()]);
        assert!(!policy.is_rejected(ip("127.0.0.1")));
        assert!(policy.is_rejected(ip("127.0.0.2")));
    }

    #[test]
    fn test_any_rejected_reports_first_offender() {
        let policy = AddressPolicy::new();
        assert_eq!(
            policy.any_rejected([ip("8.8.8.8"), ip("10.1.2.3"), ip("127.0.0.1")]),
            Some(ip("10.1.2.3"))
        );
        assert_eq!(policy.any_rejected([ip("8.8.8.8")]), None);
    }
}
