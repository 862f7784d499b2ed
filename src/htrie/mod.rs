//! Host and path rule matching
//!
//! Rules take the form `|host-flags|host|path-flags|path|`. Hosts are stored
//! in a trie keyed by reversed labels (`a.example.com` is walked as `com`,
//! `example`, `a`); each host node may carry a [`GlobPathChecker`] for the
//! path half of its rules.
//!
//! ```text
//! |s|example.org||        example.org and every subdomain
//! ||*.example.com||       any subdomain of example.com, not example.com
//! ||example.net|i|/img/*  case-insensitive path glob on one host
//! ```

mod glob;

pub use glob::GlobPathChecker;

use std::collections::HashMap;
use std::net::IpAddr;

use url::{Host, Url};

use crate::error::RuleError;

#[derive(Debug, Default)]
struct MatchNode {
    children: HashMap<String, MatchNode>,
    path_rules: Option<GlobPathChecker>,
    /// Matches this label and every label below it
    is_wild: bool,
    has_wild_child: bool,
    can_match: bool,
    /// A rule without a path ends here
    host_only: bool,
}

impl MatchNode {
    fn matches_path(&self, path: &str) -> bool {
        self.host_only || self.path_rules.as_ref().is_some_and(|p| p.check_path(path))
    }
}

/// Matches URLs against host and path rules
#[derive(Debug, Default)]
pub struct UrlMatcher {
    root: MatchNode,
}

struct ParsedRule<'a> {
    host_flags: &'a str,
    host: &'a str,
    path_flags: &'a str,
    path: &'a str,
}

fn parse_rule(rule: &str) -> Result<ParsedRule<'_>, RuleError> {
    let bad = || RuleError::Format(rule.to_string());

    let mut body = rule.trim().strip_prefix('|').ok_or_else(bad)?;
    if body.matches('|').count() > 3 {
        body = body.strip_suffix('|').ok_or_else(bad)?;
    }

    let mut parts = body.split('|');
    let (Some(host_flags), Some(host), Some(path_flags), Some(path), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(bad());
    };

    Ok(ParsedRule {
        host_flags,
        host,
        path_flags,
        path,
    })
}

/// Lowercase and IDNA-encode a hostname
pub fn normalize_hostname(name: &str) -> Result<String, RuleError> {
    let trimmed = name.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(RuleError::Idna(name.to_string()));
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }
    idna::domain_to_ascii(trimmed).map_err(|_| RuleError::Idna(name.to_string()))
}

fn url_hostname(url: &Url) -> Result<String, RuleError> {
    match url.host() {
        Some(Host::Domain(d)) => normalize_hostname(d),
        Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
        Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
        None => Err(RuleError::Idna(String::new())),
    }
}

impl UrlMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a matcher from a list of rules, failing on the first bad one
    pub fn from_rules<I, S>(rules: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::new();
        for rule in rules {
            matcher.add_rule(rule.as_ref())?;
        }
        Ok(matcher)
    }

    /// Parse and insert one `|host-flags|host|path-flags|path|` rule
    pub fn add_rule(&mut self, rule: &str) -> Result<(), RuleError> {
        let parsed = parse_rule(rule)?;

        let host_wild = match parsed.host_flags {
            "" => false,
            "s" => true,
            _ => return Err(RuleError::Format(rule.to_string())),
        };

        let host_err = |reason| RuleError::Host {
            pattern: parsed.host.to_string(),
            reason,
        };

        let host = parsed.host.trim();
        let (wild_prefix, bare_host) = match host.strip_prefix("*.") {
            Some(rest) => (true, rest),
            None => (false, host),
        };
        if bare_host.is_empty() {
            return Err(host_err("empty host"));
        }
        let bare_host = normalize_hostname(bare_host)?;

        let mut labels: Vec<&str> = bare_host.split('.').collect();
        if labels.iter().any(|l| l.is_empty()) {
            return Err(host_err("empty label"));
        }
        if labels.iter().any(|l| l.contains('*')) {
            return Err(host_err("wildcard only allowed as the leftmost label"));
        }
        if wild_prefix {
            labels.insert(0, "*");
        }

        let path = parsed.path.trim();
        let host_only = path.is_empty() || path == "*";
        let icase = match parsed.path_flags {
            "" => false,
            "i" => true,
            _ => return Err(RuleError::Format(rule.to_string())),
        };
        if !host_only {
            glob::validate_pattern(path)?;
        }

        let mut node = &mut self.root;
        for label in labels.iter().rev() {
            if *label == "*" {
                node.has_wild_child = true;
            }
            node = node.children.entry((*label).to_string()).or_default();
        }

        node.can_match = true;
        if host_wild || wild_prefix {
            node.is_wild = true;
        }

        if host_only {
            node.host_only = true;
            return Ok(());
        }

        node.path_rules
            .get_or_insert_with(GlobPathChecker::new)
            .add_path(path, icase)
    }

    /// Collect every node that covers the reversed `labels`
    fn walk_find<'a>(&'a self, labels: &[&str]) -> Vec<&'a MatchNode> {
        let mut found = Vec::new();
        let mut node = &self.root;
        let last = labels.len().saturating_sub(1);

        for (i, label) in labels.iter().enumerate() {
            let Some(next) = node.children.get(*label) else {
                break;
            };
            node = next;

            if node.is_wild {
                found.push(node);
            }
            if i < last && node.has_wild_child {
                if let Some(wild) = node.children.get("*") {
                    found.push(wild);
                }
            }
            if i == last && node.can_match && !node.is_wild {
                found.push(node);
            }
        }
        found
    }

    fn candidates(&self, hostname: &str) -> Vec<&MatchNode> {
        let labels: Vec<&str> = hostname.split('.').rev().collect();
        self.walk_find(&labels)
    }

    /// Whether any rule covers `name`, ignoring path rules
    pub fn check_hostname(&self, name: &str) -> Result<bool, RuleError> {
        let name = normalize_hostname(name)?;
        Ok(!self.candidates(&name).is_empty())
    }

    /// Whether any rule covers the host and path of `url`
    ///
    /// Errors only when the host cannot be normalized.
    pub fn check_url(&self, url: &Url) -> Result<bool, RuleError> {
        let hostname = url_hostname(url)?;
        let path = url.path();
        Ok(self
            .candidates(&hostname)
            .iter()
            .any(|node| node.matches_path(path)))
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }
}

/// Hostnames that always refer to the local machine
pub fn local_hostnames() -> UrlMatcher {
    let mut matcher = UrlMatcher::new();
    for rule in ["|s|localhost||", "|s|localdomain||"] {
        // both rules are well formed
        if let Err(e) = matcher.add_rule(rule) {
            tracing::error!("failed to add built-in rule {}: {}", rule, e);
        }
    }
    matcher
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(rules: &[&str]) -> UrlMatcher {
        UrlMatcher::from_rules(rules).unwrap()
    }

    fn check(m: &UrlMatcher, url: &str) -> bool {
        m.check_url(&Url::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn test_domain_and_path_rules() {
        let m = matcher(&[
            "|s|example.org|i|*/test.png",
            "||*.example.com||*/test.png",
            "||example.net||*",
            "||foo.example.net||/",
            "||bar.example.net|i|*/test.png",
            "||bar.example.net|i|*/test.png.extra",
            "||bücher.example.net||",
        ]);

        assert!(check(&m, "http://example.org/foo/tesT.png"));
        assert!(check(&m, "http://sub.example.org/foo/TEST.png"));
        assert!(check(&m, "http://bar.example.com/foo/test.png"));
        assert!(check(&m, "http://a.b.example.com/foo/test.png"));
        assert!(check(&m, "http://example.net/test.png"));
        assert!(check(&m, "http://foo.example.net/"));
        assert!(check(&m, "http://bar.example.net/foo/test.png"));
        assert!(check(&m, "http://bar.example.net/foo/test.png.extra"));
        assert!(check(&m, "http://xn--bcher-kva.example.net/"));
        assert!(check(&m, "http://bücher.example.net/"));

        assert!(!check(&m, "http://example.org/foo/test.gif"));
        assert!(!check(&m, "http://example.com/foo/test.png"));
        assert!(!check(&m, "http://bar.example.com/foo/test.gif"));
        assert!(!check(&m, "http://foo.example.net/nope"));
        assert!(!check(&m, "http://bar.example.net/foo/test.png.ex"));
        assert!(!check(&m, "http://bücher.example.com/"));
        assert!(!check(&m, "http://sub.example.net/test.png"));
    }

    #[test]
    fn test_wildcard_subdomain_rule() {
        let m = matcher(&["||*.example.com||"]);

        assert!(check(&m, "http://a.example.com/x"));
        assert!(check(&m, "http://a.b.example.com/x"));
        assert!(!check(&m, "http://example.com/x"));
        assert!(!check(&m, "http://notexample.com/x"));

        let m = matcher(&["||*.example.com||", "||example.com||"]);
        assert!(check(&m, "http://example.com/x"));
    }

    #[test]
    fn test_local_hostnames() {
        let m = local_hostnames();

        for host in [
            "localhost",
            "foo.localhost",
            "LOCALHOST",
            "localdomain",
            "bar.foo.localdomain",
        ] {
            assert!(m.check_hostname(host).unwrap(), "{host}");
        }
        for host in ["localhostx", "localhost.example.com", "example.com"] {
            assert!(!m.check_hostname(host).unwrap(), "{host}");
        }
    }

    #[test]
    fn test_bare_rule_is_not_shadowed_by_path_rule() {
        let m = matcher(&["||example.net||", "||example.net||/only/this"]);
        assert!(check(&m, "http://example.net/anything"));

        let m = matcher(&["||example.net||/only/this", "||example.net||"]);
        assert!(check(&m, "http://example.net/anything"));
    }

    #[test]
    fn test_query_does_not_affect_path_match() {
        let m = matcher(&["||example.net||/a.png"]);
        assert!(check(&m, "http://example.net/a.png?size=10"));
        assert!(!check(&m, "http://example.net/a.png/x"));
    }

    #[test]
    fn test_ip_literal_hosts() {
        let m = matcher(&["||10.0.0.1||", "||::1||"]);
        assert!(check(&m, "http://10.0.0.1/x"));
        assert!(check(&m, "http://[::1]/x"));
        assert!(!check(&m, "http://10.0.0.2/x"));
    }

    #[test]
    fn test_trailing_pipe_optional() {
        let m = matcher(&["||example.com||/a", "||example.org||/b|"]);
        assert!(check(&m, "http://example.com/a"));
        assert!(check(&m, "http://example.org/b"));
    }

    #[test]
    fn test_bad_rules() {
        let mut m = UrlMatcher::new();
        for rule in [
            "example.com",
            "||example.com",
            "|x|example.com||",
            "||||",
            "||foo.*.example.com||",
            "||ex*ample.com||",
            "||example..com||",
            "||example.com|z|/a|",
            "||example.com||/a?b|",
        ] {
            assert!(m.add_rule(rule).is_err(), "{rule}");
        }
    }

    #[test]
    fn test_check_hostname_normalizes() {
        let m = matcher(&["||bücher.example.net||"]);
        assert!(m.check_hostname("BÜCHER.example.net").unwrap());
        assert!(m.check_hostname(" xn--bcher-kva.example.net. ").unwrap());
        assert!(m.check_hostname("").is_err());
    }
}
