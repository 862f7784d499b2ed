//! Pluggable URL filters and the rule-file loader
//!
//! Filters run in order after the built-in URL checks; the first filter that
//! returns `false` or an error rejects the request.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, warn};
use url::Url;

use crate::error::RuleError;
use crate::htrie::UrlMatcher;

/// A check applied to every target URL, including redirect targets
pub trait UrlFilter: Send + Sync {
    fn check(&self, url: &Url) -> Result<bool, RuleError>;
}

impl<F> UrlFilter for F
where
    F: Fn(&Url) -> Result<bool, RuleError> + Send + Sync,
{
    fn check(&self, url: &Url) -> Result<bool, RuleError> {
        self(url)
    }
}

/// Passes only URLs covered by at least one rule
#[derive(Debug)]
pub struct AllowFilter(pub UrlMatcher);

impl UrlFilter for AllowFilter {
    fn check(&self, url: &Url) -> Result<bool, RuleError> {
        self.0.check_url(url)
    }
}

/// Passes only URLs covered by no rule
#[derive(Debug)]
pub struct DenyFilter(pub UrlMatcher);

impl UrlFilter for DenyFilter {
    fn check(&self, url: &Url) -> Result<bool, RuleError> {
        self.0.check_url(url).map(|hit| !hit)
    }
}

/// Ordered filter chain
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn UrlFilter>>,
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.filters.len())
            .finish()
    }
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Arc<dyn UrlFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run each filter in order, stopping at the first failure
    pub fn allows(&self, url: &Url) -> bool {
        for (i, filter) in self.filters.iter().enumerate() {
            match filter.check(url) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("filter {} rejected {}", i, url);
                    return false;
                }
                Err(e) => {
                    debug!("filter {} failed on {}: {}", i, url, e);
                    return false;
                }
            }
        }
        true
    }
}

impl FromIterator<Arc<dyn UrlFilter>> for FilterChain {
    fn from_iter<T: IntoIterator<Item = Arc<dyn UrlFilter>>>(iter: T) -> Self {
        Self {
            filters: iter.into_iter().collect(),
        }
    }
}

/// Allow and deny rules read from a rule file
#[derive(Debug, Default)]
pub struct RuleSet {
    pub allow: UrlMatcher,
    pub deny: UrlMatcher,
}

impl RuleSet {
    /// Parse `allow|<rule>` and `deny|<rule>` lines
    ///
    /// Blank lines and `#` comments are skipped; any other line is ignored
    /// with a warning.
    pub fn parse(content: &str) -> Result<Self, RuleError> {
        let mut rules = Self::default();
        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rule) = line.strip_prefix("allow|") {
                rules.allow.add_rule(&format!("|{}", rule))?;
            } else if let Some(rule) = line.strip_prefix("deny|") {
                rules.deny.add_rule(&format!("|{}", rule))?;
            } else {
                warn!("ignoring unrecognized rule on line {}: {:?}", lineno + 1, line);
            }
        }
        Ok(rules)
    }

    /// Filters in evaluation order: allow first, then deny
    pub fn into_filters(self) -> Vec<Arc<dyn UrlFilter>> {
        let mut filters: Vec<Arc<dyn UrlFilter>> = Vec::new();
        let has_allow = !self.allow.is_empty();
        let has_deny = !self.deny.is_empty();

        if has_allow && has_deny {
            warn!("rule file has both allow and deny rules; deny rules only apply to allowed urls");
        }
        if has_allow {
            filters.push(Arc::new(AllowFilter(self.allow)));
        }
        if has_deny {
            filters.push(Arc::new(DenyFilter(self.deny)));
        }
        filters
    }
}

/// Load a rule file into filters
pub fn load_rules_file(path: &Path) -> anyhow::Result<Vec<Arc<dyn UrlFilter>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rule file {:?}", path))?;
    let rules = RuleSet::parse(&content)
        .with_context(|| format!("failed to parse rule file {:?}", path))?;
    Ok(rules.into_filters())
}
