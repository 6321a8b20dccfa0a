//! Upstream path rewriting
//!
//! Rules run once each, in order, and each replaces only the first match of
//! its pattern. A later rule sees the output of the earlier ones.

use std::borrow::Cow;

use regex::Regex;

use crate::error::Result;

/// One pattern/replacement pair
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

impl RewriteRule {
    /// Compile a rule. The replacement may reference capture groups as `$1`
    /// or `${name}`.
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    fn apply<'a>(&self, path: &'a str) -> Cow<'a, str> {
        self.pattern.replacen(path, 1, self.replacement.as_str())
    }
}

/// Ordered list of rewrite rules
#[derive(Debug, Clone, Default)]
pub struct PathRewriter {
    rules: Vec<RewriteRule>,
}

impl PathRewriter {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule over `path` in order
    pub fn apply(&self, path: &str) -> String {
        self.rules
            .iter()
            .fold(path.to_string(), |current, rule| {
                let rewritten = match rule.apply(&current) {
                    Cow::Owned(rewritten) => Some(rewritten),
                    Cow::Borrowed(_) => None,
                };
                rewritten.unwrap_or(current)
            })
    }
}
