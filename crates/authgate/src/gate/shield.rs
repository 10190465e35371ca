//! Heuristic attack-pattern filter
//!
//! Matches the percent-decoded path and query of a request against a fixed set
//! of signatures for common injection and traversal attempts. A match carries
//! no retry hint; the request is simply refused.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Signature family that matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShieldRule {
    /// `../` sequences and well-known sensitive paths
    PathTraversal,
    /// SQL injection fragments
    SqlInjection,
    /// Markup or script injection
    ScriptInjection,
    /// Shell metacharacter chains
    CommandInjection,
    /// Encoded NUL bytes
    NullByte,
}

impl ShieldRule {
    const ORDERED: [ShieldRule; 5] = [
        Self::PathTraversal,
        Self::SqlInjection,
        Self::ScriptInjection,
        Self::CommandInjection,
        Self::NullByte,
    ];

    /// Stable name for logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PathTraversal => "path_traversal",
            Self::SqlInjection => "sql_injection",
            Self::ScriptInjection => "script_injection",
            Self::CommandInjection => "command_injection",
            Self::NullByte => "null_byte",
        }
    }
}

impl fmt::Display for ShieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Index order matches ShieldRule::ORDERED
static SIGNATURES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)(\.\./|\.\.\\|/etc/(passwd|shadow)|/proc/self/|\bwin\.ini\b)",
        r"(?i)(\bunion\b[\s(]+(all\s+)?select\b|'\s*(or|and)\s+'?\d+'?\s*=\s*'?\d|;\s*(drop|truncate|delete)\s+(table|from)\b|\b(sleep|benchmark|pg_sleep)\s*\(\s*\d|\bwaitfor\s+delay\b)",
        r"(?i)(<\s*/?\s*(script|iframe|object|embed|svg)\b|javascript\s*:|\bon(error|load|mouseover)\s*=)",
        r"(?i)((;|\|\|?|&&)\s*(cat|ls|id|wget|curl|bash|sh|nc|rm)\b|\$\([^)]*\)|`[^`]*`)",
        r"\x00",
    ])
    .expect("Invalid shield signature pattern")
});

/// Pattern filter over request targets
#[derive(Debug, Clone, Copy, Default)]
pub struct Shield;

impl Shield {
    /// Inspect a request path and optional raw query string
    pub fn inspect(&self, path: &str, query: Option<&str>) -> Option<ShieldRule> {
        let target = match query {
            Some(q) if !q.is_empty() => Cow::Owned(format!("{path}?{q}")),
            _ => Cow::Borrowed(path),
        };
        let decoded = percent_decode_str(&target).decode_utf8_lossy();

        SIGNATURES
            .matches(&decoded)
            .iter()
            .next()
            .map(|index| ShieldRule::ORDERED[index])
    }
}
