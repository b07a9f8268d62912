//! Semantic versions and version ranges used for capability resolution.
//!
//! Only the `major.minor.patch` core is modelled. Ranges follow the usual
//! npm-style caret/tilde rules, plus exact matches, wildcards and
//! space-separated comparator sets (`>=1.0.0 <2.0.0`).

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^v?(\d+)\.(\d+)\.(\d+)$").expect("valid version regex"));

/// Errors produced while parsing versions or ranges.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersionError {
    /// The string is not `major.minor.patch`.
    #[error("invalid version '{0}': expected major.minor.patch")]
    InvalidVersion(String),

    /// The range expression could not be parsed.
    #[error("invalid version range '{0}'")]
    InvalidRange(String),
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// A `major.minor.patch` version, ordered numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let caps = VERSION_RE
            .captures(trimmed)
            .ok_or_else(|| VersionError::InvalidVersion(s.to_string()))?;

        let part = |idx: usize| -> Result<u64, VersionError> {
            caps[idx]
                .parse::<u64>()
                .map_err(|_| VersionError::InvalidVersion(s.to_string()))
        };

        Ok(Self::new(part(1)?, part(2)?, part(3)?))
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ---------------------------------------------------------------------------
// VersionRange
// ---------------------------------------------------------------------------

/// Comparison operator inside a comparator-set range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparator {
    fn matches(self, candidate: &Version, bound: &Version) -> bool {
        match self {
            Comparator::Gt => candidate > bound,
            Comparator::Gte => candidate >= bound,
            Comparator::Lt => candidate < bound,
            Comparator::Lte => candidate <= bound,
            Comparator::Eq => candidate == bound,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Eq => "=",
        }
    }
}

/// A version constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionRange {
    /// `*`, `latest` or the empty string.
    Any,
    /// `1.2.3` or `=1.2.3`.
    Exact(Version),
    /// `^1.2.3`.
    Caret(Version),
    /// `~1.2.3`.
    Tilde(Version),
    /// `>=1.0.0 <2.0.0`; every comparator must hold.
    Comparators(Vec<(Comparator, Version)>),
}

impl VersionRange {
    /// Parse a range expression.
    pub fn parse(expr: &str) -> Result<Self, VersionError> {
        let expr = expr.trim();
        if expr.is_empty() || expr == "*" || expr.eq_ignore_ascii_case("latest") {
            return Ok(VersionRange::Any);
        }

        let bad = || VersionError::InvalidRange(expr.to_string());

        if let Some(rest) = expr.strip_prefix('^') {
            return rest.parse().map(VersionRange::Caret).map_err(|_| bad());
        }
        if let Some(rest) = expr.strip_prefix('~') {
            return rest.parse().map(VersionRange::Tilde).map_err(|_| bad());
        }

        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() == 1 && !parts[0].starts_with(['>', '<']) {
            let bare = parts[0].strip_prefix('=').unwrap_or(parts[0]);
            return bare.parse().map(VersionRange::Exact).map_err(|_| bad());
        }

        let mut comparators = Vec::with_capacity(parts.len());
        for part in parts {
            let (op, rest) = if let Some(r) = part.strip_prefix(">=") {
                (Comparator::Gte, r)
            } else if let Some(r) = part.strip_prefix("<=") {
                (Comparator::Lte, r)
            } else if let Some(r) = part.strip_prefix('>') {
                (Comparator::Gt, r)
            } else if let Some(r) = part.strip_prefix('<') {
                (Comparator::Lt, r)
            } else if let Some(r) = part.strip_prefix('=') {
                (Comparator::Eq, r)
            } else {
                (Comparator::Eq, part)
            };
            let version = rest.parse().map_err(|_| bad())?;
            comparators.push((op, version));
        }
        Ok(VersionRange::Comparators(comparators))
    }

    /// Whether `version` satisfies this range.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionRange::Any => true,
            VersionRange::Exact(v) => version == v,
            VersionRange::Caret(base) => {
                if version < base {
                    return false;
                }
                if base.major > 0 {
                    version.major == base.major
                } else if base.minor > 0 {
                    version.major == 0 && version.minor == base.minor
                } else {
                    version == base
                }
            }
            VersionRange::Tilde(base) => {
                version.major == base.major
                    && version.minor == base.minor
                    && version.patch >= base.patch
            }
            VersionRange::Comparators(list) => {
                list.iter().all(|(op, bound)| op.matches(version, bound))
            }
        }
    }

    /// The pinned version when this range is an exact match.
    pub fn exact(&self) -> Option<Version> {
        match self {
            VersionRange::Exact(v) => Some(*v),
            _ => None,
        }
    }

    /// Pick the highest version in `candidates` that satisfies the range.
    pub fn best_match<'a, I>(&self, candidates: I) -> Option<Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        candidates
            .into_iter()
            .filter(|v| self.matches(v))
            .max()
            .copied()
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        VersionRange::Any
    }
}

impl FromStr for VersionRange {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionRange::parse(s)
    }
}

impl TryFrom<String> for VersionRange {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        VersionRange::parse(&value)
    }
}

impl From<VersionRange> for String {
    fn from(r: VersionRange) -> Self {
        r.to_string()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRange::Any => write!(f, "*"),
            VersionRange::Exact(v) => write!(f, "{}", v),
            VersionRange::Caret(v) => write!(f, "^{}", v),
            VersionRange::Tilde(v) => write!(f, "~{}", v),
            VersionRange::Comparators(list) => {
                let rendered: Vec<String> = list
                    .iter()
                    .map(|(op, v)| format!("{}{}", op.symbol(), v))
                    .collect();
                write!(f, "{}", rendered.join(" "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(v("1.2.3"), Version::new(1, 2, 3));
        assert_eq!(v("v10.0.7"), Version::new(10, 0, 7));
        assert!("1.2".parse::<Version>().is_err());
        assert!("1.2.x".parse::<Version>().is_err());
    }

    #[test]
    fn test_versions_order_numerically() {
        assert!(v("1.10.0") > v("1.9.9"));
        assert!(v("2.0.0") > v("1.99.99"));
    }

    #[test]
    fn test_caret_range() {
        let r = VersionRange::parse("^1.2.3").unwrap();
        assert!(r.matches(&v("1.2.3")));
        assert!(r.matches(&v("1.9.0")));
        assert!(!r.matches(&v("1.2.2")));
        assert!(!r.matches(&v("2.0.0")));

        let zero = VersionRange::parse("^0.2.3").unwrap();
        assert!(zero.matches(&v("0.2.9")));
        assert!(!zero.matches(&v("0.3.0")));
    }

    #[test]
    fn test_tilde_range() {
        let r = VersionRange::parse("~1.2.3").unwrap();
        assert!(r.matches(&v("1.2.3")));
        assert!(r.matches(&v("1.2.8")));
        assert!(!r.matches(&v("1.3.0")));
        assert!(!r.matches(&v("1.2.2")));
    }

    #[test]
    fn test_exact_and_any() {
        let exact = VersionRange::parse("1.0.0").unwrap();
        assert_eq!(exact.exact(), Some(v("1.0.0")));
        assert!(!exact.matches(&v("1.0.1")));
        assert_eq!(VersionRange::parse("latest").unwrap(), VersionRange::Any);
        assert_eq!(VersionRange::parse("").unwrap(), VersionRange::Any);
    }

    #[test]
    fn test_comparator_set() {
        let r = VersionRange::parse(">=1.0.0 <2.0.0").unwrap();
        assert!(r.matches(&v("1.5.0")));
        assert!(!r.matches(&v("2.0.0")));
        assert_eq!(r.to_string(), ">=1.0.0 <2.0.0");
    }

    #[test]
    fn test_best_match_picks_highest() {
        let versions = vec![v("1.0.0"), v("1.4.0"), v("1.2.0"), v("2.0.0")];
        let r = VersionRange::parse("^1.0.0").unwrap();
        assert_eq!(r.best_match(&versions), Some(v("1.4.0")));
    }

    #[test]
    fn test_invalid_range() {
        assert!(VersionRange::parse("^banana").is_err());
        assert!(VersionRange::parse(">=1.0").is_err());
    }
}
