//! Artifact versions: `major[.minor[.build[.revision]]][-prerelease]`
//!
//! Only the components that were supplied are kept, so `"1.2"` formats back
//! as `"1.2"` and never as `"1.2.0"`. Ordering compares the numeric
//! components left to right (an absent component ranks below a present one),
//! then ranks a stable version above any prerelease of the same numbers, then
//! compares prerelease tokens ordinally.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    major: u64,
    minor: Option<u64>,
    build: Option<u64>,
    revision: Option<u64>,
    prerelease: Option<String>,
}

impl Version {
    /// Parse a version string, failing with `BadRequest` on malformed input
    pub fn parse(s: &str) -> Result<Self> {
        Self::try_parse(s)
            .ok_or_else(|| Error::BadRequest(format!("invalid version format: {:?}", s)))
    }

    /// Non-failing variant of [`Version::parse`]
    pub fn try_parse(s: &str) -> Option<Self> {
        let (numbers, prerelease) = match s.split_once('-') {
            Some((numbers, pre)) => {
                if pre.is_empty()
                    || !pre
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                {
                    return None;
                }
                (numbers, Some(pre.to_string()))
            }
            None => (s, None),
        };

        let mut parts = numbers.split('.');
        let major = parse_component(parts.next()?)?;
        let minor = parts.next().map(|p| parse_component(p).ok_or(())).transpose().ok()?;
        let build = parts.next().map(|p| parse_component(p).ok_or(())).transpose().ok()?;
        let revision = parts.next().map(|p| parse_component(p).ok_or(())).transpose().ok()?;
        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            major,
            minor,
            build,
            revision,
            prerelease,
        })
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> Option<u64> {
        self.minor
    }

    pub fn build(&self) -> Option<u64> {
        self.build
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    pub fn prerelease(&self) -> Option<&str> {
        self.prerelease.as_deref()
    }

    /// A version without a prerelease token
    pub fn is_stable(&self) -> bool {
        self.prerelease.is_none()
    }
}

/// Decimal, non-empty, no sign and no leading zeros (so formatting round-trips).
fn parse_component(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.build.cmp(&other.build))
            .then(self.revision.cmp(&other.revision))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.as_bytes().cmp(b.as_bytes()),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        for component in [self.minor, self.build, self.revision].into_iter().flatten() {
            write!(f, ".{}", component)?;
        }
        if let Some(pre) = &self.prerelease {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}
