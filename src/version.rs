//! Semantic version value type. Order and parse rules follow the classic
//! `MAJOR.MINOR.PATCH[-QUALIFIER]` scheme with one twist: an empty
//! qualifier (a release) outranks any non-empty qualifier (a pre-release).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:-([A-Za-z0-9.-]+))?$").expect("static regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub qualifier: String,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch, qualifier: String::new() }
    }

    pub fn with_qualifier(major: u32, minor: u32, patch: u32, qualifier: impl Into<String>) -> Self {
        Self { major, minor, patch, qualifier: qualifier.into() }
    }

    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::InvalidVersion(s.to_string()));
        }
        let caps = VERSION_RE
            .captures(s)
            .ok_or_else(|| ParseError::InvalidVersion(s.to_string()))?;
        let major: u32 = caps[1].parse().map_err(|_| ParseError::InvalidVersion(s.to_string()))?;
        let minor: u32 = caps[2].parse().map_err(|_| ParseError::InvalidVersion(s.to_string()))?;
        let patch: u32 = caps[3].parse().map_err(|_| ParseError::InvalidVersion(s.to_string()))?;
        let qualifier = caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default();
        Ok(Self { major, minor, patch, qualifier })
    }

    /// Same-major compatibility, per the semver-lite rule this system uses.
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    pub fn compare(&self, other: &Version) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
            .then_with(|| self.patch.cmp(&other.patch))
            .then_with(|| match (self.qualifier.is_empty(), other.qualifier.is_empty()) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => self.qualifier.cmp(&other.qualifier),
            })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.qualifier.is_empty() {
            write!(f, "-{}", self.qualifier)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}
impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}
impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::new(0, 0, 0)
    }
}
