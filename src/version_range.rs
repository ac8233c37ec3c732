//! Interval-notation version range: `[1.0.0,2.0.0)`, `[1.0.0,)`, or a bare
//! `1.0.0` desugaring to `[1.0.0,)`.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::version::Version;

static RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\[\(])\s*([^,\]\)]*)\s*,\s*([^,\]\)]*)\s*([\]\)])$").expect("static regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRange {
    min: Option<Version>,
    max: Option<Version>,
    min_inclusive: bool,
    max_inclusive: bool,
}

impl VersionRange {
    /// Fully unbounded range: matches every version.
    pub fn unbounded() -> Self {
        Self { min: None, max: None, min_inclusive: true, max_inclusive: true }
    }

    pub fn new(min: Version, max: Version, min_inclusive: bool, max_inclusive: bool) -> Self {
        Self { min: Some(min), max: Some(max), min_inclusive, max_inclusive }
    }

    pub fn at_least(min: Version) -> Self {
        Self { min: Some(min), max: None, min_inclusive: true, max_inclusive: true }
    }

    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Ok(Self::unbounded());
        }
        let trimmed = s.trim();
        let first = trimmed.chars().next().expect("non-empty after trim check below");
        if trimmed.is_empty() {
            return Ok(Self::unbounded());
        }
        if first != '[' && first != '(' {
            let version = Version::parse(trimmed).map_err(|_| ParseError::InvalidRange(s.to_string()))?;
            return Ok(Self::at_least(version));
        }

        let caps = RANGE_RE
            .captures(trimmed)
            .ok_or_else(|| ParseError::InvalidRange(s.to_string()))?;
        let start_bracket = caps[1].chars().next().unwrap();
        let min_str = caps[2].trim();
        let max_str = caps[3].trim();
        let end_bracket = caps[4].chars().next().unwrap();

        let (min, min_inclusive) = if min_str.is_empty() {
            (None, true)
        } else {
            (Some(Version::parse(min_str)?), start_bracket == '[')
        };
        let (max, max_inclusive) = if max_str.is_empty() {
            (None, true)
        } else {
            (Some(Version::parse(max_str)?), end_bracket == ']')
        };

        if let (Some(lo), Some(hi)) = (&min, &max) {
            if lo > hi {
                return Err(ParseError::RangeOutOfOrder);
            }
            if lo == hi && (!min_inclusive || !max_inclusive) {
                return Err(ParseError::EmptyRange);
            }
        }

        Ok(Self { min, max, min_inclusive, max_inclusive })
    }

    pub fn includes(&self, version: &Version) -> bool {
        if let Some(min) = &self.min {
            if self.min_inclusive {
                if version < min {
                    return false;
                }
            } else if version <= min {
                return false;
            }
        }
        if let Some(max) = &self.max {
            if self.max_inclusive {
                if version > max {
                    return false;
                }
            } else if version >= max {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min.is_none() && self.max.is_none() {
            return write!(f, "[0.0.0,)");
        }
        match &self.min {
            Some(min) => write!(f, "{}{}", if self.min_inclusive { '[' } else { '(' }, min)?,
            None => write!(f, "(")?,
        }
        write!(f, ",")?;
        match &self.max {
            Some(max) => write!(f, "{}{}", max, if self.max_inclusive { ']' } else { ')' })?,
            None => write!(f, ")")?,
        }
        Ok(())
    }
}

impl PartialEq for VersionRange {
    fn eq(&self, other: &Self) -> bool {
        self.min == other.min
            && self.max == other.max
            && (self.min.is_none() || self.min_inclusive == other.min_inclusive)
            && (self.max.is_none() || self.max_inclusive == other.max_inclusive)
    }
}
impl Eq for VersionRange {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_unbounded() {
        let r = VersionRange::parse("").unwrap();
        assert!(r.includes(&Version::new(0, 0, 0)));
        assert!(r.includes(&Version::new(999, 0, 0)));
    }

    #[test]
    fn bare_version_desugars_to_at_least() {
        let r = VersionRange::parse("1.2.3").unwrap();
        assert!(!r.includes(&Version::new(1, 2, 2)));
        assert!(r.includes(&Version::new(1, 2, 3)));
        assert!(r.includes(&Version::new(5, 0, 0)));
    }

    #[test]
    fn inclusive_exclusive_bounds() {
        let r = VersionRange::parse("[1.0.0,2.0.0)").unwrap();
        assert!(r.includes(&Version::new(1, 0, 0)));
        assert!(r.includes(&Version::new(1, 9, 9)));
        assert!(!r.includes(&Version::new(2, 0, 0)));

        let r2 = VersionRange::parse("(1.0.0,2.0.0]").unwrap();
        assert!(!r2.includes(&Version::new(1, 0, 0)));
        assert!(r2.includes(&Version::new(2, 0, 0)));
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(VersionRange::parse("[2.0.0,1.0.0]").is_err());
    }

    #[test]
    fn rejects_empty_exclusive_point_range() {
        assert!(VersionRange::parse("(1.0.0,1.0.0)").is_err());
        assert!(VersionRange::parse("[1.0.0,1.0.0]").is_ok());
    }

    #[test]
    fn round_trips_through_display() {
        for s in ["[1.0.0,2.0.0)", "(1.0.0,2.0.0]", "[1.0.0,)"] {
            let r = VersionRange::parse(s).unwrap();
            assert_eq!(r.to_string(), s);
        }
    }
}
