//! Disk space values with unit suffixes.
//!
//! Accepted forms are `<n>`, `<n>k`, `<n>m`, `<n>g` and `<n>t` (binary
//! multiples, case-insensitive) and `infinity`, `inf` or `-` for no limit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const UNITS: [(char, u64); 4] = [
    ('t', 1 << 40),
    ('g', 1 << 30),
    ('m', 1 << 20),
    ('k', 1 << 10),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizeParseError {
    #[error("empty size value")]
    Empty,
    #[error("Negative value is not allowed: {0}")]
    Negative(String),
    #[error("invalid size value: {0}")]
    Invalid(String),
    #[error("size value out of range: {0}")]
    Overflow(String),
}

/// A byte count or an explicit "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DiskSpace {
    Bytes(u64),
    Infinite,
}

impl DiskSpace {
    /// The byte count, or `None` for [`DiskSpace::Infinite`].
    pub fn bytes(self) -> Option<u64> {
        match self {
            DiskSpace::Bytes(n) => Some(n),
            DiskSpace::Infinite => None,
        }
    }

    pub fn is_infinite(self) -> bool {
        matches!(self, DiskSpace::Infinite)
    }
}

impl FromStr for DiskSpace {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err(SizeParseError::Empty);
        }
        if matches!(value.as_str(), "infinity" | "inf" | "-") {
            return Ok(DiskSpace::Infinite);
        }
        if value.starts_with('-') {
            return Err(SizeParseError::Negative(s.to_string()));
        }

        let (digits, multiplier) = match value.chars().last() {
            Some(c) if c.is_ascii_alphabetic() => {
                let multiplier = UNITS
                    .iter()
                    .find(|(unit, _)| *unit == c)
                    .map(|(_, m)| *m)
                    .ok_or_else(|| SizeParseError::Invalid(s.to_string()))?;
                (&value[..value.len() - 1], multiplier)
            }
            _ => (value.as_str(), 1),
        };

        let n: u64 = digits
            .parse()
            .map_err(|_| SizeParseError::Invalid(s.to_string()))?;
        n.checked_mul(multiplier)
            .map(DiskSpace::Bytes)
            .ok_or_else(|| SizeParseError::Overflow(s.to_string()))
    }
}

impl fmt::Display for DiskSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DiskSpace::Infinite => write!(f, "Infinity"),
            DiskSpace::Bytes(0) => write!(f, "0"),
            DiskSpace::Bytes(n) => {
                for (unit, multiplier) in UNITS {
                    if n % multiplier == 0 {
                        return write!(f, "{}{}", n / multiplier, unit);
                    }
                }
                write!(f, "{}", n)
            }
        }
    }
}

impl TryFrom<String> for DiskSpace {
    type Error = SizeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DiskSpace> for String {
    fn from(value: DiskSpace) -> Self {
        value.to_string()
    }
}
