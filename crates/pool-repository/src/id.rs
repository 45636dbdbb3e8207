//! Replica identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Longest identifier accepted, in hex digits
pub const MAX_ID_LEN: usize = 64;

/// Opaque, immutable identifier of a file replica.
///
/// Identifiers are hex strings as handed out by the namespace. They are
/// normalised to upper case so the same file always maps to the same key and
/// the same file names under the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReplicaId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidReplicaId {
    #[error("replica id is empty")]
    Empty,
    #[error("replica id longer than {MAX_ID_LEN} characters")]
    TooLong,
    #[error("replica id contains non-hex character {0:?}")]
    NotHex(char),
}

impl ReplicaId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ReplicaId {
    type Err = InvalidReplicaId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidReplicaId::Empty);
        }
        if s.len() > MAX_ID_LEN {
            return Err(InvalidReplicaId::TooLong);
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(InvalidReplicaId::NotHex(c));
        }
        Ok(ReplicaId(s.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for ReplicaId {
    type Error = InvalidReplicaId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReplicaId> for String {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalises_case() {
        let id: ReplicaId = "0000abcdef".parse().unwrap();
        assert_eq!(id.as_str(), "0000ABCDEF");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("".parse::<ReplicaId>(), Err(InvalidReplicaId::Empty));
        assert_eq!("00/1".parse::<ReplicaId>(), Err(InvalidReplicaId::NotHex('/')));
        let long = "A".repeat(MAX_ID_LEN + 1);
        assert_eq!(long.parse::<ReplicaId>(), Err(InvalidReplicaId::TooLong));
    }

    #[test]
    fn test_serde_validates() {
        let id: ReplicaId = serde_json::from_str("\"00ff\"").unwrap();
        assert_eq!(id.to_string(), "00FF");
        assert!(serde_json::from_str::<ReplicaId>("\"../etc\"").is_err());
    }
}
