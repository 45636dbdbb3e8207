//! Sticky records pin a replica against eviction.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A pin held by `owner`, valid until `expires_at` (`None` never expires).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyRecord {
    pub owner: String,
    #[serde(with = "expiry_millis")]
    pub expires_at: Option<SystemTime>,
}

impl StickyRecord {
    pub fn new(owner: impl Into<String>, expires_at: Option<SystemTime>) -> Self {
        Self {
            owner: owner.into(),
            expires_at,
        }
    }

    pub fn forever(owner: impl Into<String>) -> Self {
        Self::new(owner, None)
    }

    /// A pin expiring `lifetime` from now.
    pub fn for_duration(owner: impl Into<String>, lifetime: Duration) -> Self {
        Self::new(owner, Some(SystemTime::now() + lifetime))
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        match self.expires_at {
            None => true,
            Some(t) => t > now,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    /// Whether this pin lasts at least as long as `other`.
    pub fn outlives(&self, other: &StickyRecord) -> bool {
        match (self.expires_at, other.expires_at) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => a >= b,
        }
    }

    /// Expiry in milliseconds since the epoch, -1 for never.
    pub fn expires_millis(&self) -> i64 {
        expiry_millis::to_millis(self.expires_at)
    }
}

impl fmt::Display for StickyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.owner, self.expires_millis())
    }
}

/// Persisted as epoch milliseconds, -1 meaning never.
pub(crate) mod expiry_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn to_millis(t: Option<SystemTime>) -> i64 {
        match t {
            None => -1,
            Some(t) => t
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }
    }

    pub fn from_millis(ms: i64) -> Option<SystemTime> {
        if ms < 0 {
            None
        } else {
            Some(UNIX_EPOCH + Duration::from_millis(ms as u64))
        }
    }

    pub fn serialize<S: Serializer>(t: &Option<SystemTime>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(to_millis(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SystemTime>, D::Error> {
        Ok(from_millis(i64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        let now = SystemTime::now();
        assert!(StickyRecord::forever("a").is_valid_at(now));
        assert!(!StickyRecord::new("a", Some(now)).is_valid_at(now));
        assert!(StickyRecord::new("a", Some(now + Duration::from_secs(1))).is_valid_at(now));
    }

    #[test]
    fn test_outlives() {
        let now = SystemTime::now();
        let short = StickyRecord::new("a", Some(now));
        let long = StickyRecord::new("a", Some(now + Duration::from_secs(5)));
        let never = StickyRecord::forever("a");
        assert!(long.outlives(&short));
        assert!(!short.outlives(&long));
        assert!(never.outlives(&long));
        assert!(!long.outlives(&never));
    }

    #[test]
    fn test_persisted_form() {
        let record = StickyRecord::new("system", Some(UNIX_EPOCH + Duration::from_millis(1500)));
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"owner":"system","expires_at":1500}"#);
        let back: StickyRecord = serde_json::from_str(r#"{"owner":"x","expires_at":-1}"#).unwrap();
        assert_eq!(back, StickyRecord::forever("x"));
        assert_eq!(record.to_string(), "system 1500");
    }
}
