//! Wire protocol versioning
//!
//! The version travels as a `"major.minor"` string. Every outgoing envelope
//! carries it; input lines may carry one and are rejected when they need a
//! newer revision than this worker speaks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Whether a peer speaking `peer` can be understood by `self`
    pub fn accepts(&self, peer: &ProtocolVersion) -> bool {
        self.major == peer.major && peer.minor <= self.minor
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    /// Accepts `"1"`, `"1.2"` and ignores a trailing patch (`"1.2.7"`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::protocol(format!("bad protocol version '{}'", s));
        let mut parts = s.trim().split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| bad())?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ProtocolVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(v("1"), ProtocolVersion { major: 1, minor: 0 });
        assert_eq!(v("1.3"), ProtocolVersion { major: 1, minor: 3 });
        assert_eq!(v(" 2.1.9 "), ProtocolVersion { major: 2, minor: 1 });
        assert!("".parse::<ProtocolVersion>().is_err());
        assert!("one.two".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_accepts_older_minor_only() {
        let worker = v("1.1");
        assert!(worker.accepts(&v("1.0")));
        assert!(worker.accepts(&v("1.1")));
        assert!(!worker.accepts(&v("1.2")));
        assert!(!worker.accepts(&v("2.0")));
    }

    #[test]
    fn test_serialized_as_string() {
        assert_eq!(serde_json::to_value(PROTOCOL_VERSION).unwrap(), "1.0");
        let parsed: ProtocolVersion = serde_json::from_str("\"1.0\"").unwrap();
        assert_eq!(parsed, PROTOCOL_VERSION);
    }
}
