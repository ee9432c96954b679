//! LSN (Log Sequence Number) positions in the Postgres write-ahead log.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A position in the upstream change stream.
///
/// Ordered, so checkpoints can be compared for monotonicity. The textual
/// form is the Postgres `X/Y` notation, which is also what gets persisted
/// and sent to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Parse an LSN from "X/Y" format.
    pub fn parse(s: &str) -> Result<Self> {
        let (high, low) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::InvalidLsn(s.to_string()))?;

        let high = u32::from_str_radix(high, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;

        Ok(Self((u64::from(high) << 32) | u64::from(low)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Lsn::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsn() {
        assert_eq!(Lsn::parse("0/16B3748").unwrap(), Lsn::new(0x16B3748));
        assert_eq!(
            Lsn::parse("1/16B3748").unwrap(),
            Lsn::new(0x1_0000_0000 + 0x16B3748)
        );
        assert_eq!(Lsn::parse(" 0/10\n").unwrap(), Lsn::new(0x10));
        assert!(Lsn::parse("invalid").is_err());
        assert!(Lsn::parse("0/").is_err());
        assert!(Lsn::parse("1/2/3").is_err());
    }

    #[test]
    fn test_format_lsn() {
        assert_eq!(Lsn::new(0x16B3748).to_string(), "0/16B3748");
        assert_eq!(Lsn::new(0x1_0000_0000 + 0x16B3748).to_string(), "1/16B3748");
    }

    #[test]
    fn test_ordering_follows_wal_position() {
        let a = Lsn::parse("0/FFFFFFFF").unwrap();
        let b = Lsn::parse("1/0").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_serde_uses_text_form() {
        let json = serde_json::to_string(&Lsn::new(0x2A)).unwrap();
        assert_eq!(json, "\"0/2A\"");

        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Lsn::new(0x2A));
    }
}
