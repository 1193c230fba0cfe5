//! Log sequence numbers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A position in the source write-ahead log (a PostgreSQL LSN).
///
/// Positions are totally ordered and render as two 32-bit hexadecimal
/// halves separated by a slash, e.g. `16/B374D848`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamPosition(u64);

impl StreamPosition {
    pub const ZERO: StreamPosition = StreamPosition(0);

    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for StreamPosition {
    fn from(lsn: u64) -> Self {
        Self(lsn)
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream position '{input}': expected two hexadecimal halves like 0/16B3748")]
pub struct PositionParseError {
    pub input: String,
}

impl FromStr for StreamPosition {
    type Err = PositionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PositionParseError {
            input: s.to_string(),
        };
        let (high, low) = s.trim().split_once('/').ok_or_else(err)?;
        let high = u32::from_str_radix(high, 16).map_err(|_| err())?;
        let low = u32::from_str_radix(low, 16).map_err(|_| err())?;
        Ok(Self((u64::from(high) << 32) | u64::from(low)))
    }
}

impl Serialize for StreamPosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamPosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let position = StreamPosition::new(0x16_B374_D848);
        assert_eq!(position.to_string(), "16/B374D848");
        assert_eq!("16/B374D848".parse::<StreamPosition>().unwrap(), position);
        assert_eq!("0/0".parse::<StreamPosition>().unwrap(), StreamPosition::ZERO);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("16B374D848".parse::<StreamPosition>().is_err());
        assert!("x/1".parse::<StreamPosition>().is_err());
        assert!("1/100000000".parse::<StreamPosition>().is_err());
    }

    #[test]
    fn test_ordering_follows_numeric_value() {
        let a: StreamPosition = "0/FFFFFFFF".parse().unwrap();
        let b: StreamPosition = "1/0".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_serde_uses_string_form() {
        let json = serde_json::to_string(&StreamPosition::new(0x1_0000_0010)).unwrap();
        assert_eq!(json, "\"1/10\"");
        let back: StreamPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_u64(), 0x1_0000_0010);
    }
}
