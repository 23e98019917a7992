use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of position slot an instrument key addresses.
///
/// The wire form matches the canonical key syntax (`aToken`, `debtToken`,
/// `BaseToken`, `Perp`, `LST`), which is why the variants carry explicit
/// rename tags rather than a blanket rename_all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PositionType {
    BaseToken,
    AToken,
    DebtToken,
    Perp,
    Lst,
}

impl PositionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionType::BaseToken => "BaseToken",
            PositionType::AToken => "aToken",
            PositionType::DebtToken => "debtToken",
            PositionType::Perp => "Perp",
            PositionType::Lst => "LST",
        }
    }
}

impl fmt::Display for PositionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstrumentKeyError {
    #[error("instrument key `{0}` must have exactly three `:`-separated parts")]
    Shape(String),

    #[error("instrument key `{key}` has unknown position type `{position_type}`")]
    UnknownPositionType { key: String, position_type: String },

    #[error("instrument key `{0}` has an empty component")]
    EmptyComponent(String),
}

/// Canonical `venue:position_type:symbol` triple.
///
/// This is the only place keys are parsed; every component resolves keys
/// through [`InstrumentKey::parse`] so a malformed key is rejected once, at
/// the boundary, rather than partially understood downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentKey {
    venue: String,
    position_type: PositionType,
    symbol: String,
}

impl InstrumentKey {
    pub fn new(venue: &str, position_type: PositionType, symbol: &str) -> Self {
        Self {
            venue: venue.to_string(),
            position_type,
            symbol: symbol.to_string(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, InstrumentKeyError> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(InstrumentKeyError::Shape(raw.to_string()));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(InstrumentKeyError::EmptyComponent(raw.to_string()));
        }
        let position_type = match parts[1] {
            "BaseToken" => PositionType::BaseToken,
            "aToken" => PositionType::AToken,
            "debtToken" => PositionType::DebtToken,
            "Perp" => PositionType::Perp,
            "LST" => PositionType::Lst,
            other => {
                return Err(InstrumentKeyError::UnknownPositionType {
                    key: raw.to_string(),
                    position_type: other.to_string(),
                });
            }
        };
        Ok(Self {
            venue: parts[0].to_string(),
            position_type,
            symbol: parts[2].to_string(),
        })
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    pub fn position_type(&self) -> PositionType {
        self.position_type
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.venue, self.position_type, self.symbol)
    }
}

impl FromStr for InstrumentKey {
    type Err = InstrumentKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstrumentKey::parse(s)
    }
}

impl Serialize for InstrumentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InstrumentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        InstrumentKey::parse(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_keys() {
        let key = InstrumentKey::parse("aave_v3:aToken:aUSDT").unwrap();
        assert_eq!(key.venue(), "aave_v3");
        assert_eq!(key.position_type(), PositionType::AToken);
        assert_eq!(key.symbol(), "aUSDT");
        assert_eq!(key.to_string(), "aave_v3:aToken:aUSDT");

        let key = InstrumentKey::parse("binance:Perp:BTCUSDT").unwrap();
        assert_eq!(key.position_type(), PositionType::Perp);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(
            InstrumentKey::parse("wallet:USDT"),
            Err(InstrumentKeyError::Shape(_))
        ));
        assert!(matches!(
            InstrumentKey::parse("wallet:Spot:USDT"),
            Err(InstrumentKeyError::UnknownPositionType { .. })
        ));
        assert!(matches!(
            InstrumentKey::parse("wallet::USDT"),
            Err(InstrumentKeyError::EmptyComponent(_))
        ));
    }

    #[test]
    fn serde_round_trips_as_string() {
        let key = InstrumentKey::parse("etherfi:LST:weETH").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"etherfi:LST:weETH\"");
        let back: InstrumentKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
