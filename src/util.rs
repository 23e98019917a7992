use std::collections::BTreeMap;

use crate::config::EngineConfig;
use crate::data::MarketSnapshot;
use crate::error::EngineError;
use crate::model::{InstrumentKey, PositionType};

/// Pure derivations from a [`MarketSnapshot`].
///
/// Holds the canonical-instrument table (derivative symbol -> underlying,
/// e.g. `aUSDT` -> `USDT`, `weETH` -> `ETH`, `BTCUSDT` -> `BTC`) so every
/// component resolves prices and indices through the same lookup.
#[derive(Debug, Clone)]
pub struct UtilityManager {
    canonical: BTreeMap<String, String>,
}

impl UtilityManager {
    pub fn new(canonical: BTreeMap<String, String>) -> Self {
        Self { canonical }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.canonical_instruments())
    }

    /// Underlying symbol for a derivative, or the symbol itself when no
    /// mapping exists.
    pub fn underlying<'a>(&'a self, symbol: &'a str) -> &'a str {
        self.canonical.get(symbol).map(String::as_str).unwrap_or(symbol)
    }

    pub fn spot_price(&self, snapshot: &MarketSnapshot, symbol: &str) -> Result<f64, EngineError> {
        snapshot.price(symbol)
    }

    /// Aave supply index for an asset; accepts either the underlying or a
    /// derivative symbol (`aUSDT`).
    pub fn supply_index(&self, snapshot: &MarketSnapshot, asset: &str) -> Result<f64, EngineError> {
        snapshot.supply_index(self.underlying(asset))
    }

    pub fn borrow_index(&self, snapshot: &MarketSnapshot, asset: &str) -> Result<f64, EngineError> {
        snapshot.borrow_index(self.underlying(asset))
    }

    /// LST conversion rate (LST units minted per unit of underlying staked).
    pub fn lst_rate(&self, snapshot: &MarketSnapshot, symbol: &str) -> Result<f64, EngineError> {
        snapshot.staking_rate(symbol)
    }

    /// Reporting-currency value of one unit of the instrument, unsigned.
    pub fn unit_value(
        &self,
        snapshot: &MarketSnapshot,
        key: &InstrumentKey,
    ) -> Result<f64, EngineError> {
        let symbol = key.symbol();
        match key.position_type() {
            PositionType::BaseToken => self.spot_price(snapshot, symbol),
            PositionType::Perp => self.spot_price(snapshot, self.underlying(symbol)),
            PositionType::AToken => {
                let underlying = self.underlying(symbol);
                let price = self.spot_price(snapshot, underlying)?;
                let index = snapshot.supply_index(underlying)?;
                Ok(price / index)
            }
            // Debt is carried in underlying units.
            PositionType::DebtToken => self.spot_price(snapshot, self.underlying(symbol)),
            PositionType::Lst => {
                let underlying = self.underlying(symbol);
                let price = self.spot_price(snapshot, underlying)?;
                let rate = self.lst_rate(snapshot, symbol)?;
                Ok(price / rate)
            }
        }
    }

    /// Signed reporting-currency value of a position; debt keys contribute
    /// negatively.
    pub fn position_value(
        &self,
        snapshot: &MarketSnapshot,
        key: &InstrumentKey,
        amount: f64,
    ) -> Result<f64, EngineError> {
        let unit = self.unit_value(snapshot, key)?;
        let value = amount * unit;
        if key.position_type() == PositionType::DebtToken {
            Ok(-value)
        } else {
            Ok(value)
        }
    }

    /// Total signed value over a position map; keys with no amount are
    /// skipped, missing prices on held keys propagate as data errors.
    pub fn total_value<'a, I>(
        &self,
        snapshot: &MarketSnapshot,
        positions: I,
    ) -> Result<f64, EngineError>
    where
        I: IntoIterator<Item = (&'a InstrumentKey, &'a f64)>,
    {
        let mut total = 0.0;
        for (key, amount) in positions {
            if *amount == 0.0 {
                continue;
            }
            total += self.position_value(snapshot, key, *amount)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MarketSnapshot {
        let mut snap = MarketSnapshot {
            timestamp: 1_700_000_000,
            ..Default::default()
        };
        snap.prices.insert("USDT".into(), 1.0);
        snap.prices.insert("ETH".into(), 2_000.0);
        snap.supply_indices.insert("USDT".into(), 1.05);
        snap.staking_rates.insert("weETH".into(), 0.96);
        snap
    }

    fn util() -> UtilityManager {
        let mut canonical = BTreeMap::new();
        canonical.insert("aUSDT".to_string(), "USDT".to_string());
        canonical.insert("weETH".to_string(), "ETH".to_string());
        UtilityManager::new(canonical)
    }

    #[test]
    fn atoken_units_value_at_principal() {
        let key = InstrumentKey::parse("aave_v3:aToken:aUSDT").unwrap();
        let value = util().position_value(&snapshot(), &key, 10_500.0).unwrap();
        assert!((value - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn lst_units_value_through_conversion_rate() {
        let key = InstrumentKey::parse("etherfi:LST:weETH").unwrap();
        // 96 weETH at rate 0.96 redeems 100 ETH at 2000.
        let value = util().position_value(&snapshot(), &key, 96.0).unwrap();
        assert!((value - 200_000.0).abs() < 1e-6);
    }

    #[test]
    fn debt_contributes_negatively() {
        let mut snap = snapshot();
        snap.borrow_indices.insert("ETH".into(), 1.02);
        let key = InstrumentKey::parse("aave_v3:debtToken:debtETH").unwrap();
        let mut canonical = BTreeMap::new();
        canonical.insert("debtETH".to_string(), "ETH".to_string());
        let util = UtilityManager::new(canonical);
        let value = util.position_value(&snap, &key, 10.0).unwrap();
        assert!((value + 20_000.0).abs() < 1e-6);
    }
}
