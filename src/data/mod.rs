pub mod backtest;
pub mod csv_types;
pub mod live;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::EngineError;

/// Immutable view of the market at one engine timestamp.
///
/// Within a tick every component reads the same snapshot; the maps are
/// last-observation-carried-forward from whatever feeds the provider has.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub timestamp: u64,
    /// Spot USD price per symbol (`BTC`, `ETH`, `USDT`, ...).
    pub prices: BTreeMap<String, f64>,
    /// Funding rate per perp symbol, per funding interval.
    pub funding_rates: BTreeMap<String, f64>,
    /// Aave-style supply index per asset.
    pub supply_indices: BTreeMap<String, f64>,
    /// Aave-style borrow index per asset.
    pub borrow_indices: BTreeMap<String, f64>,
    /// LST conversion rate per staking symbol (LST units per unit staked).
    pub staking_rates: BTreeMap<String, f64>,
    /// Optional model signals per symbol, in [-1, 1].
    pub ml_predictions: BTreeMap<String, f64>,
}

impl MarketSnapshot {
    fn require(&self, map: &BTreeMap<String, f64>, field: &str) -> Result<f64, EngineError> {
        map.get(field)
            .copied()
            .ok_or_else(|| EngineError::MissingSnapshotField {
                timestamp: self.timestamp,
                field: field.to_string(),
            })
    }

    pub fn price(&self, symbol: &str) -> Result<f64, EngineError> {
        self.require(&self.prices, symbol)
    }

    pub fn funding_rate(&self, symbol: &str) -> Result<f64, EngineError> {
        self.require(&self.funding_rates, symbol)
    }

    pub fn supply_index(&self, asset: &str) -> Result<f64, EngineError> {
        self.require(&self.supply_indices, asset)
    }

    pub fn borrow_index(&self, asset: &str) -> Result<f64, EngineError> {
        self.require(&self.borrow_indices, asset)
    }

    pub fn staking_rate(&self, symbol: &str) -> Result<f64, EngineError> {
        self.require(&self.staking_rates, symbol)
    }

    pub fn prediction(&self, symbol: &str) -> Option<f64> {
        self.ml_predictions.get(symbol).copied()
    }
}

/// Market-data capability the engine consumes.
///
/// Backtest implementations serve file-backed series; live implementations
/// poll venue feeds. Either way, all values in a snapshot are scoped to the
/// requested timestamp.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Timestamp series that drives the backtest clock. Live providers
    /// return an empty series (the clock is wall-time driven).
    fn timestamps(&self) -> Vec<u64>;

    async fn snapshot(&self, timestamp: u64) -> Result<MarketSnapshot, EngineError>;
}
