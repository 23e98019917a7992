//! CSV row formats for the backtest data directory.
//!
//! One file per series kind, all keyed by unix-second timestamps:
//! `prices.csv`, `funding.csv`, `lending.csv`, `staking.csv`,
//! `predictions.csv`. Only `prices.csv` is mandatory.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct PriceCsvRow {
    pub timestamp: u64,
    pub symbol: String,
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundingCsvRow {
    pub timestamp: u64,
    pub symbol: String,
    pub rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LendingCsvRow {
    pub timestamp: u64,
    pub asset: String,
    pub supply_index: f64,
    pub borrow_index: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StakingCsvRow {
    pub timestamp: u64,
    pub symbol: String,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionCsvRow {
    pub timestamp: u64,
    pub symbol: String,
    pub signal: f64,
}
