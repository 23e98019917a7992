use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::csv_types::{
    FundingCsvRow, LendingCsvRow, PredictionCsvRow, PriceCsvRow, StakingCsvRow,
};
use super::{DataProvider, MarketSnapshot};
use crate::error::EngineError;

/// One `(timestamp, value)` series, sorted ascending by timestamp.
#[derive(Debug, Clone, Default)]
struct Series {
    points: Vec<(u64, f64)>,
}

impl Series {
    fn push(&mut self, timestamp: u64, value: f64) {
        self.points.push((timestamp, value));
    }

    fn sort(&mut self) {
        self.points.sort_by_key(|(ts, _)| *ts);
    }

    /// Last observation at or before `t`, if the series has started.
    fn at(&self, t: u64) -> Option<f64> {
        let idx = self.points.partition_point(|(ts, _)| *ts <= t);
        if idx == 0 {
            None
        } else {
            Some(self.points[idx - 1].1)
        }
    }
}

/// File-backed data provider for backtests.
///
/// All series are loaded up front; `snapshot(t)` is a pure lookup so the
/// same snapshot can be served to the strategy and to the venue simulators
/// without drift.
pub struct BacktestDataProvider {
    timestamps: Vec<u64>,
    prices: BTreeMap<String, Series>,
    funding_rates: BTreeMap<String, Series>,
    supply_indices: BTreeMap<String, Series>,
    borrow_indices: BTreeMap<String, Series>,
    staking_rates: BTreeMap<String, Series>,
    ml_predictions: BTreeMap<String, Series>,
}

impl BacktestDataProvider {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut timestamps: Vec<u64> = Vec::new();

        let mut prices: BTreeMap<String, Series> = BTreeMap::new();
        let price_rows: Vec<PriceCsvRow> = load_csv(data_dir, "prices.csv")?;
        anyhow::ensure!(
            !price_rows.is_empty(),
            "prices.csv is empty; at least one price series is required"
        );
        for row in price_rows {
            timestamps.push(row.timestamp);
            prices.entry(row.symbol).or_default().push(row.timestamp, row.price);
        }

        let mut funding_rates: BTreeMap<String, Series> = BTreeMap::new();
        for row in load_csv_optional::<FundingCsvRow>(data_dir, "funding.csv")? {
            timestamps.push(row.timestamp);
            funding_rates
                .entry(row.symbol)
                .or_default()
                .push(row.timestamp, row.rate);
        }

        let mut supply_indices: BTreeMap<String, Series> = BTreeMap::new();
        let mut borrow_indices: BTreeMap<String, Series> = BTreeMap::new();
        for row in load_csv_optional::<LendingCsvRow>(data_dir, "lending.csv")? {
            timestamps.push(row.timestamp);
            supply_indices
                .entry(row.asset.clone())
                .or_default()
                .push(row.timestamp, row.supply_index);
            borrow_indices
                .entry(row.asset)
                .or_default()
                .push(row.timestamp, row.borrow_index);
        }

        let mut staking_rates: BTreeMap<String, Series> = BTreeMap::new();
        for row in load_csv_optional::<StakingCsvRow>(data_dir, "staking.csv")? {
            timestamps.push(row.timestamp);
            staking_rates
                .entry(row.symbol)
                .or_default()
                .push(row.timestamp, row.conversion_rate);
        }

        let mut ml_predictions: BTreeMap<String, Series> = BTreeMap::new();
        for row in load_csv_optional::<PredictionCsvRow>(data_dir, "predictions.csv")? {
            timestamps.push(row.timestamp);
            ml_predictions
                .entry(row.symbol)
                .or_default()
                .push(row.timestamp, row.signal);
        }

        for series in prices
            .values_mut()
            .chain(funding_rates.values_mut())
            .chain(supply_indices.values_mut())
            .chain(borrow_indices.values_mut())
            .chain(staking_rates.values_mut())
            .chain(ml_predictions.values_mut())
        {
            series.sort();
        }

        timestamps.sort_unstable();
        timestamps.dedup();

        Ok(Self {
            timestamps,
            prices,
            funding_rates,
            supply_indices,
            borrow_indices,
            staking_rates,
            ml_predictions,
        })
    }

    fn collect(map: &BTreeMap<String, Series>, t: u64) -> BTreeMap<String, f64> {
        map.iter()
            .filter_map(|(symbol, series)| series.at(t).map(|v| (symbol.clone(), v)))
            .collect()
    }
}

#[async_trait]
impl DataProvider for BacktestDataProvider {
    fn timestamps(&self) -> Vec<u64> {
        self.timestamps.clone()
    }

    async fn snapshot(&self, timestamp: u64) -> Result<MarketSnapshot, EngineError> {
        Ok(MarketSnapshot {
            timestamp,
            prices: Self::collect(&self.prices, timestamp),
            funding_rates: Self::collect(&self.funding_rates, timestamp),
            supply_indices: Self::collect(&self.supply_indices, timestamp),
            borrow_indices: Self::collect(&self.borrow_indices, timestamp),
            staking_rates: Self::collect(&self.staking_rates, timestamp),
            ml_predictions: Self::collect(&self.ml_predictions, timestamp),
        })
    }
}

fn load_csv<T: for<'de> Deserialize<'de>>(data_dir: &Path, filename: &str) -> Result<Vec<T>> {
    let path = data_dir.join(filename);
    let mut rdr = csv::Reader::from_path(&path)
        .with_context(|| format!("opening CSV file {}", path.display()))?;
    let rows: Vec<T> = rdr
        .deserialize()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing CSV file {}", path.display()))?;
    Ok(rows)
}

fn load_csv_optional<T: for<'de> Deserialize<'de>>(
    data_dir: &Path,
    filename: &str,
) -> Result<Vec<T>> {
    if !data_dir.join(filename).exists() {
        return Ok(Vec::new());
    }
    load_csv(data_dir, filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_carries_last_observation_forward() {
        let mut series = Series::default();
        series.push(100, 1.0);
        series.push(300, 3.0);
        series.push(200, 2.0);
        series.sort();

        assert_eq!(series.at(50), None);
        assert_eq!(series.at(100), Some(1.0));
        assert_eq!(series.at(250), Some(2.0));
        assert_eq!(series.at(1000), Some(3.0));
    }
}
