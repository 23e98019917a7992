use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::config::{ConversionMethod, ExposureMonitorConfig};
use crate::data::MarketSnapshot;
use crate::error::EngineError;
use crate::events::{AssetExposure, DomainEvent, ExposureSnapshot};
use crate::logging::{DomainEventLogger, StructuredLogger};
use crate::model::{InstrumentKey, PositionType};
use crate::util::UtilityManager;

/// Folds positions into net delta and per-asset exposure in the reporting
/// currency, using the per-asset conversion method configured for each
/// position symbol.
pub struct ExposureMonitor {
    currency: String,
    track_assets: HashSet<String>,
    methods: BTreeMap<String, ConversionMethod>,
    util: UtilityManager,
    latest: Option<ExposureSnapshot>,
    logger: Arc<StructuredLogger>,
    events: Arc<DomainEventLogger>,
}

impl ExposureMonitor {
    pub fn new(
        config: &ExposureMonitorConfig,
        util: UtilityManager,
        logger: Arc<StructuredLogger>,
        events: Arc<DomainEventLogger>,
    ) -> Self {
        Self {
            currency: config.exposure_currency.clone(),
            track_assets: config.track_assets.iter().cloned().collect(),
            methods: config.conversion_methods.clone(),
            util,
            latest: None,
            logger,
            events,
        }
    }

    /// Unit value of a position symbol under its configured conversion
    /// method, plus the asset name the position aggregates under.
    fn convert(
        &self,
        snapshot: &MarketSnapshot,
        key: &InstrumentKey,
    ) -> Result<(String, f64), EngineError> {
        let symbol = key.symbol();
        let method = self
            .methods
            .get(symbol)
            .ok_or_else(|| EngineError::MissingConversion {
                asset: symbol.to_string(),
            })?;

        let missing = |method: &str| EngineError::MissingRate {
            asset: symbol.to_string(),
            method: method.to_string(),
        };

        match method {
            ConversionMethod::Direct => Ok((symbol.to_string(), 1.0)),
            ConversionMethod::UsdPrice => {
                let price = snapshot.price(symbol).map_err(|_| missing("usd_price"))?;
                Ok((symbol.to_string(), price))
            }
            ConversionMethod::Oracle { feed } => {
                let price = snapshot.price(feed).map_err(|_| missing("oracle"))?;
                Ok((symbol.to_string(), price))
            }
            ConversionMethod::PerpMark { underlying } => {
                let price = snapshot.price(underlying).map_err(|_| missing("perp_mark"))?;
                Ok((underlying.clone(), price))
            }
            ConversionMethod::LstRate { underlying } => {
                let price = snapshot.price(underlying).map_err(|_| missing("lst_rate"))?;
                let rate = snapshot
                    .staking_rate(symbol)
                    .map_err(|_| missing("lst_rate"))?;
                Ok((underlying.clone(), price / rate))
            }
            ConversionMethod::SupplyIndex { underlying } => {
                let price = snapshot
                    .price(underlying)
                    .map_err(|_| missing("supply_index"))?;
                let index = snapshot
                    .supply_index(underlying)
                    .map_err(|_| missing("supply_index"))?;
                Ok((underlying.clone(), price / index))
            }
            ConversionMethod::BorrowIndex { underlying } => {
                let price = snapshot
                    .price(underlying)
                    .map_err(|_| missing("borrow_index"))?;
                Ok((underlying.clone(), price))
            }
        }
    }

    pub fn compute(
        &mut self,
        timestamp: u64,
        positions: &HashMap<InstrumentKey, f64>,
        snapshot: &MarketSnapshot,
    ) -> Result<ExposureSnapshot, EngineError> {
        let mut exposures: BTreeMap<String, AssetExposure> = BTreeMap::new();
        let mut total_value = 0.0;

        for (key, amount) in positions {
            if *amount == 0.0 {
                continue;
            }
            let (asset, unit) = match self.convert(snapshot, key) {
                Ok(converted) => converted,
                Err(e) => {
                    self.logger.engine_error(&e);
                    return Err(e);
                }
            };
            let sign = if key.position_type() == PositionType::DebtToken {
                -1.0
            } else {
                1.0
            };
            let value = sign * amount * unit;
            let entry = exposures.entry(asset).or_insert(AssetExposure {
                amount: 0.0,
                value: 0.0,
            });
            entry.amount += sign * amount;
            entry.value += value;
            total_value += value;
        }

        let net_delta = exposures
            .iter()
            .filter(|(asset, _)| self.track_assets.contains(*asset))
            .map(|(_, exposure)| exposure.value)
            .sum();

        let result = ExposureSnapshot {
            timestamp,
            currency: self.currency.clone(),
            net_delta,
            exposures,
            total_value,
        };
        self.events.emit(DomainEvent::Exposure(result.clone()));
        self.latest = Some(result.clone());
        Ok(result)
    }

    pub fn latest(&self) -> Option<&ExposureSnapshot> {
        self.latest.as_ref()
    }

    /// Reuse by the utility chain: total value under the configured
    /// conversion methods, without publishing a snapshot.
    pub fn value_of(
        &self,
        positions: &HashMap<InstrumentKey, f64>,
        snapshot: &MarketSnapshot,
    ) -> Result<f64, EngineError> {
        self.util.total_value(snapshot, positions.iter())
    }
}
