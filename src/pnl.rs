use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{AttributionType, PnlMonitorConfig};
use crate::data::MarketSnapshot;
use crate::error::EngineError;
use crate::events::{DomainEvent, PnlCalculation};
use crate::logging::{DomainEventLogger, StructuredLogger};
use crate::model::{InstrumentKey, PositionType};
use crate::util::UtilityManager;

/// Average-entry cost basis for one perp key. Perp book value is the
/// unrealized P&L against this entry, never the raw notional.
#[derive(Debug, Clone, Copy, Default)]
struct PerpBasis {
    amount: f64,
    entry_price: f64,
}

/// Marks carried between computes for incremental attribution.
#[derive(Debug, Clone)]
struct KeyMark {
    amount: f64,
    price: f64,
    supply_index: Option<f64>,
    staking_rate: Option<f64>,
}

/// Computes realized/unrealized P&L and its attribution.
///
/// Realized is the settled cash flows (funding, realized perp closes, fees
/// paid); unrealized is the mark-to-market book change against the
/// pre-trade baseline. `compute` calculates and caches; the read accessors
/// are side-effect-free so results consumers can poll them freely.
pub struct PnlMonitor {
    attribution_types: Vec<AttributionType>,
    reconciliation_tolerance: f64,
    initial_capital: f64,
    util: UtilityManager,
    history: Vec<PnlCalculation>,
    cumulative: BTreeMap<String, f64>,
    fees_paid: f64,
    funding_received: f64,
    pending_fees: f64,
    prev_timestamp: Option<u64>,
    prev_marks: HashMap<InstrumentKey, KeyMark>,
    perp_basis: HashMap<InstrumentKey, PerpBasis>,
    realized_perp: f64,
    /// Pre-trade book value in the reporting currency, captured once at
    /// the first tick. Unrealized P&L marks against this, which keeps the
    /// math honest when capital is funded in a non-reporting asset.
    initial_book: Option<f64>,
    initial_by_venue: Option<BTreeMap<String, f64>>,
    initial_by_asset: Option<BTreeMap<String, f64>>,
    latest: Option<PnlCalculation>,
    logger: Arc<StructuredLogger>,
    events: Arc<DomainEventLogger>,
}

impl PnlMonitor {
    pub fn new(
        config: &PnlMonitorConfig,
        initial_capital: f64,
        util: UtilityManager,
        logger: Arc<StructuredLogger>,
        events: Arc<DomainEventLogger>,
    ) -> Self {
        let cumulative = config
            .attribution_types
            .iter()
            .map(|a| (a.as_str().to_string(), 0.0))
            .collect();
        Self {
            attribution_types: config.attribution_types.clone(),
            reconciliation_tolerance: config.reconciliation_tolerance,
            initial_capital,
            util,
            history: Vec::new(),
            cumulative,
            fees_paid: 0.0,
            funding_received: 0.0,
            pending_fees: 0.0,
            prev_timestamp: None,
            prev_marks: HashMap::new(),
            perp_basis: HashMap::new(),
            realized_perp: 0.0,
            initial_book: None,
            initial_by_venue: None,
            initial_by_asset: None,
            latest: None,
            logger,
            events,
        }
    }

    pub fn reconciliation_tolerance(&self) -> f64 {
        self.reconciliation_tolerance
    }

    /// Capture the pre-trade book value as the unrealized-P&L baseline.
    /// No-op after the first call.
    pub fn ensure_baseline(
        &mut self,
        positions: &HashMap<InstrumentKey, f64>,
        snapshot: &MarketSnapshot,
    ) -> Result<(), EngineError> {
        if self.initial_book.is_some() {
            return Ok(());
        }
        let mut book = 0.0;
        for (key, amount) in positions {
            if *amount != 0.0 {
                book += self.book_value(key, *amount, snapshot)?;
            }
        }
        self.initial_book = Some(book);
        Ok(())
    }

    pub fn book_baseline(&self) -> Option<f64> {
        self.initial_book
    }

    fn enabled(&self, attribution: AttributionType) -> bool {
        self.attribution_types.contains(&attribution)
    }

    /// Record a handshake fee, converted to the reporting currency. Folded
    /// into the next `compute`.
    pub fn note_fee(&mut self, amount: f64, currency: &str, snapshot: &MarketSnapshot) {
        if amount == 0.0 {
            return;
        }
        let price = match self.util.spot_price(snapshot, self.util.underlying(currency)) {
            Ok(p) => p,
            Err(_) => {
                let err = EngineError::MissingAttributionInput {
                    attribution: AttributionType::Fees.as_str().to_string(),
                    detail: format!("no price for fee currency `{currency}`"),
                };
                self.logger.engine_error(&err);
                return;
            }
        };
        self.pending_fees += amount * price;
    }

    fn mark(&self, snapshot: &MarketSnapshot, key: &InstrumentKey, amount: f64) -> Option<KeyMark> {
        let underlying = self.util.underlying(key.symbol()).to_string();
        let price = snapshot.prices.get(&underlying).copied()?;
        Some(KeyMark {
            amount,
            price,
            supply_index: snapshot.supply_indices.get(&underlying).copied(),
            staking_rate: snapshot.staking_rates.get(key.symbol()).copied(),
        })
    }

    pub fn compute(
        &mut self,
        timestamp: u64,
        positions: &HashMap<InstrumentKey, f64>,
        snapshot: &MarketSnapshot,
    ) -> Result<PnlCalculation, EngineError> {
        let advancing = self.prev_timestamp.is_some_and(|prev| timestamp > prev);

        // ── Per-tick attribution increments ──
        let mut funding_increment = 0.0;
        let mut price_increment = 0.0;
        let mut lending_increment = 0.0;
        let mut staking_increment = 0.0;

        if advancing {
            for (key, mark) in &self.prev_marks {
                if mark.amount == 0.0 {
                    continue;
                }
                match key.position_type() {
                    PositionType::Perp => {
                        // Longs pay shorts when the rate is positive.
                        if let Ok(rate) = snapshot.funding_rate(key.symbol()) {
                            funding_increment += -mark.amount * mark.price * rate;
                        }
                        if let Some(price_now) = snapshot
                            .prices
                            .get(self.util.underlying(key.symbol()))
                            .copied()
                        {
                            price_increment += mark.amount * (price_now - mark.price);
                        }
                    }
                    PositionType::BaseToken => {
                        if let Some(price_now) = snapshot.prices.get(key.symbol()).copied() {
                            price_increment += mark.amount * (price_now - mark.price);
                        }
                    }
                    PositionType::AToken => {
                        let underlying = self.util.underlying(key.symbol());
                        let price_now = snapshot.prices.get(underlying).copied();
                        let index_now = snapshot.supply_indices.get(underlying).copied();
                        if let (Some(p), Some(i_now), Some(i_prev)) =
                            (price_now, index_now, mark.supply_index)
                        {
                            if i_prev > 0.0 && i_now > 0.0 {
                                // Redeemable growth from index drift.
                                lending_increment +=
                                    mark.amount * p * (i_now / i_prev - 1.0) / i_now;
                                price_increment += mark.amount * (p - mark.price) / i_prev;
                            }
                        }
                    }
                    PositionType::DebtToken => {
                        let underlying = self.util.underlying(key.symbol());
                        if let Some(p) = snapshot.prices.get(underlying).copied() {
                            price_increment += -mark.amount * (p - mark.price);
                        }
                    }
                    PositionType::Lst => {
                        let underlying = self.util.underlying(key.symbol());
                        let price_now = snapshot.prices.get(underlying).copied();
                        let rate_now = snapshot.staking_rates.get(key.symbol()).copied();
                        if let (Some(p), Some(r_now), Some(r_prev)) =
                            (price_now, rate_now, mark.staking_rate)
                        {
                            if r_prev > 0.0 && r_now > 0.0 {
                                staking_increment +=
                                    mark.amount * p * (r_prev / r_now - 1.0) / r_prev;
                                price_increment += mark.amount * (p - mark.price) / r_prev;
                            }
                        }
                    }
                }
            }
        }

        self.funding_received += funding_increment;
        self.fees_paid += self.pending_fees;
        self.pending_fees = 0.0;

        let increments = [
            (AttributionType::Funding, funding_increment),
            (AttributionType::Price, price_increment),
            (AttributionType::LendingYield, lending_increment),
            (AttributionType::StakingYield, staking_increment),
        ];
        for (attribution, increment) in increments {
            if self.enabled(attribution) && increment != 0.0 {
                *self
                    .cumulative
                    .entry(attribution.as_str().to_string())
                    .or_insert(0.0) += increment;
            }
        }

        self.update_perp_basis(positions, snapshot)?;

        // ── Book valuation ──
        let mut total_value = 0.0;
        let mut by_venue: BTreeMap<String, f64> = BTreeMap::new();
        let mut by_asset: BTreeMap<String, f64> = BTreeMap::new();
        for (key, amount) in positions {
            if *amount == 0.0 {
                continue;
            }
            let value = self.book_value(key, *amount, snapshot)?;
            total_value += value;
            *by_venue.entry(key.venue().to_string()).or_insert(0.0) += value;
            *by_asset
                .entry(self.util.underlying(key.symbol()).to_string())
                .or_insert(0.0) += value;
        }

        let initial_by_venue = self
            .initial_by_venue
            .get_or_insert_with(|| by_venue.clone())
            .clone();
        let initial_by_asset = self
            .initial_by_asset
            .get_or_insert_with(|| by_asset.clone())
            .clone();

        let venue_pnl: BTreeMap<String, f64> = by_venue
            .iter()
            .map(|(venue, value)| {
                (
                    venue.clone(),
                    value - initial_by_venue.get(venue).copied().unwrap_or(0.0),
                )
            })
            .collect();
        let asset_pnl: BTreeMap<String, f64> = by_asset
            .iter()
            .map(|(asset, value)| {
                (
                    asset.clone(),
                    value - initial_by_asset.get(asset).copied().unwrap_or(0.0),
                )
            })
            .collect();

        if self.enabled(AttributionType::Fees) {
            self.cumulative
                .insert(AttributionType::Fees.as_str().to_string(), -self.fees_paid);
        }
        let fees_cumulative = self.fees_paid;

        let realized = self.funding_received + self.realized_perp - fees_cumulative;
        let baseline = self.initial_book.unwrap_or(self.initial_capital);
        let unrealized = total_value - baseline;

        let result = PnlCalculation {
            timestamp,
            realized,
            unrealized,
            total: realized + unrealized,
            fees: fees_cumulative,
            funding: self.funding_received,
            by_venue: venue_pnl,
            by_asset: asset_pnl,
            attribution: self.cumulative.clone(),
        };

        // Re-mark for the next increment.
        let marks: HashMap<InstrumentKey, KeyMark> = positions
            .iter()
            .filter(|(_, amount)| **amount != 0.0)
            .filter_map(|(key, amount)| {
                self.mark(snapshot, key, *amount).map(|m| (key.clone(), m))
            })
            .collect();
        self.prev_marks = marks;
        self.prev_timestamp = Some(timestamp);

        self.events.emit(DomainEvent::Pnl(result.clone()));
        self.latest = Some(result.clone());
        self.history.push(result.clone());
        Ok(result)
    }

    /// Fold perp position changes into the average-entry basis, realizing
    /// P&L on the closed portion. Idempotent for an unchanged book.
    fn update_perp_basis(
        &mut self,
        positions: &HashMap<InstrumentKey, f64>,
        snapshot: &MarketSnapshot,
    ) -> Result<(), EngineError> {
        for (key, amount) in positions {
            if key.position_type() != PositionType::Perp {
                continue;
            }
            let basis = self.perp_basis.entry(key.clone()).or_default();
            let current = *amount;
            if (current - basis.amount).abs() < 1e-12 {
                continue;
            }
            let price = snapshot.price(self.util.underlying(key.symbol()))?;
            let delta = current - basis.amount;

            let same_side = basis.amount == 0.0
                || (basis.amount > 0.0 && delta > 0.0)
                || (basis.amount < 0.0 && delta < 0.0);
            if same_side {
                // Adding: blend the entry.
                let new_amount = basis.amount + delta;
                basis.entry_price = (basis.amount.abs() * basis.entry_price
                    + delta.abs() * price)
                    / new_amount.abs();
                basis.amount = new_amount;
            } else if delta.abs() <= basis.amount.abs() {
                // Reducing: realize the closed portion.
                self.realized_perp += -delta * (price - basis.entry_price);
                basis.amount = current;
            } else {
                // Flip: close out entirely, reopen the remainder here.
                self.realized_perp += basis.amount * (price - basis.entry_price);
                basis.amount = current;
                basis.entry_price = price;
            }
        }
        Ok(())
    }

    /// Book value of one position: perps mark unrealized against entry,
    /// everything else values through the utility chain.
    fn book_value(
        &self,
        key: &InstrumentKey,
        amount: f64,
        snapshot: &MarketSnapshot,
    ) -> Result<f64, EngineError> {
        if key.position_type() == PositionType::Perp {
            let price = snapshot.price(self.util.underlying(key.symbol()))?;
            let basis = self.perp_basis.get(key).copied().unwrap_or_default();
            return Ok(amount * (price - basis.entry_price));
        }
        self.util.position_value(snapshot, key, amount)
    }

    // ── Side-effect-free reads ──

    pub fn get_latest(&self) -> Option<&PnlCalculation> {
        self.latest.as_ref()
    }

    pub fn get_history(&self, n: usize) -> &[PnlCalculation] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    pub fn get_attribution_cumulative(&self) -> &BTreeMap<String, f64> {
        &self.cumulative
    }
}
