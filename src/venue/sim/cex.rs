use std::collections::BTreeMap;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use super::{SharedLedger, SimLedger};
use crate::config::VenueConfig;
use crate::data::MarketSnapshot;
use crate::error::VenueError;
use crate::model::{
    ExecutionHandshake, InstrumentKey, OperationType, Order, PositionType,
};
use crate::strategy::deltas::{self, FeeContext};
use crate::util::UtilityManager;
use crate::venue::ExecutionInterface;

const BALANCE_TOLERANCE: f64 = 1e-9;

/// Backtest venue for one centralized exchange: spot fills, perp position
/// changes, and transfers in/out.
///
/// Slippage is a seeded, opt-in realism knob; at the default 0 bps fills
/// land exactly on the snapshot price so backtest reconciliation is exact.
pub struct CexSimulator {
    name: String,
    config: VenueConfig,
    util: UtilityManager,
    ledger: SharedLedger,
    max_slippage_bps: f64,
    rng: StdRng,
}

impl CexSimulator {
    pub fn new(
        name: &str,
        config: VenueConfig,
        util: UtilityManager,
        ledger: SharedLedger,
        max_slippage_bps: f64,
        seed: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            util,
            ledger,
            max_slippage_bps,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn compute_slippage(&mut self) -> f64 {
        if self.max_slippage_bps <= 0.0 {
            return 0.0;
        }
        let frac: f64 = self.rng.random();
        frac * self.max_slippage_bps / 10_000.0
    }

    /// Margin rule: post-trade perp notional must stay within
    /// `max_leverage` times the exchange balance value.
    fn check_margin(
        &self,
        ledger: &SimLedger,
        order: &Order,
        snapshot: &MarketSnapshot,
    ) -> Result<(), VenueError> {
        let perp_key = InstrumentKey::new(&self.name, PositionType::Perp, &order.target_token);
        let current = ledger.get(&perp_key);
        let after = current + order.amount;

        let underlying = self.util.underlying(&order.target_token);
        let price = self
            .util
            .spot_price(snapshot, underlying)
            .map_err(|e| VenueError::InvalidState(e.to_string()))?;
        let notional = after.abs() * price;

        let mut collateral = 0.0;
        for (key, amount) in ledger.positions() {
            if key.venue() == self.name
                && key.position_type() == PositionType::BaseToken
                && *amount > 0.0
            {
                let value = self
                    .util
                    .position_value(snapshot, key, *amount)
                    .map_err(|e| VenueError::InvalidState(e.to_string()))?;
                collateral += value;
            }
        }

        if notional > self.config.max_leverage * collateral + BALANCE_TOLERANCE {
            return Err(VenueError::InvalidState(format!(
                "perp notional {notional:.2} exceeds {}x leverage on collateral {collateral:.2}",
                self.config.max_leverage
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionInterface for CexSimulator {
    fn venue(&self) -> &str {
        &self.name
    }

    async fn execute(
        &mut self,
        order: &Order,
        snapshot: &MarketSnapshot,
    ) -> Result<ExecutionHandshake, VenueError> {
        if !matches!(
            order.operation_type,
            OperationType::SpotTrade | OperationType::PerpTrade | OperationType::Transfer
        ) {
            return Ok(ExecutionHandshake::failed(
                &order.operation_id,
                "VEN-003",
                &format!(
                    "operation {} not supported by exchange venue",
                    order.operation_type
                ),
                true,
            ));
        }
        if order.amount.abs() < self.config.min_amount {
            return Ok(ExecutionHandshake::failed(
                &order.operation_id,
                "VEN-003",
                &format!(
                    "amount {} below venue minimum {}",
                    order.amount, self.config.min_amount
                ),
                true,
            ));
        }

        let fees = FeeContext {
            fee_bps: self.config.fee_bps,
            flash_fee_bps: 0.0,
        };
        let derived = match deltas::derive(order, snapshot, &self.util, &fees) {
            Ok(d) => d,
            Err(e) => {
                return Ok(ExecutionHandshake::failed(
                    &order.operation_id,
                    "VEN-003",
                    &e.to_string(),
                    true,
                ));
            }
        };

        let slippage = self.compute_slippage();

        let mut ledger = self.ledger.lock().expect("sim ledger poisoned");

        if order.operation_type == OperationType::PerpTrade {
            if let Err(e) = self.check_margin(&ledger, order, snapshot) {
                return Ok(ExecutionHandshake::failed(
                    &order.operation_id,
                    e.code(),
                    &e.to_string(),
                    true,
                ));
            }
        }

        let mut scratch = SimLedger::default();
        scratch.replace(ledger.clone_inner());
        let mut applied: BTreeMap<InstrumentKey, f64> = BTreeMap::new();
        for delta in &derived {
            // Slippage degrades the received side of a spot fill.
            let amount = if slippage > 0.0
                && order.operation_type == OperationType::SpotTrade
                && delta.delta_amount > 0.0
            {
                delta.delta_amount * (1.0 - slippage)
            } else {
                delta.delta_amount
            };
            scratch.apply(&delta.instrument_key, amount);
            *applied.entry(delta.instrument_key.clone()).or_insert(0.0) += amount;
        }

        if let Some((key, amount)) = scratch.overdrawn(BALANCE_TOLERANCE) {
            return Ok(ExecutionHandshake::failed(
                &order.operation_id,
                "VEN-004",
                &format!("insufficient balance on {key}: {amount}"),
                true,
            ));
        }

        ledger.replace(scratch.clone_inner());

        let underlying = self.util.underlying(&order.target_token);
        let executed_price = snapshot.prices.get(underlying).copied().unwrap_or(0.0);

        let mut handshake = ExecutionHandshake::confirmed(&order.operation_id, applied, true)
            .with_detail("order_id", serde_json::json!(Uuid::new_v4().simple().to_string()))
            .with_detail("executed_price", serde_json::json!(executed_price))
            .with_detail("slippage", serde_json::json!(slippage));

        // Perp fees settle in the quote currency, separate from deltas.
        if order.operation_type == OperationType::PerpTrade && self.config.fee_bps > 0.0 {
            let fee = order.amount.abs() * executed_price * self.config.fee_bps / 10_000.0;
            handshake = handshake.with_fee(fee, &order.source_token);
        }

        Ok(handshake)
    }
}
