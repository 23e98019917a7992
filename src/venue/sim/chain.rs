use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
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

/// Backtest venue for the on-chain protocol cluster: lending, staking,
/// swaps, transfers, and flash-loan bundles.
///
/// One simulator instance covers every on-chain venue name because an
/// atomic group is one transaction, and a transaction is atomic exactly
/// within the chain. Deltas are derived with the same pure functions the
/// strategy uses, over the same snapshot, so confirmed handshakes
/// reconcile exactly against expected deltas.
pub struct ChainSimulator {
    label: String,
    configs: BTreeMap<String, VenueConfig>,
    util: UtilityManager,
    ledger: SharedLedger,
}

impl ChainSimulator {
    pub fn new(
        label: &str,
        configs: BTreeMap<String, VenueConfig>,
        util: UtilityManager,
        ledger: SharedLedger,
    ) -> Self {
        Self {
            label: label.to_string(),
            configs,
            util,
            ledger,
        }
    }

    pub fn venue_names(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    fn config_for(&self, order: &Order) -> Result<&VenueConfig, VenueError> {
        self.configs
            .get(order.execution_venue())
            .ok_or_else(|| {
                VenueError::InvalidState(format!(
                    "venue `{}` is not covered by this interface",
                    order.execution_venue()
                ))
            })
    }

    /// Validate one order against the scratch state and apply its deltas.
    /// Returns the per-key deltas for the handshake.
    fn validate_and_apply(
        &self,
        scratch: &mut SimLedger,
        order: &Order,
        snapshot: &MarketSnapshot,
        flash_outstanding: &mut HashMap<String, f64>,
    ) -> Result<BTreeMap<InstrumentKey, f64>, VenueError> {
        let config = self.config_for(order)?;
        if order.amount.abs() < config.min_amount {
            return Err(VenueError::InvalidOrder(format!(
                "amount {} below venue minimum {}",
                order.amount, config.min_amount
            )));
        }

        let fees = FeeContext {
            fee_bps: config.fee_bps,
            flash_fee_bps: config.flash_fee_bps,
        };
        let expected = deltas::derive(order, snapshot, &self.util, &fees)
            .map_err(|e| VenueError::InvalidOrder(e.to_string()))?;

        // Flash-loan accounting is scoped to the group scratch state.
        match order.operation_type {
            OperationType::FlashBorrow => {
                *flash_outstanding
                    .entry(order.target_token.clone())
                    .or_insert(0.0) += order.amount;
            }
            OperationType::FlashRepay => {
                let outstanding = flash_outstanding
                    .get(&order.source_token)
                    .copied()
                    .unwrap_or(0.0);
                if outstanding <= 0.0 {
                    return Err(VenueError::InvalidOrder(format!(
                        "flash_repay of {} with no outstanding loan",
                        order.source_token
                    )));
                }
                let due = outstanding * (1.0 + config.flash_fee_bps / 10_000.0);
                if (order.amount - due).abs() > BALANCE_TOLERANCE.max(due * 1e-9) {
                    return Err(VenueError::InvalidOrder(format!(
                        "flash_repay amount {} does not cover principal plus premium {due}",
                        order.amount
                    )));
                }
                flash_outstanding.insert(order.source_token.clone(), 0.0);
            }
            OperationType::Borrow => {
                self.check_borrow_headroom(scratch, order, snapshot, config)?;
            }
            _ => {}
        }

        let mut applied = BTreeMap::new();
        for delta in &expected {
            scratch.apply(&delta.instrument_key, delta.delta_amount);
            *applied.entry(delta.instrument_key.clone()).or_insert(0.0) += delta.delta_amount;
        }

        if let Some((key, amount)) = scratch.overdrawn(BALANCE_TOLERANCE) {
            return Err(VenueError::InvalidState(format!(
                "insufficient balance on {key}: {amount}"
            )));
        }

        Ok(applied)
    }

    /// Reject borrows that would push venue debt past the configured LTV
    /// cap against current collateral.
    fn check_borrow_headroom(
        &self,
        scratch: &SimLedger,
        order: &Order,
        snapshot: &MarketSnapshot,
        config: &VenueConfig,
    ) -> Result<(), VenueError> {
        let Some(max_ltv) = config.max_ltv else {
            return Ok(());
        };
        let venue = order.execution_venue();

        let mut collateral = 0.0;
        let mut debt = 0.0;
        for (key, amount) in scratch.positions() {
            if key.venue() != venue || *amount == 0.0 {
                continue;
            }
            let value = self
                .util
                .position_value(snapshot, key, *amount)
                .map_err(|e| VenueError::InvalidState(e.to_string()))?;
            match key.position_type() {
                PositionType::AToken | PositionType::Lst => collateral += value,
                PositionType::DebtToken => debt += -value,
                _ => {}
            }
        }

        let borrow_price = self
            .util
            .spot_price(snapshot, self.util.underlying(&order.target_token))
            .map_err(|e| VenueError::InvalidState(e.to_string()))?;
        let debt_after = debt + order.amount * borrow_price;
        if debt_after > max_ltv * collateral {
            return Err(VenueError::InvalidState(format!(
                "borrow would exceed max LTV {max_ltv}: debt {debt_after:.2} vs collateral {collateral:.2}"
            )));
        }
        Ok(())
    }

    fn handshake(
        order: &Order,
        snapshot: &MarketSnapshot,
        applied: BTreeMap<InstrumentKey, f64>,
    ) -> ExecutionHandshake {
        ExecutionHandshake::confirmed(&order.operation_id, applied, true)
            .with_detail("tx_hash", serde_json::json!(format!("0x{}", Uuid::new_v4().simple())))
            .with_detail("block_timestamp", serde_json::json!(snapshot.timestamp))
            .with_detail("venue", serde_json::json!(order.execution_venue()))
    }
}

#[async_trait]
impl ExecutionInterface for ChainSimulator {
    fn venue(&self) -> &str {
        &self.label
    }

    async fn execute(
        &mut self,
        order: &Order,
        snapshot: &MarketSnapshot,
    ) -> Result<ExecutionHandshake, VenueError> {
        let mut ledger = self.ledger.lock().expect("sim ledger poisoned");
        let mut scratch = SimLedger::default();
        scratch.replace(ledger.clone_inner());
        let mut flash = HashMap::new();

        match self.validate_and_apply(&mut scratch, order, snapshot, &mut flash) {
            Ok(applied) => {
                ledger.replace(scratch.clone_inner());
                Ok(Self::handshake(order, snapshot, applied))
            }
            Err(e) => Ok(ExecutionHandshake::failed(
                &order.operation_id,
                e.code(),
                &e.to_string(),
                true,
            )),
        }
    }

    async fn execute_group(
        &mut self,
        orders: &[Order],
        snapshot: &MarketSnapshot,
    ) -> Result<Vec<ExecutionHandshake>, VenueError> {
        let mut ledger = self.ledger.lock().expect("sim ledger poisoned");
        let mut scratch = SimLedger::default();
        scratch.replace(ledger.clone_inner());
        let mut flash: HashMap<String, f64> = HashMap::new();

        let mut applied: Vec<BTreeMap<InstrumentKey, f64>> = Vec::with_capacity(orders.len());
        let mut failure: Option<(String, VenueError)> = None;

        for order in orders {
            match self.validate_and_apply(&mut scratch, order, snapshot, &mut flash) {
                Ok(deltas) => applied.push(deltas),
                Err(e) => {
                    failure = Some((order.operation_id.clone(), e));
                    break;
                }
            }
        }

        // Every flash loan opened in the bundle must have been repaid.
        if failure.is_none() {
            if let Some((token, outstanding)) = flash
                .iter()
                .find(|(_, outstanding)| **outstanding > BALANCE_TOLERANCE)
            {
                failure = Some((
                    orders.last().map(|o| o.operation_id.clone()).unwrap_or_default(),
                    VenueError::InvalidState(format!(
                        "flash loan of {outstanding} {token} not repaid within the bundle"
                    )),
                ));
            }
        }

        if let Some((failed_id, error)) = failure {
            let message = format!("group rolled back: {failed_id} failed: {error}");
            return Ok(orders
                .iter()
                .map(|o| ExecutionHandshake::rolled_back(&o.operation_id, error.code(), &message, true))
                .collect());
        }

        ledger.replace(scratch.clone_inner());
        Ok(orders
            .iter()
            .zip(applied)
            .map(|(order, deltas)| Self::handshake(order, snapshot, deltas))
            .collect())
    }
}
