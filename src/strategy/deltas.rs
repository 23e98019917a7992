//! Pure expected-delta derivations, one function per operation type.
//!
//! Both the strategy layer (predicting) and the backtest venue simulators
//! (reporting) derive deltas here, over the same snapshot, so a correct
//! strategy reconciles exactly in backtest.

use crate::data::MarketSnapshot;
use crate::error::EngineError;
use crate::model::{ExpectedDelta, InstrumentKey, OperationType, Order, PositionType};
use crate::util::UtilityManager;

/// Venue fee context resolved by the caller from the executing venue's
/// configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeeContext {
    /// Taker fee in basis points, charged in the target currency.
    pub fee_bps: f64,
    /// Flash-loan premium in basis points.
    pub flash_fee_bps: f64,
}

impl FeeContext {
    fn taker(&self) -> f64 {
        self.fee_bps / 10_000.0
    }
}

/// Dispatch to the per-operation deriving function.
pub fn derive(
    order: &Order,
    snapshot: &MarketSnapshot,
    util: &UtilityManager,
    fees: &FeeContext,
) -> Result<Vec<ExpectedDelta>, EngineError> {
    let deltas = match order.operation_type {
        OperationType::SpotTrade => spot_trade(order, snapshot, util, fees)?,
        OperationType::PerpTrade => perp_trade(order)?,
        OperationType::Supply => supply(order, snapshot, util)?,
        OperationType::Borrow => borrow(order, fees)?,
        OperationType::Repay => repay(order)?,
        OperationType::Withdraw => withdraw(order, snapshot, util)?,
        OperationType::Stake => stake(order, snapshot, util)?,
        OperationType::Unstake => unstake(order, snapshot, util)?,
        OperationType::Swap => swap(order, snapshot, util, fees)?,
        OperationType::Transfer => transfer(order)?,
        OperationType::FlashBorrow => flash_borrow(order)?,
        OperationType::FlashRepay => flash_repay(order)?,
    };
    Ok(deltas)
}

fn invalid(order: &Order, reason: &str) -> EngineError {
    EngineError::DeltaDerivation {
        operation: order.operation_type.to_string(),
        reason: reason.to_string(),
    }
}

fn positive_amount(order: &Order) -> Result<f64, EngineError> {
    if order.amount > 0.0 && order.amount.is_finite() {
        Ok(order.amount)
    } else {
        Err(invalid(order, "amount must be positive and finite"))
    }
}

/// Source decreases by `amount`; target increases by `amount * price` with
/// the taker fee taken out of the target currency.
fn spot_trade(
    order: &Order,
    snapshot: &MarketSnapshot,
    util: &UtilityManager,
    fees: &FeeContext,
) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    let price_source = util.spot_price(snapshot, &order.source_token)?;
    let price_target = util.spot_price(snapshot, &order.target_token)?;
    if price_target <= 0.0 {
        return Err(invalid(order, "target price must be positive"));
    }
    let gross = amount * price_source / price_target;
    let net = gross * (1.0 - fees.taker());

    let source = InstrumentKey::new(
        &order.source_venue,
        PositionType::BaseToken,
        &order.source_token,
    );
    let target = InstrumentKey::new(
        &order.source_venue,
        PositionType::BaseToken,
        &order.target_token,
    );
    Ok(vec![
        ExpectedDelta::new(source, -amount, OperationType::SpotTrade),
        ExpectedDelta::new(target, net, OperationType::SpotTrade),
    ])
}

/// Signed perp position delta on the perp key; no spot movement.
fn perp_trade(order: &Order) -> Result<Vec<ExpectedDelta>, EngineError> {
    if order.amount == 0.0 || !order.amount.is_finite() {
        return Err(invalid(order, "perp amount must be non-zero and finite"));
    }
    let key = InstrumentKey::new(&order.source_venue, PositionType::Perp, &order.target_token);
    Ok(vec![ExpectedDelta::new(
        key,
        order.amount,
        OperationType::PerpTrade,
    )])
}

/// A token held as an LST position keys as `LST`, anything else as
/// `BaseToken`. Lets staking collateral flow into lending without a
/// separate operation vocabulary.
fn holding_key(snapshot: &MarketSnapshot, venue: &str, token: &str) -> InstrumentKey {
    if snapshot.staking_rates.contains_key(token) {
        InstrumentKey::new(venue, PositionType::Lst, token)
    } else {
        InstrumentKey::new(venue, PositionType::BaseToken, token)
    }
}

/// Supplied units out, index-scaled aToken units in.
fn supply(
    order: &Order,
    snapshot: &MarketSnapshot,
    util: &UtilityManager,
) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    let index = util.supply_index(snapshot, &order.target_token)?;
    let source = holding_key(snapshot, &order.source_venue, &order.source_token);
    let target = InstrumentKey::new(
        &order.target_venue,
        PositionType::AToken,
        &order.target_token,
    );
    Ok(vec![
        ExpectedDelta::new(source, -amount, OperationType::Supply),
        ExpectedDelta::new(target, amount * index, OperationType::Supply),
    ])
}

/// Debt key up, borrowed base token delivered to the target venue.
fn borrow(order: &Order, fees: &FeeContext) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    let debt = InstrumentKey::new(
        &order.source_venue,
        PositionType::DebtToken,
        &order.source_token,
    );
    let received = InstrumentKey::new(
        &order.target_venue,
        PositionType::BaseToken,
        &order.target_token,
    );
    Ok(vec![
        ExpectedDelta::new(debt, amount, OperationType::Borrow),
        ExpectedDelta::new(
            received,
            amount * (1.0 - fees.taker()),
            OperationType::Borrow,
        ),
    ])
}

/// Base token paid in, debt key down.
fn repay(order: &Order) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    let paid = InstrumentKey::new(
        &order.source_venue,
        PositionType::BaseToken,
        &order.source_token,
    );
    let debt = InstrumentKey::new(
        &order.target_venue,
        PositionType::DebtToken,
        &order.target_token,
    );
    Ok(vec![
        ExpectedDelta::new(paid, -amount, OperationType::Repay),
        ExpectedDelta::new(debt, -amount, OperationType::Repay),
    ])
}

/// `amount` is the base quantity to receive; aToken units burn at the
/// current supply index.
fn withdraw(
    order: &Order,
    snapshot: &MarketSnapshot,
    util: &UtilityManager,
) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    let index = util.supply_index(snapshot, &order.source_token)?;
    if index <= 0.0 {
        return Err(invalid(order, "supply index must be positive"));
    }
    let atoken = InstrumentKey::new(
        &order.source_venue,
        PositionType::AToken,
        &order.source_token,
    );
    let base = holding_key(snapshot, &order.target_venue, &order.target_token);
    Ok(vec![
        ExpectedDelta::new(atoken, -(amount / index), OperationType::Withdraw),
        ExpectedDelta::new(base, amount, OperationType::Withdraw),
    ])
}

/// Underlying out, LST units in at the current conversion rate.
fn stake(
    order: &Order,
    snapshot: &MarketSnapshot,
    util: &UtilityManager,
) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    let rate = util.lst_rate(snapshot, &order.target_token)?;
    let source = InstrumentKey::new(
        &order.source_venue,
        PositionType::BaseToken,
        &order.source_token,
    );
    let lst = InstrumentKey::new(&order.target_venue, PositionType::Lst, &order.target_token);
    Ok(vec![
        ExpectedDelta::new(source, -amount, OperationType::Stake),
        ExpectedDelta::new(lst, amount * rate, OperationType::Stake),
    ])
}

/// Inverse of stake; `amount` is the underlying quantity to receive.
fn unstake(
    order: &Order,
    snapshot: &MarketSnapshot,
    util: &UtilityManager,
) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    let rate = util.lst_rate(snapshot, &order.source_token)?;
    let lst = InstrumentKey::new(&order.source_venue, PositionType::Lst, &order.source_token);
    let base = InstrumentKey::new(
        &order.target_venue,
        PositionType::BaseToken,
        &order.target_token,
    );
    Ok(vec![
        ExpectedDelta::new(lst, -(amount * rate), OperationType::Unstake),
        ExpectedDelta::new(base, amount, OperationType::Unstake),
    ])
}

/// AMM swap at oracle price with the taker fee out of the output. Tokens
/// stay at the holding venue (`source_venue`); `target_venue` names the
/// executing DEX.
fn swap(
    order: &Order,
    snapshot: &MarketSnapshot,
    util: &UtilityManager,
    fees: &FeeContext,
) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    let price_source = util.spot_price(snapshot, &order.source_token)?;
    let price_target = util.spot_price(snapshot, &order.target_token)?;
    if price_target <= 0.0 {
        return Err(invalid(order, "target price must be positive"));
    }
    let amount_out = amount * price_source / price_target * (1.0 - fees.taker());

    let source = InstrumentKey::new(
        &order.source_venue,
        PositionType::BaseToken,
        &order.source_token,
    );
    let target = InstrumentKey::new(
        &order.source_venue,
        PositionType::BaseToken,
        &order.target_token,
    );
    Ok(vec![
        ExpectedDelta::new(source, -amount, OperationType::Swap),
        ExpectedDelta::new(target, amount_out, OperationType::Swap),
    ])
}

/// One-to-one movement of the same token between two venues.
fn transfer(order: &Order) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    if order.source_token != order.target_token {
        return Err(invalid(order, "transfer must keep the same token"));
    }
    if order.source_venue == order.target_venue {
        return Err(invalid(order, "transfer must cross venues"));
    }
    let source = InstrumentKey::new(
        &order.source_venue,
        PositionType::BaseToken,
        &order.source_token,
    );
    let target = InstrumentKey::new(
        &order.target_venue,
        PositionType::BaseToken,
        &order.target_token,
    );
    Ok(vec![
        ExpectedDelta::new(source, -amount, OperationType::Transfer),
        ExpectedDelta::new(target, amount, OperationType::Transfer),
    ])
}

/// Borrowed funds appear at the target venue; the loan itself lives only
/// inside the atomic group.
fn flash_borrow(order: &Order) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    if order.atomic_group_id.is_none() {
        return Err(invalid(order, "flash_borrow requires an atomic group"));
    }
    let target = InstrumentKey::new(
        &order.target_venue,
        PositionType::BaseToken,
        &order.target_token,
    );
    Ok(vec![ExpectedDelta::new(
        target,
        amount,
        OperationType::FlashBorrow,
    )])
}

/// Repayment (principal plus premium, as computed by the strategy) leaves
/// the source venue.
fn flash_repay(order: &Order) -> Result<Vec<ExpectedDelta>, EngineError> {
    let amount = positive_amount(order)?;
    if order.atomic_group_id.is_none() {
        return Err(invalid(order, "flash_repay requires an atomic group"));
    }
    let source = InstrumentKey::new(
        &order.source_venue,
        PositionType::BaseToken,
        &order.source_token,
    );
    Ok(vec![ExpectedDelta::new(
        source,
        -amount,
        OperationType::FlashRepay,
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot() -> MarketSnapshot {
        let mut snap = MarketSnapshot {
            timestamp: 1_700_000_000,
            ..Default::default()
        };
        snap.prices.insert("USDT".into(), 1.0);
        snap.prices.insert("BTC".into(), 50_000.0);
        snap.prices.insert("ETH".into(), 2_000.0);
        snap.supply_indices.insert("USDT".into(), 1.05);
        snap.staking_rates.insert("weETH".into(), 0.96);
        snap
    }

    fn util() -> UtilityManager {
        let mut canonical = BTreeMap::new();
        canonical.insert("aUSDT".to_string(), "USDT".to_string());
        canonical.insert("weETH".to_string(), "ETH".to_string());
        canonical.insert("BTCUSDT".to_string(), "BTC".to_string());
        UtilityManager::new(canonical)
    }

    #[test]
    fn supply_scales_by_index() {
        let order = Order::new(
            OperationType::Supply,
            "wallet",
            "aave_v3",
            "USDT",
            "aUSDT",
            10_000.0,
        );
        let deltas = derive(&order, &snapshot(), &util(), &FeeContext::default()).unwrap();
        assert_eq!(deltas.len(), 2);
        assert_eq!(
            deltas[0].instrument_key.to_string(),
            "wallet:BaseToken:USDT"
        );
        assert!((deltas[0].delta_amount + 10_000.0).abs() < 1e-9);
        assert_eq!(
            deltas[1].instrument_key.to_string(),
            "aave_v3:aToken:aUSDT"
        );
        assert!((deltas[1].delta_amount - 10_500.0).abs() < 1e-9);
    }

    #[test]
    fn spot_buy_converts_at_price() {
        let order = Order::new(
            OperationType::SpotTrade,
            "binance",
            "binance",
            "USDT",
            "BTC",
            50_000.0,
        );
        let deltas = derive(&order, &snapshot(), &util(), &FeeContext::default()).unwrap();
        assert!((deltas[0].delta_amount + 50_000.0).abs() < 1e-9);
        assert_eq!(
            deltas[1].instrument_key.to_string(),
            "binance:BaseToken:BTC"
        );
        assert!((deltas[1].delta_amount - 1.0).abs() < 1e-12);
    }

    #[test]
    fn perp_short_is_signed() {
        let mut order = Order::new(
            OperationType::PerpTrade,
            "binance",
            "binance",
            "USDT",
            "BTCUSDT",
            0.0,
        );
        order.amount = -1.0;
        let deltas = derive(&order, &snapshot(), &util(), &FeeContext::default()).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].instrument_key.to_string(), "binance:Perp:BTCUSDT");
        assert!((deltas[0].delta_amount + 1.0).abs() < 1e-12);
    }

    #[test]
    fn stake_mints_at_conversion_rate() {
        let order = Order::new(
            OperationType::Stake,
            "wallet",
            "etherfi",
            "ETH",
            "weETH",
            100.0,
        );
        let deltas = derive(&order, &snapshot(), &util(), &FeeContext::default()).unwrap();
        assert!((deltas[1].delta_amount - 96.0).abs() < 1e-9);
        assert_eq!(deltas[1].instrument_key.to_string(), "etherfi:LST:weETH");
    }

    #[test]
    fn flash_ops_require_a_group() {
        let order = Order::new(
            OperationType::FlashBorrow,
            "aave_v3",
            "wallet",
            "ETH",
            "ETH",
            100.0,
        );
        assert!(derive(&order, &snapshot(), &util(), &FeeContext::default()).is_err());
        let grouped = order.in_group("g1", 0);
        assert!(derive(&grouped, &snapshot(), &util(), &FeeContext::default()).is_ok());
    }

    #[test]
    fn apply_then_negate_round_trips() {
        let order = Order::new(
            OperationType::Supply,
            "wallet",
            "aave_v3",
            "USDT",
            "aUSDT",
            5_000.0,
        );
        let deltas = derive(&order, &snapshot(), &util(), &FeeContext::default()).unwrap();

        let mut positions: BTreeMap<String, f64> = BTreeMap::new();
        positions.insert("wallet:BaseToken:USDT".into(), 5_000.0);
        let before = positions.clone();

        for d in &deltas {
            *positions.entry(d.instrument_key.to_string()).or_insert(0.0) += d.delta_amount;
        }
        for d in &deltas {
            *positions.entry(d.instrument_key.to_string()).or_insert(0.0) -= d.delta_amount;
        }
        for (key, amount) in before {
            assert!((positions[&key] - amount).abs() < 1e-9);
        }
    }
}
