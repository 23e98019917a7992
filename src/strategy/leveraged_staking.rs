use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::RiskLevel;
use crate::model::{InstrumentKey, OperationType, Order, PositionType};

use super::{finish_order, Action, Decision, Strategy, StrategyContext};

const WALLET: &str = "wallet";
const STAKING_VENUE: &str = "etherfi";
const LENDING_VENUE: &str = "aave_v3";
const UNDERLYING: &str = "ETH";
const LST: &str = "weETH";
const ATOKEN: &str = "aweETH";
const DEBT: &str = "debtETH";

/// Leveraged LST carry: flash-borrow ETH, stake, post the LST as
/// collateral, borrow back the flash principal, repay the flash loan —
/// one atomic bundle, unwound the same way.
pub struct LeveragedStakingStrategy {
    mode: String,
    target_leverage: f64,
    min_amount: f64,
}

impl LeveragedStakingStrategy {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let venue = config.venue(LENDING_VENUE)?;
        let strategy_config = &config.component_config.strategy_manager;
        let target_leverage =
            strategy_config.require("target_leverage", strategy_config.target_leverage)?;
        if target_leverage <= 1.0 {
            return Err(EngineError::MissingConfig {
                field: "component_config.strategy_manager.target_leverage must exceed 1.0"
                    .to_string(),
            });
        }
        Ok(Self {
            mode: config.mode.clone(),
            target_leverage,
            min_amount: venue.min_amount,
        })
    }

    fn wallet_key(&self) -> InstrumentKey {
        InstrumentKey::new(WALLET, PositionType::BaseToken, UNDERLYING)
    }

    fn lst_key(&self) -> InstrumentKey {
        InstrumentKey::new(STAKING_VENUE, PositionType::Lst, LST)
    }

    fn atoken_key(&self) -> InstrumentKey {
        InstrumentKey::new(LENDING_VENUE, PositionType::AToken, ATOKEN)
    }

    fn debt_key(&self) -> InstrumentKey {
        InstrumentKey::new(LENDING_VENUE, PositionType::DebtToken, DEBT)
    }

    fn entry_group(&self, ctx: &StrategyContext, capital: f64) -> Result<Vec<Order>, EngineError> {
        let group_id = Uuid::new_v4().simple().to_string();
        let fees = ctx.fee_context(LENDING_VENUE);
        let rate = ctx.util.lst_rate(ctx.snapshot, LST)?;

        let flash_principal = capital * (self.target_leverage - 1.0);
        let flash_due = flash_principal * (1.0 + fees.flash_fee_bps / 10_000.0);
        let staked = capital + flash_principal;

        let orders = vec![
            Order::new(
                OperationType::FlashBorrow,
                LENDING_VENUE,
                WALLET,
                UNDERLYING,
                UNDERLYING,
                flash_principal,
            ),
            Order::new(
                OperationType::Stake,
                WALLET,
                STAKING_VENUE,
                UNDERLYING,
                LST,
                staked,
            ),
            Order::new(
                OperationType::Supply,
                STAKING_VENUE,
                LENDING_VENUE,
                LST,
                ATOKEN,
                staked * rate,
            ),
            Order::new(
                OperationType::Borrow,
                LENDING_VENUE,
                WALLET,
                DEBT,
                UNDERLYING,
                flash_due,
            ),
            Order::new(
                OperationType::FlashRepay,
                WALLET,
                LENDING_VENUE,
                UNDERLYING,
                UNDERLYING,
                flash_due,
            ),
        ];

        orders
            .into_iter()
            .enumerate()
            .map(|(seq, order)| finish_order(ctx, order.in_group(&group_id, seq as u32)))
            .collect()
    }

    fn exit_group(&self, ctx: &StrategyContext) -> Result<Vec<Order>, EngineError> {
        let group_id = Uuid::new_v4().simple().to_string();
        let fees = ctx.fee_context(LENDING_VENUE);
        let rate = ctx.util.lst_rate(ctx.snapshot, LST)?;
        let index = ctx.util.supply_index(ctx.snapshot, ATOKEN)?;

        let debt = ctx.position(&self.debt_key());
        let supplied = ctx.position(&self.atoken_key());
        let flash_due = debt * (1.0 + fees.flash_fee_bps / 10_000.0);
        let redeemable_lst = supplied * index;

        let orders = vec![
            Order::new(
                OperationType::FlashBorrow,
                LENDING_VENUE,
                WALLET,
                UNDERLYING,
                UNDERLYING,
                debt,
            ),
            Order::new(
                OperationType::Repay,
                WALLET,
                LENDING_VENUE,
                UNDERLYING,
                DEBT,
                debt,
            ),
            Order::new(
                OperationType::Withdraw,
                LENDING_VENUE,
                STAKING_VENUE,
                ATOKEN,
                LST,
                redeemable_lst,
            ),
            Order::new(
                OperationType::Unstake,
                STAKING_VENUE,
                WALLET,
                LST,
                UNDERLYING,
                redeemable_lst / rate,
            ),
            Order::new(
                OperationType::FlashRepay,
                WALLET,
                LENDING_VENUE,
                UNDERLYING,
                UNDERLYING,
                flash_due,
            ),
        ];

        orders
            .into_iter()
            .enumerate()
            .map(|(seq, order)| finish_order(ctx, order.in_group(&group_id, seq as u32)))
            .collect()
    }
}

impl Strategy for LeveragedStakingStrategy {
    fn mode(&self) -> &str {
        &self.mode
    }

    fn required_instruments(&self) -> Vec<InstrumentKey> {
        vec![
            self.wallet_key(),
            self.lst_key(),
            self.atoken_key(),
            self.debt_key(),
        ]
    }

    fn funding_instrument(&self) -> InstrumentKey {
        self.wallet_key()
    }

    fn decide(&mut self, ctx: &StrategyContext) -> Result<Decision, EngineError> {
        let supplied = ctx.position(&self.atoken_key());
        let debt = ctx.position(&self.debt_key());
        let capital = ctx.position(&self.wallet_key());

        if ctx.risk.risk_level == RiskLevel::Critical && debt > 0.0 {
            let orders = self.exit_group(ctx)?;
            return Ok(Decision {
                trigger: "risk_breach".to_string(),
                actions: vec![Action::RiskExit],
                target_positions: [(self.atoken_key(), 0.0), (self.debt_key(), 0.0)]
                    .into_iter()
                    .collect(),
                orders,
            });
        }

        if supplied == 0.0 && capital >= self.min_amount {
            let rate = ctx.util.lst_rate(ctx.snapshot, LST)?;
            let index = ctx.util.supply_index(ctx.snapshot, ATOKEN)?;
            let staked = capital * self.target_leverage;
            let orders = self.entry_group(ctx, capital)?;
            return Ok(Decision {
                trigger: "entry_full".to_string(),
                actions: vec![Action::EntryFull],
                target_positions: [(self.atoken_key(), staked * rate * index)]
                    .into_iter()
                    .collect(),
                orders,
            });
        }

        Ok(Decision::hold("no_action"))
    }
}
