use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::RiskLevel;
use crate::model::{InstrumentKey, OperationType, PositionType};

use super::{build_order, Action, Decision, Strategy, StrategyContext};

const WALLET: &str = "wallet";
const LENDING_VENUE: &str = "aave_v3";
const ASSET: &str = "USDT";
const ATOKEN: &str = "aUSDT";

/// Supply-only stablecoin lending: everything above the reserve goes to
/// the lending venue, and the position unwinds on a critical risk level.
pub struct PureLendingStrategy {
    mode: String,
    reserve_ratio: f64,
    min_amount: f64,
}

impl PureLendingStrategy {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let venue = config.venue(LENDING_VENUE)?;
        Ok(Self {
            mode: config.mode.clone(),
            reserve_ratio: config.component_config.strategy_manager.reserve_ratio,
            min_amount: venue.min_amount,
        })
    }

    fn wallet_key(&self) -> InstrumentKey {
        InstrumentKey::new(WALLET, PositionType::BaseToken, ASSET)
    }

    fn atoken_key(&self) -> InstrumentKey {
        InstrumentKey::new(LENDING_VENUE, PositionType::AToken, ATOKEN)
    }
}

impl Strategy for PureLendingStrategy {
    fn mode(&self) -> &str {
        &self.mode
    }

    fn required_instruments(&self) -> Vec<InstrumentKey> {
        vec![self.wallet_key(), self.atoken_key()]
    }

    fn funding_instrument(&self) -> InstrumentKey {
        self.wallet_key()
    }

    fn decide(&mut self, ctx: &StrategyContext) -> Result<Decision, EngineError> {
        let wallet = ctx.position(&self.wallet_key());
        let supplied = ctx.position(&self.atoken_key());

        // Critical risk unwinds before anything else.
        if ctx.risk.risk_level == RiskLevel::Critical && supplied > 0.0 {
            let index = ctx.util.supply_index(ctx.snapshot, ATOKEN)?;
            let redeemable = supplied * index;
            let order = build_order(
                ctx,
                OperationType::Withdraw,
                LENDING_VENUE,
                WALLET,
                ATOKEN,
                ASSET,
                redeemable,
            )?;
            return Ok(Decision {
                trigger: "risk_breach".to_string(),
                actions: vec![Action::RiskExit],
                target_positions: [(self.atoken_key(), 0.0)].into_iter().collect(),
                orders: vec![order],
            });
        }

        let deployable = wallet * (1.0 - self.reserve_ratio);
        if deployable >= self.min_amount {
            let index = ctx.util.supply_index(ctx.snapshot, ATOKEN)?;
            let action = if supplied > 0.0 {
                Action::EntryPartial
            } else {
                Action::EntryFull
            };
            let order = build_order(
                ctx,
                OperationType::Supply,
                WALLET,
                LENDING_VENUE,
                ASSET,
                ATOKEN,
                deployable,
            )?
            .with_detail("supply_index", serde_json::json!(index));
            return Ok(Decision {
                trigger: action.as_str().to_string(),
                actions: vec![action],
                target_positions: [(self.atoken_key(), supplied + deployable * index)]
                    .into_iter()
                    .collect(),
                orders: vec![order],
            });
        }

        Ok(Decision::hold("no_action"))
    }
}
