use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::RiskLevel;
use crate::model::{InstrumentKey, OperationType, Order, PositionType};

use super::{finish_order, Action, Decision, Strategy, StrategyContext};

const VENUE: &str = "binance";
const QUOTE: &str = "USDT";
const PERP: &str = "BTCUSDT";

/// Signal-driven directional perp: sizes a long or short from the model
/// prediction, flat when the signal is inside the confidence band.
pub struct MlDirectionalStrategy {
    mode: String,
    signal_threshold: f64,
    hedge_allocation: f64,
    min_amount: f64,
}

impl MlDirectionalStrategy {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let venue = config.venue(VENUE)?;
        let strategy_config = &config.component_config.strategy_manager;
        let signal_threshold =
            strategy_config.require("signal_threshold", strategy_config.signal_threshold)?;
        Ok(Self {
            mode: config.mode.clone(),
            signal_threshold,
            hedge_allocation: strategy_config.hedge_allocation,
            min_amount: venue.min_amount,
        })
    }

    fn quote_key(&self) -> InstrumentKey {
        InstrumentKey::new(VENUE, PositionType::BaseToken, QUOTE)
    }

    fn perp_key(&self) -> InstrumentKey {
        InstrumentKey::new(VENUE, PositionType::Perp, PERP)
    }
}

impl Strategy for MlDirectionalStrategy {
    fn mode(&self) -> &str {
        &self.mode
    }

    fn required_instruments(&self) -> Vec<InstrumentKey> {
        vec![self.quote_key(), self.perp_key()]
    }

    fn funding_instrument(&self) -> InstrumentKey {
        self.quote_key()
    }

    fn decide(&mut self, ctx: &StrategyContext) -> Result<Decision, EngineError> {
        let quote = ctx.position(&self.quote_key());
        let current = ctx.position(&self.perp_key());
        let price = ctx
            .util
            .spot_price(ctx.snapshot, ctx.util.underlying(PERP))?;

        let signal = ctx.snapshot.prediction(PERP).unwrap_or(0.0);

        let target = if ctx.risk.risk_level == RiskLevel::Critical {
            0.0
        } else if signal.abs() >= self.signal_threshold {
            signal.signum() * quote * self.hedge_allocation / price
        } else {
            0.0
        };

        let delta = target - current;
        if delta.abs() * price < self.min_amount {
            return Ok(Decision::hold("signal_within_band"));
        }

        let action = if ctx.risk.risk_level == RiskLevel::Critical {
            Action::RiskExit
        } else if current == 0.0 {
            Action::EntryFull
        } else if target == 0.0 {
            Action::ExitFull
        } else {
            Action::Rebalance
        };

        let order = finish_order(
            ctx,
            Order::new(OperationType::PerpTrade, VENUE, VENUE, QUOTE, PERP, delta)
                .with_detail("signal", serde_json::json!(signal)),
        )?;

        Ok(Decision {
            trigger: action.as_str().to_string(),
            actions: vec![action],
            target_positions: [(self.perp_key(), target)].into_iter().collect(),
            orders: vec![order],
        })
    }
}
