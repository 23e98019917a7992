use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::RiskLevel;
use crate::model::{InstrumentKey, OperationType, PositionType};

use super::{build_order, Action, Decision, Strategy, StrategyContext};

const VENUE: &str = "binance";
const QUOTE: &str = "USDT";
const BASE: &str = "BTC";
const PERP: &str = "BTCUSDT";

/// Delta-neutral basis position on one exchange: long spot, short perp of
/// equal size, funded by the quote balance.
///
/// Tie-breaks follow the shared priority: risk exit, then exit, entry,
/// rebalance, dust.
pub struct BasisStrategy {
    mode: String,
    hedge_allocation: f64,
    deviation_threshold: f64,
    dust_threshold: f64,
    min_amount: f64,
}

impl BasisStrategy {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let venue = config.venue(VENUE)?;
        let strategy_config = &config.component_config.strategy_manager;
        let dust_threshold =
            strategy_config.require("dust_threshold", strategy_config.dust_threshold)?;
        Ok(Self {
            mode: config.mode.clone(),
            hedge_allocation: strategy_config.hedge_allocation,
            deviation_threshold: strategy_config.position_deviation_threshold,
            dust_threshold,
            min_amount: venue.min_amount,
        })
    }

    fn quote_key(&self) -> InstrumentKey {
        InstrumentKey::new(VENUE, PositionType::BaseToken, QUOTE)
    }

    fn spot_key(&self) -> InstrumentKey {
        InstrumentKey::new(VENUE, PositionType::BaseToken, BASE)
    }

    fn perp_key(&self) -> InstrumentKey {
        InstrumentKey::new(VENUE, PositionType::Perp, PERP)
    }
}

impl Strategy for BasisStrategy {
    fn mode(&self) -> &str {
        &self.mode
    }

    fn required_instruments(&self) -> Vec<InstrumentKey> {
        vec![self.quote_key(), self.spot_key(), self.perp_key()]
    }

    fn funding_instrument(&self) -> InstrumentKey {
        self.quote_key()
    }

    fn decide(&mut self, ctx: &StrategyContext) -> Result<Decision, EngineError> {
        let quote = ctx.position(&self.quote_key());
        let spot = ctx.position(&self.spot_key());
        let perp = ctx.position(&self.perp_key());
        let price = ctx.util.spot_price(ctx.snapshot, BASE)?;

        // 1. Risk exit: unwind both legs.
        if ctx.risk.risk_level == RiskLevel::Critical && (spot > 0.0 || perp != 0.0) {
            let mut orders = Vec::new();
            if spot > 0.0 {
                orders.push(
                    build_order(
                        ctx,
                        OperationType::SpotTrade,
                        VENUE,
                        VENUE,
                        BASE,
                        QUOTE,
                        spot,
                    )?
                    .with_detail("side", serde_json::json!("sell")),
                );
            }
            if perp != 0.0 {
                let close = super::finish_order(
                    ctx,
                    crate::model::Order::new(
                        OperationType::PerpTrade,
                        VENUE,
                        VENUE,
                        QUOTE,
                        PERP,
                        -perp,
                    ),
                )?;
                orders.push(close);
            }
            return Ok(Decision {
                trigger: "risk_breach".to_string(),
                actions: vec![Action::RiskExit],
                target_positions: [(self.spot_key(), 0.0), (self.perp_key(), 0.0)]
                    .into_iter()
                    .collect(),
                orders,
            });
        }

        // 2. Entry: no position yet, quote available.
        if spot == 0.0 && perp == 0.0 {
            let spend = quote * self.hedge_allocation;
            if spend >= self.min_amount {
                let quantity = spend / price;
                let buy = build_order(
                    ctx,
                    OperationType::SpotTrade,
                    VENUE,
                    VENUE,
                    QUOTE,
                    BASE,
                    spend,
                )?
                .with_detail("side", serde_json::json!("buy"));
                let short = super::finish_order(
                    ctx,
                    crate::model::Order::new(
                        OperationType::PerpTrade,
                        VENUE,
                        VENUE,
                        QUOTE,
                        PERP,
                        -quantity,
                    ),
                )?;
                return Ok(Decision {
                    trigger: "entry_full".to_string(),
                    actions: vec![Action::EntryFull],
                    target_positions: [
                        (self.spot_key(), quantity),
                        (self.perp_key(), -quantity),
                    ]
                    .into_iter()
                    .collect(),
                    orders: vec![buy, short],
                });
            }
        }

        // 3. Rebalance: hedge drift beyond the deviation threshold.
        let net = spot + perp;
        if spot > 0.0 && net.abs() > self.deviation_threshold {
            let adjust = super::finish_order(
                ctx,
                crate::model::Order::new(
                    OperationType::PerpTrade,
                    VENUE,
                    VENUE,
                    QUOTE,
                    PERP,
                    -net,
                ),
            )?;
            return Ok(Decision {
                trigger: "rebalance".to_string(),
                actions: vec![Action::Rebalance],
                target_positions: [(self.perp_key(), -spot)].into_iter().collect(),
                orders: vec![adjust],
            });
        }

        // 4. Dust: residual spot with no hedge left.
        if perp == 0.0 && spot > 0.0 && spot * price < self.dust_threshold {
            let sell = build_order(
                ctx,
                OperationType::SpotTrade,
                VENUE,
                VENUE,
                BASE,
                QUOTE,
                spot,
            )?
            .with_detail("side", serde_json::json!("sell"));
            return Ok(Decision {
                trigger: "sell_dust".to_string(),
                actions: vec![Action::SellDust],
                target_positions: [(self.spot_key(), 0.0)].into_iter().collect(),
                orders: vec![sell],
            });
        }

        Ok(Decision::hold("no_action"))
    }
}
