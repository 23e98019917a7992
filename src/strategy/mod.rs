pub mod basis;
pub mod deltas;
pub mod leveraged_staking;
pub mod ml_directional;
pub mod pure_lending;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::config::{EngineConfig, StrategyManagerConfig, VenueConfig};
use crate::data::MarketSnapshot;
use crate::error::EngineError;
use crate::events::{
    DomainEvent, ExposureSnapshot, RiskAssessment, StrategyDecisionEvent,
};
use crate::logging::{DomainEventLogger, StructuredLogger};
use crate::model::{InstrumentKey, OperationType, Order};
use crate::util::UtilityManager;

use deltas::FeeContext;

// ── Action vocabulary ───────────────────────────────────────────────

/// What a variant decided to do this tick. Priority when several could
/// fire: risk breach exit first, then exits, entries, rebalances, dust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    RiskExit,
    ExitFull,
    ExitPartial,
    EntryFull,
    EntryPartial,
    Rebalance,
    SellDust,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::RiskExit => "risk_exit",
            Action::ExitFull => "exit_full",
            Action::ExitPartial => "exit_partial",
            Action::EntryFull => "entry_full",
            Action::EntryPartial => "entry_partial",
            Action::Rebalance => "rebalance",
            Action::SellDust => "sell_dust",
        }
    }
}

// ── Decision context ────────────────────────────────────────────────

/// Read-only view handed to a variant each tick.
pub struct StrategyContext<'a> {
    pub timestamp: u64,
    pub positions: &'a HashMap<InstrumentKey, f64>,
    pub exposure: &'a ExposureSnapshot,
    pub risk: &'a RiskAssessment,
    pub snapshot: &'a MarketSnapshot,
    pub util: &'a UtilityManager,
    pub config: &'a StrategyManagerConfig,
    pub venues: &'a BTreeMap<String, VenueConfig>,
}

impl StrategyContext<'_> {
    pub fn position(&self, key: &InstrumentKey) -> f64 {
        self.positions.get(key).copied().unwrap_or(0.0)
    }

    pub fn fee_context(&self, venue: &str) -> FeeContext {
        self.venues
            .get(venue)
            .map(|v| FeeContext {
                fee_bps: v.fee_bps,
                flash_fee_bps: v.flash_fee_bps,
            })
            .unwrap_or_default()
    }
}

/// A variant's output for one tick.
#[derive(Debug, Default)]
pub struct Decision {
    pub trigger: String,
    pub actions: Vec<Action>,
    pub target_positions: BTreeMap<InstrumentKey, f64>,
    pub orders: Vec<Order>,
}

impl Decision {
    pub fn hold(trigger: &str) -> Self {
        Decision {
            trigger: trigger.to_string(),
            ..Default::default()
        }
    }
}

// ── Strategy capability surface ─────────────────────────────────────

/// Common surface every variant implements; the engine is variant-agnostic
/// beyond this.
pub trait Strategy: Send {
    fn mode(&self) -> &str;

    /// Instruments this variant will touch; validated against the mode's
    /// subscription set at construction.
    fn required_instruments(&self) -> Vec<InstrumentKey>;

    /// Where the engine seeds initial capital.
    fn funding_instrument(&self) -> InstrumentKey;

    fn decide(&mut self, ctx: &StrategyContext) -> Result<Decision, EngineError>;
}

impl std::fmt::Debug for dyn Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy").field("mode", &self.mode()).finish()
    }
}

/// Build an order with its expected deltas derived from the snapshot the
/// decision is being made against.
pub fn build_order(
    ctx: &StrategyContext,
    operation_type: OperationType,
    source_venue: &str,
    target_venue: &str,
    source_token: &str,
    target_token: &str,
    amount: f64,
) -> Result<Order, EngineError> {
    let order = Order::new(
        operation_type,
        source_venue,
        target_venue,
        source_token,
        target_token,
        amount,
    );
    finish_order(ctx, order)
}

/// Derive and attach expected deltas (used directly for grouped orders).
pub fn finish_order(ctx: &StrategyContext, order: Order) -> Result<Order, EngineError> {
    let fees = ctx.fee_context(order.execution_venue());
    let expected = deltas::derive(&order, ctx.snapshot, ctx.util, &fees)?;
    Ok(order.with_expected_deltas(expected))
}

// ── Mode registry ───────────────────────────────────────────────────

/// Table of variant constructors, selected by the mode identifier.
pub fn build_strategy(config: &EngineConfig) -> Result<Box<dyn Strategy>, EngineError> {
    match config.mode.as_str() {
        "pure_lending_usdt" => Ok(Box::new(pure_lending::PureLendingStrategy::new(config)?)),
        "btc_basis" => Ok(Box::new(basis::BasisStrategy::new(config)?)),
        "leveraged_staking_eth" => Ok(Box::new(
            leveraged_staking::LeveragedStakingStrategy::new(config)?,
        )),
        "ml_directional_btc" => Ok(Box::new(ml_directional::MlDirectionalStrategy::new(
            config,
        )?)),
        other => Err(EngineError::UnknownMode {
            mode: other.to_string(),
        }),
    }
}

// ── Strategy manager ────────────────────────────────────────────────

/// Wraps the selected variant: validates its instrument closure at
/// construction, screens emitted orders against the subscription set, and
/// publishes the decision event.
#[derive(Debug)]
pub struct StrategyManager {
    strategy: Box<dyn Strategy>,
    subscriptions: HashSet<InstrumentKey>,
    config: StrategyManagerConfig,
    venues: BTreeMap<String, VenueConfig>,
    logger: Arc<StructuredLogger>,
    events: Arc<DomainEventLogger>,
}

impl StrategyManager {
    pub fn new(
        config: &EngineConfig,
        logger: Arc<StructuredLogger>,
        events: Arc<DomainEventLogger>,
    ) -> Result<Self, EngineError> {
        let strategy = build_strategy(config)?;
        Self::with_strategy(strategy, config, logger, events)
    }

    /// Constructor that accepts a pre-built variant (tests inject probes
    /// through this).
    pub fn with_strategy(
        strategy: Box<dyn Strategy>,
        config: &EngineConfig,
        logger: Arc<StructuredLogger>,
        events: Arc<DomainEventLogger>,
    ) -> Result<Self, EngineError> {
        let subscriptions = config.component_config.position_monitor.subscriptions()?;
        for key in strategy.required_instruments() {
            if !subscriptions.contains(&key) {
                return Err(EngineError::MissingInstrument {
                    mode: strategy.mode().to_string(),
                    key: key.to_string(),
                });
            }
        }
        Ok(Self {
            strategy,
            subscriptions,
            config: config.component_config.strategy_manager.clone(),
            venues: config.venues.clone(),
            logger,
            events,
        })
    }

    pub fn mode(&self) -> &str {
        self.strategy.mode()
    }

    pub fn funding_instrument(&self) -> InstrumentKey {
        self.strategy.funding_instrument()
    }

    /// Run the variant and screen its orders. An order referencing an
    /// unsubscribed instrument is dropped with one warning; the tick
    /// continues with the rest.
    pub fn decide(
        &mut self,
        timestamp: u64,
        positions: &HashMap<InstrumentKey, f64>,
        exposure: &ExposureSnapshot,
        risk: &RiskAssessment,
        snapshot: &MarketSnapshot,
        util: &UtilityManager,
    ) -> Result<Vec<Order>, EngineError> {
        let ctx = StrategyContext {
            timestamp,
            positions,
            exposure,
            risk,
            snapshot,
            util,
            config: &self.config,
            venues: &self.venues,
        };
        let decision = self.strategy.decide(&ctx)?;

        let mut orders = Vec::with_capacity(decision.orders.len());
        for order in decision.orders {
            let unsubscribed = order
                .expected_keys()
                .find(|key| !self.subscriptions.contains(*key))
                .map(|key| key.to_string());
            match unsubscribed {
                Some(key) => {
                    let err = EngineError::UnsubscribedInstrument { key };
                    self.logger.engine_error(&err);
                }
                None => orders.push(order),
            }
        }

        self.events
            .emit(DomainEvent::StrategyDecision(StrategyDecisionEvent {
                timestamp,
                mode: self.strategy.mode().to_string(),
                trigger: decision.trigger,
                actions: decision.actions.iter().map(|a| a.as_str().to_string()).collect(),
                target_positions: decision.target_positions,
                orders_emitted: orders.iter().map(|o| o.operation_id.clone()).collect(),
            }));

        Ok(orders)
    }
}
