mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use basis_engine::config::{ConversionMethod, RiskLimits, RiskType};
use basis_engine::data::MarketSnapshot;
use basis_engine::events::{ExposureSnapshot, RiskAssessment, RiskLevel};
use basis_engine::logging::{DomainEventLogger, LogDirectoryManager, RunContext, StructuredLogger};
use basis_engine::model::{InstrumentKey, OperationType, Order};
use basis_engine::strategy::{
    build_strategy, Decision, Strategy, StrategyContext, StrategyManager,
};
use basis_engine::util::UtilityManager;
use basis_engine::EngineError;

use common::*;

fn basis_like_config() -> basis_engine::EngineConfig {
    let mut venues = BTreeMap::new();
    venues.insert("binance".to_string(), cex_venue(&[("BTCUSDT", "BTC")], 5.0));
    build_config(ModeParams {
        mode: "btc_basis",
        capital: 100_000.0,
        reporting_currency: "USDT",
        subscriptions: vec![
            "binance:BaseToken:USDT",
            "binance:BaseToken:BTC",
            "binance:Perp:BTCUSDT",
        ],
        track_assets: vec!["BTC"],
        conversions: vec![
            ("USDT", ConversionMethod::Direct),
            ("BTC", ConversionMethod::UsdPrice),
            (
                "BTCUSDT",
                ConversionMethod::PerpMark {
                    underlying: "BTC".to_string(),
                },
            ),
        ],
        enabled_risk_types: vec![RiskType::DeltaTolerance],
        risk_limits: RiskLimits::default(),
        venues,
        strategy: default_strategy_config("basis"),
    })
}

fn snapshot() -> MarketSnapshot {
    let mut snap = MarketSnapshot {
        timestamp: T0,
        ..Default::default()
    };
    snap.prices.insert("USDT".into(), 1.0);
    snap.prices.insert("BTC".into(), 50_000.0);
    snap.prices.insert("ETH".into(), 2_000.0);
    snap
}

fn empty_exposure() -> ExposureSnapshot {
    ExposureSnapshot {
        timestamp: T0,
        currency: "USDT".to_string(),
        net_delta: 0.0,
        exposures: BTreeMap::new(),
        total_value: 0.0,
    }
}

fn healthy_risk() -> RiskAssessment {
    RiskAssessment {
        timestamp: T0,
        health_factor: None,
        ltv: None,
        liquidation_threshold: None,
        margin_usage: None,
        risk_level: RiskLevel::Healthy,
        warnings: Vec::new(),
        breaches: Vec::new(),
    }
}

/// Probe variant: emits one order inside the subscribed universe and one
/// referencing a venue the mode never subscribed.
struct RogueProbe;

impl Strategy for RogueProbe {
    fn mode(&self) -> &str {
        "btc_basis"
    }

    fn required_instruments(&self) -> Vec<InstrumentKey> {
        vec![InstrumentKey::parse("binance:Perp:BTCUSDT").unwrap()]
    }

    fn funding_instrument(&self) -> InstrumentKey {
        InstrumentKey::parse("binance:BaseToken:USDT").unwrap()
    }

    fn decide(&mut self, ctx: &StrategyContext) -> Result<Decision, EngineError> {
        let good = basis_engine::strategy::finish_order(
            ctx,
            Order::new(
                OperationType::PerpTrade,
                "binance",
                "binance",
                "USDT",
                "BTCUSDT",
                -1.0,
            ),
        )?;
        let rogue = basis_engine::strategy::finish_order(
            ctx,
            Order::new(
                OperationType::PerpTrade,
                "bybit",
                "bybit",
                "USDT",
                "ETHUSDT",
                -1.0,
            ),
        )?;
        Ok(Decision {
            trigger: "probe".to_string(),
            actions: Vec::new(),
            target_positions: BTreeMap::new(),
            orders: vec![good, rogue],
        })
    }
}

struct LoggerFixture {
    logger: Arc<StructuredLogger>,
    events: Arc<DomainEventLogger>,
    _dir: tempfile::TempDir,
}

fn logger_fixture(mode: &str) -> LoggerFixture {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Arc::new(RunContext::new(mode, 0.0));
    let run_dir = LogDirectoryManager::create(dir.path(), &ctx).unwrap();
    LoggerFixture {
        logger: Arc::new(
            StructuredLogger::open(&run_dir.run_dir, "strategy_manager", Arc::clone(&ctx)).unwrap(),
        ),
        events: Arc::new(DomainEventLogger::new(&run_dir.events_dir, ctx)),
        _dir: dir,
    }
}

#[test]
fn unsubscribed_order_is_dropped_and_tick_continues() {
    let config = basis_like_config();
    let fixture = logger_fixture(&config.mode);
    let mut manager = StrategyManager::with_strategy(
        Box::new(RogueProbe),
        &config,
        Arc::clone(&fixture.logger),
        Arc::clone(&fixture.events),
    )
    .unwrap();

    let snap = snapshot();
    // ETHUSDT needs a price for delta derivation on the rogue order.
    let util = {
        let mut canonical = config.canonical_instruments();
        canonical.insert("ETHUSDT".to_string(), "ETH".to_string());
        UtilityManager::new(canonical)
    };

    let positions = std::collections::HashMap::new();
    let exposure = empty_exposure();
    let risk = healthy_risk();
    let orders = manager
        .decide(T0, &positions, &exposure, &risk, &snap, &util)
        .unwrap();

    // The rogue order was dropped; the valid one survives.
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].target_token, "BTCUSDT");
}

#[test]
fn unknown_mode_is_rejected() {
    let mut config = basis_like_config();
    config.mode = "volatility_carry_eth".to_string();
    let err = build_strategy(&config).unwrap_err();
    assert_eq!(err.code(), "CONF-002");
}

#[test]
fn strategy_requiring_unsubscribed_instrument_fails_construction() {
    let mut config = basis_like_config();
    // Remove the perp subscription the basis variant requires.
    config
        .component_config
        .position_monitor
        .position_subscriptions
        .retain(|s| !s.contains("Perp"));

    let fixture = logger_fixture(&config.mode);
    let err = StrategyManager::new(&config, fixture.logger, fixture.events).unwrap_err();
    assert_eq!(err.code(), "CONF-003");
    assert!(err.to_string().contains("binance:Perp:BTCUSDT"));
}

#[test]
fn tie_break_priority_orders_actions() {
    use basis_engine::strategy::Action;
    let mut actions = vec![
        Action::SellDust,
        Action::EntryFull,
        Action::RiskExit,
        Action::Rebalance,
        Action::ExitPartial,
    ];
    actions.sort();
    assert_eq!(
        actions,
        vec![
            Action::RiskExit,
            Action::ExitPartial,
            Action::EntryFull,
            Action::Rebalance,
            Action::SellDust,
        ]
    );
}
