mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use basis_engine::config::{ConversionMethod, RiskLimits, RiskType};
use basis_engine::data::backtest::BacktestDataProvider;
use basis_engine::engine::{Engine, RunStatus};
use basis_engine::events::RiskLevel;
use basis_engine::model::InstrumentKey;

use common::*;

fn basis_config(capital: f64) -> basis_engine::EngineConfig {
    let mut venues = BTreeMap::new();
    venues.insert(
        "binance".to_string(),
        cex_venue(&[("BTCUSDT", "BTC")], 5.0),
    );
    build_config(ModeParams {
        mode: "btc_basis",
        capital,
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
        enabled_risk_types: vec![RiskType::CexMargin, RiskType::DeltaTolerance],
        risk_limits: RiskLimits {
            max_margin_usage: Some(3.0),
            ..Default::default()
        },
        venues,
        strategy: default_strategy_config("basis"),
    })
}

fn write_basis_data(dir: &std::path::Path, ticks: u64) {
    let mut prices = String::from("timestamp,symbol,price\n");
    let mut funding = String::from("timestamp,symbol,rate\n");
    for i in 0..ticks {
        let t = T0 + i * 3600;
        prices.push_str(&format!("{t},USDT,1.0\n{t},BTC,50000.0\n"));
        funding.push_str(&format!("{t},BTCUSDT,0.0001\n"));
    }
    write_file(dir, "prices.csv", &prices);
    write_file(dir, "funding.csv", &funding);
}

#[tokio::test]
async fn basis_entry_builds_delta_neutral_book() {
    let data_dir = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    write_basis_data(data_dir.path(), 2);

    let data = Arc::new(BacktestDataProvider::load(data_dir.path()).unwrap());
    let mut engine =
        Engine::with_logs_root(basis_config(100_000.0), data, logs_dir.path()).unwrap();
    let result = engine.run().await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.ticks, 2);

    let quote = InstrumentKey::parse("binance:BaseToken:USDT").unwrap();
    let spot = InstrumentKey::parse("binance:BaseToken:BTC").unwrap();
    let perp = InstrumentKey::parse("binance:Perp:BTCUSDT").unwrap();

    // 50% of capital to spot at 50k, an equal-size perp short against it.
    let positions = engine.monitors().positions.simulated();
    assert!((positions[&quote] - 50_000.0).abs() < 1e-6);
    assert!((positions[&spot] - 1.0).abs() < 1e-9);
    assert!((positions[&perp] + 1.0).abs() < 1e-9);

    // Net delta on the tracked asset is flat.
    let exposure = engine.monitors().exposure.latest().unwrap();
    assert!(exposure.net_delta.abs() < 1e-6, "net delta {}", exposure.net_delta);
    let btc = &exposure.exposures["BTC"];
    assert!(btc.amount.abs() < 1e-9);

    let risk = engine.monitors().risk.latest().unwrap();
    assert_eq!(risk.risk_level, RiskLevel::Healthy);
    // Margin usage: 50k notional against 100k of exchange collateral.
    assert!((risk.margin_usage.unwrap() - 0.5).abs() < 1e-6);

    // Both entry orders confirmed, in list order, on the first tick only.
    let streams = assert_event_streams_well_formed(&engine.run_directory().events_dir);
    let executions = &streams["operation_executions"];
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0]["operation_type"], "spot_trade");
    assert_eq!(executions[1]["operation_type"], "perp_trade");
    for execution in executions {
        assert_eq!(execution["status"], "confirmed");
    }

    // Tight loop ran once per order before the next began.
    let tight_loops = &streams["tight_loop"];
    assert_eq!(tight_loops.len(), 2);
    for event in tight_loops {
        assert_eq!(event["reconciliation_success"], true);
    }

    // Funding accrued to the short across the second tick.
    let pnl = engine.monitors().pnl.get_latest().unwrap();
    let funding = pnl.attribution.get("funding").copied().unwrap_or(0.0);
    // Short 1 BTC at 50k, rate 1e-4 per interval: +5 per tick boundary.
    assert!(
        (funding - 5.0).abs() < 1e-6,
        "expected +5 funding for the short, got {funding}"
    );
}

#[tokio::test]
async fn second_tick_holds_with_no_new_orders() {
    let data_dir = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    write_basis_data(data_dir.path(), 3);

    let data = Arc::new(BacktestDataProvider::load(data_dir.path()).unwrap());
    let mut engine =
        Engine::with_logs_root(basis_config(100_000.0), data, logs_dir.path()).unwrap();
    let result = engine.run().await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.ticks, 3);

    let streams = assert_event_streams_well_formed(&engine.run_directory().events_dir);
    // Entry on tick one; the hedge stays within the deviation threshold
    // afterwards, so no further executions.
    assert_eq!(streams["operation_executions"].len(), 2);

    let decisions = &streams["strategy_decisions"];
    assert_eq!(decisions.len(), 3);
    assert_eq!(decisions[0]["trigger"], "entry_full");
    assert_eq!(decisions[1]["trigger"], "no_action");
    assert_eq!(decisions[2]["trigger"], "no_action");
}
