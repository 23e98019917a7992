mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use basis_engine::config::{ConversionMethod, RiskLimits, RiskType, StrategyManagerConfig};
use basis_engine::data::backtest::BacktestDataProvider;
use basis_engine::engine::{Engine, RunStatus};
use basis_engine::model::InstrumentKey;

use common::*;

/// weETH per ETH minted by the staking venue.
const LST_RATE: f64 = 0.96;
const ETH_PRICE: f64 = 2_000.0;

fn staking_config(capital: f64, max_ltv: f64) -> basis_engine::EngineConfig {
    let mut venues = BTreeMap::new();
    venues.insert(
        "aave_v3".to_string(),
        chain_venue(
            &[("aweETH", "weETH"), ("debtETH", "ETH")],
            Some(max_ltv),
        ),
    );
    venues.insert(
        "etherfi".to_string(),
        chain_venue(&[("weETH", "ETH")], None),
    );
    venues.insert("wallet".to_string(), chain_venue(&[], None));

    let strategy = StrategyManagerConfig {
        target_leverage: Some(3.0),
        ..default_strategy_config("leveraged_staking")
    };

    build_config(ModeParams {
        mode: "leveraged_staking_eth",
        capital,
        reporting_currency: "USDT",
        subscriptions: vec![
            "wallet:BaseToken:ETH",
            "etherfi:LST:weETH",
            "aave_v3:aToken:aweETH",
            "aave_v3:debtToken:debtETH",
        ],
        track_assets: vec!["ETH", "weETH"],
        conversions: vec![
            ("ETH", ConversionMethod::UsdPrice),
            (
                "weETH",
                ConversionMethod::LstRate {
                    underlying: "ETH".to_string(),
                },
            ),
            (
                "aweETH",
                ConversionMethod::SupplyIndex {
                    underlying: "weETH".to_string(),
                },
            ),
            (
                "debtETH",
                ConversionMethod::BorrowIndex {
                    underlying: "ETH".to_string(),
                },
            ),
        ],
        enabled_risk_types: vec![RiskType::HealthFactor, RiskType::Ltv],
        risk_limits: RiskLimits {
            min_health_factor: Some(1.05),
            liquidation_threshold: Some(0.85),
            max_ltv: Some(0.8),
            ..Default::default()
        },
        venues,
        strategy,
    })
}

fn write_staking_data(dir: &std::path::Path) {
    // weETH spot marks at the conversion-rate-implied price.
    let weeth_price = ETH_PRICE / LST_RATE;
    write_file(
        dir,
        "prices.csv",
        &format!(
            "timestamp,symbol,price\n{T0},USDT,1.0\n{T0},ETH,{ETH_PRICE}\n{T0},weETH,{weeth_price}\n"
        ),
    );
    write_file(
        dir,
        "lending.csv",
        &format!("timestamp,asset,supply_index,borrow_index\n{T0},weETH,1.0,1.0\n"),
    );
    write_file(
        dir,
        "staking.csv",
        &format!("timestamp,symbol,conversion_rate\n{T0},weETH,{LST_RATE}\n"),
    );
}

#[tokio::test]
async fn group_rolls_back_when_borrow_breaches_ltv() {
    let data_dir = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    write_staking_data(data_dir.path());

    // 3x leverage borrows ~2/3 of collateral value; a 0.5 LTV cap rejects
    // the in-bundle borrow, so the venue rolls the whole group back.
    let data = Arc::new(BacktestDataProvider::load(data_dir.path()).unwrap());
    let mut engine =
        Engine::with_logs_root(staking_config(10.0, 0.5), data, logs_dir.path()).unwrap();
    let result = engine.run().await;
    assert_eq!(result.status, RunStatus::Completed);

    // Book unchanged from the pre-group state.
    let wallet = InstrumentKey::parse("wallet:BaseToken:ETH").unwrap();
    let atoken = InstrumentKey::parse("aave_v3:aToken:aweETH").unwrap();
    let debt = InstrumentKey::parse("aave_v3:debtToken:debtETH").unwrap();
    let positions = engine.monitors().positions.simulated();
    assert!((positions[&wallet] - 10.0).abs() < 1e-9);
    assert_eq!(positions[&atoken], 0.0);
    assert_eq!(positions[&debt], 0.0);

    let streams = assert_event_streams_well_formed(&engine.run_directory().events_dir);

    // Every handshake in the group reports rolled_back and no deltas.
    let executions = &streams["operation_executions"];
    assert_eq!(executions.len(), 5);
    for execution in executions {
        assert_eq!(execution["status"], "rolled_back");
        assert!(execution["actual_deltas"].as_object().unwrap().is_empty());
    }

    let groups = &streams["atomic_groups"];
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["all_succeeded"], false);
    assert_eq!(groups[0]["rollback_occurred"], true);
    assert_eq!(groups[0]["operation_ids"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn group_commits_atomically_within_ltv() {
    let data_dir = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    write_staking_data(data_dir.path());

    let data = Arc::new(BacktestDataProvider::load(data_dir.path()).unwrap());
    let mut engine =
        Engine::with_logs_root(staking_config(10.0, 0.7), data, logs_dir.path()).unwrap();
    let result = engine.run().await;
    assert_eq!(result.status, RunStatus::Completed);

    // 10 ETH at 3x: 20 flash-borrowed, 30 staked, 28.8 weETH supplied,
    // 20 ETH borrowed and flash-repaid. Wallet ends empty.
    let wallet = InstrumentKey::parse("wallet:BaseToken:ETH").unwrap();
    let lst = InstrumentKey::parse("etherfi:LST:weETH").unwrap();
    let atoken = InstrumentKey::parse("aave_v3:aToken:aweETH").unwrap();
    let debt = InstrumentKey::parse("aave_v3:debtToken:debtETH").unwrap();

    let positions = engine.monitors().positions.simulated();
    assert!(positions[&wallet].abs() < 1e-9, "wallet: {}", positions[&wallet]);
    assert!(positions[&lst].abs() < 1e-9, "lst: {}", positions[&lst]);
    assert!((positions[&atoken] - 28.8).abs() < 1e-9);
    assert!((positions[&debt] - 20.0).abs() < 1e-9);

    let streams = assert_event_streams_well_formed(&engine.run_directory().events_dir);
    let groups = &streams["atomic_groups"];
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["all_succeeded"], true);
    assert_eq!(groups[0]["rollback_occurred"], false);

    for execution in &streams["operation_executions"] {
        assert_eq!(execution["status"], "confirmed");
    }

    // Health factor over the leveraged book: 28.8 weETH collateral vs
    // 20 ETH debt at the 0.85 liquidation threshold.
    let risk = engine.monitors().risk.latest().unwrap();
    let hf = risk.health_factor.unwrap();
    let expected_hf = (28.8 * (ETH_PRICE / LST_RATE)) * 0.85 / (20.0 * ETH_PRICE);
    assert!((hf - expected_hf).abs() < 1e-6, "hf {hf} vs {expected_hf}");
}
