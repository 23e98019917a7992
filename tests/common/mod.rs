//! Shared fixtures for the integration tests: config builders and CSV
//! data-directory writers.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use basis_engine::config::{
    AttributionType, ComponentConfig, ConversionMethod, EngineConfig, ExecutionManagerConfig,
    ExecutionMode, ExposureMonitorConfig, PnlMonitorConfig, PositionMonitorConfig,
    RiskLimits, RiskMonitorConfig, RiskType, StrategyManagerConfig, VenueConfig, VenueKind,
};

pub const T0: u64 = 1_700_000_000;

pub fn write_file(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).expect("write test data file");
}

pub fn chain_venue(canonical: &[(&str, &str)], max_ltv: Option<f64>) -> VenueConfig {
    VenueConfig {
        enabled: true,
        kind: VenueKind::Chain,
        instruments: Vec::new(),
        canonical_instruments: canonical
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        order_types: Vec::new(),
        min_amount: 1.0,
        max_leverage: 1.0,
        fee_bps: 0.0,
        flash_fee_bps: 0.0,
        slippage_bps: 0.0,
        max_ltv,
    }
}

pub fn cex_venue(canonical: &[(&str, &str)], max_leverage: f64) -> VenueConfig {
    VenueConfig {
        enabled: true,
        kind: VenueKind::Cex,
        instruments: Vec::new(),
        canonical_instruments: canonical
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        order_types: vec!["market".to_string()],
        min_amount: 10.0,
        max_leverage,
        fee_bps: 0.0,
        flash_fee_bps: 0.0,
        slippage_bps: 0.0,
        max_ltv: None,
    }
}

pub struct ModeParams {
    pub mode: &'static str,
    pub capital: f64,
    pub reporting_currency: &'static str,
    pub subscriptions: Vec<&'static str>,
    pub track_assets: Vec<&'static str>,
    pub conversions: Vec<(&'static str, ConversionMethod)>,
    pub enabled_risk_types: Vec<RiskType>,
    pub risk_limits: RiskLimits,
    pub venues: BTreeMap<String, VenueConfig>,
    pub strategy: StrategyManagerConfig,
}

pub fn default_strategy_config(strategy_type: &str) -> StrategyManagerConfig {
    StrategyManagerConfig {
        strategy_type: strategy_type.to_string(),
        rebalancing_triggers: vec!["position_deviation".to_string()],
        position_deviation_threshold: 0.01,
        reserve_ratio: 0.0,
        hedge_allocation: 0.5,
        dust_threshold: Some(50.0),
        signal_threshold: Some(0.5),
        target_leverage: None,
    }
}

pub fn build_config(params: ModeParams) -> EngineConfig {
    EngineConfig {
        mode: params.mode.to_string(),
        share_class: params.reporting_currency.to_string(),
        initial_capital: params.capital,
        reporting_currency: params.reporting_currency.to_string(),
        execution_mode: ExecutionMode::Backtest,
        tick_interval_secs: 60,
        backtest_seed: 7,
        component_config: ComponentConfig {
            position_monitor: PositionMonitorConfig {
                position_subscriptions: params
                    .subscriptions
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            exposure_monitor: ExposureMonitorConfig {
                exposure_currency: params.reporting_currency.to_string(),
                track_assets: params.track_assets.iter().map(|s| s.to_string()).collect(),
                conversion_methods: params
                    .conversions
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            },
            risk_monitor: RiskMonitorConfig {
                enabled_risk_types: params.enabled_risk_types,
                risk_limits: params.risk_limits,
                delta_tolerance: 0.02,
                delta_tracking_asset: params
                    .track_assets
                    .first()
                    .copied()
                    .unwrap_or("USDT")
                    .to_string(),
                warning_threshold: 0.8,
                critical_threshold: 1.0,
            },
            pnl_monitor: PnlMonitorConfig {
                attribution_types: vec![
                    AttributionType::Funding,
                    AttributionType::Price,
                    AttributionType::Fees,
                    AttributionType::LendingYield,
                    AttributionType::StakingYield,
                ],
                reconciliation_tolerance: 0.01,
            },
            strategy_manager: params.strategy,
            execution_manager: ExecutionManagerConfig {
                max_retries: 2,
                retry_delay_ms: 1,
                tight_loop_timeout_ms: 5_000,
                supported_actions: Vec::new(),
                action_mapping: BTreeMap::new(),
            },
        },
        venues: params.venues,
    }
}

/// Parse every line of every `events/*.jsonl` stream, asserting
/// well-formedness and the correlation-scope fields.
pub fn assert_event_streams_well_formed(events_dir: &Path) -> BTreeMap<String, Vec<serde_json::Value>> {
    let mut streams = BTreeMap::new();
    for entry in std::fs::read_dir(events_dir).expect("events dir exists") {
        let path = entry.expect("dir entry").path();
        if path.extension().is_none_or(|e| e != "jsonl") {
            continue;
        }
        let stem = path.file_stem().unwrap().to_string_lossy().to_string();
        let contents = std::fs::read_to_string(&path).expect("read stream");
        let mut parsed = Vec::new();
        for line in contents.lines() {
            let value: serde_json::Value = serde_json::from_str(line)
                .unwrap_or_else(|e| panic!("unparseable line in {stem}.jsonl: {e}\n{line}"));
            for field in ["correlation_id", "pid", "timestamp", "real_utc_time"] {
                assert!(
                    value.get(field).is_some(),
                    "{stem}.jsonl line missing `{field}`: {line}"
                );
            }
            parsed.push(value);
        }
        streams.insert(stem, parsed);
    }
    streams
}
