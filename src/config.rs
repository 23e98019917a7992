//! Configuration value consumed by the engine.
//!
//! Parsing and schema validation happen upstream; the engine receives an
//! already-validated [`EngineConfig`]. Safety-relevant fields are required
//! (missing ones fail deserialization or component construction with a
//! `CONF-` error); purely informational knobs carry serde defaults.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::InstrumentKey;

/// Backtest or live. `BASIS_EXECUTION_MODE` overrides the configured value
/// when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Backtest,
    Live,
}

impl ExecutionMode {
    pub fn resolve(configured: ExecutionMode) -> ExecutionMode {
        match std::env::var("BASIS_EXECUTION_MODE").ok().as_deref() {
            Some("live") => ExecutionMode::Live,
            Some("backtest") => ExecutionMode::Backtest,
            _ => configured,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ExecutionMode::Live)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    pub mode: String,
    pub share_class: String,
    pub initial_capital: f64,
    pub reporting_currency: String,
    pub execution_mode: ExecutionMode,
    /// Wall-clock tick cadence in live mode.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Seed for simulator randomness (slippage jitter).
    #[serde(default)]
    pub backtest_seed: u64,
    pub component_config: ComponentConfig,
    pub venues: BTreeMap<String, VenueConfig>,
}

fn default_tick_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ComponentConfig {
    pub position_monitor: PositionMonitorConfig,
    pub exposure_monitor: ExposureMonitorConfig,
    pub risk_monitor: RiskMonitorConfig,
    pub pnl_monitor: PnlMonitorConfig,
    pub strategy_manager: StrategyManagerConfig,
    pub execution_manager: ExecutionManagerConfig,
}

// ── Position monitor ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PositionMonitorConfig {
    /// Instrument keys the mode is allowed to touch; also the universe the
    /// monitor pre-initializes.
    pub position_subscriptions: Vec<String>,
}

impl PositionMonitorConfig {
    /// Parse and validate the subscription set through the single key
    /// validator. Any malformed key is a construction failure.
    pub fn subscriptions(&self) -> Result<HashSet<InstrumentKey>, EngineError> {
        let mut set = HashSet::with_capacity(self.position_subscriptions.len());
        for raw in &self.position_subscriptions {
            let key = InstrumentKey::parse(raw).map_err(|e| EngineError::InvalidSubscription {
                key: raw.clone(),
                reason: e.to_string(),
            })?;
            set.insert(key);
        }
        Ok(set)
    }
}

// ── Exposure monitor ────────────────────────────────────────────────

/// Per-asset conversion selector into the reporting currency.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ConversionMethod {
    /// Stablecoin pegged 1:1 to the reporting currency.
    Direct,
    /// Spot USD price from the snapshot.
    UsdPrice,
    /// Named oracle feed in the snapshot price map.
    Oracle { feed: String },
    /// Perp position marked at the underlying's price.
    PerpMark { underlying: String },
    /// LST units valued via the staking conversion rate times the
    /// underlying's price.
    LstRate { underlying: String },
    /// Interest-bearing lending units; value = amount / supply_index x
    /// underlying price.
    SupplyIndex { underlying: String },
    /// Debt units; magnitude = amount / borrow_index x underlying price
    /// (sign is applied by the exposure fold).
    BorrowIndex { underlying: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExposureMonitorConfig {
    pub exposure_currency: String,
    /// Assets whose exposure contributes to net delta.
    pub track_assets: Vec<String>,
    /// Keyed by position symbol (e.g. `aUSDT`, `weETH`, `BTCUSDT`).
    pub conversion_methods: BTreeMap<String, ConversionMethod>,
}

// ── Risk monitor ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    HealthFactor,
    Ltv,
    CexMargin,
    FundingRate,
    DeltaTolerance,
}

impl RiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskType::HealthFactor => "health_factor",
            RiskType::Ltv => "ltv",
            RiskType::CexMargin => "cex_margin",
            RiskType::FundingRate => "funding_rate",
            RiskType::DeltaTolerance => "delta_tolerance",
        }
    }
}

/// Limits are optional at the type level so modes only state the ones their
/// enabled risk set reads; enabling a risk type without its limit fails at
/// construction.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RiskLimits {
    #[serde(default)]
    pub min_health_factor: Option<f64>,
    #[serde(default)]
    pub max_ltv: Option<f64>,
    #[serde(default)]
    pub liquidation_threshold: Option<f64>,
    #[serde(default)]
    pub max_margin_usage: Option<f64>,
    #[serde(default)]
    pub max_funding_rate: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskMonitorConfig {
    pub enabled_risk_types: Vec<RiskType>,
    pub risk_limits: RiskLimits,
    /// Maximum |net_delta| / total_value before a delta breach.
    pub delta_tolerance: f64,
    pub delta_tracking_asset: String,
    /// Fraction of a limit at which the level degrades to warning.
    pub warning_threshold: f64,
    /// Fraction of a limit at which the level degrades to critical.
    pub critical_threshold: f64,
}

// ── P&L monitor ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionType {
    Funding,
    Price,
    Fees,
    LendingYield,
    StakingYield,
}

impl AttributionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributionType::Funding => "funding",
            AttributionType::Price => "price",
            AttributionType::Fees => "fees",
            AttributionType::LendingYield => "lending_yield",
            AttributionType::StakingYield => "staking_yield",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PnlMonitorConfig {
    pub attribution_types: Vec<AttributionType>,
    /// Per-key absolute difference below which simulated and real agree.
    pub reconciliation_tolerance: f64,
}

// ── Strategy manager ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyManagerConfig {
    pub strategy_type: String,
    #[serde(default)]
    pub rebalancing_triggers: Vec<String>,
    pub position_deviation_threshold: f64,
    pub reserve_ratio: f64,
    pub hedge_allocation: f64,
    /// Variant-specific knobs; each variant checks the ones it reads at
    /// construction.
    #[serde(default)]
    pub dust_threshold: Option<f64>,
    #[serde(default)]
    pub signal_threshold: Option<f64>,
    #[serde(default)]
    pub target_leverage: Option<f64>,
}

impl StrategyManagerConfig {
    pub fn require(&self, field: &str, value: Option<f64>) -> Result<f64, EngineError> {
        value.ok_or_else(|| EngineError::MissingConfig {
            field: format!("component_config.strategy_manager.{field}"),
        })
    }
}

// ── Execution manager ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionManagerConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub tight_loop_timeout_ms: u64,
    /// When non-empty, operations outside this list are rejected.
    #[serde(default)]
    pub supported_actions: Vec<String>,
    #[serde(default)]
    pub action_mapping: BTreeMap<String, String>,
}

// ── Venues ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueKind {
    /// Centralized exchange (spot + perps), plus transfers in/out.
    Cex,
    /// On-chain protocol cluster (lending, staking, DEX, flash loans),
    /// capable of executing atomic bundles.
    Chain,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VenueConfig {
    pub enabled: bool,
    pub kind: VenueKind,
    pub instruments: Vec<String>,
    /// Derivative symbol -> underlying symbol (e.g. `aUSDT` -> `USDT`,
    /// `weETH` -> `ETH`, `BTCUSDT` -> `BTC`).
    #[serde(default)]
    pub canonical_instruments: BTreeMap<String, String>,
    #[serde(default)]
    pub order_types: Vec<String>,
    pub min_amount: f64,
    pub max_leverage: f64,
    /// Taker fee in basis points, charged in the target currency.
    #[serde(default)]
    pub fee_bps: f64,
    /// Flash-loan premium in basis points.
    #[serde(default)]
    pub flash_fee_bps: f64,
    /// Simulator slippage cap in basis points (backtest realism knob;
    /// 0 keeps reconciliation exact).
    #[serde(default)]
    pub slippage_bps: f64,
    /// Borrow cap as a fraction of collateral value; lending venues reject
    /// borrows above it.
    #[serde(default)]
    pub max_ltv: Option<f64>,
}

impl EngineConfig {
    pub fn venue(&self, name: &str) -> Result<&VenueConfig, EngineError> {
        self.venues
            .get(name)
            .filter(|v| v.enabled)
            .ok_or_else(|| EngineError::VenueNotConfigured {
                venue: name.to_string(),
            })
    }

    /// Union of the `canonical_instruments` maps across enabled venues.
    pub fn canonical_instruments(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for venue in self.venues.values().filter(|v| v.enabled) {
            for (symbol, underlying) in &venue.canonical_instruments {
                map.insert(symbol.clone(), underlying.clone());
            }
        }
        map
    }
}
