//! Domain event payloads.
//!
//! One JSONL stream per event kind under `events/` in the run directory.
//! Every payload carries the engine timestamp; the [`crate::logging`]
//! substrate wraps payloads with the correlation scope and real UTC time
//! before they hit disk.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{ExpectedDelta, HandshakeStatus, InstrumentKey, OperationType};

// ── Positions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionView {
    Simulated,
    Real,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub timestamp: u64,
    pub view: PositionView,
    pub trigger: String,
    pub positions: BTreeMap<InstrumentKey, f64>,
    pub total_value_usd: f64,
}

// ── Exposure ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssetExposure {
    pub amount: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureSnapshot {
    pub timestamp: u64,
    pub currency: String,
    /// Signed reporting-currency value summed over the tracked assets.
    pub net_delta: f64,
    pub exposures: BTreeMap<String, AssetExposure>,
    pub total_value: f64,
}

// ── Risk ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskBreach {
    pub risk_type: String,
    pub code: String,
    pub message: String,
    pub level: RiskLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub timestamp: u64,
    pub health_factor: Option<f64>,
    pub ltv: Option<f64>,
    pub liquidation_threshold: Option<f64>,
    pub margin_usage: Option<f64>,
    pub risk_level: RiskLevel,
    pub warnings: Vec<String>,
    pub breaches: Vec<RiskBreach>,
}

// ── P&L ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlCalculation {
    pub timestamp: u64,
    pub realized: f64,
    pub unrealized: f64,
    pub total: f64,
    pub fees: f64,
    pub funding: f64,
    pub by_venue: BTreeMap<String, f64>,
    pub by_asset: BTreeMap<String, f64>,
    /// Cumulative attribution for the enabled categories only.
    pub attribution: BTreeMap<String, f64>,
}

// ── Execution ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationExecutionEvent {
    pub timestamp: u64,
    pub operation_id: String,
    pub operation_type: OperationType,
    pub venue: String,
    pub status: HandshakeStatus,
    pub expected_deltas: Vec<ExpectedDelta>,
    pub actual_deltas: BTreeMap<InstrumentKey, f64>,
    pub execution_duration_ms: u64,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicOperationGroupEvent {
    pub timestamp: u64,
    pub group_id: String,
    pub operation_ids: Vec<String>,
    pub all_succeeded: bool,
    pub rollback_occurred: bool,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TightLoopExecutionEvent {
    pub timestamp: u64,
    pub operation_id: String,
    pub retry_count: u32,
    pub execution_duration_ms: u64,
    pub reconciliation_duration_ms: u64,
    pub reconciliation_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationMismatch {
    pub instrument_key: InstrumentKey,
    pub simulated: f64,
    pub real: f64,
    pub difference: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationEvent {
    pub timestamp: u64,
    pub operation_id: String,
    pub simulated_positions: BTreeMap<InstrumentKey, f64>,
    pub real_positions: BTreeMap<InstrumentKey, f64>,
    pub mismatches: Vec<ReconciliationMismatch>,
    pub retry_attempt: u32,
    pub max_retries: u32,
    pub success: bool,
}

// ── Strategy ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDecisionEvent {
    pub timestamp: u64,
    pub mode: String,
    pub trigger: String,
    pub actions: Vec<String>,
    pub target_positions: BTreeMap<InstrumentKey, f64>,
    pub orders_emitted: Vec<String>,
}

// ── Event kinds / streams ───────────────────────────────────────────

/// One variant per append-only JSONL stream.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DomainEvent {
    Position(PositionSnapshot),
    Exposure(ExposureSnapshot),
    Risk(RiskAssessment),
    Pnl(PnlCalculation),
    StrategyDecision(StrategyDecisionEvent),
    OperationExecution(OperationExecutionEvent),
    AtomicGroup(AtomicOperationGroupEvent),
    TightLoop(TightLoopExecutionEvent),
    Reconciliation(ReconciliationEvent),
}

impl DomainEvent {
    /// Stream file stem under `events/` (`<stream>.jsonl`).
    pub fn stream(&self) -> &'static str {
        match self {
            DomainEvent::Position(_) => "positions",
            DomainEvent::Exposure(_) => "exposures",
            DomainEvent::Risk(_) => "risk_assessments",
            DomainEvent::Pnl(_) => "pnl_calculations",
            DomainEvent::StrategyDecision(_) => "strategy_decisions",
            DomainEvent::OperationExecution(_) => "operation_executions",
            DomainEvent::AtomicGroup(_) => "atomic_groups",
            DomainEvent::TightLoop(_) => "tight_loop",
            DomainEvent::Reconciliation(_) => "reconciliation",
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            DomainEvent::Position(e) => e.timestamp,
            DomainEvent::Exposure(e) => e.timestamp,
            DomainEvent::Risk(e) => e.timestamp,
            DomainEvent::Pnl(e) => e.timestamp,
            DomainEvent::StrategyDecision(e) => e.timestamp,
            DomainEvent::OperationExecution(e) => e.timestamp,
            DomainEvent::AtomicGroup(e) => e.timestamp,
            DomainEvent::TightLoop(e) => e.timestamp,
            DomainEvent::Reconciliation(e) => e.timestamp,
        }
    }
}
