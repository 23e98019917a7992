use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Severity attached to every engine error code.
///
/// HIGH aborts the current tick, CRITICAL terminates the run; MEDIUM is
/// recorded as a breach/warning and execution continues; LOW is log-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Venue-level failure, classified for retry decisions.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("invalid venue state: {0}")]
    InvalidState(String),

    #[error("venue call timed out after {0}ms")]
    Timeout(u64),

    #[error("credential error: {0}")]
    Credential(String),
}

impl VenueError {
    /// Transient network and rate-limit failures are worth retrying;
    /// everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VenueError::Network(_) | VenueError::RateLimited(_) | VenueError::Timeout(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            VenueError::Network(_) => "VEN-001",
            VenueError::RateLimited(_) => "VEN-002",
            VenueError::InvalidOrder(_) => "VEN-003",
            VenueError::InvalidState(_) => "VEN-004",
            VenueError::Timeout(_) => "VEN-005",
            VenueError::Credential(_) => "VEN-006",
        }
    }
}

/// Central error type for the engine and its components.
///
/// Every variant maps to a stable code (`code()`) and a severity
/// (`severity()`); both appear on structured log records so a run's error
/// history is greppable by prefix.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── ENGINE ──
    #[error("run aborted on critical error: {reason}")]
    CriticalAbort { reason: String },

    #[error("run cancelled externally")]
    Cancelled,

    #[error("tick {timestamp} aborted: {reason}")]
    TickAborted { timestamp: u64, reason: String },

    // ── CONF ──
    #[error("missing required config field `{field}`")]
    MissingConfig { field: String },

    #[error("unknown strategy mode `{mode}`")]
    UnknownMode { mode: String },

    #[error("strategy `{mode}` requires instrument `{key}` which is not subscribed")]
    MissingInstrument { mode: String, key: String },

    #[error("invalid instrument subscription `{key}`: {reason}")]
    InvalidSubscription { key: String, reason: String },

    #[error("venue `{venue}` is not enabled or not configured")]
    VenueNotConfigured { venue: String },

    // ── DATA ──
    #[error("snapshot at {timestamp} is missing required field `{field}`")]
    MissingSnapshotField { timestamp: u64, field: String },

    #[error("data provider produced an empty timestamp series")]
    EmptyTimestampSeries,

    #[error("snapshot read failed at {timestamp}: {reason}")]
    SnapshotFailed { timestamp: u64, reason: String },

    // ── STRAT ──
    #[error("invalid order: {reason}")]
    InvalidOrder { reason: String },

    #[error("order references unsubscribed instrument `{key}`")]
    UnsubscribedInstrument { key: String },

    #[error("expected-delta derivation failed for {operation}: {reason}")]
    DeltaDerivation { operation: String, reason: String },

    // ── EXEC ──
    #[error("no venue interface registered for `{venue}` ({operation})")]
    RoutingFailed { venue: String, operation: String },

    #[error("order {operation_id} failed at venue: {reason}")]
    OrderFailed { operation_id: String, reason: String },

    #[error("order {operation_id} exhausted {attempts} attempts")]
    RetriesExhausted { operation_id: String, attempts: u32 },

    #[error("atomic group {group_id} rolled back")]
    AtomicGroupRolledBack { group_id: String },

    #[error("reconciliation failed after {attempts} refresh attempts")]
    ReconciliationTimeout { attempts: u32 },

    #[error("order {operation_id} reported delta on unexpected key `{key}`")]
    UnexpectedDeltaKey { operation_id: String, key: String },

    #[error("atomic group {group_id} spans venues that cannot bundle")]
    UnbundleableGroup { group_id: String },

    // ── VEN ──
    #[error(transparent)]
    Venue(#[from] VenueError),

    // ── POS ──
    #[error("venue `{venue}` reported unsubscribed instrument `{key}`")]
    UnknownInstrument { venue: String, key: String },

    #[error("delta targets unsubscribed key `{key}`")]
    UnsubscribedDelta { key: String },

    // ── EXP ──
    #[error("no conversion method configured for asset `{asset}`")]
    MissingConversion { asset: String },

    #[error("missing {method} rate for asset `{asset}` in snapshot")]
    MissingRate { asset: String, method: String },

    // ── RISK ──
    #[error("risk evaluator {risk_type} missing input: {detail}")]
    MissingRiskInput { risk_type: String, detail: String },

    // ── PNL ──
    #[error("pnl attribution {attribution} missing input: {detail}")]
    MissingAttributionInput { attribution: String, detail: String },

    // ── LOG ──
    #[error("failed to create log directory {path}")]
    LogDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write log file {path}")]
    LogWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::CriticalAbort { .. } => "ENGINE-001",
            EngineError::Cancelled => "ENGINE-002",
            EngineError::TickAborted { .. } => "ENGINE-003",
            EngineError::MissingConfig { .. } => "CONF-001",
            EngineError::UnknownMode { .. } => "CONF-002",
            EngineError::MissingInstrument { .. } => "CONF-003",
            EngineError::InvalidSubscription { .. } => "CONF-004",
            EngineError::VenueNotConfigured { .. } => "CONF-005",
            EngineError::MissingSnapshotField { .. } => "DATA-001",
            EngineError::EmptyTimestampSeries => "DATA-002",
            EngineError::SnapshotFailed { .. } => "DATA-003",
            EngineError::InvalidOrder { .. } => "STRAT-001",
            EngineError::UnsubscribedInstrument { .. } => "STRAT-002",
            EngineError::DeltaDerivation { .. } => "STRAT-003",
            EngineError::RoutingFailed { .. } => "EXEC-001",
            EngineError::OrderFailed { .. } => "EXEC-002",
            EngineError::RetriesExhausted { .. } => "EXEC-003",
            EngineError::AtomicGroupRolledBack { .. } => "EXEC-004",
            EngineError::ReconciliationTimeout { .. } => "EXEC-005",
            EngineError::UnexpectedDeltaKey { .. } => "EXEC-006",
            EngineError::UnbundleableGroup { .. } => "EXEC-007",
            EngineError::Venue(v) => v.code(),
            EngineError::UnknownInstrument { .. } => "POS-001",
            EngineError::UnsubscribedDelta { .. } => "POS-002",
            EngineError::MissingConversion { .. } => "EXP-001",
            EngineError::MissingRate { .. } => "EXP-002",
            EngineError::MissingRiskInput { .. } => "RISK-003",
            EngineError::MissingAttributionInput { .. } => "PNL-001",
            EngineError::LogDirectory { .. } => "LOG-001",
            EngineError::LogWrite { .. } => "LOG-002",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            EngineError::CriticalAbort { .. } => Severity::Critical,
            EngineError::Cancelled => Severity::Medium,
            EngineError::TickAborted { .. } => Severity::High,
            EngineError::MissingConfig { .. }
            | EngineError::UnknownMode { .. }
            | EngineError::MissingInstrument { .. }
            | EngineError::InvalidSubscription { .. }
            | EngineError::VenueNotConfigured { .. } => Severity::Critical,
            EngineError::MissingSnapshotField { .. } | EngineError::SnapshotFailed { .. } => {
                Severity::High
            }
            EngineError::EmptyTimestampSeries => Severity::Critical,
            EngineError::InvalidOrder { .. }
            | EngineError::UnsubscribedInstrument { .. }
            | EngineError::DeltaDerivation { .. } => Severity::High,
            EngineError::RoutingFailed { .. } => Severity::High,
            EngineError::OrderFailed { .. } => Severity::Medium,
            EngineError::RetriesExhausted { .. } => Severity::Medium,
            EngineError::AtomicGroupRolledBack { .. } => Severity::Medium,
            EngineError::ReconciliationTimeout { .. } => Severity::Critical,
            EngineError::UnexpectedDeltaKey { .. } => Severity::Medium,
            EngineError::UnbundleableGroup { .. } => Severity::High,
            EngineError::Venue(v) => {
                if v.is_retryable() {
                    Severity::Medium
                } else {
                    Severity::High
                }
            }
            EngineError::UnknownInstrument { .. } | EngineError::UnsubscribedDelta { .. } => {
                Severity::High
            }
            EngineError::MissingConversion { .. } | EngineError::MissingRate { .. } => {
                Severity::High
            }
            EngineError::MissingRiskInput { .. } => Severity::Medium,
            EngineError::MissingAttributionInput { .. } => Severity::Medium,
            EngineError::LogDirectory { .. } | EngineError::LogWrite { .. } => Severity::Low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_error_retryability() {
        assert!(VenueError::Network("reset".into()).is_retryable());
        assert!(VenueError::RateLimited("429".into()).is_retryable());
        assert!(VenueError::Timeout(5000).is_retryable());
        assert!(!VenueError::InvalidOrder("bad size".into()).is_retryable());
        assert!(!VenueError::InvalidState("no collateral".into()).is_retryable());
    }

    #[test]
    fn codes_are_prefixed_by_subsystem() {
        assert_eq!(
            EngineError::ReconciliationTimeout { attempts: 3 }.code(),
            "EXEC-005"
        );
        assert_eq!(
            EngineError::UnsubscribedInstrument { key: "x".into() }.code(),
            "STRAT-002"
        );
        assert_eq!(
            EngineError::Venue(VenueError::RateLimited("429".into())).code(),
            "VEN-002"
        );
    }
}
