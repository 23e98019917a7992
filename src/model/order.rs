use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::instrument::InstrumentKey;

/// Operation vocabulary shared by strategies, the router, and venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    SpotTrade,
    PerpTrade,
    Supply,
    Borrow,
    Repay,
    Withdraw,
    Stake,
    Unstake,
    Swap,
    Transfer,
    FlashBorrow,
    FlashRepay,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::SpotTrade => "spot_trade",
            OperationType::PerpTrade => "perp_trade",
            OperationType::Supply => "supply",
            OperationType::Borrow => "borrow",
            OperationType::Repay => "repay",
            OperationType::Withdraw => "withdraw",
            OperationType::Stake => "stake",
            OperationType::Unstake => "unstake",
            OperationType::Swap => "swap",
            OperationType::Transfer => "transfer",
            OperationType::FlashBorrow => "flash_borrow",
            OperationType::FlashRepay => "flash_repay",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One predicted position movement, precomputed by the strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedDelta {
    pub instrument_key: InstrumentKey,
    pub delta_amount: f64,
    pub token: String,
    pub venue: String,
    pub operation_type: OperationType,
}

impl ExpectedDelta {
    pub fn new(key: InstrumentKey, delta_amount: f64, operation_type: OperationType) -> Self {
        Self {
            token: key.symbol().to_string(),
            venue: key.venue().to_string(),
            instrument_key: key,
            delta_amount,
            operation_type,
        }
    }
}

/// Strategy intent for one operation.
///
/// Venue conventions: the protocol side of an operation is `target_venue`
/// when the caller pays tokens in (supply, repay, stake, flash_repay, swap)
/// and `source_venue` when the protocol pays out (borrow, withdraw, unstake,
/// flash_borrow). CEX trades keep source == target. `execution_venue()`
/// resolves routing from that convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub source_venue: String,
    pub target_venue: String,
    pub source_token: String,
    pub target_token: String,
    pub amount: f64,
    pub expected_deltas: Vec<ExpectedDelta>,
    #[serde(default)]
    pub operation_details: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub atomic_group_id: Option<String>,
    #[serde(default)]
    pub sequence_in_group: Option<u32>,
}

impl Order {
    pub fn new(
        operation_type: OperationType,
        source_venue: &str,
        target_venue: &str,
        source_token: &str,
        target_token: &str,
        amount: f64,
    ) -> Self {
        Self {
            operation_id: Uuid::new_v4().simple().to_string(),
            operation_type,
            source_venue: source_venue.to_string(),
            target_venue: target_venue.to_string(),
            source_token: source_token.to_string(),
            target_token: target_token.to_string(),
            amount,
            expected_deltas: Vec::new(),
            operation_details: BTreeMap::new(),
            atomic_group_id: None,
            sequence_in_group: None,
        }
    }

    pub fn with_expected_deltas(mut self, deltas: Vec<ExpectedDelta>) -> Self {
        self.expected_deltas = deltas;
        self
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.operation_details.insert(key.to_string(), value);
        self
    }

    pub fn in_group(mut self, group_id: &str, sequence: u32) -> Self {
        self.atomic_group_id = Some(group_id.to_string());
        self.sequence_in_group = Some(sequence);
        self
    }

    /// Venue whose interface executes this order.
    pub fn execution_venue(&self) -> &str {
        match self.operation_type {
            OperationType::SpotTrade | OperationType::PerpTrade => &self.source_venue,
            OperationType::Supply
            | OperationType::Repay
            | OperationType::Stake
            | OperationType::FlashRepay
            | OperationType::Swap => &self.target_venue,
            OperationType::Borrow
            | OperationType::Withdraw
            | OperationType::Unstake
            | OperationType::FlashBorrow => &self.source_venue,
            OperationType::Transfer => &self.source_venue,
        }
    }

    /// Every instrument key this order predicts it will touch.
    pub fn expected_keys(&self) -> impl Iterator<Item = &InstrumentKey> {
        self.expected_deltas.iter().map(|d| &d.instrument_key)
    }
}

/// Terminal (or pending) state the venue reports for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    Confirmed,
    Pending,
    Failed,
    RolledBack,
}

/// Venue's report of what actually happened for one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHandshake {
    pub operation_id: String,
    pub status: HandshakeStatus,
    pub actual_deltas: BTreeMap<InstrumentKey, f64>,
    #[serde(default)]
    pub execution_details: BTreeMap<String, serde_json::Value>,
    pub fee_amount: f64,
    pub fee_currency: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    pub simulated: bool,
}

impl ExecutionHandshake {
    pub fn confirmed(
        operation_id: &str,
        actual_deltas: BTreeMap<InstrumentKey, f64>,
        simulated: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            operation_id: operation_id.to_string(),
            status: HandshakeStatus::Confirmed,
            actual_deltas,
            execution_details: BTreeMap::new(),
            fee_amount: 0.0,
            fee_currency: None,
            error_code: None,
            error_message: None,
            submitted_at: now,
            executed_at: now,
            simulated,
        }
    }

    pub fn failed(operation_id: &str, code: &str, message: &str, simulated: bool) -> Self {
        let now = Utc::now();
        Self {
            operation_id: operation_id.to_string(),
            status: HandshakeStatus::Failed,
            actual_deltas: BTreeMap::new(),
            execution_details: BTreeMap::new(),
            fee_amount: 0.0,
            fee_currency: None,
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
            submitted_at: now,
            executed_at: now,
            simulated,
        }
    }

    pub fn rolled_back(operation_id: &str, code: &str, message: &str, simulated: bool) -> Self {
        let mut hs = Self::failed(operation_id, code, message, simulated);
        hs.status = HandshakeStatus::RolledBack;
        hs
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.execution_details.insert(key.to_string(), value);
        self
    }

    pub fn with_fee(mut self, amount: f64, currency: &str) -> Self {
        self.fee_amount = amount;
        self.fee_currency = Some(currency.to_string());
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == HandshakeStatus::Confirmed
    }
}
