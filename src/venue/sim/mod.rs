pub mod cex;
pub mod chain;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::model::{InstrumentKey, PositionType};

pub use cex::CexSimulator;
pub use chain::ChainSimulator;

/// Venue-truth position ledger shared by the backtest simulators.
///
/// One ledger spans all simulated venues so cross-venue operations
/// (transfers) leave both sides consistent. Debt and perp keys may go
/// negative / carry sign; every other key is a balance and must not
/// overdraw.
#[derive(Debug, Default)]
pub struct SimLedger {
    positions: HashMap<InstrumentKey, f64>,
}

pub type SharedLedger = Arc<Mutex<SimLedger>>;

impl SimLedger {
    pub fn shared() -> SharedLedger {
        Arc::new(Mutex::new(SimLedger::default()))
    }

    pub fn seed(&mut self, key: InstrumentKey, amount: f64) {
        self.positions.insert(key, amount);
    }

    pub fn get(&self, key: &InstrumentKey) -> f64 {
        self.positions.get(key).copied().unwrap_or(0.0)
    }

    pub fn positions(&self) -> &HashMap<InstrumentKey, f64> {
        &self.positions
    }

    pub fn snapshot_map(&self) -> HashMap<InstrumentKey, f64> {
        self.positions.clone()
    }

    pub fn apply(&mut self, key: &InstrumentKey, delta: f64) {
        *self.positions.entry(key.clone()).or_insert(0.0) += delta;
    }

    /// Keys that represent balances (not signed positions or debt
    /// magnitudes) and therefore must stay non-negative.
    pub fn is_balance_key(key: &InstrumentKey) -> bool {
        !matches!(
            key.position_type(),
            PositionType::Perp | PositionType::DebtToken
        )
    }

    /// First overdrawn balance key, if any.
    pub fn overdrawn(&self, tolerance: f64) -> Option<(InstrumentKey, f64)> {
        self.positions
            .iter()
            .find(|(key, amount)| Self::is_balance_key(key) && **amount < -tolerance)
            .map(|(key, amount)| (key.clone(), *amount))
    }

    pub fn clone_inner(&self) -> HashMap<InstrumentKey, f64> {
        self.positions.clone()
    }

    pub fn replace(&mut self, positions: HashMap<InstrumentKey, f64>) {
        self.positions = positions;
    }
}
