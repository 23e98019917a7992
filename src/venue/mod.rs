pub mod factory;
pub mod live;
pub mod sim;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::data::MarketSnapshot;
use crate::error::{EngineError, VenueError};
use crate::model::{ExecutionHandshake, InstrumentKey, Order};

// ── Capability surface ──────────────────────────────────────────────

/// Execution side of a venue.
///
/// Simulators are trivially async; live implementations do real I/O. The
/// snapshot argument is what backtest venues price against — live venues
/// ignore it.
#[async_trait]
pub trait ExecutionInterface: Send + Sync {
    fn venue(&self) -> &str;

    async fn execute(
        &mut self,
        order: &Order,
        snapshot: &MarketSnapshot,
    ) -> Result<ExecutionHandshake, VenueError>;

    /// Execute an atomic group: all orders take effect together or none
    /// does. Venues without bundle support reject the group.
    async fn execute_group(
        &mut self,
        orders: &[Order],
        snapshot: &MarketSnapshot,
    ) -> Result<Vec<ExecutionHandshake>, VenueError> {
        let _ = (orders, snapshot);
        Err(VenueError::InvalidOrder(
            "venue does not support atomic groups".to_string(),
        ))
    }
}

/// Position-read side of a venue, used by live-mode reconciliation.
#[async_trait]
pub trait PositionReadInterface: Send + Sync {
    fn venue(&self) -> &str;

    async fn positions(&self, timestamp: u64) -> Result<HashMap<InstrumentKey, f64>, VenueError>;
}

// ── Router ──────────────────────────────────────────────────────────

/// Dispatches an order to the correct execution interface by operation
/// type and venue identifier (via [`Order::execution_venue`]).
///
/// One interface instance may serve several venue names: the on-chain
/// interface covers the whole protocol cluster (wallet, lending, staking,
/// DEX) since that is the unit within which bundles are atomic.
pub struct VenueInterfaceRouter {
    interfaces: Vec<Box<dyn ExecutionInterface>>,
    by_venue: HashMap<String, usize>,
}

impl VenueInterfaceRouter {
    pub fn new() -> Self {
        Self {
            interfaces: Vec::new(),
            by_venue: HashMap::new(),
        }
    }

    /// Register an interface as the executor for the given venue names.
    pub fn register(&mut self, venues: &[String], interface: Box<dyn ExecutionInterface>) {
        let idx = self.interfaces.len();
        self.interfaces.push(interface);
        for venue in venues {
            self.by_venue.insert(venue.clone(), idx);
        }
    }

    pub fn route_mut(&mut self, order: &Order) -> Result<&mut dyn ExecutionInterface, EngineError> {
        let venue = order.execution_venue();
        let idx =
            *self
                .by_venue
                .get(venue)
                .ok_or_else(|| EngineError::RoutingFailed {
                    venue: venue.to_string(),
                    operation: order.operation_type.to_string(),
                })?;
        Ok(self.interfaces[idx].as_mut())
    }

    /// Resolve a whole atomic group to a single interface. A group whose
    /// orders resolve to different interfaces cannot be executed atomically.
    pub fn route_group_mut(
        &mut self,
        group_id: &str,
        orders: &[Order],
    ) -> Result<&mut dyn ExecutionInterface, EngineError> {
        let mut resolved: Option<usize> = None;
        for order in orders {
            let venue = order.execution_venue();
            let idx =
                *self
                    .by_venue
                    .get(venue)
                    .ok_or_else(|| EngineError::RoutingFailed {
                        venue: venue.to_string(),
                        operation: order.operation_type.to_string(),
                    })?;
            match resolved {
                None => resolved = Some(idx),
                Some(prev) if prev != idx => {
                    return Err(EngineError::UnbundleableGroup {
                        group_id: group_id.to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        let idx = resolved.ok_or_else(|| EngineError::UnbundleableGroup {
            group_id: group_id.to_string(),
        })?;
        Ok(self.interfaces[idx].as_mut())
    }
}

impl Default for VenueInterfaceRouter {
    fn default() -> Self {
        Self::new()
    }
}
