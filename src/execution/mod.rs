use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ExecutionManagerConfig;
use crate::data::MarketSnapshot;
use crate::error::EngineError;
use crate::events::{AtomicOperationGroupEvent, DomainEvent, OperationExecutionEvent};
use crate::logging::{DomainEventLogger, StructuredLogger};
use crate::model::{ExecutionHandshake, HandshakeStatus, Order};
use crate::position::update::{MonitorStack, PositionUpdateHandler};
use crate::venue::VenueInterfaceRouter;

/// External cancel signal, checked at tick boundaries and between orders.
/// In-flight venue calls are allowed to complete.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum BatchUnit {
    Single(Order),
    Group(String, Vec<Order>),
}

/// Consumes the strategy's order batch and produces handshakes in the same
/// order, driving the tight loop after every order.
pub struct ExecutionManager {
    router: VenueInterfaceRouter,
    handler: PositionUpdateHandler,
    config: ExecutionManagerConfig,
    logger: Arc<StructuredLogger>,
    events: Arc<DomainEventLogger>,
}

impl ExecutionManager {
    pub fn new(
        router: VenueInterfaceRouter,
        handler: PositionUpdateHandler,
        config: ExecutionManagerConfig,
        logger: Arc<StructuredLogger>,
        events: Arc<DomainEventLogger>,
    ) -> Self {
        Self {
            router,
            handler,
            config,
            logger,
            events,
        }
    }

    /// Batch entry point. Orders execute in list order; atomic groups are
    /// submitted to their venue as one unit. A failed order does not abort
    /// the batch; HIGH/CRITICAL tight-loop errors propagate to the engine.
    pub async fn process(
        &mut self,
        timestamp: u64,
        orders: Vec<Order>,
        monitors: &mut MonitorStack,
        snapshot: &MarketSnapshot,
        cancel: &CancelToken,
    ) -> Result<Vec<ExecutionHandshake>, EngineError> {
        let mut handshakes = Vec::with_capacity(orders.len());

        for unit in partition(orders) {
            if cancel.is_cancelled() {
                self.logger
                    .warn("cancel observed mid-batch; remaining orders skipped", Some("ENGINE-002"));
                break;
            }
            match unit {
                BatchUnit::Single(order) => {
                    let handshake = self
                        .execute_single(timestamp, &order, monitors, snapshot)
                        .await?;
                    handshakes.push(handshake);
                }
                BatchUnit::Group(group_id, group) => {
                    let group_handshakes = self
                        .execute_group(timestamp, &group_id, &group, monitors, snapshot)
                        .await?;
                    handshakes.extend(group_handshakes);
                }
            }
        }

        Ok(handshakes)
    }

    fn is_supported(&self, order: &Order) -> bool {
        self.config.supported_actions.is_empty()
            || self
                .config
                .supported_actions
                .iter()
                .any(|a| a == order.operation_type.as_str())
    }

    /// Venue call with classified retries and exponential back-off. The
    /// final attempt's outcome is what surfaces.
    async fn call_venue(
        &mut self,
        order: &Order,
        snapshot: &MarketSnapshot,
    ) -> (ExecutionHandshake, u32) {
        let mut attempt: u32 = 0;
        loop {
            let result = match self.router.route_mut(order) {
                Ok(interface) => interface.execute(order, snapshot).await,
                Err(e) => {
                    self.logger.engine_error(&e);
                    return (
                        ExecutionHandshake::failed(
                            &order.operation_id,
                            e.code(),
                            &e.to_string(),
                            false,
                        ),
                        attempt,
                    );
                }
            };
            match result {
                Ok(handshake) => return (handshake, attempt),
                Err(venue_error) => {
                    if venue_error.is_retryable() && attempt < self.config.max_retries {
                        let delay = self.config.retry_delay_ms.saturating_mul(1 << attempt);
                        self.logger.warn(
                            &format!(
                                "retryable venue error on {} (attempt {attempt}): {venue_error}",
                                order.operation_id
                            ),
                            Some(venue_error.code()),
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    let err = EngineError::Venue(venue_error);
                    self.logger.engine_error(&err);
                    let (code, message) = match err {
                        EngineError::Venue(v) => (v.code(), v.to_string()),
                        _ => unreachable!(),
                    };
                    return (
                        ExecutionHandshake::failed(&order.operation_id, code, &message, false),
                        attempt,
                    );
                }
            }
        }
    }

    fn emit_operation_event(
        &self,
        timestamp: u64,
        order: &Order,
        handshake: &ExecutionHandshake,
        duration_ms: u64,
    ) {
        self.events
            .emit(DomainEvent::OperationExecution(OperationExecutionEvent {
                timestamp,
                operation_id: order.operation_id.clone(),
                operation_type: order.operation_type,
                venue: order.execution_venue().to_string(),
                status: handshake.status,
                expected_deltas: order.expected_deltas.clone(),
                actual_deltas: handshake.actual_deltas.clone(),
                execution_duration_ms: duration_ms,
                error_code: handshake.error_code.clone(),
            }));
    }

    async fn execute_single(
        &mut self,
        timestamp: u64,
        order: &Order,
        monitors: &mut MonitorStack,
        snapshot: &MarketSnapshot,
    ) -> Result<ExecutionHandshake, EngineError> {
        if !self.is_supported(order) {
            let err = EngineError::OrderFailed {
                operation_id: order.operation_id.clone(),
                reason: format!(
                    "operation {} outside supported_actions",
                    order.operation_type
                ),
            };
            self.logger.engine_error(&err);
            let handshake = ExecutionHandshake::failed(
                &order.operation_id,
                err.code(),
                &err.to_string(),
                false,
            );
            self.emit_operation_event(timestamp, order, &handshake, 0);
            return Ok(handshake);
        }

        let started = Instant::now();
        let (handshake, retry_count) = self.call_venue(order, snapshot).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.emit_operation_event(timestamp, order, &handshake, duration_ms);

        self.handler
            .tight_loop(
                timestamp,
                order,
                &handshake,
                monitors,
                snapshot,
                duration_ms,
                retry_count,
            )
            .await?;

        if handshake.status == HandshakeStatus::Failed {
            self.logger.warn(
                &format!(
                    "order {} failed: {}",
                    order.operation_id,
                    handshake.error_message.as_deref().unwrap_or("unknown")
                ),
                Some("EXEC-002"),
            );
        }
        Ok(handshake)
    }

    async fn execute_group(
        &mut self,
        timestamp: u64,
        group_id: &str,
        orders: &[Order],
        monitors: &mut MonitorStack,
        snapshot: &MarketSnapshot,
    ) -> Result<Vec<ExecutionHandshake>, EngineError> {
        let started = Instant::now();

        let mut attempt: u32 = 0;
        let handshakes = loop {
            let result = match self.router.route_group_mut(group_id, orders) {
                Ok(interface) => interface.execute_group(orders, snapshot).await,
                Err(e) => {
                    self.logger.engine_error(&e);
                    break orders
                        .iter()
                        .map(|o| {
                            ExecutionHandshake::failed(
                                &o.operation_id,
                                e.code(),
                                &e.to_string(),
                                false,
                            )
                        })
                        .collect::<Vec<_>>();
                }
            };
            match result {
                Ok(handshakes) => break handshakes,
                Err(venue_error) if venue_error.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay_ms.saturating_mul(1 << attempt);
                    self.logger.warn(
                        &format!("retryable venue error on group {group_id}: {venue_error}"),
                        Some(venue_error.code()),
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(venue_error) => {
                    let message = venue_error.to_string();
                    let code = venue_error.code();
                    self.logger.engine_error(&EngineError::Venue(venue_error));
                    break orders
                        .iter()
                        .map(|o| ExecutionHandshake::failed(&o.operation_id, code, &message, false))
                        .collect();
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let rollback_occurred = handshakes
            .iter()
            .any(|h| h.status == HandshakeStatus::RolledBack);
        let all_succeeded = handshakes.iter().all(ExecutionHandshake::is_confirmed);

        if rollback_occurred {
            self.logger.engine_error(&EngineError::AtomicGroupRolledBack {
                group_id: group_id.to_string(),
            });
        }

        for (order, handshake) in orders.iter().zip(&handshakes) {
            self.emit_operation_event(timestamp, order, handshake, duration_ms);
            self.handler
                .tight_loop(timestamp, order, handshake, monitors, snapshot, duration_ms, attempt)
                .await?;
        }

        self.events
            .emit(DomainEvent::AtomicGroup(AtomicOperationGroupEvent {
                timestamp,
                group_id: group_id.to_string(),
                operation_ids: orders.iter().map(|o| o.operation_id.clone()).collect(),
                all_succeeded,
                rollback_occurred,
                total_duration_ms: duration_ms,
            }));

        Ok(handshakes)
    }
}

/// Split a batch into singles and consecutive same-id atomic groups,
/// preserving list order.
fn partition(orders: Vec<Order>) -> Vec<BatchUnit> {
    let mut units: Vec<BatchUnit> = Vec::new();
    for order in orders {
        match order.atomic_group_id.clone() {
            Some(group_id) => {
                if let Some(BatchUnit::Group(last_id, group)) = units.last_mut() {
                    if *last_id == group_id {
                        group.push(order);
                        continue;
                    }
                }
                units.push(BatchUnit::Group(group_id, vec![order]));
            }
            None => units.push(BatchUnit::Single(order)),
        }
    }
    units
}
