use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ExecutionManagerConfig, ExecutionMode};
use crate::data::MarketSnapshot;
use crate::error::EngineError;
use crate::events::{
    DomainEvent, ReconciliationEvent, ReconciliationMismatch, TightLoopExecutionEvent,
};
use crate::exposure::ExposureMonitor;
use crate::logging::{DomainEventLogger, StructuredLogger};
use crate::model::{ExecutionHandshake, InstrumentKey, Order};
use crate::pnl::PnlMonitor;
use crate::position::PositionMonitor;
use crate::risk::RiskMonitor;

/// The monitoring chain, owned by the engine and threaded through the
/// tight loop by mutable borrow.
///
/// PositionMonitor stays the only owner of the position map; the readers
/// receive an immutable clone taken at the start of each recompute.
pub struct MonitorStack {
    pub positions: PositionMonitor,
    pub exposure: ExposureMonitor,
    pub risk: RiskMonitor,
    pub pnl: PnlMonitor,
}

impl MonitorStack {
    /// One pass of the Exposure -> Risk -> P&L chain over a consistent
    /// position snapshot.
    pub fn recompute(
        &mut self,
        timestamp: u64,
        snapshot: &MarketSnapshot,
    ) -> Result<(), EngineError> {
        let positions = self.positions.simulated().clone();
        let exposure = self.exposure.compute(timestamp, &positions, snapshot)?;
        self.risk.assess(timestamp, &positions, &exposure, snapshot)?;
        self.pnl.compute(timestamp, &positions, snapshot)?;
        Ok(())
    }
}

/// Owns the post-order reconciliation and recomputation sequence.
///
/// The same code path runs in both modes; only `refresh_real` differs
/// (backtest copies the simulated view, so reconciliation always succeeds
/// on the first attempt).
pub struct PositionUpdateHandler {
    mode: ExecutionMode,
    max_retries: u32,
    retry_delay: Duration,
    timeout: Duration,
    tolerance: f64,
    logger: Arc<StructuredLogger>,
    events: Arc<DomainEventLogger>,
}

impl PositionUpdateHandler {
    pub fn new(
        config: &ExecutionManagerConfig,
        reconciliation_tolerance: f64,
        mode: ExecutionMode,
        logger: Arc<StructuredLogger>,
        events: Arc<DomainEventLogger>,
    ) -> Self {
        Self {
            mode,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            timeout: Duration::from_millis(config.tight_loop_timeout_ms),
            tolerance: reconciliation_tolerance,
            logger,
            events,
        }
    }

    /// Apply, refresh, reconcile, recompute. Called by the execution
    /// manager after every order, before the next order begins.
    pub async fn tight_loop(
        &self,
        timestamp: u64,
        order: &Order,
        handshake: &ExecutionHandshake,
        monitors: &mut MonitorStack,
        snapshot: &MarketSnapshot,
        execution_duration_ms: u64,
        retry_count: u32,
    ) -> Result<(), EngineError> {
        let reconciliation_start = Instant::now();

        if handshake.is_confirmed() {
            // Lenient on keys the venue touched beyond the prediction:
            // apply the delta, flag the divergence.
            let expected: HashSet<&InstrumentKey> = order.expected_keys().collect();
            for key in handshake.actual_deltas.keys() {
                if !expected.contains(key) {
                    let warn = EngineError::UnexpectedDeltaKey {
                        operation_id: order.operation_id.clone(),
                        key: key.to_string(),
                    };
                    self.logger.engine_error(&warn);
                }
            }
            monitors
                .positions
                .apply_deltas(timestamp, &handshake.actual_deltas, snapshot, "tight_loop")?;
        }

        if let Some(currency) = handshake.fee_currency.as_deref() {
            monitors
                .pnl
                .note_fee(handshake.fee_amount, currency, snapshot);
        }

        // ── Reconcile the touched keys against venue truth ──
        let touched: Vec<InstrumentKey> = handshake.actual_deltas.keys().cloned().collect();
        let mut attempt: u32 = 0;
        let reconciliation_success;
        let mut last_mismatches: Vec<ReconciliationMismatch> = Vec::new();

        loop {
            monitors
                .positions
                .refresh_real(timestamp, snapshot, "tight_loop")
                .await?;

            last_mismatches = monitors
                .positions
                .divergence(touched.iter())
                .into_iter()
                .filter(|(_, sim, real)| (sim - real).abs() > self.tolerance)
                .map(|(key, sim, real)| ReconciliationMismatch {
                    difference: sim - real,
                    instrument_key: key,
                    simulated: sim,
                    real,
                })
                .collect();

            if last_mismatches.is_empty() {
                reconciliation_success = true;
                break;
            }
            if attempt >= self.max_retries || reconciliation_start.elapsed() >= self.timeout {
                reconciliation_success = false;
                break;
            }
            attempt += 1;
            if self.mode.is_live() {
                // Venue propagation delay.
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        self.events.emit(DomainEvent::Reconciliation(ReconciliationEvent {
            timestamp,
            operation_id: order.operation_id.clone(),
            simulated_positions: monitors
                .positions
                .simulated()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            real_positions: monitors
                .positions
                .real()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            mismatches: last_mismatches.clone(),
            retry_attempt: attempt,
            max_retries: self.max_retries,
            success: reconciliation_success,
        }));

        // ── Recompute dependents over the reconciled book ──
        monitors.recompute(timestamp, snapshot)?;

        self.events.emit(DomainEvent::TightLoop(TightLoopExecutionEvent {
            timestamp,
            operation_id: order.operation_id.clone(),
            retry_count,
            execution_duration_ms,
            reconciliation_duration_ms: reconciliation_start.elapsed().as_millis() as u64,
            reconciliation_success,
        }));

        if !reconciliation_success {
            let err = EngineError::ReconciliationTimeout {
                attempts: attempt + 1,
            };
            self.logger.engine_error(&err);
            return Err(err);
        }
        Ok(())
    }
}
