pub mod clock;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{EngineConfig, ExecutionMode};
use crate::data::DataProvider;
use crate::error::{EngineError, Severity};
use crate::execution::{CancelToken, ExecutionManager};
use crate::exposure::ExposureMonitor;
use crate::logging::{
    DomainEventLogger, LogDirectoryManager, RunContext, RunDirectory, StructuredLogger,
};
use crate::pnl::PnlMonitor;
use crate::position::update::{MonitorStack, PositionUpdateHandler};
use crate::position::PositionMonitor;
use crate::risk::RiskMonitor;
use crate::strategy::StrategyManager;
use crate::util::UtilityManager;
use crate::venue::factory::VenueFactory;

use clock::SeriesClock;

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initialized,
    Running,
    Stopping,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Final outcome handed to results consumers.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub correlation_id: String,
    pub status: RunStatus,
    pub ticks: u64,
    pub initial_capital: f64,
    pub final_total_value: f64,
    pub total_pnl: f64,
    pub attribution: BTreeMap<String, f64>,
    pub error: Option<String>,
}

/// Owns the clock, the correlation scope, and the singleton component
/// graph. One tick per source timestamp in backtest, one per wall-clock
/// interval in live mode.
pub struct Engine {
    config: EngineConfig,
    ctx: Arc<RunContext>,
    run_dir: RunDirectory,
    data: Arc<dyn DataProvider>,
    util: UtilityManager,
    monitors: MonitorStack,
    strategy: StrategyManager,
    execution: ExecutionManager,
    events: Arc<DomainEventLogger>,
    logger: Arc<StructuredLogger>,
    component_loggers: Vec<Arc<StructuredLogger>>,
    cancel: CancelToken,
    state: EngineState,
    ticks: u64,
    consecutive_data_errors: u32,
}

impl Engine {
    pub fn new(config: EngineConfig, data: Arc<dyn DataProvider>) -> Result<Self, EngineError> {
        Self::with_logs_root(config, data, Path::new("logs"))
    }

    /// Construct the full component graph. Every component is built
    /// exactly once; all cross-references are injected here.
    pub fn with_logs_root(
        mut config: EngineConfig,
        data: Arc<dyn DataProvider>,
        logs_root: &Path,
    ) -> Result<Self, EngineError> {
        config.execution_mode = ExecutionMode::resolve(config.execution_mode);

        let ctx = Arc::new(RunContext::new(&config.mode, config.initial_capital));
        let run_dir = LogDirectoryManager::create(logs_root, &ctx)?;
        let events = Arc::new(DomainEventLogger::new(&run_dir.events_dir, Arc::clone(&ctx)));

        let mut component_loggers: Vec<Arc<StructuredLogger>> = Vec::new();
        let mut open_logger = |component: &str| -> Result<Arc<StructuredLogger>, EngineError> {
            let logger = Arc::new(StructuredLogger::open(
                &run_dir.run_dir,
                component,
                Arc::clone(&ctx),
            )?);
            component_loggers.push(Arc::clone(&logger));
            Ok(logger)
        };

        let logger = open_logger("engine")?;
        let util = UtilityManager::from_config(&config);

        let strategy = StrategyManager::new(
            &config,
            open_logger("strategy_manager")?,
            Arc::clone(&events),
        )?;
        let funding = strategy.funding_instrument();

        let stack = VenueFactory::build(
            &config,
            &util,
            Some((funding.clone(), config.initial_capital)),
            config.backtest_seed,
        )?;

        let positions = PositionMonitor::new(
            &config.component_config.position_monitor,
            config.execution_mode,
            stack.readers,
            util.clone(),
            open_logger("position_monitor")?,
            Arc::clone(&events),
            Some((funding, config.initial_capital)),
        )?;
        let exposure = ExposureMonitor::new(
            &config.component_config.exposure_monitor,
            util.clone(),
            open_logger("exposure_monitor")?,
            Arc::clone(&events),
        );
        let risk = RiskMonitor::new(
            &config.component_config.risk_monitor,
            config.venues.iter().map(|(n, v)| (n.clone(), v.kind)).collect(),
            util.clone(),
            open_logger("risk_monitor")?,
            Arc::clone(&events),
        )?;
        let pnl = PnlMonitor::new(
            &config.component_config.pnl_monitor,
            config.initial_capital,
            util.clone(),
            open_logger("pnl_monitor")?,
            Arc::clone(&events),
        );

        let handler = PositionUpdateHandler::new(
            &config.component_config.execution_manager,
            config.component_config.pnl_monitor.reconciliation_tolerance,
            config.execution_mode,
            open_logger("position_update_handler")?,
            Arc::clone(&events),
        );
        let execution = ExecutionManager::new(
            stack.router,
            handler,
            config.component_config.execution_manager.clone(),
            open_logger("execution_manager")?,
            Arc::clone(&events),
        );

        logger.info_with(
            "engine constructed",
            serde_json::json!({
                "mode": config.mode,
                "execution_mode": config.execution_mode,
                "capital": config.initial_capital,
            }),
        );

        Ok(Self {
            config,
            ctx,
            run_dir,
            data,
            util,
            monitors: MonitorStack {
                positions,
                exposure,
                risk,
                pnl,
            },
            strategy,
            execution,
            events,
            logger,
            component_loggers,
            cancel: CancelToken::new(),
            state: EngineState::Initialized,
            ticks: 0,
            consecutive_data_errors: 0,
        })
    }

    pub fn correlation_id(&self) -> &str {
        &self.ctx.correlation_id
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn run_directory(&self) -> &RunDirectory {
        &self.run_dir
    }

    /// Handle for external cancellation; checked at tick boundaries and
    /// between orders.
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn monitors(&self) -> &MonitorStack {
        &self.monitors
    }

    pub fn monitors_mut(&mut self) -> &mut MonitorStack {
        &mut self.monitors
    }

    /// Drive the run to completion and return the final result. Critical
    /// errors terminate the run with a failed status; the result is always
    /// produced and the run directory finalized.
    pub async fn run(&mut self) -> RunResult {
        self.state = EngineState::Running;
        let outcome = match self.config.execution_mode {
            ExecutionMode::Backtest => self.run_backtest().await,
            ExecutionMode::Live => self.run_live().await,
        };

        let (status, error) = match outcome {
            Ok(false) => (RunStatus::Completed, None),
            Ok(true) => (RunStatus::Cancelled, None),
            Err(e) => {
                self.logger.engine_error(&e);
                (RunStatus::Failed, Some(format!("{}: {e}", e.code())))
            }
        };
        self.finish(status, error)
    }

    async fn run_backtest(&mut self) -> Result<bool, EngineError> {
        let mut clock = SeriesClock::new(self.data.timestamps());
        if clock.is_empty() {
            return Err(EngineError::EmptyTimestampSeries);
        }
        self.logger.info_with(
            "backtest series loaded",
            serde_json::json!({
                "ticks": clock.total_ticks(),
                "first": clock.first_timestamp(),
                "last": clock.last_timestamp(),
            }),
        );

        loop {
            if self.cancel.is_cancelled() {
                self.state = EngineState::Stopping;
                return Ok(true);
            }
            let t = clock.current_timestamp();
            self.run_tick(t).await?;
            if !clock.advance() {
                break;
            }
        }
        Ok(false)
    }

    async fn run_live(&mut self) -> Result<bool, EngineError> {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
        loop {
            if self.cancel.is_cancelled() {
                self.state = EngineState::Stopping;
                return Ok(true);
            }
            interval.tick().await;
            let t = chrono::Utc::now().timestamp().max(0) as u64;
            self.run_tick(t).await?;
        }
    }

    /// One tick with severity-based error handling: HIGH aborts the tick,
    /// recurring data errors and any CRITICAL terminate the run.
    async fn run_tick(&mut self, t: u64) -> Result<(), EngineError> {
        let result = self.tick(t).await;

        // Flush per tick, error or not.
        self.flush();

        match result {
            Ok(()) => {
                self.consecutive_data_errors = 0;
                self.ticks += 1;
                Ok(())
            }
            Err(e) => {
                if e.code().starts_with("DATA-") {
                    self.consecutive_data_errors += 1;
                    if self.consecutive_data_errors >= 2 {
                        return Err(EngineError::CriticalAbort {
                            reason: format!("recurring data error: {e}"),
                        });
                    }
                } else {
                    self.consecutive_data_errors = 0;
                }
                match e.severity() {
                    Severity::Critical => Err(e),
                    Severity::High => {
                        self.logger.engine_error(&EngineError::TickAborted {
                            timestamp: t,
                            reason: e.to_string(),
                        });
                        Ok(())
                    }
                    Severity::Medium | Severity::Low => {
                        self.logger.engine_error(&e);
                        Ok(())
                    }
                }
            }
        }
    }

    /// The per-timestep pipeline: snapshot, monitoring chain, strategy,
    /// execution, final recompute.
    async fn tick(&mut self, t: u64) -> Result<(), EngineError> {
        self.ctx.set_engine_now(t);

        let snapshot =
            self.data
                .snapshot(t)
                .await
                .map_err(|e| match e {
                    e @ EngineError::MissingSnapshotField { .. } => e,
                    other => EngineError::SnapshotFailed {
                        timestamp: t,
                        reason: other.to_string(),
                    },
                })?;

        // Pre-trade refresh doubles as the out-of-band drift catch in live
        // mode.
        self.monitors
            .positions
            .refresh_real(t, &snapshot, "tick")
            .await?;

        let positions = self.monitors.positions.simulated().clone();
        self.monitors.pnl.ensure_baseline(&positions, &snapshot)?;
        let exposure = self.monitors.exposure.compute(t, &positions, &snapshot)?;
        let risk = self
            .monitors
            .risk
            .assess(t, &positions, &exposure, &snapshot)?;

        let orders =
            self.strategy
                .decide(t, &positions, &exposure, &risk, &snapshot, &self.util)?;

        if !orders.is_empty() {
            let handshakes = self
                .execution
                .process(t, orders, &mut self.monitors, &snapshot, &self.cancel)
                .await?;
            let failed = handshakes.iter().filter(|h| !h.is_confirmed()).count();
            if failed > 0 {
                self.logger.warn(
                    &format!("{failed} of {} orders did not confirm", handshakes.len()),
                    Some("EXEC-002"),
                );
            }
        }

        self.monitors.recompute(t, &snapshot)?;
        Ok(())
    }

    fn flush(&self) {
        self.events.flush_all();
        for logger in &self.component_loggers {
            logger.flush();
        }
    }

    fn finish(&mut self, status: RunStatus, error: Option<String>) -> RunResult {
        let baseline = self
            .monitors
            .pnl
            .book_baseline()
            .unwrap_or(self.config.initial_capital);
        let (final_total_value, total_pnl, attribution) = match self.monitors.pnl.get_latest() {
            Some(latest) => (
                baseline + latest.unrealized,
                latest.total,
                latest.attribution.clone(),
            ),
            None => (baseline, 0.0, BTreeMap::new()),
        };

        let result = RunResult {
            correlation_id: self.ctx.correlation_id.clone(),
            status,
            ticks: self.ticks,
            initial_capital: self.config.initial_capital,
            final_total_value,
            total_pnl,
            attribution,
            error: error.clone(),
        };
        self.shutdown(&result);
        result
    }

    /// Flush buffers, close out the run directory, transition to
    /// Terminated. Idempotent.
    pub fn shutdown(&mut self, result: &RunResult) {
        if self.state == EngineState::Terminated {
            return;
        }
        self.flush();
        if let Err(e) = self.run_dir.finalize(
            result.status.as_str(),
            result.ticks,
            result.final_total_value,
            result.error.clone(),
        ) {
            self.logger.engine_error(&e);
        }
        self.logger.info_with(
            "engine terminated",
            serde_json::json!({
                "status": result.status.as_str(),
                "ticks": result.ticks,
                "total_pnl": result.total_pnl,
            }),
        );
        self.flush();
        self.state = EngineState::Terminated;
    }
}
