pub mod update;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;

use crate::config::{ExecutionMode, PositionMonitorConfig};
use crate::data::MarketSnapshot;
use crate::error::EngineError;
use crate::events::{DomainEvent, PositionSnapshot, PositionView};
use crate::logging::{DomainEventLogger, StructuredLogger};
use crate::model::InstrumentKey;
use crate::util::UtilityManager;
use crate::venue::PositionReadInterface;

/// Exclusive owner of the position map, in two parallel views.
///
/// `simulated` is what the engine expects after applying deltas; `real` is
/// what venues report. In backtest the views are identical by
/// construction; in live mode divergence is reconciled by the tight loop.
pub struct PositionMonitor {
    subscriptions: HashSet<InstrumentKey>,
    simulated: HashMap<InstrumentKey, f64>,
    real: HashMap<InstrumentKey, f64>,
    mode: ExecutionMode,
    readers: HashMap<String, Arc<dyn PositionReadInterface>>,
    util: UtilityManager,
    logger: Arc<StructuredLogger>,
    events: Arc<DomainEventLogger>,
}

impl PositionMonitor {
    pub fn new(
        config: &PositionMonitorConfig,
        mode: ExecutionMode,
        readers: HashMap<String, Arc<dyn PositionReadInterface>>,
        util: UtilityManager,
        logger: Arc<StructuredLogger>,
        events: Arc<DomainEventLogger>,
        initial_position: Option<(InstrumentKey, f64)>,
    ) -> Result<Self, EngineError> {
        let subscriptions = config.subscriptions()?;

        // Pre-initialize the full subscribed universe so both views always
        // share the same key set.
        let mut simulated: HashMap<InstrumentKey, f64> =
            subscriptions.iter().map(|k| (k.clone(), 0.0)).collect();
        if let Some((key, amount)) = initial_position {
            if !subscriptions.contains(&key) {
                return Err(EngineError::UnsubscribedDelta {
                    key: key.to_string(),
                });
            }
            simulated.insert(key, amount);
        }
        let real = simulated.clone();

        Ok(Self {
            subscriptions,
            simulated,
            real,
            mode,
            readers,
            util,
            logger,
            events,
        })
    }

    pub fn subscriptions(&self) -> &HashSet<InstrumentKey> {
        &self.subscriptions
    }

    pub fn is_subscribed(&self, key: &InstrumentKey) -> bool {
        self.subscriptions.contains(key)
    }

    pub fn simulated(&self) -> &HashMap<InstrumentKey, f64> {
        &self.simulated
    }

    pub fn real(&self) -> &HashMap<InstrumentKey, f64> {
        &self.real
    }

    pub fn get(&self, key: &InstrumentKey) -> f64 {
        self.simulated.get(key).copied().unwrap_or(0.0)
    }

    /// Best-effort USD value for snapshot audit records; keys without a
    /// price in this snapshot are skipped rather than failing the log.
    fn audit_value(&self, snapshot: &MarketSnapshot, map: &HashMap<InstrumentKey, f64>) -> f64 {
        map.iter()
            .filter(|(_, amount)| **amount != 0.0)
            .filter_map(|(key, amount)| self.util.position_value(snapshot, key, *amount).ok())
            .sum()
    }

    fn emit_snapshot(
        &self,
        timestamp: u64,
        snapshot: &MarketSnapshot,
        view: PositionView,
        trigger: &str,
    ) {
        let map = match view {
            PositionView::Simulated => &self.simulated,
            PositionView::Real => &self.real,
        };
        let positions: BTreeMap<InstrumentKey, f64> =
            map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        self.events.emit(DomainEvent::Position(PositionSnapshot {
            timestamp,
            view,
            trigger: trigger.to_string(),
            total_value_usd: self.audit_value(snapshot, map),
            positions,
        }));
    }

    /// Apply venue-reported deltas to the simulated view.
    pub fn apply_deltas(
        &mut self,
        timestamp: u64,
        deltas: &BTreeMap<InstrumentKey, f64>,
        snapshot: &MarketSnapshot,
        trigger: &str,
    ) -> Result<(), EngineError> {
        for key in deltas.keys() {
            if !self.subscriptions.contains(key) {
                let err = EngineError::UnsubscribedDelta {
                    key: key.to_string(),
                };
                self.logger.engine_error(&err);
                return Err(err);
            }
        }
        for (key, delta) in deltas {
            *self.simulated.entry(key.clone()).or_insert(0.0) += delta;
        }
        self.emit_snapshot(timestamp, snapshot, PositionView::Simulated, trigger);
        Ok(())
    }

    /// Refresh the real view. Live mode queries every venue's position-read
    /// interface concurrently and replaces the view; backtest copies the
    /// simulated view (the views are equal by construction).
    pub async fn refresh_real(
        &mut self,
        timestamp: u64,
        snapshot: &MarketSnapshot,
        trigger: &str,
    ) -> Result<(), EngineError> {
        match self.mode {
            ExecutionMode::Backtest => {
                self.real = self.simulated.clone();
            }
            ExecutionMode::Live => {
                let queries = self
                    .readers
                    .values()
                    .map(|reader| {
                        let reader = Arc::clone(reader);
                        async move {
                            let venue = reader.venue().to_string();
                            (venue, reader.positions(timestamp).await)
                        }
                    })
                    .collect::<Vec<_>>();

                let mut refreshed: HashMap<InstrumentKey, f64> =
                    self.subscriptions.iter().map(|k| (k.clone(), 0.0)).collect();

                for (venue, result) in join_all(queries).await {
                    let reported = result.map_err(EngineError::Venue)?;
                    for (key, amount) in reported {
                        if !self.subscriptions.contains(&key) {
                            let err = EngineError::UnknownInstrument {
                                venue: venue.clone(),
                                key: key.to_string(),
                            };
                            self.logger.engine_error(&err);
                            return Err(err);
                        }
                        refreshed.insert(key, amount);
                    }
                }
                self.real = refreshed;
            }
        }
        self.emit_snapshot(timestamp, snapshot, PositionView::Real, trigger);
        Ok(())
    }

    /// Per-key simulated-vs-real differences over the given keys.
    pub fn divergence<'a, I>(&self, keys: I) -> Vec<(InstrumentKey, f64, f64)>
    where
        I: IntoIterator<Item = &'a InstrumentKey>,
    {
        keys.into_iter()
            .map(|key| {
                let sim = self.simulated.get(key).copied().unwrap_or(0.0);
                let real = self.real.get(key).copied().unwrap_or(0.0);
                (key.clone(), sim, real)
            })
            .collect()
    }

    pub fn log_info(&self, message: &str) {
        self.logger.info(message);
    }
}
