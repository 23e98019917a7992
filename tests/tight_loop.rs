mod common;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use basis_engine::config::{ConversionMethod, ExecutionMode, RiskLimits};
use basis_engine::data::MarketSnapshot;
use basis_engine::error::{EngineError, VenueError};
use basis_engine::exposure::ExposureMonitor;
use basis_engine::logging::{DomainEventLogger, LogDirectoryManager, RunContext, StructuredLogger};
use basis_engine::model::{ExecutionHandshake, InstrumentKey, OperationType, Order};
use basis_engine::pnl::PnlMonitor;
use basis_engine::position::update::{MonitorStack, PositionUpdateHandler};
use basis_engine::position::PositionMonitor;
use basis_engine::risk::RiskMonitor;
use basis_engine::util::UtilityManager;
use basis_engine::venue::PositionReadInterface;

use common::*;

/// Position reader that walks through a scripted sequence of aToken
/// balances, emulating venue propagation delay.
struct DriftingReader {
    venue: String,
    key: InstrumentKey,
    wallet_key: InstrumentKey,
    responses: Mutex<Vec<f64>>,
}

impl DriftingReader {
    fn new(responses: Vec<f64>) -> Self {
        Self {
            venue: "aave_v3".to_string(),
            key: InstrumentKey::parse("aave_v3:aToken:aUSDT").unwrap(),
            wallet_key: InstrumentKey::parse("wallet:BaseToken:USDT").unwrap(),
            responses: Mutex::new(responses),
        }
    }
}

#[async_trait]
impl PositionReadInterface for DriftingReader {
    fn venue(&self) -> &str {
        &self.venue
    }

    async fn positions(&self, _timestamp: u64) -> Result<HashMap<InstrumentKey, f64>, VenueError> {
        let mut responses = self.responses.lock().unwrap();
        let amount = if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses[0]
        };
        let mut map = HashMap::new();
        map.insert(self.key.clone(), amount);
        map.insert(self.wallet_key.clone(), 0.0);
        Ok(map)
    }
}

fn snapshot() -> MarketSnapshot {
    let mut snap = MarketSnapshot {
        timestamp: T0,
        ..Default::default()
    };
    snap.prices.insert("USDT".into(), 1.0);
    snap.supply_indices.insert("USDT".into(), 1.05);
    snap.borrow_indices.insert("USDT".into(), 1.08);
    snap
}

struct Fixture {
    monitors: MonitorStack,
    handler: PositionUpdateHandler,
    events: Arc<DomainEventLogger>,
    events_dir: std::path::PathBuf,
    _logs_dir: tempfile::TempDir,
}

/// Wire a live-mode monitor stack around the scripted reader, with the
/// engine's tight-loop settings (tolerance 0.01, two retries).
fn live_fixture(responses: Vec<f64>) -> Fixture {
    let logs_dir = tempfile::tempdir().unwrap();
    let config = {
        let mut venues = BTreeMap::new();
        venues.insert(
            "aave_v3".to_string(),
            chain_venue(&[("aUSDT", "USDT")], None),
        );
        build_config(ModeParams {
            mode: "pure_lending_usdt",
            capital: 10_000.0,
            reporting_currency: "USDT",
            subscriptions: vec!["wallet:BaseToken:USDT", "aave_v3:aToken:aUSDT"],
            track_assets: vec!["USDT"],
            conversions: vec![
                ("USDT", ConversionMethod::Direct),
                (
                    "aUSDT",
                    ConversionMethod::SupplyIndex {
                        underlying: "USDT".to_string(),
                    },
                ),
            ],
            enabled_risk_types: vec![],
            risk_limits: RiskLimits::default(),
            venues,
            strategy: default_strategy_config("pure_lending"),
        })
    };

    let ctx = Arc::new(RunContext::new(&config.mode, config.initial_capital));
    let run_dir = LogDirectoryManager::create(logs_dir.path(), &ctx).unwrap();
    let events = Arc::new(DomainEventLogger::new(&run_dir.events_dir, Arc::clone(&ctx)));
    let util = UtilityManager::from_config(&config);

    let mut readers: HashMap<String, Arc<dyn PositionReadInterface>> = HashMap::new();
    readers.insert(
        "aave_v3".to_string(),
        Arc::new(DriftingReader::new(responses)),
    );

    let open = |name: &str| {
        Arc::new(StructuredLogger::open(&run_dir.run_dir, name, Arc::clone(&ctx)).unwrap())
    };

    let positions = PositionMonitor::new(
        &config.component_config.position_monitor,
        ExecutionMode::Live,
        readers,
        util.clone(),
        open("position_monitor"),
        Arc::clone(&events),
        Some((
            InstrumentKey::parse("wallet:BaseToken:USDT").unwrap(),
            10_000.0,
        )),
    )
    .unwrap();
    let exposure = ExposureMonitor::new(
        &config.component_config.exposure_monitor,
        util.clone(),
        open("exposure_monitor"),
        Arc::clone(&events),
    );
    let risk = RiskMonitor::new(
        &config.component_config.risk_monitor,
        config.venues.iter().map(|(n, v)| (n.clone(), v.kind)).collect(),
        util.clone(),
        open("risk_monitor"),
        Arc::clone(&events),
    )
    .unwrap();
    let pnl = PnlMonitor::new(
        &config.component_config.pnl_monitor,
        config.initial_capital,
        util.clone(),
        open("pnl_monitor"),
        Arc::clone(&events),
    );

    let handler = PositionUpdateHandler::new(
        &config.component_config.execution_manager,
        config.component_config.pnl_monitor.reconciliation_tolerance,
        ExecutionMode::Live,
        open("position_update_handler"),
        Arc::clone(&events),
    );

    Fixture {
        monitors: MonitorStack {
            positions,
            exposure,
            risk,
            pnl,
        },
        handler,
        events,
        events_dir: run_dir.events_dir.clone(),
        _logs_dir: logs_dir,
    }
}

fn supply_order_and_handshake() -> (Order, ExecutionHandshake) {
    let wallet = InstrumentKey::parse("wallet:BaseToken:USDT").unwrap();
    let atoken = InstrumentKey::parse("aave_v3:aToken:aUSDT").unwrap();

    let order = Order::new(
        OperationType::Supply,
        "wallet",
        "aave_v3",
        "USDT",
        "aUSDT",
        10_000.0,
    )
    .with_expected_deltas(vec![
        basis_engine::model::ExpectedDelta::new(wallet.clone(), -10_000.0, OperationType::Supply),
        basis_engine::model::ExpectedDelta::new(atoken.clone(), 10_500.0, OperationType::Supply),
    ]);

    let mut deltas = BTreeMap::new();
    deltas.insert(wallet, -10_000.0);
    deltas.insert(atoken, 10_500.0);
    let handshake = ExecutionHandshake::confirmed(&order.operation_id, deltas, false);
    (order, handshake)
}

#[tokio::test]
async fn reconciliation_converges_within_retries() {
    // Venue propagation: first two reads land short of the applied
    // deltas, the third matches. Tolerance is 0.01.
    let mut fixture = live_fixture(vec![10_499.5, 10_499.8, 10_500.0]);
    let (order, handshake) = supply_order_and_handshake();
    let snap = snapshot();

    fixture
        .handler
        .tight_loop(T0, &order, &handshake, &mut fixture.monitors, &snap, 3, 0)
        .await
        .expect("reconciliation should converge on the third read");

    let atoken = InstrumentKey::parse("aave_v3:aToken:aUSDT").unwrap();
    assert!((fixture.monitors.positions.real()[&atoken] - 10_500.0).abs() < 1e-9);

    fixture.events.flush_all();
    let streams = assert_event_streams_well_formed(&fixture.events_dir);
    let reconciliations = &streams["reconciliation"];
    assert_eq!(reconciliations.len(), 1);
    assert_eq!(reconciliations[0]["retry_attempt"], 2);
    assert_eq!(reconciliations[0]["success"], true);
    assert!(reconciliations[0]["mismatches"].as_array().unwrap().is_empty());

    let tight_loops = &streams["tight_loop"];
    assert_eq!(tight_loops.len(), 1);
    assert_eq!(tight_loops[0]["reconciliation_success"], true);
}

#[tokio::test]
async fn reconciliation_times_out_after_max_retries() {
    // Venue never converges: stuck 0.5 under the simulated view.
    let mut fixture = live_fixture(vec![10_499.5]);
    let (order, handshake) = supply_order_and_handshake();
    let snap = snapshot();

    let err = fixture
        .handler
        .tight_loop(T0, &order, &handshake, &mut fixture.monitors, &snap, 3, 0)
        .await
        .expect_err("stuck divergence must raise the reconciliation timeout");

    assert_eq!(err.code(), "EXEC-005");
    assert_eq!(err.severity(), basis_engine::Severity::Critical);
    match err {
        EngineError::ReconciliationTimeout { attempts } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }

    fixture.events.flush_all();
    let streams = assert_event_streams_well_formed(&fixture.events_dir);
    let reconciliations = &streams["reconciliation"];
    assert_eq!(reconciliations.len(), 1);
    assert_eq!(reconciliations[0]["success"], false);
    assert_eq!(reconciliations[0]["max_retries"], 2);
    let mismatches = reconciliations[0]["mismatches"].as_array().unwrap();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(
        mismatches[0]["instrument_key"],
        "aave_v3:aToken:aUSDT"
    );
}
