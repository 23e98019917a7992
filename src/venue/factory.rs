use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{EngineConfig, ExecutionMode, VenueKind};
use crate::error::{EngineError, VenueError};
use crate::model::InstrumentKey;
use crate::util::UtilityManager;
use crate::venue::live::{
    CexHttpClient, ChainGatewayClient, LiveCexInterface, LiveCexReader, LiveChainInterface,
    LiveChainReader,
};
use crate::venue::sim::{CexSimulator, ChainSimulator, SimLedger};
use crate::venue::{PositionReadInterface, VenueInterfaceRouter};

/// Interface name the on-chain cluster registers under in logs.
const CHAIN_INTERFACE_LABEL: &str = "onchain";

const DEFAULT_CEX_API_URL: &str = "https://api.binance.com";

/// Credential/endpoint environment, selected by `BASIS_ENVIRONMENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_env() -> Result<Self, EngineError> {
        match std::env::var("BASIS_ENVIRONMENT").ok().as_deref() {
            None | Some("dev") => Ok(Environment::Dev),
            Some("staging") => Ok(Environment::Staging),
            Some("prod") => Ok(Environment::Prod),
            Some(other) => Err(EngineError::MissingConfig {
                field: format!("BASIS_ENVIRONMENT has unknown value `{other}`"),
            }),
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Environment::Dev => "DEV",
            Environment::Staging => "STAGING",
            Environment::Prod => "PROD",
        }
    }
}

/// Credential set loaded once per run; both execution and position-read
/// interfaces for a venue are constructed from the same set.
#[derive(Debug, Clone)]
pub struct VenueCredentials {
    pub cex_api_url: String,
    pub cex_api_key: String,
    pub cex_api_secret: String,
    pub chain_gateway_url: String,
    pub chain_gateway_token: String,
}

impl VenueCredentials {
    pub fn load(environment: Environment) -> Result<Self, VenueError> {
        let prefix = environment.prefix();
        let var = |name: &str| -> Result<String, VenueError> {
            std::env::var(format!("BASIS_{prefix}_{name}"))
                .map_err(|_| VenueError::Credential(format!("BASIS_{prefix}_{name} is not set")))
        };
        Ok(Self {
            cex_api_url: std::env::var(format!("BASIS_{prefix}_CEX_API_URL"))
                .unwrap_or_else(|_| DEFAULT_CEX_API_URL.to_string()),
            cex_api_key: var("CEX_API_KEY")?,
            cex_api_secret: var("CEX_API_SECRET")?,
            chain_gateway_url: var("CHAIN_GATEWAY_URL")?,
            chain_gateway_token: var("CHAIN_GATEWAY_TOKEN")?,
        })
    }
}

/// Router plus per-venue position readers, built exactly once per run.
pub struct VenueStack {
    pub router: VenueInterfaceRouter,
    pub readers: HashMap<String, Arc<dyn PositionReadInterface>>,
}

pub struct VenueFactory;

impl VenueFactory {
    /// Construct every venue interface for the run.
    ///
    /// Backtest: one shared sim ledger seeded with the strategy's funding
    /// position; the on-chain cluster becomes one bundling simulator and
    /// each exchange its own fill simulator. Live: one credential load,
    /// one HTTP client per transport, execution and read interfaces built
    /// from the same clients.
    pub fn build(
        config: &EngineConfig,
        util: &UtilityManager,
        initial_position: Option<(InstrumentKey, f64)>,
        seed: u64,
    ) -> Result<VenueStack, EngineError> {
        let mut router = VenueInterfaceRouter::new();
        let mut readers: HashMap<String, Arc<dyn PositionReadInterface>> = HashMap::new();

        let chain_venues: BTreeMap<String, _> = config
            .venues
            .iter()
            .filter(|(_, v)| v.enabled && v.kind == VenueKind::Chain)
            .map(|(name, v)| (name.clone(), v.clone()))
            .collect();
        let cex_venues: BTreeMap<String, _> = config
            .venues
            .iter()
            .filter(|(_, v)| v.enabled && v.kind == VenueKind::Cex)
            .map(|(name, v)| (name.clone(), v.clone()))
            .collect();

        match config.execution_mode {
            ExecutionMode::Backtest => {
                let ledger = SimLedger::shared();
                if let Some((key, amount)) = initial_position {
                    ledger.lock().expect("sim ledger poisoned").seed(key, amount);
                }

                if !chain_venues.is_empty() {
                    let names: Vec<String> = chain_venues.keys().cloned().collect();
                    let sim = ChainSimulator::new(
                        CHAIN_INTERFACE_LABEL,
                        chain_venues,
                        util.clone(),
                        Arc::clone(&ledger),
                    );
                    router.register(&names, Box::new(sim));
                }

                for (name, venue_config) in cex_venues {
                    let slippage = venue_config.slippage_bps;
                    let sim = CexSimulator::new(
                        &name,
                        venue_config,
                        util.clone(),
                        Arc::clone(&ledger),
                        slippage,
                        seed,
                    );
                    router.register(&[name], Box::new(sim));
                }
            }
            ExecutionMode::Live => {
                let environment = Environment::from_env()?;
                let credentials = VenueCredentials::load(environment).map_err(EngineError::Venue)?;

                if !cex_venues.is_empty() {
                    let client = Arc::new(
                        CexHttpClient::new(
                            &credentials.cex_api_url,
                            &credentials.cex_api_key,
                            &credentials.cex_api_secret,
                        )
                        .map_err(EngineError::Venue)?,
                    );
                    for name in cex_venues.keys() {
                        router.register(
                            &[name.clone()],
                            Box::new(LiveCexInterface::new(name, Arc::clone(&client))),
                        );
                        readers.insert(
                            name.clone(),
                            Arc::new(LiveCexReader::new(name, Arc::clone(&client))),
                        );
                    }
                }

                if !chain_venues.is_empty() {
                    let client = Arc::new(
                        ChainGatewayClient::new(
                            &credentials.chain_gateway_url,
                            &credentials.chain_gateway_token,
                        )
                        .map_err(EngineError::Venue)?,
                    );
                    let names: Vec<String> = chain_venues.keys().cloned().collect();
                    router.register(
                        &names,
                        Box::new(LiveChainInterface::new(
                            CHAIN_INTERFACE_LABEL,
                            Arc::clone(&client),
                        )),
                    );
                    for name in chain_venues.keys() {
                        readers.insert(
                            name.clone(),
                            Arc::new(LiveChainReader::new(name, Arc::clone(&client))),
                        );
                    }
                }
            }
        }

        Ok(VenueStack { router, readers })
    }
}
