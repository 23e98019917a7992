use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{map_reqwest_error, map_status_error};
use crate::data::MarketSnapshot;
use crate::error::VenueError;
use crate::model::{ExecutionHandshake, HandshakeStatus, InstrumentKey, Order};
use crate::venue::{ExecutionInterface, PositionReadInterface};

const REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Client for the transaction-relay gateway that signs and submits
/// on-chain operations (single transactions and atomic bundles) on the
/// engine's behalf.
pub struct ChainGatewayClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct GatewayExecutionResponse {
    status: String,
    #[serde(default)]
    deltas: BTreeMap<String, f64>,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    fee_amount: f64,
    #[serde(default)]
    fee_currency: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayBundleResponse {
    results: Vec<GatewayExecutionResponse>,
}

#[derive(Debug, Deserialize)]
struct GatewayPositionsResponse {
    positions: BTreeMap<String, f64>,
}

impl ChainGatewayClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, VenueError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .build()
            .map_err(|e| VenueError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, VenueError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| VenueError::Network(format!("malformed gateway response: {e}")))
    }

    pub async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, VenueError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| VenueError::Network(format!("malformed gateway response: {e}")))
    }
}

fn parse_deltas(raw: &BTreeMap<String, f64>) -> Result<BTreeMap<InstrumentKey, f64>, VenueError> {
    let mut deltas = BTreeMap::new();
    for (raw_key, amount) in raw {
        let key = InstrumentKey::parse(raw_key)
            .map_err(|e| VenueError::InvalidState(format!("gateway reported bad key: {e}")))?;
        deltas.insert(key, *amount);
    }
    Ok(deltas)
}

fn handshake_from_response(
    operation_id: &str,
    response: GatewayExecutionResponse,
) -> Result<ExecutionHandshake, VenueError> {
    let deltas = parse_deltas(&response.deltas)?;
    let mut handshake = match response.status.as_str() {
        "confirmed" => ExecutionHandshake::confirmed(operation_id, deltas, false),
        "pending" => {
            let mut hs = ExecutionHandshake::confirmed(operation_id, deltas, false);
            hs.status = HandshakeStatus::Pending;
            hs
        }
        "rolled_back" => ExecutionHandshake::rolled_back(
            operation_id,
            response.error_code.as_deref().unwrap_or("VEN-004"),
            response.error_message.as_deref().unwrap_or("rolled back"),
            false,
        ),
        _ => ExecutionHandshake::failed(
            operation_id,
            response.error_code.as_deref().unwrap_or("VEN-004"),
            response.error_message.as_deref().unwrap_or("failed"),
            false,
        ),
    };
    if let Some(tx_hash) = response.tx_hash {
        handshake = handshake.with_detail("tx_hash", serde_json::json!(tx_hash));
    }
    if let Some(currency) = response.fee_currency {
        handshake = handshake.with_fee(response.fee_amount, &currency);
    }
    Ok(handshake)
}

/// Execution interface for the live on-chain venue cluster. Atomic groups
/// map to gateway bundles (one transaction).
pub struct LiveChainInterface {
    label: String,
    client: Arc<ChainGatewayClient>,
}

impl LiveChainInterface {
    pub fn new(label: &str, client: Arc<ChainGatewayClient>) -> Self {
        Self {
            label: label.to_string(),
            client,
        }
    }
}

#[async_trait]
impl ExecutionInterface for LiveChainInterface {
    fn venue(&self) -> &str {
        &self.label
    }

    async fn execute(
        &mut self,
        order: &Order,
        _snapshot: &MarketSnapshot,
    ) -> Result<ExecutionHandshake, VenueError> {
        let body = serde_json::json!({ "order": order });
        let response: GatewayExecutionResponse = self.client.post("/v1/execute", &body).await?;
        handshake_from_response(&order.operation_id, response)
    }

    async fn execute_group(
        &mut self,
        orders: &[Order],
        _snapshot: &MarketSnapshot,
    ) -> Result<Vec<ExecutionHandshake>, VenueError> {
        let body = serde_json::json!({ "orders": orders });
        let response: GatewayBundleResponse = self.client.post("/v1/bundle", &body).await?;
        if response.results.len() != orders.len() {
            return Err(VenueError::InvalidState(format!(
                "gateway returned {} results for {} orders",
                response.results.len(),
                orders.len()
            )));
        }
        orders
            .iter()
            .zip(response.results)
            .map(|(order, result)| handshake_from_response(&order.operation_id, result))
            .collect()
    }
}

/// Position-read interface for one on-chain venue, served by the gateway's
/// indexer.
pub struct LiveChainReader {
    name: String,
    client: Arc<ChainGatewayClient>,
}

impl LiveChainReader {
    pub fn new(name: &str, client: Arc<ChainGatewayClient>) -> Self {
        Self {
            name: name.to_string(),
            client,
        }
    }
}

#[async_trait]
impl PositionReadInterface for LiveChainReader {
    fn venue(&self) -> &str {
        &self.name
    }

    async fn positions(&self, timestamp: u64) -> Result<HashMap<InstrumentKey, f64>, VenueError> {
        let response: GatewayPositionsResponse = self
            .client
            .get(&format!("/v1/positions?venue={}&t={timestamp}", self.name))
            .await?;
        let mut positions = HashMap::new();
        for (raw_key, amount) in response.positions {
            if amount == 0.0 {
                continue;
            }
            let key = InstrumentKey::parse(&raw_key)
                .map_err(|e| VenueError::InvalidState(format!("gateway reported bad key: {e}")))?;
            positions.insert(key, amount);
        }
        Ok(positions)
    }
}
