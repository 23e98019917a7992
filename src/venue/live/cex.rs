use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{map_reqwest_error, map_status_error};
use crate::data::MarketSnapshot;
use crate::error::VenueError;
use crate::model::{
    ExecutionHandshake, HandshakeStatus, InstrumentKey, OperationType, Order, PositionType,
};
use crate::venue::{ExecutionInterface, PositionReadInterface};

const REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Signed REST client for a Binance-style exchange API.
///
/// One client per venue per run; both the execution and the position-read
/// interfaces are built from it so they share the credential set.
pub struct CexHttpClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl CexHttpClient {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self, VenueError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .build()
            .map_err(|e| VenueError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Utc::now().timestamp_millis()));
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn handle(
        &self,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<serde_json::Value, VenueError> {
        let response = response.map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| VenueError::Network(format!("malformed venue response: {e}")))
    }

    pub async fn signed_post(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, VenueError> {
        let url = format!("{}{path}", self.base_url);
        let body = self.signed_query(params);
        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await;
        self.handle(response).await
    }

    /// Unsigned public-market GET, deserialized into the caller's type.
    pub async fn public_get<T: for<'de> serde::Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, VenueError> {
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };
        let response = self.http.get(&url).send().await;
        let value = self.handle(response).await?;
        serde_json::from_value(value)
            .map_err(|e| VenueError::Network(format!("malformed venue response: {e}")))
    }

    pub async fn signed_get(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, VenueError> {
        let url = format!("{}{path}?{}", self.base_url, self.signed_query(params));
        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await;
        self.handle(response).await
    }
}

fn f64_field(value: &serde_json::Value, field: &str) -> f64 {
    match &value[field] {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Execution interface for one live exchange venue.
pub struct LiveCexInterface {
    name: String,
    client: Arc<CexHttpClient>,
}

impl LiveCexInterface {
    pub fn new(name: &str, client: Arc<CexHttpClient>) -> Self {
        Self {
            name: name.to_string(),
            client,
        }
    }

    /// Side inference: an explicit `side` detail wins, otherwise buying the
    /// target with a quote stable is a BUY of `target_token`.
    fn spot_params(&self, order: &Order) -> (String, &'static str, Vec<(&'static str, String)>) {
        let explicit = order
            .operation_details
            .get("side")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let quote_like = ["USDT", "USDC", "FDUSD"];
        let buying = match explicit.as_deref() {
            Some("buy") => true,
            Some("sell") => false,
            _ => quote_like.contains(&order.source_token.as_str()),
        };
        if buying {
            (
                format!("{}{}", order.target_token, order.source_token),
                "BUY",
                vec![("quoteOrderQty", format!("{}", order.amount))],
            )
        } else {
            (
                format!("{}{}", order.source_token, order.target_token),
                "SELL",
                vec![("quantity", format!("{}", order.amount))],
            )
        }
    }

    async fn execute_spot(&self, order: &Order) -> Result<ExecutionHandshake, VenueError> {
        let (symbol, side, qty_params) = self.spot_params(order);
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", symbol.clone()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("newClientOrderId", order.operation_id.clone()),
        ];
        params.extend(qty_params);

        let response = self.client.signed_post("/api/v3/order", &params).await?;

        let executed_qty = f64_field(&response, "executedQty");
        let quote_qty = f64_field(&response, "cummulativeQuoteQty");

        let mut fee_in_base = 0.0;
        let mut fee_amount = 0.0;
        let mut fee_currency = None;
        if let Some(fills) = response["fills"].as_array() {
            let base_asset = if side == "BUY" {
                order.target_token.as_str()
            } else {
                order.source_token.as_str()
            };
            for fill in fills {
                let commission = f64_field(fill, "commission");
                match fill["commissionAsset"].as_str() {
                    Some(asset) if asset == base_asset => fee_in_base += commission,
                    Some(asset) => {
                        fee_amount += commission;
                        fee_currency = Some(asset.to_string());
                    }
                    None => {}
                }
            }
        }

        let mut deltas: BTreeMap<InstrumentKey, f64> = BTreeMap::new();
        let source = InstrumentKey::new(&self.name, PositionType::BaseToken, &order.source_token);
        let target = InstrumentKey::new(&self.name, PositionType::BaseToken, &order.target_token);
        if side == "BUY" {
            deltas.insert(source, -quote_qty);
            deltas.insert(target, executed_qty - fee_in_base);
        } else {
            deltas.insert(source, -executed_qty);
            deltas.insert(target, quote_qty - fee_in_base);
        }

        let mut handshake = ExecutionHandshake::confirmed(&order.operation_id, deltas, false)
            .with_detail("symbol", serde_json::json!(symbol))
            .with_detail("side", serde_json::json!(side))
            .with_detail("venue_order_id", response["orderId"].clone())
            .with_detail("fills", response["fills"].clone());
        if let Some(currency) = fee_currency {
            handshake = handshake.with_fee(fee_amount, &currency);
        }
        Ok(handshake)
    }

    async fn execute_perp(&self, order: &Order) -> Result<ExecutionHandshake, VenueError> {
        let side = if order.amount > 0.0 { "BUY" } else { "SELL" };
        let params: Vec<(&str, String)> = vec![
            ("symbol", order.target_token.clone()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format!("{}", order.amount.abs())),
            ("newClientOrderId", order.operation_id.clone()),
        ];
        let response = self.client.signed_post("/fapi/v1/order", &params).await?;

        let executed_qty = f64_field(&response, "executedQty");
        let signed_qty = if order.amount > 0.0 {
            executed_qty
        } else {
            -executed_qty
        };

        let mut deltas = BTreeMap::new();
        deltas.insert(
            InstrumentKey::new(&self.name, PositionType::Perp, &order.target_token),
            signed_qty,
        );

        Ok(
            ExecutionHandshake::confirmed(&order.operation_id, deltas, false)
                .with_detail("venue_order_id", response["orderId"].clone())
                .with_detail("avg_price", response["avgPrice"].clone()),
        )
    }

    /// Withdrawals settle asynchronously; the handshake stays pending and
    /// the position change surfaces through the next real refresh.
    async fn execute_transfer(&self, order: &Order) -> Result<ExecutionHandshake, VenueError> {
        let address = order
            .operation_details
            .get("address")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                VenueError::InvalidOrder("transfer requires an `address` detail".to_string())
            })?;
        let params: Vec<(&str, String)> = vec![
            ("coin", order.source_token.clone()),
            ("amount", format!("{}", order.amount)),
            ("address", address.to_string()),
        ];
        let response = self
            .client
            .signed_post("/sapi/v1/capital/withdraw/apply", &params)
            .await?;

        let mut handshake =
            ExecutionHandshake::confirmed(&order.operation_id, BTreeMap::new(), false)
                .with_detail("withdraw_id", response["id"].clone())
                .with_detail("target_venue", serde_json::json!(order.target_venue));
        handshake.status = HandshakeStatus::Pending;
        Ok(handshake)
    }
}

#[async_trait]
impl ExecutionInterface for LiveCexInterface {
    fn venue(&self) -> &str {
        &self.name
    }

    async fn execute(
        &mut self,
        order: &Order,
        _snapshot: &MarketSnapshot,
    ) -> Result<ExecutionHandshake, VenueError> {
        match order.operation_type {
            OperationType::SpotTrade => self.execute_spot(order).await,
            OperationType::PerpTrade => self.execute_perp(order).await,
            OperationType::Transfer => self.execute_transfer(order).await,
            other => Err(VenueError::InvalidOrder(format!(
                "operation {other} not supported by exchange venue"
            ))),
        }
    }
}

/// Position-read interface for one live exchange venue: spot balances plus
/// open perp positions. Zero balances are dropped (absent, not reported).
pub struct LiveCexReader {
    name: String,
    client: Arc<CexHttpClient>,
}

impl LiveCexReader {
    pub fn new(name: &str, client: Arc<CexHttpClient>) -> Self {
        Self {
            name: name.to_string(),
            client,
        }
    }
}

#[async_trait]
impl PositionReadInterface for LiveCexReader {
    fn venue(&self) -> &str {
        &self.name
    }

    async fn positions(&self, _timestamp: u64) -> Result<HashMap<InstrumentKey, f64>, VenueError> {
        let mut positions = HashMap::new();

        let account = self.client.signed_get("/api/v3/account", &[]).await?;
        if let Some(balances) = account["balances"].as_array() {
            for balance in balances {
                let asset = balance["asset"].as_str().unwrap_or_default();
                let total = f64_field(balance, "free") + f64_field(balance, "locked");
                if asset.is_empty() || total == 0.0 {
                    continue;
                }
                positions.insert(
                    InstrumentKey::new(&self.name, PositionType::BaseToken, asset),
                    total,
                );
            }
        }

        let perp = self
            .client
            .signed_get("/fapi/v2/positionRisk", &[])
            .await?;
        if let Some(entries) = perp.as_array() {
            for entry in entries {
                let symbol = entry["symbol"].as_str().unwrap_or_default();
                let amount = f64_field(entry, "positionAmt");
                if symbol.is_empty() || amount == 0.0 {
                    continue;
                }
                positions.insert(
                    InstrumentKey::new(&self.name, PositionType::Perp, symbol),
                    amount,
                );
            }
        }

        Ok(positions)
    }
}
