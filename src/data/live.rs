use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{DataProvider, MarketSnapshot};
use crate::error::EngineError;
use crate::venue::live::{CexHttpClient, ChainGatewayClient};

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct PremiumIndex {
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayMarket {
    #[serde(default)]
    supply_indices: BTreeMap<String, f64>,
    #[serde(default)]
    borrow_indices: BTreeMap<String, f64>,
    #[serde(default)]
    staking_rates: BTreeMap<String, f64>,
}

/// Live data provider: polls the exchange's public market endpoints and the
/// chain gateway's indexer on every tick.
///
/// Stablecoin quote assets are pinned at 1.0 rather than polled.
pub struct LiveDataProvider {
    cex: Arc<CexHttpClient>,
    gateway: Arc<ChainGatewayClient>,
    spot_symbols: Vec<String>,
    perp_symbols: Vec<String>,
    quote_asset: String,
}

impl LiveDataProvider {
    pub fn new(
        cex: Arc<CexHttpClient>,
        gateway: Arc<ChainGatewayClient>,
        spot_symbols: Vec<String>,
        perp_symbols: Vec<String>,
        quote_asset: &str,
    ) -> Self {
        Self {
            cex,
            gateway,
            spot_symbols,
            perp_symbols,
            quote_asset: quote_asset.to_string(),
        }
    }
}

#[async_trait]
impl DataProvider for LiveDataProvider {
    fn timestamps(&self) -> Vec<u64> {
        Vec::new()
    }

    async fn snapshot(&self, timestamp: u64) -> Result<MarketSnapshot, EngineError> {
        let failed = |reason: String| EngineError::SnapshotFailed { timestamp, reason };

        let mut prices = BTreeMap::new();
        prices.insert(self.quote_asset.clone(), 1.0);
        for symbol in &self.spot_symbols {
            let pair = format!("{symbol}{}", self.quote_asset);
            let ticker: TickerPrice = self
                .cex
                .public_get("/api/v3/ticker/price", &[("symbol", pair)])
                .await
                .map_err(|e| failed(e.to_string()))?;
            let price: f64 = ticker
                .price
                .parse()
                .map_err(|e| failed(format!("bad ticker price: {e}")))?;
            prices.insert(symbol.clone(), price);
        }

        let mut funding_rates = BTreeMap::new();
        for symbol in &self.perp_symbols {
            let premium: PremiumIndex = self
                .cex
                .public_get("/fapi/v1/premiumIndex", &[("symbol", symbol.clone())])
                .await
                .map_err(|e| failed(e.to_string()))?;
            let rate: f64 = premium
                .last_funding_rate
                .parse()
                .map_err(|e| failed(format!("bad funding rate: {e}")))?;
            funding_rates.insert(symbol.clone(), rate);
        }

        let market: GatewayMarket = self
            .gateway
            .get(&format!("/v1/market?t={timestamp}"))
            .await
            .map_err(|e| failed(e.to_string()))?;

        Ok(MarketSnapshot {
            timestamp,
            prices,
            funding_rates,
            supply_indices: market.supply_indices,
            borrow_indices: market.borrow_indices,
            staking_rates: market.staking_rates,
            ml_predictions: BTreeMap::new(),
        })
    }
}
