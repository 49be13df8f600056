// CoinGecko adapter: secondary quote source and secondary hourly history

use itertools::Itertools;
use reqwest::header::ACCEPT;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::coingecko_types::{ApiStatus, MarketChartResponse, MarketsResponse};
use super::{get_json, AdapterError, AdapterResult, HistorySource, QuoteBatch, QuoteSource};
use crate::market_data::normaliser::MAX_TS_MS;
use crate::market_data::types::{PricePoint, QuotePatch, Symbol};

const API_KEY_HEADER: &str = "x-cg-demo-api-key";

pub struct CoinGeckoAdapter {
    client: reqwest::Client,
    pub base_url: String, // "https://api.coingecko.com/api/v3"
    api_key: Option<String>,
}

impl CoinGeckoAdapter {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .header(ACCEPT, "application/json");
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key.as_str()),
            None => req,
        }
    }
}

fn status_error(status: ApiStatus) -> AdapterError {
    if status.error_code == Some(429) {
        return AdapterError::RateLimited(status.error_message.unwrap_or_else(|| "429".into()));
    }
    AdapterError::from_upstream_message(status.error_message.as_deref().unwrap_or("unspecified error"))
}

pub(crate) fn quotes_from_payload(payload: MarketsResponse, symbols: &[Symbol]) -> AdapterResult<QuoteBatch> {
    let entries = match payload {
        MarketsResponse::Entries(entries) => entries,
        MarketsResponse::Error { status } => return Err(status_error(status)),
    };
    let batch: QuoteBatch = entries
        .into_iter()
        .filter_map(|entry| {
            let symbol = Symbol::from_coingecko_id(&entry.id)?;
            if !symbols.contains(&symbol) {
                return None;
            }
            let price = entry.current_price?;
            let patch = QuotePatch {
                price: Some(price),
                change_1h: entry.price_change_percentage_1h_in_currency,
                change_24h: entry.price_change_percentage_24h,
                change_7d: entry.price_change_percentage_7d_in_currency,
                volume_24h: entry.total_volume,
                market_cap: entry.market_cap,
                circulating_supply: entry.circulating_supply.filter(|s| *s > 0.0),
                max_supply: entry.max_supply,
                rank: entry.market_cap_rank,
            };
            Some((symbol, patch))
        })
        .collect();
    if batch.is_empty() {
        return Err(AdapterError::MalformedResponse("no requested coins in markets payload".into()));
    }
    Ok(batch)
}

pub(crate) fn history_from_payload(payload: MarketChartResponse) -> AdapterResult<Vec<PricePoint>> {
    match payload {
        // timestamps arrive as floats; anything outside the plausible range is dropped
        MarketChartResponse::Chart { prices } => Ok(prices
            .into_iter()
            .filter(|(ts, _)| (0.0..MAX_TS_MS as f64).contains(ts))
            .map(|(ts, price)| PricePoint::new(ts as i64, price))
            .collect()),
        MarketChartResponse::Error { status } => Err(status_error(status)),
    }
}

#[async_trait::async_trait]
impl QuoteSource for CoinGeckoAdapter {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    #[instrument(level = "debug", skip(self, cancel))]
    async fn fetch_quotes(&self, symbols: &[Symbol], cancel: &CancellationToken) -> AdapterResult<QuoteBatch> {
        let ids = symbols.iter().map(Symbol::coingecko_id).join(",");
        let req = self.get("coins/markets").query(&[
            ("vs_currency", "usd"),
            ("ids", ids.as_str()),
            ("order", "market_cap_desc"),
            ("sparkline", "false"),
            ("price_change_percentage", "1h,24h,7d"),
        ]);
        let payload: MarketsResponse = get_json(req, cancel).await?;
        let batch = quotes_from_payload(payload, symbols)?;
        debug!(count = batch.len(), "coingecko quotes");
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl HistorySource for CoinGeckoAdapter {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    #[instrument(level = "debug", skip(self, cancel))]
    async fn fetch_hourly_history(&self, symbol: Symbol, cancel: &CancellationToken) -> AdapterResult<Vec<PricePoint>> {
        let path = format!("coins/{}/market_chart", symbol.coingecko_id());
        let req = self.get(&path).query(&[("vs_currency", "usd"), ("days", "7")]);
        let payload: MarketChartResponse = get_json(req, cancel).await?;
        history_from_payload(payload)
    }
}
