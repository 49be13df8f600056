// CryptoCompare adapter: primary quote source and primary hourly history

use itertools::Itertools;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::cryptocompare_types::{HistoHour, PriceMultiFull};
use super::{get_json, AdapterError, AdapterResult, HistorySource, QuoteBatch, QuoteSource};
use crate::market_data::types::{PricePoint, QuotePatch, Symbol, HOURS_PER_WEEK};

const QUOTE_CURRENCY: &str = "USD";

pub struct CryptoCompareAdapter {
    client: reqwest::Client,
    pub base_url: String, // "https://min-api.cryptocompare.com/data"
    api_key: Option<String>,
}

impl CryptoCompareAdapter {
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
            Some(key) => req.header(AUTHORIZATION, format!("Apikey {}", key)),
            None => req,
        }
    }
}

/// Pick the requested symbols out of a `pricemultifull` payload.
pub(crate) fn quotes_from_payload(payload: PriceMultiFull, symbols: &[Symbol]) -> AdapterResult<QuoteBatch> {
    if payload.response.as_deref() == Some("Error") {
        return Err(AdapterError::from_upstream_message(
            payload.message.as_deref().unwrap_or("unspecified error"),
        ));
    }
    let mut batch = QuoteBatch::new();
    for symbol in symbols {
        let Some(raw) = payload.raw.get(symbol.as_str()).and_then(|m| m.get(QUOTE_CURRENCY)) else {
            continue;
        };
        // a quote without a price is useless to us
        let Some(price) = raw.price else { continue };
        batch.insert(
            *symbol,
            QuotePatch {
                price: Some(price),
                change_1h: raw.change_pct_hour,
                change_24h: raw.change_pct_24h,
                volume_24h: raw.total_volume_24h,
                market_cap: raw.market_cap,
                circulating_supply: raw.supply.filter(|s| *s > 0.0),
                ..QuotePatch::default()
            },
        );
    }
    if batch.is_empty() {
        return Err(AdapterError::MalformedResponse("no requested symbols in RAW".into()));
    }
    Ok(batch)
}

/// `histohour` bars as millisecond samples. Zero closes are padding.
pub(crate) fn history_from_payload(payload: HistoHour) -> AdapterResult<Vec<PricePoint>> {
    if payload.response.as_deref() == Some("Error") {
        return Err(AdapterError::from_upstream_message(
            payload.message.as_deref().unwrap_or("unspecified error"),
        ));
    }
    let bars = payload
        .data
        .ok_or_else(|| AdapterError::MalformedResponse("missing Data".into()))?
        .bars;
    Ok(bars
        .into_iter()
        .filter(|bar| bar.close > 0.0)
        .map(|bar| PricePoint::new(bar.time * 1000, bar.close))
        .collect())
}

#[async_trait::async_trait]
impl QuoteSource for CryptoCompareAdapter {
    fn name(&self) -> &'static str {
        "cryptocompare"
    }

    #[instrument(level = "debug", skip(self, cancel))]
    async fn fetch_quotes(&self, symbols: &[Symbol], cancel: &CancellationToken) -> AdapterResult<QuoteBatch> {
        let fsyms = symbols.iter().map(Symbol::as_str).join(",");
        let req = self
            .get("pricemultifull")
            .query(&[("fsyms", fsyms.as_str()), ("tsyms", QUOTE_CURRENCY)]);
        let payload: PriceMultiFull = get_json(req, cancel).await?;
        let batch = quotes_from_payload(payload, symbols)?;
        debug!(count = batch.len(), "cryptocompare quotes");
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl HistorySource for CryptoCompareAdapter {
    fn name(&self) -> &'static str {
        "cryptocompare"
    }

    #[instrument(level = "debug", skip(self, cancel))]
    async fn fetch_hourly_history(&self, symbol: Symbol, cancel: &CancellationToken) -> AdapterResult<Vec<PricePoint>> {
        let limit = HOURS_PER_WEEK.to_string();
        let req = self.get("v2/histohour").query(&[
            ("fsym", symbol.as_str()),
            ("tsym", QUOTE_CURRENCY),
            ("limit", limit.as_str()),
            ("aggregate", "1"),
        ]);
        let payload: HistoHour = get_json(req, cancel).await?;
        history_from_payload(payload)
    }
}
