// Binance adapter: live 24h ticker stream (also served as a quote source from
// its cache) and klines for hourly history

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use futures::{SinkExt, StreamExt};
use itertools::Itertools;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::binance_types::{KlinesResponse, StreamEnvelope, TickerEvent, KLINE_CLOSE, KLINE_OPEN_TIME};
use super::{
    get_json, AdapterError, AdapterResult, HistorySource, MarketEvent, QuoteBatch, QuoteSource, StreamAdapter,
};
use crate::market_data::types::{now_ms, PricePoint, QuotePatch, Symbol, HOURS_PER_WEEK};

#[derive(Debug, Clone)]
struct CachedTick {
    event_time_ms: i64,
    received_at_ms: i64,
    patch: QuotePatch,
}

/// Last accepted tick per symbol. Duplicates and out-of-order messages
/// (by exchange event time) are refused, which makes applying ticks idempotent.
#[derive(Debug, Default)]
pub struct TickerCache {
    ticks: RwLock<AHashMap<Symbol, CachedTick>>,
}

impl TickerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the tick is not newer than what we already hold.
    pub fn offer(&self, symbol: Symbol, event_time_ms: i64, patch: &QuotePatch, received_at_ms: i64) -> bool {
        let mut ticks = self.ticks.write();
        if let Some(existing) = ticks.get(&symbol) {
            if event_time_ms <= existing.event_time_ms {
                return false;
            }
        }
        ticks.insert(
            symbol,
            CachedTick { event_time_ms, received_at_ms, patch: patch.clone() },
        );
        true
    }

    /// Cached patches for `symbols` received within `max_age_ms` of `now_ms`.
    pub fn fresh(&self, symbols: &[Symbol], now_ms: i64, max_age_ms: i64) -> QuoteBatch {
        let ticks = self.ticks.read();
        symbols
            .iter()
            .filter_map(|s| {
                ticks
                    .get(s)
                    .filter(|t| now_ms - t.received_at_ms <= max_age_ms)
                    .map(|t| (*s, t.patch.clone()))
            })
            .collect()
    }
}

fn parse_decimal(field: &str, raw: &str) -> AdapterResult<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AdapterError::MalformedResponse(format!("bad {} value {:?}", field, raw)))
}

impl TickerEvent {
    pub(crate) fn to_patch(&self) -> AdapterResult<QuotePatch> {
        Ok(QuotePatch {
            price: Some(parse_decimal("last price", &self.last_price)?),
            change_24h: Some(parse_decimal("change percent", &self.price_change_percent)?),
            // quote-asset volume, i.e. already in (roughly) USD
            volume_24h: Some(parse_decimal("quote volume", &self.quote_volume)?),
            ..QuotePatch::default()
        })
    }
}

pub(crate) fn history_from_payload(payload: KlinesResponse) -> AdapterResult<Vec<PricePoint>> {
    let rows = match payload {
        KlinesResponse::Rows(rows) => rows,
        KlinesResponse::Error { code, msg } => {
            return Err(AdapterError::from_upstream_message(&format!("{} ({})", msg, code)))
        }
    };
    rows.iter()
        .map(|row| {
            let ts = row.get(KLINE_OPEN_TIME).and_then(|v| v.as_i64());
            let close = row.get(KLINE_CLOSE).and_then(|v| v.as_str());
            match (ts, close) {
                (Some(ts), Some(close)) => Ok(PricePoint::new(ts, parse_decimal("close", close)?)),
                _ => Err(AdapterError::MalformedResponse("kline row missing open time or close".into())),
            }
        })
        .collect()
}

pub struct BinanceAdapter {
    client: reqwest::Client,
    pub rest_url: String, // "https://api.binance.com"
    pub ws_url: String,   // "wss://stream.binance.com:9443"
    pub reconnect_delay: Duration,
    pub max_tick_age: Duration,
    cache: Arc<TickerCache>,
}

impl BinanceAdapter {
    pub fn new(client: reqwest::Client, rest_url: &str, ws_url: &str) -> Self {
        Self {
            client,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.trim_end_matches('/').to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_tick_age: Duration::from_secs(60),
            cache: Arc::new(TickerCache::new()),
        }
    }

    pub fn with_stream_timing(mut self, reconnect_delay: Duration, max_tick_age: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self.max_tick_age = max_tick_age;
        self
    }

    pub fn cache(&self) -> Arc<TickerCache> {
        Arc::clone(&self.cache)
    }

    /// Combined stream URL for every tracked pair.
    pub fn stream_url(&self) -> String {
        let streams = Symbol::ALL
            .iter()
            .map(|s| format!("{}@ticker", s.binance_pair().to_ascii_lowercase()))
            .join("/");
        format!("{}/stream?streams={}", self.ws_url, streams)
    }

    // Parse one text frame and forward it if it's a new tick.
    // Returns false once the router has gone away.
    async fn handle_text(&self, text: &str, tx: &mpsc::Sender<MarketEvent>) -> bool {
        let envelope = match serde_json::from_str::<StreamEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "ignoring non-ticker frame");
                return true;
            }
        };
        let ticker = envelope.data;
        let Some(symbol) = Symbol::from_binance_pair(&ticker.pair) else {
            trace!(pair = %ticker.pair, stream = %envelope.stream, "untracked pair");
            return true;
        };
        let patch = match ticker.to_patch() {
            Ok(patch) => patch,
            Err(e) => {
                warn!(%symbol, error = %e, "dropping malformed ticker");
                return true;
            }
        };
        if !self.cache.offer(symbol, ticker.event_time, &patch, now_ms()) {
            trace!(%symbol, event_time = ticker.event_time, "duplicate or out-of-order tick");
            return true;
        }
        let event = MarketEvent::Ticker { symbol, patch, event_time_ms: ticker.event_time };
        tx.send(event).await.is_ok()
    }

    // One connection lifetime. Ok(false) means stop for good.
    async fn stream_once(&self, tx: &mpsc::Sender<MarketEvent>, cancel: &CancellationToken) -> AdapterResult<bool> {
        let url = self.stream_url();
        info!(%url, "connecting ticker stream");
        let (ws_stream, _response) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            res = tokio_tungstenite::connect_async(url.as_str()) => res.map_err(|e| AdapterError::Network(e.to_string()))?,
        };
        if tx.send(MarketEvent::StreamStatus { connected: true }).await.is_err() {
            return Ok(false);
        }
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(false);
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !self.handle_text(&text, tx).await {
                            return Ok(false);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "ticker stream closed by server");
                        return Ok(true);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(AdapterError::Network(e.to_string())),
                    None => return Ok(true),
                },
            }
        }
    }
}

#[async_trait::async_trait]
impl StreamAdapter for BinanceAdapter {
    async fn spawn(&self, tx: mpsc::Sender<MarketEvent>, cancel: CancellationToken) {
        loop {
            let keep_going = match self.stream_once(&tx, &cancel).await {
                Ok(keep_going) => keep_going,
                Err(e) => {
                    warn!(error = %e, "ticker stream failed");
                    true
                }
            };
            metrics::gauge!(crate::telemetry::STREAM_CONNECTED).set(0.0);
            if tx.send(MarketEvent::StreamStatus { connected: false }).await.is_err() || !keep_going {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("ticker stream stopped");
    }
}

#[async_trait::async_trait]
impl QuoteSource for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn fetch_quotes(&self, symbols: &[Symbol], _cancel: &CancellationToken) -> AdapterResult<QuoteBatch> {
        let max_age = self.max_tick_age.as_millis() as i64;
        let batch = self.cache.fresh(symbols, now_ms(), max_age);
        if batch.is_empty() {
            return Err(AdapterError::InsufficientData { got: 0, need: symbols.len() });
        }
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl HistorySource for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    #[instrument(level = "debug", skip(self, cancel))]
    async fn fetch_hourly_history(&self, symbol: Symbol, cancel: &CancellationToken) -> AdapterResult<Vec<PricePoint>> {
        let limit = HOURS_PER_WEEK.to_string();
        let req = self
            .client
            .get(format!("{}/api/v3/klines", self.rest_url))
            .query(&[("symbol", symbol.binance_pair()), ("interval", "1h"), ("limit", limit.as_str())]);
        let payload: KlinesResponse = get_json(req, cancel).await?;
        history_from_payload(payload)
    }
}
