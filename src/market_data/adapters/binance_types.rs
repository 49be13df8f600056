// Source: https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams
use serde::Deserialize;

// Combined stream envelope: {"stream":"btcusdt@ticker","data":{...}}
#[derive(Debug, Deserialize)]
pub struct StreamEnvelope {
    pub stream: String,
    pub data: TickerEvent,
}

// 24hr rolling window ticker. Numbers arrive as decimal strings.
#[derive(Debug, Deserialize)]
pub struct TickerEvent {
    #[serde(rename = "E")]
    pub event_time: i64, // ms
    #[serde(rename = "s")]
    pub pair: String, // e.g. "BTCUSDT"
    #[serde(rename = "c")]
    pub last_price: String,
    #[serde(rename = "p")]
    pub price_change: String, // absolute, 24h
    #[serde(rename = "P")]
    pub price_change_percent: String,
    #[serde(rename = "v")]
    pub base_volume: String,
    #[serde(rename = "q")]
    pub quote_volume: String,
}

// GET /api/v3/klines -> [[open_time, "open", "high", "low", "close", ...], ...]
// Rows are heterogenous arrays, so they're pulled apart by position.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum KlinesResponse {
    Rows(Vec<Vec<serde_json::Value>>),
    Error { code: i64, msg: String },
}

pub const KLINE_OPEN_TIME: usize = 0;
pub const KLINE_CLOSE: usize = 4;
