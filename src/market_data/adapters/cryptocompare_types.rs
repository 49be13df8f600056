// Source: https://min-api.cryptocompare.com/documentation
use std::collections::HashMap;

use serde::Deserialize;

// GET /data/pricemultifull?fsyms=BTC,ETH&tsyms=USD
// Error bodies come back with a 200 and {"Response":"Error","Message":...}
#[derive(Debug, Deserialize)]
pub struct PriceMultiFull {
    #[serde(rename = "Response", default)]
    pub response: Option<String>,
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    #[serde(rename = "RAW", default)]
    pub raw: HashMap<String, HashMap<String, RawQuote>>, // fsym -> tsym -> quote
}

#[derive(Debug, Deserialize)]
pub struct RawQuote {
    #[serde(rename = "PRICE", default)]
    pub price: Option<f64>,
    #[serde(rename = "CHANGEPCTHOUR", default)]
    pub change_pct_hour: Option<f64>,
    #[serde(rename = "CHANGEPCT24HOUR", default)]
    pub change_pct_24h: Option<f64>,
    #[serde(rename = "TOTALVOLUME24H", default)]
    pub total_volume_24h: Option<f64>,
    #[serde(rename = "MKTCAP", default)]
    pub market_cap: Option<f64>,
    #[serde(rename = "SUPPLY", default)]
    pub supply: Option<f64>,
    // we ignore the other fields for now
}

// GET /data/v2/histohour?fsym=BTC&tsym=USD&limit=168
#[derive(Debug, Deserialize)]
pub struct HistoHour {
    #[serde(rename = "Response", default)]
    pub response: Option<String>,
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    #[serde(rename = "Data", default)]
    pub data: Option<HistoData>,
}

#[derive(Debug, Deserialize)]
pub struct HistoData {
    #[serde(rename = "Data", default)]
    pub bars: Vec<HistoBar>,
}

#[derive(Debug, Deserialize)]
pub struct HistoBar {
    pub time: i64, // unix seconds
    pub close: f64,
}
