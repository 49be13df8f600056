// Source: https://docs.coingecko.com/reference/coins-markets
use serde::Deserialize;

// Throttled requests can come back as {"status": {"error_code": 429, ...}}
#[derive(Debug, Deserialize)]
pub struct ApiStatus {
    #[serde(default)]
    pub error_code: Option<u16>,
    #[serde(default)]
    pub error_message: Option<String>,
}

// GET /coins/markets?vs_currency=usd&ids=bitcoin,ethereum
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MarketsResponse {
    Entries(Vec<MarketEntry>),
    Error { status: ApiStatus },
}

#[derive(Debug, Deserialize)]
pub struct MarketEntry {
    pub id: String, // e.g. "bitcoin"
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub market_cap_rank: Option<u32>,
    #[serde(default)]
    pub total_volume: Option<f64>,
    #[serde(default)]
    pub price_change_percentage_24h: Option<f64>,
    #[serde(default)]
    pub price_change_percentage_1h_in_currency: Option<f64>,
    #[serde(default)]
    pub price_change_percentage_7d_in_currency: Option<f64>,
    #[serde(default)]
    pub circulating_supply: Option<f64>,
    #[serde(default)]
    pub max_supply: Option<f64>,
}

// GET /coins/{id}/market_chart?vs_currency=usd&days=7
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MarketChartResponse {
    Chart { prices: Vec<(f64, f64)> }, // (timestamp ms, price)
    Error { status: ApiStatus },
}
