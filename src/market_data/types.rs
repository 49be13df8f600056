// Shared market data types. Every monetary value in here is USD.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub const HOUR_MS: i64 = 3_600_000;
pub const HOURS_PER_WEEK: usize = 168;
/// Every Nth hourly point is kept for the compact chart (28 points per week).
pub const COMPACT_STEP: usize = 6;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The fixed set of tracked assets, declared in market-cap rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Symbol {
    BTC,
    ETH,
    USDT,
    SOL,
    ADA,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown symbol: {0}")]
pub struct UnknownSymbol(pub String);

impl Symbol {
    pub const ALL: [Symbol; 5] = [Symbol::BTC, Symbol::ETH, Symbol::USDT, Symbol::SOL, Symbol::ADA];

    pub fn as_str(&self) -> &'static str {
        match self {
            Symbol::BTC => "BTC",
            Symbol::ETH => "ETH",
            Symbol::USDT => "USDT",
            Symbol::SOL => "SOL",
            Symbol::ADA => "ADA",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Symbol::BTC => "Bitcoin",
            Symbol::ETH => "Ethereum",
            Symbol::USDT => "Tether",
            Symbol::SOL => "Solana",
            Symbol::ADA => "Cardano",
        }
    }

    pub fn coingecko_id(&self) -> &'static str {
        match self {
            Symbol::BTC => "bitcoin",
            Symbol::ETH => "ethereum",
            Symbol::USDT => "tether",
            Symbol::SOL => "solana",
            Symbol::ADA => "cardano",
        }
    }

    pub fn from_coingecko_id(id: &str) -> Option<Symbol> {
        Symbol::ALL.into_iter().find(|s| s.coingecko_id() == id)
    }

    /// Binance spot pair used for both the ticker stream and klines.
    /// Tether can't be quoted against itself, so it trades against BUSD.
    pub fn binance_pair(&self) -> &'static str {
        match self {
            Symbol::BTC => "BTCUSDT",
            Symbol::ETH => "ETHUSDT",
            Symbol::USDT => "USDTBUSD",
            Symbol::SOL => "SOLUSDT",
            Symbol::ADA => "ADAUSDT",
        }
    }

    pub fn from_binance_pair(pair: &str) -> Option<Symbol> {
        Symbol::ALL
            .into_iter()
            .find(|s| s.binance_pair().eq_ignore_ascii_case(pair))
    }

    pub fn max_supply(&self) -> Option<f64> {
        match self {
            Symbol::BTC => Some(21_000_000.0),
            Symbol::ADA => Some(45_000_000_000.0),
            _ => None,
        }
    }

    pub fn default_rank(&self) -> u32 {
        match self {
            Symbol::BTC => 1,
            Symbol::ETH => 2,
            Symbol::USDT => 3,
            Symbol::SOL => 5,
            Symbol::ADA => 9,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Symbol {
    type Err = UnknownSymbol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Symbol::ALL
            .into_iter()
            .find(|sym| sym.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSymbol(s.to_string()))
    }
}

/// Whether a value came from an upstream API or was synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    Live,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub ts_ms: i64,
    pub price: f64,
}

impl PricePoint {
    pub fn new(ts_ms: i64, price: f64) -> Self {
        Self { ts_ms, price }
    }
}

/// Exactly one week of hourly points plus the compact every-6th subset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlySeries {
    points: Vec<PricePoint>,
    compact: Vec<PricePoint>,
    provenance: Provenance,
}

impl HourlySeries {
    /// `points` must already be on the hourly grid (see `normaliser`).
    pub(crate) fn from_hourly(points: Vec<PricePoint>, provenance: Provenance) -> Self {
        debug_assert_eq!(points.len(), HOURS_PER_WEEK);
        let compact = crate::market_data::normaliser::downsample(&points);
        Self { points, compact, provenance }
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn compact(&self) -> &[PricePoint] {
        &self.compact
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn latest(&self) -> Option<&PricePoint> {
        self.points.last()
    }
}

/// Partial quote update. `None` leaves the stored field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuotePatch {
    pub price: Option<f64>,
    pub change_1h: Option<f64>,
    pub change_24h: Option<f64>,
    pub change_7d: Option<f64>,
    pub volume_24h: Option<f64>,
    pub market_cap: Option<f64>,
    pub circulating_supply: Option<f64>,
    pub max_supply: Option<f64>,
    pub rank: Option<u32>,
}

impl QuotePatch {
    pub fn with_price(price: f64) -> Self {
        Self { price: Some(price), ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Asset {
    pub symbol: Symbol,
    pub name: String,
    pub rank: u32,
    pub price: f64,
    pub change_1h: f64,
    pub change_24h: f64,
    pub change_7d: f64,
    pub market_cap: f64,
    pub volume_24h: f64,
    pub circulating_supply: Option<f64>,
    pub max_supply: Option<f64>,
}

impl Asset {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            name: symbol.display_name().to_string(),
            rank: symbol.default_rank(),
            price: 0.0,
            change_1h: 0.0,
            change_24h: 0.0,
            change_7d: 0.0,
            market_cap: 0.0,
            volume_24h: 0.0,
            circulating_supply: None,
            max_supply: symbol.max_supply(),
        }
    }
}

/// Monotonic request/arrival counter used to discard stale results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Seq(pub u64);

impl Seq {
    /// Baseline for placeholder data; any real result outranks it.
    pub const BASELINE: Seq = Seq(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuoteChannel {
    Rest,
    Stream,
}

#[derive(Debug, Clone)]
pub struct QuoteUpdate {
    pub seq: Seq,
    pub channel: QuoteChannel,
    pub provenance: Provenance,
    pub patch: QuotePatch,
    pub at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LoadStatus {
    Idle,
    Loading,
    Ready,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_parsing() {
        assert_eq!("btc".parse::<Symbol>().unwrap(), Symbol::BTC);
        assert_eq!(" ADA ".parse::<Symbol>().unwrap(), Symbol::ADA);
        assert!("DOGE".parse::<Symbol>().is_err());
    }

    #[test]
    fn test_binance_pair_mapping() {
        assert_eq!(Symbol::from_binance_pair("ethusdt"), Some(Symbol::ETH));
        assert_eq!(Symbol::from_binance_pair("USDTBUSD"), Some(Symbol::USDT));
        assert_eq!(Symbol::from_binance_pair("DOGEUSDT"), None);
    }

    #[test]
    fn test_new_asset_carries_static_metadata() {
        let asset = Asset::new(Symbol::BTC);
        assert_eq!(asset.name, "Bitcoin");
        assert_eq!(asset.rank, 1);
        assert_eq!(asset.max_supply, Some(21_000_000.0));
        assert_eq!(asset.price, 0.0);
    }
}
