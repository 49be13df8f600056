pub mod config;
pub mod market_data;
pub mod telemetry;

pub use crate::config::Settings;
pub use market_data::market_state::{MarketError, MarketSnapshot};
pub use market_data::router::{MarketHandle, MarketRouter};
pub use market_data::types::{Provenance, Symbol};
