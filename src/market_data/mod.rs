// Market data module entrypoint
pub mod types;          // symbols, quotes, hourly series
pub mod adapters;       // upstream fetchers (CryptoCompare, CoinGecko, Binance)
pub mod normaliser;     // irregular samples -> fixed hourly grid
pub mod synthetic;      // deterministic last-resort data
pub mod fallback;       // ordered adapter chain with retries
pub mod currency;       // display currency + exchange rates
pub mod market_state;   // owned state, patches, projections
pub mod scheduler;      // fast/slow refresh timers
pub mod router;         // applies everything to the state, serves readers
