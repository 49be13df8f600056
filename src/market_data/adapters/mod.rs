// Shared traits, error taxonomy and event type for upstream price sources

use std::collections::BTreeMap;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::market_data::types::{PricePoint, QuotePatch, Symbol};

/// History with fewer valid points than this is treated as unusable.
pub const MIN_HISTORY_POINTS: usize = 24;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("insufficient data: got {got}, need {need}")]
    InsufficientData { got: usize, need: usize },
    #[error("cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Network(_) | AdapterError::RateLimited(_))
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Network(_) => "network",
            AdapterError::RateLimited(_) => "rate_limited",
            AdapterError::MalformedResponse(_) => "malformed",
            AdapterError::InsufficientData { .. } => "insufficient",
            AdapterError::Cancelled => "cancelled",
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AdapterError::MalformedResponse(err.to_string())
        } else {
            AdapterError::Network(err.to_string())
        }
    }

    fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            AdapterError::RateLimited(status.to_string())
        } else if status.is_server_error() {
            AdapterError::Network(status.to_string())
        } else {
            AdapterError::MalformedResponse(format!("unexpected status {}", status))
        }
    }

    /// Upstream error bodies that arrive with a 2xx status.
    pub(crate) fn from_upstream_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("rate limit") || lower.contains("too many requests") {
            AdapterError::RateLimited(message.to_string())
        } else {
            AdapterError::MalformedResponse(message.to_string())
        }
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Per-symbol partial quotes in the common schema. Symbols an upstream
/// didn't report are simply absent.
pub type QuoteBatch = BTreeMap<Symbol, QuotePatch>;

#[async_trait::async_trait]
pub trait QuoteSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_quotes(&self, symbols: &[Symbol], cancel: &CancellationToken) -> AdapterResult<QuoteBatch>;
}

#[async_trait::async_trait]
pub trait HistorySource: Send + Sync {
    fn name(&self) -> &'static str;
    /// Raw (timestamp ms, close) samples, any order.
    async fn fetch_hourly_history(&self, symbol: Symbol, cancel: &CancellationToken) -> AdapterResult<Vec<PricePoint>>;
}

#[derive(Debug, Clone)]
pub enum MarketEvent {
    // Latest ticker values from the stream, already deduplicated by event time
    Ticker {
        symbol: Symbol,
        patch: QuotePatch,
        event_time_ms: i64,
    },
    StreamStatus {
        connected: bool,
    },
}

#[async_trait::async_trait]
pub trait StreamAdapter {
    // Send events into the router until cancelled; reconnects on its own.
    async fn spawn(&self, tx: mpsc::Sender<MarketEvent>, cancel: CancellationToken);
}

/// Send a GET and decode the JSON body, mapping every failure into the
/// adapter taxonomy. Cancellation wins over an in-flight request.
pub(crate) async fn get_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> AdapterResult<T> {
    let call = async {
        let res = request.send().await.map_err(AdapterError::from_reqwest)?;
        let status = res.status();
        if !status.is_success() {
            return Err(AdapterError::from_status(status));
        }
        let body = res.bytes().await.map_err(AdapterError::from_reqwest)?;
        serde_json::from_slice::<T>(&body).map_err(|e| AdapterError::MalformedResponse(e.to_string()))
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AdapterError::Cancelled),
        res = call => res,
    }
}

pub mod retry;
pub mod cryptocompare;
pub mod cryptocompare_types;
pub mod coingecko;
pub mod coingecko_types;
pub mod binance;
pub mod binance_types;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(AdapterError::Network("reset".into()).is_retryable());
        assert!(AdapterError::RateLimited("429".into()).is_retryable());
        assert!(!AdapterError::MalformedResponse("bad".into()).is_retryable());
        assert!(!AdapterError::InsufficientData { got: 3, need: 24 }.is_retryable());
        assert!(!AdapterError::Cancelled.is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(AdapterError::from_status(StatusCode::TOO_MANY_REQUESTS), AdapterError::RateLimited(_)));
        assert!(matches!(AdapterError::from_status(StatusCode::BAD_GATEWAY), AdapterError::Network(_)));
        assert!(matches!(AdapterError::from_status(StatusCode::NOT_FOUND), AdapterError::MalformedResponse(_)));
    }

    #[test]
    fn test_upstream_message_mapping() {
        assert!(matches!(
            AdapterError::from_upstream_message("You are over your rate limit please upgrade"),
            AdapterError::RateLimited(_)
        ));
        assert!(matches!(
            AdapterError::from_upstream_message("fsym param is invalid"),
            AdapterError::MalformedResponse(_)
        ));
    }
}
