use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::market_data::adapters::retry::RetryPolicy;
use crate::market_data::currency::CurrencyContext;
use crate::market_data::market_state::MarketError;
use crate::market_data::router::RouterConfig;
use crate::market_data::scheduler::SchedulerConfig;

/// Looked up relative to the working directory; missing is fine.
pub const DEFAULT_CONFIG_FILE: &str = "config/coinpulse";
pub const ENV_PREFIX: &str = "COINPULSE";

/// Upstream base URLs and optional API keys.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EndpointSettings {
    pub cryptocompare_url: String,
    pub cryptocompare_api_key: Option<String>,
    pub coingecko_url: String,
    pub coingecko_api_key: Option<String>,
    pub binance_rest_url: String,
    pub binance_ws_url: String,
    pub http_timeout_ms: u64,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            cryptocompare_url: "https://min-api.cryptocompare.com/data".to_string(),
            cryptocompare_api_key: None,
            coingecko_url: "https://api.coingecko.com/api/v3".to_string(),
            coingecko_api_key: None,
            binance_rest_url: "https://api.binance.com".to_string(),
            binance_ws_url: "wss://stream.binance.com:9443".to_string(),
            http_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub rate_limit_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 1_000, rate_limit_factor: 4.0 }
    }
}

/// Refresh timers. `quote_poll_every = 0` turns the periodic REST poll off.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerSettings {
    pub fast_interval_ms: u64,
    pub fast_settle_ms: u64,
    pub slow_interval_ms: u64,
    pub slow_settle_ms: u64,
    pub quote_poll_every: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            fast_interval_ms: 1_500,
            fast_settle_ms: 100,
            slow_interval_ms: 3_600_000,
            slow_settle_ms: 1_000,
            quote_poll_every: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamSettings {
    pub enabled: bool,
    pub reconnect_delay_ms: u64,
    /// Cached ticks older than this aren't served as quotes.
    pub max_tick_age_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self { enabled: true, reconnect_delay_ms: 5_000, max_tick_age_ms: 60_000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RouterSettings {
    pub price_jitter: f64,
    pub initial_fallback_delay_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self { price_jitter: 0.005, initial_fallback_delay_ms: 3_000 }
    }
}

/// Root settings: optional TOML file, then `COINPULSE__SECTION__KEY` env vars.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub endpoints: EndpointSettings,
    pub retry: RetrySettings,
    pub scheduler: SchedulerSettings,
    pub stream: StreamSettings,
    pub router: RouterSettings,
    pub default_currency: String,
    /// Units per USD, merged over the built-in table.
    pub exchange_rates: BTreeMap<String, f64>,
    pub log_filter: String,
    /// Prometheus listener, only used with the `metrics-exporter` feature.
    pub metrics_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoints: EndpointSettings::default(),
            retry: RetrySettings::default(),
            scheduler: SchedulerSettings::default(),
            stream: StreamSettings::default(),
            router: RouterSettings::default(),
            default_currency: "USD".to_string(),
            exchange_rates: BTreeMap::new(),
            log_filter: "info,coinpulse_rs=debug".to_string(),
            metrics_port: 9000,
        }
    }
}

impl Settings {
    /// `path` replaces the default file location and must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            rate_limit_factor: if self.retry.rate_limit_factor.is_finite() {
                self.retry.rate_limit_factor.clamp(1.0, 60.0)
            } else {
                RetrySettings::default().rate_limit_factor
            },
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            fast_interval: Duration::from_millis(s.fast_interval_ms.max(1)),
            fast_settle: Duration::from_millis(s.fast_settle_ms),
            slow_interval: Duration::from_millis(s.slow_interval_ms.max(1)),
            slow_settle: Duration::from_millis(s.slow_settle_ms),
            quote_poll_every: s.quote_poll_every,
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            price_jitter: self.router.price_jitter.clamp(0.0, 0.5),
            jitter_stale_after: Duration::from_millis(self.scheduler.fast_interval_ms),
            initial_fallback_delay: Duration::from_millis(self.router.initial_fallback_delay_ms),
            ..RouterConfig::default()
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.endpoints.http_timeout_ms)
    }

    pub fn stream_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.stream.reconnect_delay_ms)
    }

    pub fn max_tick_age(&self) -> Duration {
        Duration::from_millis(self.stream.max_tick_age_ms)
    }

    /// Built-in currency table with configured rates merged in and the
    /// default currency selected.
    pub fn currency_context(&self) -> Result<CurrencyContext, MarketError> {
        let mut ctx = CurrencyContext::default();
        ctx.update_exchange_rates(self.exchange_rates.iter().map(|(code, rate)| (code.as_str(), *rate)));
        ctx.select(&self.default_currency)?;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_refresh_cadence() {
        let settings = Settings::default();
        let sched = settings.scheduler_config();
        assert_eq!(sched.fast_interval, Duration::from_millis(1_500));
        assert_eq!(sched.slow_interval, Duration::from_secs(3_600));
        assert_eq!(sched.quote_poll_every, 20);
        let retry = settings.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert_eq!(settings.router_config().jitter_stale_after, Duration::from_millis(1_500));
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!("coinpulse-settings-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
default_currency = "gbp"

[retry]
max_attempts = 5

[scheduler]
fast_interval_ms = 2000

[exchange_rates]
EUR = 0.95
SEK = 10.4
"#
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(settings.retry.max_attempts, 5);
        // untouched fields keep their defaults
        assert_eq!(settings.retry.base_delay_ms, 1_000);
        assert_eq!(settings.scheduler.fast_interval_ms, 2_000);
        assert_eq!(settings.endpoints.binance_rest_url, "https://api.binance.com");

        let ctx = settings.currency_context().unwrap();
        assert_eq!(ctx.selected(), "GBP");
        assert_eq!(ctx.rate("EUR"), Some(0.95));
        assert_eq!(ctx.rate("sek"), Some(10.4));
    }

    #[test]
    fn test_rate_limit_factor_is_sanitized() {
        let with_factor = |f: f64| Settings {
            retry: RetrySettings { rate_limit_factor: f, ..RetrySettings::default() },
            ..Settings::default()
        };
        assert_eq!(with_factor(-1.0).retry_policy().rate_limit_factor, 1.0);
        assert_eq!(with_factor(f64::NAN).retry_policy().rate_limit_factor, 4.0);
        assert_eq!(with_factor(1e9).retry_policy().rate_limit_factor, 60.0);
        assert_eq!(with_factor(2.5).retry_policy().rate_limit_factor, 2.5);
        let policy = with_factor(-1.0).retry_policy();
        let delay = policy.backoff(0, &crate::market_data::adapters::AdapterError::RateLimited("429".into()));
        assert!(delay >= Duration::from_millis(900));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let path = std::env::temp_dir().join("coinpulse-definitely-missing.toml");
        assert!(Settings::load(Some(&path)).is_err());
    }

    #[test]
    fn test_unknown_default_currency() {
        let settings = Settings { default_currency: "XXX".into(), ..Settings::default() };
        assert_eq!(settings.currency_context().unwrap_err(), MarketError::UnknownCurrency("XXX".into()));
    }
}
