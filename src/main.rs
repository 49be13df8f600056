use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use coinpulse_rs::market_data::adapters::binance::BinanceAdapter;
use coinpulse_rs::market_data::adapters::coingecko::CoinGeckoAdapter;
use coinpulse_rs::market_data::adapters::cryptocompare::CryptoCompareAdapter;
use coinpulse_rs::market_data::adapters::{HistorySource, QuoteSource, StreamAdapter};
use coinpulse_rs::market_data::fallback::FallbackChain;
use coinpulse_rs::market_data::router::MarketRouter;
use coinpulse_rs::market_data::scheduler::LiveScheduler;
use coinpulse_rs::{telemetry, MarketSnapshot, Provenance, Settings};

#[derive(Parser, Debug)]
#[command(name = "coinpulse", about = "Live crypto price feed with fallback and hourly charts")]
struct Args {
    /// Display currency (e.g. EUR); overrides `default_currency` from settings
    #[arg(long)]
    currency: Option<String>,

    /// Settings file; defaults to config/coinpulse.toml when present
    #[arg(long)]
    config: Option<PathBuf>,

    /// How often to log the snapshot
    #[arg(long, default_value_t = 5)]
    print_every_secs: u64,
}

fn log_snapshot(snapshot: &MarketSnapshot) {
    for asset in &snapshot.assets {
        let estimated = asset.provenance == Provenance::Fallback;
        let price = format!("{}{:.4}", snapshot.currency_symbol, asset.price);
        let market_cap = format!("{}{:.0}", snapshot.currency_symbol, asset.market_cap);
        info!(
            symbol = %asset.symbol,
            price = %price,
            change_24h = format_args!("{:+.2}%", asset.change_24h),
            market_cap = %market_cap,
            estimated,
            chart_points = asset.chart.as_ref().map(|c| c.compact.len()).unwrap_or(0),
            "asset"
        );
    }
    info!(
        currency = %snapshot.currency,
        status = ?snapshot.status,
        stream = snapshot.stream_connected,
        last_price_refresh = ?snapshot.last_price_refresh,
        "snapshot"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    telemetry::init_tracing(&settings.log_filter);
    telemetry::init_metrics(settings.metrics_port)?;

    let client = reqwest::Client::builder()
        .timeout(settings.http_timeout())
        .gzip(true)
        .build()?;
    let ep = &settings.endpoints;
    let cryptocompare = Arc::new(CryptoCompareAdapter::new(
        client.clone(),
        &ep.cryptocompare_url,
        ep.cryptocompare_api_key.clone(),
    ));
    let coingecko = Arc::new(CoinGeckoAdapter::new(client.clone(), &ep.coingecko_url, ep.coingecko_api_key.clone()));
    let binance = Arc::new(
        BinanceAdapter::new(client, &ep.binance_rest_url, &ep.binance_ws_url)
            .with_stream_timing(settings.stream_reconnect_delay(), settings.max_tick_age()),
    );

    // priority order matters here
    let quote_sources: Vec<Arc<dyn QuoteSource>> = vec![cryptocompare.clone(), binance.clone(), coingecko.clone()];
    let history_sources: Vec<Arc<dyn HistorySource>> = vec![cryptocompare, coingecko, binance.clone()];
    let chain = Arc::new(FallbackChain::new(quote_sources, history_sources, settings.retry_policy()));

    let mut currency = settings.currency_context()?;
    if let Some(code) = &args.currency {
        currency.select(code)?;
    }

    let cancel = CancellationToken::new();
    let (router, handle) = MarketRouter::new(chain, currency, settings.router_config(), cancel.clone());

    let (sched_tx, sched_rx) = mpsc::channel(64);
    let mut scheduler = LiveScheduler::new(settings.scheduler_config(), &cancel);
    scheduler.start(sched_tx);

    let (market_tx, market_rx) = mpsc::channel(1024);
    let stream_task = if settings.stream.enabled {
        let stream_cancel = cancel.child_token();
        let adapter = Arc::clone(&binance);
        Some(tokio::spawn(async move { adapter.spawn(market_tx, stream_cancel).await }))
    } else {
        info!("ticker stream disabled");
        drop(market_tx);
        None
    };
    let router_task = tokio::spawn(router.run(sched_rx, market_rx));

    let mut print_every = tokio::time::interval(Duration::from_secs(args.print_every_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("listening for ctrl-c")?;
                info!("shutting down");
                break;
            }
            _ = print_every.tick() => match handle.current_snapshot() {
                Ok(snapshot) => {
                    log_snapshot(&snapshot);
                    let json = serde_json::to_string(&snapshot)?;
                    debug!(%json, "snapshot json");
                }
                Err(e) => warn!(error = %e, "no snapshot"),
            },
        }
    }

    cancel.cancel();
    scheduler.stop().await;
    router_task.await?;
    if let Some(task) = stream_task {
        task.await?;
    }
    Ok(())
}
