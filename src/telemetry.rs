use tracing_subscriber::EnvFilter;

pub const ADAPTER_FAILURES: &str = "coinpulse_adapter_failures_total";
pub const FALLBACK_SYNTHESIZED: &str = "coinpulse_fallback_synthesized_total";
pub const STALE_UPDATES: &str = "coinpulse_stale_updates_total";
pub const STREAM_CONNECTED: &str = "coinpulse_stream_connected";

pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    // a second init (tests, embedding apps) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init();
}

fn describe() {
    metrics::describe_counter!(ADAPTER_FAILURES, "Adapter calls that failed after retries, by source and kind");
    metrics::describe_counter!(FALLBACK_SYNTHESIZED, "Quotes or histories served from the synthetic generator");
    metrics::describe_counter!(STALE_UPDATES, "Updates dropped by the sequence guard");
    metrics::describe_gauge!(STREAM_CONNECTED, "1 while the ticker stream is connected");
}

#[cfg(feature = "metrics-exporter")]
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;
    describe();
    tracing::info!(port, "prometheus exporter listening on /metrics");
    metrics::gauge!("coinpulse_up").set(1.0);
    Ok(())
}

#[cfg(not(feature = "metrics-exporter"))]
pub fn init_metrics(_port: u16) -> anyhow::Result<()> {
    // no recorder installed, metric macros are no-ops
    describe();
    Ok(())
}
