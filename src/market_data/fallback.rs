// Ordered adapter chain with a synthetic last resort.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::market_data::adapters::retry::{with_retry, RetryPolicy};
use crate::market_data::adapters::{AdapterError, HistorySource, QuoteSource, MIN_HISTORY_POINTS};
use crate::market_data::normaliser::{normalise_hourly, sanitize};
use crate::market_data::synthetic::SyntheticGenerator;
use crate::market_data::types::{HourlySeries, Provenance, QuotePatch, Symbol};
use crate::telemetry;

pub const SYNTHETIC_SOURCE: &str = "synthetic";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("resolution cancelled")]
    Cancelled,
    #[error("no data source could produce {0}")]
    Unavailable(Symbol),
    #[error("fetch task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuote {
    pub patch: QuotePatch,
    pub provenance: Provenance,
    pub source: &'static str,
}

pub type ResolvedQuotes = BTreeMap<Symbol, ResolvedQuote>;

#[derive(Debug, Clone)]
pub struct ResolvedHistory {
    pub series: HourlySeries,
    pub source: &'static str,
}

fn record_failure(source: &'static str, err: &AdapterError) {
    metrics::counter!(telemetry::ADAPTER_FAILURES, "source" => source, "kind" => err.kind()).increment(1);
}

pub struct FallbackChain {
    quote_sources: Vec<Arc<dyn QuoteSource>>,
    history_sources: Vec<Arc<dyn HistorySource>>,
    retry: RetryPolicy,
    synth: SyntheticGenerator,
}

impl FallbackChain {
    /// Sources are tried in the order given.
    pub fn new(
        quote_sources: Vec<Arc<dyn QuoteSource>>,
        history_sources: Vec<Arc<dyn HistorySource>>,
        retry: RetryPolicy,
    ) -> Self {
        Self { quote_sources, history_sources, retry, synth: SyntheticGenerator::new() }
    }

    /// One quote per requested symbol. Symbols an adapter leaves out move on
    /// to the next adapter; whatever is still missing at the end is synthesized.
    pub async fn resolve_quotes(
        &self,
        symbols: &[Symbol],
        cancel: &CancellationToken,
    ) -> Result<ResolvedQuotes, ResolveError> {
        if cancel.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        let mut resolved = ResolvedQuotes::new();
        let mut remaining: Vec<Symbol> = symbols.to_vec();
        remaining.sort();
        remaining.dedup();
        let mut failed: Vec<&'static str> = Vec::new();

        for source in &self.quote_sources {
            if remaining.is_empty() {
                break;
            }
            let name = source.name();
            let wanted = remaining.as_slice();
            let src = source.as_ref();
            let outcome = with_retry(&self.retry, name, cancel, move || src.fetch_quotes(wanted, cancel)).await;
            match outcome {
                Ok(batch) => {
                    for (symbol, patch) in batch {
                        if remaining.contains(&symbol) && !resolved.contains_key(&symbol) {
                            resolved.insert(symbol, ResolvedQuote { patch, provenance: Provenance::Live, source: name });
                        }
                    }
                    remaining.retain(|s| !resolved.contains_key(s));
                    debug!(source = name, missing = remaining.len(), "quote batch resolved");
                }
                Err(AdapterError::Cancelled) => return Err(ResolveError::Cancelled),
                Err(err) => {
                    warn!(source = name, error = %err, "quote source failed, trying next");
                    record_failure(name, &err);
                    failed.push(name);
                }
            }
        }
        self.fill_missing_fields(&mut resolved, &failed, cancel).await?;

        for symbol in remaining {
            let patch = self.synth.quote(symbol).ok_or(ResolveError::Unavailable(symbol))?;
            info!(%symbol, "all quote sources failed, using synthetic quote");
            metrics::counter!(telemetry::FALLBACK_SYNTHESIZED, "kind" => "quote").increment(1);
            resolved.insert(
                symbol,
                ResolvedQuote { patch, provenance: Provenance::Fallback, source: SYNTHETIC_SOURCE },
            );
        }
        Ok(resolved)
    }

    // Primary quotes often lack the 7d change and rank. Ask the other sources
    // once, no retries, and only fill fields that are still empty.
    async fn fill_missing_fields(
        &self,
        resolved: &mut ResolvedQuotes,
        failed: &[&'static str],
        cancel: &CancellationToken,
    ) -> Result<(), ResolveError> {
        for source in &self.quote_sources {
            let name = source.name();
            if failed.contains(&name) {
                continue;
            }
            let wanted: Vec<Symbol> = resolved
                .iter()
                .filter(|(_, q)| q.source != name && q.patch.change_7d.is_none())
                .map(|(s, _)| *s)
                .collect();
            if wanted.is_empty() {
                continue;
            }
            match source.fetch_quotes(&wanted, cancel).await {
                Ok(batch) => {
                    let mut filled = 0;
                    for (symbol, extra) in batch {
                        let Some(quote) = resolved.get_mut(&symbol) else { continue };
                        if quote.patch.change_7d.is_none() && extra.change_7d.is_some() {
                            quote.patch.change_7d = extra.change_7d;
                            filled += 1;
                        }
                        if quote.patch.rank.is_none() {
                            quote.patch.rank = extra.rank;
                        }
                    }
                    debug!(source = name, filled, "quote fields supplemented");
                }
                Err(AdapterError::Cancelled) => return Err(ResolveError::Cancelled),
                Err(err) => debug!(source = name, error = %err, "supplementary quote fetch failed"),
            }
        }
        Ok(())
    }

    /// A full week of hourly points for `symbol`, live if any source has at
    /// least a day of usable samples, synthetic otherwise.
    pub async fn resolve_hourly_history(
        &self,
        symbol: Symbol,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<ResolvedHistory, ResolveError> {
        if cancel.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        for source in &self.history_sources {
            let name = source.name();
            let src = source.as_ref();
            let outcome = with_retry(&self.retry, name, cancel, move || src.fetch_hourly_history(symbol, cancel)).await;
            let samples = match outcome {
                Ok(samples) => sanitize(&samples),
                Err(AdapterError::Cancelled) => return Err(ResolveError::Cancelled),
                Err(err) => {
                    warn!(source = name, %symbol, error = %err, "history source failed, trying next");
                    record_failure(name, &err);
                    continue;
                }
            };
            if samples.len() < MIN_HISTORY_POINTS {
                let err = AdapterError::InsufficientData { got: samples.len(), need: MIN_HISTORY_POINTS };
                warn!(source = name, %symbol, error = %err, "history too thin, trying next");
                record_failure(name, &err);
                continue;
            }
            match normalise_hourly(&samples, now_ms) {
                Ok(points) => {
                    debug!(source = name, %symbol, samples = samples.len(), "history resolved");
                    return Ok(ResolvedHistory {
                        series: HourlySeries::from_hourly(points, Provenance::Live),
                        source: name,
                    });
                }
                Err(err) => warn!(source = name, %symbol, error = %err, "history could not be normalised"),
            }
        }

        let samples = self
            .synth
            .hourly_history(symbol, now_ms)
            .ok_or(ResolveError::Unavailable(symbol))?;
        let points = normalise_hourly(&samples, now_ms).map_err(|_| ResolveError::Unavailable(symbol))?;
        info!(%symbol, "all history sources failed, using synthetic series");
        metrics::counter!(telemetry::FALLBACK_SYNTHESIZED, "kind" => "history").increment(1);
        Ok(ResolvedHistory {
            series: HourlySeries::from_hourly(points, Provenance::Fallback),
            source: SYNTHETIC_SOURCE,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::market_data::adapters::{AdapterResult, QuoteBatch};
    use crate::market_data::types::{PricePoint, HOURS_PER_WEEK, HOUR_MS};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const NOW: i64 = 1_709_294_400_000;

    /// Replays scripted results; repeats the last one once the script runs out.
    pub(crate) struct ScriptedQuotes {
        pub name: &'static str,
        pub calls: AtomicU32,
        script: Mutex<VecDeque<AdapterResult<QuoteBatch>>>,
    }

    impl ScriptedQuotes {
        pub(crate) fn new(name: &'static str, script: Vec<AdapterResult<QuoteBatch>>) -> Arc<Self> {
            Arc::new(Self { name, calls: AtomicU32::new(0), script: Mutex::new(script.into()) })
        }
    }

    #[async_trait::async_trait]
    impl QuoteSource for ScriptedQuotes {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_quotes(&self, _symbols: &[Symbol], _cancel: &CancellationToken) -> AdapterResult<QuoteBatch> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap_or(Err(AdapterError::Network("empty script".into())))
            }
        }
    }

    pub(crate) struct ScriptedHistory {
        pub name: &'static str,
        pub calls: AtomicU32,
        result: AdapterResult<Vec<PricePoint>>,
    }

    impl ScriptedHistory {
        pub(crate) fn new(name: &'static str, result: AdapterResult<Vec<PricePoint>>) -> Arc<Self> {
            Arc::new(Self { name, calls: AtomicU32::new(0), result })
        }
    }

    #[async_trait::async_trait]
    impl HistorySource for ScriptedHistory {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_hourly_history(&self, _symbol: Symbol, _cancel: &CancellationToken) -> AdapterResult<Vec<PricePoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(100), rate_limit_factor: 4.0 }
    }

    fn batch(entries: &[(Symbol, f64)]) -> QuoteBatch {
        entries.iter().map(|(s, p)| (*s, QuotePatch::with_price(*p))).collect()
    }

    pub(crate) fn hourly(count: usize, end_ms: i64, price: f64) -> Vec<PricePoint> {
        (0..count)
            .map(|i| PricePoint::new(end_ms - (count - 1 - i) as i64 * HOUR_MS, price + i as f64))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_exhausts_retries_then_secondary_wins() {
        let primary = ScriptedQuotes::new("primary", vec![Err(AdapterError::Network("reset".into()))]);
        let secondary = ScriptedQuotes::new("secondary", vec![Ok(batch(&[(Symbol::BTC, 64_000.0)]))]);
        let chain = FallbackChain::new(vec![primary.clone(), secondary.clone()], vec![], policy());

        let quotes = chain.resolve_quotes(&[Symbol::BTC], &CancellationToken::new()).await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
        let btc = &quotes[&Symbol::BTC];
        assert_eq!(btc.provenance, Provenance::Live);
        assert_eq!(btc.source, "secondary");
        assert_eq!(btc.patch.price, Some(64_000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_symbols_continue_down_the_chain() {
        let primary = ScriptedQuotes::new("primary", vec![Ok(batch(&[(Symbol::BTC, 1.0)]))]);
        let secondary = ScriptedQuotes::new("secondary", vec![Ok(batch(&[(Symbol::BTC, 2.0), (Symbol::ETH, 3.0)]))]);
        let chain = FallbackChain::new(vec![primary, secondary], vec![], policy());

        let quotes = chain
            .resolve_quotes(&[Symbol::BTC, Symbol::ETH, Symbol::SOL], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(quotes[&Symbol::BTC].source, "primary");
        assert_eq!(quotes[&Symbol::BTC].patch.price, Some(1.0));
        assert_eq!(quotes[&Symbol::ETH].source, "secondary");
        assert_eq!(quotes[&Symbol::SOL].provenance, Provenance::Fallback);
        assert_eq!(quotes[&Symbol::SOL].source, SYNTHETIC_SOURCE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_fills_7d_change_and_rank() {
        let primary = ScriptedQuotes::new("primary", vec![Ok(batch(&[(Symbol::BTC, 1.0), (Symbol::ETH, 2.0)]))]);
        let extra = QuotePatch { price: Some(9.0), change_7d: Some(5.5), rank: Some(1), ..QuotePatch::default() };
        let with_7d = QuotePatch { change_7d: Some(-1.0), ..QuotePatch::with_price(2.0) };
        let secondary = ScriptedQuotes::new("secondary", vec![Ok(vec![(Symbol::BTC, extra)].into_iter().collect())]);
        let chain = FallbackChain::new(vec![primary.clone(), secondary.clone()], vec![], policy());

        let quotes = chain.resolve_quotes(&[Symbol::BTC, Symbol::ETH], &CancellationToken::new()).await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
        let btc = &quotes[&Symbol::BTC];
        assert_eq!(btc.source, "primary");
        // price stays with the primary, only empty fields are filled
        assert_eq!(btc.patch.price, Some(1.0));
        assert_eq!(btc.patch.change_7d, Some(5.5));
        assert_eq!(btc.patch.rank, Some(1));
        assert_eq!(quotes[&Symbol::ETH].patch.change_7d, None);

        // nothing missing: no extra call
        let complete = ScriptedQuotes::new("complete", vec![Ok(vec![(Symbol::ETH, with_7d)].into_iter().collect())]);
        let spare = ScriptedQuotes::new("spare", vec![Ok(batch(&[(Symbol::ETH, 3.0)]))]);
        let chain = FallbackChain::new(vec![complete, spare.clone()], vec![], policy());
        chain.resolve_quotes(&[Symbol::ETH], &CancellationToken::new()).await.unwrap();
        assert_eq!(spare.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_symbol_resolves_when_all_sources_fail() {
        let down = ScriptedQuotes::new("down", vec![Err(AdapterError::MalformedResponse("html".into()))]);
        let chain = FallbackChain::new(vec![down.clone()], vec![], policy());
        let quotes = chain.resolve_quotes(&Symbol::ALL, &CancellationToken::new()).await.unwrap();
        assert_eq!(quotes.len(), Symbol::ALL.len());
        assert!(quotes.values().all(|q| q.provenance == Provenance::Fallback && q.patch.price.is_some()));
        // not retryable: one call only
        assert_eq!(down.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let primary = ScriptedQuotes::new("primary", vec![Ok(batch(&[(Symbol::BTC, 1.0)]))]);
        let chain = FallbackChain::new(vec![primary.clone()], vec![], policy());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(chain.resolve_quotes(&[Symbol::BTC], &cancel).await, Err(ResolveError::Cancelled));
        assert_eq!(chain.resolve_hourly_history(Symbol::BTC, NOW, &cancel).await.unwrap_err(), ResolveError::Cancelled);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_all_fail_gives_fallback_week() {
        let chain = FallbackChain::new(
            vec![],
            vec![
                ScriptedHistory::new("a", Err(AdapterError::Network("timeout".into()))),
                ScriptedHistory::new("b", Err(AdapterError::RateLimited("429".into()))),
                ScriptedHistory::new("c", Err(AdapterError::MalformedResponse("bad".into()))),
            ],
            policy(),
        );
        let history = chain.resolve_hourly_history(Symbol::ADA, NOW, &CancellationToken::new()).await.unwrap();
        assert_eq!(history.source, SYNTHETIC_SOURCE);
        let series = history.series;
        assert_eq!(series.provenance(), Provenance::Fallback);
        assert_eq!(series.points().len(), HOURS_PER_WEEK);
        for w in series.points().windows(2) {
            assert_eq!(w[1].ts_ms - w[0].ts_ms, HOUR_MS);
        }
        assert!(series.points().iter().all(|p| p.price > 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_thin_history_falls_through_to_next_source() {
        let thin = ScriptedHistory::new("thin", Ok(hourly(10, NOW, 100.0)));
        let full = ScriptedHistory::new("full", Ok(hourly(HOURS_PER_WEEK, NOW, 100.0)));
        let chain = FallbackChain::new(vec![], vec![thin.clone(), full.clone()], policy());

        let history = chain.resolve_hourly_history(Symbol::ETH, NOW, &CancellationToken::new()).await.unwrap();
        assert_eq!(thin.calls.load(Ordering::SeqCst), 1);
        assert_eq!(history.source, "full");
        assert_eq!(history.series.provenance(), Provenance::Live);
        assert_eq!(history.series.latest(), Some(&PricePoint::new(NOW, 100.0 + (HOURS_PER_WEEK - 1) as f64)));
    }
}
