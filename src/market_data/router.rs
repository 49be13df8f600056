// Router owns the market state and applies fetch results, ticker events and
// timer ticks to it. Readers get immutable copies through a watch channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::market_data::adapters::MarketEvent;
use crate::market_data::currency::CurrencyContext;
use crate::market_data::fallback::{FallbackChain, ResolveError, ResolvedHistory, ResolvedQuotes};
use crate::market_data::market_state::{ApplyOutcome, DetailedSeries, MarketError, MarketSnapshot, MarketState};
use crate::market_data::normaliser::normalise_hourly;
use crate::market_data::scheduler::{SchedulerEvent, TimerKind};
use crate::market_data::synthetic::SyntheticGenerator;
use crate::market_data::types::{
    now_ms, HourlySeries, LoadStatus, Provenance, QuoteChannel, QuoteUpdate, Seq, Symbol,
};
use crate::telemetry;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Max relative move applied to idle prices on each price tick.
    pub price_jitter: f64,
    /// Prices with a real tick younger than this are not jittered.
    pub jitter_stale_after: Duration,
    /// Placeholder data is filled in if nothing has arrived by then.
    pub initial_fallback_delay: Duration,
    pub command_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            price_jitter: 0.005,
            jitter_stale_after: Duration::from_millis(1_500),
            initial_fallback_delay: Duration::from_secs(3),
            command_buffer: 64,
        }
    }
}

pub enum RouterCommand {
    SelectCurrency {
        code: String,
        reply: oneshot::Sender<Result<(), MarketError>>,
    },
    UpdateExchangeRates {
        rates: Vec<(String, f64)>,
        reply: oneshot::Sender<usize>,
    },
    RefreshQuotes,
    RefreshCharts,
}

enum FetchOutcome {
    Quotes {
        seq: Seq,
        result: Result<ResolvedQuotes, ResolveError>,
    },
    History {
        seq: Seq,
        symbol: Symbol,
        result: Result<ResolvedHistory, ResolveError>,
    },
}

// Runs the fetch on its own task so a panic inside an adapter still yields an
// outcome and the in-flight marker gets cleared.
async fn supervised<T, F>(fetch: F) -> Result<T, ResolveError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, ResolveError>> + Send + 'static,
{
    match tokio::spawn(fetch).await {
        Ok(result) => result,
        Err(err) => Err(ResolveError::TaskFailed(err.to_string())),
    }
}

/// Cheap, cloneable read/command handle onto a running router.
#[derive(Clone)]
pub struct MarketHandle {
    state: watch::Receiver<Arc<MarketState>>,
    commands: mpsc::Sender<RouterCommand>,
}

impl MarketHandle {
    pub fn get_snapshot(&self, currency: &str) -> Result<MarketSnapshot, MarketError> {
        self.state.borrow().project_for_currency(currency)
    }

    /// Snapshot in whatever currency is currently selected.
    pub fn current_snapshot(&self) -> Result<MarketSnapshot, MarketError> {
        let state = self.state.borrow();
        state.project_for_currency(state.currency().selected())
    }

    pub fn get_detailed_series(&self, symbol: Symbol) -> Option<DetailedSeries> {
        self.state.borrow().detailed_series(symbol)
    }

    pub async fn select_currency(&self, code: &str) -> Result<(), MarketError> {
        let (reply, rx) = oneshot::channel();
        self.send(RouterCommand::SelectCurrency { code: code.to_string(), reply }).await?;
        rx.await.map_err(|_| MarketError::RouterClosed)?
    }

    pub async fn update_exchange_rates(&self, rates: Vec<(String, f64)>) -> Result<usize, MarketError> {
        let (reply, rx) = oneshot::channel();
        self.send(RouterCommand::UpdateExchangeRates { rates, reply }).await?;
        rx.await.map_err(|_| MarketError::RouterClosed)
    }

    pub async fn refresh_quotes(&self) -> Result<(), MarketError> {
        self.send(RouterCommand::RefreshQuotes).await
    }

    pub async fn refresh_charts(&self) -> Result<(), MarketError> {
        self.send(RouterCommand::RefreshCharts).await
    }

    /// Wait for the next published state.
    pub async fn changed(&mut self) -> Result<(), MarketError> {
        self.state.changed().await.map_err(|_| MarketError::RouterClosed)
    }

    async fn send(&self, cmd: RouterCommand) -> Result<(), MarketError> {
        self.commands.send(cmd).await.map_err(|_| MarketError::RouterClosed)
    }
}

pub struct MarketRouter {
    chain: Arc<FallbackChain>,
    state: MarketState,
    config: RouterConfig,
    cancel: CancellationToken,
    synth: SyntheticGenerator,
    published: watch::Sender<Arc<MarketState>>,
    commands: mpsc::Receiver<RouterCommand>,
    outcomes_tx: mpsc::UnboundedSender<FetchOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<FetchOutcome>,
    next_seq: u64,
    quotes_in_flight: bool,
    history_in_flight: AHashSet<Symbol>,
}

impl MarketRouter {
    pub fn new(
        chain: Arc<FallbackChain>,
        currency: CurrencyContext,
        config: RouterConfig,
        cancel: CancellationToken,
    ) -> (Self, MarketHandle) {
        let state = MarketState::new(currency);
        let (published, state_rx) = watch::channel(Arc::new(state.clone()));
        let (cmd_tx, commands) = mpsc::channel(config.command_buffer.max(1));
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let router = Self {
            chain,
            state,
            config,
            cancel,
            synth: SyntheticGenerator::new(),
            published,
            commands,
            outcomes_tx,
            outcomes_rx,
            next_seq: 0,
            quotes_in_flight: false,
            history_in_flight: AHashSet::new(),
        };
        (router, MarketHandle { state: state_rx, commands: cmd_tx })
    }

    /// Drive the state until the cancellation token fires.
    pub async fn run(
        mut self,
        mut scheduler_rx: mpsc::Receiver<SchedulerEvent>,
        mut market_rx: mpsc::Receiver<MarketEvent>,
    ) {
        info!("market router starting");
        self.state.set_status(LoadStatus::Loading);
        self.publish();
        self.spawn_quote_fetch();
        self.spawn_history_fetches();

        let placeholder_timer = tokio::time::sleep(self.config.initial_fallback_delay);
        tokio::pin!(placeholder_timer);
        let mut placeholders_pending = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(outcome) = self.outcomes_rx.recv() => self.on_outcome(outcome),
                Some(event) = market_rx.recv() => self.on_market_event(event),
                Some(tick) = scheduler_rx.recv() => self.on_tick(tick),
                Some(cmd) = self.commands.recv() => self.on_command(cmd),
                _ = &mut placeholder_timer, if placeholders_pending => {
                    placeholders_pending = false;
                    self.fill_placeholders();
                }
                else => break,
            }
        }
        info!("market router stopped");
    }

    fn next_seq(&mut self) -> Seq {
        self.next_seq += 1;
        Seq(self.next_seq)
    }

    fn publish(&self) {
        self.published.send_replace(Arc::new(self.state.clone()));
    }

    fn spawn_quote_fetch(&mut self) {
        if self.quotes_in_flight {
            debug!("quote fetch already in flight");
            return;
        }
        self.quotes_in_flight = true;
        let seq = self.next_seq();
        let chain = Arc::clone(&self.chain);
        let cancel = self.cancel.child_token();
        let tx = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let result = supervised(async move { chain.resolve_quotes(&Symbol::ALL, &cancel).await }).await;
            let _ = tx.send(FetchOutcome::Quotes { seq, result });
        });
    }

    fn spawn_history_fetches(&mut self) {
        let now = now_ms();
        for symbol in Symbol::ALL {
            if !self.history_in_flight.insert(symbol) {
                continue;
            }
            let seq = self.next_seq();
            let chain = Arc::clone(&self.chain);
            let cancel = self.cancel.child_token();
            let tx = self.outcomes_tx.clone();
            tokio::spawn(async move {
                let result =
                    supervised(async move { chain.resolve_hourly_history(symbol, now, &cancel).await }).await;
                let _ = tx.send(FetchOutcome::History { seq, symbol, result });
            });
        }
    }

    fn count_stale(outcome: ApplyOutcome, channel: &'static str) {
        if outcome == ApplyOutcome::Stale {
            metrics::counter!(telemetry::STALE_UPDATES, "channel" => channel).increment(1);
        }
    }

    fn mark_ready(&mut self) {
        if matches!(self.state.status(), LoadStatus::Loading | LoadStatus::Idle) {
            self.state.set_status(LoadStatus::Ready);
        }
    }

    // Only the very first load can fail visibly; afterwards old data stays up.
    fn mark_failed(&mut self, err: &ResolveError) {
        if self.state.is_empty() {
            self.state.set_status(LoadStatus::Failed(err.to_string()));
        }
    }

    fn on_outcome(&mut self, outcome: FetchOutcome) {
        let at_ms = now_ms();
        match outcome {
            FetchOutcome::Quotes { seq, result } => {
                self.quotes_in_flight = false;
                match result {
                    Ok(quotes) => {
                        for (symbol, quote) in quotes {
                            let update = QuoteUpdate {
                                seq,
                                channel: QuoteChannel::Rest,
                                provenance: quote.provenance,
                                patch: quote.patch,
                                at_ms,
                            };
                            Self::count_stale(self.state.apply_quote_update(symbol, &update), "rest");
                        }
                        self.mark_ready();
                    }
                    Err(ResolveError::Cancelled) => debug!(seq = seq.0, "quote fetch cancelled"),
                    Err(err) => {
                        warn!(error = %err, "quote resolution failed");
                        self.mark_failed(&err);
                    }
                }
            }
            FetchOutcome::History { seq, symbol, result } => {
                self.history_in_flight.remove(&symbol);
                match result {
                    Ok(history) => {
                        debug!(%symbol, source = history.source, "history arrived");
                        let outcome = self.state.apply_history_update(symbol, seq, history.series, at_ms);
                        Self::count_stale(outcome, "history");
                    }
                    Err(ResolveError::Cancelled) => debug!(%symbol, "history fetch cancelled"),
                    Err(err) => {
                        warn!(%symbol, error = %err, "history resolution failed");
                        self.mark_failed(&err);
                    }
                }
            }
        }
        self.publish();
    }

    fn on_market_event(&mut self, event: MarketEvent) {
        match event {
            MarketEvent::Ticker { symbol, patch, event_time_ms } => {
                // exchange event time orders stream ticks per symbol
                let update = QuoteUpdate {
                    seq: Seq(event_time_ms.max(0) as u64),
                    channel: QuoteChannel::Stream,
                    provenance: Provenance::Live,
                    patch,
                    at_ms: now_ms(),
                };
                Self::count_stale(self.state.apply_quote_update(symbol, &update), "stream");
                self.mark_ready();
            }
            MarketEvent::StreamStatus { connected } => {
                info!(connected, "ticker stream status");
                metrics::gauge!(telemetry::STREAM_CONNECTED).set(if connected { 1.0 } else { 0.0 });
                self.state.set_stream_connected(connected);
            }
        }
        self.publish();
    }

    fn on_tick(&mut self, tick: SchedulerEvent) {
        match tick {
            SchedulerEvent::PriceTick { fired_at_ms, poll_quotes, .. } => {
                let stale_after = self.config.jitter_stale_after.as_millis() as i64;
                let moved = self.state.apply_price_jitter(
                    fired_at_ms,
                    stale_after,
                    self.config.price_jitter,
                    &mut rand::thread_rng(),
                );
                let raised = self.state.set_refresh_flags(Some(true), None);
                if moved > 0 || raised {
                    self.publish();
                }
                if poll_quotes {
                    self.spawn_quote_fetch();
                }
            }
            SchedulerEvent::ChartTick { firing, .. } => {
                debug!(firing, "chart refresh");
                if self.state.set_refresh_flags(None, Some(true)) {
                    self.publish();
                }
                self.spawn_history_fetches();
            }
            SchedulerEvent::Settled { kind } => {
                let lowered = match kind {
                    TimerKind::Fast => self.state.set_refresh_flags(Some(false), None),
                    TimerKind::Slow => self.state.set_refresh_flags(None, Some(false)),
                };
                if lowered {
                    self.publish();
                }
            }
        }
    }

    fn on_command(&mut self, cmd: RouterCommand) {
        match cmd {
            RouterCommand::SelectCurrency { code, reply } => {
                let res = self.state.select_currency(&code);
                if res.is_ok() {
                    info!(currency = %self.state.currency().selected(), "currency selected");
                    self.publish();
                }
                let _ = reply.send(res);
            }
            RouterCommand::UpdateExchangeRates { rates, reply } => {
                let applied = self.state.update_exchange_rates(&rates);
                debug!(applied, offered = rates.len(), "exchange rates updated");
                if applied > 0 {
                    self.publish();
                }
                let _ = reply.send(applied);
            }
            RouterCommand::RefreshQuotes => self.spawn_quote_fetch(),
            RouterCommand::RefreshCharts => self.spawn_history_fetches(),
        }
    }

    // Seeds synthetic data for anything still missing so the dashboard has
    // something to show. Baseline sequence numbers lose to any real result.
    fn fill_placeholders(&mut self) {
        let now = now_ms();
        let mut filled = 0;
        for symbol in Symbol::ALL {
            if !self.state.has_price(symbol) {
                if let Some(patch) = self.synth.quote(symbol) {
                    let update = QuoteUpdate {
                        seq: Seq::BASELINE,
                        channel: QuoteChannel::Rest,
                        provenance: Provenance::Fallback,
                        patch,
                        at_ms: now,
                    };
                    if self.state.apply_quote_update(symbol, &update) == ApplyOutcome::Applied {
                        filled += 1;
                    }
                }
            }
            if self.state.series(symbol).is_none() {
                let points = self
                    .synth
                    .hourly_history(symbol, now)
                    .and_then(|samples| normalise_hourly(&samples, now).ok());
                if let Some(points) = points {
                    let series = HourlySeries::from_hourly(points, Provenance::Fallback);
                    self.state.apply_history_update(symbol, Seq::BASELINE, series, now);
                }
            }
        }
        if filled > 0 {
            info!(filled, "initial fetch slow, showing placeholder data");
        }
        self.mark_ready();
        self.publish();
    }
}
