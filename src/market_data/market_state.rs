use std::collections::BTreeMap;

use ahash::AHashMap;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, trace};

use crate::market_data::currency::CurrencyContext;
use crate::market_data::types::{
    Asset, HourlySeries, LoadStatus, PricePoint, Provenance, QuoteChannel, QuotePatch, QuoteUpdate,
    Seq, Symbol,
};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum MarketError {
    #[error("unknown currency: {0}")]
    UnknownCurrency(String),
    #[error("market router has shut down")]
    RouterClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// An update with a newer sequence number was already applied.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum UpdateChannel {
    Quote(QuoteChannel),
    History,
}

#[derive(Debug, Clone)]
struct AssetEntry {
    asset: Asset,
    quote_provenance: Provenance,
    series: Option<HourlySeries>,
    // last time a real (non-jitter) price landed
    last_tick_ms: Option<i64>,
}

/// Owned store for everything the feed knows. Stored values are USD;
/// conversion only happens in `project_for_currency`.
#[derive(Debug, Clone)]
pub struct MarketState {
    entries: BTreeMap<Symbol, AssetEntry>,
    applied: AHashMap<(Symbol, UpdateChannel), Seq>,
    currency: CurrencyContext,
    last_price_refresh: Option<i64>,
    last_chart_refresh: Option<i64>,
    status: LoadStatus,
    stream_connected: bool,
    price_dirty: bool,
    chart_dirty: bool,
}

impl Default for MarketState {
    fn default() -> Self {
        Self::new(CurrencyContext::default())
    }
}

// Applies the patch, returns whether the price moved.
fn merge_patch(asset: &mut Asset, patch: &QuotePatch) -> bool {
    let mut price_changed = false;
    if let Some(price) = patch.price.filter(|p| p.is_finite() && *p >= 0.0) {
        asset.price = price;
        price_changed = true;
    }
    if let Some(v) = patch.change_1h {
        asset.change_1h = v;
    }
    if let Some(v) = patch.change_24h {
        asset.change_24h = v;
    }
    if let Some(v) = patch.change_7d {
        asset.change_7d = v;
    }
    if let Some(v) = patch.volume_24h {
        asset.volume_24h = v;
    }
    if let Some(v) = patch.circulating_supply {
        asset.circulating_supply = Some(v);
    }
    if let Some(v) = patch.max_supply {
        asset.max_supply = Some(v);
    }
    if let Some(v) = patch.rank {
        asset.rank = v;
    }
    if let Some(v) = patch.market_cap {
        asset.market_cap = v;
    }
    if price_changed {
        recompute_market_cap(asset);
    }
    price_changed
}

fn recompute_market_cap(asset: &mut Asset) {
    if let Some(supply) = asset.circulating_supply {
        asset.market_cap = asset.price * supply;
    }
}

impl MarketState {
    pub fn new(currency: CurrencyContext) -> Self {
        Self {
            entries: BTreeMap::new(),
            applied: AHashMap::new(),
            currency,
            last_price_refresh: None,
            last_chart_refresh: None,
            status: LoadStatus::Idle,
            stream_connected: false,
            price_dirty: false,
            chart_dirty: false,
        }
    }

    fn entry(&mut self, symbol: Symbol) -> &mut AssetEntry {
        self.entries.entry(symbol).or_insert_with(|| AssetEntry {
            asset: Asset::new(symbol),
            quote_provenance: Provenance::Fallback,
            series: None,
            last_tick_ms: None,
        })
    }

    // Records `seq` for the channel unless something newer already landed.
    fn admit(&mut self, symbol: Symbol, channel: UpdateChannel, seq: Seq) -> ApplyOutcome {
        let last = self.applied.entry((symbol, channel)).or_insert(Seq::BASELINE);
        if seq < *last {
            trace!(%symbol, ?channel, seq = seq.0, last = last.0, "dropping stale update");
            return ApplyOutcome::Stale;
        }
        *last = seq;
        ApplyOutcome::Applied
    }

    /// Merge a partial quote into the asset. Fields the patch leaves as `None`
    /// are kept. A price change re-derives market cap from circulating supply.
    pub fn apply_quote_update(&mut self, symbol: Symbol, update: &QuoteUpdate) -> ApplyOutcome {
        if self.admit(symbol, UpdateChannel::Quote(update.channel), update.seq) == ApplyOutcome::Stale {
            return ApplyOutcome::Stale;
        }
        let entry = self.entry(symbol);
        let price_changed = merge_patch(&mut entry.asset, &update.patch);
        if price_changed {
            entry.quote_provenance = update.provenance;
            entry.last_tick_ms = Some(update.at_ms);
        }
        debug!(%symbol, seq = update.seq.0, price = entry.asset.price, "applied quote update");
        if price_changed {
            self.last_price_refresh = Some(update.at_ms);
        }
        ApplyOutcome::Applied
    }

    /// Replace the chart series wholesale.
    pub fn apply_history_update(&mut self, symbol: Symbol, seq: Seq, series: HourlySeries, at_ms: i64) -> ApplyOutcome {
        if self.admit(symbol, UpdateChannel::History, seq) == ApplyOutcome::Stale {
            return ApplyOutcome::Stale;
        }
        debug!(%symbol, seq = seq.0, provenance = ?series.provenance(), "applied history update");
        self.entry(symbol).series = Some(series);
        self.last_chart_refresh = Some(at_ms);
        ApplyOutcome::Applied
    }

    /// Nudge every price that hasn't had a real tick for `stale_after_ms` by a
    /// random factor in `[1 - max_jitter, 1 + max_jitter]`. Returns how many
    /// assets moved.
    pub fn apply_price_jitter<R: Rng>(&mut self, now_ms: i64, stale_after_ms: i64, max_jitter: f64, rng: &mut R) -> usize {
        let mut moved = 0;
        for entry in self.entries.values_mut() {
            let fresh = entry
                .last_tick_ms
                .map(|t| now_ms - t < stale_after_ms)
                .unwrap_or(false);
            if fresh || entry.asset.price <= 0.0 {
                continue;
            }
            let factor = 1.0 + rng.gen_range(-max_jitter..=max_jitter);
            entry.asset.price *= factor;
            recompute_market_cap(&mut entry.asset);
            moved += 1;
        }
        if moved > 0 {
            self.last_price_refresh = Some(now_ms);
        }
        moved
    }

    pub fn asset(&self, symbol: Symbol) -> Option<&Asset> {
        self.entries.get(&symbol).map(|e| &e.asset)
    }

    pub fn series(&self, symbol: Symbol) -> Option<&HourlySeries> {
        self.entries.get(&symbol).and_then(|e| e.series.as_ref())
    }

    pub fn has_price(&self, symbol: Symbol) -> bool {
        self.asset(symbol).map(|a| a.price > 0.0).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self) -> &LoadStatus {
        &self.status
    }

    pub fn set_status(&mut self, status: LoadStatus) {
        self.status = status;
    }

    pub fn set_stream_connected(&mut self, connected: bool) {
        self.stream_connected = connected;
    }

    /// Mirror of the scheduler's refresh flags. Returns whether anything changed.
    pub fn set_refresh_flags(&mut self, price_dirty: Option<bool>, chart_dirty: Option<bool>) -> bool {
        let before = (self.price_dirty, self.chart_dirty);
        self.price_dirty = price_dirty.unwrap_or(self.price_dirty);
        self.chart_dirty = chart_dirty.unwrap_or(self.chart_dirty);
        before != (self.price_dirty, self.chart_dirty)
    }

    pub fn currency(&self) -> &CurrencyContext {
        &self.currency
    }

    pub fn select_currency(&mut self, code: &str) -> Result<(), MarketError> {
        self.currency.select(code)
    }

    pub fn update_exchange_rates(&mut self, rates: &[(String, f64)]) -> usize {
        self.currency
            .update_exchange_rates(rates.iter().map(|(code, rate)| (code.as_str(), *rate)))
    }

    /// Read-only view with every monetary field converted to `code`.
    pub fn project_for_currency(&self, code: &str) -> Result<MarketSnapshot, MarketError> {
        let info = self
            .currency
            .info(code)
            .ok_or_else(|| MarketError::UnknownCurrency(code.trim().to_ascii_uppercase()))?;
        let rate = info.usd_rate;
        let convert = |points: &[PricePoint]| -> Vec<PricePoint> {
            points.iter().map(|p| PricePoint::new(p.ts_ms, p.price * rate)).collect()
        };

        let assets = self
            .entries
            .values()
            .map(|entry| {
                let a = &entry.asset;
                AssetView {
                    symbol: a.symbol,
                    name: a.name.clone(),
                    rank: a.rank,
                    price: a.price * rate,
                    change_1h: a.change_1h,
                    change_24h: a.change_24h,
                    change_7d: a.change_7d,
                    market_cap: a.market_cap * rate,
                    volume_24h: a.volume_24h * rate,
                    circulating_supply: a.circulating_supply,
                    max_supply: a.max_supply,
                    provenance: entry.quote_provenance,
                    chart: entry.series.as_ref().map(|s| ChartView {
                        compact: convert(s.compact()),
                        provenance: s.provenance(),
                    }),
                }
            })
            .collect();

        Ok(MarketSnapshot {
            currency: info.code.clone(),
            currency_symbol: info.symbol.clone(),
            assets,
            last_price_refresh: self.last_price_refresh,
            last_chart_refresh: self.last_chart_refresh,
            status: self.status.clone(),
            stream_connected: self.stream_connected,
            price_dirty: self.price_dirty,
            chart_dirty: self.chart_dirty,
        })
    }

    /// Full 168-point USD series for the detail view.
    pub fn detailed_series(&self, symbol: Symbol) -> Option<DetailedSeries> {
        self.series(symbol).map(|s| DetailedSeries {
            symbol,
            points: s.points().to_vec(),
            provenance: s.provenance(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartView {
    pub compact: Vec<PricePoint>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetView {
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
    /// `Fallback` renders as "estimated".
    pub provenance: Provenance,
    pub chart: Option<ChartView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub currency: String,
    pub currency_symbol: String,
    pub assets: Vec<AssetView>,
    pub last_price_refresh: Option<i64>,
    pub last_chart_refresh: Option<i64>,
    pub status: LoadStatus,
    pub stream_connected: bool,
    /// True between a price timer firing and its settle delay.
    pub price_dirty: bool,
    pub chart_dirty: bool,
}

impl MarketSnapshot {
    pub fn asset(&self, symbol: Symbol) -> Option<&AssetView> {
        self.assets.iter().find(|a| a.symbol == symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedSeries {
    pub symbol: Symbol,
    pub points: Vec<PricePoint>,
    pub provenance: Provenance,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::types::{HOURS_PER_WEEK, HOUR_MS};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rest(seq: u64, patch: QuotePatch) -> QuoteUpdate {
        QuoteUpdate {
            seq: Seq(seq),
            channel: QuoteChannel::Rest,
            provenance: Provenance::Live,
            patch,
            at_ms: 1_000,
        }
    }

    fn flat_series(price: f64, provenance: Provenance) -> HourlySeries {
        let points = (0..HOURS_PER_WEEK as i64)
            .map(|i| PricePoint::new(i * HOUR_MS, price))
            .collect();
        HourlySeries::from_hourly(points, provenance)
    }

    #[test]
    fn test_market_cap_is_exact_product() {
        let mut state = MarketState::default();
        let patch = QuotePatch {
            price: Some(97148.0),
            circulating_supply: Some(19687531.0),
            ..QuotePatch::default()
        };
        state.apply_quote_update(Symbol::BTC, &rest(1, patch));
        assert_eq!(state.asset(Symbol::BTC).unwrap().market_cap, 97148.0 * 19687531.0);
    }

    #[test]
    fn test_partial_patch_keeps_other_fields() {
        let mut state = MarketState::default();
        let full = QuotePatch {
            price: Some(100.0),
            change_24h: Some(2.5),
            volume_24h: Some(5_000.0),
            circulating_supply: Some(10.0),
            ..QuotePatch::default()
        };
        state.apply_quote_update(Symbol::SOL, &rest(1, full));
        state.apply_quote_update(Symbol::SOL, &rest(2, QuotePatch { change_1h: Some(-0.3), ..QuotePatch::default() }));

        let sol = state.asset(Symbol::SOL).unwrap();
        assert_eq!(sol.price, 100.0);
        assert_eq!(sol.change_24h, 2.5);
        assert_eq!(sol.change_1h, -0.3);
        assert_eq!(sol.volume_24h, 5_000.0);
        assert_eq!(sol.market_cap, 1_000.0);
    }

    #[test]
    fn test_later_price_recomputes_from_stored_supply() {
        let mut state = MarketState::default();
        state.apply_quote_update(
            Symbol::ETH,
            &rest(1, QuotePatch { price: Some(10.0), circulating_supply: Some(3.0), ..QuotePatch::default() }),
        );
        state.apply_quote_update(Symbol::ETH, &rest(2, QuotePatch::with_price(20.0)));
        assert_eq!(state.asset(Symbol::ETH).unwrap().market_cap, 60.0);
    }

    #[test]
    fn test_stale_sequence_does_not_regress() {
        let mut state = MarketState::default();
        let b = state.apply_quote_update(Symbol::BTC, &rest(2, QuotePatch::with_price(200.0)));
        let a = state.apply_quote_update(Symbol::BTC, &rest(1, QuotePatch::with_price(100.0)));
        assert_eq!(b, ApplyOutcome::Applied);
        assert_eq!(a, ApplyOutcome::Stale);
        assert_eq!(state.asset(Symbol::BTC).unwrap().price, 200.0);
    }

    #[test]
    fn test_channels_are_guarded_independently() {
        let mut state = MarketState::default();
        state.apply_quote_update(Symbol::BTC, &rest(5, QuotePatch::with_price(1.0)));
        let mut tick = rest(3, QuotePatch::with_price(2.0));
        tick.channel = QuoteChannel::Stream;
        assert_eq!(state.apply_quote_update(Symbol::BTC, &tick), ApplyOutcome::Applied);
        assert_eq!(state.asset(Symbol::BTC).unwrap().price, 2.0);
    }

    #[test]
    fn test_refresh_time_only_moves_with_price() {
        let mut state = MarketState::default();
        state.apply_quote_update(Symbol::BTC, &rest(1, QuotePatch::with_price(10.0)));
        assert_eq!(state.project_for_currency("USD").unwrap().last_price_refresh, Some(1_000));

        let mut rank_only = rest(2, QuotePatch { rank: Some(1), change_7d: Some(3.0), ..QuotePatch::default() });
        rank_only.at_ms = 5_000;
        assert_eq!(state.apply_quote_update(Symbol::BTC, &rank_only), ApplyOutcome::Applied);
        let snapshot = state.project_for_currency("USD").unwrap();
        assert_eq!(snapshot.last_price_refresh, Some(1_000));
        assert_eq!(snapshot.asset(Symbol::BTC).unwrap().change_7d, 3.0);
    }

    #[test]
    fn test_refresh_flags_report_changes() {
        let mut state = MarketState::default();
        assert!(state.set_refresh_flags(Some(true), None));
        assert!(!state.set_refresh_flags(Some(true), None));
        let snapshot = state.project_for_currency("USD").unwrap();
        assert!(snapshot.price_dirty && !snapshot.chart_dirty);
        assert!(state.set_refresh_flags(Some(false), Some(true)));
        let snapshot = state.project_for_currency("USD").unwrap();
        assert!(!snapshot.price_dirty && snapshot.chart_dirty);
    }

    #[test]
    fn test_negative_price_is_ignored() {
        let mut state = MarketState::default();
        state.apply_quote_update(Symbol::ADA, &rest(1, QuotePatch::with_price(0.5)));
        state.apply_quote_update(Symbol::ADA, &rest(2, QuotePatch::with_price(-3.0)));
        assert_eq!(state.asset(Symbol::ADA).unwrap().price, 0.5);
    }

    #[test]
    fn test_history_replaces_series() {
        let mut state = MarketState::default();
        state.apply_history_update(Symbol::ETH, Seq(1), flat_series(1.0, Provenance::Fallback), 10);
        state.apply_history_update(Symbol::ETH, Seq(2), flat_series(2.0, Provenance::Live), 20);
        let series = state.series(Symbol::ETH).unwrap();
        assert_eq!(series.provenance(), Provenance::Live);
        assert!(series.points().iter().all(|p| p.price == 2.0));

        let stale = state.apply_history_update(Symbol::ETH, Seq(1), flat_series(9.0, Provenance::Live), 30);
        assert_eq!(stale, ApplyOutcome::Stale);
        assert_eq!(state.series(Symbol::ETH).unwrap().points()[0].price, 2.0);
    }

    #[test]
    fn test_projection_does_not_mutate_usd_state() {
        let mut state = MarketState::default();
        let patch = QuotePatch {
            price: Some(97148.0),
            circulating_supply: Some(19687531.0),
            volume_24h: Some(1_000.0),
            ..QuotePatch::default()
        };
        state.apply_quote_update(Symbol::BTC, &rest(1, patch));
        state.apply_history_update(Symbol::BTC, Seq(1), flat_series(100.0, Provenance::Live), 1);

        let eur = state.project_for_currency("EUR").unwrap();
        let jpy = state.project_for_currency("JPY").unwrap();

        assert_eq!(state.asset(Symbol::BTC).unwrap().price, 97148.0);
        assert_eq!(state.series(Symbol::BTC).unwrap().points()[0].price, 100.0);

        let btc_eur = eur.asset(Symbol::BTC).unwrap();
        assert_eq!(btc_eur.price, 97148.0 * 0.92);
        assert_eq!(btc_eur.volume_24h, 1_000.0 * 0.92);
        assert_eq!(btc_eur.market_cap, 97148.0 * 19687531.0 * 0.92);
        assert_eq!(btc_eur.chart.as_ref().unwrap().compact.len(), 28);
        assert_eq!(eur.currency_symbol, "€");
        assert_eq!(jpy.asset(Symbol::BTC).unwrap().price, 97148.0 * 149.82);
    }

    #[test]
    fn test_projection_unknown_currency() {
        let state = MarketState::default();
        assert_eq!(
            state.project_for_currency("xyz"),
            Err(MarketError::UnknownCurrency("XYZ".to_string()))
        );
    }

    #[test]
    fn test_jitter_is_bounded_and_skips_fresh_ticks() {
        let mut state = MarketState::default();
        let mut btc = rest(1, QuotePatch { price: Some(100.0), circulating_supply: Some(2.0), ..QuotePatch::default() });
        btc.at_ms = 0;
        state.apply_quote_update(Symbol::BTC, &btc);
        let mut eth = rest(1, QuotePatch::with_price(50.0));
        eth.at_ms = 9_000;
        state.apply_quote_update(Symbol::ETH, &eth);

        let mut rng = StdRng::seed_from_u64(7);
        let moved = state.apply_price_jitter(10_000, 1_500, 0.005, &mut rng);
        assert_eq!(moved, 1);

        let btc = state.asset(Symbol::BTC).unwrap();
        assert!(btc.price >= 99.5 && btc.price <= 100.5);
        assert_eq!(btc.market_cap, btc.price * 2.0);
        assert_eq!(state.asset(Symbol::ETH).unwrap().price, 50.0);
    }

    #[test]
    fn test_detailed_series() {
        let mut state = MarketState::default();
        assert!(state.detailed_series(Symbol::ADA).is_none());
        state.apply_history_update(Symbol::ADA, Seq(1), flat_series(0.4, Provenance::Fallback), 1);
        let detail = state.detailed_series(Symbol::ADA).unwrap();
        assert_eq!(detail.points.len(), 168);
        assert_eq!(detail.provenance, Provenance::Fallback);
    }
}
