// Two independent refresh timers feeding the router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::market_data::types::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Price refresh.
    Fast,
    /// Chart refresh.
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Armed,
    Firing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    PriceTick {
        fired_at_ms: i64,
        firing: u64,
        /// Set on every Nth firing: also poll the REST quote sources.
        poll_quotes: bool,
    },
    ChartTick {
        fired_at_ms: i64,
        firing: u64,
    },
    /// The timer's settle delay elapsed and its dirty flag dropped.
    Settled {
        kind: TimerKind,
    },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub fast_interval: Duration,
    pub fast_settle: Duration,
    pub slow_interval: Duration,
    pub slow_settle: Duration,
    /// A REST quote poll rides along with every Nth fast firing. 0 disables it.
    pub quote_poll_every: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_millis(1_500),
            fast_settle: Duration::from_millis(100),
            slow_interval: Duration::from_secs(3_600),
            slow_settle: Duration::from_secs(1),
            quote_poll_every: 20,
        }
    }
}

/// "Refresh in progress" indicators, raised when a timer fires and lowered
/// after its settle delay.
#[derive(Debug, Clone, Default)]
pub struct RefreshFlags {
    price_dirty: Arc<AtomicBool>,
    chart_dirty: Arc<AtomicBool>,
}

impl RefreshFlags {
    pub fn price_dirty(&self) -> bool {
        self.price_dirty.load(Ordering::Acquire)
    }

    pub fn chart_dirty(&self) -> bool {
        self.chart_dirty.load(Ordering::Acquire)
    }

    fn for_kind(&self, kind: TimerKind) -> Arc<AtomicBool> {
        match kind {
            TimerKind::Fast => Arc::clone(&self.price_dirty),
            TimerKind::Slow => Arc::clone(&self.chart_dirty),
        }
    }
}

// State is tagged with the generation of the task that owns the slot.
type SlotState = (u64, TimerState);

struct TimerSlot {
    state: Arc<watch::Sender<SlotState>>,
    generation: u64,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    fn new() -> Self {
        let (state, _) = watch::channel((0, TimerState::Idle));
        Self { state: Arc::new(state), generation: 0, cancel: None, handle: None }
    }
}

struct TimerTask {
    kind: TimerKind,
    period: Duration,
    settle: Duration,
    poll_every: u64,
    tx: mpsc::Sender<SchedulerEvent>,
    cancel: CancellationToken,
    generation: u64,
    state: Arc<watch::Sender<SlotState>>,
    dirty: Arc<AtomicBool>,
}

impl TimerTask {
    // Writes from a task that a restart already replaced are dropped. The
    // flag is stored under the watch lock so it cannot interleave with one.
    fn set(&self, state: TimerState, dirty: bool) {
        self.state.send_if_modified(|cur| {
            if cur.0 != self.generation {
                return false;
            }
            self.dirty.store(dirty, Ordering::Release);
            cur.1 = state;
            true
        });
    }

    async fn send(&self, event: SchedulerEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.tx.send(event) => res.is_ok(),
        }
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut firing: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            firing += 1;
            self.set(TimerState::Firing, true);
            let fired_at_ms = now_ms();
            let event = match self.kind {
                TimerKind::Fast => SchedulerEvent::PriceTick {
                    fired_at_ms,
                    firing,
                    poll_quotes: self.poll_every > 0 && firing % self.poll_every == 0,
                },
                TimerKind::Slow => SchedulerEvent::ChartTick { fired_at_ms, firing },
            };
            trace!(kind = ?self.kind, firing, "timer fired");

            if !self.send(event).await {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settle) => {}
            }
            self.set(TimerState::Armed, false);
            if !self.send(SchedulerEvent::Settled { kind: self.kind }).await {
                break;
            }
        }

        self.set(TimerState::Idle, false);
        debug!(kind = ?self.kind, firings = firing, "timer stopped");
    }
}

pub struct LiveScheduler {
    config: SchedulerConfig,
    parent: CancellationToken,
    flags: RefreshFlags,
    fast: TimerSlot,
    slow: TimerSlot,
}

impl LiveScheduler {
    /// Timers run on child tokens of `parent`, so cancelling it stops both.
    pub fn new(config: SchedulerConfig, parent: &CancellationToken) -> Self {
        Self {
            config,
            parent: parent.clone(),
            flags: RefreshFlags::default(),
            fast: TimerSlot::new(),
            slow: TimerSlot::new(),
        }
    }

    fn slot(&mut self, kind: TimerKind) -> &mut TimerSlot {
        match kind {
            TimerKind::Fast => &mut self.fast,
            TimerKind::Slow => &mut self.slow,
        }
    }

    /// Arm both timers. A timer that is already running is left alone.
    pub fn start(&mut self, tx: mpsc::Sender<SchedulerEvent>) {
        for kind in [TimerKind::Fast, TimerKind::Slow] {
            self.start_timer(kind, tx.clone());
        }
    }

    pub fn start_timer(&mut self, kind: TimerKind, tx: mpsc::Sender<SchedulerEvent>) {
        let (period, settle, poll_every) = match kind {
            TimerKind::Fast => (self.config.fast_interval, self.config.fast_settle, self.config.quote_poll_every),
            TimerKind::Slow => (self.config.slow_interval, self.config.slow_settle, 0),
        };
        let dirty = self.flags.for_kind(kind);
        let cancel = self.parent.child_token();
        let slot = self.slot(kind);
        if slot.cancel.as_ref().is_some_and(|c| !c.is_cancelled()) {
            return;
        }
        slot.generation += 1;
        let generation = slot.generation;
        slot.state.send_modify(|cur| {
            dirty.store(false, Ordering::Release);
            *cur = (generation, TimerState::Armed);
        });
        let task = TimerTask {
            kind,
            period,
            settle,
            poll_every,
            tx,
            cancel: cancel.clone(),
            generation,
            state: Arc::clone(&slot.state),
            dirty,
        };
        slot.cancel = Some(cancel);
        slot.handle = Some(tokio::spawn(task.run()));
        info!(?kind, period_ms = period.as_millis() as u64, "timer armed");
    }

    /// Cancel one timer without waiting for its task to exit. Once the task
    /// observes the cancellation it fires no more.
    pub fn stop_timer(&mut self, kind: TimerKind) {
        if let Some(cancel) = self.slot(kind).cancel.take() {
            cancel.cancel();
        }
    }

    /// Cancel both timers and wait for their tasks. No-op when already stopped.
    pub async fn stop(&mut self) {
        for kind in [TimerKind::Fast, TimerKind::Slow] {
            self.stop_timer(kind);
            if let Some(handle) = self.slot(kind).handle.take() {
                let _ = handle.await;
            }
        }
    }

    pub fn flags(&self) -> RefreshFlags {
        self.flags.clone()
    }

    pub fn state(&self, kind: TimerKind) -> TimerState {
        let slot = match kind {
            TimerKind::Fast => &self.fast,
            TimerKind::Slow => &self.slow,
        };
        slot.state.borrow().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            fast_interval: Duration::from_millis(1_500),
            fast_settle: Duration::from_millis(100),
            slow_interval: Duration::from_secs(3_600),
            slow_settle: Duration::from_secs(1),
            quote_poll_every: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_timer_fires_and_settles() {
        let cancel = CancellationToken::new();
        let mut scheduler = LiveScheduler::new(config(), &cancel);
        let flags = scheduler.flags();
        let (tx, mut rx) = mpsc::channel(16);
        scheduler.start(tx);
        assert_eq!(scheduler.state(TimerKind::Fast), TimerState::Armed);

        let started = Instant::now();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SchedulerEvent::PriceTick { firing: 1, poll_quotes: false, .. }));
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));
        assert!(flags.price_dirty());
        assert!(!flags.chart_dirty());
        assert_eq!(scheduler.state(TimerKind::Fast), TimerState::Firing);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!flags.price_dirty());
        assert_eq!(scheduler.state(TimerKind::Fast), TimerState::Armed);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_nth_fast_firing_polls_quotes() {
        let cancel = CancellationToken::new();
        let mut scheduler = LiveScheduler::new(config(), &cancel);
        let (tx, mut rx) = mpsc::channel(16);
        scheduler.start_timer(TimerKind::Fast, tx);

        let mut polls = Vec::new();
        let mut ticks = 0;
        while ticks < 6 {
            if let Some(SchedulerEvent::PriceTick { firing, poll_quotes, .. }) = rx.recv().await {
                ticks += 1;
                if poll_quotes {
                    polls.push(firing);
                }
            }
        }
        assert_eq!(polls, vec![3, 6]);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_final_and_idempotent() {
        let cancel = CancellationToken::new();
        let mut scheduler = LiveScheduler::new(config(), &cancel);
        let flags = scheduler.flags();
        let (tx, mut rx) = mpsc::channel(16);
        scheduler.start(tx);
        assert!(rx.recv().await.is_some());

        scheduler.stop().await;
        scheduler.stop().await;
        assert_eq!(scheduler.state(TimerKind::Fast), TimerState::Idle);
        assert_eq!(scheduler.state(TimerKind::Slow), TimerState::Idle);
        assert!(!flags.price_dirty());
        // both tasks dropped their senders, nothing else can arrive
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_stop_independently() {
        let cancel = CancellationToken::new();
        let cfg = SchedulerConfig { fast_interval: Duration::from_secs(600), ..config() };
        let mut scheduler = LiveScheduler::new(cfg, &cancel);
        let (tx, mut rx) = mpsc::channel(64);
        scheduler.start(tx);
        scheduler.stop_timer(TimerKind::Slow);

        let window = tokio::time::timeout(Duration::from_secs(7_300), async {
            let mut price_ticks = 0;
            while let Some(event) = rx.recv().await {
                match event {
                    SchedulerEvent::PriceTick { .. } => price_ticks += 1,
                    SchedulerEvent::ChartTick { .. } => panic!("stopped timer fired"),
                    SchedulerEvent::Settled { kind } => assert_eq!(kind, TimerKind::Fast),
                }
            }
            price_ticks
        })
        .await;
        // the fast timer keeps the channel open, so the window always times out
        assert!(window.is_err());
        assert_eq!(scheduler.state(TimerKind::Slow), TimerState::Idle);
        assert_ne!(scheduler.state(TimerKind::Fast), TimerState::Idle);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_follows_each_firing() {
        let cancel = CancellationToken::new();
        let mut scheduler = LiveScheduler::new(config(), &cancel);
        let (tx, mut rx) = mpsc::channel(16);
        scheduler.start_timer(TimerKind::Fast, tx);

        let started = Instant::now();
        for firing in 1..=2 {
            assert!(matches!(rx.recv().await, Some(SchedulerEvent::PriceTick { firing: f, .. }) if f == firing));
            assert_eq!(rx.recv().await, Some(SchedulerEvent::Settled { kind: TimerKind::Fast }));
        }
        assert_eq!(started.elapsed(), Duration::from_millis(3_100));
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_is_not_clobbered_by_old_task() {
        let cancel = CancellationToken::new();
        let mut scheduler = LiveScheduler::new(config(), &cancel);
        let flags = scheduler.flags();
        let (tx, mut rx) = mpsc::channel(16);
        scheduler.start_timer(TimerKind::Fast, tx.clone());
        assert!(matches!(rx.recv().await, Some(SchedulerEvent::PriceTick { firing: 1, .. })));
        assert!(flags.price_dirty());

        // restart while the old task is still in its settle delay
        scheduler.stop_timer(TimerKind::Fast);
        scheduler.start_timer(TimerKind::Fast, tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.state(TimerKind::Fast), TimerState::Armed);
        assert!(!flags.price_dirty());

        // first firing of the new task
        assert!(matches!(rx.recv().await, Some(SchedulerEvent::PriceTick { firing: 1, .. })));
        assert!(flags.price_dirty());
        assert_eq!(scheduler.state(TimerKind::Fast), TimerState::Firing);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_timers() {
        let cancel = CancellationToken::new();
        let mut scheduler = LiveScheduler::new(config(), &cancel);
        let (tx, mut rx) = mpsc::channel(16);
        scheduler.start(tx);
        cancel.cancel();
        assert!(rx.recv().await.is_none());
        scheduler.stop().await;
        assert_eq!(scheduler.state(TimerKind::Fast), TimerState::Idle);
    }
}
