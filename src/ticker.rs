/// Tick sources driving the sync manager's periodic work.
///
/// The event loop never calls the clock directly. It awaits tick events from
/// two `Ticker`s, one for active-syncer rotation and one for forced
/// historical syncs, so tests can drive time deterministically.
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

/// Pausable source of tick events.
///
/// A ticker starts out stopped. `ticks` pends forever until `resume` is
/// called, and pends again after `stop`. The future returned by `ticks` is
/// cancel-safe: dropping it loses no ticks.
#[async_trait]
pub trait Ticker: Send {
    /// Start (or restart) delivering ticks.
    fn resume(&mut self);

    /// Suspend tick delivery.
    fn stop(&mut self);

    /// Complete at the next tick.
    async fn ticks(&mut self);
}

/// Wall-clock ticker firing at a fixed period.
///
/// The first tick fires one full period after `resume`, not immediately.
/// Ticks missed while the consumer was busy are skipped rather than bursted.
pub struct IntervalTicker {
    period: Duration,
    interval: Option<Interval>,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    fn resume(&mut self) {
        if self.interval.is_some() {
            return;
        }

        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
    }

    fn stop(&mut self) {
        self.interval = None;
    }

    async fn ticks(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

/// Ticker that only fires when explicitly forced.
///
/// Used in tests to trigger rotation and historical syncs on demand, and by
/// operator tooling to force a re-sync outside the regular schedule. Forced
/// ticks are queued while the ticker is stopped and delivered once resumed.
pub struct ForceTicker {
    active: bool,
    forced_tx: mpsc::UnboundedSender<()>,
    forced_rx: mpsc::UnboundedReceiver<()>,
}

impl ForceTicker {
    pub fn new() -> Self {
        let (forced_tx, forced_rx) = mpsc::unbounded_channel();
        Self {
            active: false,
            forced_tx,
            forced_rx,
        }
    }

    /// Handle for forcing ticks from outside the event loop.
    pub fn handle(&self) -> ForceTickHandle {
        ForceTickHandle {
            forced_tx: self.forced_tx.clone(),
        }
    }
}

impl Default for ForceTicker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ticker for ForceTicker {
    fn resume(&mut self) {
        self.active = true;
    }

    fn stop(&mut self) {
        self.active = false;
    }

    async fn ticks(&mut self) {
        if self.active {
            // The ticker keeps its own sender alive, so recv never ends.
            let _ = self.forced_rx.recv().await;
        } else {
            std::future::pending().await
        }
    }
}

/// Cloneable handle delivering forced ticks to a [`ForceTicker`].
#[derive(Clone)]
pub struct ForceTickHandle {
    forced_tx: mpsc::UnboundedSender<()>,
}

impl ForceTickHandle {
    /// Queue one tick.
    pub fn force(&self) {
        let _ = self.forced_tx.send(());
    }
}
