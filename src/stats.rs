//! Traffic statistics.
//!
//! Sessions count into a local [`StatWindow`] and flush it over a channel on
//! their collection tick. A single aggregator task owns the process-wide
//! totals, merges every window it receives and logs a report on its own
//! tick. Merging is plain addition, so delivery order does not matter.

use crate::codec::PacketKind;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

/// Counters a session accumulates between flushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatWindow {
    pub live: u64,
    pub historical: u64,
    pub acks: u64,
}

impl StatWindow {
    /// Count one received packet.
    pub fn record(&mut self, kind: PacketKind) {
        match kind {
            PacketKind::Live => self.live += 1,
            PacketKind::Historical => self.historical += 1,
        }
    }

    /// Count one acknowledgment sent.
    pub fn record_ack(&mut self) {
        self.acks += 1;
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Totals held by the aggregator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalTotals {
    pub live: u64,
    pub historical: u64,
    pub acks: u64,
}

impl GlobalTotals {
    pub fn merge(&mut self, window: &StatWindow) {
        self.live += window.live;
        self.historical += window.historical;
        self.acks += window.acks;
    }

    /// Packets received of any kind.
    pub fn received(&self) -> u64 {
        self.live + self.historical
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Session side of the stats channel.
#[derive(Debug, Clone)]
pub struct StatsSender {
    tx: mpsc::UnboundedSender<StatWindow>,
}

impl StatsSender {
    /// Send the window to the aggregator and reset it.
    ///
    /// Empty windows are not sent.
    pub fn flush(&self, window: &mut StatWindow) {
        let window = std::mem::take(window);
        if window.is_empty() {
            return;
        }
        if self.tx.send(window).is_err() {
            debug!("Stats aggregator gone, dropping window");
        }
    }
}

/// Single owner of the process-wide totals.
pub struct StatAggregator {
    rx: mpsc::UnboundedReceiver<StatWindow>,
    report_interval: Duration,
    totals: GlobalTotals,
    lifetime: GlobalTotals,
}

/// Create the aggregator and the sender sessions clone from.
pub fn channel(report_interval: Duration) -> (StatsSender, StatAggregator) {
    let (tx, rx) = mpsc::unbounded_channel();
    let aggregator = StatAggregator {
        rx,
        report_interval,
        totals: GlobalTotals::default(),
        lifetime: GlobalTotals::default(),
    };
    (StatsSender { tx }, aggregator)
}

/// Start an aggregator task.
///
/// The task ends once every [`StatsSender`] is dropped and returns the
/// totals accumulated over its whole life.
pub fn spawn(report_interval: Duration) -> (StatsSender, JoinHandle<GlobalTotals>) {
    let (sender, aggregator) = channel(report_interval);
    (sender, tokio::spawn(aggregator.run()))
}

impl StatAggregator {
    pub async fn run(mut self) -> GlobalTotals {
        let mut ticker = self.report_ticker();
        while self.step(&mut ticker).await {}

        if !self.totals.is_empty() {
            self.report();
        }
        info!(
            total = self.lifetime.received(),
            live = self.lifetime.live,
            history = self.lifetime.historical,
            acks = self.lifetime.acks,
            "Stats aggregator stopped"
        );
        self.lifetime
    }

    fn report_ticker(&self) -> Interval {
        let mut ticker = time::interval_at(
            Instant::now() + self.report_interval,
            self.report_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Handle one window or one report tick. False once every sender is gone.
    async fn step(&mut self, ticker: &mut Interval) -> bool {
        tokio::select! {
            window = self.rx.recv() => match window {
                Some(window) => {
                    self.merge(&window);
                    true
                }
                None => false,
            },
            _ = ticker.tick() => {
                self.report();
                true
            }
        }
    }

    /// Next window waiting in the channel, if any.
    #[cfg(test)]
    pub fn try_next(&mut self) -> Option<StatWindow> {
        self.rx.try_recv().ok()
    }

    fn merge(&mut self, window: &StatWindow) {
        self.totals.merge(window);
        self.lifetime.merge(window);
    }

    /// Log the current period and start a new one.
    fn report(&mut self) {
        let totals = std::mem::take(&mut self.totals);
        info!(
            period_secs = self.report_interval.as_secs(),
            total = totals.received(),
            live = totals.live,
            history = totals.historical,
            acks = totals.acks,
            "Traffic report"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(live: u64, historical: u64, acks: u64) -> StatWindow {
        StatWindow {
            live,
            historical,
            acks,
        }
    }

    #[test]
    fn test_merge_is_order_independent() {
        let windows = [window(2, 1, 3), window(0, 4, 4)];
        let expected = GlobalTotals {
            live: 2,
            historical: 5,
            acks: 7,
        };

        let mut forward = GlobalTotals::default();
        windows.iter().for_each(|w| forward.merge(w));
        let mut backward = GlobalTotals::default();
        windows.iter().rev().for_each(|w| backward.merge(w));

        assert_eq!(forward, expected);
        assert_eq!(backward, expected);
        assert_eq!(forward.received(), 7);
    }

    #[test]
    fn test_window_record() {
        let mut w = StatWindow::default();
        w.record(PacketKind::Live);
        w.record(PacketKind::Historical);
        w.record(PacketKind::Historical);
        w.record_ack();
        assert_eq!(w, window(1, 2, 1));
    }

    #[test]
    fn test_flush_resets_window() {
        let (sender, mut aggregator) = channel(Duration::from_secs(60));
        let mut w = window(1, 0, 1);
        sender.flush(&mut w);
        assert!(w.is_empty());
        assert_eq!(aggregator.try_next(), Some(window(1, 0, 1)));

        // Nothing to report, nothing sent.
        sender.flush(&mut w);
        assert_eq!(aggregator.try_next(), None);
    }

    #[test]
    fn test_report_resets_period_totals() {
        let (_sender, mut aggregator) = channel(Duration::from_secs(60));
        aggregator.merge(&window(3, 0, 3));
        aggregator.report();
        aggregator.merge(&window(0, 1, 1));

        assert_eq!(aggregator.totals, GlobalTotals { live: 0, historical: 1, acks: 1 });
        assert_eq!(aggregator.lifetime, GlobalTotals { live: 3, historical: 1, acks: 4 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_tick_starts_new_period() {
        let (sender, mut aggregator) = channel(Duration::from_secs(10));
        let mut ticker = aggregator.report_ticker();
        let start = Instant::now();

        sender.flush(&mut window(2, 1, 3));
        assert!(aggregator.step(&mut ticker).await);
        assert_eq!(aggregator.totals, GlobalTotals { live: 2, historical: 1, acks: 3 });

        // Nothing queued, so the next step is the report tick.
        assert!(aggregator.step(&mut ticker).await);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(aggregator.totals.is_empty());
        assert_eq!(aggregator.lifetime, GlobalTotals { live: 2, historical: 1, acks: 3 });

        sender.flush(&mut window(0, 4, 4));
        assert!(aggregator.step(&mut ticker).await);
        drop(sender);
        assert!(!aggregator.step(&mut ticker).await);

        assert_eq!(aggregator.totals, GlobalTotals { live: 0, historical: 4, acks: 4 });
        assert_eq!(aggregator.lifetime, GlobalTotals { live: 2, historical: 5, acks: 7 });
    }

    #[tokio::test]
    async fn test_aggregator_merges_from_many_senders() {
        let (sender, handle) = spawn(Duration::from_secs(3600));

        let tasks: Vec<_> = [window(2, 1, 3), window(0, 4, 4)]
            .into_iter()
            .map(|mut w| {
                let sender = sender.clone();
                tokio::spawn(async move { sender.flush(&mut w) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        drop(sender);

        let totals = handle.await.unwrap();
        assert_eq!(
            totals,
            GlobalTotals {
                live: 2,
                historical: 5,
                acks: 7
            }
        );
    }
}
