//! Client-observable counters.
//!
//! Uses the same `iroh-metrics` counter-group shape the daemon's own
//! ecosystem uses for this kind of ambient observability; this crate has no
//! scrape endpoint of its own, it just exposes running counters for whatever
//! the embedding application wants to report.

use iroh_metrics::{Counter, MetricsGroup};

/// Running counters for one [`crate::Client`] instance.
#[derive(Debug, Default, MetricsGroup)]
pub struct Metrics {
    /// Requests sent to the daemon.
    pub requests_sent: Counter,
    /// Confirmations received from the daemon.
    pub confirmations_received: Counter,
    /// Indications dispatched to subscribers.
    pub indications_dispatched: Counter,
    /// Current number of distinct watch targets with at least one subscriber.
    pub watch_table_size: Counter,
    /// Current number of tracked progress tasks.
    pub progress_table_size: Counter,
    /// Reconnect attempts. This design never reconnects (spec §4.1: "no
    /// reconnect is attempted"); the counter stays at zero and documents that.
    pub reconnects: Counter,
}

impl Metrics {
    /// A fresh, zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request having been sent.
    pub fn record_request_sent(&self) {
        self.requests_sent.inc();
    }

    /// Record one confirmation having been received.
    pub fn record_confirmation_received(&self) {
        self.confirmations_received.inc();
    }

    /// Record one indication having been dispatched to subscribers.
    pub fn record_indication_dispatched(&self) {
        self.indications_dispatched.inc();
    }

    /// Update the watch table size gauge.
    pub fn set_watch_table_size(&self, size: usize) {
        self.watch_table_size.set(size as u64);
    }

    /// Update the progress table size gauge.
    pub fn set_progress_table_size(&self, size: usize) {
        self.progress_table_size.set(size as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        assert_eq!(m.requests_sent.get(), 0);
        assert_eq!(m.reconnects.get(), 0);
    }

    #[test]
    fn record_helpers_increment() {
        let m = Metrics::new();
        m.record_request_sent();
        m.record_request_sent();
        m.record_confirmation_received();
        assert_eq!(m.requests_sent.get(), 2);
        assert_eq!(m.confirmations_received.get(), 1);
    }

    #[test]
    fn gauge_setters_store_latest_value() {
        let m = Metrics::new();
        m.set_watch_table_size(3);
        m.set_watch_table_size(1);
        assert_eq!(m.watch_table_size.get(), 1);
    }
}
