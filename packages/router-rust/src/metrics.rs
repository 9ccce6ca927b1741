//! Message counters exposed by the router.
//!
//! Counts are kept in process-local atomics (readable through
//! [`RouterMetrics::snapshot`]) and mirrored to the `metrics` facade so any
//! installed recorder can export them.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

use crate::error::HandlerError;

/// Point-in-time copy of the router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    pub retried: u64,
    pub panicked: u64,
    pub timed_out: u64,
    pub published: u64,
}

/// Shared counters updated by dispatch loops and middlewares.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    retried: AtomicU64,
    panicked: AtomicU64,
    timed_out: AtomicU64,
    published: AtomicU64,
}

impl RouterMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, handler: &str) {
        self.received.fetch_add(1, Ordering::Relaxed);
        counter!("courier_messages_received_total", "handler" => handler.to_owned()).increment(1);
    }

    pub fn record_acked(&self, handler: &str) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        counter!("courier_messages_acked_total", "handler" => handler.to_owned()).increment(1);
    }

    /// Records a nack together with the error class that caused it.
    pub fn record_nacked(&self, handler: &str, err: &HandlerError) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
        counter!(
            "courier_messages_nacked_total",
            "handler" => handler.to_owned(),
            "reason" => err.kind()
        )
        .increment(1);
    }

    pub fn record_retry(&self, handler: &str) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        counter!("courier_handler_retries_total", "handler" => handler.to_owned()).increment(1);
    }

    /// Counts one recovered panic, whether or not a retry later succeeded.
    pub fn record_panicked(&self, handler: &str) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
        counter!("courier_handler_panics_total", "handler" => handler.to_owned()).increment(1);
    }

    pub fn record_timed_out(&self, handler: &str) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        counter!("courier_handler_timeouts_total", "handler" => handler.to_owned()).increment(1);
    }

    pub fn record_published(&self, handler: &str, count: usize) {
        let count = count as u64;
        self.published.fetch_add(count, Ordering::Relaxed);
        counter!("courier_messages_published_total", "handler" => handler.to_owned())
            .increment(count);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn counters_start_at_zero() {
        assert_eq!(RouterMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn nacks_do_not_double_count_middleware_events() {
        let metrics = RouterMetrics::new();
        metrics.record_received("h");
        metrics.record_panicked("h");
        metrics.record_nacked(
            "h",
            &HandlerError::Panicked {
                message: "boom".to_string(),
            },
        );
        metrics.record_timed_out("h");
        metrics.record_nacked(
            "h",
            &HandlerError::DeadlineExceeded {
                timeout: Duration::from_millis(1),
            },
        );
        metrics.record_nacked("h", &HandlerError::from(anyhow::anyhow!("nope")));

        let snap = metrics.snapshot();
        assert_eq!(snap.received, 1);
        assert_eq!(snap.nacked, 3);
        assert_eq!(snap.panicked, 1);
        assert_eq!(snap.timed_out, 1);
    }

    #[test]
    fn published_counts_messages() {
        let metrics = RouterMetrics::new();
        metrics.record_published("h", 3);
        metrics.record_acked("h");
        metrics.record_retry("h");
        let snap = metrics.snapshot();
        assert_eq!(snap.published, 3);
        assert_eq!(snap.acked, 1);
        assert_eq!(snap.retried, 1);
    }
}
