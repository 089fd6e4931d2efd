use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "order_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Pipeline counters, shared across tasks. Lock-free; read via [`snapshot`].
///
/// [`snapshot`]: IngestMetrics::snapshot
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub messages_polled: AtomicU64,
    pub intake_rejected: AtomicU64,
    pub decode_failures: AtomicU64,
    pub validation_failures: AtomicU64,
    pub orders_persisted: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub empty_windows: AtomicU64,
    pub checkpoints_completed: AtomicU64,
    pub checkpoints_failed: AtomicU64,
    pub restarts: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_polled: u64,
    pub intake_rejected: u64,
    pub decode_failures: u64,
    pub validation_failures: u64,
    pub orders_persisted: u64,
    pub batches_flushed: u64,
    pub empty_windows: u64,
    pub checkpoints_completed: u64,
    pub checkpoints_failed: u64,
    pub restarts: u64,
}

impl IngestMetrics {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_polled: self.messages_polled.load(Ordering::Relaxed),
            intake_rejected: self.intake_rejected.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            orders_persisted: self.orders_persisted.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            empty_windows: self.empty_windows.load(Ordering::Relaxed),
            checkpoints_completed: self.checkpoints_completed.load(Ordering::Relaxed),
            checkpoints_failed: self.checkpoints_failed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counter_updates() {
        let metrics = IngestMetrics::default();
        IngestMetrics::add(&metrics.messages_polled, 10);
        IngestMetrics::incr(&metrics.batches_flushed);
        IngestMetrics::incr(&metrics.checkpoints_completed);

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_polled, 10);
        assert_eq!(snap.batches_flushed, 1);
        assert_eq!(snap.checkpoints_completed, 1);
        assert_eq!(snap.decode_failures, 0);
    }
}
