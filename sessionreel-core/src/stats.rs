//! Delivery counters

use std::sync::atomic::{AtomicUsize, Ordering};

/// Delivery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Events accepted into the buffer
    pub events_accepted: usize,
    /// Events dropped because the per-session cap was reached
    pub events_dropped: usize,
    /// Overflow warnings emitted (at most one per session)
    pub overflow_notices: usize,
    /// Batches the collector acknowledged
    pub uploads_ok: usize,
    /// Upload attempts that failed
    pub uploads_failed: usize,
    /// Events handed back to the buffer after a failed upload
    pub events_requeued: usize,
    /// Termination signals sent
    pub termination_signals: usize,
    /// Heartbeats sent
    pub heartbeats: usize,
}

/// Shared, lock-free counters behind [`DeliveryStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    events_accepted: AtomicUsize,
    events_dropped: AtomicUsize,
    overflow_notices: AtomicUsize,
    uploads_ok: AtomicUsize,
    uploads_failed: AtomicUsize,
    events_requeued: AtomicUsize,
    termination_signals: AtomicUsize,
    heartbeats: AtomicUsize,
}

impl StatsRecorder {
    pub(crate) fn event_accepted(&self) {
        self.events_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn overflow_notice(&self) {
        self.overflow_notices.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn upload_ok(&self) {
        self.uploads_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn upload_failed(&self) {
        self.uploads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn requeued(&self, events: usize) {
        self.events_requeued.fetch_add(events, Ordering::Relaxed);
    }

    pub(crate) fn termination_signal(&self) {
        self.termination_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            overflow_notices: self.overflow_notices.load(Ordering::Relaxed),
            uploads_ok: self.uploads_ok.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
            events_requeued: self.events_requeued.load(Ordering::Relaxed),
            termination_signals: self.termination_signals.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
        }
    }
}
