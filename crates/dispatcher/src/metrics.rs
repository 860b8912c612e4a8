//! Dispatcher metrics for observability

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Metrics for a single dispatcher
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    /// Tasks accepted but not yet run
    queue_len: AtomicUsize,
    /// Total accepted tasks
    dispatched_count: AtomicU64,
    /// Total tasks run to completion
    completed_count: AtomicU64,
    /// Total tasks that panicked
    failure_count: AtomicU64,
    /// Total `try_dispatch` calls refused for capacity
    rejected_count: AtomicU64,
}

impl DispatcherMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current queue length
    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    /// Set current queue length
    pub fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
    }

    /// Get total dispatched count
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched_count.load(Ordering::Relaxed)
    }

    /// Increment dispatched count
    pub fn inc_dispatched_count(&self) {
        self.dispatched_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get completed count
    pub fn completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    /// Increment completed count
    pub fn inc_completed_count(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get failure count
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Increment failure count
    pub fn inc_failure_count(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get rejected count
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    /// Increment rejected count
    pub fn inc_rejected_count(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_len: self.queue_len(),
            dispatched_count: self.dispatched_count(),
            completed_count: self.completed_count(),
            failure_count: self.failure_count(),
            rejected_count: self.rejected_count(),
        }
    }
}

/// Snapshot of dispatcher metrics (for reporting)
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub queue_len: usize,
    pub dispatched_count: u64,
    pub completed_count: u64,
    pub failure_count: u64,
    pub rejected_count: u64,
}
