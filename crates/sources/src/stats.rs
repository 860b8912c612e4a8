//! Source counters

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Demand and emission counters shared by every subscription of a source
#[derive(Debug, Default)]
pub struct SourceStats {
    /// Total demand requested, saturating
    requested: AtomicU64,

    /// Elements emitted
    emitted: AtomicU64,

    /// Some subscription was cancelled
    cancelled: AtomicBool,
}

impl SourceStats {
    /// Create new stats instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request
    pub fn record_requested(&self, n: u64) {
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_add(n))
            });
    }

    /// Record an emitted element
    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a cancellation
    pub fn record_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Get snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requested: self.requested(),
            emitted: self.emitted(),
            cancelled: self.is_cancelled(),
        }
    }
}

/// Point-in-time copy of [`SourceStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requested: u64,
    pub emitted: u64,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_saturates() {
        let stats = SourceStats::new();
        stats.record_requested(u64::MAX - 1);
        stats.record_requested(5);
        assert_eq!(stats.requested(), u64::MAX);
        assert!(!stats.snapshot().cancelled);
    }
}
