//! Timer trait - repeating schedules consumed by time-bounded stages.

use std::sync::Arc;
use std::time::Duration;

/// Callback fired on every tick of a schedule
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Fixed-period scheduler
pub trait Timer: Send + Sync {
    /// Schedule `callback` every `period`. The first tick happens one period from now.
    fn schedule(&self, callback: TimerCallback, period: Duration) -> Arc<dyn ScheduleHandle>;
}

/// Handle on a registered schedule
///
/// All operations are idempotent. A cancelled schedule never fires again and
/// cannot be resumed.
pub trait ScheduleHandle: Send + Sync {
    /// Stop firing until `resume`
    fn pause(&self);

    /// Resume a paused schedule
    fn resume(&self);

    /// Stop the schedule permanently
    fn cancel(&self);

    /// Check if paused
    fn is_paused(&self) -> bool;

    /// Check if cancelled
    fn is_cancelled(&self) -> bool;
}
