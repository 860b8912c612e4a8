//! TokioTimer - repeating schedules on the tokio runtime

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use contracts::{ScheduleHandle, Timer, TimerCallback};

/// Pause/cancel flags of one schedule
#[derive(Debug, Default)]
pub struct ScheduleState {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl ScheduleState {
    /// Create a running schedule state
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a tick should run the callback
    pub fn should_fire(&self) -> bool {
        !self.is_paused() && !self.is_cancelled()
    }
}

impl ScheduleHandle for ScheduleState {
    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Handle on a schedule driven by a tokio task
pub struct TokioScheduleHandle {
    state: Arc<ScheduleState>,
    abort: AbortHandle,
}

impl ScheduleHandle for TokioScheduleHandle {
    fn pause(&self) {
        self.state.pause();
    }

    fn resume(&self) {
        self.state.resume();
    }

    fn cancel(&self) {
        self.state.cancel();
        self.abort.abort();
    }

    fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

/// Timer spawning one interval task per schedule
///
/// Missed ticks are skipped rather than bunched up.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    runtime: Handle,
}

impl TokioTimer {
    /// Timer on the current runtime
    ///
    /// Must be called from within a tokio runtime.
    pub fn current() -> Self {
        Self {
            runtime: Handle::current(),
        }
    }

    /// Timer on an explicit runtime
    pub fn with_handle(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, callback: TimerCallback, period: Duration) -> Arc<dyn ScheduleHandle> {
        let state = Arc::new(ScheduleState::new());
        let task_state = Arc::clone(&state);

        let join = self.runtime.spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if task_state.is_cancelled() {
                    break;
                }
                if task_state.should_fire() {
                    trace!(period_ms = period.as_millis() as u64, "timer tick");
                    callback();
                }
            }
            debug!("timer schedule stopped");
        });

        Arc::new(TokioScheduleHandle {
            state,
            abort: join.abort_handle(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn counting_callback() -> (Arc<AtomicU64>, TimerCallback) {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        (count, Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_fires_periodically() {
        let timer = TokioTimer::current();
        let (count, callback) = counting_callback();
        let handle = timer.schedule(callback, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_pause_resume() {
        let timer = TokioTimer::current();
        let (count, callback) = counting_callback();
        let handle = timer.schedule(callback, Duration::from_millis(100));
        handle.pause();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        handle.resume();
        handle.resume();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
