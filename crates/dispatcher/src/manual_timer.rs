//! ManualTimer - deterministic timer driven by explicit ticks

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use contracts::{ScheduleHandle, Timer, TimerCallback};

use crate::timer::ScheduleState;

struct ManualSchedule {
    callback: TimerCallback,
    period: Duration,
    state: Arc<ScheduleState>,
}

/// Timer whose schedules only fire when [`ManualTimer::tick`] is called
#[derive(Default)]
pub struct ManualTimer {
    schedules: Mutex<Vec<ManualSchedule>>,
}

impl ManualTimer {
    /// Create an empty timer
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fire every running schedule once; returns how many fired
    pub fn tick(&self) -> usize {
        let due: Vec<TimerCallback> = self
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.state.should_fire())
            .map(|s| Arc::clone(&s.callback))
            .collect();

        // Callbacks run without the lock so they may schedule again
        for callback in &due {
            callback();
        }
        due.len()
    }

    /// Number of schedules ever registered
    pub fn schedule_count(&self) -> usize {
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Period of the `index`-th schedule
    pub fn period(&self, index: usize) -> Option<Duration> {
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .map(|s| s.period)
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, callback: TimerCallback, period: Duration) -> Arc<dyn ScheduleHandle> {
        let state = Arc::new(ScheduleState::new());
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ManualSchedule {
                callback,
                period,
                state: Arc::clone(&state),
            });
        state
    }
}
