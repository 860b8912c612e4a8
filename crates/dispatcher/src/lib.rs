//! # Dispatcher
//!
//! Dispatcher and timer implementations consumed by the stages.
//!
//! Provides:
//! - `SynchronousDispatcher`: inline execution
//! - `TailRecurseDispatcher`: inline execution with trampolined nested dispatch
//! - `WorkerDispatcher`: isolated tokio worker with a soft capacity, so a
//!   non-blocking `try_dispatch` can refuse work instead of queuing
//! - `TokioTimer` / `ManualTimer`: repeating schedules with pause/resume/cancel

pub mod inline;
pub mod manual_timer;
pub mod metrics;
pub mod timer;
pub mod worker;

pub use contracts::{DispatchError, Dispatcher, DispatcherKind, Task};
pub use inline::{SynchronousDispatcher, TailRecurseDispatcher};
pub use manual_timer::ManualTimer;
pub use metrics::{DispatcherMetrics, MetricsSnapshot};
pub use timer::{ScheduleState, TokioScheduleHandle, TokioTimer};
pub use worker::WorkerDispatcher;
