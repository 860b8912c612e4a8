//! Dispatcher trait - task execution abstraction consumed by every stage.
//!
//! A dispatcher runs a task either synchronously on the calling thread or
//! asynchronously on a worker. The task closure captures its own payload.

use thiserror::Error;

/// Unit of work handed to a dispatcher
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Execution model of a dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherKind {
    /// Runs every task inline on the calling thread
    Synchronous,
    /// Inline, but nested dispatches are trampolined by the outermost call
    TailRecurse,
    /// Hands tasks to a worker
    Worker,
}

/// Dispatch failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Non-blocking dispatch refused because the dispatcher is saturated
    #[error("dispatcher '{dispatcher}' has insufficient capacity")]
    InsufficientCapacity { dispatcher: String },

    /// Dispatcher no longer accepts tasks
    #[error("dispatcher '{dispatcher}' is shut down")]
    Shutdown { dispatcher: String },
}

/// Task executor
pub trait Dispatcher: Send + Sync {
    /// Dispatcher name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Execution model
    fn kind(&self) -> DispatcherKind;

    /// Run `task`, inline or on a worker. May exceed the soft capacity.
    ///
    /// # Errors
    /// Returns `DispatchError::Shutdown` if the dispatcher is stopped.
    fn dispatch(&self, task: Task) -> Result<(), DispatchError>;

    /// Run `task` only if it can be accepted without queuing past capacity.
    ///
    /// # Errors
    /// Returns `DispatchError::InsufficientCapacity` when saturated.
    fn try_dispatch(&self, task: Task) -> Result<(), DispatchError>;

    /// Whether tasks run in the order they were dispatched
    fn supports_ordering(&self) -> bool {
        true
    }
}
