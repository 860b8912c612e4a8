//! Signal - the three events a stage receives from upstream or emits downstream.

use crate::StreamError;

/// Reactive signal
///
/// At most one of `Error` / `Complete` may ever be emitted per stage instance,
/// and no `Next` may follow either.
#[derive(Debug, Clone)]
pub enum Signal<T> {
    /// Element
    Next(T),
    /// Terminal failure
    Error(StreamError),
    /// Terminal success
    Complete,
}

impl<T> Signal<T> {
    /// Returns `true` for `Error` and `Complete`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Next(_) => "next",
            Signal::Error(_) => "error",
            Signal::Complete => "complete",
        }
    }
}
