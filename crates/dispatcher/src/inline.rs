//! Inline dispatchers - tasks run on the calling thread

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;

use contracts::{DispatchError, Dispatcher, DispatcherKind, Task};

/// Runs every task immediately on the calling thread
///
/// Never saturates: `try_dispatch` behaves like `dispatch`.
#[derive(Debug, Default)]
pub struct SynchronousDispatcher;

impl SynchronousDispatcher {
    /// Shared instance
    pub fn shared() -> Arc<dyn Dispatcher> {
        Arc::new(Self)
    }
}

impl Dispatcher for SynchronousDispatcher {
    fn name(&self) -> &str {
        "synchronous"
    }

    fn kind(&self) -> DispatcherKind {
        DispatcherKind::Synchronous
    }

    fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        task();
        Ok(())
    }

    fn try_dispatch(&self, task: Task) -> Result<(), DispatchError> {
        self.dispatch(task)
    }
}

thread_local! {
    static DRAINING: Cell<bool> = const { Cell::new(false) };
    static DEFERRED: RefCell<VecDeque<Task>> = const { RefCell::new(VecDeque::new()) };
}

/// Resets the draining flag even if a task panics
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        DRAINING.with(|d| d.set(false));
        DEFERRED.with(|q| q.borrow_mut().clear());
    }
}

/// Inline dispatcher that trampolines nested dispatches
///
/// The outermost `dispatch` on a thread runs its task, then drains every task
/// dispatched meanwhile on that thread, in order. Recursive request/emit
/// chains therefore run in constant stack depth.
#[derive(Debug, Default)]
pub struct TailRecurseDispatcher;

impl TailRecurseDispatcher {
    /// Shared instance
    pub fn shared() -> Arc<dyn Dispatcher> {
        Arc::new(Self)
    }
}

impl Dispatcher for TailRecurseDispatcher {
    fn name(&self) -> &str {
        "tail-recurse"
    }

    fn kind(&self) -> DispatcherKind {
        DispatcherKind::TailRecurse
    }

    fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        if DRAINING.with(|d| d.replace(true)) {
            DEFERRED.with(|q| q.borrow_mut().push_back(task));
            return Ok(());
        }

        let _guard = DrainGuard;
        task();
        while let Some(next) = DEFERRED.with(|q| q.borrow_mut().pop_front()) {
            next();
        }
        Ok(())
    }

    fn try_dispatch(&self, task: Task) -> Result<(), DispatchError> {
        self.dispatch(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_synchronous_runs_inline() {
        let dispatcher = SynchronousDispatcher;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        dispatcher.dispatch(Box::new(move || s.lock().unwrap().push(1))).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_tail_recurse_defers_nested_dispatch() {
        let dispatcher = Arc::new(TailRecurseDispatcher);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_dispatcher = Arc::clone(&dispatcher);
        let outer_seen = Arc::clone(&seen);
        dispatcher
            .dispatch(Box::new(move || {
                let nested_seen = Arc::clone(&outer_seen);
                inner_dispatcher
                    .dispatch(Box::new(move || nested_seen.lock().unwrap().push("nested")))
                    .unwrap();
                // Nested task has not run yet
                outer_seen.lock().unwrap().push("outer");
            }))
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["outer", "nested"]);
    }

    #[test]
    fn test_tail_recurse_deep_chain_does_not_overflow() {
        fn chain(dispatcher: Arc<TailRecurseDispatcher>, left: u32, count: Arc<Mutex<u32>>) {
            *count.lock().unwrap() += 1;
            if left == 0 {
                return;
            }
            let next = Arc::clone(&dispatcher);
            dispatcher
                .dispatch(Box::new(move || chain(next, left - 1, count)))
                .unwrap();
        }

        let dispatcher = Arc::new(TailRecurseDispatcher);
        let count = Arc::new(Mutex::new(0));
        let start = Arc::clone(&dispatcher);
        let c = Arc::clone(&count);
        dispatcher
            .dispatch(Box::new(move || chain(start, 100_000, c)))
            .unwrap();
        assert_eq!(*count.lock().unwrap(), 100_001);
    }
}
