//! CollectSink - subscriber recording everything it receives

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, trace};

use contracts::{SharedSubscription, StreamError, Subscriber};

/// How a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Complete,
    Error,
}

/// Subscriber that records values and the terminal signal
///
/// Requests `initial_request` on subscribe (nothing when 0); further demand is
/// driven with [`CollectSink::request`].
pub struct CollectSink<T> {
    initial_request: u64,
    values: Mutex<Vec<T>>,
    error: Mutex<Option<StreamError>>,
    subscription: Mutex<Option<SharedSubscription>>,
    signals: AtomicUsize,
    terminal: watch::Sender<Option<Terminal>>,
}

impl<T: Send + 'static> CollectSink<T> {
    /// Sink requesting `n` elements on subscribe
    pub fn with_initial_request(n: u64) -> Arc<Self> {
        let (terminal, _) = watch::channel(None);
        Arc::new(Self {
            initial_request: n,
            values: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            subscription: Mutex::new(None),
            signals: AtomicUsize::new(0),
            terminal,
        })
    }

    /// Sink requesting unbounded demand on subscribe
    pub fn unbounded() -> Arc<Self> {
        Self::with_initial_request(u64::MAX)
    }

    /// Request `n` more elements
    pub fn request(&self, n: u64) {
        if let Some(subscription) = self.current_subscription() {
            subscription.request(n);
        }
    }

    /// Cancel the upstream
    pub fn cancel(&self) {
        if let Some(subscription) = self.current_subscription() {
            subscription.cancel();
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.current_subscription().is_some()
    }

    /// Number of elements received
    pub fn len(&self) -> usize {
        lock(&self.values).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the values received so far
    pub fn take_values(&self) -> Vec<T> {
        std::mem::take(&mut *lock(&self.values))
    }

    /// Total signals received, terminal included
    pub fn signal_count(&self) -> usize {
        self.signals.load(Ordering::Acquire)
    }

    pub fn terminal(&self) -> Option<Terminal> {
        *self.terminal.borrow()
    }

    /// The error the stream failed with
    pub fn error(&self) -> Option<StreamError> {
        lock(&self.error).clone()
    }

    /// Wait until the stream terminates
    pub async fn wait_terminal(&self) -> Terminal {
        let mut rx = self.terminal.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(terminal) = current {
                return terminal;
            }
            // The sender lives in `self`, so this cannot fail while we hold it
            if rx.changed().await.is_err() {
                return Terminal::Error;
            }
        }
    }

    fn current_subscription(&self) -> Option<SharedSubscription> {
        lock(&self.subscription).clone()
    }

    fn finish(&self, terminal: Terminal) {
        self.signals.fetch_add(1, Ordering::AcqRel);
        lock(&self.subscription).take();
        self.terminal.send_replace(Some(terminal));
    }
}

impl<T: Clone + Send + 'static> CollectSink<T> {
    /// Copy of the values received so far
    pub fn values(&self) -> Vec<T> {
        lock(&self.values).clone()
    }
}

impl<T: Send + 'static> Subscriber<T> for CollectSink<T> {
    fn on_subscribe(&self, subscription: SharedSubscription) {
        *lock(&self.subscription) = Some(Arc::clone(&subscription));
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&self, value: T) {
        self.signals.fetch_add(1, Ordering::AcqRel);
        lock(&self.values).push(value);
        trace!("CollectSink received element");
    }

    fn on_error(&self, error: StreamError) {
        debug!(error = %error, "CollectSink received error");
        *lock(&self.error) = Some(error);
        self.finish(Terminal::Error);
    }

    fn on_complete(&self) {
        debug!("CollectSink received completion");
        self.finish(Terminal::Complete);
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
