//! IterSource - cold publisher over an in-memory list

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use contracts::{
    Demand, Publisher, SharedSubscriber, SharedSubscription, StreamError, Subscription,
};

use crate::stats::SourceStats;

/// Emits a fixed list to every subscriber, one element per unit of demand
///
/// After the last element it completes, fails with the configured error, or
/// stays open (`without_completion`). Terminal signals need no demand.
pub struct IterSource<T> {
    name: String,
    items: Arc<[T]>,
    error: Option<StreamError>,
    complete: bool,
    capacity: Option<u64>,
    stats: Arc<SourceStats>,
}

impl<T: Clone + Send + Sync + 'static> IterSource<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            name: "iter".to_string(),
            items: items.into_iter().collect(),
            error: None,
            complete: true,
            capacity: None,
            stats: Arc::new(SourceStats::new()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Fail with `error` after the last element
    pub fn with_error(mut self, error: StreamError) -> Self {
        self.error = Some(error);
        self
    }

    /// Stay open after the last element
    pub fn without_completion(mut self) -> Self {
        self.complete = false;
        self
    }

    /// Declare a bounded capacity
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn stats(&self) -> &Arc<SourceStats> {
        &self.stats
    }

    pub fn requested(&self) -> u64 {
        self.stats.requested()
    }

    pub fn emitted(&self) -> u64 {
        self.stats.emitted()
    }

    pub fn is_cancelled(&self) -> bool {
        self.stats.is_cancelled()
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for IterSource<T> {
    fn subscribe(&self, subscriber: SharedSubscriber<T>) {
        let terminal = match &self.error {
            Some(error) => Some(Err(error.clone())),
            None if self.complete => Some(Ok(())),
            None => None,
        };

        let subscription = Arc::new(IterSubscription {
            name: self.name.clone(),
            items: Arc::clone(&self.items),
            terminal,
            stats: Arc::clone(&self.stats),
            state: Mutex::new(IterState {
                subscriber: Some(Arc::clone(&subscriber)),
                index: 0,
                demand: Demand::NONE,
                done: false,
            }),
            wip: AtomicUsize::new(0),
        });

        debug!(source = %self.name, len = self.items.len(), "IterSource subscribed");
        subscriber.on_subscribe(subscription.clone());
        // An exhausted list terminates without demand
        subscription.drain();
    }

    fn capacity(&self) -> Option<u64> {
        self.capacity
    }
}

struct IterState<T> {
    /// Dropped once terminal to break the subscriber/subscription cycle
    subscriber: Option<SharedSubscriber<T>>,
    index: usize,
    demand: Demand,
    done: bool,
}

enum Emission<T> {
    Next(T),
    Complete,
    Error(StreamError),
}

struct IterSubscription<T> {
    name: String,
    items: Arc<[T]>,
    terminal: Option<Result<(), StreamError>>,
    stats: Arc<SourceStats>,
    state: Mutex<IterState<T>>,
    wip: AtomicUsize,
}

impl<T: Clone + Send + Sync + 'static> IterSubscription<T> {
    fn lock(&self) -> MutexGuard<'_, IterState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            while let Some((subscriber, emission)) = self.poll() {
                match emission {
                    Emission::Next(value) => {
                        self.stats.record_emitted();
                        subscriber.on_next(value);
                    }
                    Emission::Complete => subscriber.on_complete(),
                    Emission::Error(error) => subscriber.on_error(error),
                }
            }

            let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
            missed = previous - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn poll(&self) -> Option<(SharedSubscriber<T>, Emission<T>)> {
        let mut state = self.lock();
        if state.done {
            return None;
        }
        let subscriber = state.subscriber.clone()?;

        if state.index < self.items.len() {
            state.demand = state.demand.consume_one()?;
            let value = self.items[state.index].clone();
            state.index += 1;
            return Some((subscriber, Emission::Next(value)));
        }

        let emission = match self.terminal.as_ref()? {
            Ok(()) => Emission::Complete,
            Err(error) => Emission::Error(error.clone()),
        };
        state.done = true;
        state.subscriber = None;
        trace!(source = %self.name, "IterSource exhausted");
        Some((subscriber, emission))
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription for IterSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            let subscriber = {
                let mut state = self.lock();
                if state.done {
                    return;
                }
                state.done = true;
                state.subscriber.take()
            };
            if let Some(subscriber) = subscriber {
                subscriber.on_error(StreamError::InvalidDemand { requested: 0 });
            }
            return;
        }

        self.stats.record_requested(n);
        {
            let mut state = self.lock();
            state.demand = state.demand.add(n);
        }
        self.drain();
    }

    fn cancel(&self) {
        let mut state = self.lock();
        if !state.done {
            debug!(source = %self.name, emitted = state.index, "IterSource cancelled");
        }
        state.done = true;
        state.subscriber = None;
        self.stats.record_cancelled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectSink, Terminal};

    #[test]
    fn test_emits_only_requested() {
        let source = IterSource::new(vec![1, 2, 3, 4]);
        let sink = CollectSink::with_initial_request(2);
        source.subscribe(sink.clone());

        assert_eq!(sink.values(), vec![1, 2]);
        assert_eq!(sink.terminal(), None);

        sink.request(5);
        assert_eq!(sink.values(), vec![1, 2, 3, 4]);
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
        assert_eq!(source.requested(), 7);
    }

    #[test]
    fn test_empty_list_completes_without_demand() {
        let source = IterSource::<u8>::new(Vec::new());
        let sink = CollectSink::with_initial_request(0);
        source.subscribe(sink.clone());
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
    }

    #[test]
    fn test_error_after_last_element() {
        let source = IterSource::new(vec!["x"]).with_error(StreamError::upstream("gone"));
        let sink = CollectSink::unbounded();
        source.subscribe(sink.clone());

        assert_eq!(sink.values(), vec!["x"]);
        assert_eq!(sink.terminal(), Some(Terminal::Error));
    }

    #[test]
    fn test_cancel_stops_emission() {
        let source = IterSource::new(vec![1, 2, 3]);
        let sink = CollectSink::with_initial_request(1);
        source.subscribe(sink.clone());

        sink.cancel();
        sink.request(10);
        assert_eq!(sink.values(), vec![1]);
        assert!(source.is_cancelled());
        assert_eq!(sink.terminal(), None);
    }

    #[test]
    fn test_cold_source_replays_for_each_subscriber() {
        let source = IterSource::new(vec![1, 2]).with_capacity(2);
        let first = CollectSink::unbounded();
        let second = CollectSink::unbounded();
        source.subscribe(first.clone());
        source.subscribe(second.clone());

        assert_eq!(first.values(), second.values());
        assert_eq!(source.emitted(), 4);
        assert_eq!(Publisher::capacity(&source), Some(2));
    }
}
