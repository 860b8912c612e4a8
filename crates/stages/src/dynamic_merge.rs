//! DynamicMerge - feeds a fan-in stage from a stream of publishers

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

use contracts::{SharedPublisher, SharedSubscription, SourceProducer, StreamError, Subscriber};

use crate::fan_in::FanInStage;

/// Subscribes to an outer publisher of publishers and enrols each one in the
/// fan-in stage
///
/// With `max_concurrency` set, one more publisher is requested each time an
/// enrolled source terminates. The stage may complete only once the outer
/// stream has completed.
pub struct DynamicMerge<T> {
    stage: Weak<FanInStage<T>>,
    max_concurrency: Option<usize>,
    outer: Mutex<Option<SharedSubscription>>,
    producing: AtomicBool,
    received: AtomicU64,
}

impl<T: Send + 'static> DynamicMerge<T> {
    pub fn new(stage: Weak<FanInStage<T>>, max_concurrency: Option<usize>) -> Self {
        Self {
            stage,
            max_concurrency: max_concurrency.map(|c| c.max(1)),
            outer: Mutex::new(None),
            producing: AtomicBool::new(true),
            received: AtomicU64::new(0),
        }
    }

    /// Publishers received from the outer stream
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    fn outer(&self) -> MutexGuard<'_, Option<SharedSubscription>> {
        self.outer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> SourceProducer for DynamicMerge<T> {
    fn is_producing(&self) -> bool {
        self.producing.load(Ordering::SeqCst)
    }

    fn source_terminated(&self) {
        if self.max_concurrency.is_none() || !self.is_producing() {
            return;
        }
        let outer = self.outer().clone();
        if let Some(outer) = outer {
            trace!("Source slot freed, requesting next publisher");
            outer.request(1);
        }
    }

    fn cancel(&self) {
        self.producing.store(false, Ordering::SeqCst);
        let outer = self.outer().take();
        if let Some(outer) = outer {
            debug!(received = self.received(), "DynamicMerge cancelled");
            outer.cancel();
        }
    }
}

impl<T: Send + 'static> Subscriber<SharedPublisher<T>> for DynamicMerge<T> {
    fn on_subscribe(&self, subscription: SharedSubscription) {
        {
            let mut outer = self.outer();
            if outer.is_some() || !self.is_producing() {
                drop(outer);
                subscription.cancel();
                return;
            }
            *outer = Some(subscription.clone());
        }
        let initial = self.max_concurrency.map_or(u64::MAX, |c| c as u64);
        subscription.request(initial);
    }

    fn on_next(&self, publisher: SharedPublisher<T>) {
        self.received.fetch_add(1, Ordering::AcqRel);
        match self.stage.upgrade() {
            Some(stage) => {
                stage.add_publisher(publisher);
            }
            None => self.cancel(),
        }
    }

    fn on_error(&self, error: StreamError) {
        self.producing.store(false, Ordering::SeqCst);
        self.outer().take();
        if let Some(stage) = self.stage.upgrade() {
            stage.fail(error);
        }
    }

    fn on_complete(&self) {
        self.producing.store(false, Ordering::SeqCst);
        self.outer().take();
        debug!(received = self.received(), "Outer publisher stream completed");
        if let Some(stage) = self.stage.upgrade() {
            stage.schedule_completion();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use contracts::{Dispatcher, Publisher};
    use dispatcher::SynchronousDispatcher;
    use sources::{CollectSink, IterSource, Terminal};

    use crate::fan_in::{CompanionState, FanInStage};
    use crate::stage::Stage;

    fn sync() -> Arc<dyn Dispatcher> {
        SynchronousDispatcher::shared()
    }

    fn inner(values: Vec<u32>) -> SharedPublisher<u32> {
        Arc::new(IterSource::new(values))
    }

    #[test]
    fn test_merges_every_inner_publisher() {
        let outer = Arc::new(IterSource::new(vec![
            inner(vec![1, 2]),
            inner(vec![3]),
            inner(vec![4, 5, 6]),
        ]));
        let stage = FanInStage::merge_dynamic(sync(), outer.clone(), None);
        assert_eq!(stage.companion_state(), CompanionState::Done);

        let sink = CollectSink::unbounded();
        stage.subscribe(sink.clone());

        let mut values = sink.values();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
        assert_eq!(outer.requested(), u64::MAX);
    }

    #[test]
    fn test_bounded_concurrency_requests_one_per_terminated_source() {
        let outer = Arc::new(IterSource::new(vec![
            inner(vec![1]),
            inner(vec![2]),
            inner(vec![3]),
        ]));
        let stage = FanInStage::merge_dynamic(sync(), outer.clone(), Some(1));
        assert_eq!(stage.running(), 1);
        assert_eq!(stage.companion_state(), CompanionState::Producing);

        let sink = CollectSink::unbounded();
        stage.subscribe(sink.clone());

        assert_eq!(sink.values(), vec![1, 2, 3]);
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
        // Initial slot plus one per terminated source
        assert_eq!(outer.requested(), 4);
    }

    #[test]
    fn test_open_outer_stream_holds_completion() {
        let outer = Arc::new(IterSource::new(vec![inner(vec![7])]).without_completion());
        let stage = FanInStage::merge_dynamic(sync(), outer.clone(), None);
        let sink = CollectSink::unbounded();
        stage.subscribe(sink.clone());

        assert_eq!(sink.values(), vec![7]);
        assert_eq!(stage.running(), 0);
        assert_eq!(sink.terminal(), None);

        stage.cancel();
        assert!(outer.is_cancelled());
        assert_eq!(stage.companion_state(), CompanionState::Done);
    }

    #[test]
    fn test_outer_error_fails_merge() {
        let outer = Arc::new(
            IterSource::new(vec![inner(vec![1])]).with_error(StreamError::upstream("outer")),
        );
        let stage = FanInStage::merge_dynamic(sync(), outer, None);
        let sink = CollectSink::unbounded();
        stage.subscribe(sink.clone());

        assert_eq!(sink.terminal(), Some(Terminal::Error));
        assert!(matches!(sink.error(), Some(StreamError::Upstream { .. })));
    }
}
