//! BatchStage - count and time bounded windows
//!
//! Responsibilities:
//! - Run the policy hooks for every upstream element
//! - Close the window every `batch_size` elements
//! - Close a non-empty window on each timer tick, without ever blocking on a
//!   saturated dispatcher
//! - Flush the partial window on completion
//! - Turn a failing hook into a terminal error carrying the element

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, instrument, trace, warn};

use contracts::{
    BoxError, DispatchError, Dispatcher, Publisher, ScheduleHandle, SharedSubscriber,
    SharedSubscription, StreamError, Subscriber, Timer,
};
use observability::metrics::{record_batch_flushed, record_timer_flush_dropped, FlushTrigger};

use crate::policy::{BatchCallbacks, Buffer, FirstOfWindow, LastOfWindow, Outbox};
use crate::stage::{Stage, StageCore};

/// Window shape and enabled hooks
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Stage name (used for logging/metrics)
    pub name: String,
    /// Elements per window, > 0
    pub batch_size: usize,
    /// Call `first` on the first element of a window
    pub emit_first: bool,
    /// Call `next` on every element
    pub emit_each: bool,
    /// Call `flush` when a window fills up
    pub emit_flush: bool,
    /// Close non-empty windows on this period
    pub timespan: Option<Duration>,
}

impl BatchConfig {
    /// Count-bounded window with only `flush` enabled
    pub fn new(batch_size: usize) -> Self {
        Self {
            name: "batch".to_string(),
            batch_size,
            emit_first: false,
            emit_each: false,
            emit_flush: true,
            timespan: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timespan(mut self, timespan: Duration) -> Self {
        self.timespan = Some(timespan);
        self
    }

    pub fn with_hooks(mut self, first: bool, each: bool, flush: bool) -> Self {
        self.emit_first = first;
        self.emit_each = each;
        self.emit_flush = flush;
        self
    }

    fn validate(&self, has_timer: bool) -> Result<(), StreamError> {
        if self.batch_size == 0 {
            return Err(StreamError::invalid_argument("batch_size", "must be > 0"));
        }
        match self.timespan {
            Some(timespan) if timespan.is_zero() => Err(StreamError::invalid_argument(
                "timespan",
                "must be > 0 when set",
            )),
            Some(_) if !has_timer => Err(StreamError::invalid_argument(
                "timer",
                "required when a timespan is set",
            )),
            _ => Ok(()),
        }
    }
}

struct Window<P> {
    /// Elements in the open window, always < batch_size between calls
    index: usize,
    policy: P,
    /// No more upstream signals are processed
    closed: bool,
}

/// Groups upstream elements into windows and emits what the policy produces
pub struct BatchStage<T, P: BatchCallbacks<T>> {
    core: StageCore<P::Output>,
    config: BatchConfig,
    window: Mutex<Window<P>>,
    dispatcher: Arc<dyn Dispatcher>,
    schedule: Option<Arc<dyn ScheduleHandle>>,
    schedule_cancelled: AtomicBool,
    me: Weak<Self>,
    _input: PhantomData<fn(T)>,
}

impl<T, P> BatchStage<T, P>
where
    T: Send + Sync + 'static,
    P: BatchCallbacks<T>,
{
    /// Create a stage running `policy`
    ///
    /// With a timespan the timer schedule is registered now and stays paused
    /// until the upstream subscription arrives.
    ///
    /// # Errors
    /// `StreamError::InvalidArgument` for `batch_size == 0`, a zero timespan,
    /// or a timespan without a timer.
    #[instrument(
        name = "batch_stage_new",
        skip(config, policy, dispatcher, timer),
        fields(stage = %config.name, batch_size = config.batch_size)
    )]
    pub fn new(
        config: BatchConfig,
        policy: P,
        dispatcher: Arc<dyn Dispatcher>,
        timer: Option<Arc<dyn Timer>>,
    ) -> Result<Arc<Self>, StreamError> {
        config.validate(timer.is_some())?;

        let stage = Arc::new_cyclic(|me: &Weak<Self>| {
            let schedule = match (config.timespan, timer) {
                (Some(period), Some(timer)) => {
                    let weak = me.clone();
                    let handle = timer.schedule(
                        Arc::new(move || {
                            if let Some(stage) = weak.upgrade() {
                                stage.flush_on_timeout();
                            }
                        }),
                        period,
                    );
                    handle.pause();
                    Some(handle)
                }
                _ => None,
            };

            Self {
                core: StageCore::new(config.name.clone()),
                config,
                window: Mutex::new(Window {
                    index: 0,
                    policy,
                    closed: false,
                }),
                dispatcher,
                schedule,
                schedule_cancelled: AtomicBool::new(false),
                me: me.clone(),
                _input: PhantomData,
            }
        });

        debug!(stage = %stage.config.name, timed = stage.schedule.is_some(), "BatchStage created");
        Ok(stage)
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Elements in the open window
    pub fn window_len(&self) -> usize {
        self.lock_window().index
    }

    pub fn is_publishing(&self) -> bool {
        self.core.is_publishing()
    }

    pub fn capacity(&self) -> u64 {
        self.core.capacity()
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.core.set_capacity(capacity);
    }

    /// Timer entry point: close a non-empty window through a non-blocking dispatch
    ///
    /// A saturated dispatcher drops the flush; the next tick or element retries.
    pub fn flush_on_timeout(&self) {
        if self.lock_window().index == 0 {
            return;
        }

        let weak = self.me.clone();
        let task = Box::new(move || {
            if let Some(stage) = weak.upgrade() {
                stage.flush_window(FlushTrigger::Timeout);
            }
        });

        match self.dispatcher.try_dispatch(task) {
            Ok(()) => {}
            Err(DispatchError::InsufficientCapacity { dispatcher }) => {
                debug!(stage = %self.config.name, dispatcher = %dispatcher, "Timer flush dropped, dispatcher saturated");
                record_timer_flush_dropped(&self.config.name);
            }
            Err(e) => {
                debug!(stage = %self.config.name, error = %e, "Timer flush not dispatched");
            }
        }
    }

    /// Close the open window with `flush(None)` if it is non-empty
    fn flush_window(&self, trigger: FlushTrigger) {
        let mut window = self.lock_window();
        if window.closed || window.index == 0 {
            return;
        }

        let len = window.index;
        let mut out = Outbox::new();
        let result = window.policy.flush(None, &mut out);
        window.index = 0;

        match result {
            Ok(()) => {
                self.enqueue(&mut out);
                drop(window);
                trace!(stage = %self.config.name, len, trigger = trigger.as_str(), "Window flushed");
                record_batch_flushed(&self.config.name, len, trigger);
                self.core.drain();
            }
            Err(cause) => {
                window.closed = true;
                drop(window);
                self.fail(StreamError::FlushFailed {
                    cause: Arc::from(cause),
                });
            }
        }
    }

    /// Run the hooks for one element; outputs land in `out`
    fn accept(
        &self,
        window: &mut Window<P>,
        value: &T,
        out: &mut Outbox<P::Output>,
    ) -> Result<bool, BoxError> {
        window.index += 1;
        if window.index == 1 && self.config.emit_first {
            window.policy.first(value, out)?;
        }
        if self.config.emit_each {
            window.policy.next(value, out)?;
        }
        if window.index % self.config.batch_size == 0 {
            window.index = 0;
            if self.config.emit_flush {
                window.policy.flush(Some(value), out)?;
                window.index = 0;
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn enqueue(&self, out: &mut Outbox<P::Output>) {
        for value in out.drain() {
            self.core.enqueue_next(value);
        }
    }

    fn fail(&self, error: StreamError) {
        warn!(stage = %self.config.name, error = %error, "BatchStage failed");
        self.cancel_schedule();
        self.core.cancel_upstream();
        self.core.broadcast_error(error);
    }

    fn cancel_schedule(&self) {
        if self.schedule_cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(schedule) = &self.schedule {
            schedule.cancel();
        }
    }

    fn lock_window(&self) -> MutexGuard<'_, Window<P>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + Sync + 'static> BatchStage<T, Buffer<T>> {
    /// Emit each window as a `Vec`
    pub fn buffer(
        config: BatchConfig,
        dispatcher: Arc<dyn Dispatcher>,
        timer: Option<Arc<dyn Timer>>,
    ) -> Result<Arc<Self>, StreamError> {
        let policy = Buffer::new(config.batch_size);
        Self::new(config.with_hooks(false, true, true), policy, dispatcher, timer)
    }
}

impl<T: Clone + Send + Sync + 'static> BatchStage<T, FirstOfWindow> {
    /// Emit the first element of each window
    pub fn first(
        config: BatchConfig,
        dispatcher: Arc<dyn Dispatcher>,
        timer: Option<Arc<dyn Timer>>,
    ) -> Result<Arc<Self>, StreamError> {
        Self::new(
            config.with_hooks(true, false, false),
            FirstOfWindow,
            dispatcher,
            timer,
        )
    }
}

impl<T: Clone + Send + Sync + 'static> BatchStage<T, LastOfWindow<T>> {
    /// Emit the last element of each window
    pub fn last(
        config: BatchConfig,
        dispatcher: Arc<dyn Dispatcher>,
        timer: Option<Arc<dyn Timer>>,
    ) -> Result<Arc<Self>, StreamError> {
        Self::new(
            config.with_hooks(false, true, true),
            LastOfWindow::default(),
            dispatcher,
            timer,
        )
    }
}

impl<T, P> Stage for BatchStage<T, P>
where
    T: Send + Sync + 'static,
    P: BatchCallbacks<T>,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    fn request_more(&self, n: u64) {
        if !self.core.validate_demand(n) {
            self.cancel_schedule();
            return;
        }
        self.core.add_demand(n);

        let (elements, closed) = {
            let window = self.lock_window();
            (
                window.policy.upstream_demand(n, self.config.batch_size),
                window.closed,
            )
        };
        self.core
            .request_upstream(self.core.capacity(), closed || self.core.is_terminated(), elements);
    }

    fn cancel(&self) {
        self.lock_window().closed = true;
        self.cancel_schedule();
        self.core.cancel();
    }
}

impl<T, P> Subscriber<T> for BatchStage<T, P>
where
    T: Send + Sync + 'static,
    P: BatchCallbacks<T>,
{
    fn on_subscribe(&self, subscription: SharedSubscription) {
        if self.core.set_upstream(subscription) {
            if let Some(schedule) = &self.schedule {
                schedule.resume();
            }
        }
    }

    fn on_next(&self, value: T) {
        let mut window = self.lock_window();
        if window.closed {
            return;
        }

        let mut out = Outbox::new();
        match self.accept(&mut window, &value, &mut out) {
            Ok(flushed) => {
                self.enqueue(&mut out);
                drop(window);
                if flushed && self.config.emit_flush {
                    record_batch_flushed(&self.config.name, self.config.batch_size, FlushTrigger::Count);
                }
                self.core.drain();
            }
            Err(cause) => {
                window.closed = true;
                drop(window);
                self.fail(StreamError::element_failed(cause, value));
            }
        }
    }

    fn on_error(&self, error: StreamError) {
        {
            let mut window = self.lock_window();
            if window.closed {
                return;
            }
            window.closed = true;
        }
        self.cancel_schedule();
        self.core.release_upstream();
        self.core.broadcast_error(error);
    }

    fn on_complete(&self) {
        let mut window = self.lock_window();
        if window.closed {
            return;
        }
        window.closed = true;

        let len = window.index;
        let mut out = Outbox::new();
        let result = window.policy.flush(None, &mut out);
        window.index = 0;
        drop(window);

        self.cancel_schedule();
        self.core.release_upstream();
        match result {
            Ok(()) => {
                if len > 0 {
                    record_batch_flushed(&self.config.name, len, FlushTrigger::Complete);
                }
                self.enqueue(&mut out);
                self.core.broadcast_complete();
            }
            Err(cause) => self.core.broadcast_error(StreamError::FlushFailed {
                cause: Arc::from(cause),
            }),
        }
    }

    fn capacity(&self) -> u64 {
        self.core.capacity()
    }

    fn is_reactive_pull(&self, dispatcher: &dyn Dispatcher, producer_capacity: u64) -> bool {
        self.core.is_reactive_pull(dispatcher, producer_capacity)
    }
}

impl<T, P> Publisher<P::Output> for BatchStage<T, P>
where
    T: Send + Sync + 'static,
    P: BatchCallbacks<T>,
{
    fn subscribe(&self, subscriber: SharedSubscriber<P::Output>) {
        let stage: Weak<dyn Stage> = self.me.clone();
        self.core.subscribe_downstream(subscriber, stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use dispatcher::{ManualTimer, SynchronousDispatcher, WorkerDispatcher};
    use rand::Rng;
    use sources::{CollectSink, IterSource, Terminal};

    fn sync() -> Arc<dyn Dispatcher> {
        SynchronousDispatcher::shared()
    }

    /// Policy counting hook calls; `fail_on` makes `next` fail for that element
    #[derive(Default)]
    struct Counting {
        firsts: Arc<AtomicUsize>,
        count_flushes: Arc<AtomicUsize>,
        final_flushes: Arc<Mutex<Vec<usize>>>,
        window: Vec<u32>,
        fail_on: Option<u32>,
    }

    impl BatchCallbacks<u32> for Counting {
        type Output = Vec<u32>;

        fn first(&mut self, _value: &u32, _out: &mut Outbox<Vec<u32>>) -> Result<(), BoxError> {
            self.firsts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn next(&mut self, value: &u32, _out: &mut Outbox<Vec<u32>>) -> Result<(), BoxError> {
            if self.fail_on == Some(*value) {
                return Err(format!("cannot take {value}").into());
            }
            self.window.push(*value);
            Ok(())
        }

        fn flush(&mut self, value: Option<&u32>, out: &mut Outbox<Vec<u32>>) -> Result<(), BoxError> {
            match value {
                Some(_) => {
                    self.count_flushes.fetch_add(1, Ordering::SeqCst);
                }
                None => self.final_flushes.lock().unwrap().push(self.window.len()),
            }
            if !self.window.is_empty() {
                out.push(std::mem::take(&mut self.window));
            }
            Ok(())
        }
    }

    #[test]
    fn test_batch_size_zero_rejected() {
        let result = BatchStage::<u32, _>::buffer(BatchConfig::new(0), sync(), None);
        assert!(matches!(
            result,
            Err(StreamError::InvalidArgument { name: "batch_size", .. })
        ));
    }

    #[test]
    fn test_timespan_requires_timer() {
        let config = BatchConfig::new(2).with_timespan(Duration::from_millis(10));
        let result = BatchStage::<u32, _>::buffer(config, sync(), None);
        assert!(matches!(
            result,
            Err(StreamError::InvalidArgument { name: "timer", .. })
        ));
    }

    #[test]
    fn test_flush_after_full_window_and_on_complete() {
        let source = IterSource::new(vec!["a", "b", "c", "d", "e"]);
        let stage = BatchStage::buffer(BatchConfig::new(3), sync(), None).unwrap();
        let sink = CollectSink::unbounded();

        stage.subscribe(sink.clone());
        source.subscribe(stage.clone());

        assert_eq!(sink.values(), vec![vec!["a", "b", "c"], vec!["d", "e"]]);
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
    }

    #[test]
    fn test_first_fires_once_per_window() {
        let policy = Counting::default();
        let firsts = Arc::clone(&policy.firsts);
        let config = BatchConfig::new(2).with_hooks(true, true, true);
        let stage = BatchStage::new(config, policy, sync(), None).unwrap();
        let sink = CollectSink::unbounded();

        stage.subscribe(sink.clone());
        IterSource::new((1..=5).collect::<Vec<u32>>()).subscribe(stage.clone());

        // windows [1,2] [3,4] [5]
        assert_eq!(firsts.load(Ordering::SeqCst), 3);
        assert_eq!(sink.values(), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_flush_count_matches_floor_for_random_inputs() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let batch_size = rng.random_range(1..8);
            let len = rng.random_range(0..40u32);

            let policy = Counting::default();
            let count_flushes = Arc::clone(&policy.count_flushes);
            let final_flushes = Arc::clone(&policy.final_flushes);
            let config = BatchConfig::new(batch_size).with_hooks(false, true, true);
            let stage = BatchStage::new(config, policy, sync(), None).unwrap();
            let sink = CollectSink::unbounded();

            stage.subscribe(sink.clone());
            IterSource::new((0..len).collect::<Vec<u32>>()).subscribe(stage.clone());

            let full = len as usize / batch_size;
            let rest = len as usize % batch_size;
            assert_eq!(count_flushes.load(Ordering::SeqCst), full);
            assert_eq!(*final_flushes.lock().unwrap(), vec![rest]);

            let expected_batches = full + usize::from(rest > 0);
            assert_eq!(sink.values().len(), expected_batches);
            assert_eq!(sink.terminal(), Some(Terminal::Complete));
        }
    }

    #[test]
    fn test_failing_hook_carries_element_and_cancels_upstream() {
        let policy = Counting {
            fail_on: Some(3),
            ..Default::default()
        };
        let config = BatchConfig::new(2).with_hooks(false, true, true);
        let stage = BatchStage::new(config, policy, sync(), None).unwrap();
        let sink = CollectSink::unbounded();
        let source = IterSource::new(vec![1u32, 2, 3, 4, 5]);

        stage.subscribe(sink.clone());
        source.subscribe(stage.clone());

        assert_eq!(sink.values(), vec![vec![1, 2]]);
        let error = sink.error().expect("stage should fail");
        assert_eq!(error.element::<u32>(), Some(&3));
        assert!(source.is_cancelled());
        assert_eq!(source.emitted(), 3);

        // Late signals are ignored
        stage.on_next(9);
        stage.on_complete();
        assert_eq!(sink.signal_count(), 2);
    }

    #[test]
    fn test_upstream_demand_scales_with_batch_size() {
        let source = IterSource::new((0..20).collect::<Vec<u32>>());
        let stage = BatchStage::buffer(BatchConfig::new(4), sync(), None).unwrap();
        let sink = CollectSink::with_initial_request(2);

        stage.subscribe(sink.clone());
        source.subscribe(stage.clone());

        assert_eq!(source.requested(), 8);
        assert_eq!(sink.values().len(), 2);

        sink.request(1);
        assert_eq!(source.requested(), 12);
        assert_eq!(sink.values().len(), 3);
        assert_eq!(sink.terminal(), None);
    }

    #[test]
    fn test_timer_flushes_only_non_empty_window() {
        let timer = ManualTimer::new();
        let config = BatchConfig::new(10).with_timespan(Duration::from_millis(50));
        let stage =
            BatchStage::<u32, _>::buffer(config, sync(), Some(timer.clone() as Arc<dyn Timer>))
                .unwrap();
        let sink = CollectSink::unbounded();
        stage.subscribe(sink.clone());

        // Paused until the upstream arrives
        assert_eq!(timer.tick(), 0);

        let source = IterSource::new(vec![1u32, 2]).without_completion();
        source.subscribe(stage.clone());
        assert_eq!(stage.window_len(), 2);

        assert_eq!(timer.tick(), 1);
        assert_eq!(sink.values(), vec![vec![1, 2]]);
        assert_eq!(stage.window_len(), 0);

        // Empty window: tick fires but nothing is emitted
        assert_eq!(timer.tick(), 1);
        assert_eq!(sink.values().len(), 1);
    }

    #[test]
    fn test_timer_ticks_racing_elements_keep_order() {
        const LEN: u32 = 5_000;
        let timer = ManualTimer::new();
        let config = BatchConfig::new(4).with_timespan(Duration::from_millis(5));
        let stage =
            BatchStage::<u32, _>::buffer(config, sync(), Some(timer.clone() as Arc<dyn Timer>))
                .unwrap();
        let sink = CollectSink::unbounded();
        stage.subscribe(sink.clone());
        IterSource::new(Vec::<u32>::new())
            .without_completion()
            .subscribe(stage.clone());

        let stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let timer = Arc::clone(&timer);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut fired = 0;
                loop {
                    fired += timer.tick();
                    if stop.load(Ordering::SeqCst) {
                        break fired;
                    }
                    std::thread::yield_now();
                }
            })
        };

        for value in 0..LEN {
            stage.on_next(value);
            if value % 64 == 0 {
                std::thread::yield_now();
            }
        }
        stop.store(true, Ordering::SeqCst);
        assert!(ticker.join().unwrap() > 0);
        stage.on_complete();

        let batches = sink.values();
        assert!(batches.iter().all(|batch| !batch.is_empty() && batch.len() <= 4));
        let flattened: Vec<u32> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, (0..LEN).collect::<Vec<_>>());
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
    }

    #[test]
    fn test_timer_flush_dropped_when_saturated() {
        struct Saturated;

        impl Dispatcher for Saturated {
            fn name(&self) -> &str {
                "saturated"
            }

            fn kind(&self) -> contracts::DispatcherKind {
                contracts::DispatcherKind::Worker
            }

            fn dispatch(&self, task: contracts::Task) -> Result<(), DispatchError> {
                task();
                Ok(())
            }

            fn try_dispatch(&self, _task: contracts::Task) -> Result<(), DispatchError> {
                Err(DispatchError::InsufficientCapacity {
                    dispatcher: "saturated".into(),
                })
            }
        }

        let timer = ManualTimer::new();
        let config = BatchConfig::new(3).with_timespan(Duration::from_millis(5));
        let stage = BatchStage::<u32, _>::buffer(
            config,
            Arc::new(Saturated),
            Some(timer.clone() as Arc<dyn Timer>),
        )
        .unwrap();
        let sink = CollectSink::unbounded();
        stage.subscribe(sink.clone());
        IterSource::new(vec![1u32]).without_completion().subscribe(stage.clone());

        timer.tick();
        assert!(sink.values().is_empty());
        assert!(sink.terminal().is_none());
        assert_eq!(stage.window_len(), 1);
    }

    #[test]
    fn test_cancel_twice_is_noop() {
        let timer = ManualTimer::new();
        let config = BatchConfig::new(3).with_timespan(Duration::from_millis(5));
        let stage =
            BatchStage::<u32, _>::buffer(config, sync(), Some(timer.clone() as Arc<dyn Timer>))
                .unwrap();
        let sink = CollectSink::unbounded();
        let source = IterSource::new(vec![1u32]).without_completion();

        stage.subscribe(sink.clone());
        source.subscribe(stage.clone());

        stage.cancel();
        stage.cancel();
        assert!(source.is_cancelled());
        assert_eq!(timer.tick(), 0);
        assert!(sink.terminal().is_none());
        assert!(sink.values().is_empty());
    }

    #[test]
    fn test_first_and_last_policies() {
        let first = BatchStage::first(BatchConfig::new(2), sync(), None).unwrap();
        let first_sink = CollectSink::unbounded();
        first.subscribe(first_sink.clone());
        IterSource::new(vec![1u32, 2, 3, 4, 5]).subscribe(first.clone());
        assert_eq!(first_sink.values(), vec![1, 3, 5]);

        let last = BatchStage::last(BatchConfig::new(2), sync(), None).unwrap();
        let last_sink = CollectSink::unbounded();
        last.subscribe(last_sink.clone());
        IterSource::new(vec![1u32, 2, 3, 4, 5]).subscribe(last.clone());
        assert_eq!(last_sink.values(), vec![2, 4, 5]);
    }

    #[test]
    fn test_upstream_error_passes_through() {
        let stage = BatchStage::buffer(BatchConfig::new(4), sync(), None).unwrap();
        let sink = CollectSink::unbounded();
        stage.subscribe(sink.clone());
        IterSource::new(vec![1u32, 2])
            .with_error(StreamError::upstream("down"))
            .subscribe(stage.clone());

        assert!(sink.values().is_empty());
        assert!(matches!(sink.error(), Some(StreamError::Upstream { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_flushes_on_worker() {
        let worker = WorkerDispatcher::spawn("batch-worker", 4);
        let timer: Arc<dyn Timer> = Arc::new(dispatcher::TokioTimer::current());
        let config = BatchConfig::new(100).with_timespan(Duration::from_millis(20));
        let stage = BatchStage::<u32, _>::buffer(config, worker.clone(), Some(timer)).unwrap();
        let sink = CollectSink::unbounded();
        stage.subscribe(sink.clone());
        IterSource::new(vec![1u32, 2, 3])
            .without_completion()
            .subscribe(stage.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sink.values(), vec![vec![1, 2, 3]]);

        stage.cancel();
        worker.shutdown().await;
    }

    #[test]
    fn test_stage_reports_publishing() {
        let stage = BatchStage::buffer(BatchConfig::new(1), sync(), None).unwrap();
        let sink = CollectSink::unbounded();
        stage.subscribe(sink.clone());
        assert!(!stage.is_publishing());

        let source = IterSource::new(vec![1u32]).without_completion();
        source.subscribe(stage.clone());
        assert!(stage.is_publishing());

        stage.on_complete();
        assert!(!stage.is_publishing());
        assert_eq!(sink.terminal(), Some(Terminal::Complete));
    }
}
