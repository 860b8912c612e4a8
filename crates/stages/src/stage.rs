//! Pipeline stage base contract
//!
//! Responsibilities:
//! - Serial, demand-gated delivery to the single downstream subscriber
//! - Upstream subscription slot and demand bookkeeping
//! - Stage capacity and pull/push negotiation

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

use contracts::{
    Demand, Dispatcher, SharedSubscriber, SharedSubscription, Signal, StreamError, Subscription,
};

/// Operations the downstream drives on a stage through its subscription
pub trait Stage: Send + Sync {
    /// Stage name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Dispatcher the stage runs its tasks on
    fn dispatcher(&self) -> &Arc<dyn Dispatcher>;

    /// Downstream asked for `n` more elements
    fn request_more(&self, n: u64);

    /// Downstream cancelled. Idempotent.
    fn cancel(&self);
}

/// Subscription handed to the downstream of a stage
///
/// Holds only a weak reference so a dropped pipeline is not kept alive by its
/// subscriber.
pub struct StageSubscription {
    stage: Weak<dyn Stage>,
}

impl StageSubscription {
    pub fn new(stage: Weak<dyn Stage>) -> Self {
        Self { stage }
    }
}

impl Subscription for StageSubscription {
    fn request(&self, n: u64) {
        if let Some(stage) = self.stage.upgrade() {
            stage.request_more(n);
        }
    }

    fn cancel(&self) {
        if let Some(stage) = self.stage.upgrade() {
            stage.cancel();
        }
    }
}

/// Subscription that ignores everything, given to rejected subscribers
pub(crate) struct EmptySubscription;

impl Subscription for EmptySubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

struct EmitterState<O> {
    subscriber: Option<SharedSubscriber<O>>,
    /// Set once `on_subscribe` has returned
    ready: bool,
    queue: VecDeque<Signal<O>>,
    demand: Demand,
    /// A terminal signal was accepted; later signals are discarded
    terminal_enqueued: bool,
    /// Delivery stopped (terminal delivered or downstream cancelled)
    done: bool,
}

/// Queue plus work-in-progress counter delivering signals one at a time
///
/// Any thread may enqueue; whichever thread moves `wip` off zero drains the
/// queue for everybody. No lock is held while the subscriber runs, so a
/// subscriber may call back into the stage.
pub struct SerialEmitter<O> {
    state: Mutex<EmitterState<O>>,
    wip: AtomicUsize,
}

impl<O: Send + 'static> Default for SerialEmitter<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Send + 'static> SerialEmitter<O> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EmitterState {
                subscriber: None,
                ready: false,
                queue: VecDeque::new(),
                demand: Demand::NONE,
                terminal_enqueued: false,
                done: false,
            }),
            wip: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EmitterState<O>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the downstream subscriber and call its `on_subscribe`
    ///
    /// # Errors
    /// Returns `StreamError::AlreadySubscribed` if a subscriber is attached.
    pub fn attach(
        &self,
        subscriber: SharedSubscriber<O>,
        subscription: SharedSubscription,
    ) -> Result<(), StreamError> {
        {
            let mut state = self.lock();
            if state.subscriber.is_some() {
                return Err(StreamError::AlreadySubscribed);
            }
            state.subscriber = Some(Arc::clone(&subscriber));
        }

        subscriber.on_subscribe(subscription);

        self.lock().ready = true;
        self.drain();
        Ok(())
    }

    /// Queue an element. Returns `false` if a terminal signal was already accepted.
    pub fn enqueue_next(&self, value: O) -> bool {
        let mut state = self.lock();
        if state.terminal_enqueued {
            return false;
        }
        state.queue.push_back(Signal::Next(value));
        true
    }

    /// Queue completion behind any queued elements
    pub fn enqueue_complete(&self) -> bool {
        let mut state = self.lock();
        if state.terminal_enqueued {
            return false;
        }
        state.terminal_enqueued = true;
        state.queue.push_back(Signal::Complete);
        true
    }

    /// Queue an error behind any queued elements
    ///
    /// Queued elements go out first while demand lasts; the error itself is
    /// never held back by demand, so elements beyond it are dropped.
    pub fn enqueue_error(&self, error: StreamError) -> bool {
        let mut state = self.lock();
        if state.terminal_enqueued {
            return false;
        }
        state.terminal_enqueued = true;
        state.queue.push_back(Signal::Error(error));
        true
    }

    /// Add downstream demand
    pub fn add_demand(&self, n: u64) {
        {
            let mut state = self.lock();
            state.demand = state.demand.add(n);
        }
        self.drain();
    }

    /// Stop delivering and drop queued signals. Idempotent.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.done = true;
        state.terminal_enqueued = true;
        state.queue.clear();
    }

    /// Outstanding downstream demand
    pub fn demand(&self) -> Demand {
        self.lock().demand
    }

    /// Signals waiting for demand
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// A terminal signal was accepted or the downstream cancelled
    pub fn is_terminated(&self) -> bool {
        self.lock().terminal_enqueued
    }

    /// Deliver whatever the current demand allows
    pub fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            while let Some((subscriber, signal)) = self.poll() {
                trace!(signal = signal.kind(), "Delivering signal");
                match signal {
                    Signal::Next(value) => subscriber.on_next(value),
                    Signal::Error(error) => subscriber.on_error(error),
                    Signal::Complete => subscriber.on_complete(),
                }
            }

            let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
            missed = previous - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn poll(&self) -> Option<(SharedSubscriber<O>, Signal<O>)> {
        let mut state = self.lock();
        if state.done || !state.ready {
            return None;
        }
        let subscriber = state.subscriber.clone()?;

        if !state.queue.front()?.is_terminal() {
            match state.demand.consume_one() {
                Some(demand) => state.demand = demand,
                None => {
                    if !matches!(state.queue.back(), Some(Signal::Error(_))) {
                        return None;
                    }
                    let error = state.queue.pop_back()?;
                    state.queue.clear();
                    state.queue.push_back(error);
                }
            }
        }
        let signal = state.queue.pop_front()?;
        if signal.is_terminal() {
            state.done = true;
            state.queue.clear();
            // Release the subscriber once nothing more can reach it
            state.subscriber = None;
        }
        Some((subscriber, signal))
    }
}

#[derive(Default)]
struct UpstreamSlot {
    subscription: Option<SharedSubscription>,
    /// Demand requested before the subscription arrived
    pending: Demand,
    cancelled: bool,
}

/// State and behavior shared by every stage emitting `O`
pub struct StageCore<O> {
    name: String,
    emitter: SerialEmitter<O>,
    capacity: AtomicU64,
    upstream: Mutex<UpstreamSlot>,
    publishing: AtomicBool,
}

impl<O: Send + 'static> StageCore<O> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            emitter: SerialEmitter::new(),
            capacity: AtomicU64::new(u64::MAX),
            upstream: Mutex::new(UpstreamSlot::default()),
            publishing: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn emitter(&self) -> &SerialEmitter<O> {
        &self.emitter
    }

    /// Attach the downstream; a second subscriber is rejected with `AlreadySubscribed`
    pub fn subscribe_downstream(&self, subscriber: SharedSubscriber<O>, stage: Weak<dyn Stage>) {
        let subscription: SharedSubscription = Arc::new(StageSubscription::new(stage));
        if let Err(error) = self
            .emitter
            .attach(Arc::clone(&subscriber), subscription)
        {
            debug!(stage = %self.name, "Rejecting second downstream subscriber");
            subscriber.on_subscribe(Arc::new(EmptySubscription));
            subscriber.on_error(error);
        }
    }

    /// Emit an element downstream
    pub fn broadcast_next(&self, value: O) {
        if self.emitter.enqueue_next(value) {
            self.publishing.store(true, Ordering::Release);
        }
        self.emitter.drain();
    }

    /// Emit a terminal error downstream; ignored after a terminal signal
    pub fn broadcast_error(&self, error: StreamError) {
        if self.emitter.enqueue_error(error) {
            debug!(stage = %self.name, "Stage failed");
        }
        self.emitter.drain();
    }

    /// Emit completion downstream; ignored after a terminal signal
    pub fn broadcast_complete(&self) {
        if self.emitter.enqueue_complete() {
            debug!(stage = %self.name, "Stage completed");
        }
        self.emitter.drain();
    }

    /// Queue an element without delivering it yet; pair with [`StageCore::drain`]
    pub fn enqueue_next(&self, value: O) {
        if self.emitter.enqueue_next(value) {
            self.publishing.store(true, Ordering::Release);
        }
    }

    /// Deliver queued signals
    pub fn drain(&self) {
        self.emitter.drain();
    }

    /// Whether a terminal signal was accepted
    pub fn is_terminated(&self) -> bool {
        self.emitter.is_terminated()
    }

    /// The stage has emitted and not terminated
    pub fn is_publishing(&self) -> bool {
        self.publishing.load(Ordering::Acquire) && !self.is_terminated()
    }

    /// Outstanding-demand ceiling
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity.max(1), Ordering::Release);
    }

    /// Whether the stage must pull by request instead of taking eager pushes
    pub fn is_reactive_pull(&self, dispatcher: &dyn Dispatcher, producer_capacity: u64) -> bool {
        self.capacity() != producer_capacity || !dispatcher.supports_ordering()
    }

    /// Reject `request(0)`: fail downstream and cancel upstream
    ///
    /// Returns `true` if `n` is valid.
    pub fn validate_demand(&self, n: u64) -> bool {
        if n > 0 {
            return true;
        }
        debug!(stage = %self.name, "Rejecting request(0)");
        self.broadcast_error(StreamError::InvalidDemand { requested: n });
        self.cancel_upstream();
        false
    }

    /// Add downstream demand and deliver what it allows
    pub fn add_demand(&self, n: u64) {
        self.emitter.add_demand(n);
    }

    /// Request `min(capacity, elements)` upstream, unless terminated
    ///
    /// Demand requested before the upstream subscription arrives is kept and
    /// forwarded on [`StageCore::set_upstream`].
    pub fn request_upstream(&self, capacity: u64, terminated: bool, elements: u64) {
        if terminated {
            return;
        }
        let n = capacity.min(elements);
        if n == 0 {
            return;
        }

        let subscription = {
            let mut slot = self.lock_upstream();
            if slot.cancelled {
                return;
            }
            match &slot.subscription {
                Some(subscription) => Arc::clone(subscription),
                None => {
                    slot.pending = slot.pending.add(n);
                    return;
                }
            }
        };
        trace!(stage = %self.name, n, "Requesting upstream");
        subscription.request(n);
    }

    /// Store the upstream subscription and forward accumulated demand
    ///
    /// Returns `false` (and cancels `subscription`) if an upstream is already
    /// set or the stage was cancelled.
    pub fn set_upstream(&self, subscription: SharedSubscription) -> bool {
        let pending = {
            let mut slot = self.lock_upstream();
            if slot.subscription.is_some() || slot.cancelled {
                None
            } else {
                slot.subscription = Some(Arc::clone(&subscription));
                Some(std::mem::take(&mut slot.pending))
            }
        };

        match pending {
            None => {
                subscription.cancel();
                false
            }
            Some(pending) => {
                if pending.has_demand() {
                    subscription.request(pending.get());
                }
                true
            }
        }
    }

    /// Cancel the upstream subscription. Idempotent.
    pub fn cancel_upstream(&self) {
        let subscription = {
            let mut slot = self.lock_upstream();
            slot.cancelled = true;
            slot.subscription.take()
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Forget the upstream after it terminated, without cancelling it
    pub fn release_upstream(&self) {
        let mut slot = self.lock_upstream();
        slot.cancelled = true;
        slot.subscription = None;
    }

    /// Downstream cancelled: stop delivery and cancel upstream
    pub fn cancel(&self) {
        self.emitter.cancel();
        self.cancel_upstream();
    }

    fn lock_upstream(&self) -> MutexGuard<'_, UpstreamSlot> {
        self.upstream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
