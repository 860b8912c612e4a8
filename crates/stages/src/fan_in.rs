//! FanInStage - merges a dynamic set of upstream sources
//!
//! Responsibilities:
//! - Enrol sources (fixed at construction or added while running)
//! - Split downstream demand across active sources
//! - Complete once every source is done and no companion is still producing
//!   sources; fail the whole merge on the first source error
//!
//! Lifecycle: `NOT_STARTED -> RUNNING -> COMPLETING -> COMPLETED`, CAS-only.
//! `SEALING` is held only while the completer re-checks the running count,
//! so an `add_publisher` racing with completion either lands before the
//! check (completion is deferred) or observes `COMPLETED` (the source is
//! refused).

use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use slab::Slab;
use tracing::{debug, info, instrument, trace, warn};

use contracts::{
    Demand, Dispatcher, DispatcherKind, Publisher, SharedPublisher, SharedSubscriber,
    SharedSubscription, SourceProducer, StreamError, Subscriber,
};
use dispatcher::TailRecurseDispatcher;
use observability::metrics::{record_merge_failed, record_source_terminated};

use crate::dynamic_merge::DynamicMerge;
use crate::stage::{Stage, StageCore};

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETING: u8 = 2;
const SEALING: u8 = 3;
const COMPLETED: u8 = 4;

/// Observable lifecycle of a fan-in stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    NotStarted,
    Running,
    Completing,
    Completed,
}

/// Relationship with the collaborator feeding new sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionState {
    /// No companion
    Absent,
    /// More sources may still arrive
    Producing,
    /// The companion will add no more sources
    Done,
}

/// Sources currently merged plus demand not yet handed to any of them
struct MergeSet<T> {
    sources: Slab<Arc<InnerSource<T>>>,
    /// Downstream demand not granted to a source yet
    owed: Demand,
    /// Rotation start for the next split
    cursor: usize,
    /// Per-source outstanding demand ceiling
    max_capacity: u64,
    /// Every enrolled source already holds unbounded demand
    saturated: bool,
}

type Grants<T> = Vec<(Arc<InnerSource<T>>, u64)>;

impl<T: Send + 'static> MergeSet<T> {
    /// Hand owed demand to active sources, round-robin, capped per source
    ///
    /// Grants are reserved here; the caller forwards them after unlocking.
    fn rebalance(&mut self) -> Grants<T> {
        if !self.owed.has_demand() {
            return Vec::new();
        }
        if self.owed.is_unbounded() && self.saturated {
            return Vec::new();
        }

        let mut eligible: Vec<Arc<InnerSource<T>>> = self
            .sources
            .iter()
            .filter(|(_, source)| source.is_active())
            .map(|(_, source)| Arc::clone(source))
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }
        let len = eligible.len();
        eligible.rotate_left(self.cursor % len);
        self.cursor = self.cursor.wrapping_add(1);

        if self.owed.is_unbounded() {
            // Unbounded demand is never used up: every source, current or future, gets it
            self.saturated = true;
            return eligible
                .into_iter()
                .filter(|source| source.reserve_unbounded())
                .map(|source| (source, u64::MAX))
                .collect();
        }

        let mut owed = self.owed.get();
        let share = owed / len as u64;
        let mut extra = owed % len as u64;
        let mut given = vec![0u64; len];

        for (slot, source) in given.iter_mut().zip(&eligible) {
            let mut want = share;
            if extra > 0 {
                want += 1;
                extra -= 1;
            }
            let room = self.max_capacity.saturating_sub(source.pending());
            *slot = want.min(room);
            owed -= *slot;
        }

        // Capped sources leave demand behind; let the others absorb it
        for (slot, source) in given.iter_mut().zip(&eligible) {
            if owed == 0 {
                break;
            }
            let room = self
                .max_capacity
                .saturating_sub(source.pending().saturating_add(*slot));
            let extra = owed.min(room);
            *slot += extra;
            owed -= extra;
        }

        self.owed = Demand::new(owed);
        eligible
            .into_iter()
            .zip(given)
            .filter(|(_, n)| *n > 0)
            .map(|(source, n)| {
                source.reserve(n);
                (source, n)
            })
            .collect()
    }
}

fn forward<T: Send + 'static>(grants: Grants<T>) {
    for (source, n) in grants {
        source.forward(n);
    }
}

/// Merges any number of upstream sources into one downstream stream
pub struct FanInStage<T> {
    core: StageCore<T>,
    dispatcher: Arc<dyn Dispatcher>,
    status: AtomicU8,
    /// Enrolled sources that have not terminated
    running: AtomicUsize,
    merge: Mutex<MergeSet<T>>,
    fixed_sources: Mutex<Option<Vec<SharedPublisher<T>>>>,
    companion: Mutex<Option<Arc<dyn SourceProducer>>>,
    cancelled: AtomicBool,
    me: Weak<Self>,
}

impl<T: Send + 'static> FanInStage<T> {
    /// Dynamic merge: sources arrive through [`FanInStage::add_publisher`]
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Arc<Self> {
        Self::build(dispatcher, None)
    }

    /// Merge a fixed set of sources, subscribed when the downstream subscribes
    pub fn with_sources(
        dispatcher: Arc<dyn Dispatcher>,
        sources: impl IntoIterator<Item = SharedPublisher<T>>,
    ) -> Arc<Self> {
        Self::build(dispatcher, Some(sources.into_iter().collect()))
    }

    /// Merge the sources emitted by `outer`, at most `max_concurrency` at a time
    pub fn merge_dynamic(
        dispatcher: Arc<dyn Dispatcher>,
        outer: SharedPublisher<SharedPublisher<T>>,
        max_concurrency: Option<usize>,
    ) -> Arc<Self> {
        let stage = Self::new(dispatcher);
        let companion = Arc::new(DynamicMerge::new(Arc::downgrade(&stage), max_concurrency));
        stage.set_companion(companion.clone());
        outer.subscribe(companion);
        stage
    }

    #[instrument(name = "fan_in_stage_new", skip(dispatcher, fixed), fields(fixed = fixed.as_ref().map(Vec::len)))]
    fn build(dispatcher: Arc<dyn Dispatcher>, fixed: Option<Vec<SharedPublisher<T>>>) -> Arc<Self> {
        // Synchronous request/emit chains are trampolined instead of recursing
        let dispatcher = if dispatcher.kind() == DispatcherKind::Synchronous {
            TailRecurseDispatcher::shared()
        } else {
            dispatcher
        };
        debug!(dispatcher = dispatcher.name(), "FanInStage created");

        Arc::new_cyclic(|me| Self {
            core: StageCore::new("fan-in"),
            dispatcher,
            status: AtomicU8::new(NOT_STARTED),
            running: AtomicUsize::new(0),
            merge: Mutex::new(MergeSet {
                sources: Slab::new(),
                owed: Demand::NONE,
                cursor: 0,
                max_capacity: u64::MAX,
                saturated: false,
            }),
            fixed_sources: Mutex::new(fixed),
            companion: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Register the collaborator that feeds new sources
    pub fn set_companion(&self, companion: Arc<dyn SourceProducer>) {
        *lock(&self.companion) = Some(companion);
    }

    pub fn companion_state(&self) -> CompanionState {
        match lock(&self.companion).as_ref() {
            None => CompanionState::Absent,
            Some(companion) if companion.is_producing() => CompanionState::Producing,
            Some(_) => CompanionState::Done,
        }
    }

    pub fn status(&self) -> MergeStatus {
        match self.status.load(Ordering::SeqCst) {
            NOT_STARTED => MergeStatus::NotStarted,
            RUNNING => MergeStatus::Running,
            COMPLETING | SEALING => MergeStatus::Completing,
            _ => MergeStatus::Completed,
        }
    }

    /// Sources enrolled and not yet terminated
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Downstream demand not yet granted to a source
    pub fn owed(&self) -> Demand {
        lock(&self.merge).owed
    }

    pub fn capacity(&self) -> u64 {
        self.core.capacity()
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.core.set_capacity(capacity);
    }

    pub fn is_publishing(&self) -> bool {
        self.core.is_publishing()
    }

    /// Enrol `publisher` and subscribe to it
    ///
    /// The new source is seeded from owed demand. If the merge already
    /// terminated, the source is cancelled as soon as it subscribes.
    pub fn add_publisher(&self, publisher: SharedPublisher<T>) -> Arc<InnerSource<T>> {
        self.running.fetch_add(1, Ordering::SeqCst);

        if self.settled_status() == COMPLETED {
            self.decrement_running();
            debug!(stage = %self.core.name(), "Source added after termination, cancelling it");
            let inner = Arc::new(InnerSource::rejected(self.me.clone()));
            publisher.subscribe(inner.clone());
            return inner;
        }

        let (inner, grants) = {
            let mut merge = lock(&self.merge);
            let entry = merge.sources.vacant_entry();
            let inner = Arc::new(InnerSource::new(entry.key(), self.me.clone()));
            entry.insert(Arc::clone(&inner));
            merge.saturated = false;
            let grants = merge.rebalance();
            (inner, grants)
        };
        trace!(stage = %self.core.name(), key = inner.key, running = self.running(), "Source enrolled");

        forward(grants);
        publisher.subscribe(inner.clone());
        inner
    }

    /// No more sources will be added: complete once the running ones finish
    pub fn schedule_completion(&self) {
        self.begin_completing();
        debug!(stage = %self.core.name(), running = self.running(), "Completion scheduled");
        self.try_complete();
    }

    /// Move a live merge to `COMPLETING`, whether or not it has started
    fn begin_completing(&self) {
        for from in [NOT_STARTED, RUNNING] {
            if self
                .status
                .compare_exchange(from, COMPLETING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Fail the merge with `error` (used by the companion)
    ///
    /// The first failure wins; later ones, and failures after cancellation,
    /// are ignored.
    pub fn fail(&self, error: StreamError) {
        if self.status.swap(COMPLETED, Ordering::SeqCst) == COMPLETED {
            debug!(stage = %self.core.name(), error = %error, "Merge already terminated, failure ignored");
            return;
        }
        warn!(stage = %self.core.name(), error = %error, "Merge failed");
        record_merge_failed(self.core.name(), &error);
        self.core.broadcast_error(error);
        self.cancel_companion();
        self.cancel_sources();
    }

    /// Start-up on first downstream subscription
    fn do_subscribe(&self) {
        if self
            .status
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let Some(fixed) = lock(&self.fixed_sources).take() else {
            lock(&self.merge).max_capacity = self.core.capacity();
            return;
        };

        let effective = fixed
            .iter()
            .filter_map(|source| source.capacity())
            .fold(self.core.capacity(), u64::min);
        self.core.set_capacity(effective);
        lock(&self.merge).max_capacity = self.core.capacity();
        info!(stage = %self.core.name(), sources = fixed.len(), capacity = effective, "Merging fixed sources");

        if fixed.is_empty() {
            let _ = self
                .status
                .compare_exchange(RUNNING, COMPLETING, Ordering::SeqCst, Ordering::SeqCst);
            self.try_complete();
            return;
        }
        for source in fixed {
            self.add_publisher(source);
        }
    }

    /// Downstream demand reached the dispatcher
    fn merge_request(&self, n: u64) {
        let grants = {
            let mut merge = lock(&self.merge);
            merge.owed = merge.owed.add(n);
            merge.rebalance()
        };
        forward(grants);
    }

    /// Hand owed demand to sources that have room again
    fn top_up(&self) {
        let grants = {
            let mut merge = lock(&self.merge);
            merge.rebalance()
        };
        forward(grants);
    }

    fn source_next(&self, inner: &InnerSource<T>, value: T) {
        inner.consume_one();
        self.core.broadcast_next(value);
        self.top_up();
    }

    fn source_completed(&self, inner: &InnerSource<T>) {
        inner.cancel();
        self.begin_completing();
        let left = self.decrement_running();

        let grants = {
            let mut merge = lock(&self.merge);
            merge.sources.try_remove(inner.key);
            let unused = inner.take_pending();
            if unused != u64::MAX {
                merge.owed = merge.owed.add(unused);
            }
            if left == 0 {
                merge.sources.retain(|_, source| source.is_active());
            }
            merge.rebalance()
        };
        forward(grants);

        debug!(stage = %self.core.name(), key = inner.key, running = left, "Source completed");
        record_source_terminated(self.core.name(), false, left);

        let companion = lock(&self.companion).clone();
        if let Some(companion) = companion {
            companion.source_terminated();
        }
        if left == 0 {
            self.try_complete();
        }
    }

    fn source_failed(&self, inner: &InnerSource<T>, error: StreamError) {
        inner.cancel();
        let left = self.decrement_running();
        lock(&self.merge).sources.try_remove(inner.key);
        record_source_terminated(self.core.name(), true, left);
        self.fail(error);
    }

    /// Broadcast completion if nothing runs and no companion is producing
    fn try_complete(&self) {
        if self.running.load(Ordering::SeqCst) != 0
            || self.companion_state() == CompanionState::Producing
        {
            return;
        }
        if self
            .status
            .compare_exchange(COMPLETING, SEALING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        // A source enrolled since the first check keeps the merge open
        if self.running.load(Ordering::SeqCst) != 0 {
            let _ = self
                .status
                .compare_exchange(SEALING, COMPLETING, Ordering::SeqCst, Ordering::SeqCst);
            return;
        }
        if self
            .status
            .compare_exchange(SEALING, COMPLETED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(stage = %self.core.name(), "Merge completed");
            self.core.broadcast_complete();
        }
    }

    /// Lifecycle value, waiting out a completer's re-check
    fn settled_status(&self) -> u8 {
        loop {
            let status = self.status.load(Ordering::SeqCst);
            if status != SEALING {
                return status;
            }
            hint::spin_loop();
        }
    }

    /// Decrement the running count, floored at zero; returns what is left
    fn decrement_running(&self) -> usize {
        match self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    fn cancel_companion(&self) {
        let companion = lock(&self.companion).clone();
        if let Some(companion) = companion {
            companion.cancel();
        }
    }

    fn cancel_sources(&self) {
        let sources: Vec<Arc<InnerSource<T>>> = {
            let mut merge = lock(&self.merge);
            merge.owed = Demand::NONE;
            merge.sources.drain().collect()
        };
        for source in sources {
            // Cancelled sources count as terminated; their late signals are dropped
            if !source.terminated.swap(true, Ordering::AcqRel) {
                self.decrement_running();
            }
            source.cancel();
        }
    }
}

impl<T: Send + 'static> Stage for FanInStage<T> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    fn request_more(&self, n: u64) {
        if !self.core.validate_demand(n) {
            self.status.store(COMPLETED, Ordering::SeqCst);
            self.cancel_companion();
            self.cancel_sources();
            return;
        }
        self.core.add_demand(n);

        let weak = self.me.clone();
        let task = Box::new(move || {
            if let Some(stage) = weak.upgrade() {
                stage.merge_request(n);
            }
        });
        if let Err(e) = self.dispatcher.dispatch(task) {
            self.fail(StreamError::Dispatch(e));
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(stage = %self.core.name(), "FanInStage cancelled");
        self.status.store(COMPLETED, Ordering::SeqCst);
        self.core.cancel();
        self.cancel_companion();
        self.cancel_sources();
    }
}

impl<T: Send + 'static> Publisher<T> for FanInStage<T> {
    fn subscribe(&self, subscriber: SharedSubscriber<T>) {
        self.do_subscribe();
        let stage: Weak<dyn Stage> = self.me.clone();
        self.core.subscribe_downstream(subscriber, stage);
    }

    fn capacity(&self) -> Option<u64> {
        let capacity = self.core.capacity();
        (capacity != u64::MAX).then_some(capacity)
    }
}

#[derive(Default)]
struct Link {
    subscription: Option<SharedSubscription>,
    /// Demand granted before the subscription arrived
    unrequested: u64,
    cancelled: bool,
}

/// One merged upstream source
pub struct InnerSource<T> {
    key: usize,
    stage: Weak<FanInStage<T>>,
    link: Mutex<Link>,
    /// Demand granted and not yet delivered
    pending: AtomicU64,
    emitted: AtomicU64,
    /// First-wins terminal flag shared by completion and failure
    terminated: AtomicBool,
}

impl<T: Send + 'static> InnerSource<T> {
    fn new(key: usize, stage: Weak<FanInStage<T>>) -> Self {
        Self {
            key,
            stage,
            link: Mutex::new(Link::default()),
            pending: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
        }
    }

    /// Source refused by a terminated merge
    fn rejected(stage: Weak<FanInStage<T>>) -> Self {
        let inner = Self::new(usize::MAX, stage);
        inner.terminated.store(true, Ordering::Release);
        inner.link_mut().cancelled = true;
        inner
    }

    /// Demand granted and not yet delivered
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Elements received from this source
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        !self.is_terminated() && !self.link_mut().cancelled
    }

    fn reserve(&self, n: u64) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some(p.saturating_add(n))
            });
    }

    /// Returns `false` if the source already had unbounded demand
    fn reserve_unbounded(&self) -> bool {
        self.pending.swap(u64::MAX, Ordering::AcqRel) != u64::MAX
    }

    fn consume_one(&self) {
        self.emitted.fetch_add(1, Ordering::AcqRel);
        let consumed = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| match p {
                0 => None,
                u64::MAX => Some(u64::MAX),
                p => Some(p - 1),
            });
        if consumed.is_err() {
            trace!(key = self.key, "Source emitted without demand");
        }
    }

    fn take_pending(&self) -> u64 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    /// Request `n` upstream, or keep it until the subscription arrives
    fn forward(&self, n: u64) {
        let subscription = {
            let mut link = self.link_mut();
            if link.cancelled {
                return;
            }
            match &link.subscription {
                Some(subscription) => Arc::clone(subscription),
                None => {
                    link.unrequested = link.unrequested.saturating_add(n);
                    return;
                }
            }
        };
        subscription.request(n);
    }

    /// Cancel the upstream subscription. Idempotent.
    fn cancel(&self) {
        let subscription = {
            let mut link = self.link_mut();
            link.cancelled = true;
            link.subscription.take()
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    fn link_mut(&self) -> MutexGuard<'_, Link> {
        lock(&self.link)
    }
}

impl<T: Send + 'static> Subscriber<T> for InnerSource<T> {
    fn on_subscribe(&self, subscription: SharedSubscription) {
        let unrequested = {
            let mut link = self.link_mut();
            if link.cancelled || link.subscription.is_some() {
                None
            } else {
                link.subscription = Some(Arc::clone(&subscription));
                Some(std::mem::take(&mut link.unrequested))
            }
        };

        match unrequested {
            None => subscription.cancel(),
            Some(0) => {}
            Some(n) => subscription.request(n),
        }
    }

    fn on_next(&self, value: T) {
        if self.is_terminated() {
            return;
        }
        if let Some(stage) = self.stage.upgrade() {
            stage.source_next(self, value);
        }
    }

    fn on_error(&self, error: StreamError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stage) = self.stage.upgrade() {
            stage.source_failed(self, error);
        }
    }

    fn on_complete(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stage) = self.stage.upgrade() {
            stage.source_completed(self);
        }
    }

    fn capacity(&self) -> u64 {
        self.stage
            .upgrade()
            .map_or(u64::MAX, |stage| stage.core.capacity())
    }

    fn is_reactive_pull(&self, dispatcher: &dyn Dispatcher, producer_capacity: u64) -> bool {
        self.stage.upgrade().map_or(true, |stage| {
            stage.core.is_reactive_pull(dispatcher, producer_capacity)
        })
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
