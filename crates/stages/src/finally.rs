//! FinallyStage - pass-through running a side effect on termination

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::debug;

use contracts::{
    Dispatcher, Publisher, SharedSubscriber, SharedSubscription, Signal, StreamError, Subscriber,
};

use crate::stage::{Stage, StageCore};

/// Side effect run with the terminal signal
pub type FinallyAction<T> = Box<dyn FnOnce(&Signal<T>) + Send>;

/// Forwards elements unchanged; on error or completion runs its action once,
/// then forwards the terminal signal
pub struct FinallyStage<T> {
    core: StageCore<T>,
    dispatcher: Arc<dyn Dispatcher>,
    action: Mutex<Option<FinallyAction<T>>>,
    me: Weak<Self>,
}

impl<T: Send + 'static> FinallyStage<T> {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        action: impl FnOnce(&Signal<T>) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: StageCore::new("finally"),
            dispatcher,
            action: Mutex::new(Some(Box::new(action))),
            me: me.clone(),
        })
    }

    fn run_action(&self, signal: &Signal<T>) {
        let action = self
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(action) = action {
            debug!(stage = %self.core.name(), signal = signal.kind(), "Running finally action");
            action(signal);
        }
    }
}

impl<T: Send + 'static> Stage for FinallyStage<T> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    fn request_more(&self, n: u64) {
        if !self.core.validate_demand(n) {
            return;
        }
        self.core.add_demand(n);
        self.core
            .request_upstream(self.core.capacity(), self.core.is_terminated(), n);
    }

    fn cancel(&self) {
        self.core.cancel();
    }
}

impl<T: Send + 'static> Subscriber<T> for FinallyStage<T> {
    fn on_subscribe(&self, subscription: SharedSubscription) {
        self.core.set_upstream(subscription);
    }

    fn on_next(&self, value: T) {
        self.core.broadcast_next(value);
    }

    fn on_error(&self, error: StreamError) {
        self.core.release_upstream();
        let signal = Signal::Error(error);
        self.run_action(&signal);
        if let Signal::Error(error) = signal {
            self.core.broadcast_error(error);
        }
    }

    fn on_complete(&self) {
        self.core.release_upstream();
        self.run_action(&Signal::Complete);
        self.core.broadcast_complete();
    }

    fn capacity(&self) -> u64 {
        self.core.capacity()
    }
}

impl<T: Send + 'static> Publisher<T> for FinallyStage<T> {
    fn subscribe(&self, subscriber: SharedSubscriber<T>) {
        let stage: Weak<dyn Stage> = self.me.clone();
        self.core.subscribe_downstream(subscriber, stage);
    }
}
