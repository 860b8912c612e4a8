//! Producer/consumer roles shared by every stage.
//!
//! Signal handlers take `&self`: a stage may receive signals from several
//! threads, so implementations keep their mutable state behind atomics or locks.

use std::sync::Arc;

use crate::{Dispatcher, StreamError};

/// Shared subscription handle
pub type SharedSubscription = Arc<dyn Subscription>;

/// Shared subscriber handle
pub type SharedSubscriber<T> = Arc<dyn Subscriber<T>>;

/// Shared publisher handle
pub type SharedPublisher<T> = Arc<dyn Publisher<T>>;

/// Handle a downstream holds on its upstream producer
pub trait Subscription: Send + Sync {
    /// Authorize `n` more elements. `n` must be > 0.
    fn request(&self, n: u64);

    /// Stop the flow. Idempotent.
    fn cancel(&self);
}

/// Consumer role
pub trait Subscriber<T>: Send + Sync {
    /// Called once with the upstream handle
    fn on_subscribe(&self, subscription: SharedSubscription);

    /// Element
    fn on_next(&self, value: T);

    /// Terminal failure
    fn on_error(&self, error: StreamError);

    /// Terminal success
    fn on_complete(&self);

    /// Elements this subscriber can hold in flight
    fn capacity(&self) -> u64 {
        u64::MAX
    }

    /// Whether the producer must wait for `request` rather than push eagerly
    fn is_reactive_pull(&self, _dispatcher: &dyn Dispatcher, _producer_capacity: u64) -> bool {
        true
    }
}

/// Producer role
pub trait Publisher<T>: Send + Sync {
    /// Attach a subscriber; the publisher calls `on_subscribe` on it
    fn subscribe(&self, subscriber: SharedSubscriber<T>);

    /// Declared capacity of a bounded source (`None` = unbounded)
    fn capacity(&self) -> Option<u64> {
        None
    }
}

/// Collaborator that feeds new sources into a fan-in after it started
pub trait SourceProducer: Send + Sync {
    /// `true` while more sources may still arrive
    fn is_producing(&self) -> bool;

    /// One of the sources it produced has terminated
    fn source_terminated(&self) {}

    /// Stop producing sources. Idempotent.
    fn cancel(&self);
}
