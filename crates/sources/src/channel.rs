//! ChannelSource - hot publisher pumping an async channel

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_channel::Receiver;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, instrument, trace};

use contracts::{Publisher, SharedSubscriber, StreamError, Subscription};

use crate::stats::SourceStats;

/// Publisher forwarding channel messages to a single subscriber
///
/// A tokio task holds at most one received message until demand arrives, so a
/// slow subscriber leaves messages in the channel and a bounded sender backs
/// off.
/// Completes when every sender is dropped, or fails with the configured close
/// error.
pub struct ChannelSource<T> {
    name: String,
    receiver: Mutex<Option<Receiver<T>>>,
    close_error: Option<StreamError>,
    runtime: Handle,
    stats: Arc<SourceStats>,
}

impl<T: Send + 'static> ChannelSource<T> {
    /// Create a source on the current runtime
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, receiver: Receiver<T>) -> Self {
        Self::with_handle(name, receiver, Handle::current())
    }

    /// Create a source spawning its pump on `runtime`
    pub fn with_handle(name: impl Into<String>, receiver: Receiver<T>, runtime: Handle) -> Self {
        Self {
            name: name.into(),
            receiver: Mutex::new(Some(receiver)),
            close_error: None,
            runtime,
            stats: Arc::new(SourceStats::new()),
        }
    }

    /// Fail with `error` instead of completing when the channel closes
    pub fn with_close_error(mut self, error: StreamError) -> Self {
        self.close_error = Some(error);
        self
    }

    pub fn stats(&self) -> &Arc<SourceStats> {
        &self.stats
    }
}

impl<T: Send + 'static> Publisher<T> for ChannelSource<T> {
    #[instrument(name = "channel_source_subscribe", skip(self, subscriber), fields(source = %self.name))]
    fn subscribe(&self, subscriber: SharedSubscriber<T>) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(receiver) = receiver else {
            debug!(source = %self.name, "ChannelSource already consumed");
            subscriber.on_subscribe(Arc::new(ChannelSubscription::new(Arc::clone(&self.stats))));
            subscriber.on_error(StreamError::AlreadySubscribed);
            return;
        };

        let subscription = Arc::new(ChannelSubscription::new(Arc::clone(&self.stats)));
        subscriber.on_subscribe(subscription.clone());

        let name = self.name.clone();
        let close_error = self.close_error.clone();
        let stats = Arc::clone(&self.stats);
        self.runtime.spawn(async move {
            pump(name, receiver, close_error, subscriber, subscription, stats).await;
        });
    }
}

struct ChannelSubscription {
    demand: AtomicU64,
    cancelled: AtomicBool,
    /// Demand arrived or cancelled
    wake: Notify,
    /// Cancelled, interrupts a pending receive
    stop: Notify,
    stats: Arc<SourceStats>,
}

impl ChannelSubscription {
    fn new(stats: Arc<SourceStats>) -> Self {
        Self {
            demand: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
            stop: Notify::new(),
            stats,
        }
    }

    /// Take one unit of demand; unbounded demand is never consumed
    fn try_take(&self) -> bool {
        self.demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| match d {
                0 => None,
                u64::MAX => Some(u64::MAX),
                d => Some(d - 1),
            })
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Subscription for ChannelSubscription {
    fn request(&self, n: u64) {
        if n == 0 || self.is_cancelled() {
            return;
        }
        self.stats.record_requested(n);
        let _ = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_add(n))
            });
        self.wake.notify_one();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.stats.record_cancelled();
            self.wake.notify_one();
            self.stop.notify_one();
        }
    }
}

async fn pump<T: Send + 'static>(
    name: String,
    receiver: Receiver<T>,
    close_error: Option<StreamError>,
    subscriber: SharedSubscriber<T>,
    subscription: Arc<ChannelSubscription>,
    stats: Arc<SourceStats>,
) {
    debug!(source = %name, "ChannelSource pump started");

    loop {
        // Hold at most one message; a closed, drained channel ends without demand
        let message = tokio::select! {
            message = receiver.recv() => message,
            _ = subscription.stop.notified() => return,
        };
        let Ok(value) = message else {
            break;
        };

        while !subscription.try_take() {
            if subscription.is_cancelled() {
                debug!(source = %name, "ChannelSource cancelled");
                return;
            }
            subscription.wake.notified().await;
        }
        if subscription.is_cancelled() {
            return;
        }

        stats.record_emitted();
        trace!(source = %name, "ChannelSource forwarding message");
        subscriber.on_next(value);
    }

    debug!(source = %name, emitted = stats.emitted(), "ChannelSource channel closed");
    match close_error {
        Some(error) => subscriber.on_error(error),
        None => subscriber.on_complete(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::{CollectSink, Terminal};

    #[tokio::test]
    async fn test_forwards_until_channel_closes() {
        let (tx, rx) = async_channel::bounded(4);
        let source = ChannelSource::new("chan", rx);
        let sink = CollectSink::unbounded();
        source.subscribe(sink.clone());

        for i in 0..3u32 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let terminal = tokio::time::timeout(Duration::from_secs(1), sink.wait_terminal())
            .await
            .unwrap();
        assert_eq!(terminal, Terminal::Complete);
        assert_eq!(sink.values(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_honors_demand() {
        let (tx, rx) = async_channel::unbounded();
        let source = ChannelSource::new("slow", rx);
        let sink = CollectSink::with_initial_request(1);
        source.subscribe(sink.clone());

        for i in 0..5u32 {
            tx.send(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.values(), vec![0]);
        // One message is held while waiting for demand
        assert_eq!(tx.len(), 3);

        sink.request(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.values(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_close_error_replaces_completion() {
        let (tx, rx) = async_channel::bounded::<u32>(1);
        let source = ChannelSource::new("failing", rx).with_close_error(StreamError::upstream("lost"));
        let sink = CollectSink::with_initial_request(0);
        source.subscribe(sink.clone());

        drop(tx);
        let terminal = tokio::time::timeout(Duration::from_secs(1), sink.wait_terminal())
            .await
            .unwrap();
        assert_eq!(terminal, Terminal::Error);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_second_subscriber_rejected() {
        let (_tx, rx) = async_channel::unbounded::<u8>();
        let source = ChannelSource::new("once", rx);
        source.subscribe(CollectSink::unbounded());

        let late = CollectSink::unbounded();
        source.subscribe(late.clone());
        assert_eq!(late.terminal(), Some(Terminal::Error));
    }
}
