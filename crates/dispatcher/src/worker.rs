//! WorkerDispatcher - runs tasks on an isolated tokio worker task

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace};

use contracts::{DispatchError, Dispatcher, DispatcherKind, Task};

use crate::metrics::DispatcherMetrics;

/// Dispatcher backed by a single tokio worker
///
/// The queue is unbounded so `dispatch` never blocks the caller, but it has a
/// soft `capacity`: once that many tasks are pending, `try_dispatch` refuses
/// new work with `DispatchError::InsufficientCapacity`.
pub struct WorkerDispatcher {
    /// Dispatcher name
    name: String,
    /// Soft queue capacity
    capacity: usize,
    /// Channel to the worker; `None` after shutdown
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    /// Accepted tasks not yet started
    pending: Arc<AtomicUsize>,
    /// Shared metrics
    metrics: Arc<DispatcherMetrics>,
    /// Worker task handle
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerDispatcher {
    /// Create a new WorkerDispatcher and spawn the worker task
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        let name = name.into();
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let metrics = Arc::new(DispatcherMetrics::new());

        let worker_pending = Arc::clone(&pending);
        let worker_metrics = Arc::clone(&metrics);
        let worker_name = name.clone();

        let worker_handle = tokio::spawn(async move {
            dispatch_worker(rx, worker_pending, worker_metrics, worker_name).await;
        });

        Arc::new(Self {
            name,
            capacity,
            tx: Mutex::new(Some(tx)),
            pending,
            metrics,
            worker_handle: Mutex::new(Some(worker_handle)),
        })
    }

    /// Get current metrics
    pub fn metrics(&self) -> &Arc<DispatcherMetrics> {
        &self.metrics
    }

    /// Soft queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks accepted but not yet started
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop accepting tasks, run what is queued, and wait for the worker
    #[instrument(name = "worker_dispatcher_shutdown", skip(self), fields(dispatcher = %self.name))]
    pub async fn shutdown(&self) {
        // Dropping the sender lets the worker drain and stop
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());

        let handle = self
            .worker_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(dispatcher = %self.name, error = ?e, "Worker task panicked");
            }
        }
        debug!(dispatcher = %self.name, "WorkerDispatcher shutdown complete");
    }

    fn send(&self, task: Task) -> Result<(), DispatchError> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = match guard.as_ref() {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        };
        drop(guard);

        if sent {
            self.metrics.inc_dispatched_count();
            self.metrics.set_queue_len(self.pending());
            Ok(())
        } else {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            Err(DispatchError::Shutdown {
                dispatcher: self.name.clone(),
            })
        }
    }
}

impl Dispatcher for WorkerDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DispatcherKind {
        DispatcherKind::Worker
    }

    fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.send(task)
    }

    fn try_dispatch(&self, task: Task) -> Result<(), DispatchError> {
        let capacity = self.capacity;
        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                (p < capacity).then_some(p + 1)
            });

        if reserved.is_err() {
            self.metrics.inc_rejected_count();
            trace!(dispatcher = %self.name, capacity, "Dispatcher saturated, task refused");
            return Err(DispatchError::InsufficientCapacity {
                dispatcher: self.name.clone(),
            });
        }
        self.send(task)
    }
}

/// Worker task that runs queued tasks in order
#[instrument(
    name = "dispatch_worker_loop",
    skip(rx, pending, metrics),
    fields(dispatcher = %name)
)]
async fn dispatch_worker(
    mut rx: mpsc::UnboundedReceiver<Task>,
    pending: Arc<AtomicUsize>,
    metrics: Arc<DispatcherMetrics>,
    name: String,
) {
    debug!(dispatcher = %name, "Dispatch worker started");

    while let Some(task) = rx.recv().await {
        let left = pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        metrics.set_queue_len(left);

        match catch_unwind(AssertUnwindSafe(task)) {
            Ok(()) => metrics.inc_completed_count(),
            Err(_) => {
                metrics.inc_failure_count();
                // Continue processing - one task must not take the worker down
                error!(dispatcher = %name, "Dispatched task panicked");
            }
        }
    }

    debug!(dispatcher = %name, "Dispatch worker stopped");
}
