//! Ordered execution of async closures over the ambient tokio runtime

use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::domain::Priority;

/// Whether a queue runs its closures one at a time or in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Every closure runs after the previous one, in enqueue order.
    Serial,
    /// Closures run in parallel; only barriers impose ordering.
    Concurrent,
}

/// Error returned by [`QueueHandle::join`] when the closure produced no value.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queued closure was cancelled before completion")]
    Cancelled,

    #[error("queued closure panicked")]
    Panicked,
}

/// An entry that has been enqueued but whose runtime task has not finished.
///
/// Entries are strictly ordered by insertion. The `finished` channel flips to
/// `true` exactly once, when the entry's cleanup runs; dependents wait on it
/// and treat a dropped sender the same as a finished entry.
struct PendingEntry {
    id: Uuid,
    is_barrier: bool,
    finished: watch::Receiver<bool>,
}

struct QueueInner {
    kind: QueueKind,
    pending: Mutex<Vec<PendingEntry>>,
}

/// Removes the owning entry from the pending list and signals completion.
///
/// Lives inside the spawned runtime task so that it runs both when the
/// closure finishes and when the task is aborted. Cleanup is infallible:
/// nothing in here can fail in a way that leaves dependents blocked.
struct CleanupGuard {
    inner: Arc<QueueInner>,
    id: Uuid,
    finished_tx: watch::Sender<bool>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.retain(|entry| entry.id != self.id);
        }
        let _ = self.finished_tx.send(true);
    }
}

/// Handle to an enqueued closure. Awaiting it yields the closure's result.
pub struct QueueHandle<T> {
    join: JoinHandle<T>,
}

impl<T> QueueHandle<T> {
    /// Await the closure's result.
    ///
    /// Errors inside the closure travel in `T`; [`QueueError`] only reports
    /// that the closure never produced a value at all.
    pub async fn join(self) -> Result<T, QueueError> {
        match self.join.await {
            Ok(value) => Ok(value),
            Err(err) if err.is_cancelled() => Err(QueueError::Cancelled),
            Err(_) => Err(QueueError::Panicked),
        }
    }

    /// Cancel the underlying runtime task.
    ///
    /// The pending entry is removed only when the task's cleanup runs, so
    /// ordering guarantees for later entries are unaffected.
    pub fn cancel(&self) {
        self.join.abort();
    }
}

/// A cooperative FIFO queue composed over the tokio runtime.
///
/// The queue owns no thread. Each enqueued closure is spawned as a runtime
/// task that first awaits the entries it is ordered after, then runs the
/// closure, then removes itself from the pending list.
///
/// A closure that fails (or panics) still unblocks its dependents: dependents
/// wait for the entry to finish, not to succeed.
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

impl AsyncQueue {
    /// A queue that runs closures strictly one after another.
    pub fn serial() -> Self {
        Self::new(QueueKind::Serial)
    }

    /// A queue that runs closures in parallel, fenced by barriers.
    pub fn concurrent() -> Self {
        Self::new(QueueKind::Concurrent)
    }

    fn new(kind: QueueKind) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                kind,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    /// Enqueue a closure. Must be called from within a tokio runtime.
    pub fn enqueue<T, F>(&self, priority: Priority, future: F) -> QueueHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.enqueue_inner(priority, false, future)
    }

    /// Enqueue a closure that fences the queue on both sides.
    ///
    /// The barrier starts only after every earlier entry has finished, and no
    /// later entry starts before the barrier finishes. On a serial queue the
    /// flag is recorded but adds nothing: every serial entry already fences.
    pub fn enqueue_barrier<T, F>(&self, priority: Priority, future: F) -> QueueHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.enqueue_inner(priority, true, future)
    }

    fn enqueue_inner<T, F>(&self, priority: Priority, is_barrier: bool, future: F) -> QueueHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let id = Uuid::now_v7();
        let (finished_tx, finished_rx) = watch::channel(false);

        // Dependency computation happens under the pending-list lock, before
        // the new entry's runtime task is spawned.
        let dependencies: Vec<watch::Receiver<bool>> = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let dependencies = match self.inner.kind {
                QueueKind::Serial => {
                    pending.last().map(|entry| entry.finished.clone()).into_iter().collect()
                }
                QueueKind::Concurrent if is_barrier => {
                    // Everything since (and including) the last barrier, or
                    // every pending entry if there is none.
                    let start = pending
                        .iter()
                        .rposition(|entry| entry.is_barrier)
                        .unwrap_or(0);
                    pending[start..].iter().map(|entry| entry.finished.clone()).collect()
                }
                QueueKind::Concurrent => pending
                    .iter()
                    .rev()
                    .find(|entry| entry.is_barrier)
                    .map(|entry| entry.finished.clone())
                    .into_iter()
                    .collect(),
            };

            pending.push(PendingEntry {
                id,
                is_barrier,
                finished: finished_rx,
            });

            dependencies
        };

        debug!(
            entry_id = %id,
            %priority,
            is_barrier,
            dependency_count = dependencies.len(),
            "AsyncQueue::enqueue"
        );

        // Constructed before the spawn so that an abort at any point, even
        // before the task is first polled, still runs the cleanup.
        let cleanup = CleanupGuard {
            inner: Arc::clone(&self.inner),
            id,
            finished_tx,
        };
        let join = tokio::spawn(async move {
            let _cleanup = cleanup;

            futures::future::join_all(dependencies.into_iter().map(|mut dependency| async move {
                // A closed channel means the dependency is gone; same as done.
                let _ = dependency.wait_for(|finished| *finished).await;
            }))
            .await;

            future.await
        });

        QueueHandle { join }
    }

    /// Number of entries whose runtime tasks have not yet finished.
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .map(|pending| pending.len())
            .unwrap_or(0)
    }
}
