//! Task descriptions and the scheduler's per-task record

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eyre::Report;
use tokio::sync::{watch, Notify};

use crate::domain::{Priority, TaskId};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// What a pending task wants the scheduler to do about one currently
/// executing task before it can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyAction {
    /// Block until the named executing task completes; while blocked, elevate
    /// the blocker's priority to the blocked task's priority.
    WaitAndElevate(TaskId),

    /// Cancel the named executing task so this one may run now; the cancelled
    /// task is re-queued and re-run later.
    CancelAndReschedule(TaskId),
}

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Waiting for a scheduling pass to admit it.
    Pending,
    /// Its execute function is running.
    Executing,
    /// Asked to stop so a higher-priority task can run; will be re-queued.
    CancelledToBeRescheduled,
    /// Done. Terminal.
    Finished,
}

/// The value delivered through a task's result handle.
///
/// Cancel-to-be-rescheduled never appears here: from an awaiter's point of
/// view a rescheduled task simply takes longer.
#[derive(Debug, Clone)]
pub enum TaskResult {
    /// The execute function returned successfully.
    Finished,
    /// The execute function returned an error.
    Failed(Arc<Report>),
    /// The task was cancelled, before or during execution.
    Cancelled,
}

impl TaskResult {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A unit of schedulable work.
///
/// The scheduler never looks at a description beyond these operations.
/// Descriptions must be cheap to share (`Arc`-wrapped internally) and carry a
/// stable [`TaskId`] so that other tasks can name them in dependency actions.
///
/// Cancellation is cooperative the Rust way: when a task is cancelled,
/// externally or to be rescheduled, its `execute` future is dropped at the
/// next suspension point. Execute bodies must be drop-safe mid-await.
#[async_trait]
pub trait TaskDescription: Send + Sync + 'static {
    /// Stable identifier of this task.
    fn id(&self) -> TaskId;

    /// Run the task. Failures travel through the result handle to awaiters.
    async fn execute(&self) -> eyre::Result<()>;

    /// Dependency actions against the currently executing set.
    ///
    /// Called on every scheduling pass while this task is pending; must
    /// terminate in bounded work.
    fn dependencies(&self, currently_executing: &[Arc<Self>]) -> Vec<DependencyAction>;

    /// Whether running this task twice has the same observable effect as
    /// running it once. Only idempotent tasks may be cancelled to be
    /// rescheduled.
    fn is_idempotent(&self) -> bool {
        false
    }

    /// How many CPU cores this task is expected to saturate. Counts against
    /// the concurrency cap while the task executes.
    fn estimated_cpu_core_count(&self) -> usize {
        1
    }
}

pub(crate) type StateCallback = Arc<dyn Fn(ExecutionState) + Send + Sync>;

/// The scheduler's owning record for one scheduled task.
///
/// Records live in the scheduler's pending/executing collections; the public
/// [`QueuedTask`](super::QueuedTask) handle shares the record by `Arc` and
/// reaches the scheduler through a weak back-reference, so there is no
/// reference cycle between the two.
pub(crate) struct TaskRecord<D> {
    pub(crate) description: Arc<D>,
    priority: AtomicU8,
    state: Mutex<ExecutionState>,
    /// Insertion-order tiebreak for the pending sort; refreshed on re-queue.
    sequence: AtomicU64,
    result_tx: watch::Sender<Option<TaskResult>>,
    result_rx: watch::Receiver<Option<TaskResult>>,
    /// External cancellation requested via `QueuedTask::cancel`.
    pub(crate) externally_cancelled: AtomicBool,
    /// Scheduler-internal cancel-to-be-rescheduled signal.
    pub(crate) cancelled_to_be_rescheduled: AtomicBool,
    cancel_signal: Notify,
    state_changed: Option<StateCallback>,
}

impl<D> TaskRecord<D> {
    pub(crate) fn new(priority: Priority, description: Arc<D>, state_changed: Option<StateCallback>) -> Self {
        let (result_tx, result_rx) = watch::channel(None);
        Self {
            description,
            priority: AtomicU8::new(priority as u8),
            state: Mutex::new(ExecutionState::Pending),
            sequence: AtomicU64::new(next_sequence()),
            result_tx,
            result_rx,
            externally_cancelled: AtomicBool::new(false),
            cancelled_to_be_rescheduled: AtomicBool::new(false),
            cancel_signal: Notify::new(),
            state_changed,
        }
    }

    pub(crate) fn priority(&self) -> Priority {
        Priority::from_repr(self.priority.load(Ordering::Acquire))
    }

    /// Raise the stored priority to at least `priority`. Returns whether the
    /// stored value changed. Priorities only ever go up through here, which
    /// keeps them weakly monotonic for the task's lifetime.
    pub(crate) fn elevate_priority(&self, priority: Priority) -> bool {
        let previous = self.priority.fetch_max(priority as u8, Ordering::AcqRel);
        previous < priority as u8
    }

    pub(crate) fn state(&self) -> ExecutionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_state(&self, new_state: ExecutionState) {
        {
            let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *state = new_state;
        }
        if let Some(callback) = &self.state_changed {
            callback(new_state);
        }
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Give the record a fresh insertion position for re-queueing.
    pub(crate) fn refresh_sequence(&self) {
        self.sequence.store(next_sequence(), Ordering::Release);
    }

    /// Publish the final result. Later calls are ignored; the result is
    /// delivered to awaiters exactly once.
    pub(crate) fn resolve(&self, result: TaskResult) {
        self.result_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }

    /// Await the final result. Many waiters may do this concurrently.
    pub(crate) async fn wait_result(&self) -> TaskResult {
        let mut rx = self.result_rx.clone();
        match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => match slot.as_ref() {
                Some(result) => result.clone(),
                None => TaskResult::Cancelled,
            },
            // Sender gone without a value: the scheduler was torn down.
            Err(_) => TaskResult::Cancelled,
        }
    }

    pub(crate) fn request_external_cancel(&self) {
        self.externally_cancelled.store(true, Ordering::Release);
        self.cancel_signal.notify_waiters();
    }

    pub(crate) fn request_reschedule(&self) {
        self.cancelled_to_be_rescheduled.store(true, Ordering::Release);
        self.set_state(ExecutionState::CancelledToBeRescheduled);
        self.cancel_signal.notify_waiters();
    }

    /// Resolves when either cancellation flag is raised.
    pub(crate) async fn cancellation_requested(&self) {
        loop {
            if self.externally_cancelled.load(Ordering::Acquire)
                || self.cancelled_to_be_rescheduled.load(Ordering::Acquire)
            {
                return;
            }
            let notified = self.cancel_signal.notified();
            // Re-check after arming: the flag may have been raised between
            // the load above and the waiter registration.
            if self.externally_cancelled.load(Ordering::Acquire)
                || self.cancelled_to_be_rescheduled.load(Ordering::Acquire)
            {
                return;
            }
            notified.await;
        }
    }
}
