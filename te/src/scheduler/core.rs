//! Scheduler implementation

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::Priority;

use super::config::ConcurrencyLimits;
use super::task::{DependencyAction, ExecutionState, StateCallback, TaskDescription, TaskRecord, TaskResult};

/// Counts of tasks known to the scheduler, for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    pub pending: usize,
    pub executing: usize,
}

/// Internal state protected by the scheduler's mutex.
///
/// A task record is in exactly one of these collections at any time; moves
/// between them happen only while the lock is held.
struct SchedulerInner<D: TaskDescription> {
    pending: Vec<Arc<TaskRecord<D>>>,
    executing: Vec<Arc<TaskRecord<D>>>,
}

struct SchedulerShared<D: TaskDescription> {
    limits: ConcurrencyLimits,
    inner: Mutex<SchedulerInner<D>>,
}

/// Executes an unordered pool of tasks subject to a priority-banded
/// concurrency cap, caller-declared dependencies on the executing set,
/// priority elevation of blockers, and cancel-and-reschedule of lower
/// priority in-flight work.
///
/// All collection mutations are serialized on one mutex; execute functions
/// run outside it and re-enter it only for post-finish bookkeeping.
///
/// Contract: a task executing on a scheduler must never synchronously wait
/// for another task on the same scheduler while holding its execution slot.
/// Cycles of outer-waits-inner would otherwise consume every slot.
pub struct TaskScheduler<D: TaskDescription> {
    shared: Arc<SchedulerShared<D>>,
}

impl<D: TaskDescription> TaskScheduler<D> {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                limits,
                inner: Mutex::new(SchedulerInner {
                    pending: Vec::new(),
                    executing: Vec::new(),
                }),
            }),
        }
    }

    /// Add a task to the pending set and trigger a scheduling pass.
    ///
    /// The returned [`QueuedTask`] can be awaited for the result, cancelled,
    /// or queried for its current state and priority.
    pub async fn schedule(&self, priority: Priority, description: D) -> QueuedTask<D> {
        self.schedule_inner(priority, description, None).await
    }

    /// Like [`schedule`](Self::schedule), with a callback invoked on every
    /// execution-state transition. The callback runs under the scheduler's
    /// lock and must not call back into the scheduler.
    pub async fn schedule_with_callback(
        &self,
        priority: Priority,
        description: D,
        on_state_changed: impl Fn(ExecutionState) + Send + Sync + 'static,
    ) -> QueuedTask<D> {
        let callback: StateCallback = Arc::new(on_state_changed);
        self.schedule_inner(priority, description, Some(callback)).await
    }

    async fn schedule_inner(
        &self,
        priority: Priority,
        description: D,
        state_changed: Option<StateCallback>,
    ) -> QueuedTask<D> {
        let record = Arc::new(TaskRecord::new(priority, Arc::new(description), state_changed));
        debug!(
            task_id = %record.description.id(),
            %priority,
            "TaskScheduler::schedule: adding pending task"
        );

        {
            let mut inner = self.shared.inner.lock().await;
            inner.pending.push(Arc::clone(&record));
            self.shared.run_scheduling_pass(&mut inner);
        }

        QueuedTask {
            record,
            scheduler: Arc::downgrade(&self.shared),
        }
    }

    /// Current pending/executing counts.
    pub async fn queue_state(&self) -> QueueState {
        let inner = self.shared.inner.lock().await;
        QueueState {
            pending: inner.pending.len(),
            executing: inner.executing.len(),
        }
    }
}

impl<D: TaskDescription> SchedulerShared<D> {
    /// One scheduling pass:
    ///
    /// 1. Sort pending by priority descending, insertion order as tiebreak.
    /// 2. Per pending task: stop the whole pass when the used capacity
    ///    reaches the cap at the task's priority; otherwise evaluate its
    ///    dependency actions against the executing set. Tasks with blockers
    ///    are skipped (and their blockers elevated); a task that needs a
    ///    victim cancelled issues the cancellation and ends the pass; a task
    ///    with neither is admitted and the pass continues.
    ///
    /// Runs synchronously under the scheduler lock; never suspends.
    fn run_scheduling_pass(self: &Arc<Self>, inner: &mut SchedulerInner<D>) {
        inner.pending.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.sequence().cmp(&b.sequence()))
        });

        let mut index = 0;
        while index < inner.pending.len() {
            let task = Arc::clone(&inner.pending[index]);
            let task_id = task.description.id();

            let used_capacity: usize = inner
                .executing
                .iter()
                .map(|record| record.description.estimated_cpu_core_count())
                .sum();
            let cap = self.limits.max_concurrent_at(task.priority());
            if used_capacity >= cap {
                debug!(
                    %task_id,
                    used_capacity,
                    cap,
                    priority = %task.priority(),
                    "scheduling pass stopping: capacity exhausted"
                );
                return;
            }

            let executing_descriptions: Vec<Arc<D>> = inner
                .executing
                .iter()
                .map(|record| Arc::clone(&record.description))
                .collect();
            let actions = task.description.dependencies(&executing_descriptions);

            let mut wait_targets = Vec::new();
            let mut reschedule_targets: Vec<Arc<TaskRecord<D>>> = Vec::new();
            for action in actions {
                match action {
                    DependencyAction::WaitAndElevate(target_id) => wait_targets.push(target_id),
                    DependencyAction::CancelAndReschedule(target_id) => {
                        let Some(target) = inner
                            .executing
                            .iter()
                            .find(|record| record.description.id() == target_id)
                        else {
                            warn!(
                                %task_id,
                                %target_id,
                                "dropping dependency action: target is not currently executing"
                            );
                            continue;
                        };
                        if !target.description.is_idempotent() {
                            warn!(
                                %task_id,
                                %target_id,
                                "demoting cancel-and-reschedule to wait: target is not idempotent"
                            );
                            wait_targets.push(target_id);
                        } else if target.priority() > task.priority() {
                            warn!(
                                %task_id,
                                %target_id,
                                target_priority = %target.priority(),
                                "demoting cancel-and-reschedule to wait: target outranks the new task"
                            );
                            wait_targets.push(target_id);
                        } else {
                            reschedule_targets.push(Arc::clone(target));
                        }
                    }
                }
            }

            let mut has_blockers = false;
            for target_id in wait_targets {
                let Some(blocker) = inner
                    .executing
                    .iter()
                    .find(|record| record.description.id() == target_id)
                else {
                    warn!(
                        %task_id,
                        %target_id,
                        "dropping dependency action: target is not currently executing"
                    );
                    continue;
                };
                has_blockers = true;
                if blocker.elevate_priority(task.priority()) {
                    debug!(
                        blocker_id = %target_id,
                        elevated_to = %task.priority(),
                        waiting_task = %task_id,
                        "elevated blocker priority"
                    );
                }
            }
            if has_blockers {
                index += 1;
                continue;
            }

            if !reschedule_targets.is_empty() {
                for victim in reschedule_targets {
                    debug!(
                        victim_id = %victim.description.id(),
                        winner_id = %task_id,
                        "cancelling executing task to be rescheduled"
                    );
                    victim.request_reschedule();
                }
                // The victims re-trigger the pass when their execution
                // actually unwinds; only then can this task be admitted.
                return;
            }

            // Admit: the removal shifts the next candidate into this index.
            inner.pending.remove(index);
            inner.executing.push(Arc::clone(&task));
            task.set_state(ExecutionState::Executing);
            debug!(%task_id, priority = %task.priority(), "task admitted");
            self.spawn_execution(task);
        }
    }

    /// Run a task's execute function as a runtime task, racing it against the
    /// record's cancellation signal, then re-enter the scheduler for
    /// bookkeeping.
    fn spawn_execution(self: &Arc<Self>, record: Arc<TaskRecord<D>>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = record.cancellation_requested() => None,
                result = record.description.execute() => Some(result),
            };
            shared.finish_execution(record, outcome).await;
        });
    }

    /// Post-execution bookkeeping: removes the record from the executing set,
    /// settles or re-queues it, and runs another scheduling pass.
    async fn finish_execution(self: Arc<Self>, record: Arc<TaskRecord<D>>, outcome: Option<eyre::Result<()>>) {
        let task_id = record.description.id();
        let mut inner = self.inner.lock().await;
        inner.executing.retain(|executing| !Arc::ptr_eq(executing, &record));

        if record.externally_cancelled.load(std::sync::atomic::Ordering::Acquire) {
            // External cancellation wins over a pending reschedule.
            debug!(%task_id, "task finished: externally cancelled");
            record.set_state(ExecutionState::Finished);
            record.resolve(TaskResult::Cancelled);
        } else if record
            .cancelled_to_be_rescheduled
            .swap(false, std::sync::atomic::Ordering::AcqRel)
        {
            debug!(%task_id, "re-queueing task after cancel-to-be-rescheduled");
            record.refresh_sequence();
            record.set_state(ExecutionState::Pending);
            inner.pending.push(Arc::clone(&record));
        } else {
            let result = match outcome {
                Some(Ok(())) => TaskResult::Finished,
                Some(Err(report)) => {
                    debug!(%task_id, error = %report, "task finished: execute failed");
                    TaskResult::Failed(Arc::new(report))
                }
                // Cancellation signal without a surviving flag; settle as
                // cancelled rather than leave awaiters hanging.
                None => TaskResult::Cancelled,
            };
            record.set_state(ExecutionState::Finished);
            record.resolve(result);
        }

        self.run_scheduling_pass(&mut inner);
    }

    /// External cancellation entry point shared by all `QueuedTask` handles.
    async fn cancel_task(self: &Arc<Self>, record: &Arc<TaskRecord<D>>) {
        let mut inner = self.inner.lock().await;
        match record.state() {
            ExecutionState::Pending => {
                inner.pending.retain(|pending| !Arc::ptr_eq(pending, record));
                record.request_external_cancel();
                record.set_state(ExecutionState::Finished);
                record.resolve(TaskResult::Cancelled);
                debug!(task_id = %record.description.id(), "cancelled pending task");
            }
            ExecutionState::Executing | ExecutionState::CancelledToBeRescheduled => {
                debug!(task_id = %record.description.id(), "requesting cancellation of executing task");
                record.request_external_cancel();
            }
            ExecutionState::Finished => {}
        }
    }

    async fn trigger_pass(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        self.run_scheduling_pass(&mut inner);
    }
}

impl<D: TaskDescription> Drop for SchedulerShared<D> {
    fn drop(&mut self) {
        // Tasks still tracked here can never be resolved by anyone else;
        // settle their handles so awaiters do not hang.
        if let Ok(inner) = self.inner.try_lock() {
            for record in inner.pending.iter().chain(inner.executing.iter()) {
                record.resolve(TaskResult::Cancelled);
            }
        }
    }
}

/// Handle to a scheduled task.
///
/// Cheap to clone; every clone shares the same record, so any number of
/// consumers may await the result. The scheduler is referenced weakly:
/// dropping the scheduler settles outstanding handles as cancelled.
pub struct QueuedTask<D: TaskDescription> {
    record: Arc<TaskRecord<D>>,
    scheduler: Weak<SchedulerShared<D>>,
}

impl<D: TaskDescription> Clone for QueuedTask<D> {
    fn clone(&self) -> Self {
        Self {
            record: Arc::clone(&self.record),
            scheduler: Weak::clone(&self.scheduler),
        }
    }
}

impl<D: TaskDescription> QueuedTask<D> {
    /// The identifier of the underlying task description.
    pub fn id(&self) -> crate::domain::TaskId {
        self.record.description.id()
    }

    /// The task's current priority. Weakly monotonically non-decreasing
    /// until the task finishes or is re-queued.
    pub fn priority(&self) -> Priority {
        self.record.priority()
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.record.state()
    }

    /// Await the final result without affecting the task: dropping this
    /// future leaves the task running.
    pub async fn wait(&self) -> TaskResult {
        self.record.wait_result().await
    }

    /// Await the final result; if this future is dropped before the task
    /// settles, the task is cancelled.
    pub async fn wait_propagating_cancellation(&self) -> TaskResult {
        let mut guard = CancelOnDrop { task: Some(self.clone()) };
        let result = self.record.wait_result().await;
        guard.task = None;
        result
    }

    /// Cooperative external cancellation.
    ///
    /// A pending task settles immediately as cancelled and never executes.
    /// An executing task's execute future is dropped at its next suspension
    /// point; there is no guarantee about when that happens.
    pub async fn cancel(&self) {
        if let Some(shared) = self.scheduler.upgrade() {
            shared.cancel_task(&self.record).await;
        } else {
            self.record.request_external_cancel();
            self.record.resolve(TaskResult::Cancelled);
        }
    }

    /// Raise the task's priority to at least `priority` and let the next
    /// scheduling pass observe it.
    pub async fn elevate_priority(&self, priority: Priority) {
        if self.record.elevate_priority(priority) {
            debug!(task_id = %self.id(), elevated_to = %priority, "priority elevated via handle");
            if let Some(shared) = self.scheduler.upgrade() {
                shared.trigger_pass().await;
            }
        }
    }
}

/// Cancels the task when dropped armed; disarmed once the result arrives.
struct CancelOnDrop<D: TaskDescription> {
    task: Option<QueuedTask<D>>,
}

impl<D: TaskDescription> Drop for CancelOnDrop<D> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { task.cancel().await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use async_trait::async_trait;
    use eyre::eyre;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};
    use tokio::time::timeout;

    /// A scriptable task description: announces starts on a channel, blocks
    /// until released, and returns a fixed dependency-action list that the
    /// scheduler re-evaluates on every pass.
    struct TestTask {
        id: TaskId,
        actions: Vec<DependencyAction>,
        idempotent: bool,
        cores: usize,
        fail: bool,
        /// First run hangs until cancelled; later runs complete normally.
        block_first_run: bool,
        started: mpsc::UnboundedSender<TaskId>,
        release: watch::Receiver<bool>,
        run_count: AtomicUsize,
    }

    #[async_trait]
    impl TaskDescription for TestTask {
        fn id(&self) -> TaskId {
            self.id
        }

        async fn execute(&self) -> eyre::Result<()> {
            let run = self.run_count.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.send(self.id);
            if self.block_first_run && run == 0 {
                futures::future::pending::<()>().await;
            }
            let mut release = self.release.clone();
            let _ = release.wait_for(|released| *released).await;
            if self.fail {
                return Err(eyre!("task failure"));
            }
            Ok(())
        }

        fn dependencies(&self, _currently_executing: &[Arc<Self>]) -> Vec<DependencyAction> {
            self.actions.clone()
        }

        fn is_idempotent(&self) -> bool {
            self.idempotent
        }

        fn estimated_cpu_core_count(&self) -> usize {
            self.cores
        }
    }

    struct TestHarness {
        started_tx: mpsc::UnboundedSender<TaskId>,
        started_rx: mpsc::UnboundedReceiver<TaskId>,
        release_tx: watch::Sender<bool>,
        release_rx: watch::Receiver<bool>,
    }

    impl TestHarness {
        fn new() -> Self {
            let (started_tx, started_rx) = mpsc::unbounded_channel();
            let (release_tx, release_rx) = watch::channel(false);
            Self {
                started_tx,
                started_rx,
                release_tx,
                release_rx,
            }
        }

        fn task(&self, id: TaskId) -> TestTask {
            TestTask {
                id,
                actions: Vec::new(),
                idempotent: false,
                cores: 1,
                fail: false,
                block_first_run: false,
                started: self.started_tx.clone(),
                release: self.release_rx.clone(),
                run_count: AtomicUsize::new(0),
            }
        }

        fn release_all(&self) {
            let _ = self.release_tx.send(true);
        }

        async fn expect_started(&mut self) -> TaskId {
            timeout(Duration::from_secs(5), self.started_rx.recv())
                .await
                .expect("timed out waiting for a task to start")
                .expect("started channel closed")
        }
    }

    async fn expect_state(scheduler: &TaskScheduler<TestTask>, pending: usize, executing: usize) {
        let expected = QueueState { pending, executing };
        timeout(Duration::from_secs(5), async {
            loop {
                if scheduler.queue_state().await == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("scheduler never reached state {:?}", expected));
    }

    #[tokio::test]
    async fn test_high_priority_task_is_admitted_past_a_saturated_low_band() {
        let limits = ConcurrencyLimits::new([(Priority::High, 4), (Priority::Low, 2)]).unwrap();
        let scheduler = TaskScheduler::new(limits);
        let mut harness = TestHarness::new();

        let mut low_tasks = Vec::new();
        for _ in 0..4 {
            low_tasks.push(scheduler.schedule(Priority::Low, harness.task(TaskId::next())).await);
        }

        // Exactly two of the four low-priority tasks may run.
        harness.expect_started().await;
        harness.expect_started().await;
        expect_state(&scheduler, 2, 2).await;

        // The high-priority task is admitted on top within one pass.
        let high = scheduler.schedule(Priority::High, harness.task(TaskId::next())).await;
        let started = harness.expect_started().await;
        assert_eq!(started, high.id());
        expect_state(&scheduler, 2, 3).await;

        harness.release_all();
        for task in low_tasks {
            assert!(matches!(task.wait().await, TaskResult::Finished));
        }
        assert!(matches!(high.wait().await, TaskResult::Finished));
    }

    #[tokio::test]
    async fn test_cancel_and_reschedule_requeues_the_victim() {
        let limits = ConcurrencyLimits::new([(Priority::Low, 2)]).unwrap();
        let scheduler = TaskScheduler::new(limits);
        let mut harness = TestHarness::new();
        harness.release_all();

        let victim_id = TaskId::next();
        let mut victim_task = harness.task(victim_id);
        victim_task.idempotent = true;
        victim_task.block_first_run = true;

        let states = Arc::new(StdMutex::new(Vec::new()));
        let observed = Arc::clone(&states);
        let victim = scheduler
            .schedule_with_callback(Priority::Low, victim_task, move |state| {
                observed.lock().unwrap().push(state);
            })
            .await;
        assert_eq!(harness.expect_started().await, victim_id);

        // The winner needs both cores, so the victim has to go.
        let winner_id = TaskId::next();
        let mut winner_task = harness.task(winner_id);
        winner_task.cores = 2;
        winner_task.actions = vec![DependencyAction::CancelAndReschedule(victim_id)];
        let winner = scheduler.schedule(Priority::Low, winner_task).await;

        // Winner runs first; the victim is re-admitted after it finishes.
        assert_eq!(harness.expect_started().await, winner_id);
        assert!(matches!(winner.wait().await, TaskResult::Finished));
        assert_eq!(harness.expect_started().await, victim_id);
        assert!(matches!(victim.wait().await, TaskResult::Finished));

        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ExecutionState::Executing,
                ExecutionState::CancelledToBeRescheduled,
                ExecutionState::Pending,
                ExecutionState::Executing,
                ExecutionState::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn test_non_idempotent_task_is_demoted_to_wait() {
        let limits = ConcurrencyLimits::new([(Priority::Low, 2)]).unwrap();
        let scheduler = TaskScheduler::new(limits);
        let mut harness = TestHarness::new();

        let victim_id = TaskId::next();
        let victim = scheduler.schedule(Priority::Low, harness.task(victim_id)).await;
        assert_eq!(harness.expect_started().await, victim_id);

        let contender_id = TaskId::next();
        let mut contender_task = harness.task(contender_id);
        contender_task.actions = vec![DependencyAction::CancelAndReschedule(victim_id)];
        let contender = scheduler.schedule(Priority::Low, contender_task).await;

        // The victim keeps executing; the contender waits instead.
        expect_state(&scheduler, 1, 1).await;
        assert_eq!(victim.execution_state(), ExecutionState::Executing);
        assert_eq!(victim.priority(), Priority::Low);

        harness.release_all();
        assert!(matches!(victim.wait().await, TaskResult::Finished));
        assert_eq!(harness.expect_started().await, contender_id);
        assert!(matches!(contender.wait().await, TaskResult::Finished));
    }

    #[tokio::test]
    async fn test_waiting_task_elevates_its_blocker() {
        let limits = ConcurrencyLimits::new([(Priority::Low, 4)]).unwrap();
        let scheduler = TaskScheduler::new(limits);
        let mut harness = TestHarness::new();

        let blocker_id = TaskId::next();
        let blocker = scheduler.schedule(Priority::Low, harness.task(blocker_id)).await;
        assert_eq!(harness.expect_started().await, blocker_id);

        let waiter_id = TaskId::next();
        let mut waiter_task = harness.task(waiter_id);
        waiter_task.actions = vec![DependencyAction::WaitAndElevate(blocker_id)];
        let waiter = scheduler.schedule(Priority::High, waiter_task).await;

        // The blocker's observable priority rises before it completes.
        timeout(Duration::from_secs(5), async {
            while blocker.priority() != Priority::High {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("blocker priority should be elevated");
        assert_eq!(blocker.execution_state(), ExecutionState::Executing);

        harness.release_all();
        assert!(matches!(blocker.wait().await, TaskResult::Finished));
        assert_eq!(harness.expect_started().await, waiter_id);
        assert!(matches!(waiter.wait().await, TaskResult::Finished));
    }

    #[tokio::test]
    async fn test_cap_of_one_serializes_execution() {
        let limits = ConcurrencyLimits::new([(Priority::Low, 1)]).unwrap();
        let scheduler = TaskScheduler::new(limits);
        let mut harness = TestHarness::new();
        harness.release_all();

        let mut tasks = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = TaskId::next();
            ids.push(id);
            tasks.push(scheduler.schedule(Priority::Low, harness.task(id)).await);
        }

        // Starts happen one at a time, in insertion order.
        for id in &ids {
            assert_eq!(harness.expect_started().await, *id);
        }
        for task in tasks {
            assert!(matches!(task.wait().await, TaskResult::Finished));
        }
    }

    #[tokio::test]
    async fn test_pending_tasks_are_admitted_in_priority_order() {
        let limits = ConcurrencyLimits::new([(Priority::Low, 1)]).unwrap();
        let scheduler = TaskScheduler::new(limits);
        let mut harness = TestHarness::new();

        let gate_id = TaskId::next();
        let gate = scheduler.schedule(Priority::Low, harness.task(gate_id)).await;
        assert_eq!(harness.expect_started().await, gate_id);

        let low_id = TaskId::next();
        let low = scheduler.schedule(Priority::Low, harness.task(low_id)).await;
        let high_id = TaskId::next();
        let high = scheduler.schedule(Priority::High, harness.task(high_id)).await;
        expect_state(&scheduler, 2, 1).await;

        harness.release_all();
        assert!(matches!(gate.wait().await, TaskResult::Finished));
        // Despite being scheduled later, the high-priority task runs first.
        assert_eq!(harness.expect_started().await, high_id);
        assert_eq!(harness.expect_started().await, low_id);
        assert!(matches!(high.wait().await, TaskResult::Finished));
        assert!(matches!(low.wait().await, TaskResult::Finished));
    }

    #[tokio::test]
    async fn test_cancelling_a_pending_task_never_executes_it() {
        let limits = ConcurrencyLimits::new([(Priority::Low, 1)]).unwrap();
        let scheduler = TaskScheduler::new(limits);
        let mut harness = TestHarness::new();

        let gate_id = TaskId::next();
        let gate = scheduler.schedule(Priority::Low, harness.task(gate_id)).await;
        assert_eq!(harness.expect_started().await, gate_id);

        let doomed = scheduler.schedule(Priority::Low, harness.task(TaskId::next())).await;
        doomed.cancel().await;
        assert!(doomed.wait().await.is_cancelled());
        assert_eq!(doomed.execution_state(), ExecutionState::Finished);

        harness.release_all();
        assert!(matches!(gate.wait().await, TaskResult::Finished));
        // The cancelled task never started.
        assert!(harness.started_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelling_an_executing_task_settles_as_cancelled() {
        let limits = ConcurrencyLimits::new([(Priority::Low, 1)]).unwrap();
        let scheduler = TaskScheduler::new(limits);
        let mut harness = TestHarness::new();

        let task = scheduler.schedule(Priority::Low, harness.task(TaskId::next())).await;
        harness.expect_started().await;

        task.cancel().await;
        assert!(task.wait().await.is_cancelled());
        expect_state(&scheduler, 0, 0).await;
    }

    #[tokio::test]
    async fn test_execute_failure_is_carried_in_the_result() {
        let scheduler = TaskScheduler::new(ConcurrencyLimits::default_for_tests());
        let mut harness = TestHarness::new();
        harness.release_all();

        let mut failing = harness.task(TaskId::next());
        failing.fail = true;
        let task = scheduler.schedule(Priority::Low, failing).await;

        match task.wait().await {
            TaskResult::Failed(report) => assert!(report.to_string().contains("task failure")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_result_is_delivered_to_every_waiter() {
        let scheduler = TaskScheduler::new(ConcurrencyLimits::default_for_tests());
        let mut harness = TestHarness::new();
        harness.release_all();

        let task = scheduler.schedule(Priority::Low, harness.task(TaskId::next())).await;
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let task = task.clone();
                tokio::spawn(async move { task.wait().await })
            })
            .collect();

        for waiter in waiters {
            assert!(matches!(waiter.await.unwrap(), TaskResult::Finished));
        }
        harness.expect_started().await;
    }

    #[tokio::test]
    async fn test_wait_propagating_cancellation_cancels_on_drop() {
        let limits = ConcurrencyLimits::new([(Priority::Low, 1)]).unwrap();
        let scheduler = TaskScheduler::new(limits);
        let mut harness = TestHarness::new();

        let task = scheduler.schedule(Priority::Low, harness.task(TaskId::next())).await;
        harness.expect_started().await;

        let waiter = task.clone();
        let join = tokio::spawn(async move { waiter.wait_propagating_cancellation().await });
        // Give the waiter a chance to register, then drop it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        join.abort();

        let result = timeout(Duration::from_secs(5), task.wait())
            .await
            .expect("task should settle after the propagating waiter is dropped");
        assert!(result.is_cancelled());
    }

    #[tokio::test]
    async fn test_elevating_a_pending_task_reorders_admission() {
        let limits = ConcurrencyLimits::new([(Priority::Low, 1)]).unwrap();
        let scheduler = TaskScheduler::new(limits);
        let mut harness = TestHarness::new();

        let gate_id = TaskId::next();
        let gate = scheduler.schedule(Priority::Low, harness.task(gate_id)).await;
        assert_eq!(harness.expect_started().await, gate_id);

        let first_id = TaskId::next();
        let first = scheduler.schedule(Priority::Low, harness.task(first_id)).await;
        let second_id = TaskId::next();
        let second = scheduler.schedule(Priority::Low, harness.task(second_id)).await;

        second.elevate_priority(Priority::High).await;
        assert_eq!(second.priority(), Priority::High);

        harness.release_all();
        assert!(matches!(gate.wait().await, TaskResult::Finished));
        assert_eq!(harness.expect_started().await, second_id);
        assert_eq!(harness.expect_started().await, first_id);
        assert!(matches!(first.wait().await, TaskResult::Finished));
        assert!(matches!(second.wait().await, TaskResult::Finished));
    }
}
