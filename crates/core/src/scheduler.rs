use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutionOutcome, ExecutorConfig, TransferExecutor};
use crate::progress::{ProgressBus, ProgressSink, TransferEvent};
use crate::remote::RemoteStorage;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::status::now_unix_ms;
use crate::store::{TaskStore, WriteRetryPolicy, update_with_retry};
use crate::task::{
    Direction, ErrorClass, NewTransfer, Transition, TransferFailure, TransferStatus, TransferTask,
};
use crate::{Error, Result};

const COMMAND_BUFFER: usize = 64;
/// Back-off before re-listing after the store failed to answer a dispatch query.
const LIST_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    pub retry: RetryPolicy,
    pub executor: ExecutorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 2,
            max_concurrent_downloads: 3,
            retry: RetryPolicy::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn bound(&self, direction: Direction) -> usize {
        match direction {
            Direction::Upload => self.max_concurrent_uploads,
            Direction::Download => self.max_concurrent_downloads,
        }
    }
}

enum Command {
    Submit {
        request: NewTransfer,
        reply: oneshot::Sender<Result<TransferTask>>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<Result<TransferTask>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Result<TransferTask>>,
    },
    Resubmit {
        id: String,
        reply: oneshot::Sender<Result<TransferTask>>,
    },
    ClearFinished {
        direction: Direction,
        reply: oneshot::Sender<Result<usize>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Finished {
    id: String,
    outcome: ExecutionOutcome,
}

struct Dispatched {
    direction: Direction,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns admission. Every status change of a queued task is decided here, in
/// one loop; executors only report back through the finished channel.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    bus: ProgressBus,
    executor: Arc<TransferExecutor>,
    config: SchedulerConfig,
    running: HashMap<String, Dispatched>,
    /// WAITING rows whose admission could not be recorded in the store.
    unwritable: HashSet<String>,
    next_retry_at: [Option<u64>; 2],
    finished_tx: mpsc::UnboundedSender<Finished>,
    finished_rx: Option<mpsc::UnboundedReceiver<Finished>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        remote: Arc<dyn RemoteStorage>,
        bus: ProgressBus,
        config: SchedulerConfig,
    ) -> Self {
        let executor = Arc::new(TransferExecutor::new(
            store.clone(),
            remote,
            Arc::new(bus.clone()),
            config.executor.clone(),
        ));
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            store,
            bus,
            executor,
            config,
            running: HashMap::new(),
            unwritable: HashSet::new(),
            next_retry_at: [None; 2],
            finished_tx,
            finished_rx: Some(finished_rx),
        }
    }

    /// Returns every task left RUNNING by a previous process to WAITING.
    pub async fn reconcile_on_startup(&mut self) -> Result<usize> {
        let stale = self
            .store
            .list_by_status_any(TransferStatus::Running)
            .await?;
        let mut reset = 0;
        for mut task in stale {
            if self.running.contains_key(&task.id) {
                continue;
            }
            if self.commit(&mut task, Transition::Recover).await {
                reset += 1;
                info!(
                    event = "reconcile.reset",
                    task_id = %task.id,
                    direction = %task.direction,
                    progress = task.progress,
                    "reconcile.reset"
                );
            }
        }
        info!(event = "reconcile.done", reset, "reconcile.done");
        Ok(reset)
    }

    /// Reconciles, then spawns the scheduling loop.
    pub async fn start(mut self) -> Result<SchedulerHandle> {
        self.reconcile_on_startup().await?;

        let finished_rx = self.finished_rx.take().ok_or(Error::SchedulerClosed)?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        info!(
            event = "scheduler.start",
            max_concurrent_uploads = self.config.max_concurrent_uploads,
            max_concurrent_downloads = self.config.max_concurrent_downloads,
            "scheduler.start"
        );
        tokio::spawn(self.run(commands_rx, finished_rx));
        Ok(SchedulerHandle {
            commands: commands_tx,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut finished: mpsc::UnboundedReceiver<Finished>,
    ) {
        self.dispatch_all().await;
        loop {
            let wake = self.next_wake();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.stop_executors().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.stop_executors().await;
                        break;
                    }
                },
                Some(done) = finished.recv() => self.handle_finished(done).await,
                _ = sleep_until(wake) => {
                    debug!(event = "scheduler.retry_wake", "scheduler.retry_wake");
                }
            }
            self.dispatch_all().await;
        }
        info!(event = "scheduler.stopped", "scheduler.stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { request, reply } => {
                let _ = reply.send(self.submit(request).await);
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(&id).await);
            }
            Command::Remove { id, reply } => {
                let _ = reply.send(self.remove(&id).await);
            }
            Command::Resubmit { id, reply } => {
                let _ = reply.send(self.resubmit(&id).await);
            }
            Command::ClearFinished { direction, reply } => {
                let _ = reply.send(self.clear_finished(direction).await);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn submit(&mut self, request: NewTransfer) -> Result<TransferTask> {
        self.submit_from(request, 0).await
    }

    /// Inserts a fresh WAITING task whose first attempt starts at `resume_from`.
    async fn submit_from(&mut self, request: NewTransfer, resume_from: u64) -> Result<TransferTask> {
        self.ensure_path_free(&request).await?;

        let mut task = TransferTask::new(request, now_unix_ms());
        task.set_progress(resume_from);
        self.store.insert(&mut task).await?;
        info!(
            event = "scheduler.submit",
            task_id = %task.id,
            direction = %task.direction,
            file_name = %task.file_name,
            file_size = task.file_size,
            resume_from = task.progress,
            "scheduler.submit"
        );
        self.bus.publish(TransferEvent::state_changed(&task));
        Ok(task)
    }

    async fn ensure_path_free(&self, request: &NewTransfer) -> Result<()> {
        for status in [TransferStatus::Waiting, TransferStatus::Running] {
            let active = self.store.list_by_status_any(status).await?;
            if let Some(other) = active.iter().find(|t| t.local_path == request.local_path) {
                return Err(Error::Conflict {
                    message: format!(
                        "{} is already used by {} task {}",
                        request.local_path.display(),
                        other.status,
                        other.id
                    ),
                });
            }
        }
        Ok(())
    }

    async fn cancel(&mut self, id: &str) -> Result<TransferTask> {
        if let Some(dispatched) = self.running.get(id) {
            dispatched.cancel.cancel();
            info!(event = "scheduler.cancel_requested", task_id = %id, "scheduler.cancel_requested");
            return self.store.get(id).await?.ok_or_else(|| Error::NotFound {
                id: id.to_string(),
            });
        }

        let mut task = self.store.get(id).await?.ok_or_else(|| Error::NotFound {
            id: id.to_string(),
        })?;
        if task.status.is_terminal() {
            return Err(Error::NotFound { id: id.to_string() });
        }

        // Nothing is executing it, so the cancel takes effect right away.
        task.apply(Transition::Cancel)?;
        update_with_retry(self.store.as_ref(), &mut task, &self.write_policy()).await?;
        self.unwritable.remove(&task.id);
        info!(event = "scheduler.cancelled", task_id = %task.id, "scheduler.cancelled");
        self.bus.publish(TransferEvent::state_changed(&task));
        Ok(task)
    }

    async fn remove(&mut self, id: &str) -> Result<TransferTask> {
        let task = self.store.get(id).await?.ok_or_else(|| Error::NotFound {
            id: id.to_string(),
        })?;
        if !task.status.is_terminal() || self.running.contains_key(id) {
            return Err(Error::InvalidState {
                id: task.id,
                status: task.status,
            });
        }
        self.store.delete(id).await?;
        info!(event = "scheduler.removed", task_id = %id, "scheduler.removed");
        self.bus.publish(TransferEvent::removed(&task));
        Ok(task)
    }

    /// Replaces a FAILED or CANCELLED task with a fresh WAITING one.
    async fn resubmit(&mut self, id: &str) -> Result<TransferTask> {
        let old = self.store.get(id).await?.ok_or_else(|| Error::NotFound {
            id: id.to_string(),
        })?;
        if !matches!(
            old.status,
            TransferStatus::Failed | TransferStatus::Cancelled
        ) {
            return Err(Error::InvalidState {
                id: old.id,
                status: old.status,
            });
        }

        let request = NewTransfer {
            direction: old.direction,
            local_path: old.local_path.clone(),
            remote_ref: old.remote_ref.clone(),
            file_name: Some(old.file_name.clone()),
            file_size: match old.direction {
                Direction::Upload => None,
                Direction::Download => old.file_size,
            },
            checksum: match old.direction {
                Direction::Upload => None,
                Direction::Download => old.checksum.clone(),
            },
        }
        .validate()?;

        let task = self.submit_from(request, kept_prefix(&old).await).await?;
        self.store.delete(&old.id).await?;
        self.unwritable.remove(&old.id);
        self.bus.publish(TransferEvent::removed(&old));
        info!(
            event = "scheduler.resubmitted",
            task_id = %task.id,
            replaces = %old.id,
            "scheduler.resubmitted"
        );
        Ok(task)
    }

    async fn clear_finished(&mut self, direction: Direction) -> Result<usize> {
        let tasks = self.store.list_by_direction(direction).await?;
        let mut removed = 0;
        for task in tasks.iter().filter(|t| t.status.is_terminal()) {
            self.store.delete(&task.id).await?;
            self.bus.publish(TransferEvent::removed(task));
            removed += 1;
        }
        info!(
            event = "scheduler.cleared",
            direction = %direction,
            removed,
            "scheduler.cleared"
        );
        Ok(removed)
    }

    async fn dispatch_all(&mut self) {
        for direction in Direction::ALL {
            self.dispatch(direction).await;
        }
    }

    /// Admits the oldest eligible WAITING tasks until the direction is full.
    async fn dispatch(&mut self, direction: Direction) {
        self.next_retry_at[direction.index()] = None;
        let bound = self.config.bound(direction);
        if self.running_count(direction) >= bound {
            return;
        }

        let waiting = match self
            .store
            .list_by_status(direction, TransferStatus::Waiting)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(
                    event = "scheduler.list_failed",
                    direction = %direction,
                    error = %e,
                    "scheduler.list_failed"
                );
                let retry_at = now_unix_ms() + LIST_FAILURE_BACKOFF.as_millis() as u64;
                self.next_retry_at[direction.index()] = Some(retry_at);
                return;
            }
        };

        let now = now_unix_ms();
        for task in waiting {
            if self.running_count(direction) >= bound {
                break;
            }
            if self.running.contains_key(&task.id) || self.unwritable.contains(&task.id) {
                continue;
            }
            if let Some(at) = task.retry_at
                && at > now
            {
                let slot = &mut self.next_retry_at[direction.index()];
                *slot = Some(slot.map_or(at, |cur| cur.min(at)));
                continue;
            }
            self.admit(task).await;
        }
    }

    async fn admit(&mut self, mut task: TransferTask) {
        if !self.commit(&mut task, Transition::Admit).await {
            return;
        }
        info!(
            event = "scheduler.admit",
            task_id = %task.id,
            direction = %task.direction,
            attempt = task.attempt,
            running = self.running_count(task.direction) + 1,
            bound = self.config.bound(task.direction),
            "scheduler.admit"
        );

        let cancel = CancellationToken::new();
        let id = task.id.clone();
        let direction = task.direction;
        let executor = self.executor.clone();
        let finished = self.finished_tx.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let id = task.id.clone();
            let outcome = executor.run(task, token).await;
            let _ = finished.send(Finished { id, outcome });
        });
        self.running.insert(
            id,
            Dispatched {
                direction,
                cancel,
                handle,
            },
        );
    }

    async fn handle_finished(&mut self, done: Finished) {
        let cancel_requested = self
            .running
            .remove(&done.id)
            .is_some_and(|d| d.cancel.is_cancelled());

        match done.outcome {
            ExecutionOutcome::Completed(mut task) => {
                self.commit(&mut task, Transition::Complete).await;
            }
            ExecutionOutcome::Cancelled(mut task) => {
                self.commit(&mut task, Transition::Cancel).await;
            }
            ExecutionOutcome::Failed(mut task, _) if cancel_requested => {
                self.commit(&mut task, Transition::Cancel).await;
            }
            ExecutionOutcome::Failed(mut task, failure) => {
                task.last_error = Some(failure.clone());
                if !self.commit(&mut task, Transition::Fail).await {
                    return;
                }
                match self.config.retry.decide(task.attempt, failure.class) {
                    RetryDecision::Retry { delay } => {
                        let failed_attempt = task.attempt;
                        task.retry_at = Some(now_unix_ms() + delay.as_millis() as u64);
                        if self.commit(&mut task, Transition::Retry).await {
                            info!(
                                event = "scheduler.retry_scheduled",
                                task_id = %task.id,
                                failed_attempt,
                                next_attempt = task.attempt,
                                delay_ms = delay.as_millis() as u64,
                                error_code = failure.class.code(),
                                "scheduler.retry_scheduled"
                            );
                        }
                    }
                    RetryDecision::Abandon => {
                        warn!(
                            event = "scheduler.abandoned",
                            task_id = %task.id,
                            attempt = task.attempt,
                            error_code = failure.class.code(),
                            error = %failure.message,
                            "scheduler.abandoned"
                        );
                    }
                }
            }
        }
    }

    /// Applies `transition`, persists and publishes the task.
    ///
    /// When the store stays unwritable the task is moved to FAILED with a
    /// storage class instead and `false` is returned.
    async fn commit(&mut self, task: &mut TransferTask, transition: Transition) -> bool {
        let before = task.clone();
        if let Err(e) = task.apply(transition) {
            error!(
                event = "scheduler.invalid_transition",
                task_id = %task.id,
                error = %e,
                "scheduler.invalid_transition"
            );
            return false;
        }

        match update_with_retry(self.store.as_ref(), task, &self.write_policy()).await {
            Ok(()) => {
                debug!(
                    event = "scheduler.transition",
                    task_id = %task.id,
                    from = %before.status,
                    to = %task.status,
                    transition = %transition,
                    "scheduler.transition"
                );
                self.bus.publish(TransferEvent::state_changed(task));
                true
            }
            Err(e) => {
                // An admitted task fails from RUNNING; every other transition
                // is rolled back to the last durable state first.
                if transition != Transition::Admit {
                    *task = before;
                }
                self.fail_on_storage(task, &e).await;
                false
            }
        }
    }

    async fn fail_on_storage(&mut self, task: &mut TransferTask, cause: &Error) {
        error!(
            event = "scheduler.store_write_failed",
            task_id = %task.id,
            status = %task.status,
            error = %cause,
            "scheduler.store_write_failed"
        );
        if task.status == TransferStatus::Running
            && let Err(e) = task.apply(Transition::Fail)
        {
            error!(event = "scheduler.invalid_transition", task_id = %task.id, error = %e, "scheduler.invalid_transition");
            return;
        }
        task.last_error = Some(TransferFailure::new(ErrorClass::Storage, cause.to_string()));
        task.retry_at = None;

        if let Err(e) = update_with_retry(self.store.as_ref(), task, &self.write_policy()).await {
            error!(
                event = "scheduler.failure_unrecorded",
                task_id = %task.id,
                error = %e,
                "scheduler.failure_unrecorded"
            );
            self.unwritable.insert(task.id.clone());
        }
        self.bus.publish(TransferEvent::state_changed(task));
    }

    /// Stops executors without touching their rows; they stay RUNNING and are
    /// recovered by the next startup.
    async fn stop_executors(&mut self) {
        let running: Vec<_> = self.running.drain().collect();
        for (_, dispatched) in &running {
            dispatched.handle.abort();
        }
        for (id, dispatched) in running {
            let _ = dispatched.handle.await;
            debug!(event = "scheduler.executor_stopped", task_id = %id, direction = %dispatched.direction, "scheduler.executor_stopped");
        }
    }

    fn running_count(&self, direction: Direction) -> usize {
        self.running
            .values()
            .filter(|d| d.direction == direction)
            .count()
    }

    fn next_wake(&self) -> Option<Instant> {
        let at = self.next_retry_at.iter().flatten().min().copied()?;
        let delay = at.saturating_sub(now_unix_ms());
        Some(Instant::now() + Duration::from_millis(delay))
    }

    fn write_policy(&self) -> WriteRetryPolicy {
        self.config.executor.store_write.clone()
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Bytes of a replaced download that are still on disk and can be kept.
///
/// Uploads restart from zero: staged chunks are keyed by the old task.
async fn kept_prefix(old: &TransferTask) -> u64 {
    if old.direction != Direction::Download || old.progress == 0 {
        return 0;
    }
    match tokio::fs::metadata(&old.local_path).await {
        Ok(meta) if meta.is_file() && meta.len() >= old.progress => old.progress,
        _ => 0,
    }
}

/// Cloneable sender side of a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::SchedulerClosed)?;
        reply_rx.await.map_err(|_| Error::SchedulerClosed)
    }

    /// Validates synchronously, then queues the task as WAITING.
    pub async fn submit(&self, request: NewTransfer) -> Result<TransferTask> {
        let request = request.validate()?;
        self.request(|reply| Command::Submit { request, reply })
            .await?
    }

    pub async fn cancel(&self, id: &str) -> Result<TransferTask> {
        let id = id.to_string();
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    pub async fn remove(&self, id: &str) -> Result<TransferTask> {
        let id = id.to_string();
        self.request(|reply| Command::Remove { id, reply }).await?
    }

    pub async fn resubmit(&self, id: &str) -> Result<TransferTask> {
        let id = id.to_string();
        self.request(|reply| Command::Resubmit { id, reply }).await?
    }

    pub async fn clear_finished(&self, direction: Direction) -> Result<usize> {
        self.request(|reply| Command::ClearFinished { direction, reply })
            .await?
    }

    /// Stops the loop and waits for running executors to be torn down.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use crate::store::InMemoryTaskStore;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_uploads: 1,
            max_concurrent_downloads: 1,
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
            },
            executor: ExecutorConfig {
                chunk_size: 16,
                chunk_timeout: Duration::from_secs(5),
                keep_partial_on_cancel: true,
                store_write: WriteRetryPolicy {
                    retries: 1,
                    delay: Duration::ZERO,
                },
            },
        }
    }

    #[tokio::test]
    async fn reconcile_resets_orphaned_running_rows() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut task = TransferTask::new(NewTransfer::download("obj", "/tmp/orphan.bin"), 1);
        task.apply(Transition::Admit).unwrap();
        task.progress = 7;
        store.insert(&mut task).await.unwrap();

        let mut scheduler = Scheduler::new(
            store.clone(),
            Arc::new(InMemoryRemote::new()),
            ProgressBus::new(),
            config(),
        );
        assert_eq!(scheduler.reconcile_on_startup().await.unwrap(), 1);
        assert_eq!(scheduler.reconcile_on_startup().await.unwrap(), 0);

        let got = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(got.status, TransferStatus::Waiting);
        assert_eq!(got.progress, 7);
        assert_eq!(got.attempt, 1);
    }

    #[tokio::test]
    async fn cancel_of_unknown_or_terminal_task_is_not_found() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut done = TransferTask::new(NewTransfer::download("obj", "/tmp/done.bin"), 1);
        done.status = TransferStatus::Completed;
        store.insert(&mut done).await.unwrap();

        let handle = Scheduler::new(
            store,
            Arc::new(InMemoryRemote::new()),
            ProgressBus::new(),
            config(),
        )
        .start()
        .await
        .unwrap();

        assert!(matches!(
            handle.cancel("xfr_missing").await.unwrap_err(),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            handle.cancel(&done.id).await.unwrap_err(),
            Error::NotFound { .. }
        ));
        handle.shutdown().await.unwrap();
        assert!(matches!(
            handle.cancel(&done.id).await.unwrap_err(),
            Error::SchedulerClosed
        ));
    }

    #[tokio::test]
    async fn invalid_submit_is_rejected_before_persisting() {
        let store = Arc::new(InMemoryTaskStore::new());
        let handle = Scheduler::new(
            store.clone(),
            Arc::new(InMemoryRemote::new()),
            ProgressBus::new(),
            config(),
        )
        .start()
        .await
        .unwrap();

        let mut req = NewTransfer::download("obj", "/tmp/x.bin");
        req.remote_ref = None;
        assert!(matches!(
            handle.submit(req).await.unwrap_err(),
            Error::Validation { .. }
        ));
        assert!(store.is_empty().await);
        handle.shutdown().await.unwrap();
    }
}
