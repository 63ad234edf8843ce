use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::caching::{CacheKey, Caches};
use crate::cancellable::CancellableTask;
use crate::error::{TaskError, TaskResult};
use crate::types::{Priority, TaskId};
use crate::utils::futures::{m, measure};

pub(super) type Work<T> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, TaskResult<T>> + Send>;

/// The single execution slot.
#[derive(Debug)]
pub(super) struct ActiveTask {
    pub id: TaskId,
    pub priority: Priority,
    pub token: CancellationToken,
}

/// State shared between the [`Scheduler`](super::Scheduler) handles and the worker.
#[derive(Debug, Default)]
pub(super) struct SchedulerState {
    /// Enqueuing a task and admitting the next one both happen under this lock, so a new task
    /// either sees the task it has to preempt, or is queued before the next admission.
    pub active: Mutex<Option<ActiveTask>>,
    pub queued: atomic::AtomicUsize,
}

/// A pending cache registration, abandoned when dropped without being settled.
pub(super) struct PendingRegistration<T: Clone> {
    caches: Arc<Caches<T>>,
    key: CacheKey,
    ticket: Option<u64>,
}

impl<T: Clone> PendingRegistration<T> {
    pub fn new(caches: Arc<Caches<T>>, key: CacheKey, ticket: u64) -> Self {
        Self {
            caches,
            key,
            ticket: Some(ticket),
        }
    }

    pub fn settle(mut self, result: &TaskResult<T>) {
        if let Some(ticket) = self.ticket.take() {
            self.caches.for_key(&self.key).settle(&self.key, ticket, result);
        }
    }
}

impl<T: Clone> Drop for PendingRegistration<T> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.caches.for_key(&self.key).abandon(&self.key, ticket);
        }
    }
}

pub(super) struct QueuedTask<T: Clone> {
    pub id: TaskId,
    pub priority: Priority,
    /// Submission order, keeps tasks of equal priority FIFO.
    pub seq: u64,
    pub enqueued_at: Instant,
    pub timeout: Duration,
    pub token: CancellationToken,
    pub work: Work<T>,
    pub registration: Option<PendingRegistration<T>>,
    pub sender: oneshot::Sender<TaskResult<T>>,
}

impl<T: Clone> PartialEq for QueuedTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Clone> Eq for QueuedTask<T> {}

impl<T: Clone> PartialOrd for QueuedTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Clone> Ord for QueuedTask<T> {
    /// The greatest task is the next one to run.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Runs queued tasks one at a time, highest priority first.
///
/// The worker exits once all senders are gone and every queued task was executed.
pub(super) async fn run_worker<T>(
    mut receiver: mpsc::UnboundedReceiver<QueuedTask<T>>,
    state: Arc<SchedulerState>,
) where
    T: Clone + Send + Sync + 'static,
{
    let mut queue = BinaryHeap::new();

    loop {
        if queue.is_empty() {
            match receiver.recv().await {
                Some(task) => queue.push(task),
                None => break,
            }
        }

        let task = {
            let mut active = state.active.lock();
            while let Ok(task) = receiver.try_recv() {
                queue.push(task);
            }
            let Some(task) = queue.pop() else {
                continue;
            };
            *active = Some(ActiveTask {
                id: task.id.clone(),
                priority: task.priority,
                token: task.token.clone(),
            });
            task
        };
        state.queued.fetch_sub(1, atomic::Ordering::SeqCst);

        execute(task, &state).await;
    }

    tracing::debug!("Scheduler worker shutting down");
}

async fn execute<T>(task: QueuedTask<T>, state: &SchedulerState)
where
    T: Clone + Send + Sync + 'static,
{
    let QueuedTask {
        id,
        priority,
        enqueued_at,
        timeout,
        token,
        work,
        registration,
        sender,
        ..
    } = task;

    metric!(timer("scheduler.wait_time") = enqueued_at.elapsed());

    let span = tracing::debug_span!("scheduled_task", id = %id, priority = priority.0);
    let result = async {
        tracing::debug!("Task admitted");
        let work = run_isolated(timeout, token, work);
        let result = measure("scheduled_task", m::task_result, work).await;

        match &result {
            Ok(_) => tracing::debug!("Task completed"),
            Err(error) if error.is_cancellation() => tracing::debug!("Task cancelled"),
            Err(error) => tracing::warn!(%error, "Task failed"),
        }
        result
    }
    .instrument(span)
    .await;

    // The cache is settled before the caller is resolved, so a resubmission after a failure
    // never joins the failed execution.
    if let Some(registration) = registration {
        registration.settle(&result);
    }
    *state.active.lock() = None;

    // The caller may have lost interest already.
    sender.send(result).ok();
}

/// Runs `work` on its own task, so a panicking task only fails itself and not the worker.
///
/// When the token is cancelled, the spawned task is aborted and awaited, so its work is gone
/// before the next task is admitted.
async fn run_isolated<T>(
    timeout: Duration,
    token: CancellationToken,
    work: Work<T>,
) -> TaskResult<T>
where
    T: Send + 'static,
{
    let task = CancellableTask::from_token(timeout, token.clone());
    let mut handle = tokio::spawn(task.run(work).in_current_span());

    let joined = tokio::select! {
        biased;
        joined = &mut handle => joined,
        _ = token.cancelled() => {
            handle.abort();
            handle.await
        }
    };

    match joined {
        Ok(result) => result,
        Err(error) if error.is_panic() => {
            tracing::error!("Task panicked");
            Err(TaskError::transport("task panicked"))
        }
        Err(_) => Err(TaskError::Cancelled),
    }
}
