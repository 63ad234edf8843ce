//! The serializing, deduplicating, preempting scheduler.
//!
//! A [`Scheduler`] owns a single worker that executes at most one task at a time. Queued tasks are
//! admitted by priority, tasks of equal priority in submission order. Submitting a task with a
//! higher priority than the currently active one cancels the active task's token, and the worker
//! stops waiting on it, so the new task is admitted right after.
//!
//! Tasks carrying a [`CacheKey`] are deduplicated through the [`Caches`], see the
//! [`caching`](crate::caching) module.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::{FutureExt, ready};
use sentry::SentryFutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheKey, Caches, Lookup};
use crate::config::{CallTimeouts, SchedulerConfig};
use crate::error::{TaskError, TaskResult};
use crate::types::{OperationKind, Priority, TaskFuture, TaskId};

mod queue;

use queue::{PendingRegistration, QueuedTask, SchedulerState};

/// Options for [`Scheduler::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Identifies the task in logs, generated when absent.
    pub id: Option<TaskId>,
    pub priority: Priority,
    /// Deduplicates the task against other tasks with the same key.
    pub cache_key: Option<CacheKey>,
    /// When `false`, the cache is neither consulted nor updated, even with a `cache_key`.
    pub use_cache: bool,
    /// Overrides the configured default timeout of [`kind`](Self::kind).
    pub timeout: Option<Duration>,
    pub kind: OperationKind,
    /// An external cancellation signal, composed with the scheduler's own cancellation.
    pub signal: Option<CancellationToken>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            id: None,
            priority: Priority::default(),
            cache_key: None,
            use_cache: true,
            timeout: None,
            kind: OperationKind::default(),
            signal: None,
        }
    }
}

impl EnqueueOptions {
    pub fn new(priority: impl Into<Priority>) -> Self {
        Self {
            priority: priority.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_cache_key(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

struct Inner<T: Clone> {
    state: Arc<SchedulerState>,
    caches: Arc<Caches<T>>,
    timeouts: CallTimeouts,
    sender: mpsc::UnboundedSender<QueuedTask<T>>,
    next_seq: AtomicU64,
}

/// Handle to a scheduler. Cloning it is cheap, all clones share the same queue and caches.
pub struct Scheduler<T: Clone> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("active", &*self.inner.state.active.lock())
            .field("queued", &self.inner.state.queued.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> Scheduler<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new scheduler and spawns its worker onto `runtime`.
    pub fn new(config: &SchedulerConfig, runtime: Handle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(SchedulerState::default());

        let worker = queue::run_worker(receiver, Arc::clone(&state));
        runtime.spawn(worker.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())));

        let inner = Inner {
            state,
            caches: Arc::new(Caches::from_config(&config.caches)),
            timeouts: config.timeouts,
            sender,
            next_seq: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Submits `work` and returns the future of its settlement.
    ///
    /// The task is registered and queued right away, whether or not the returned future is ever
    /// polled. With a cache key, a fresh cached value is returned without queueing anything, and
    /// a task already queued or running for the same key is joined instead of executed twice.
    pub fn enqueue<F, Fut>(&self, work: F, options: EnqueueOptions) -> TaskFuture<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let EnqueueOptions {
            id,
            priority,
            cache_key,
            use_cache,
            timeout,
            kind,
            signal,
        } = options;
        metric!(counter("scheduler.enqueue") += 1, "kind" => kind.as_str());

        let (sender, receiver) = oneshot::channel();
        let future = receiver
            .map(|result| result.unwrap_or(Err(TaskError::Cancelled)))
            .boxed()
            .shared();

        let registration = match cache_key.filter(|_| use_cache) {
            Some(key) => {
                let cache = self.inner.caches.for_key(&key);
                match cache.lookup_or_register(&key, future.clone()) {
                    Lookup::Hit(value) => {
                        tracing::trace!(%key, "Serving cached value");
                        return ready(Ok(value)).boxed().shared();
                    }
                    Lookup::InFlight(existing) => {
                        tracing::trace!(%key, "Joining in-flight task");
                        metric!(
                            counter("scheduler.dedup") += 1,
                            "cache" => key.cache_name().as_ref(),
                        );
                        return existing;
                    }
                    Lookup::Registered(ticket) => Some(PendingRegistration::new(
                        Arc::clone(&self.inner.caches),
                        key,
                        ticket,
                    )),
                }
            }
            None => None,
        };

        let id = id.unwrap_or_else(TaskId::generate);
        let token = signal
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let task = QueuedTask {
            id: id.clone(),
            priority,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            enqueued_at: Instant::now(),
            timeout: timeout.unwrap_or_else(|| self.inner.timeouts.for_kind(kind)),
            token,
            work: Box::new(move |token| work(token).boxed()),
            registration,
            sender,
        };

        let active = self.inner.state.active.lock();
        if let Some(active) = active.as_ref()
            && priority > active.priority
        {
            tracing::debug!(preempted = %active.id, by = %id, "Preempting active task");
            metric!(counter("scheduler.preempted") += 1);
            active.token.cancel();
        }

        self.inner.state.queued.fetch_add(1, Ordering::SeqCst);
        if self.inner.sender.send(task).is_err() {
            // Dropping the task settles it as cancelled and abandons its cache registration.
            self.inner.state.queued.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(%id, "Scheduler worker is gone, cancelling task");
        }
        drop(active);

        future
    }

    /// Removes the cache entry for `key`, returning whether there was one.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.caches.for_key(key).invalidate(key)
    }

    /// The id of the task currently occupying the active slot.
    pub fn active_task(&self) -> Option<TaskId> {
        self.inner
            .state
            .active
            .lock()
            .as_ref()
            .map(|active| active.id.clone())
    }

    /// The number of tasks waiting to be admitted.
    pub fn queued_tasks(&self) -> usize {
        self.inner.state.queued.load(Ordering::SeqCst)
    }
}
