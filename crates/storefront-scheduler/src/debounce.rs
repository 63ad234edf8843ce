//! Trailing debounce for bursts of calls, like filter changes while the user is still clicking.
//!
//! Every [`Debouncer::call`] restarts the delay, only the last call of a burst executes. Each
//! call is tagged with a generation. A result is only delivered to its caller if no newer call
//! arrived in the meantime, otherwise the caller receives [`TaskError::Superseded`]. This also
//! holds for calls whose execution already started: a newer call cancels the older execution's
//! token, and whatever the older execution settles with is reported as superseded.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::{TaskError, TaskResult};

type DebouncedFn<A, T> =
    dyn Fn(A, CancellationToken) -> BoxFuture<'static, TaskResult<T>> + Send + Sync;

/// Outcome of [`Debouncer::flush`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome<T> {
    /// The pending call was executed right away.
    Executed(TaskResult<T>),
    /// There was no pending call.
    NothingPending,
}

struct PendingCall<A, T> {
    generation: u64,
    args: A,
    sender: oneshot::Sender<TaskResult<T>>,
    timer: JoinHandle<()>,
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
}

struct DebounceState<A, T> {
    generation: u64,
    pending: Option<PendingCall<A, T>>,
    in_flight: Option<InFlight>,
}

struct DebouncerInner<A, T> {
    func: Box<DebouncedFn<A, T>>,
    delay: Duration,
    state: Mutex<DebounceState<A, T>>,
}

/// Wraps `func` so that bursts of calls within `delay` collapse into a single trailing call.
pub fn debounce<A, T, F, Fut>(func: F, delay: Duration) -> Debouncer<A, T>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
    F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
{
    let inner = DebouncerInner {
        func: Box::new(move |args, token| func(args, token).boxed()),
        delay,
        state: Mutex::new(DebounceState {
            generation: 0,
            pending: None,
            in_flight: None,
        }),
    };
    Debouncer {
        inner: Arc::new(inner),
    }
}

/// A debounced function, see [`debounce`].
///
/// Dropping the debouncer cancels a pending call.
pub struct Debouncer<A, T> {
    inner: Arc<DebouncerInner<A, T>>,
}

impl<A, T> Debouncer<A, T>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
{
    /// Schedules a call with `args` once the delay passed without another call.
    ///
    /// A call that was still waiting for its delay is rejected with [`TaskError::Superseded`].
    /// This must be called from within a Tokio runtime.
    pub fn call(&self, args: A) -> BoxFuture<'static, TaskResult<T>> {
        let (sender, receiver) = oneshot::channel();

        let mut state = self.inner.state.lock();
        state.generation += 1;
        let generation = state.generation;

        if let Some(previous) = state.pending.take() {
            previous.timer.abort();
            tracing::trace!(generation = previous.generation, "Superseding pending call");
            metric!(counter("debounce.superseded") += 1, "state" => "pending");
            previous.sender.send(Err(TaskError::Superseded)).ok();
        }
        if let Some(in_flight) = &state.in_flight {
            tracing::trace!(generation = in_flight.generation, "Superseding running call");
            in_flight.token.cancel();
        }

        let deadline = Instant::now() + self.inner.delay;
        let inner = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            sleep_until(deadline).await;
            fire(inner, generation).await;
        });

        state.pending = Some(PendingCall {
            generation,
            args,
            sender,
            timer,
        });
        drop(state);

        receiver
            .map(|result| result.unwrap_or(Err(TaskError::Cancelled)))
            .boxed()
    }

    /// Cancels the pending call, rejecting it with [`TaskError::Cancelled`].
    ///
    /// Returns whether there was a pending call. A call that already started executing is not
    /// affected.
    pub fn cancel(&self) -> bool {
        self.inner.cancel_pending()
    }

    /// Executes the pending call right away, without waiting for the rest of the delay.
    ///
    /// The result is returned and also delivered to the future of the original call.
    pub async fn flush(&self) -> FlushOutcome<T> {
        let taken = {
            let mut state = self.inner.state.lock();
            match state.pending.take() {
                Some(pending) => {
                    pending.timer.abort();
                    let token = state.start(pending.generation);
                    Some((pending, token))
                }
                None => None,
            }
        };
        let Some((pending, token)) = taken else {
            return FlushOutcome::NothingPending;
        };

        let result = self
            .inner
            .execute(pending.generation, pending.args, token)
            .await;
        pending.sender.send(result.clone()).ok();
        FlushOutcome::Executed(result)
    }

    /// Whether a call is waiting for its delay to pass.
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }
}

impl<A, T> Drop for Debouncer<A, T> {
    fn drop(&mut self) {
        self.inner.cancel_pending();
    }
}

impl<A, T> DebounceState<A, T> {
    /// Marks `generation` as executing and returns the token of that execution.
    fn start(&mut self, generation: u64) -> CancellationToken {
        let token = CancellationToken::new();
        self.in_flight = Some(InFlight {
            generation,
            token: token.clone(),
        });
        token
    }
}

impl<A, T> DebouncerInner<A, T> {
    fn cancel_pending(&self) -> bool {
        let Some(pending) = self.state.lock().pending.take() else {
            return false;
        };
        tracing::trace!(generation = pending.generation, "Cancelling pending call");
        pending.timer.abort();
        pending.sender.send(Err(TaskError::Cancelled)).ok();
        true
    }

    async fn execute(&self, generation: u64, args: A, token: CancellationToken) -> TaskResult<T> {
        tracing::debug!(generation, "Executing debounced call");
        let result = (self.func)(args, token).await;

        let mut state = self.state.lock();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            state.in_flight = None;
        }
        if state.generation != generation {
            metric!(counter("debounce.superseded") += 1, "state" => "running");
            return Err(TaskError::Superseded);
        }
        result
    }
}

/// Executes the pending call once its delay passed, unless a newer call replaced it.
async fn fire<A, T>(inner: Weak<DebouncerInner<A, T>>, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let taken = {
        let mut state = inner.state.lock();
        match state.pending.take_if(|pending| pending.generation == generation) {
            Some(pending) => {
                let token = state.start(generation);
                Some((pending, token))
            }
            None => None,
        }
    };
    let Some((pending, token)) = taken else {
        return;
    };

    let result = inner.execute(generation, pending.args, token).await;
    pending.sender.send(result).ok();
}
