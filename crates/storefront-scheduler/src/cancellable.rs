//! Timeouts and cooperative cancellation for single backend calls.
//!
//! A [`CancellableTask`] races a unit of work against its timeout and its cancellation token.
//! The work receives the token and is expected to hand it down to the transport, so that the
//! request itself is aborted. Work that ignores its token is not waited for: the call settles
//! with [`TaskError::Timeout`] or [`TaskError::Cancelled`] right away and the work is dropped.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::CallTimeouts;
use crate::error::{TaskError, TaskResult};
use crate::types::OperationKind;
use crate::utils::futures::{m, measure};

/// A unit of work guarded by a timeout and a cancellation token.
#[derive(Debug, Clone)]
pub struct CancellableTask {
    timeout: Duration,
    token: CancellationToken,
}

impl CancellableTask {
    /// Creates a new task, optionally composed with an external `signal`.
    ///
    /// The task's token is a child of `signal`: cancelling the signal cancels the task, but the
    /// task's own timeout never cancels the signal.
    pub fn new(timeout: Duration, signal: Option<&CancellationToken>) -> Self {
        let token = signal
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        Self::from_token(timeout, token)
    }

    /// Creates a task that observes the given token directly.
    pub fn from_token(timeout: Duration, token: CancellationToken) -> Self {
        Self { timeout, token }
    }

    /// The token handed to the work, which also cancels the task.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `work` until it settles, the timeout fires or the token is cancelled.
    ///
    /// A token that is already cancelled settles the task as [`TaskError::Cancelled`] without
    /// starting `work` at all. When the timeout fires first, the token is cancelled so the work
    /// can abort its request. Work that fails after its token was cancelled is reported as
    /// cancelled, while a successful result is always delivered.
    pub async fn run<F, Fut, T>(self, work: F) -> TaskResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = TaskResult<T>>,
    {
        let Self { timeout, token } = self;
        if token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let work = work(token.clone());
        let guarded = async {
            tokio::select! {
                // a result that is ready wins over a cancellation that arrived at the same time
                biased;
                result = work => match result {
                    // the work gave up because it observed the cancellation
                    Err(_) if token.is_cancelled() => Err(TaskError::Cancelled),
                    result => result,
                },
                _ = token.cancelled() => Err(TaskError::Cancelled),
            }
        };

        match tokio::time::timeout(timeout, guarded).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(TaskError::Timeout(timeout))
            }
        }
    }
}

/// Options for [`scheduled_call`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the default timeout of [`kind`](Self::kind).
    pub timeout: Option<Duration>,
    /// An external cancellation signal.
    pub signal: Option<CancellationToken>,
    pub kind: OperationKind,
    /// The per-kind defaults used without an explicit timeout, usually [`Config::timeouts`].
    ///
    /// [`Config::timeouts`]: crate::config::Config::timeouts
    pub timeouts: CallTimeouts,
}

impl CallOptions {
    pub fn read() -> Self {
        Self::default()
    }

    pub fn mutation() -> Self {
        Self {
            kind: OperationKind::Mutation,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Runs a one-off `operation` under a timeout and cancellation, without going through a
/// [`Scheduler`](crate::Scheduler).
///
/// Without an explicit timeout, reads get the short and mutations the long timeout of the
/// configured [`CallTimeouts`].
pub async fn scheduled_call<F, Fut, T>(operation: F, options: CallOptions) -> TaskResult<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = TaskResult<T>>,
{
    let timeout = options
        .timeout
        .unwrap_or_else(|| options.timeouts.for_kind(options.kind));
    let task = CancellableTask::new(timeout, options.signal.as_ref());

    let result = measure("scheduled_call", m::task_result, task.run(operation)).await;
    if let Err(ref error @ TaskError::Timeout(_)) = result {
        tracing::warn!(kind = options.kind.as_str(), %error, "Backend call timed out");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::time::{Instant, sleep};

    use super::*;
    use crate::test;

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_timeout() {
        let task = CancellableTask::new(Duration::from_secs(5), None);
        let result = task
            .run(|_token| async {
                sleep(Duration::from_secs(1)).await;
                Ok("done")
            })
            .await;
        assert_eq!(result, Ok("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_token() {
        test::setup();

        let task = CancellableTask::new(Duration::from_secs(5), None);
        let token = task.token().clone();

        let result: TaskResult<()> = task
            .run(|token| async move {
                token.cancelled().await;
                Err(TaskError::transport("aborted"))
            })
            .await;

        assert_eq!(result, Err(TaskError::Timeout(Duration::from_secs(5))));
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_without_waiting_for_work() {
        let start = Instant::now();
        let task = CancellableTask::new(Duration::from_secs(1), None);

        // the work ignores its token entirely
        let result: TaskResult<()> = task
            .run(|_token| async {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(TaskError::Timeout(Duration::from_secs(1))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_signal() {
        let signal = CancellationToken::new();
        let task = CancellableTask::new(Duration::from_secs(10), Some(&signal));

        let canceller = {
            let signal = signal.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(1)).await;
                signal.cancel();
            })
        };

        let result: TaskResult<()> = task
            .run(|_token| async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(TaskError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_cancel_signal() {
        let signal = CancellationToken::new();
        let result: TaskResult<()> = scheduled_call(
            |_token| async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            CallOptions::read()
                .with_timeout(Duration::from_secs(1))
                .with_signal(signal.clone()),
        )
        .await;

        assert_eq!(result, Err(TaskError::Timeout(Duration::from_secs(1))));
        assert!(!signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_is_reported_as_cancellation() {
        let task = CancellableTask::new(Duration::from_secs(10), None);
        let canceller = {
            let token = task.token().clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(1)).await;
                token.cancel();
            })
        };

        let result: TaskResult<()> = task
            .run(|token| async move {
                // the transport reports its own error once it is aborted
                token.cancelled().await;
                Err(TaskError::transport("request aborted"))
            })
            .await;

        assert_eq!(result, Err(TaskError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let started = Arc::new(AtomicBool::new(false));
        let signal = CancellationToken::new();
        signal.cancel();

        let result = {
            let started = Arc::clone(&started);
            scheduled_call(
                |_token| async move {
                    started.store(true, Ordering::SeqCst);
                    Ok(())
                },
                CallOptions::read().with_signal(signal),
            )
            .await
        };

        assert_eq!(result, Err(TaskError::Cancelled));
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeouts_by_kind() {
        let slow_work = |_token: CancellationToken| async {
            sleep(Duration::from_secs(20)).await;
            Ok(20)
        };

        let read = scheduled_call(slow_work, CallOptions::read()).await;
        assert_eq!(read, Err(TaskError::Timeout(Duration::from_secs(10))));

        let mutation = scheduled_call(slow_work, CallOptions::mutation()).await;
        assert_eq!(mutation, Ok(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_timeouts() {
        let yaml = "timeouts:\n  read: 2s\n";
        let config = crate::config::Config::from_reader(yaml.as_bytes()).unwrap();

        let slow_work = |_token: CancellationToken| async {
            sleep(Duration::from_secs(5)).await;
            Ok(5)
        };

        let options = CallOptions::read().with_timeouts(config.timeouts);
        let read = scheduled_call(slow_work, options).await;
        assert_eq!(read, Err(TaskError::Timeout(Duration::from_secs(2))));

        let options = CallOptions::mutation().with_timeouts(config.timeouts);
        let mutation = scheduled_call(slow_work, options).await;
        assert_eq!(mutation, Ok(5));
    }
}
