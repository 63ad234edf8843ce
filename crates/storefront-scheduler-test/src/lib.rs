//! Helpers for testing the scheduler.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Time dependent tests should run with a paused clock (`#[tokio::test(start_paused = true)]`).
//!    The [`FakeTransport`] only sleeps on the Tokio clock, so its latency is simulated instantly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `storefront_scheduler` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("storefront_scheduler=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Errors of the [`FakeTransport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The request observed its cancellation token.
    #[error("request aborted")]
    Aborted,
    #[error("request failed: {0}")]
    Failed(String),
}

#[derive(Debug, Default)]
struct TransportState {
    calls: Mutex<BTreeMap<String, usize>>,
    failing: Mutex<BTreeSet<String>>,
    events: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

/// A stand-in for the storefront backend.
///
/// Every request sleeps for the given latency and answers with `"response for {request}"`. The
/// transport records how often each request was made, how many requests ran at the same time, and
/// the order in which requests started and finished.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    state: Arc<TransportState>,
}

/// Marks a request as finished, also when it was dropped before completing.
struct RunningGuard {
    state: Arc<TransportState>,
    request: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.state.running.fetch_sub(1, Ordering::SeqCst);
        let mut events = self.state.events.lock().unwrap();
        events.push(format!("finish {}", self.request));
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next request for `request` fail.
    pub fn fail_next(&self, request: &str) {
        self.state.failing.lock().unwrap().insert(request.to_owned());
    }

    /// Performs a request, aborting it when `signal` is cancelled.
    pub async fn fetch(
        &self,
        request: &str,
        latency: Duration,
        signal: CancellationToken,
    ) -> Result<String, FetchError> {
        *self
            .state
            .calls
            .lock()
            .unwrap()
            .entry(request.to_owned())
            .or_default() += 1;
        self.state
            .events
            .lock()
            .unwrap()
            .push(format!("start {request}"));

        let running = self.state.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_running.fetch_max(running, Ordering::SeqCst);
        let _guard = RunningGuard {
            state: Arc::clone(&self.state),
            request: request.to_owned(),
        };

        tokio::select! {
            _ = tokio::time::sleep(latency) => {}
            _ = signal.cancelled() => return Err(FetchError::Aborted),
        }

        if self.state.failing.lock().unwrap().remove(request) {
            return Err(FetchError::Failed(format!("backend rejected {request}")));
        }
        Ok(format!("response for {request}"))
    }

    /// How often `request` was made.
    pub fn calls(&self, request: &str) -> usize {
        let calls = self.state.calls.lock().unwrap();
        calls.get(request).copied().unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.state.calls.lock().unwrap().values().sum()
    }

    /// The highest number of requests that were running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.state.max_running.load(Ordering::SeqCst)
    }

    /// The `start {request}` and `finish {request}` events, in order.
    pub fn events(&self) -> Vec<String> {
        self.state.events.lock().unwrap().clone()
    }
}
