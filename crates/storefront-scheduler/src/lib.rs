//! Client-side scheduling for calls into a rate-sensitive storefront backend.
//!
//! The [`Scheduler`](scheduler::Scheduler) runs at most one call at a time, ordered by priority,
//! deduplicates identical concurrent calls through per-class [`TtlCache`](caching::TtlCache)s, and
//! preempts a running call when a more important one arrives. Every call runs under a timeout with
//! cooperative cancellation (see [`cancellable`]). The [`Debouncer`](debounce::Debouncer) collapses
//! bursts of filter-driven calls into a single trailing call.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod cancellable;
pub mod config;
pub mod debounce;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod types;
pub mod utils;

#[cfg(test)]
use storefront_scheduler_test as test;

pub use cancellable::{CallOptions, CancellableTask, scheduled_call};
pub use debounce::{Debouncer, FlushOutcome, debounce};
pub use error::{TaskError, TaskResult};
pub use scheduler::{EnqueueOptions, Scheduler};
pub use types::{OperationKind, Priority, TaskFuture, TaskId};
