use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The ways a scheduled call can fail.
///
/// Every variant is a distinct kind so callers can branch on it: [`Cancelled`](Self::Cancelled)
/// and [`Superseded`](Self::Superseded) are usually ignored, while [`Timeout`](Self::Timeout) and
/// [`Transport`](Self::Transport) are surfaced to the user.
///
/// The error is `Clone` because a single settlement is shared by every deduplicated caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The call did not settle before its timeout fired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The call was cancelled by the caller's signal or by preemption.
    #[error("cancelled")]
    Cancelled,
    /// A debounced call was replaced by a newer one.
    #[error("superseded by a newer call")]
    Superseded,
    /// The wrapped work itself failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl TaskError {
    /// Wraps an arbitrary transport failure.
    pub fn transport(error: impl fmt::Display) -> Self {
        Self::Transport(error.to_string())
    }

    /// A stable tag for this error kind, used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Superseded => "superseded",
            Self::Transport(_) => "transport",
        }
    }

    /// Whether this error stems from the call being abandoned rather than failing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Superseded)
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
