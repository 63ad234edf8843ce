use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};

use crate::error::TaskResult;

/// The handle a caller awaits for the settlement of a scheduled task.
///
/// It is cloneable, every deduplicated caller awaits the very same settlement.
pub type TaskFuture<T> = Shared<BoxFuture<'static, TaskResult<T>>>;

/// Identifies a task for logs and for [`Scheduler::active_task`](crate::Scheduler::active_task).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().into())
    }

    /// Creates a random v4 uuid based id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

/// Scheduling priority of a task. Higher values run sooner and preempt lower ones.
///
/// Any integer is accepted, the named tiers are what the storefront uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Navigation-critical lookups, like the category tree.
    pub const HIGH: Priority = Priority(10);
    /// Listing data.
    pub const MEDIUM: Priority = Priority(5);
    /// Filter refinements which are expected to be superseded quickly.
    pub const LOW: Priority = Priority(1);
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What kind of backend operation a call performs, which selects its default timeout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Side-effect free lookups.
    #[default]
    Read,
    /// Cart and checkout operations which perform multi-step side effects on the backend.
    Mutation,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Mutation => "mutation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::HIGH > Priority::MEDIUM);
        assert!(Priority::MEDIUM > Priority::LOW);
        assert!(Priority(-3) < Priority::LOW);
        assert_eq!(Priority::default(), Priority::MEDIUM);
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert_eq!(TaskId::from("categories").as_str(), "categories");
    }
}
