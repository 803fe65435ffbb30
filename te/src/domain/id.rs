//! Task identifier allocation
//!
//! Task descriptions carry a process-wide unique `TaskId`. Identifiers come
//! from a monotonic arena counter so the scheduler's collections can key
//! owning records by value without reference cycles.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Stable identifier of a task description.
///
/// Two descriptions with the same `TaskId` are the same task as far as
/// dependency actions are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate the next process-wide unique identifier.
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw counter value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique_and_increasing() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_task_id_display() {
        let id = TaskId::from(42);
        assert_eq!(id.to_string(), "task-42");
        assert_eq!(id.as_u64(), 42);
    }
}
