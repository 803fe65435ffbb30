//! Concurrency limits for the scheduler

use eyre::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::domain::Priority;

/// One band of the concurrency table: at priorities at or below `priority`
/// (down to the next entry), at most `max_concurrent_tasks` cores' worth of
/// work may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimitEntry {
    pub priority: Priority,
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
}

/// The scheduler's priority-banded concurrency cap.
///
/// Entries are ordered by priority descending. The effective cap at priority
/// `p` is the `max_concurrent_tasks` of the first entry with `priority <= p`,
/// or the last entry's cap if no entry matches. Higher bands never have a
/// smaller cap than lower bands, so elevated work always has at least as much
/// room as the band it came from.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimits {
    entries: Vec<ConcurrencyLimitEntry>,
}

impl ConcurrencyLimits {
    /// Validate and build a concurrency table.
    ///
    /// Rejects empty tables, tables not sorted strictly descending by
    /// priority, caps that grow as priority drops, and zero caps.
    pub fn new(entries: impl IntoIterator<Item = (Priority, usize)>) -> Result<Self> {
        let entries: Vec<ConcurrencyLimitEntry> = entries
            .into_iter()
            .map(|(priority, max_concurrent_tasks)| ConcurrencyLimitEntry {
                priority,
                max_concurrent_tasks,
            })
            .collect();

        if entries.is_empty() {
            bail!("concurrency table must contain at least one entry");
        }
        for window in entries.windows(2) {
            ensure!(
                window[0].priority > window[1].priority,
                "concurrency table must be sorted strictly descending by priority"
            );
            ensure!(
                window[0].max_concurrent_tasks >= window[1].max_concurrent_tasks,
                "concurrency caps must not grow as priority drops"
            );
        }
        for entry in &entries {
            ensure!(
                entry.max_concurrent_tasks >= 1,
                "concurrency cap at {} must be at least 1",
                entry.priority
            );
        }

        Ok(Self { entries })
    }

    /// The table used by tests: one low-priority band sized to the machine.
    pub fn default_for_tests() -> Self {
        Self {
            entries: vec![ConcurrencyLimitEntry {
                priority: Priority::Low,
                max_concurrent_tasks: num_cpus::get(),
            }],
        }
    }

    /// Effective cap at the given priority.
    pub fn max_concurrent_at(&self, priority: Priority) -> usize {
        for entry in &self.entries {
            if entry.priority <= priority {
                return entry.max_concurrent_tasks;
            }
        }
        // Below every configured band: the lowest band's cap applies.
        match self.entries.last() {
            Some(entry) => entry.max_concurrent_tasks,
            None => 1,
        }
    }

    pub fn entries(&self) -> &[ConcurrencyLimitEntry] {
        &self.entries
    }
}
