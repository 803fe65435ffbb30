//! taskexec - task-execution substrate for a language-server host
//!
//! A long-lived host process sits between an editor and a set of language
//! backends, turning an unordered stream of requests into indexing and
//! preparation work. This crate is the substrate that work runs on:
//!
//! - **Fresh context per task**: every unit of work is described by a
//!   [`TaskDescription`] with a stable identity, so the scheduler can reason
//!   about the executing set without inspecting task internals.
//! - **Priority is the currency**: admission, elevation, and
//!   cancel-and-reschedule all trade in [`Priority`] bands.
//! - **Cooperative everywhere**: both components compose over tokio; neither
//!   owns a thread, and cancellation is future-drop at suspension points.
//!
//! # Modules
//!
//! - [`queue`] - serial/concurrent/barrier ordering for async closures
//! - [`scheduler`] - the priority-aware task scheduler
//! - [`domain`] - priority bands and task identifiers

pub mod domain;
pub mod queue;
pub mod scheduler;

// Re-export commonly used types
pub use domain::{Priority, TaskId};
pub use queue::{AsyncQueue, QueueError, QueueHandle, QueueKind};
pub use scheduler::{
    ConcurrencyLimitEntry, ConcurrencyLimits, DependencyAction, ExecutionState, QueueState, QueuedTask,
    TaskDescription, TaskResult, TaskScheduler,
};
