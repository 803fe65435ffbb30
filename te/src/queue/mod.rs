//! Ordering for async closures
//!
//! An [`AsyncQueue`] imposes enqueue-order constraints on user-supplied
//! closures without owning a thread: serial queues run closures one after
//! another, concurrent queues run them in parallel with barrier fencing.
//! Per-connection message handlers use a serial queue so that a
//! did-change notification and the request that follows it never reorder.

mod core;

pub use core::{AsyncQueue, QueueError, QueueHandle, QueueKind};
