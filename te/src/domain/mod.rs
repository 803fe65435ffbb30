//! Domain types shared by the queue and the scheduler
//!
//! `Priority` is the ordering currency of the whole crate; `TaskId` is the
//! stable identity that dependency actions use to name executing tasks.

mod id;
mod priority;

pub use id::TaskId;
pub use priority::Priority;
