//! Distribute a task's work items across a pool of forked worker processes.
//!
//! The master pulls items from the task's dispatch generator and couples
//! each one to exactly one idle worker through a unix-domain rendezvous
//! socket: one accepted connection carries one item. A worker is idle iff
//! it is blocked in `connect`, so the kernel's accept queue does the
//! scheduling and the master keeps no ready-queue of its own.

pub mod config;
pub mod log;
pub mod master;
pub mod rendezvous;
pub mod signals;
pub mod spec;
pub mod task;
pub mod worker;

pub use master::{Master, RunSummary};
pub use task::Task;
