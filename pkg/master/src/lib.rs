//! Orchestrator and worker of the critical-section demo.
//!
//! `master` allocates one shared arena and one semaphore, spawns a pool of
//! `slave` processes that take turns in a critical section, and tears
//! everything down on timeout, on Ctrl-C or once every worker is done.

#[macro_use]
extern crate log;

pub mod config;
pub mod proc;
pub mod worker;

pub use config::{Config, WorkerConfig};
pub use proc::{ManagerState, ProcessManager, TerminationReason};

/// Exit status of a worker that saw another worker inside the section.
pub const EXIT_EXCLUSION_VIOLATED: i32 = 2;
