#![allow(clippy::missing_safety_doc)]

#[macro_use]
extern crate log;

pub mod arena;
pub mod error;
pub mod io;
pub mod logger;
pub mod sync;
pub mod syscall;

pub use arena::SharedArena;
pub use error::{Error, Result};
pub use io::{EventLog, WorkerEvent};
pub use sync::{BakeryMutex, Gate, GateKind, SemaphoreGate};
pub use syscall::IpcKey;

/// Upper bound of the worker pool, and of every arena's slot count.
pub const MAX_PROCS: usize = 20;

/// Marker file used to derive the System V keys of a run.
pub const KEY_FILE: &str = "ftokFile";

/// `ftok` project id of the shared segment.
pub const SHM_PROJ: u8 = b'S';
/// `ftok` project id of the semaphore.
pub const SEM_PROJ: u8 = b'E';

/// Human-facing process number of a slot.
#[inline]
pub fn proc_number(slot: usize) -> usize {
    slot + 1
}

/// `perror`-style prefix used for every user-visible failure.
pub fn error_prefix(program: &str) -> String {
    format!("{}: Error", program)
}
