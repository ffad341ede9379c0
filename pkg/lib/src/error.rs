//! Error types shared by the arena, the gates and the event log.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad command line or configuration value; nothing was allocated.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Shared memory segment or semaphore could not be created.
    #[error("cannot allocate {what}: {source}")]
    Allocation {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// Shared memory segment could not be mapped into this process.
    #[error("cannot attach shared memory {shmid}: {source}")]
    Attach {
        shmid: i32,
        #[source]
        source: io::Error,
    },

    /// The handle was already released.
    #[error("{0} already released")]
    AlreadyReleased(&'static str),

    /// Only the creating handle may remove the object.
    #[error("{0} is not owned by this handle")]
    NotOwner(&'static str),

    /// A worker process could not be started.
    #[error("cannot spawn worker {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: io::Error,
    },

    /// A blocking semaphore operation was interrupted by a signal.
    #[error("semaphore operation interrupted by signal")]
    SignalInterrupted,

    /// Any other semaphore failure.
    #[error("semaphore operation failed: {0}")]
    Semaphore(#[source] io::Error),

    /// A log target could not be opened or written.
    #[error("unable to write '{}': {source}", path.display())]
    LogWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Process exit code the binaries use for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) => 0,
            _ => 1,
        }
    }
}
