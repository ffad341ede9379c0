use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, Timelike};

use crate::error::{Error, Result};
use crate::proc_number;

/// Shared target every critical-section write and shutdown lands in.
pub const RESOURCE_LOG: &str = "cstest";
/// Prefix of the per-worker trace files, followed by the process number.
pub const WORKER_LOG_PREFIX: &str = "logfile.";

/// Steps of one pass through the critical section, as recorded per worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    Requested,
    Entered,
    Wrote,
    Exited,
}

impl WorkerEvent {
    fn describe(&self) -> &'static str {
        match self {
            WorkerEvent::Requested => "Requested to join critical section by process number: ",
            WorkerEvent::Entered => "Entered critical section by process number: ",
            WorkerEvent::Wrote => "Wrote in 'cstest' file by process number: ",
            WorkerEvent::Exited => "Exited critical section by process number: ",
        }
    }
}

/// Append-only, human readable record of the run.
///
/// Each call opens the target, writes one `HH:MM:SS <event>` line and closes
/// it again, so several processes can share a target without coordination
/// beyond `O_APPEND`.
#[derive(Clone, Debug)]
pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn resource_target(&self) -> PathBuf {
        self.dir.join(RESOURCE_LOG)
    }

    pub fn worker_target(&self, slot: usize) -> PathBuf {
        self.dir
            .join(format!("{}{}", WORKER_LOG_PREFIX, proc_number(slot)))
    }

    /// Write one timestamped line to `target`.
    pub fn append(&self, target: &Path, message: impl fmt::Display) -> Result<()> {
        let now = Local::now();
        let line = format!(
            "{:02}:{:02}:{:02} {}\n",
            now.hour(),
            now.minute(),
            now.second(),
            message
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(target)
            .map_err(|source| Error::LogWrite {
                path: target.to_path_buf(),
                source,
            })?;
        // 一次 write 写完整行，避免多进程交错
        file.write_all(line.as_bytes())
            .map_err(|source| Error::LogWrite {
                path: target.to_path_buf(),
                source,
            })
    }

    pub fn worker_event(&self, slot: usize, event: WorkerEvent) -> Result<()> {
        trace!("Worker #{}: {:?}", proc_number(slot), event);
        self.append(
            &self.worker_target(slot),
            format_args!("{}{}", event.describe(), proc_number(slot)),
        )
    }

    pub fn resource_write(&self, slot: usize, ticket: u32) -> Result<()> {
        self.append(
            &self.resource_target(),
            format_args!(
                "Queue {} File modified by process number {}",
                ticket,
                proc_number(slot)
            ),
        )
    }

    pub fn shutdown(&self, reason: impl fmt::Display) -> Result<()> {
        self.append(
            &self.resource_target(),
            format_args!("Program ended. Termination method: {}", reason),
        )
    }
}
