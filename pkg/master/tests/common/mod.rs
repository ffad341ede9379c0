//! Helpers shared by the orchestrator integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cs_master::{Config, WorkerConfig};
use lib::GateKind;

/// The worker binary built alongside these tests.
pub fn slave_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_slave"))
}

pub fn master_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_master"))
}

/// Workers that finish quickly: sleeps of 0 or 1 unit of `unit_ms`.
pub fn fast_workers(dir: &Path, unit_ms: u64) -> WorkerConfig {
    WorkerConfig::default()
        .with_time_unit(Duration::from_millis(unit_ms))
        .with_sleep(0, 1)
        .with_log_dir(dir)
}

/// Workers that sit in the section for `units` units every time.
pub fn slow_workers(dir: &Path, unit_ms: u64, units: u64) -> WorkerConfig {
    WorkerConfig::default()
        .with_time_unit(Duration::from_millis(unit_ms))
        .with_sleep(units, units)
        .with_log_dir(dir)
}

/// In-process orchestrator config: no signal handlers, test-built worker.
pub fn config(nprocs: usize, timeout: u64, worker: WorkerConfig) -> Config {
    Config::new(nprocs)
        .with_timeout(timeout)
        .with_worker(worker)
        .with_worker_bin(slave_bin())
        .with_signals(false)
}

pub fn bakery(worker: WorkerConfig) -> WorkerConfig {
    worker.with_gate(GateKind::Bakery)
}

pub fn lines(path: impl AsRef<Path>) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_owned)
        .collect()
}

pub fn shutdown_lines(dir: &Path) -> Vec<String> {
    lines(dir.join("cstest"))
        .into_iter()
        .filter(|l| l.contains("Program ended. Termination method: "))
        .collect()
}

/// True when no process with this pid exists any more.
pub fn is_gone(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

pub fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Send SIGINT to one process, or to a whole group when `pid` is negative.
pub fn interrupt(pid: i32) {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    assert_eq!(ret, 0, "kill({}, SIGINT): {}", pid, std::io::Error::last_os_error());
}
