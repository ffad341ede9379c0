//! Command line surface of both binaries and the configuration it builds.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use lib::{Error, GateKind, Result, MAX_PROCS};

/// Default run time limit, in time units.
pub const DEFAULT_TIMEOUT: u64 = 100;
pub const DEFAULT_ITERATIONS: usize = 5;
pub const DEFAULT_TIME_UNIT_MS: u64 = 1000;
pub const DEFAULT_SLEEP_MIN: u64 = 1;
pub const DEFAULT_SLEEP_MAX: u64 = 5;
/// Worker executable looked up next to `master` when none is given.
pub const WORKER_BIN: &str = "slave";

/// What one worker does inside its loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub gate: GateKind,
    pub iterations: usize,
    pub time_unit: Duration,
    pub sleep_min: u64,
    pub sleep_max: u64,
    pub log_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            gate: GateKind::default(),
            iterations: DEFAULT_ITERATIONS,
            time_unit: Duration::from_millis(DEFAULT_TIME_UNIT_MS),
            sleep_min: DEFAULT_SLEEP_MIN,
            sleep_max: DEFAULT_SLEEP_MAX,
            log_dir: PathBuf::from("."),
        }
    }
}

impl WorkerConfig {
    pub fn with_gate(mut self, gate: GateKind) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_time_unit(mut self, unit: Duration) -> Self {
        self.time_unit = unit;
        self
    }

    /// Sleep range, in time units, used twice per pass through the section.
    pub fn with_sleep(mut self, min: u64, max: u64) -> Self {
        self.sleep_min = min;
        self.sleep_max = max;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(Error::Configuration("iterations must be positive".into()));
        }
        if self.time_unit.is_zero() {
            return Err(Error::Configuration("time unit must be positive".into()));
        }
        if self.sleep_min > self.sleep_max {
            return Err(Error::Configuration(format!(
                "sleep range {}..={} is empty",
                self.sleep_min, self.sleep_max
            )));
        }
        Ok(())
    }

    /// Arguments handing this configuration to a worker process.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--gate".into(),
            self.gate.as_str().into(),
            "--iterations".into(),
            self.iterations.to_string().into(),
            "--time-unit-ms".into(),
            (self.time_unit.as_millis() as u64).to_string().into(),
            "--sleep-min".into(),
            self.sleep_min.to_string().into(),
            "--sleep-max".into(),
            self.sleep_max.to_string().into(),
            "--log-dir".into(),
        ];
        args.push(self.log_dir.clone().into_os_string());
        args
    }
}

/// Orchestrator configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub nprocs: usize,
    /// Run time limit in time units.
    pub timeout: u64,
    pub worker: WorkerConfig,
    pub worker_bin: PathBuf,
    /// Listen for SIGINT / SIGCHLD; off when the manager is driven in-process.
    pub listen_signals: bool,
}

impl Config {
    pub fn new(nprocs: usize) -> Self {
        Self {
            nprocs,
            timeout: DEFAULT_TIMEOUT,
            worker: WorkerConfig::default(),
            worker_bin: default_worker_bin(),
            listen_signals: true,
        }
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_worker_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.worker_bin = bin.into();
        self
    }

    pub fn with_signals(mut self, listen: bool) -> Self {
        self.listen_signals = listen;
        self
    }

    #[inline]
    pub fn timeout_duration(&self) -> Duration {
        self.worker
            .time_unit
            .saturating_mul(self.timeout.min(u32::MAX as u64) as u32)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nprocs == 0 || self.nprocs > MAX_PROCS {
            return Err(Error::Configuration(format!(
                "pool size must be within 1..={}, got {}",
                MAX_PROCS, self.nprocs
            )));
        }
        if self.timeout == 0 {
            return Err(Error::Configuration("timeout must be positive".into()));
        }
        self.worker.validate()
    }
}

fn default_worker_bin() -> PathBuf {
    std::env::current_exe()
        .map(|exe| exe.with_file_name(WORKER_BIN))
        .unwrap_or_else(|_| PathBuf::from(format!("./{}", WORKER_BIN)))
}

/// Worker options shared by `master` (forwarded) and `slave`.
#[derive(Args, Clone, Debug)]
pub struct WorkerArgs {
    /// Entry gate: `semaphore` or `bakery`
    #[arg(long, default_value = "semaphore")]
    pub gate: String,

    /// Passes through the critical section per worker
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    pub iterations: usize,

    /// Length of one time unit in milliseconds
    #[arg(long = "time-unit-ms", default_value_t = DEFAULT_TIME_UNIT_MS)]
    pub time_unit_ms: u64,

    /// Shortest sleep inside the section, in time units
    #[arg(long, default_value_t = DEFAULT_SLEEP_MIN)]
    pub sleep_min: u64,

    /// Longest sleep inside the section, in time units
    #[arg(long, default_value_t = DEFAULT_SLEEP_MAX)]
    pub sleep_max: u64,

    /// Directory holding `cstest`, the `logfile.N` traces and the key file
    #[arg(long, default_value = ".")]
    pub log_dir: PathBuf,
}

impl WorkerArgs {
    pub fn build(&self) -> Result<WorkerConfig> {
        let config = WorkerConfig {
            gate: self.gate.parse()?,
            iterations: self.iterations,
            time_unit: Duration::from_millis(self.time_unit_ms),
            sleep_min: self.sleep_min,
            sleep_max: self.sleep_max,
            log_dir: self.log_dir.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Parser, Debug)]
#[command(name = "master", disable_help_flag = true, disable_version_flag = true)]
pub struct MasterArgs {
    #[arg(short = 'h', long = "help")]
    pub help: bool,

    #[arg(short = 't', long = "timeout", value_name = "ss")]
    pub timeout: Option<String>,

    #[command(flatten)]
    pub worker: WorkerArgs,

    /// Worker executable (default: `slave` next to `master`)
    #[arg(long, value_name = "PATH")]
    pub worker_bin: Option<PathBuf>,

    pub n: Option<String>,
}

#[derive(Parser, Debug)]
#[command(name = "slave", allow_negative_numbers = true)]
pub struct SlaveArgs {
    /// Slot of this worker, from 0
    pub slot: usize,
    /// Shared memory id of the arena
    pub shmid: i32,
    /// Semaphore id of the gate
    pub semid: i32,

    #[command(flatten)]
    pub worker: WorkerArgs,
}

/// Outcome of parsing the `master` command line.
#[derive(Debug)]
pub enum Invocation {
    Help,
    Run(Config),
}

/// True for a non-empty string of ASCII digits.
pub fn is_a_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parse `master [-h] [-t ss] [n]`.
///
/// A pool size above the limit is clamped with a warning; everything else
/// that is out of range is a `Configuration` error.
pub fn parse_master<I, T>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = MasterArgs::try_parse_from(args)
        .map_err(|e| Error::Configuration(e.to_string()))?;
    if args.help {
        return Ok(Invocation::Help);
    }

    let timeout = match args.timeout.as_deref() {
        None => DEFAULT_TIMEOUT,
        Some(t) if is_a_number(t) => match t.parse::<u64>() {
            Ok(t) if t >= 1 => t,
            _ => return Err(Error::Configuration(format!("bad timeout: {}", t))),
        },
        Some(t) => return Err(Error::Configuration(format!("bad timeout: {}", t))),
    };

    let n = args
        .n
        .as_deref()
        .ok_or_else(|| Error::Configuration("missing process count".into()))?;
    if !is_a_number(n) {
        return Err(Error::Configuration(format!("bad process count: {}", n)));
    }
    // 太长的数字串也按上限处理
    let nprocs = match n.parse::<usize>() {
        Ok(0) => return Err(Error::Configuration("process count must be positive".into())),
        Ok(n) if n <= MAX_PROCS => n,
        _ => {
            println!(
                "Warning: Maximum value for 'n' is {}. Setting number of processes to {}.",
                MAX_PROCS, MAX_PROCS
            );
            MAX_PROCS
        }
    };

    let mut config = Config::new(nprocs)
        .with_timeout(timeout)
        .with_worker(args.worker.build()?);
    if let Some(bin) = args.worker_bin {
        config = config.with_worker_bin(bin);
    }
    config.validate()?;
    Ok(Invocation::Run(config))
}

pub fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [-h] [-t ss] [n]\n\
         Runs master program to fork 'n' slave processes.\n\
         Options:\n\
         -h      for help.\n\
         -t ss   (integer) sets the maximum time in seconds (default {timeout}) after which the process should terminate itself if not completed.\n\
         n       (integer) sets the number of processes to fork off (max {max}).\n\
         \n\
         Extra options:\n\
         --gate semaphore|bakery   entry gate of the critical section (default semaphore)\n\
         --iterations k            passes through the critical section per slave (default {iterations})\n\
         --time-unit-ms ms         length of one time unit (default {unit})\n\
         --sleep-min a             shortest sleep inside the section, in units (default {smin})\n\
         --sleep-max b             longest sleep inside the section, in units (default {smax})\n\
         --log-dir dir             where cstest and logfile.N are written (default .)\n\
         --worker-bin path         slave executable (default: next to master)\n",
        program = program,
        timeout = DEFAULT_TIMEOUT,
        max = MAX_PROCS,
        iterations = DEFAULT_ITERATIONS,
        unit = DEFAULT_TIME_UNIT_MS,
        smin = DEFAULT_SLEEP_MIN,
        smax = DEFAULT_SLEEP_MAX,
    )
}
