mod event;
pub mod manager;
mod process;

use core::fmt;

pub use event::{AbortHandle, Event, SignalListener};
pub use manager::ProcessManager;
pub use process::Worker;

use crate::config::Config;
use lib::Result;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProgramStatus {
    Running,
    Dead,
}

/// Why a run ended. Chosen once; later causes are ignored.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TerminationReason {
    Timeout,
    InteractiveAbort,
    NormalCompletion,
    InitializationFailure,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Timeout => "timeout",
            TerminationReason::InteractiveAbort => "interactive-abort",
            TerminationReason::NormalCompletion => "normal-completion",
            TerminationReason::InitializationFailure => "initialization-failure",
        }
    }

    /// Whether workers still running must be killed.
    #[inline]
    pub fn kills_workers(&self) -> bool {
        !matches!(self, TerminationReason::NormalCompletion)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ManagerState {
    Initializing,
    Running,
    Terminating(TerminationReason),
    Terminated(TerminationReason),
}

/// Bring the pool up, wait for it to end one way or another, tear it down.
pub fn run(config: Config) -> Result<TerminationReason> {
    let mut manager = ProcessManager::new(config);
    manager.init()?;
    Ok(manager.run())
}
