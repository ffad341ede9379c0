use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use lib::{proc_number, Error, Result};

use super::ProgramStatus;
use crate::config::WorkerConfig;

/// One child of the pool, as the orchestrator sees it.
#[derive(Debug)]
pub struct Worker {
    slot: usize,
    child: Child,
    status: ProgramStatus,
    exit: Option<ExitStatus>,
}

impl Worker {
    /// Start `bin slot shmid semid <options>`.
    pub fn spawn(
        bin: &Path,
        slot: usize,
        shmid: i32,
        semid: i32,
        config: &WorkerConfig,
    ) -> Result<Self> {
        let child = Command::new(bin)
            .arg(slot.to_string())
            .arg(shmid.to_string())
            .arg(semid.to_string())
            .args(config.to_args())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| Error::Spawn { slot, source })?;

        debug!(
            "Worker #{} spawned: pid {}, slot {}",
            proc_number(slot),
            child.id(),
            slot
        );
        Ok(Self {
            slot,
            child,
            status: ProgramStatus::Running,
            exit: None,
        })
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    #[inline]
    pub fn status(&self) -> ProgramStatus {
        self.status
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.status == ProgramStatus::Running
    }

    #[inline]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    fn mark_dead(&mut self, exit: Option<ExitStatus>) {
        self.status = ProgramStatus::Dead;
        self.exit = exit;
    }

    /// Reap without blocking. `Some` exactly once, when the child is found gone.
    pub fn try_reap(&mut self) -> Option<Option<ExitStatus>> {
        if !self.is_alive() {
            return None;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.mark_dead(Some(status));
                Some(Some(status))
            }
            Ok(None) => None,
            Err(e) => {
                // 无法再等待这个子进程，按已退出处理
                warn!("Worker #{} cannot be waited on: {}", proc_number(self.slot), e);
                self.mark_dead(None);
                Some(None)
            }
        }
    }

    /// SIGKILL the child and reap it.
    pub fn kill(&mut self) -> io::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        if let Err(e) = self.child.kill() {
            warn!("Worker #{} kill failed: {}", proc_number(self.slot), e);
        }
        let status = self.child.wait();
        self.mark_dead(status.as_ref().ok().copied());
        status.map(|_| ())
    }
}
