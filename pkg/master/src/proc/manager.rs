use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use lib::{
    proc_number, Error, EventLog, IpcKey, Result, SemaphoreGate, SharedArena, KEY_FILE,
    SEM_PROJ, SHM_PROJ,
};

use super::*;

/// Longest the orchestrator sleeps before polling its children again.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

pub struct ProcessManager {
    config: Config,
    log: EventLog,
    state: ManagerState,
    reason: spin::Once<TerminationReason>,
    arena: Option<SharedArena>,
    sem: Option<SemaphoreGate>,
    shmid: Option<i32>,
    semid: Option<i32>,
    workers: BTreeMap<usize, Worker>,
    live: usize,
    deadline: Option<Instant>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    signals: Option<SignalListener>,
}

impl ProcessManager {
    pub fn new(config: Config) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let log = EventLog::new(&config.worker.log_dir);
        Self {
            config,
            log,
            state: ManagerState::Initializing,
            reason: spin::Once::new(),
            arena: None,
            sem: None,
            shmid: None,
            semid: None,
            workers: BTreeMap::new(),
            live: 0,
            deadline: None,
            events_tx,
            events_rx,
            signals: None,
        }
    }

    /// Allocate the shared objects, start the pool and arm the timer.
    ///
    /// On failure everything allocated so far is torn down and the run ends
    /// with `initialization-failure`.
    pub fn init(&mut self) -> Result<()> {
        if self.state != ManagerState::Initializing {
            return Err(Error::Configuration(format!(
                "manager cannot be initialized in state {:?}",
                self.state
            )));
        }
        // 配置错误时什么都还没分配，不走清理流程
        self.config.validate()?;

        match self.setup() {
            Ok(()) => {
                self.deadline = Some(Instant::now() + self.config.timeout_duration());
                self.state = ManagerState::Running;
                info!(
                    "Running {} workers, timeout {:?}, gate {}",
                    self.live,
                    self.config.timeout_duration(),
                    self.config.worker.gate
                );
                Ok(())
            }
            Err(e) => {
                error!("Initialization failed: {}", e);
                self.terminate(TerminationReason::InitializationFailure);
                Err(e)
            }
        }
    }

    fn setup(&mut self) -> Result<()> {
        let dir = self.log.dir().to_path_buf();
        fs::create_dir_all(&dir)?;
        // ftok 需要一个真实存在的文件
        let marker = dir.join(KEY_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&marker)?;

        let shm_key = IpcKey::from_path(&marker, SHM_PROJ).map_err(|source| Error::Allocation {
            what: "shared memory key",
            source,
        })?;
        let sem_key = IpcKey::from_path(&marker, SEM_PROJ).map_err(|source| Error::Allocation {
            what: "semaphore key",
            source,
        })?;

        // 先登记 id，后面任何一步失败 terminate 都能找到它们
        let arena = SharedArena::create(shm_key, self.config.nprocs)?;
        let shmid = arena.id();
        self.shmid = Some(shmid);
        self.arena = Some(arena);

        let sem = SemaphoreGate::create(sem_key)?;
        let semid = sem.id();
        self.semid = Some(semid);
        self.sem = Some(sem);

        // 在 fork 之前装好信号监听，早到的 Ctrl-C 也会排进队列
        if self.config.listen_signals {
            self.signals = Some(SignalListener::spawn(self.events_tx.clone())?);
        }

        for slot in 0..self.config.nprocs {
            let worker = Worker::spawn(
                &self.config.worker_bin,
                slot,
                shmid,
                semid,
                &self.config.worker,
            )?;
            self.workers.insert(slot, worker);
            self.live += 1;
        }
        Ok(())
    }

    /// Consume events until the run is over.
    pub fn run(&mut self) -> TerminationReason {
        if self.state == ManagerState::Initializing {
            warn!("Run requested before initialization");
            self.terminate(TerminationReason::InitializationFailure);
        }
        loop {
            if let ManagerState::Terminated(reason) = self.state {
                return reason;
            }
            let event = self.next_event();
            self.handle(event);
        }
    }

    /// Block until something happens: a child is reaped, the timer fires or
    /// an event arrives on the queue.
    ///
    /// Events already queued are observed before any child exit, so an abort
    /// that raced with its own SIGINT killing the pool still wins.
    pub fn next_event(&mut self) -> Event {
        loop {
            if let Some(event) = self.queued_event() {
                return event;
            }
            if let Some(event) = self.reap_one() {
                return event;
            }

            let wait = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Event::Timeout;
                    }
                    (deadline - now).min(REAP_INTERVAL)
                }
                None => REAP_INTERVAL,
            };

            match self.events_rx.recv_timeout(wait) {
                Ok(Event::Reap) | Err(RecvTimeoutError::Timeout) => continue,
                Ok(event) => return event,
                // 自己持有 sender，不会断开
                Err(RecvTimeoutError::Disconnected) => continue,
            }
        }
    }

    fn queued_event(&mut self) -> Option<Event> {
        // Reap 只是提示，真正的退出由 reap_one 发现
        while let Ok(event) = self.events_rx.try_recv() {
            if event != Event::Reap {
                return Some(event);
            }
        }
        None
    }

    fn reap_one(&mut self) -> Option<Event> {
        self.workers.values_mut().find_map(|worker| {
            worker.try_reap().map(|status| Event::WorkerExited {
                slot: worker.slot(),
                status,
            })
        })
    }

    /// Apply one event. Returns true once the run has terminated.
    pub fn handle(&mut self, event: Event) -> bool {
        trace!("Event: {:?}", event);
        match event {
            Event::WorkerExited { slot, status } => {
                self.live = self.live.saturating_sub(1);
                match status {
                    Some(status) if status.success() => {
                        debug!("Worker #{} exited, {} left", proc_number(slot), self.live)
                    }
                    status => warn!(
                        "Worker #{} exited abnormally ({:?}), {} left",
                        proc_number(slot),
                        status,
                        self.live
                    ),
                }
                // 没有其他原因时，最后一个退出即正常结束
                if self.live == 0 {
                    self.terminate(TerminationReason::NormalCompletion);
                }
            }
            Event::Timeout => {
                self.terminate(TerminationReason::Timeout);
            }
            Event::Abort => {
                self.terminate(TerminationReason::InteractiveAbort);
            }
            Event::Reap => {}
        }
        matches!(self.state, ManagerState::Terminated(_))
    }

    /// Shut the run down for `reason`.
    ///
    /// Only the first call does anything and fixes the reason; later calls
    /// return false.
    pub fn terminate(&mut self, reason: TerminationReason) -> bool {
        // 第一次调用决定原因，之后都是空操作
        let mut first = false;
        self.reason.call_once(|| {
            first = true;
            reason
        });
        if !first {
            debug!("Already terminating, ignoring {}", reason);
            return false;
        }

        self.state = ManagerState::Terminating(reason);
        info!("Terminating: {}", reason);
        match reason {
            TerminationReason::Timeout => println!("Timer ended. Now exiting program..."),
            TerminationReason::InteractiveAbort => {
                println!("\n Detected ctrl+c. Now exiting program...")
            }
            TerminationReason::NormalCompletion => {
                println!("All children have terminated. Now exiting program...")
            }
            TerminationReason::InitializationFailure => {}
        }

        // 关掉计时器，终止期间不会再产生 Timeout
        self.deadline = None;
        if reason.kills_workers() {
            self.kill_workers();
        }
        self.release_resources();

        if let Err(e) = self.log.shutdown(reason) {
            warn!("{}", e);
        }
        if let Some(mut signals) = self.signals.take() {
            // 此后的信号没人接收，进程马上就退出了
            signals.stop();
        }

        self.state = ManagerState::Terminated(reason);
        info!("Terminated: {}", reason);
        true
    }

    fn kill_workers(&mut self) {
        for worker in self.workers.values_mut().filter(|w| w.is_alive()) {
            let pid = worker.pid();
            // SIGKILL 之后立即 wait，不留僵尸
            match worker.kill() {
                Ok(()) => debug!("Worker #{} (pid {}) killed", proc_number(worker.slot()), pid),
                Err(e) => warn!("Worker #{} (pid {}) kill: {}", proc_number(worker.slot()), pid, e),
            }
        }
        self.live = 0; // 全部已回收
    }

    /// Every worker is reaped by now; nobody maps the segment or waits on
    /// the semaphore any more.
    fn release_resources(&mut self) {
        if let Some(mut arena) = self.arena.take() {
            if let Err(e) = arena.release() {
                warn!("Shared memory release failed: {}", e);
            }
        }
        // 先段后信号量；两者互不依赖
        if let Some(mut sem) = self.sem.take() {
            if let Err(e) = sem.remove() {
                warn!("Semaphore removal failed: {}", e);
            }
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.events_tx.clone())
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> ManagerState {
        self.state
    }

    #[inline]
    pub fn reason(&self) -> Option<TerminationReason> {
        self.reason.get().copied()
    }

    #[inline]
    pub fn live_workers(&self) -> usize {
        self.live
    }

    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers.values().map(Worker::pid).collect()
    }

    /// Exit code of every reaped worker, by slot. `None` for a worker that
    /// was killed or is still running.
    pub fn exit_codes(&self) -> BTreeMap<usize, Option<i32>> {
        self.workers
            .iter()
            .map(|(slot, w)| (*slot, w.exit_status().and_then(|s| s.code())))
            .collect()
    }

    /// Shared memory id of the run, kept after release.
    #[inline]
    pub fn shmid(&self) -> Option<i32> {
        self.shmid
    }

    /// Semaphore id of the run, kept after removal.
    #[inline]
    pub fn semid(&self) -> Option<i32> {
        self.semid
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        if self.state != ManagerState::Initializing {
            self.terminate(TerminationReason::InteractiveAbort);
        }
    }
}
