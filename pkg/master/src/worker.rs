//! What a `slave` process does between attach and detach.

use std::sync::atomic::{fence, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use lib::{
    proc_number, BakeryMutex, Error, EventLog, Gate, GateKind, Result, SemaphoreGate,
    SharedArena, WorkerEvent,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::WorkerConfig;

/// Tally of one worker's run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// Passes through the critical section.
    pub entries: usize,
    /// Passes that found the resource already held by someone else.
    pub violations: usize,
}

/// Attach to the run's arena and go through the critical section
/// `config.iterations` times.
pub fn run_worker(slot: usize, shmid: i32, semid: i32, config: &WorkerConfig) -> Result<WorkerReport> {
    config.validate()?;
    let mut arena = SharedArena::attach(shmid)?;
    if slot >= arena.capacity() {
        return Err(Error::Configuration(format!(
            "slot {} outside an arena of {} slots",
            slot,
            arena.capacity()
        )));
    }

    let log = EventLog::new(&config.log_dir);
    let mut rng = StdRng::seed_from_u64(seed(slot));
    info!(
        "Worker #{} attached to #{}, gate {}",
        proc_number(slot),
        shmid,
        config.gate
    );

    let report = match config.gate {
        GateKind::Semaphore => {
            let gate = SemaphoreGate::open(semid);
            work(slot, &arena, &gate, &log, config, &mut rng)?
        }
        GateKind::Bakery => {
            let gate = BakeryMutex::new(&arena);
            work(slot, &arena, &gate, &log, config, &mut rng)?
        }
    };

    arena.release()?;
    Ok(report)
}

/// The worker loop proper, over any gate.
pub fn work<G: Gate, R: Rng>(
    slot: usize,
    arena: &SharedArena,
    gate: &G,
    log: &EventLog,
    config: &WorkerConfig,
    rng: &mut R,
) -> Result<WorkerReport> {
    let mut report = WorkerReport::default();
    for _ in 0..config.iterations {
        log.worker_event(slot, WorkerEvent::Requested)?;
        gate.acquire(slot)?;

        let inside = critical_section(slot, arena, gate, log, config, rng);
        let left = gate.release(slot);
        if inside? {
            report.violations += 1;
        }
        left?;
        report.entries += 1;
    }
    debug!(
        "Worker #{} done: {} entries, {} violations",
        proc_number(slot),
        report.entries,
        report.violations
    );
    Ok(report)
}

fn critical_section<G: Gate, R: Rng>(
    slot: usize,
    arena: &SharedArena,
    gate: &G,
    log: &EventLog,
    config: &WorkerConfig,
    rng: &mut R,
) -> Result<bool> {
    log.worker_event(slot, WorkerEvent::Entered)?;
    pause(config, rng);
    let clash = use_resource(slot, arena, gate.ticket(slot), log)?;
    log.worker_event(slot, WorkerEvent::Wrote)?;
    pause(config, rng);
    log.worker_event(slot, WorkerEvent::Exited)?;
    Ok(clash)
}

/// Touch the shared resource. Returns true when somebody else was holding it.
pub fn use_resource(slot: usize, arena: &SharedArena, ticket: u32, log: &EventLog) -> Result<bool> {
    let clash = match arena.claim(slot) {
        Some(holder) => {
            println!(
                "Resource was acquired by {}, but is still in-use by {}!",
                proc_number(slot),
                proc_number(holder)
            );
            warn!(
                "Worker #{} found the resource held by #{}",
                proc_number(slot),
                proc_number(holder)
            );
            true
        }
        None => false,
    };

    println!("Process {} just wrote to 'cstest' file...", proc_number(slot));
    let written = log.resource_write(slot, ticket);

    fence(Ordering::SeqCst);
    arena.vacate();
    written.map(|_| clash)
}

fn pause<R: Rng>(config: &WorkerConfig, rng: &mut R) {
    let units = rng.random_range(config.sleep_min..=config.sleep_max);
    if units > 0 {
        thread::sleep(config.time_unit.saturating_mul(units.min(u32::MAX as u64) as u32));
    }
}

fn seed(slot: usize) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() ^ now.subsec_nanos() as u64).wrapping_mul(proc_number(slot) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib::IpcKey;
    use std::fs;
    use std::time::Duration;

    fn quick(dir: &std::path::Path) -> WorkerConfig {
        WorkerConfig::default()
            .with_iterations(3)
            .with_time_unit(Duration::from_millis(1))
            .with_sleep(0, 1)
            .with_log_dir(dir)
    }

    fn lines(path: std::path::PathBuf) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn one_worker_logs_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick(dir.path());
        let arena = SharedArena::create(IpcKey::Private, 2).unwrap();
        let gate = SemaphoreGate::create(IpcKey::Private).unwrap();
        let log = EventLog::new(dir.path());
        let mut rng = StdRng::seed_from_u64(7);

        let report = work(1, &arena, &gate, &log, &config, &mut rng).unwrap();
        assert_eq!(report, WorkerReport { entries: 3, violations: 0 });
        assert_eq!(gate.value().unwrap(), 1);
        assert_eq!(arena.owner(), None);

        let trace = lines(log.worker_target(1));
        assert_eq!(trace.len(), 12);
        for (i, line) in trace.iter().enumerate() {
            let expected = match i % 4 {
                0 => "Requested to join critical section by process number: 2",
                1 => "Entered critical section by process number: 2",
                2 => "Wrote in 'cstest' file by process number: 2",
                _ => "Exited critical section by process number: 2",
            };
            assert!(line.ends_with(expected), "line {}: {}", i, line);
        }
        let shared = lines(log.resource_target());
        assert_eq!(shared.len(), 3);
        assert!(shared
            .iter()
            .all(|l| l.ends_with("Queue 0 File modified by process number 2")));
    }

    #[test]
    fn bakery_workers_log_their_tickets() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick(dir.path());
        let arena = SharedArena::create(IpcKey::Private, 3).unwrap();
        let gate = BakeryMutex::new(&arena);
        let log = EventLog::new(dir.path());

        let reports: Vec<WorkerReport> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|slot| {
                    let (arena, gate, log, config) = (&arena, &gate, &log, &config);
                    s.spawn(move || {
                        let mut rng = StdRng::seed_from_u64(slot as u64);
                        work(slot, arena, gate, log, config, &mut rng)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect()
        });

        assert!(reports.iter().all(|r| r.entries == 3 && r.violations == 0));
        let shared = lines(log.resource_target());
        assert_eq!(shared.len(), 9);
        // bakery tickets are never 0 inside the section
        assert!(shared.iter().all(|l| !l.contains("Queue 0 ")));
        assert!(arena.tickets().iter().all(|t| t.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn held_resource_is_reported_and_freed() {
        let dir = tempfile::tempdir().unwrap();
        let arena = SharedArena::create(IpcKey::Private, 2).unwrap();
        let log = EventLog::new(dir.path());

        assert_eq!(arena.claim(0), None);
        assert!(use_resource(1, &arena, 5, &log).unwrap());
        assert_eq!(arena.owner(), None);
        assert!(!use_resource(1, &arena, 6, &log).unwrap());
        assert_eq!(lines(log.resource_target()).len(), 2);
    }

    #[test]
    fn log_failure_still_leaves_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick(dir.path());
        let arena = SharedArena::create(IpcKey::Private, 1).unwrap();
        let gate = SemaphoreGate::create(IpcKey::Private).unwrap();
        let log = EventLog::new(dir.path());
        // the shared target cannot be opened, so the write inside the section fails
        fs::create_dir(log.resource_target()).unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            work(0, &arena, &gate, &log, &config, &mut rng),
            Err(Error::LogWrite { .. })
        ));
        assert_eq!(gate.value().unwrap(), 1);
        assert_eq!(arena.owner(), None);
        assert_eq!(lines(log.worker_target(0)).len(), 2);
    }

    #[test]
    fn slot_must_fit_the_arena() {
        let dir = tempfile::tempdir().unwrap();
        let arena = SharedArena::create(IpcKey::Private, 2).unwrap();
        assert!(matches!(
            run_worker(2, arena.id(), -1, &quick(dir.path())),
            Err(Error::Configuration(_))
        ));
    }
}
