use core::{
    fmt,
    hint::spin_loop,
    str::FromStr,
    sync::atomic::{fence, Ordering},
};

use libc::c_int;

use crate::arena::SharedArena;
use crate::error::{Error, Result};
use crate::syscall::*;

/// Spins before a waiting worker gives its time slice away.
const SPINS_BEFORE_YIELD: u32 = 1 << 10;

/// Entry gate into the critical section.
///
/// Every entry must be bracketed by exactly one `acquire` / `release` pair
/// for the same slot.
pub trait Gate {
    fn acquire(&self, slot: usize) -> Result<()>;
    fn release(&self, slot: usize) -> Result<()>;

    /// Ticket the slot currently holds, 0 when the gate has no tickets.
    fn ticket(&self, _slot: usize) -> u32 {
        0
    }

    fn name(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GateKind {
    #[default]
    Semaphore,
    Bakery,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Semaphore => "semaphore",
            GateKind::Bakery => "bakery",
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "semaphore" | "sem" => Ok(GateKind::Semaphore),
            "bakery" => Ok(GateKind::Bakery),
            other => Err(Error::Configuration(format!("unknown gate: {}", other))),
        }
    }
}

#[inline]
fn relax(spins: &mut u32) {
    *spins += 1;
    if *spins % SPINS_BEFORE_YIELD == 0 {
        std::thread::yield_now();
    } else {
        spin_loop();
    }
}

/// Lamport's bakery lock over the ticket cells of a [`SharedArena`].
///
/// No kernel object is involved: waiting workers busy-wait on the arena.
pub struct BakeryMutex<'a> {
    arena: &'a SharedArena,
}

impl<'a> BakeryMutex<'a> {
    pub const fn new(arena: &'a SharedArena) -> Self {
        Self { arena }
    }

    /// Take a ticket and wait until every smaller `(ticket, slot)` pair is served.
    pub fn lock(&self, p: usize) {
        let mine = self.take_ticket(p);
        trace!("Bakery: slot {} took ticket {}", p, mine);
        self.wait_turn(p, mine);
    }

    /// Publish `max(tickets) + 1` as the ticket of `p`, fenced by `choosing[p]`.
    fn take_ticket(&self, p: usize) -> u32 {
        let tickets = self.arena.tickets();
        let choosing = self.arena.choosing();
        assert!(p < tickets.len(), "slot {} out of range 0..{}", p, tickets.len());

        // 取号之前先声明 choosing
        choosing[p].store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let max_ticket = tickets
            .iter()
            .map(|t| t.load(Ordering::Relaxed))
            .max()
            .unwrap_or(0);
        // 和别人取到同一个号没关系，按 slot 打破平局
        let mine = max_ticket + 1;
        tickets[p].store(mine, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        choosing[p].store(false, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        mine
    }

    /// Spin until no other slot holds a smaller `(ticket, slot)` pair.
    fn wait_turn(&self, p: usize, mine: u32) {
        let tickets = self.arena.tickets();
        let choosing = self.arena.choosing();

        for q in (0..tickets.len()).filter(|&q| q != p) {
            let mut spins = 0;
            // 等 q 取完号再比较
            while choosing[q].load(Ordering::Relaxed) {
                relax(&mut spins);
            }
            fence(Ordering::SeqCst);

            loop {
                let other = tickets[q].load(Ordering::Relaxed);
                // 0 表示 q 不想进入
                if other == 0 || (other, q) > (mine, p) {
                    break;
                }
                relax(&mut spins);
            }
        }
        // 临界区里的读写不能提到这之前
        fence(Ordering::SeqCst);
    }

    /// Give the ticket back.
    pub fn unlock(&self, p: usize) {
        // 临界区的写先于归还号码
        fence(Ordering::SeqCst);
        self.arena.tickets()[p].store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn current_ticket(&self, p: usize) -> u32 {
        self.arena.tickets()[p].load(Ordering::Relaxed)
    }
}

impl Gate for BakeryMutex<'_> {
    fn acquire(&self, slot: usize) -> Result<()> {
        self.lock(slot);
        Ok(())
    }

    fn release(&self, slot: usize) -> Result<()> {
        self.unlock(slot);
        Ok(())
    }

    fn ticket(&self, slot: usize) -> u32 {
        self.current_ticket(slot)
    }

    fn name(&self) -> &'static str {
        GateKind::Bakery.as_str()
    }
}

/// A single System V binary semaphore.
///
/// The creating handle owns the semaphore and is the only one allowed to
/// remove it; worker handles come from [`SemaphoreGate::open`].
#[derive(Debug)]
pub struct SemaphoreGate {
    semid: c_int,
    owner: bool,
    removed: bool,
}

impl SemaphoreGate {
    /// Create the semaphore, unlocked.
    pub fn create(key: IpcKey) -> Result<Self> {
        let semid = sys_sem_create(key).map_err(|source| Error::Allocation {
            what: "semaphore",
            source,
        })?;
        // 二值信号量，初始为 1 表示空闲
        if let Err(source) = sys_sem_set(semid, 1) {
            let _ = sys_sem_remove(semid);
            return Err(Error::Allocation {
                what: "semaphore",
                source,
            });
        }
        debug!("Sem #{} created", semid);
        Ok(Self {
            semid,
            owner: true,
            removed: false,
        })
    }

    /// Handle on a semaphore created elsewhere.
    pub fn open(semid: c_int) -> Self {
        Self {
            semid,
            owner: false,
            removed: false,
        }
    }

    #[inline]
    pub fn id(&self) -> c_int {
        self.semid
    }

    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    fn op(&self, delta: i16) -> Result<()> {
        sys_sem_op(self.semid, delta).map_err(|e| match e.raw_os_error() {
            // 被信号打断不重试，交给调用者决定
            Some(libc::EINTR) => Error::SignalInterrupted,
            _ => Error::Semaphore(e),
        })
    }

    /// P: wait (in the kernel) until the counter is positive, then decrement it.
    pub fn wait(&self) -> Result<()> {
        trace!("Sem #{} wait", self.semid);
        self.op(-1)
    }

    /// V: increment the counter, waking one waiter.
    pub fn signal(&self) -> Result<()> {
        trace!("Sem #{} signal", self.semid);
        self.op(1)
    }

    pub fn value(&self) -> Result<i32> {
        sys_sem_get(self.semid).map_err(Error::Semaphore)
    }

    /// Destroy the semaphore. Only the creating handle may do this, once.
    pub fn remove(&mut self) -> Result<()> {
        if !self.owner {
            return Err(Error::NotOwner("semaphore"));
        }
        if self.removed {
            return Err(Error::AlreadyReleased("semaphore"));
        }
        self.removed = true;
        sys_sem_remove(self.semid).map_err(Error::Semaphore)?;
        debug!("Sem #{} removed", self.semid);
        Ok(())
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

impl Gate for SemaphoreGate {
    fn acquire(&self, _slot: usize) -> Result<()> {
        self.wait()
    }

    fn release(&self, _slot: usize) -> Result<()> {
        self.signal()
    }

    fn name(&self) -> &'static str {
        GateKind::Semaphore.as_str()
    }
}

impl Drop for SemaphoreGate {
    fn drop(&mut self) {
        if self.owner && !self.removed {
            if let Err(e) = self.remove() {
                warn!("Sem #{} remove on drop failed: {}", self.semid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::IpcKey;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    const ROUNDS: usize = 200;

    /// Run `workers` threads that each enter the section `ROUNDS` times and
    /// check the resource marker is never found taken.
    fn hammer<G: Gate + Sync>(arena: &SharedArena, gate: &G, workers: usize) -> usize {
        let violations = AtomicUsize::new(0);
        let inside = AtomicUsize::new(0);
        thread::scope(|s| {
            for slot in 0..workers {
                let violations = &violations;
                let inside = &inside;
                s.spawn(move || {
                    for _ in 0..ROUNDS {
                        gate.acquire(slot).unwrap();
                        if inside.fetch_add(1, AtomicOrdering::SeqCst) != 0 {
                            violations.fetch_add(1, AtomicOrdering::SeqCst);
                        }
                        if arena.claim(slot).is_some() {
                            violations.fetch_add(1, AtomicOrdering::SeqCst);
                        }
                        spin_loop();
                        arena.vacate();
                        inside.fetch_sub(1, AtomicOrdering::SeqCst);
                        gate.release(slot).unwrap();
                    }
                });
            }
        });
        violations.into_inner()
    }

    #[test]
    fn bakery_excludes() {
        let arena = SharedArena::create(IpcKey::Private, 4).unwrap();
        let bakery = BakeryMutex::new(&arena);
        assert_eq!(hammer(&arena, &bakery, 4), 0);
        assert!(arena.tickets().iter().all(|t| t.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn semaphore_excludes() {
        let arena = SharedArena::create(IpcKey::Private, 4).unwrap();
        let sem = SemaphoreGate::create(IpcKey::Private).unwrap();
        assert_eq!(hammer(&arena, &sem, 4), 0);
        assert_eq!(sem.value().unwrap(), 1);
    }

    #[test]
    fn unlock_reclaims_the_ticket() {
        let arena = SharedArena::create(IpcKey::Private, 3).unwrap();
        let bakery = BakeryMutex::new(&arena);

        bakery.lock(0);
        assert_eq!(bakery.current_ticket(0), 1);
        bakery.unlock(0);
        assert_eq!(bakery.current_ticket(0), 0);

        // slot 2 is still requesting with ticket 9
        arena.tickets()[2].store(9, Ordering::Relaxed);
        let entered = AtomicUsize::new(0);

        thread::scope(|s| {
            let arena = &arena;
            let entered = &entered;
            s.spawn(move || {
                let bakery = BakeryMutex::new(arena);
                bakery.lock(1);
                entered.store(1, AtomicOrdering::SeqCst);
                bakery.unlock(1);
            });

            while bakery.current_ticket(1) == 0 {
                thread::yield_now();
            }
            assert_eq!(bakery.current_ticket(1), 10);
            thread::sleep(Duration::from_millis(30));
            let early = entered.load(AtomicOrdering::SeqCst);
            bakery.unlock(2);
            assert_eq!(early, 0, "slot 1 entered ahead of a smaller ticket");
        });

        assert_eq!(entered.into_inner(), 1);
        assert!(arena.tickets().iter().all(|t| t.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn smaller_ticket_enters_first() {
        let arena = SharedArena::create(IpcKey::Private, 3).unwrap();
        let order = Mutex::new(Vec::new());

        // slot 2 already queued with ticket 1
        arena.tickets()[2].store(1, Ordering::Relaxed);

        thread::scope(|s| {
            let arena = &arena;
            let order = &order;
            s.spawn(move || {
                let bakery = BakeryMutex::new(arena);
                bakery.lock(0);
                order.lock().unwrap().push(0);
                bakery.unlock(0);
            });

            thread::sleep(Duration::from_millis(50));
            order.lock().unwrap().push(2);
            BakeryMutex::new(arena).unlock(2);
        });

        assert_eq!(*order.lock().unwrap(), vec![2, 0]);
    }

    #[test]
    fn equal_tickets_break_by_slot() {
        let arena = SharedArena::create(IpcKey::Private, 2).unwrap();
        let bakery = BakeryMutex::new(&arena);
        arena.tickets()[0].store(2, Ordering::Relaxed);
        arena.tickets()[1].store(2, Ordering::Relaxed);

        // the lower slot does not wait on a tie
        bakery.wait_turn(0, 2);

        let entered = AtomicUsize::new(0);
        thread::scope(|s| {
            let arena = &arena;
            let entered = &entered;
            s.spawn(move || {
                BakeryMutex::new(arena).wait_turn(1, 2);
                entered.store(1, AtomicOrdering::SeqCst);
            });

            thread::sleep(Duration::from_millis(30));
            let early = entered.load(AtomicOrdering::SeqCst);
            bakery.unlock(0);
            assert_eq!(early, 0, "slot 1 won a tie against slot 0");
        });
        assert_eq!(entered.into_inner(), 1);
    }

    #[test]
    fn semaphore_blocks_until_signalled() {
        let sem = Arc::new(SemaphoreGate::create(IpcKey::Private).unwrap());
        sem.wait().unwrap();
        assert_eq!(sem.value().unwrap(), 0);

        let barrier = Arc::new(Barrier::new(2));
        let waiter = {
            let sem = Arc::clone(&sem);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                sem.wait().unwrap();
                sem.signal().unwrap();
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        sem.signal().unwrap();
        waiter.join().unwrap();
        assert_eq!(sem.value().unwrap(), 1);
    }

    #[test]
    fn only_the_owner_removes() {
        let mut owner = SemaphoreGate::create(IpcKey::Private).unwrap();
        let mut worker = SemaphoreGate::open(owner.id());
        assert!(matches!(worker.remove(), Err(Error::NotOwner(_))));

        owner.remove().unwrap();
        assert!(matches!(owner.remove(), Err(Error::AlreadyReleased(_))));
        assert!(matches!(worker.wait(), Err(Error::Semaphore(_))));
    }

    #[test]
    fn gate_kind_parses() {
        assert_eq!("bakery".parse::<GateKind>().unwrap(), GateKind::Bakery);
        assert_eq!("semaphore".parse::<GateKind>().unwrap(), GateKind::Semaphore);
        assert!("mutex".parse::<GateKind>().is_err());
        assert_eq!(GateKind::default(), GateKind::Semaphore);
    }
}
