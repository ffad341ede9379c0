//! The block of System V shared memory every process of the pool maps.
//!
//! Layout (all little fixed-size cells, no padding surprises):
//!
//! ```text
//! +----------+----------+------------------+-------------------+
//! | capacity | resource | tickets[cap]: u32 | choosing[cap]: u8 |
//! +----------+----------+------------------+-------------------+
//! ```
//!
//! The arena only hands out the cells. Every access is a relaxed load or
//! store; ordering between cells is the business of the lock built on top.

use core::mem::size_of;
use core::slice;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use libc::c_int;

use crate::error::{Error, Result};
use crate::syscall::*;
use crate::MAX_PROCS;

/// Marker value of `resource` when nobody holds it.
const RESOURCE_FREE: u32 = 0;

#[repr(C)]
struct ArenaHeader {
    capacity: AtomicU32,
    resource: AtomicU32,
}

const HEADER_SIZE: usize = size_of::<ArenaHeader>();

/// Bytes needed by an arena of `capacity` slots.
#[inline]
pub const fn arena_size(capacity: usize) -> usize {
    HEADER_SIZE + capacity * size_of::<AtomicU32>() + capacity * size_of::<AtomicBool>()
}

pub struct SharedArena {
    shmid: c_int,
    base: *mut u8,
    capacity: usize,
    owner: bool,    // 创建者负责 IPC_RMID
    released: bool,
}

// 所有字段访问都是原子的，跨线程共享同一个映射是安全的
unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

impl SharedArena {
    /// Allocate a zeroed segment for `capacity` slots and attach it.
    ///
    /// The returned handle owns the segment: releasing it also removes it.
    /// A segment left behind under the same key is reported, never reused.
    pub fn create(key: IpcKey, capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_PROCS {
            return Err(Error::Configuration(format!(
                "arena capacity must be within 1..={}, got {}",
                MAX_PROCS, capacity
            )));
        }

        let shmid = sys_shm_create(key, arena_size(capacity)).map_err(|source| {
            Error::Allocation {
                what: "shared memory",
                source,
            }
        })?;

        let base = match sys_shm_attach(shmid) {
            Ok(base) => base,
            Err(source) => {
                // nobody else knows the id yet
                let _ = sys_shm_remove(shmid);
                return Err(Error::Attach { shmid, source });
            }
        };

        let arena = Self {
            shmid,
            base,
            capacity,
            owner: true,
            released: false,
        };
        // shmget zero-fills; only the slot count needs writing
        arena.header().capacity.store(capacity as u32, Ordering::Relaxed);
        arena.header().resource.store(RESOURCE_FREE, Ordering::Relaxed);

        debug!(
            "Arena #{} created: {} slots, {} bytes",
            shmid,
            capacity,
            arena_size(capacity)
        );
        Ok(arena)
    }

    /// Map an existing segment into this process.
    pub fn attach(shmid: c_int) -> Result<Self> {
        let size = sys_shm_size(shmid).map_err(|source| Error::Attach { shmid, source })?;
        if size < HEADER_SIZE {
            return Err(Error::Attach {
                shmid,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("segment of {} bytes is too small", size),
                ),
            });
        }

        let base = sys_shm_attach(shmid).map_err(|source| Error::Attach { shmid, source })?;
        let header = unsafe { &*(base as *const ArenaHeader) };
        let capacity = header.capacity.load(Ordering::Relaxed) as usize;

        if capacity == 0 || capacity > MAX_PROCS || arena_size(capacity) > size {
            let _ = sys_shm_detach(base);
            return Err(Error::Attach {
                shmid,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("segment header claims {} slots in {} bytes", capacity, size),
                ),
            });
        }

        trace!("Arena #{} attached: {} slots", shmid, capacity);
        Ok(Self {
            shmid,
            base,
            capacity,
            owner: false,
            released: false,
        })
    }

    /// Detach, and remove the segment if this handle created it.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::AlreadyReleased("shared memory"));
        }
        self.released = true;

        sys_shm_detach(self.base)?;
        if self.owner {
            sys_shm_remove(self.shmid)?;
            debug!("Arena #{} removed", self.shmid);
        } else {
            trace!("Arena #{} detached", self.shmid);
        }
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> c_int {
        self.shmid
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.released
    }

    #[inline]
    fn header(&self) -> &ArenaHeader {
        assert!(!self.released, "arena used after release");
        unsafe { &*(self.base as *const ArenaHeader) }
    }

    /// Ticket cells, one per slot.
    #[inline]
    pub fn tickets(&self) -> &[AtomicU32] {
        let _ = self.header();
        unsafe {
            slice::from_raw_parts(
                self.base.add(HEADER_SIZE) as *const AtomicU32,
                self.capacity,
            )
        }
    }

    /// Choosing flags, one per slot.
    #[inline]
    pub fn choosing(&self) -> &[AtomicBool] {
        let _ = self.header();
        unsafe {
            slice::from_raw_parts(
                self.base
                    .add(HEADER_SIZE + self.capacity * size_of::<AtomicU32>())
                    as *const AtomicBool,
                self.capacity,
            )
        }
    }

    /// Slot currently holding the resource.
    #[inline]
    pub fn owner(&self) -> Option<usize> {
        match self.header().resource.load(Ordering::Relaxed) {
            RESOURCE_FREE => None,
            marker => Some(marker as usize - 1),
        }
    }

    /// Mark the resource as used by `slot`.
    ///
    /// Returns the previous holder when the marker was not free, which means
    /// two workers are inside the critical section at once.
    pub fn claim(&self, slot: usize) -> Option<usize> {
        debug_assert!(slot < self.capacity);
        let prev = self.owner();
        self.header()
            .resource
            .store(slot as u32 + 1, Ordering::Relaxed);
        prev
    }

    #[inline]
    pub fn vacate(&self) {
        self.header().resource.store(RESOURCE_FREE, Ordering::Relaxed);
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release() {
                warn!("Arena #{} release on drop failed: {}", self.shmid, e);
            }
        }
    }
}

impl core::fmt::Debug for SharedArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedArena")
            .field("shmid", &self.shmid)
            .field("capacity", &self.capacity)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish()
    }
}
