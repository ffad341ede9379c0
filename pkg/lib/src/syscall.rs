//! Thin wrappers over the System V IPC calls.
//!
//! Every wrapper turns the `-1` / `errno` convention into `io::Result`.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use libc::{c_int, c_void, key_t};

/// Permission bits for every object created here (rw for everyone, like 0666).
pub const IPC_PERM: c_int = 0o666;

/// Key naming a System V object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcKey {
    /// Fresh, unnamed object; only reachable through its id.
    Private,
    Key(key_t),
}

impl IpcKey {
    /// Derive a stable key from an existing file, like `ftok(3)`.
    pub fn from_path(path: &Path, proj: u8) -> io::Result<Self> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let key = unsafe { libc::ftok(path.as_ptr(), proj as c_int) };
        if key == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(IpcKey::Key(key))
        }
    }

    #[inline]
    pub fn raw(&self) -> key_t {
        match self {
            IpcKey::Private => libc::IPC_PRIVATE,
            IpcKey::Key(key) => *key,
        }
    }
}

#[inline]
fn check(ret: c_int) -> io::Result<c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Create a new segment; fails with `EEXIST` if the key is already taken.
#[inline]
pub fn sys_shm_create(key: IpcKey, size: usize) -> io::Result<c_int> {
    check(unsafe {
        libc::shmget(
            key.raw(),
            size,
            IPC_PERM | libc::IPC_CREAT | libc::IPC_EXCL,
        )
    })
}

#[inline]
pub fn sys_shm_attach(shmid: c_int) -> io::Result<*mut u8> {
    let addr = unsafe { libc::shmat(shmid, ptr::null(), 0) };
    if addr as isize == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(addr as *mut u8)
    }
}

#[inline]
pub fn sys_shm_detach(addr: *mut u8) -> io::Result<()> {
    check(unsafe { libc::shmdt(addr as *const c_void) }).map(|_| ())
}

/// Size in bytes of an existing segment.
pub fn sys_shm_size(shmid: c_int) -> io::Result<usize> {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    check(unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) })?;
    Ok(ds.shm_segsz as usize)
}

/// Mark the segment for removal once the last process detaches.
#[inline]
pub fn sys_shm_remove(shmid: c_int) -> io::Result<()> {
    check(unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) }).map(|_| ())
}

/// Create a set holding one semaphore; fails with `EEXIST` if the key is taken.
#[inline]
pub fn sys_sem_create(key: IpcKey) -> io::Result<c_int> {
    check(unsafe { libc::semget(key.raw(), 1, IPC_PERM | libc::IPC_CREAT | libc::IPC_EXCL) })
}

#[inline]
pub fn sys_sem_set(semid: c_int, value: c_int) -> io::Result<()> {
    check(unsafe { libc::semctl(semid, 0, libc::SETVAL, value) }).map(|_| ())
}

#[inline]
pub fn sys_sem_get(semid: c_int) -> io::Result<c_int> {
    check(unsafe { libc::semctl(semid, 0, libc::GETVAL) })
}

/// Add `delta` to the semaphore, blocking while the result would go negative.
#[inline]
pub fn sys_sem_op(semid: c_int, delta: i16) -> io::Result<()> {
    let mut op = libc::sembuf {
        sem_num: 0,
        sem_op: delta,
        sem_flg: 0,
    };
    check(unsafe { libc::semop(semid, &mut op, 1) }).map(|_| ())
}

#[inline]
pub fn sys_sem_remove(semid: c_int) -> io::Result<()> {
    check(unsafe { libc::semctl(semid, 0, libc::IPC_RMID) }).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ftok_is_stable_for_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::File::create(&path).unwrap();

        let a = IpcKey::from_path(&path, b'S').unwrap();
        let b = IpcKey::from_path(&path, b'S').unwrap();
        let c = IpcKey::from_path(&path, b'E').unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ftok_needs_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IpcKey::from_path(&dir.path().join("missing"), b'S').is_err());
    }

    #[test]
    fn semaphore_roundtrip() {
        let semid = sys_sem_create(IpcKey::Private).unwrap();
        sys_sem_set(semid, 1).unwrap();
        sys_sem_op(semid, -1).unwrap();
        assert_eq!(sys_sem_get(semid).unwrap(), 0);
        sys_sem_op(semid, 1).unwrap();
        assert_eq!(sys_sem_get(semid).unwrap(), 1);
        sys_sem_remove(semid).unwrap();
        assert!(sys_sem_get(semid).is_err());
    }
}
