//! Instance-wide reader/writer locks with bounded waits.
//!
//! Mutations hold the write side for their whole read-modify-write sequence,
//! which is what keeps serial allocation race-free. Readers share the read
//! side. Every acquisition names how long it may wait; a timeout is reported
//! as [`PkiError::Locked`].
//!
//! [`InstanceLock`] orders threads of one process. [`DirLock`] is an advisory
//! lock on a file in the instance directory and orders processes.

use crate::error::{PkiError, Result};
use fs4::fs_std::FileExt;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Pause between attempts on a contended [`DirLock`].
const DIR_LOCK_POLL: Duration = Duration::from_millis(10);

/// State guarded by a timed reader/writer lock.
#[derive(Debug)]
pub struct InstanceLock<T> {
    state: RwLock<T>,
    label: String,
}

impl<T> InstanceLock<T> {
    /// Wrap `state`; `label` names the instance in timeout errors.
    pub fn new(state: T, label: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(state),
            label: label.into(),
        }
    }

    /// Exclusive access for a mutation.
    pub fn write(&self, timeout: Duration) -> Result<RwLockWriteGuard<'_, T>> {
        self.state.try_write_for(timeout).ok_or_else(|| {
            PkiError::Locked(format!(
                "{}: write lock not acquired within {:?}",
                self.label, timeout
            ))
        })
    }

    /// Shared access for a read.
    pub fn read(&self, timeout: Duration) -> Result<RwLockReadGuard<'_, T>> {
        self.state.try_read_for(timeout).ok_or_else(|| {
            PkiError::Locked(format!(
                "{}: read lock not acquired within {:?}",
                self.label, timeout
            ))
        })
    }
}

/// Advisory lock on a file, held until dropped.
#[derive(Debug)]
pub struct DirLock {
    file: File,
}

impl DirLock {
    /// Exclusive lock for a mutation.
    pub fn exclusive(path: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire(path, timeout, "exclusive", |file| {
            FileExt::try_lock_exclusive(file)
        })
    }

    /// Shared lock for a read.
    pub fn shared(path: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire(path, timeout, "shared", |file| FileExt::try_lock_shared(file))
    }

    fn acquire<F>(path: &Path, timeout: Duration, mode: &str, try_lock: F) -> Result<Self>
    where
        F: Fn(&File) -> io::Result<()>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let deadline = Instant::now() + timeout;

        loop {
            match try_lock(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(PkiError::Locked(format!(
                    "{}: {} lock not acquired within {:?}",
                    path.display(),
                    mode,
                    timeout
                )));
            }
            thread::sleep(DIR_LOCK_POLL);
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // Closing the file releases the lock as well.
        let _ = FileExt::unlock(&self.file);
    }
}

/// `ERROR_LOCK_VIOLATION`, reported on Windows for a contended lock.
const LOCK_VIOLATION: i32 = 33;

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || (cfg!(windows) && e.raw_os_error() == Some(LOCK_VIOLATION))
}
