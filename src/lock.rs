//! Advisory file locks shared between cooperating processes
//!
//! A lock file holds no data, it only exists to be locked. The open handle is
//! dropped whenever the lock returns to [LockLevel::Unlocked], and a freshly
//! acquired lock is checked against the path on disk. This way a process
//! that deletes the lock file while holding it exclusively can't leave
//! anyone locking an orphaned inode.

use crate::{abort, errors::Error};
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use rand::Rng;
use std::{
    fs,
    fs::{File, OpenOptions},
    io,
    os::unix::{
        fs::{MetadataExt, OpenOptionsExt},
        io::AsRawFd,
    },
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

/// Default bound on any blocking lock wait
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

const POLL_MIN_MILLIS: u64 = 100;
const POLL_MAX_MILLIS: u64 = 500;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockLevel {
    Unlocked,
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
    level: LockLevel,
}

impl LockFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        LockFile {
            path: path.as_ref().to_path_buf(),
            file: None,
            level: LockLevel::Unlocked,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Try once, without blocking, to hold the lock at `level`
    ///
    /// Returns false if another holder is in the way. Changing between
    /// shared and exclusive is not atomic, so a failed change leaves the
    /// lock released.
    pub fn try_lock(&mut self, level: LockLevel) -> Result<bool, Error> {
        let arg = match level {
            LockLevel::Unlocked => {
                self.unlock();
                return Ok(true);
            }
            _ if level == self.level => return Ok(true),
            LockLevel::Shared => FlockArg::LockSharedNonblock,
            LockLevel::Exclusive => FlockArg::LockExclusiveNonblock,
        };
        loop {
            let file = match self.file.take() {
                Some(file) => file,
                None => self.open()?,
            };
            match flock(file.as_raw_fd(), arg) {
                Ok(()) => {}
                Err(Errno::EWOULDBLOCK) => {
                    self.level = LockLevel::Unlocked;
                    return Ok(false);
                }
                Err(err) => {
                    self.level = LockLevel::Unlocked;
                    return Err(err.into());
                }
            }
            if self.level == LockLevel::Unlocked && !self.is_current(&file)? {
                log::debug!("lock file {:?} was replaced while locking", self.path);
                continue;
            }
            self.file = Some(file);
            self.level = level;
            return Ok(true);
        }
    }

    /// Poll for the lock at `level` until it's acquired or `timeout` elapses
    ///
    /// Between attempts this sleeps for a randomized interval, so many
    /// waiters don't all retry at the same moment. If `break_if` returns true
    /// the wait ends early and this returns false without holding the lock.
    pub fn lock_wait<F: FnMut() -> bool>(
        &mut self,
        level: LockLevel,
        timeout: Duration,
        mut break_if: F,
    ) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock(level)? {
                return Ok(true);
            }
            if break_if() {
                return Ok(false);
            }
            abort::check()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    path: self.path.clone(),
                    timeout,
                });
            }
            let delay = rand::thread_rng().gen_range(POLL_MIN_MILLIS, POLL_MAX_MILLIS);
            thread::sleep(Duration::from_millis(delay).min(deadline - now));
        }
    }

    /// Release any lock held, closing the file handle
    pub fn unlock(&mut self) {
        self.file = None;
        self.level = LockLevel::Unlocked;
    }

    /// Remove the lock file from disk
    ///
    /// Only allowed while holding the lock exclusively. The lock is released
    /// afterward.
    pub fn delete(&mut self) -> Result<(), Error> {
        if self.level != LockLevel::Exclusive {
            return Err(Error::InvalidState {
                operation: "deleting a lock file",
                state: format!("holding it at {:?}", self.level),
            });
        }
        let result = fs::remove_file(&self.path);
        self.unlock();
        match result {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn open(&self) -> Result<File, Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(&self.path)?)
    }

    fn is_current(&self, file: &File) -> Result<bool, Error> {
        let held = file.metadata()?;
        match fs::metadata(&self.path) {
            Ok(on_disk) => Ok(on_disk.dev() == held.dev() && on_disk.ino() == held.ino()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
