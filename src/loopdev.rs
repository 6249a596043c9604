//! Loop device minor numbers, shared between processes by file locks
//!
//! The minor number range is divided into fixed-size chunks. A chunk belongs
//! to whoever holds the exclusive lock on its marker file, so there is no
//! other bookkeeping to get out of sync. Closing the lock frees the chunk.

use crate::{
    errors::Error,
    lock::{LockFile, LockLevel},
    resource::{close_on_drop, Resource, ResourceState},
};
use nix::errno::Errno;
use std::{
    fs,
    fs::File,
    ops::Range,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

/// Block device major number for loop devices
pub const LOOP_MAJOR: u64 = 7;

pub const DEFAULT_CHUNK: u32 = 8;
pub const DEFAULT_RANGE: Range<u32> = 64..1024;

const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

// /usr/include/linux/loop.h
nix::ioctl_none_bad!(loop_clr_fd, 0x4C01);

#[derive(Clone, Debug)]
pub struct LoopPool {
    lock_dir: PathBuf,
    start: u32,
    end: u32,
    chunk: u32,
}

impl LoopPool {
    /// A pool handing out `chunk` minors at a time from `start..end`
    pub fn new<P: AsRef<Path>>(lock_dir: P, start: u32, end: u32, chunk: u32) -> Result<Self, Error> {
        if chunk == 0 || start % chunk != 0 || end % chunk != 0 || start >= end {
            return Err(Error::InvalidConfig(format!(
                "loop range {}..{} does not divide into chunks of {}",
                start, end, chunk
            )));
        }
        Ok(LoopPool {
            lock_dir: lock_dir.as_ref().to_path_buf(),
            start,
            end,
            chunk,
        })
    }

    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    /// Number of chunks in the pool
    pub fn capacity(&self) -> u32 {
        (self.end - self.start) / self.chunk
    }

    /// Claim the first chunk nobody else holds
    pub fn acquire(&self) -> Result<LoopAllocation, Error> {
        fs::create_dir_all(&self.lock_dir)?;
        for offset in (self.start..self.end).step_by(self.chunk as usize) {
            let mut lock = LockFile::new(self.lock_dir.join(offset.to_string()));
            if lock.try_lock(LockLevel::Exclusive)? {
                log::debug!("claimed loop minors {}..{}", offset, offset + self.chunk);
                return Ok(LoopAllocation {
                    minors: offset..offset + self.chunk,
                    lock,
                    state: ResourceState::Open,
                });
            }
        }
        Err(Error::OutOfDevices {
            start: self.start,
            end: self.end,
        })
    }
}

/// A claimed chunk of loop device minors
#[derive(Debug)]
pub struct LoopAllocation {
    minors: Range<u32>,
    lock: LockFile,
    state: ResourceState,
}

impl LoopAllocation {
    pub fn minors(&self) -> Range<u32> {
        self.minors.clone()
    }

    /// Which chunk of the pool this is
    pub fn offset(&self) -> u32 {
        self.minors.start
    }
}

impl Resource for LoopAllocation {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state.begin_close() {
            log::debug!("freeing loop minors {:?}", self.minors);
            self.lock.unlock();
        }
        Ok(())
    }

    fn release(&mut self) {
        self.state.release()
    }
}

impl Drop for LoopAllocation {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}

/// Detach a loop device from its backing file
///
/// Returns false if nothing was attached.
pub fn detach(device: &Path) -> Result<bool, Error> {
    let file = match File::open(device) {
        Ok(file) => file,
        Err(err) if err.raw_os_error() == Some(libc::ENXIO) => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    match unsafe { loop_clr_fd(file.as_raw_fd()) } {
        Ok(_) => Ok(true),
        Err(Errno::ENXIO) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Detach every device in the list, making up to `rounds` passes
///
/// Devices can be nested inside one another, and an outer one stays busy
/// until the inner one is detached. Busy devices are retried on the next
/// pass, and anything else that fails is logged.
pub fn detach_all(devices: &[PathBuf], rounds: u32) {
    for _ in 0..rounds {
        let mut busy = false;
        for device in devices {
            match detach(device) {
                Ok(true) => log::info!("detached loop device {:?}", device),
                Ok(false) => {}
                Err(err) if err.errno() == Some(Errno::EBUSY) => {
                    log::warn!("loop device {:?} is busy", device);
                    busy = true;
                }
                Err(err) => log::error!("error detaching loop device {:?}, {}", device, err),
            }
        }
        if !busy {
            return;
        }
        thread::sleep(BUSY_RETRY_DELAY);
    }
}

/// Host loop devices whose backing file is `target`
pub fn backed_by(target: &Path) -> Result<Vec<PathBuf>, Error> {
    let target = fs::canonicalize(target)?;
    let mut devices = Vec::new();
    for entry in fs::read_dir("/sys/block")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("loop") {
            continue;
        }
        let backing = match fs::read_to_string(entry.path().join("loop").join("backing_file")) {
            Ok(backing) => backing,
            Err(_) => continue,
        };
        let backing = Path::new(backing.trim_end());
        if fs::canonicalize(backing).map(|b| b == target).unwrap_or(false) {
            devices.push(Path::new("/dev").join(name));
        }
    }
    Ok(devices)
}
