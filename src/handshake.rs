//! Two-pipe startup handshake between an orchestrator and an isolated child
//!
//! The child reports on the ready pipe once its internal setup is done, then
//! blocks on the release pipe until the orchestrator closes it. The ready
//! pipe stays open in the child with close-on-exec set, so the orchestrator
//! sees end-of-file once the payload has been exec'd or the child exits.

use crate::errors::Error;
use nix::{
    errno::Errno,
    fcntl::OFlag,
    unistd::{close, pipe2, read, write, Pid},
};
use std::os::unix::io::RawFd;

const READY: u8 = b'R';
const FAILED: u8 = b'F';
const PROCEED: u8 = b'P';

fn close_fd(fd: &mut Option<RawFd>) {
    if let Some(fd) = fd.take() {
        let _ = close(fd);
    }
}

fn read_byte(fd: RawFd) -> Result<Option<u8>, Error> {
    let mut buf = [0u8; 1];
    loop {
        match read(fd, &mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

fn write_byte(fd: RawFd, byte: u8) -> Result<(), Error> {
    loop {
        match write(fd, &[byte]) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Both pipes, before the process splits
pub struct Handshake {
    ready: (RawFd, RawFd),
    release: (RawFd, RawFd),
}

impl Handshake {
    pub fn new() -> Result<Handshake, Error> {
        let ready = pipe2(OFlag::O_CLOEXEC)?;
        let release = match pipe2(OFlag::O_CLOEXEC) {
            Ok(release) => release,
            Err(err) => {
                let _ = close(ready.0);
                let _ = close(ready.1);
                return Err(err.into());
            }
        };
        Ok(Handshake { ready, release })
    }

    /// Split into the orchestrator's ends and the child's ends
    ///
    /// Each half closes only its own descriptors. After forking, the child
    /// must close the orchestrator's ends (closing all descriptors outside
    /// [ChildHandshake::fds] does this) and the orchestrator drops its copy
    /// of the child half.
    pub fn split(self) -> (ParentHandshake, ChildHandshake) {
        (
            ParentHandshake {
                ready: Some(self.ready.0),
                release: Some(self.release.1),
            },
            ChildHandshake {
                ready: Some(self.ready.1),
                release: Some(self.release.0),
            },
        )
    }
}

/// The orchestrator's side
#[derive(Debug)]
pub struct ParentHandshake {
    ready: Option<RawFd>,
    release: Option<RawFd>,
}

impl ParentHandshake {
    /// Block until the child reports its setup is done
    ///
    /// `pid` is only used to describe a child that exits first.
    pub fn wait_ready(&mut self, pid: Pid) -> Result<(), Error> {
        let fd = self.ready.ok_or(Error::InvalidState {
            operation: "waiting for readiness",
            state: "the ready pipe is closed".to_string(),
        })?;
        match read_byte(fd)? {
            Some(READY) => Ok(()),
            _ => {
                close_fd(&mut self.ready);
                Err(Error::Handshake(pid))
            }
        }
    }

    /// Close the release pipe, letting the child continue
    pub fn release(&mut self) -> Result<(), Error> {
        match self.release.take() {
            Some(fd) => Ok(close(fd)?),
            None => Err(Error::InvalidState {
                operation: "releasing the child",
                state: "it was already released".to_string(),
            }),
        }
    }

    /// Let the child past [ChildHandshake::wait_proceed] without releasing it
    pub fn proceed(&mut self) -> Result<(), Error> {
        match self.release {
            Some(fd) => write_byte(fd, PROCEED),
            None => Err(Error::InvalidState {
                operation: "signalling the child",
                state: "it was already released".to_string(),
            }),
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// After release, block until the child execs or exits
    ///
    /// Returns false if the child reported a failure before getting that far.
    pub fn wait_started(&mut self) -> Result<bool, Error> {
        let fd = match self.ready {
            Some(fd) => fd,
            None => return Ok(false),
        };
        let result = read_byte(fd);
        close_fd(&mut self.ready);
        Ok(result? != Some(FAILED))
    }
}

impl Drop for ParentHandshake {
    fn drop(&mut self) {
        close_fd(&mut self.ready);
        close_fd(&mut self.release);
    }
}

/// The isolated child's side
#[derive(Debug)]
pub struct ChildHandshake {
    ready: Option<RawFd>,
    release: Option<RawFd>,
}

impl ChildHandshake {
    /// Descriptors that must survive when the child closes everything else
    pub fn fds(&self) -> Vec<RawFd> {
        self.ready.iter().chain(self.release.iter()).cloned().collect()
    }

    /// Tell the orchestrator that setup is done
    pub fn ready(&mut self) -> Result<(), Error> {
        match self.ready {
            Some(fd) => write_byte(fd, READY),
            None => Ok(()),
        }
    }

    /// Block until the orchestrator calls [ParentHandshake::proceed]
    pub fn wait_proceed(&mut self) -> Result<(), Error> {
        let fd = self.release.ok_or(Error::InvalidState {
            operation: "waiting to proceed",
            state: "the release pipe is closed".to_string(),
        })?;
        match read_byte(fd)? {
            Some(PROCEED) => Ok(()),
            _ => Err(Error::InvalidState {
                operation: "waiting to proceed",
                state: "the orchestrator went away".to_string(),
            }),
        }
    }

    /// Block until the orchestrator releases us
    pub fn wait_release(&mut self) -> Result<(), Error> {
        if let Some(fd) = self.release {
            while read_byte(fd)?.is_some() {}
        }
        close_fd(&mut self.release);
        Ok(())
    }

    /// Report a failure to the orchestrator before exiting
    pub fn fail(&mut self) {
        if let Some(fd) = self.ready {
            let _ = write_byte(fd, FAILED);
        }
        close_fd(&mut self.ready);
    }
}

impl Drop for ChildHandshake {
    fn drop(&mut self) {
        close_fd(&mut self.ready);
        close_fd(&mut self.release);
    }
}
