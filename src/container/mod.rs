//! Namespace-isolated worker processes
//!
//! A container starts as a clone of this process in fresh mount, UTS, IPC,
//! and PID namespaces (plus network and user namespaces when asked). The
//! child assembles its mounts, reports that it's ready, and then waits while
//! the orchestrator configures things only the host can change, such as
//! device access and moving a network link into the child's namespace.
//! [Container::release()] lets the child chroot and exec its payload.

mod builder;
mod child;

pub use builder::{ContainerBuilder, JobFile, DEFAULT_HOSTNAME};

use crate::{
    errors::Error,
    handshake::ParentHandshake,
    mount::MountSpec,
    resource::{close_on_drop, Resource, ResourceState},
    subprocess::{ExitStatus, Subprocess, DEFAULT_KILL_TIMEOUT},
};
use nix::{sys::signal::Signal, unistd::Pid};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

/// Where a container is in its lifecycle
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContainerState {
    /// resources allocated, no process yet
    Created,
    /// child exists and has finished its own setup
    Cloned,
    /// host-side configuration is done and the child was let go
    Released,
    /// payload has been exec'd
    Running,
    Exited,
    Killed,
}

impl ContainerState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ContainerState::Exited | ContainerState::Killed)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A running container
///
/// Roughly analogous to [std::process::Child], for a namespace-isolated
/// worker. Closing it kills whatever is left of the process.
#[derive(Debug)]
pub struct Container {
    id: String,
    root: PathBuf,
    mounts: Vec<MountSpec>,
    process: Subprocess,
    handshake: ParentHandshake,
    lifecycle: ContainerState,
    state: ResourceState,
}

impl Container {
    /// Start building a container whose filesystem is assembled at `root`
    pub fn new<S: Into<String>, P: AsRef<Path>>(id: S, root: P) -> ContainerBuilder {
        ContainerBuilder::new(id.into(), root.as_ref().to_path_buf())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Process id of the container's init, as seen from the host
    pub fn pid(&self) -> Pid {
        self.process.pid()
    }

    pub fn lifecycle(&self) -> ContainerState {
        self.lifecycle
    }

    /// Let the child continue to its payload
    ///
    /// Call this exactly once, after all host-side configuration is applied.
    /// Returns after the payload has been exec'd, or after the child gave up
    /// trying.
    pub fn release(&mut self) -> Result<(), Error> {
        if self.lifecycle != ContainerState::Cloned {
            return Err(Error::InvalidState {
                operation: "release",
                state: self.lifecycle.to_string(),
            });
        }
        self.handshake.release()?;
        self.lifecycle = ContainerState::Released;
        if self.handshake.wait_started()? {
            self.lifecycle = ContainerState::Running;
        } else {
            let status = self.process.wait()?;
            log::warn!("container {} failed before exec, {}", self.id, status);
            self.lifecycle = ContainerState::Exited;
        }
        Ok(())
    }

    /// Poll without blocking. Returns None while the container is running.
    pub fn check(&mut self) -> Result<Option<ExitStatus>, Error> {
        let status = self.process.check()?;
        if status.is_some() {
            self.exited();
        }
        Ok(status)
    }

    /// Block until the container exits
    pub fn wait(&mut self) -> Result<ExitStatus, Error> {
        let status = self.process.wait()?;
        self.exited();
        Ok(status)
    }

    /// Signal the container, escalating to SIGKILL after `timeout`
    ///
    /// The container's init ignores signals it has no handler for unless
    /// they are SIGKILL, so most payloads only stop on the escalation.
    pub fn kill(&mut self, signal: Signal, timeout: Duration) -> Result<ExitStatus, Error> {
        let already = self.process.check()?;
        let status = self.process.kill(signal, timeout)?;
        match already {
            Some(_) => self.exited(),
            None => self.lifecycle = ContainerState::Killed,
        }
        Ok(status)
    }

    fn exited(&mut self) {
        if !self.lifecycle.is_finished() {
            self.lifecycle = ContainerState::Exited;
        }
    }
}

impl Resource for Container {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state.begin_close() {
            if !self.lifecycle.is_finished() {
                self.kill(Signal::SIGKILL, DEFAULT_KILL_TIMEOUT)?;
            }
            self.process.release();
        }
        Ok(())
    }

    fn release(&mut self) {
        self.process.release();
        self.state.release()
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}
