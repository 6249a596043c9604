//! Error types you might see while provisioning or running a worker

use std::{path::PathBuf, time::Duration};
use thiserror::Error;

/// Errors from any step of worker provisioning, operation, or teardown
#[derive(Error, Debug)]
pub enum Error {
    /// a setup step failed, and anything it created has already been torn down
    #[error("failed to acquire {what}: {source}")]
    Acquisition {
        what: String,
        #[source]
        source: Box<Error>,
    },

    /// bounded wait on a contended lock expired
    #[error("timed out after {timeout:?} waiting for lock {path:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// the volume pool has fewer free extents than the request needs
    #[error("not enough space in volume pool: {required} extents required but only {available} free")]
    OutOfSpace { required: u64, available: u64 },

    /// every loop device chunk in the configured range is already claimed
    #[error("no free loop device chunk in minor range {start}..{end}")]
    OutOfDevices { start: u32, end: u32 },

    /// archive payload digest does not match its metadata
    #[error("archive digest mismatch, expected {expected}, found {found}")]
    Integrity { expected: String, found: String },

    /// a cooperative stop was requested
    #[error("stop requested")]
    Aborted,

    /// child process exited before completing the startup handshake
    #[error("child process {0} exited before it was ready")]
    Handshake(nix::unistd::Pid),

    /// io error
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    /// system call failed
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    /// external command exited unsuccessfully
    #[error("command {command:?} failed, {status}\n{stderr}")]
    Command {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// error walking a directory tree
    #[error("directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// string contained internal nul byte
    #[error("string contained internal nul byte")]
    NulString(#[from] std::ffi::NulError),

    /// invalid package manifest entry
    #[error("invalid package manifest entry: {0:?}")]
    InvalidManifest(String),

    /// invalid network address
    #[error("invalid network address: {0:?}")]
    InvalidAddress(String),

    /// invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// operation is not valid in the resource's current state
    #[error("{operation} is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// the package installer failed
    #[error("package installer failed: {0}")]
    Installer(String),

    /// storage pool reported something we can't parse
    #[error("unexpected output from volume pool {pool:?}: {output:?}")]
    PoolQuery { pool: String, output: String },
}

impl Error {
    /// Wrap a failed setup step, leaving cooperative stops unwrapped
    pub fn acquisition<S: Into<String>>(what: S, source: Error) -> Error {
        match source {
            Error::Aborted => Error::Aborted,
            source => Error::Acquisition {
                what: what.into(),
                source: Box::new(source),
            },
        }
    }

    /// The innermost error, looking through acquisition wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Acquisition { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Capacity exhaustion; a caller may retry elsewhere
    pub fn is_capacity(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::OutOfSpace { .. } | Error::OutOfDevices { .. }
        )
    }

    /// Contention that may clear up if the caller tries again later
    pub fn is_retryable(&self) -> bool {
        matches!(self.root_cause(), Error::LockTimeout { .. }) || self.is_capacity()
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.root_cause(), Error::Aborted)
    }

    /// The raw errno, if this came from a failed system call
    pub fn errno(&self) -> Option<nix::errno::Errno> {
        match self.root_cause() {
            Error::Sys(errno) => Some(*errno),
            Error::IO(err) => err.raw_os_error().map(nix::errno::Errno::from_i32),
            _ => None,
        }
    }
}
