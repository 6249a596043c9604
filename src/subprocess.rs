//! Forked child processes with graceful stop and exit status translation

use crate::{
    abort,
    errors::Error,
    resource::{close_on_drop, Resource, ResourceState},
};
use nix::{
    errno::Errno,
    sys::{
        signal::kill,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::{close, dup2, fork, setsid, ForkResult, Pid},
};
use std::{
    fmt, fs,
    os::unix::io::RawFd,
    panic::{catch_unwind, AssertUnwindSafe},
    thread,
    time::{Duration, Instant},
};

pub use nix::sys::signal::Signal;

/// Exit code for a child whose body failed or panicked
pub const UNHANDLED_FAILURE: i32 = 70;

/// How long [Subprocess::close] waits after SIGTERM before escalating
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Status of an exited child process
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    /// exited normally with a code
    Exited(i32),
    /// terminated by a signal
    Signaled(Signal),
    /// no longer waitable, most likely reaped by someone else
    Vanished,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        *self == ExitStatus::Exited(0)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Flatten to a single integer, with -2 for abnormal termination and -1
    /// for a process that could not be waited for
    pub fn as_raw_code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(_) => -2,
            ExitStatus::Vanished => -1,
        }
    }

    fn from_wait_status(status: WaitStatus) -> Option<ExitStatus> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled(signal)),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(signal) => write!(f, "killed by {}", signal),
            ExitStatus::Vanished => write!(f, "process vanished"),
        }
    }
}

/// Options for starting a [Subprocess]
#[derive(Clone, Debug)]
pub struct SubprocessBuilder {
    name: String,
    setsid: bool,
    close_fds: bool,
    keep_fds: Vec<RawFd>,
    catch_signals: bool,
}

impl Default for SubprocessBuilder {
    fn default() -> Self {
        SubprocessBuilder {
            name: "subprocess".to_string(),
            setsid: false,
            close_fds: true,
            keep_fds: Vec::new(),
            catch_signals: false,
        }
    }
}

impl SubprocessBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Name used in log messages
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Start the child in its own session and process group
    pub fn setsid(mut self, setsid: bool) -> Self {
        self.setsid = setsid;
        self
    }

    /// Close inherited descriptors other than stdio and the keep set
    pub fn close_fds(mut self, close_fds: bool) -> Self {
        self.close_fds = close_fds;
        self
    }

    pub fn keep_fd(mut self, fd: RawFd) -> Self {
        self.keep_fds.push(fd);
        self
    }

    /// Turn termination signals into a stop request inside the child instead
    /// of the default action
    pub fn catch_signals(mut self, catch_signals: bool) -> Self {
        self.catch_signals = catch_signals;
        self
    }

    /// Fork, run `body` in the child, and exit with the code it returns
    ///
    /// An error or panic from the body exits with [UNHANDLED_FAILURE]. The
    /// child never returns into the caller's code.
    pub fn spawn<F>(self, body: F) -> Result<Subprocess, Error>
    where
        F: FnOnce() -> Result<i32, Error>,
    {
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                log::debug!("started {} as pid {}", self.name, child);
                Ok(Subprocess::adopt(child, self.name))
            }
            ForkResult::Child => {
                let code = self.run_child(body);
                unsafe { libc::_exit(code) }
            }
        }
    }

    fn run_child<F>(&self, body: F) -> i32
    where
        F: FnOnce() -> Result<i32, Error>,
    {
        let result = catch_unwind(AssertUnwindSafe(|| {
            if self.setsid {
                setsid()?;
            }
            if self.catch_signals {
                abort::clear();
                abort::install_handlers()?;
            } else {
                abort::reset_handlers()?;
            }
            if self.close_fds {
                close_fds_except(&self.keep_fds)?;
            }
            body()
        }));
        match result {
            Ok(Ok(code)) => code,
            Ok(Err(err)) => {
                log::error!("{} failed, {}", self.name, err);
                UNHANDLED_FAILURE
            }
            Err(_) => UNHANDLED_FAILURE,
        }
    }
}

/// Close every open descriptor except stdio and those in `keep`
pub(crate) fn close_fds_except(keep: &[RawFd]) -> Result<(), Error> {
    let fds: Vec<RawFd> = fs::read_dir("/proc/self/fd")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect();
    for fd in fds {
        if fd > 2 && !keep.contains(&fd) {
            // The directory iterator's own descriptor is already gone
            let _ = close(fd);
        }
    }
    Ok(())
}

/// Point stdin, stdout, and stderr at /dev/null
pub(crate) fn null_stdio() -> Result<(), Error> {
    let null = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
    for fd in 0..=2 {
        dup2(null, fd)?;
    }
    if null > 2 {
        close(null)?;
    }
    Ok(())
}

/// A child process owned by this one
#[derive(Debug)]
pub struct Subprocess {
    pid: Pid,
    name: String,
    status: Option<ExitStatus>,
    kill_timeout: Duration,
    state: ResourceState,
}

impl Subprocess {
    pub fn builder() -> SubprocessBuilder {
        SubprocessBuilder::new()
    }

    /// Take ownership of a child started some other way
    pub fn adopt<S: Into<String>>(pid: Pid, name: S) -> Subprocess {
        Subprocess {
            pid,
            name: name.into(),
            status: None,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            state: ResourceState::Open,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The exit status, if it has already been observed
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// How long closing this process waits after SIGTERM
    pub fn set_kill_timeout(&mut self, timeout: Duration) {
        self.kill_timeout = timeout;
    }

    /// Poll without blocking. Returns None while the child is still running.
    pub fn check(&mut self) -> Result<Option<ExitStatus>, Error> {
        if self.status.is_none() {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => self.observe(status),
                Err(Errno::ECHILD) => self.observe_vanished(),
                Err(Errno::EINTR) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(self.status)
    }

    /// Block until the child exits
    pub fn wait(&mut self) -> Result<ExitStatus, Error> {
        loop {
            if let Some(status) = self.status {
                return Ok(status);
            }
            match waitpid(self.pid, None) {
                Ok(status) => self.observe(status),
                Err(Errno::ECHILD) => self.observe_vanished(),
                Err(Errno::EINTR) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Send `signal`, then wait up to `timeout` before escalating to SIGKILL
    pub fn kill(&mut self, signal: Signal, timeout: Duration) -> Result<ExitStatus, Error> {
        if let Some(status) = self.check()? {
            return Ok(status);
        }
        log::debug!("sending {} to {} (pid {})", signal, self.name, self.pid);
        self.signal(signal)?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = self.check()? {
                return Ok(status);
            }
            thread::sleep(POLL_INTERVAL);
        }
        if signal != Signal::SIGKILL {
            log::warn!(
                "{} (pid {}) ignored {} for {:?}, killing it",
                self.name,
                self.pid,
                signal,
                timeout
            );
            self.signal(Signal::SIGKILL)?;
        }
        self.wait()
    }

    fn signal(&self, signal: Signal) -> Result<(), Error> {
        match kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn observe(&mut self, status: WaitStatus) {
        if let Some(status) = ExitStatus::from_wait_status(status) {
            log::debug!("{} (pid {}) finished, {}", self.name, self.pid, status);
            self.status = Some(status);
        }
    }

    fn observe_vanished(&mut self) {
        log::warn!("{} (pid {}) can't be waited for", self.name, self.pid);
        self.status = Some(ExitStatus::Vanished);
    }
}

impl Resource for Subprocess {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state.begin_close() {
            self.kill(Signal::SIGTERM, self.kill_timeout)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.state.release()
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}
