//! Device access control through the cgroup v1 devices controller

use crate::{
    errors::Error,
    resource::{close_on_drop, Resource, ResourceState},
};
use nix::unistd::Pid;
use std::{
    fmt, fs,
    fs::OpenOptions,
    io,
    io::Write,
    path::{Path, PathBuf},
};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/devices/corral";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceKind {
    Block,
    Char,
    All,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Block => "b",
            DeviceKind::Char => "c",
            DeviceKind::All => "a",
        })
    }
}

/// One line for `devices.allow` or `devices.deny`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceRule {
    pub kind: DeviceKind,
    pub major: Option<u64>,
    pub minor: Option<u64>,
    pub access: String,
}

impl DeviceRule {
    pub fn new<S: Into<String>>(kind: DeviceKind, major: Option<u64>, minor: Option<u64>, access: S) -> Self {
        DeviceRule {
            kind,
            major,
            minor,
            access: access.into(),
        }
    }

    /// Every device of one kind
    pub fn any(kind: DeviceKind, access: &str) -> Self {
        DeviceRule::new(kind, None, None, access)
    }
}

impl fmt::Display for DeviceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn number(n: Option<u64>) -> String {
            n.map(|n| n.to_string()).unwrap_or_else(|| "*".to_string())
        }
        write!(
            f,
            "{} {}:{} {}",
            self.kind,
            number(self.major),
            number(self.minor),
            self.access
        )
    }
}

/// Per-process groups under one devices controller hierarchy
#[derive(Clone, Debug)]
pub struct DeviceCgroup {
    root: PathBuf,
}

impl DeviceCgroup {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        DeviceCgroup {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn group_path(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Make a group named after `pid` and move the process into it
    pub fn create(&self, pid: Pid) -> Result<(), Error> {
        if !self.root.join("devices.list").exists() {
            return Err(Error::InvalidConfig(format!(
                "{:?} is not mounted or is not a devices cgroup",
                self.root
            )));
        }
        let group = self.group_path(pid);
        match fs::create_dir(&group) {
            Err(err) if err.kind() != io::ErrorKind::AlreadyExists => return Err(err.into()),
            _ => {}
        }
        self.write(pid, "tasks", &pid.to_string())
    }

    /// Take away access to every device
    pub fn deny_all(&self, pid: Pid) -> Result<(), Error> {
        self.write(pid, "devices.deny", &DeviceRule::any(DeviceKind::All, "rwm").to_string())
    }

    pub fn allow(&self, pid: Pid, rule: &DeviceRule) -> Result<(), Error> {
        log::debug!("allowing {} for pid {}", rule, pid);
        self.write(pid, "devices.allow", &rule.to_string())
    }

    /// Remove the group once its processes are gone
    pub fn cleanup(&self, pid: Pid) -> Result<(), Error> {
        match fs::remove_dir(self.group_path(pid)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn write(&self, pid: Pid, control: &str, contents: &str) -> Result<(), Error> {
        let path = self.group_path(pid).join(control);
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

/// A process's group, removed on close once the process is gone
#[derive(Debug)]
pub struct DeviceGroup {
    cgroup: DeviceCgroup,
    pid: Pid,
    state: ResourceState,
}

impl DeviceGroup {
    /// Create the group for `pid` and restrict it to exactly `rules`
    pub fn restrict(cgroup: &DeviceCgroup, pid: Pid, rules: &[DeviceRule]) -> Result<DeviceGroup, Error> {
        cgroup.create(pid)?;
        let group = DeviceGroup {
            cgroup: cgroup.clone(),
            pid,
            state: ResourceState::Open,
        };
        cgroup.deny_all(pid)?;
        for rule in rules {
            cgroup.allow(pid, rule)?;
        }
        Ok(group)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl Resource for DeviceGroup {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state.begin_close() {
            self.cgroup.cleanup(self.pid)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.state.release()
    }
}

impl Drop for DeviceGroup {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}
