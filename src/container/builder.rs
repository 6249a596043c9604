use crate::{
    container::{child, Container, ContainerState},
    errors::Error,
    handshake::Handshake,
    mount::MountSpec,
    network::SlaveEndpoint,
    resource::ResourceState,
    subprocess::{Subprocess, UNHANDLED_FAILURE},
};
use nix::{
    sched::{clone, CloneFlags},
    sys::signal::Signal,
    unistd::{getgid, getuid, Pid},
};
use std::{
    ffi::{CString, NulError, OsStr},
    fs,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

const CHILD_STACK_SIZE: usize = 4 * 1024 * 1024;

pub const DEFAULT_HOSTNAME: &str = "localhost.localdomain";

/// A file written into the container before the payload starts
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobFile {
    /// path relative to the container root
    pub path: PathBuf,
    pub contents: Vec<u8>,
    pub mode: u32,
}

/// Setup for containers, starting at [Container::new()] and ending with
/// [ContainerBuilder::spawn()]
#[derive(Clone, Debug)]
pub struct ContainerBuilder {
    id: String,
    root: PathBuf,
    hostname: String,
    mounts: Vec<MountSpec>,
    files: Vec<JobFile>,
    argv: Vec<CString>,
    endpoint: Option<SlaveEndpoint>,
    user_namespace: bool,
    pseudo_filesystems: bool,
    null_stdio: bool,
    arg_error: Result<(), NulError>,
}

/// Everything the child needs, owned by the clone callback
#[derive(Debug)]
pub(crate) struct ChildPlan {
    pub root: PathBuf,
    pub hostname: String,
    pub mounts: Vec<MountSpec>,
    pub files: Vec<JobFile>,
    pub argv: Vec<CString>,
    pub endpoint: Option<SlaveEndpoint>,
    pub user_namespace: bool,
    pub pseudo_filesystems: bool,
    pub null_stdio: bool,
}

impl ContainerBuilder {
    pub(crate) fn new(id: String, root: PathBuf) -> Self {
        ContainerBuilder {
            id,
            root,
            hostname: DEFAULT_HOSTNAME.to_string(),
            mounts: Vec::new(),
            files: Vec::new(),
            argv: Vec::new(),
            endpoint: None,
            user_namespace: false,
            pseudo_filesystems: true,
            null_stdio: false,
            arg_error: Ok(()),
        }
    }

    /// Bind a host directory into the container. Mounts happen in the order
    /// they're added, so the root itself comes first.
    pub fn mount(mut self, spec: MountSpec) -> Self {
        self.mounts.push(spec);
        self
    }

    pub fn mounts<I: IntoIterator<Item = MountSpec>>(mut self, specs: I) -> Self {
        self.mounts.extend(specs);
        self
    }

    /// Write a file inside the container root once everything is mounted
    pub fn file<P: AsRef<Path>, C: Into<Vec<u8>>>(mut self, path: P, contents: C, mode: u32) -> Self {
        let path = path.as_ref();
        self.files.push(JobFile {
            path: path.strip_prefix("/").unwrap_or(path).to_path_buf(),
            contents: contents.into(),
            mode,
        });
        self
    }

    /// Append an argument to the payload's command line
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        match CString::new(arg.as_ref().as_bytes()) {
            Ok(arg) => self.argv.push(arg),
            Err(err) => self.arg_error = Err(err),
        }
        self
    }

    /// Append arguments to the payload's command line
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    pub fn hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Give the container a network namespace with this link in it
    pub fn network(mut self, endpoint: SlaveEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Also isolate user ids, mapping root inside to the caller outside
    pub fn user_namespace(mut self, user_namespace: bool) -> Self {
        self.user_namespace = user_namespace;
        self
    }

    /// Mount proc and sysfs inside the root
    pub fn pseudo_filesystems(mut self, enabled: bool) -> Self {
        self.pseudo_filesystems = enabled;
        self
    }

    /// Detach the payload's stdio, pointing it at /dev/null before exec
    pub fn null_stdio(mut self, enabled: bool) -> Self {
        self.null_stdio = enabled;
        self
    }

    fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWPID;
        if self.endpoint.is_some() {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.user_namespace {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }

    /// Clone the container's first process and wait for it to finish its
    /// internal setup
    ///
    /// The child then blocks until [Container::release()] is called.
    pub fn spawn(self) -> Result<Container, Error> {
        self.arg_error.clone()?;
        if self.argv.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "container {} has no command",
                self.id
            )));
        }
        let flags = self.clone_flags();
        let (parent, child_handshake) = Handshake::new()?.split();
        let plan = ChildPlan {
            root: self.root.clone(),
            hostname: self.hostname,
            mounts: self.mounts.clone(),
            files: self.files,
            argv: self.argv,
            endpoint: self.endpoint,
            user_namespace: self.user_namespace,
            pseudo_filesystems: self.pseudo_filesystems,
            null_stdio: self.null_stdio,
        };

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let pid = {
            let mut child_handshake = Some(child_handshake);
            let callback = Box::new(move || match child_handshake.take() {
                Some(handshake) => child::run(&plan, handshake) as isize,
                None => UNHANDLED_FAILURE as isize,
            });
            // The callback and our copy of the child's pipe ends drop here
            clone(callback, &mut stack, flags, Some(Signal::SIGCHLD as i32))?
        };
        log::info!("container {} started as pid {}", self.id, pid);

        let mut container = Container {
            process: Subprocess::adopt(pid, format!("container {}", self.id)),
            id: self.id,
            root: self.root,
            mounts: self.mounts,
            handshake: parent,
            lifecycle: ContainerState::Created,
            state: ResourceState::Open,
        };
        let what = format!("container {}", container.id);
        if self.user_namespace {
            write_id_maps(pid)
                .and_then(|_| container.handshake.proceed())
                .map_err(|err| Error::acquisition(what.clone(), err))?;
        }
        container
            .handshake
            .wait_ready(pid)
            .map_err(|err| Error::acquisition(what, err))?;
        container.lifecycle = ContainerState::Cloned;
        Ok(container)
    }
}

/// Map root in the child's user namespace to our own ids
fn write_id_maps(pid: Pid) -> Result<(), Error> {
    let proc_dir = Path::new("/proc").join(pid.to_string());
    fs::write(proc_dir.join("uid_map"), format!("0 {} 1", getuid()))?;
    fs::write(proc_dir.join("setgroups"), "deny")?;
    fs::write(proc_dir.join("gid_map"), format!("0 {} 1", getgid()))?;
    Ok(())
}
