//! A private device filesystem for one worker

use crate::{
    cgroup::{DeviceKind, DeviceRule},
    errors::Error,
    loopdev::{self, LoopAllocation, LoopPool, LOOP_MAJOR},
    mount::Mount,
    resource::{close_on_drop, Resource, ResourceStack, ResourceState},
};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

/// Character devices every worker gets
const FIXED_NODES: [(&str, u64, u64); 4] = [
    ("null", 1, 3),
    ("zero", 1, 5),
    ("random", 1, 8),
    ("urandom", 1, 9),
];

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceNode {
    pub name: String,
    pub kind: DeviceKind,
    pub major: u64,
    pub minor: u64,
}

/// A tmpfs holding only the device nodes a worker may use
///
/// Closing it detaches any loop devices left attached, unmounts it, and
/// frees its loop minors.
#[derive(Debug)]
pub struct DevFs {
    path: PathBuf,
    nodes: Vec<DeviceNode>,
    loop_devices: Vec<PathBuf>,
    detach_rounds: u32,
    resources: ResourceStack,
    state: ResourceState,
}

impl DevFs {
    /// Mount a new device filesystem under `parent`, with loop devices from
    /// `pool` if one is given
    pub fn start(parent: &Path, pool: Option<&LoopPool>, unmount_retries: u32) -> Result<DevFs, Error> {
        let mut resources = ResourceStack::new();
        let allocation = match pool {
            Some(pool) => Some(pool.acquire()?),
            None => None,
        };
        let minors = allocation.as_ref().map(LoopAllocation::minors);
        if let Some(allocation) = allocation {
            resources.push(allocation);
        }

        let mount = Mount::auto("tmpfs", "tmpfs", Some("mode=0755"), parent, "devfs-")?
            .unmount_retries(unmount_retries);
        let path = mount.target().to_path_buf();
        resources.push(mount);

        let mut devfs = DevFs {
            path,
            nodes: Vec::new(),
            loop_devices: Vec::new(),
            detach_rounds: pool.map(LoopPool::chunk).unwrap_or(1),
            resources,
            state: ResourceState::Open,
        };
        for (name, major, minor) in FIXED_NODES.iter() {
            devfs.mknod(name, DeviceKind::Char, *major, *minor)?;
        }
        if let Some(minors) = minors {
            for (index, minor) in minors.enumerate() {
                let name = format!("loop{}", index);
                devfs.mknod(&name, DeviceKind::Block, LOOP_MAJOR, minor as u64)?;
                devfs.loop_devices.push(devfs.path.join(name));
            }
        }
        Ok(devfs)
    }

    /// How many passes to make detaching loop devices on close
    pub fn detach_rounds(mut self, rounds: u32) -> Self {
        self.detach_rounds = rounds;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn nodes(&self) -> &[DeviceNode] {
        &self.nodes
    }

    /// Loop device nodes, as seen from the host
    pub fn loop_devices(&self) -> &[PathBuf] {
        &self.loop_devices
    }

    /// Device cgroup rules granting access to exactly these nodes
    pub fn device_rules(&self) -> Vec<DeviceRule> {
        self.nodes
            .iter()
            .map(|node| DeviceRule::new(node.kind, Some(node.major), Some(node.minor), "rwm"))
            .collect()
    }

    fn mknod(&mut self, name: &str, kind: DeviceKind, major: u64, minor: u64) -> Result<(), Error> {
        let (sflag, perm) = match kind {
            DeviceKind::Block => (SFlag::S_IFBLK, 0o660),
            _ => (SFlag::S_IFCHR, 0o666),
        };
        let path = self.path.join(name);
        mknod(
            path.as_path(),
            sflag,
            Mode::from_bits_truncate(perm),
            makedev(major, minor),
        )?;
        // mknod is subject to the umask
        fs::set_permissions(&path, fs::Permissions::from_mode(perm))?;
        self.nodes.push(DeviceNode {
            name: name.to_string(),
            kind,
            major,
            minor,
        });
        Ok(())
    }
}

impl Resource for DevFs {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state.begin_close() {
            if !self.loop_devices.is_empty() {
                loopdev::detach_all(&self.loop_devices, self.detach_rounds);
            }
            self.resources.close()?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.resources.release();
        self.state.release()
    }
}

impl Drop for DevFs {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}
