//! Logical volumes for worker scratch space

use crate::{
    command,
    errors::Error,
    loopdev,
    mount::{Mount, MountSpec},
    resource::{close_on_drop, Resource, ResourceStack, ResourceState},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

/// Filesystems a volume can be formatted with
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Xfs,
    Ext4,
    Ext3,
    Ext2,
}

impl FsType {
    pub fn name(&self) -> &'static str {
        match self {
            FsType::Xfs => "xfs",
            FsType::Ext4 => "ext4",
            FsType::Ext3 => "ext3",
            FsType::Ext2 => "ext2",
        }
    }

    /// Arguments for `mkfs.<type>`, before the device path
    pub fn mkfs_args(&self) -> &'static [&'static str] {
        match self {
            FsType::Xfs => &["-f", "-q"],
            FsType::Ext4 | FsType::Ext3 | FsType::Ext2 => &["-F", "-q", "-O", "sparse_super"],
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FsType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "xfs" => Ok(FsType::Xfs),
            "ext4" => Ok(FsType::Ext4),
            "ext3" => Ok(FsType::Ext3),
            "ext2" => Ok(FsType::Ext2),
            other => Err(Error::InvalidConfig(format!("unsupported filesystem {:?}", other))),
        }
    }
}

/// Extent accounting for a storage pool
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolExtents {
    /// bytes per extent
    pub extent_size: u64,
    /// extents not yet allocated
    pub free: u64,
}

impl PoolExtents {
    /// Whole extents needed to hold `bytes`
    pub fn required_for(&self, bytes: u64) -> u64 {
        bytes / self.extent_size + (bytes % self.extent_size != 0) as u64
    }
}

/// A shared pool that volumes are carved from
pub trait StoragePool: Send + Sync {
    fn name(&self) -> &str;

    fn extents(&self) -> Result<PoolExtents, Error>;

    /// Create a volume of `extents` extents, returning its device path
    fn create(&self, name: &str, extents: u64) -> Result<PathBuf, Error>;

    /// Remove a volume. Returns false if it did not exist.
    fn remove(&self, name: &str) -> Result<bool, Error>;

    fn format(&self, device: &Path, fstype: FsType) -> Result<(), Error>;
}

/// An LVM volume group
#[derive(Clone, Debug)]
pub struct LvmPool {
    volume_group: String,
}

impl LvmPool {
    pub fn new<S: Into<String>>(volume_group: S) -> Self {
        LvmPool {
            volume_group: volume_group.into(),
        }
    }

    fn device_path(&self, name: &str) -> PathBuf {
        Path::new("/dev").join(&self.volume_group).join(name)
    }
}

/// Parse `vgs --noheadings --units b --nosuffix -o vg_extent_size,vg_free_count`
fn parse_vgs(pool: &str, output: &str) -> Result<PoolExtents, Error> {
    let bad_output = || Error::PoolQuery {
        pool: pool.to_string(),
        output: output.to_string(),
    };
    let mut fields = output.split_whitespace();
    let extent_size = fields
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(bad_output)? as u64;
    let free = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(bad_output)?;
    if extent_size == 0 {
        return Err(bad_output());
    }
    Ok(PoolExtents { extent_size, free })
}

impl StoragePool for LvmPool {
    fn name(&self) -> &str {
        &self.volume_group
    }

    fn extents(&self) -> Result<PoolExtents, Error> {
        let output = command::quiet(
            "lvm",
            &[
                "vgs",
                "--noheadings",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "vg_extent_size,vg_free_count",
                &self.volume_group,
            ],
        )?;
        parse_vgs(&self.volume_group, &output)
    }

    fn create(&self, name: &str, extents: u64) -> Result<PathBuf, Error> {
        command::run(
            "lvm",
            &[
                "lvcreate",
                "--yes",
                "-l",
                &extents.to_string(),
                "-n",
                name,
                &self.volume_group,
            ],
        )?;
        Ok(self.device_path(name))
    }

    fn remove(&self, name: &str) -> Result<bool, Error> {
        let device = self.device_path(name);
        if !device.exists() {
            return Ok(false);
        }
        match command::run("lvm", &["lvremove", "-f", &format!("{}/{}", self.volume_group, name)]) {
            Ok(_) => Ok(true),
            Err(_) if !device.exists() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn format(&self, device: &Path, fstype: FsType) -> Result<(), Error> {
        let mut args: Vec<String> = fstype.mkfs_args().iter().map(|s| s.to_string()).collect();
        args.push(device.to_string_lossy().into_owned());
        command::run(&format!("mkfs.{}", fstype), &args)?;
        Ok(())
    }
}

/// Hands out formatted volumes from a pool
#[derive(Clone)]
pub struct VolumeAllocator {
    pool: Arc<dyn StoragePool>,
}

impl fmt::Debug for VolumeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VolumeAllocator")
            .field("pool", &self.pool.name())
            .finish()
    }
}

impl VolumeAllocator {
    pub fn new(pool: Arc<dyn StoragePool>) -> Self {
        VolumeAllocator { pool }
    }

    /// Create and format a volume of at least `size` bytes
    ///
    /// Fails with [Error::OutOfSpace] if the pool has too few free extents.
    pub fn allocate(&self, name: &str, size: u64, fstype: FsType) -> Result<Volume, Error> {
        let extents = self.pool.extents()?;
        let required = extents.required_for(size);
        if required > extents.free {
            return Err(Error::OutOfSpace {
                required,
                available: extents.free,
            });
        }
        log::info!(
            "allocating {} extents for volume {} in pool {}",
            required,
            name,
            self.pool.name()
        );
        let device = self.pool.create(name, required)?;
        let volume = Volume {
            pool: self.pool.clone(),
            name: name.to_string(),
            device,
            size: required.saturating_mul(extents.extent_size),
            extents: required,
            fstype,
            state: ResourceState::Open,
        };
        self.pool.format(&volume.device, fstype)?;
        Ok(volume)
    }
}

/// A logical volume, removed on close
pub struct Volume {
    pool: Arc<dyn StoragePool>,
    name: String,
    device: PathBuf,
    size: u64,
    extents: u64,
    fstype: FsType,
    state: ResourceState,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Volume")
            .field("pool", &self.pool.name())
            .field("name", &self.name)
            .field("device", &self.device)
            .field("extents", &self.extents)
            .field("fstype", &self.fstype)
            .finish()
    }
}

impl Volume {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Allocated size in bytes, a whole number of extents
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn extents(&self) -> u64 {
        self.extents
    }

    pub fn fstype(&self) -> FsType {
        self.fstype
    }

    /// Remove the volume, treating one that's already gone as removed
    pub fn free(&mut self) -> Result<(), Error> {
        if let Ok(devices) = loopdev::backed_by(&self.device) {
            for device in devices {
                log::warn!("loop device {:?} references volume {}, detaching", device, self.name);
                if let Err(err) = loopdev::detach(&device) {
                    log::error!("error detaching {:?}, {}", device, err);
                }
            }
        }
        if !self.pool.remove(&self.name)? {
            log::debug!("volume {} was already removed", self.name);
        }
        Ok(())
    }
}

impl Resource for Volume {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state.begin_close() {
            self.free()?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.state.release()
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}

/// A freshly formatted volume mounted at a private directory
#[derive(Debug)]
pub struct ScratchDisk {
    device: PathBuf,
    mount_point: PathBuf,
    unmount_retries: u32,
    resources: ResourceStack,
}

impl ScratchDisk {
    pub fn start(
        allocator: &VolumeAllocator,
        name: &str,
        size: u64,
        fstype: FsType,
        mount_parent: &Path,
        unmount_retries: u32,
    ) -> Result<ScratchDisk, Error> {
        let mut resources = ResourceStack::new();
        let volume = allocator.allocate(name, size, fstype)?;
        let device = volume.device().to_path_buf();
        resources.push(volume);
        let mount = Mount::auto(
            &device.to_string_lossy(),
            fstype.name(),
            None,
            mount_parent,
            "scratch-",
        )?
        .unmount_retries(unmount_retries);
        let mount_point = mount.target().to_path_buf();
        resources.push(mount);
        Ok(ScratchDisk {
            device,
            mount_point,
            unmount_retries,
            resources,
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Bind the scratch volume at `target` in a container
    pub fn mount_spec<P: AsRef<Path>>(&self, target: P) -> MountSpec {
        MountSpec::new(&self.mount_point, target, false)
    }

    /// Bind the scratch volume at a host path, unmounted when this disk closes
    pub fn bind_into(&mut self, target: &Path, read_only: bool) -> Result<(), Error> {
        let bound = Mount::bind(&self.mount_point, target, read_only)?
            .unmount_retries(self.unmount_retries);
        self.resources.push(bound);
        Ok(())
    }
}

impl Resource for ScratchDisk {
    fn state(&self) -> ResourceState {
        self.resources.state()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.resources.close()
    }

    fn release(&mut self) {
        self.resources.release()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vgs_output() {
        let extents = parse_vgs("vg00", "  4194304 2560\n").unwrap();
        assert_eq!(
            extents,
            PoolExtents {
                extent_size: 4194304,
                free: 2560
            }
        );
        assert!(parse_vgs("vg00", "").is_err());
        assert!(parse_vgs("vg00", "  0 10\n").is_err());
    }

    #[test]
    fn round_up_to_extents() {
        let extents = PoolExtents {
            extent_size: 4096,
            free: 10,
        };
        assert_eq!(extents.required_for(1), 1);
        assert_eq!(extents.required_for(4096), 1);
        assert_eq!(extents.required_for(4097), 2);
        assert_eq!(extents.required_for(0), 0);
        assert_eq!(extents.required_for(u64::MAX), (u64::MAX >> 12) + 1);
    }

    #[test]
    fn mkfs_options() {
        assert_eq!(FsType::Xfs.mkfs_args(), &["-f", "-q"]);
        assert!(FsType::Ext4.mkfs_args().contains(&"sparse_super"));
        assert_eq!("ext3".parse::<FsType>().unwrap(), FsType::Ext3);
        assert!("btrfs".parse::<FsType>().is_err());
    }
}
