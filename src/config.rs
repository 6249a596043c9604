//! Host configuration shared by every worker

use crate::{
    cache::{ArchiveMode, CacheKey},
    cgroup::DEFAULT_CGROUP_ROOT,
    errors::Error,
    lock::DEFAULT_LOCK_TIMEOUT,
    loopdev::{LoopPool, DEFAULT_CHUNK, DEFAULT_RANGE},
    mount::DEFAULT_UNMOUNT_RETRIES,
    network::{Address, AddressGenerator},
    volume::FsType,
};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_BASE_DIR: &str = "/srv/corral";
const DEFAULT_VOLUME_GROUP: &str = "corral";
const DEFAULT_MIN_SCRATCH_MIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Settings for a worker host
///
/// Every field has a default, so a JSON file only needs the values it
/// changes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// holds the root cache, lock files, and per-worker scratch directories
    pub base_dir: PathBuf,
    pub volume_group: String,
    pub scratch_fstype: FsType,
    pub min_scratch_mib: u64,
    /// private prefix for worker links; a random /48 if unset
    pub subnet: Option<Address>,
    pub loop_start: u32,
    pub loop_end: u32,
    pub loop_chunk: u32,
    pub lock_timeout_ms: u64,
    pub archive_mode: ArchiveMode,
    pub unmount_retries: u32,
    /// passes made detaching loop devices; the chunk size if unset
    pub loop_detach_retries: Option<u32>,
    /// devices cgroup for workers; device access is left alone if unset
    pub cgroup_root: Option<PathBuf>,
    /// shared read-only template cache bound into every worker
    pub template_cache_dir: Option<PathBuf>,
    /// command run inside each worker
    pub payload: Vec<String>,
    /// binds each worker's scratch volume on the host and keeps payload stdio
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_dir: Config::default_base_dir(),
            volume_group: DEFAULT_VOLUME_GROUP.to_string(),
            scratch_fstype: FsType::Xfs,
            min_scratch_mib: DEFAULT_MIN_SCRATCH_MIB,
            subnet: None,
            loop_start: DEFAULT_RANGE.start,
            loop_end: DEFAULT_RANGE.end,
            loop_chunk: DEFAULT_CHUNK,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            archive_mode: ArchiveMode::default(),
            unmount_retries: DEFAULT_UNMOUNT_RETRIES,
            loop_detach_retries: None,
            cgroup_root: Some(PathBuf::from(DEFAULT_CGROUP_ROOT)),
            template_cache_dir: None,
            payload: Vec::new(),
            debug: false,
        }
    }
}

impl Config {
    /// Start from the defaults
    pub fn new() -> Self {
        Default::default()
    }

    /// `$CORRAL_BASE`, or `/srv/corral`
    pub fn default_base_dir() -> PathBuf {
        match env::var("CORRAL_BASE") {
            Ok(s) if !s.is_empty() => PathBuf::from(s),
            _ => PathBuf::from(DEFAULT_BASE_DIR),
        }
    }

    /// Read a JSON file, filling in defaults for anything it leaves out
    pub fn load(path: &Path) -> Result<Config, Error> {
        let config: Config = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.loop_pool()?;
        if let Some(subnet) = self.subnet {
            AddressGenerator::new(subnet)?;
        }
        if self.volume_group.is_empty() {
            return Err(Error::InvalidConfig("volume group name is empty".to_string()));
        }
        Ok(())
    }

    pub fn base_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.base_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn volume_group<S: Into<String>>(mut self, name: S) -> Self {
        self.volume_group = name.into();
        self
    }

    pub fn subnet(mut self, subnet: Address) -> Self {
        self.subnet = Some(subnet);
        self
    }

    pub fn loop_range(mut self, start: u32, end: u32, chunk: u32) -> Self {
        self.loop_start = start;
        self.loop_end = end;
        self.loop_chunk = chunk;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn archive_mode(mut self, mode: ArchiveMode) -> Self {
        self.archive_mode = mode;
        self
    }

    pub fn cgroup_root<P: AsRef<Path>>(mut self, root: Option<P>) -> Self {
        self.cgroup_root = root.map(|root| root.as_ref().to_path_buf());
        self
    }

    pub fn template_cache_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.template_cache_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn payload<I: IntoIterator<Item = S>, S: Into<String>>(mut self, argv: I) -> Self {
        self.payload = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn lock_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn min_scratch_bytes(&self) -> u64 {
        self.min_scratch_mib.saturating_mul(MIB)
    }

    /// Per-worker temporary directories and mount points
    pub fn scratch_dir(&self) -> PathBuf {
        CacheKey::Scratch.to_path(&self.base_dir)
    }

    /// Host path where debug mode exposes a worker's scratch volume
    pub fn debug_scratch_path(&self, id: &str) -> PathBuf {
        env::temp_dir().join(format!("corral-{}-scratch", id))
    }

    /// Lock files claiming chunks of loop device minors
    pub fn loop_lock_dir(&self) -> PathBuf {
        self.base_dir.join("loop")
    }

    pub fn loop_pool(&self) -> Result<LoopPool, Error> {
        LoopPool::new(
            self.loop_lock_dir(),
            self.loop_start,
            self.loop_end,
            self.loop_chunk,
        )
    }

    pub fn detach_rounds(&self) -> u32 {
        self.loop_detach_retries.unwrap_or(self.loop_chunk)
    }

    pub fn address_generator(&self) -> Result<AddressGenerator, Error> {
        AddressGenerator::new(match self.subnet {
            Some(subnet) => subnet,
            None => AddressGenerator::random_subnet(),
        })
    }
}
