//! One job's worker: every resource it needs, assembled around a container

use crate::{
    abort,
    cache::{CachedRoot, PrivateRoot, RootCache},
    cgroup::{DeviceCgroup, DeviceGroup, DeviceKind, DeviceRule},
    config::Config,
    container::{Container, ContainerState, JobFile},
    devfs::DevFs,
    errors::Error,
    installer::PackageInstaller,
    loopdev::LoopPool,
    manifest::{Manifest, ManifestHash},
    mount::MountSpec,
    network::{Address, AddressGenerator, NetworkPair},
    resource::{close_on_drop, Resource, ResourceStack, ResourceState, TempDir},
    subprocess::ExitStatus,
    volume::{ScratchDisk, StoragePool, VolumeAllocator},
};
use nix::{sys::signal::Signal, unistd::Pid};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Scratch subdirectories and where each one appears in the container
const SCRATCH_BINDS: [(&str, &str); 3] = [("tmp", "tmp"), ("var-tmp", "var/tmp"), ("var-lock", "var/lock")];

const TEMPLATE_CACHE_TARGET: &str = "var/cache/templates";

/// What one job needs from the host
#[derive(Clone, Debug)]
pub struct Job {
    /// short id, used to name the job's volume and network link
    pub id: String,
    pub manifest: Manifest,
    /// scratch size estimate in bytes, raised to the configured minimum
    pub scratch_size: u64,
    /// command line for the payload; the configured payload if empty
    pub command: Vec<String>,
    pub files: Vec<JobFile>,
    pub network: bool,
    /// run in a private writable copy of the root instead of the shared one
    pub build_in_place: bool,
}

impl Job {
    pub fn new<S: Into<String>>(id: S, manifest: Manifest) -> Self {
        Job {
            id: id.into(),
            manifest,
            scratch_size: 0,
            command: Vec::new(),
            files: Vec::new(),
            network: true,
            build_in_place: false,
        }
    }
}

/// Shared state for starting workers on one host
#[derive(Debug)]
pub struct Provisioner {
    config: Config,
    cache: RootCache,
    volumes: VolumeAllocator,
    loops: LoopPool,
    addresses: AddressGenerator,
    cgroup: Option<DeviceCgroup>,
}

impl Provisioner {
    pub fn new(
        config: Config,
        installer: Arc<dyn PackageInstaller>,
        pool: Arc<dyn StoragePool>,
    ) -> Result<Provisioner, Error> {
        config.validate()?;
        fs::create_dir_all(config.scratch_dir())?;
        let cache = RootCache::new(&config.base_dir, installer)
            .archive_mode(config.archive_mode)
            .lock_timeout(config.lock_timeout_duration());
        Ok(Provisioner {
            volumes: VolumeAllocator::new(pool),
            loops: config.loop_pool()?,
            addresses: config.address_generator()?,
            cgroup: config.cgroup_root.as_ref().map(DeviceCgroup::new),
            cache,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &RootCache {
        &self.cache
    }

    /// Acquire everything `job` needs and start its payload
    ///
    /// On failure anything acquired so far is torn down again before the
    /// error is returned.
    pub fn start(&self, job: &Job) -> Result<Worker, Error> {
        log::info!("starting worker {}", job.id);
        let scratch_dir = self.config.scratch_dir();
        let mut resources = ResourceStack::new();

        let size = job.scratch_size.max(self.config.min_scratch_bytes());
        let mut scratch = ScratchDisk::start(
            &self.volumes,
            &format!("scratch_{}", job.id),
            size,
            self.config.scratch_fstype,
            &scratch_dir,
            self.config.unmount_retries,
        )
        .map_err(|err| Error::acquisition("scratch volume", err))?;
        if self.config.debug {
            let host = self.config.debug_scratch_path(&job.id);
            fs::create_dir_all(&host)?;
            scratch
                .bind_into(&host, false)
                .map_err(|err| Error::acquisition("debug scratch binding", err))?;
            log::info!("worker {} scratch is visible at {:?}", job.id, host);
        }
        let mut mounts = Vec::new();
        for (dir, target) in SCRATCH_BINDS.iter() {
            let source = scratch.mount_point().join(dir);
            fs::create_dir_all(&source)?;
            fs::set_permissions(&source, fs::Permissions::from_mode(0o1777))?;
            mounts.push(MountSpec::new(source, target, false));
        }
        let scratch_mount = scratch.mount_point().to_path_buf();
        resources.push(scratch);
        abort::check()?;

        let devfs = DevFs::start(&scratch_dir, Some(&self.loops), self.config.unmount_retries)
            .map_err(|err| Error::acquisition("device filesystem", err))?
            .detach_rounds(self.config.detach_rounds());
        let mut device_rules = vec![
            DeviceRule::any(DeviceKind::Char, "m"),
            DeviceRule::any(DeviceKind::Block, "m"),
        ];
        device_rules.extend(devfs.device_rules());
        mounts.insert(0, MountSpec::new(devfs.path(), "dev", false));
        resources.push(devfs);
        abort::check()?;

        let network = if job.network {
            let pair = NetworkPair::create(&self.addresses, &job.id)
                .map_err(|err| Error::acquisition("network link", err))?;
            let info = (pair.endpoint(), pair.master_address());
            resources.push(pair);
            Some(info)
        } else {
            None
        };
        abort::check()?;

        let (root_hash, root_path, read_only) = if job.build_in_place {
            let root: PrivateRoot = self
                .cache
                .checkout(&job.manifest)
                .map_err(|err| Error::acquisition("private root", err))?;
            let info = (root.hash().clone(), root.path().to_path_buf(), false);
            resources.push(root);
            info
        } else {
            let root: CachedRoot = self
                .cache
                .get_root(&job.manifest)
                .map_err(|err| Error::acquisition("cached root", err))?;
            let info = (root.hash().clone(), root.path().to_path_buf(), true);
            resources.push(root);
            info
        };
        mounts.insert(0, MountSpec::new(&root_path, "/", read_only));
        if let Some(dir) = &self.config.template_cache_dir {
            mounts.push(MountSpec::new(dir, TEMPLATE_CACHE_TARGET, true));
        }

        let mount_point = TempDir::new(&scratch_dir, "container-")?;
        let container_root = mount_point.path().to_path_buf();
        resources.push(mount_point);
        abort::check()?;

        let command = if job.command.is_empty() {
            &self.config.payload
        } else {
            &job.command
        };
        let mut builder = Container::new(job.id.clone(), &container_root)
            .mounts(mounts)
            .args(command)
            .null_stdio(!self.config.debug);
        for file in &job.files {
            builder = builder.file(&file.path, file.contents.clone(), file.mode);
        }
        if let Some((endpoint, _)) = &network {
            builder = builder.network(endpoint.clone());
        }
        let container = builder.spawn()?;

        let mut worker = Worker {
            id: job.id.clone(),
            root_hash,
            scratch_mount,
            master_address: network.as_ref().map(|(_, master)| *master),
            container,
            device_group: None,
            resources,
            state: ResourceState::Open,
        };
        if let Some(cgroup) = &self.cgroup {
            worker.device_group = Some(DeviceGroup::restrict(cgroup, worker.pid(), &device_rules)?);
        }
        if let Some((endpoint, _)) = &network {
            endpoint.move_to_namespace(worker.pid())?;
        }
        worker.container.release()?;
        log::info!("worker {} is {}", worker.id, worker.container.lifecycle());
        Ok(worker)
    }
}

/// A running job and everything it holds
///
/// Closing it kills the container, then releases the rest in reverse order
/// of acquisition.
#[derive(Debug)]
pub struct Worker {
    id: String,
    root_hash: ManifestHash,
    scratch_mount: PathBuf,
    master_address: Option<Address>,
    container: Container,
    device_group: Option<DeviceGroup>,
    resources: ResourceStack,
    state: ResourceState,
}

impl Worker {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Pid {
        self.container.pid()
    }

    pub fn root_hash(&self) -> &ManifestHash {
        &self.root_hash
    }

    /// Host path of the mounted scratch volume
    pub fn scratch_mount(&self) -> &Path {
        &self.scratch_mount
    }

    /// Host side address of the worker's link, if it has one
    pub fn master_address(&self) -> Option<Address> {
        self.master_address
    }

    pub fn lifecycle(&self) -> ContainerState {
        self.container.lifecycle()
    }

    pub fn check(&mut self) -> Result<Option<ExitStatus>, Error> {
        self.container.check()
    }

    pub fn wait(&mut self) -> Result<ExitStatus, Error> {
        self.container.wait()
    }

    pub fn kill(&mut self, signal: Signal, timeout: Duration) -> Result<ExitStatus, Error> {
        self.container.kill(signal, timeout)
    }
}

impl Resource for Worker {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if !self.state.begin_close() {
            return Ok(());
        }
        log::info!("tearing down worker {}", self.id);
        let mut first_error = None;
        let mut record = |result: Result<(), Error>| {
            if let Err(err) = result {
                log::error!("error tearing down worker, {}", err);
                first_error.get_or_insert(err);
            }
        };
        record(self.container.close());
        if let Some(group) = &mut self.device_group {
            record(group.close());
        }
        record(self.resources.close());
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn release(&mut self) {
        let _ = self.container.release();
        if let Some(group) = &mut self.device_group {
            group.release();
        }
        self.resources.release();
        self.state.release()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}
