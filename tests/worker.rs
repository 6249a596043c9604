use corral::{
    installer::PackageInstaller,
    manifest::PackageSpec,
    volume::{FsType, PoolExtents, StoragePool},
    Config, Error, Job, Manifest, Provisioner,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

struct NoInstaller;

impl PackageInstaller for NoInstaller {
    fn install(&self, _: &[PackageSpec], _: &Path) -> Result<(), Error> {
        Err(Error::Installer("not expected in this test".to_string()))
    }

    fn installed_size(&self, _: &[PackageSpec]) -> Result<u64, Error> {
        Ok(0)
    }
}

/// Hands out device paths that can never be mounted
struct PhantomPool {
    free: Mutex<u64>,
    live: AtomicUsize,
}

impl PhantomPool {
    fn new(free: u64) -> Arc<Self> {
        Arc::new(PhantomPool {
            free: Mutex::new(free),
            live: AtomicUsize::new(0),
        })
    }
}

impl StoragePool for PhantomPool {
    fn name(&self) -> &str {
        "phantom"
    }

    fn extents(&self) -> Result<PoolExtents, Error> {
        Ok(PoolExtents {
            extent_size: 1024 * 1024,
            free: *self.free.lock().unwrap(),
        })
    }

    fn create(&self, name: &str, extents: u64) -> Result<PathBuf, Error> {
        *self.free.lock().unwrap() -= extents;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Path::new("/nonexistent/phantom").join(name))
    }

    fn remove(&self, _: &str) -> Result<bool, Error> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }

    fn format(&self, _: &Path, _: FsType) -> Result<(), Error> {
        Ok(())
    }
}

fn setup(free: u64) -> (tempfile::TempDir, Provisioner, Arc<PhantomPool>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let base = tempfile::tempdir().unwrap();
    let mut config = Config::new()
        .base_dir(base.path())
        .loop_range(0, 16, 8)
        .cgroup_root(None::<&Path>)
        .payload(vec!["/bin/true"]);
    config.min_scratch_mib = 16;
    let pool = PhantomPool::new(free);
    let provisioner = Provisioner::new(config, Arc::new(NoInstaller), pool.clone()).unwrap();
    (base, provisioner, pool)
}

fn job(id: &str) -> Job {
    let mut job = Job::new(id, Manifest::parse_lines("busybox=1.33.0-r7").unwrap());
    job.network = false;
    job
}

#[test]
fn out_of_space_is_a_capacity_error() {
    let (base, provisioner, pool) = setup(8);
    let err = provisioner.start(&job("full")).unwrap_err();
    match &err {
        Error::Acquisition { what, source } => {
            assert_eq!(what, "scratch volume");
            assert!(matches!(
                **source,
                Error::OutOfSpace {
                    required: 16,
                    available: 8
                }
            ));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(err.is_capacity());
    assert!(err.is_retryable());
    assert_eq!(pool.live.load(Ordering::SeqCst), 0);
    assert_eq!(fs::read_dir(base.path().join("tmp")).unwrap().count(), 0);
}

#[test]
fn failed_start_gives_everything_back() {
    let (base, provisioner, pool) = setup(64);
    let mut job = job("unmountable");
    job.scratch_size = 32 * 1024 * 1024;
    let err = provisioner.start(&job).unwrap_err();
    assert!(matches!(err, Error::Acquisition { .. }));
    assert!(!err.is_retryable());
    assert_eq!(pool.live.load(Ordering::SeqCst), 0);
    assert_eq!(fs::read_dir(base.path().join("tmp")).unwrap().count(), 0);
    assert!(!provisioner.cache().contains(&job.manifest.hash()));
}
