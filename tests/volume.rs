use corral::{
    volume::{FsType, PoolExtents, StoragePool, VolumeAllocator},
    Error, Resource,
};
use std::{
    collections::HashMap,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process,
    sync::{Arc, Mutex},
};

const MIB: u64 = 1024 * 1024;
const EXTENT: u64 = 4 * MIB;

#[derive(Default)]
struct PoolState {
    free: u64,
    volumes: HashMap<String, u64>,
    removals: usize,
    formatted: Vec<(PathBuf, FsType)>,
}

/// Volume group kept entirely in memory
struct MemoryPool {
    fail_format: bool,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    fn new(free: u64) -> Arc<Self> {
        MemoryPool::with_format(free, false)
    }

    fn unformattable(free: u64) -> Arc<Self> {
        MemoryPool::with_format(free, true)
    }

    fn with_format(free: u64, fail_format: bool) -> Arc<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        Arc::new(MemoryPool {
            fail_format,
            state: Mutex::new(PoolState {
                free,
                ..Default::default()
            }),
        })
    }

    fn free(&self) -> u64 {
        self.state.lock().unwrap().free
    }

    fn removals(&self) -> usize {
        self.state.lock().unwrap().removals
    }

    fn volume_count(&self) -> usize {
        self.state.lock().unwrap().volumes.len()
    }
}

impl StoragePool for MemoryPool {
    fn name(&self) -> &str {
        "memory"
    }

    fn extents(&self) -> Result<PoolExtents, Error> {
        Ok(PoolExtents {
            extent_size: EXTENT,
            free: self.free(),
        })
    }

    fn create(&self, name: &str, extents: u64) -> Result<PathBuf, Error> {
        let mut state = self.state.lock().unwrap();
        state.free -= extents;
        state.volumes.insert(name.to_string(), extents);
        Ok(Path::new("/dev/memory").join(name))
    }

    fn remove(&self, name: &str) -> Result<bool, Error> {
        let mut state = self.state.lock().unwrap();
        match state.volumes.remove(name) {
            Some(extents) => {
                state.free += extents;
                state.removals += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn format(&self, device: &Path, fstype: FsType) -> Result<(), Error> {
        if self.fail_format {
            return Err(Error::Command {
                command: format!("mkfs.{} {:?}", fstype, device),
                status: process::ExitStatus::from_raw(1 << 8),
                stderr: "device is busy".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.formatted.push((device.to_path_buf(), fstype));
        Ok(())
    }
}

#[test]
fn rounds_up_to_whole_extents() {
    let pool = MemoryPool::new(10);
    let allocator = VolumeAllocator::new(pool.clone());
    let volume = allocator
        .allocate("scratch_a", 10 * MIB, FsType::Ext4)
        .unwrap();
    assert_eq!(volume.extents(), 3);
    assert_eq!(volume.size(), 12 * MIB);
    assert_eq!(volume.device(), Path::new("/dev/memory/scratch_a"));
    assert_eq!(volume.pool_name(), "memory");
    assert_eq!(volume.fstype(), FsType::Ext4);
    assert_eq!(pool.free(), 7);
    assert_eq!(
        pool.state.lock().unwrap().formatted,
        vec![(PathBuf::from("/dev/memory/scratch_a"), FsType::Ext4)]
    );
    drop(volume);
    assert_eq!(pool.free(), 10);
}

#[test]
fn out_of_space_reports_numbers() {
    let pool = MemoryPool::new(2);
    let allocator = VolumeAllocator::new(pool.clone());
    let err = allocator
        .allocate("scratch_b", 3 * EXTENT, FsType::Xfs)
        .unwrap_err();
    match err {
        Error::OutOfSpace {
            required,
            available,
        } => {
            assert_eq!(required, 3);
            assert_eq!(available, 2);
        }
        ref other => panic!("unexpected {:?}", other),
    }
    assert!(err.is_capacity());
    assert!(err.is_retryable());
    assert_eq!(pool.volume_count(), 0);
}

#[test]
fn huge_request_is_out_of_space() {
    let pool = MemoryPool::new(10);
    let allocator = VolumeAllocator::new(pool.clone());
    let err = allocator
        .allocate("scratch_huge", u64::MAX - 10, FsType::Xfs)
        .unwrap_err();
    match err {
        Error::OutOfSpace {
            required,
            available,
        } => {
            assert_eq!(required, 1u64 << 42);
            assert_eq!(available, 10);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(pool.volume_count(), 0);
    assert_eq!(pool.free(), 10);
}

#[test]
fn fills_the_pool_exactly() {
    let pool = MemoryPool::new(10);
    let allocator = VolumeAllocator::new(pool.clone());
    let volume = allocator
        .allocate("scratch_all", 10 * EXTENT, FsType::Xfs)
        .unwrap();
    assert_eq!(volume.extents(), 10);
    assert_eq!(pool.free(), 0);

    let err = allocator
        .allocate("scratch_more", 1, FsType::Xfs)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::OutOfSpace {
            required: 1,
            available: 0
        }
    ));
    drop(volume);
    assert_eq!(pool.free(), 10);
}

#[test]
fn leaves_the_remainder_free() {
    let pool = MemoryPool::new(10);
    let allocator = VolumeAllocator::new(pool.clone());
    let volume = allocator
        .allocate("scratch_most", 9 * EXTENT, FsType::Xfs)
        .unwrap();
    assert_eq!(volume.extents(), 9);
    assert_eq!(pool.free(), 1);

    let last = allocator
        .allocate("scratch_last", EXTENT, FsType::Xfs)
        .unwrap();
    assert_eq!(last.extents(), 1);
    assert_eq!(pool.free(), 0);
}

#[test]
fn failed_format_removes_volume() {
    let pool = MemoryPool::unformattable(8);
    let allocator = VolumeAllocator::new(pool.clone());
    let err = allocator
        .allocate("scratch_c", EXTENT, FsType::Xfs)
        .unwrap_err();
    assert!(matches!(err, Error::Command { .. }));
    assert_eq!(pool.volume_count(), 0);
    assert_eq!(pool.free(), 8);
    assert_eq!(pool.removals(), 1);
}

#[test]
fn close_is_idempotent() {
    let pool = MemoryPool::new(4);
    let allocator = VolumeAllocator::new(pool.clone());
    let mut volume = allocator.allocate("scratch_d", 1, FsType::Ext2).unwrap();
    assert_eq!(volume.extents(), 1);
    volume.close().unwrap();
    volume.close().unwrap();
    drop(volume);
    assert_eq!(pool.removals(), 1);
    assert_eq!(pool.free(), 4);
}

#[test]
fn already_removed_is_fine() {
    let pool = MemoryPool::new(4);
    let allocator = VolumeAllocator::new(pool.clone());
    let mut volume = allocator.allocate("scratch_e", EXTENT, FsType::Xfs).unwrap();
    assert!(pool.remove("scratch_e").unwrap());
    volume.close().unwrap();
    assert_eq!(pool.free(), 4);
}

#[test]
fn released_volume_stays() {
    let pool = MemoryPool::new(4);
    let allocator = VolumeAllocator::new(pool.clone());
    let mut volume = allocator.allocate("scratch_f", EXTENT, FsType::Xfs).unwrap();
    volume.release();
    drop(volume);
    assert_eq!(pool.volume_count(), 1);
    assert_eq!(pool.free(), 3);
}
