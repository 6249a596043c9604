//! Content-addressed cache of root filesystem trees
//!
//! Each manifest hash maps to a directory under `roots/`, an optional archive
//! under `archive/`, and a lock file under `locks/`. Readers hold the lock
//! shared for as long as they use the tree. A single builder holds it
//! exclusively while restoring or building, so nobody ever sees a partial
//! tree. Built trees are never modified in place.

mod key;

pub use key::CacheKey;

use crate::{
    abort,
    archive::{self, build_archive, unpack_archive, ArchiveMetadata, ArchiveOptions},
    errors::Error,
    installer::PackageInstaller,
    lock::{LockFile, LockLevel, DEFAULT_LOCK_TIMEOUT},
    manifest::{Manifest, ManifestHash},
    resource::{close_on_drop, Resource, ResourceState, TempDir},
    subprocess::{ExitStatus, Subprocess},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// What to do with a freshly built tree
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveMode {
    /// never archive
    Disabled,
    /// archive before returning the root
    Inline,
    /// archive from a forked child while the root is in use
    Background,
}

impl Default for ArchiveMode {
    fn default() -> Self {
        ArchiveMode::Background
    }
}

#[derive(Clone)]
pub struct RootCache {
    base_dir: PathBuf,
    installer: Arc<dyn PackageInstaller>,
    archive_mode: ArchiveMode,
    archive_options: ArchiveOptions,
    lock_timeout: Duration,
}

impl fmt::Debug for RootCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RootCache")
            .field("base_dir", &self.base_dir)
            .field("archive_mode", &self.archive_mode)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl RootCache {
    pub fn new<P: AsRef<Path>>(base_dir: P, installer: Arc<dyn PackageInstaller>) -> Self {
        RootCache {
            base_dir: base_dir.as_ref().to_path_buf(),
            installer,
            archive_mode: ArchiveMode::default(),
            archive_options: ArchiveOptions::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn archive_mode(mut self, mode: ArchiveMode) -> Self {
        self.archive_mode = mode;
        self
    }

    pub fn archive_options(mut self, options: ArchiveOptions) -> Self {
        self.archive_options = options;
        self
    }

    /// Upper bound on any single wait for a cache entry's lock
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self, key: &CacheKey) -> PathBuf {
        key.to_path(&self.base_dir)
    }

    /// Is a finished tree present for this hash?
    pub fn contains(&self, hash: &ManifestHash) -> bool {
        self.path(&CacheKey::Root(hash.clone())).is_dir()
    }

    /// Metadata of the stored archive for this hash, if there is one
    pub fn archive_metadata(&self, hash: &ManifestHash) -> Option<ArchiveMetadata> {
        let archive = self.path(&CacheKey::Archive(hash.clone()));
        if archive.is_file() {
            ArchiveMetadata::read(&archive::metadata_path(&archive)).ok()
        } else {
            None
        }
    }

    fn wait_for<F: FnMut() -> bool>(
        &self,
        lock: &mut LockFile,
        level: LockLevel,
        break_if: F,
    ) -> Result<bool, Error> {
        lock.lock_wait(level, self.lock_timeout, break_if)
    }

    /// Find or produce the tree for `manifest`, holding it shared
    ///
    /// A cached tree is returned right away. Otherwise whoever wins the
    /// exclusive lock restores it from an archive or builds it with the
    /// package installer, and everyone else waits for the finished tree.
    pub fn get_root(&self, manifest: &Manifest) -> Result<CachedRoot, Error> {
        let hash = manifest.hash();
        let dir = self.path(&CacheKey::Root(hash.clone()));
        let mut lock = LockFile::new(self.path(&CacheKey::Lock(hash.clone())));

        let mut built = false;
        loop {
            // Dropping to shared isn't atomic, so an eviction can slip in
            self.wait_for(&mut lock, LockLevel::Shared, || false)?;
            if dir.is_dir() {
                let archiver = if built {
                    self.archive_fresh(&hash, &dir)
                } else {
                    log::debug!("root {} is cached", hash);
                    None
                };
                return Ok(self.cached_root(hash, dir, lock, archiver));
            }
            if built {
                log::warn!("root {} was evicted before it could be shared, retrying", hash);
            }

            lock.unlock();
            built = false;
            if self.wait_for(&mut lock, LockLevel::Exclusive, || dir.is_dir())? && !dir.is_dir() {
                built = self.materialize(&hash, manifest, &dir)?;
            }
        }
    }

    fn cached_root(
        &self,
        hash: ManifestHash,
        path: PathBuf,
        lock: LockFile,
        archiver: Option<Subprocess>,
    ) -> CachedRoot {
        CachedRoot {
            archive_path: self.path(&CacheKey::Archive(hash.clone())),
            hash,
            path,
            lock,
            archiver,
            state: ResourceState::Open,
        }
    }

    /// With the exclusive lock held, create the tree at `dir`
    ///
    /// Returns true if it was newly built rather than restored.
    fn materialize(&self, hash: &ManifestHash, manifest: &Manifest, dir: &Path) -> Result<bool, Error> {
        let archive = self.path(&CacheKey::Archive(hash.clone()));
        if archive.is_file() {
            log::info!("restoring root {} from archive", hash);
            unpack_archive(&archive, dir)?;
            Ok(false)
        } else {
            log::info!(
                "building root {} from {} packages",
                hash,
                manifest.packages.len()
            );
            let parent = dir
                .parent()
                .ok_or_else(|| Error::InvalidConfig(format!("{:?} has no parent", dir)))?;
            fs::create_dir_all(parent)?;
            let temp = tempfile::Builder::new()
                .prefix(".build-")
                .tempdir_in(parent)?;
            archive::set_tree_permissions(temp.path())?;
            self.installer.install(&manifest.packages, temp.path())?;
            abort::check()?;
            archive::rename_into_place(temp, dir)?;
            Ok(true)
        }
    }

    /// Start persisting a just-built tree according to the archive mode
    fn archive_fresh(&self, hash: &ManifestHash, dir: &Path) -> Option<Subprocess> {
        let dest = self.path(&CacheKey::Archive(hash.clone()));
        match self.archive_mode {
            ArchiveMode::Disabled => None,
            ArchiveMode::Inline => {
                if let Err(err) = build_archive(dir, &dest, &self.archive_options) {
                    log::warn!("root {} was not archived, {}", hash, err);
                }
                None
            }
            ArchiveMode::Background => {
                let lock_path = self.path(&CacheKey::Lock(hash.clone()));
                let dir = dir.to_path_buf();
                let options = self.archive_options.clone();
                let timeout = self.lock_timeout;
                let spawned = Subprocess::builder()
                    .name(format!("archiver for {}", hash.short()))
                    .spawn(move || {
                        let mut lock = LockFile::new(lock_path);
                        lock.lock_wait(LockLevel::Shared, timeout, || false)?;
                        build_archive(&dir, &dest, &options)?;
                        Ok(0)
                    });
                match spawned {
                    Ok(process) => Some(process),
                    Err(err) => {
                        log::warn!("root {} was not archived, {}", hash, err);
                        None
                    }
                }
            }
        }
    }

    /// A private, writable copy of the tree for `manifest`
    ///
    /// The copy is unpacked from the archive, which is created first if
    /// needed.
    pub fn checkout(&self, manifest: &Manifest) -> Result<PrivateRoot, Error> {
        let hash = manifest.hash();
        let dir = self.path(&CacheKey::Root(hash.clone()));
        let archive = self.path(&CacheKey::Archive(hash.clone()));
        let mut lock = LockFile::new(self.path(&CacheKey::Lock(hash.clone())));

        self.wait_for(&mut lock, LockLevel::Shared, || false)?;
        if !archive.is_file() {
            lock.unlock();
            if self.wait_for(&mut lock, LockLevel::Exclusive, || archive.is_file())?
                && !archive.is_file()
            {
                if !dir.is_dir() {
                    self.materialize(&hash, manifest, &dir)?;
                }
                build_archive(&dir, &archive, &self.archive_options)?;
            }
            self.wait_for(&mut lock, LockLevel::Shared, || false)?;
        }

        let scratch = TempDir::new(&self.path(&CacheKey::Scratch), "root-")?;
        let path = scratch.path().join("root");
        unpack_archive(&archive, &path)?;
        Ok(PrivateRoot { hash, path, scratch })
    }

    /// Remove the cached tree for `hash`, and optionally its archive
    ///
    /// Waits for every reader to finish. The lock file is deleted too.
    /// Returns true if there was a tree to remove.
    pub fn evict(&self, hash: &ManifestHash, remove_archive: bool) -> Result<bool, Error> {
        let dir = self.path(&CacheKey::Root(hash.clone()));
        let mut lock = LockFile::new(self.path(&CacheKey::Lock(hash.clone())));
        self.wait_for(&mut lock, LockLevel::Exclusive, || false)?;

        let existed = dir.is_dir();
        if existed {
            log::info!("evicting root {}", hash);
            fs::remove_dir_all(&dir)?;
        }
        if remove_archive {
            let archive = self.path(&CacheKey::Archive(hash.clone()));
            for path in &[archive::metadata_path(&archive), archive] {
                match fs::remove_file(path) {
                    Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                    _ => {}
                }
            }
        }
        lock.delete()?;
        Ok(existed)
    }
}

/// A shared hold on a finished tree in the cache
#[derive(Debug)]
pub struct CachedRoot {
    hash: ManifestHash,
    path: PathBuf,
    archive_path: PathBuf,
    lock: LockFile,
    archiver: Option<Subprocess>,
    state: ResourceState,
}

impl CachedRoot {
    pub fn hash(&self) -> &ManifestHash {
        &self.hash
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Is a background archive still being written for this tree?
    pub fn is_archiving(&self) -> bool {
        self.archiver.is_some()
    }

    /// Block until a background archive started for this tree has finished
    pub fn wait_archived(&mut self) -> Result<Option<ExitStatus>, Error> {
        match self.archiver.take() {
            None => Ok(None),
            Some(mut archiver) => {
                let status = archiver.wait()?;
                archiver.release();
                if !status.success() {
                    log::warn!("archiving root {} failed, {}", self.hash, status);
                }
                Ok(Some(status))
            }
        }
    }
}

impl Resource for CachedRoot {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state.begin_close() {
            let result = self.wait_archived();
            self.lock.unlock();
            result?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(archiver) = &mut self.archiver {
            archiver.release();
        }
        self.state.release()
    }
}

impl Drop for CachedRoot {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}

/// A writable copy of a cached tree, deleted on close
#[derive(Debug)]
pub struct PrivateRoot {
    hash: ManifestHash,
    path: PathBuf,
    scratch: TempDir,
}

impl PrivateRoot {
    pub fn hash(&self) -> &ManifestHash {
        &self.hash
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Resource for PrivateRoot {
    fn state(&self) -> ResourceState {
        self.scratch.state()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.scratch.close()
    }

    fn release(&mut self) {
        self.scratch.release()
    }
}
