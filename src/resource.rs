//! Scoped ownership of host resources
//!
//! Every volume, mount, lock, network link, and process that a worker
//! acquires is a [Resource]. Closing one performs its teardown exactly once;
//! releasing one hands ownership elsewhere and skips teardown. A
//! [ResourceStack] tears its members down in reverse order of acquisition.

use crate::errors::Error;
use std::{
    fmt, fs, io,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

/// Lifecycle state shared by every resource
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceState {
    Open,
    Released,
    Closed,
}

impl Default for ResourceState {
    fn default() -> Self {
        ResourceState::Open
    }
}

impl ResourceState {
    pub fn is_open(&self) -> bool {
        *self == ResourceState::Open
    }

    /// Mark an open resource closed, returning true if teardown should run
    pub fn begin_close(&mut self) -> bool {
        let was_open = self.is_open();
        if was_open {
            *self = ResourceState::Closed;
        }
        was_open
    }

    /// Mark an open resource released. Terminal states are left alone.
    pub fn release(&mut self) {
        if self.is_open() {
            *self = ResourceState::Released;
        }
    }
}

/// Something acquired from the host that must be given back
pub trait Resource: fmt::Debug {
    fn state(&self) -> ResourceState;

    /// Tear down the resource
    ///
    /// Safe to call more than once. Only the first call on an open resource
    /// has any effect.
    fn close(&mut self) -> Result<(), Error>;

    /// Give up ownership without tearing anything down
    fn release(&mut self);
}

impl<R: Resource + ?Sized> Resource for Box<R> {
    fn state(&self) -> ResourceState {
        (**self).state()
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Close a resource from a Drop impl, where errors can only be logged
pub(crate) fn close_on_drop<R: Resource + ?Sized>(resource: &mut R) {
    if resource.state().is_open() {
        if let Err(err) = resource.close() {
            log::error!("error closing {:?} on drop, {}", resource, err);
        }
    }
}

/// An ordered collection of resources, closed last-in first-out
///
/// Closing continues past failures. Every failure is logged, and the first
/// one is returned once all members have had a chance to close.
#[derive(Debug, Default)]
pub struct ResourceStack {
    members: Vec<Box<dyn Resource>>,
    state: ResourceState,
}

impl ResourceStack {
    pub fn new() -> Self {
        Default::default()
    }

    /// Take ownership of an acquired resource
    pub fn push<R: Resource + 'static>(&mut self, resource: R) {
        self.members.push(Box::new(resource));
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Resource for ResourceStack {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if !self.state.begin_close() {
            return Ok(());
        }
        let mut first_error = None;
        while let Some(mut member) = self.members.pop() {
            if let Err(err) = member.close() {
                log::error!("error closing {:?}, {}", member, err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn release(&mut self) {
        if self.state.is_open() {
            for member in self.members.iter_mut().rev() {
                member.release();
            }
            self.members.clear();
        }
        self.state.release();
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}

/// A private directory, removed along with its contents on close
#[derive(Debug)]
pub struct TempDir {
    path: PathBuf,
    state: ResourceState,
}

impl TempDir {
    /// Create a new uniquely named directory under `parent`
    pub fn new(parent: &Path, prefix: &str) -> Result<TempDir, Error> {
        fs::create_dir_all(parent)?;
        let path = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(parent)?
            .into_path();
        log::debug!("created temporary directory {:?}", path);
        Ok(TempDir {
            path,
            state: ResourceState::Open,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a file inside this directory, creating parent directories
    pub fn create_file<P: AsRef<Path>>(
        &self,
        relative: P,
        contents: &[u8],
        mode: u32,
    ) -> Result<PathBuf, Error> {
        create_file(&self.path, relative.as_ref(), contents, mode)
    }
}

/// Write a file at `relative` under `root`, creating parent directories
pub fn create_file(
    root: &Path,
    relative: &Path,
    contents: &[u8],
    mode: u32,
) -> Result<PathBuf, Error> {
    let relative = relative.strip_prefix("/").unwrap_or(relative);
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&path)?;
    io::Write::write_all(&mut file, contents)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
    Ok(path)
}

impl Resource for TempDir {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state.begin_close() {
            match fs::remove_dir_all(&self.path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                _ => log::debug!("removed temporary directory {:?}", self.path),
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        self.state.release()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}
