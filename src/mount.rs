//! Mounts, bind mounts, and the mount table

use crate::{
    errors::Error,
    resource::{close_on_drop, Resource, ResourceState, TempDir},
};
use nix::{
    errno::Errno,
    mount::{mount, umount2, MntFlags, MsFlags},
};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

/// How many times a busy unmount is retried by default
pub const DEFAULT_UNMOUNT_RETRIES: u32 = 3;

const UNMOUNT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// A mounted filesystem, unmounted on close
#[derive(Debug)]
pub struct Mount {
    target: PathBuf,
    mount_point: Option<TempDir>,
    retries: u32,
    state: ResourceState,
}

impl Mount {
    /// Mount `source` at an existing `target`
    pub fn new(
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<Mount, Error> {
        log::debug!("mounting {} ({}) at {:?}", source, fstype, target);
        mount(Some(source), target, Some(fstype), flags, data)?;
        Ok(Mount {
            target: target.to_path_buf(),
            mount_point: None,
            retries: DEFAULT_UNMOUNT_RETRIES,
            state: ResourceState::Open,
        })
    }

    /// Mount `source` at a new temporary directory under `parent`, which is
    /// removed again on close
    pub fn auto(
        source: &str,
        fstype: &str,
        data: Option<&str>,
        parent: &Path,
        prefix: &str,
    ) -> Result<Mount, Error> {
        let mount_point = TempDir::new(parent, prefix)?;
        let mut mounted = Mount::new(source, mount_point.path(), fstype, MsFlags::empty(), data)?;
        mounted.mount_point = Some(mount_point);
        Ok(mounted)
    }

    /// Bind an existing directory at `target`, optionally read-only
    pub fn bind(source: &Path, target: &Path, read_only: bool) -> Result<Mount, Error> {
        log::debug!("binding {:?} at {:?}", source, target);
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )?;
        let mut bound = Mount {
            target: target.to_path_buf(),
            mount_point: None,
            retries: DEFAULT_UNMOUNT_RETRIES,
            state: ResourceState::Open,
        };
        if read_only {
            if let Err(err) = remount_read_only(target) {
                return Err(undo_after(err, || bound.close()));
            }
        }
        Ok(bound)
    }

    /// How many times a busy unmount is retried before detaching lazily
    pub fn unmount_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Resource for Mount {
    fn state(&self) -> ResourceState {
        self.state
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.state.begin_close() {
            unmount(&self.target, self.retries)?;
            if let Some(mount_point) = &mut self.mount_point {
                mount_point.close()?;
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mount_point) = &mut self.mount_point {
            mount_point.release();
        }
        self.state.release()
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        close_on_drop(self);
    }
}

/// Bind `source` at `target` with nothing to undo it, for use inside a
/// mount namespace that will be thrown away
pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<(), Error> {
    log::debug!(
        "binding {:?} at {:?}{}",
        source,
        target,
        if read_only { " read-only" } else { "" }
    );
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    if read_only {
        remount_read_only(target)?;
    }
    Ok(())
}

// A bind mount only becomes read-only once it's remounted
/// Run `undo` after a failure, keeping the original error
fn undo_after<F: FnOnce() -> Result<(), Error>>(err: Error, undo: F) -> Error {
    if let Err(undo_err) = undo() {
        log::error!("cleanup after \"{}\" also failed, {}", err, undo_err);
    }
    err
}

fn remount_read_only(target: &Path) -> Result<(), Error> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )?;
    Ok(())
}

/// Mount a kernel pseudo-filesystem such as proc or sysfs
pub fn mount_pseudo(fstype: &str, target: &Path) -> Result<(), Error> {
    log::debug!("mounting {} at {:?}", fstype, target);
    mount(
        Some(fstype),
        target,
        Some(fstype),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )?;
    Ok(())
}

/// Stop mount events propagating between this namespace and its parent
pub fn make_private(target: &Path) -> Result<(), Error> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    Ok(())
}

/// Unmount `target`, retrying while it's busy
///
/// After `retries` busy attempts the mount is detached lazily. A target that
/// isn't mounted counts as success.
pub fn unmount(target: &Path, retries: u32) -> Result<(), Error> {
    for attempt in 0..=retries {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => return Ok(()),
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                log::debug!("{:?} was not mounted", target);
                return Ok(());
            }
            Err(Errno::EBUSY) if attempt < retries => {
                log::warn!("{:?} is busy, retrying unmount", target);
                thread::sleep(UNMOUNT_RETRY_DELAY);
            }
            Err(Errno::EBUSY) => break,
            Err(err) => return Err(err.into()),
        }
    }
    log::warn!("{:?} is still busy, detaching it", target);
    umount2(target, MntFlags::MNT_DETACH)?;
    Ok(())
}

/// A directory to bind into a container, relative to its root
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl MountSpec {
    pub fn new<S: AsRef<Path>, T: AsRef<Path>>(source: S, target: T, read_only: bool) -> Self {
        let target = target.as_ref();
        MountSpec {
            source: source.as_ref().to_path_buf(),
            target: target.strip_prefix("/").unwrap_or(target).to_path_buf(),
            read_only,
        }
    }

    /// Where this lands on the host side, given the container root
    pub fn host_target(&self, root: &Path) -> PathBuf {
        root.join(&self.target)
    }
}

/// One line of the mount table
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: String,
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let octal = bytes
            .get(idx + 1..idx + 4)
            .filter(|digits| digits.iter().all(|b| (b'0'..=b'7').contains(b)));
        match (bytes[idx], octal) {
            (b'\\', Some(digits)) => {
                result.push(
                    digits
                        .iter()
                        .fold(0u8, |acc, digit| acc.wrapping_mul(8).wrapping_add(digit - b'0')),
                );
                idx += 4;
            }
            (byte, _) => {
                result.push(byte);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&result).into_owned()
}

/// Parse mount table text in the `/proc/mounts` format
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                source: unescape(fields.next()?),
                target: PathBuf::from(unescape(fields.next()?)),
                fstype: fields.next()?.to_string(),
                options: fields.next().unwrap_or("").to_string(),
            })
        })
        .collect()
}

/// The calling process's current mount table
pub fn read_mounts() -> Result<Vec<MountEntry>, Error> {
    Ok(parse_mounts(&fs::read_to_string("/proc/mounts")?))
}

/// Mount points that [unmount_foreign] would try to remove, deepest first
pub fn foreign_mounts(entries: &[MountEntry], keep: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let mut foreign: Vec<PathBuf> = entries
        .iter()
        .map(|entry| entry.target.clone())
        .filter(|target| target != Path::new("/"))
        .filter(|target| !keep.iter().any(|kept| kept.starts_with(target)))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    foreign.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });
    foreign
}

/// Unmount everything visible except `/`, the paths in `keep`, and their
/// ancestors
///
/// Run inside a private mount namespace, so other containers' scratch
/// volumes aren't pinned by this one. Mounts are detached lazily and failures
/// are only logged. Returns how many mounts were removed.
pub fn unmount_foreign(keep: &HashSet<PathBuf>) -> Result<usize, Error> {
    let mut removed = 0;
    for target in foreign_mounts(&read_mounts()?, keep) {
        match umount2(&target, MntFlags::MNT_DETACH) {
            Ok(()) => {
                log::debug!("detached {:?}", target);
                removed += 1;
            }
            Err(err) => log::debug!("left {:?} mounted, {}", target, err),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod test {
    use super::*;

    const TABLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec 0 0
/dev/mapper/vg00-scratch_a /srv/jobs/scratch\\040a xfs rw 0 0
tmpfs /srv/jobs/root-1/dev tmpfs rw 0 0
/dev/sda2 /srv ext4 rw 0 0
/dev/sda2 /srv/jobs/root-1 ext4 ro 0 0
";

    #[test]
    fn undo_keeps_first_error() {
        let err = undo_after(Error::InvalidConfig("remount".to_string()), || {
            Err(Error::InvalidConfig("unmount".to_string()))
        });
        assert!(matches!(err, Error::InvalidConfig(ref what) if what == "remount"));

        let mut undone = false;
        let err = undo_after(Error::InvalidConfig("remount".to_string()), || {
            undone = true;
            Ok(())
        });
        assert!(undone);
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn parse_table() {
        let entries = parse_mounts(TABLE);
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[2].target, Path::new("/srv/jobs/scratch a"));
        assert_eq!(entries[2].fstype, "xfs");
        assert_eq!(entries[1].options, "rw,nosuid,nodev,noexec");
    }

    #[test]
    fn foreign_excludes_own_and_ancestors() {
        let entries = parse_mounts(TABLE);
        let keep: HashSet<PathBuf> = vec![
            PathBuf::from("/srv/jobs/root-1"),
            PathBuf::from("/srv/jobs/root-1/dev"),
        ]
        .into_iter()
        .collect();
        let foreign = foreign_mounts(&entries, &keep);
        assert_eq!(
            foreign,
            vec![PathBuf::from("/srv/jobs/scratch a"), PathBuf::from("/proc")]
        );
    }

    #[test]
    fn spec_targets_are_relative() {
        let spec = MountSpec::new("/var/cache", "/var/tmp", false);
        assert_eq!(spec.target, Path::new("var/tmp"));
        assert_eq!(
            spec.host_target(Path::new("/run/c/root")),
            Path::new("/run/c/root/var/tmp")
        );
    }
}
