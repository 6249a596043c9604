//! Compressed snapshots of filesystem trees
//!
//! An archive is a gzip-compressed tar stream at `<name>.tar.gz` with a
//! sidecar at `<name>.tar.gz.metadata`. Both are written under temporary
//! names and renamed into place only once complete, sidecar first, so a
//! visible payload always has its metadata next to it.

mod digest;
mod metadata;

pub use metadata::{metadata_path, ArchiveMetadata, FORMAT};

use crate::errors::Error;
use digest::{HashingReader, HashingWriter};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::{
    fs,
    fs::{File, Permissions},
    io,
    io::{BufReader, Read},
    os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use walkdir::WalkDir;

/// File name extension for archive payloads
pub const EXTENSION: &str = "tar.gz";

#[derive(Clone, Debug)]
pub struct ArchiveOptions {
    excludes: Vec<PathBuf>,
    level: u32,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            excludes: Vec::new(),
            level: 6,
        }
    }
}

impl ArchiveOptions {
    pub fn new() -> Self {
        Default::default()
    }

    /// Leave out a path, relative to the archived directory, and everything
    /// under it
    pub fn exclude<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        self.excludes
            .push(path.strip_prefix("/").unwrap_or(path).to_path_buf());
        self
    }

    /// Compression level, 0 through 9
    pub fn level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    fn is_excluded(&self, relative: &Path) -> bool {
        self.excludes.iter().any(|excluded| relative == excluded)
    }
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(
        ".{}.{}-{}.tmp",
        name,
        std::process::id(),
        rand::random::<u64>()
    ))
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            log::warn!("failed to remove {:?}, {}", path, err)
        }
        _ => {}
    }
}

/// Snapshot `dir` into an archive at `dest`
///
/// The tree is streamed through tar and gzip while the compressed bytes are
/// hashed, in a single pass. On any failure nothing new is left at `dest`.
pub fn build_archive(
    dir: &Path,
    dest: &Path,
    options: &ArchiveOptions,
) -> Result<ArchiveMetadata, Error> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = temp_sibling(dest);
    let temp_metadata = metadata_path(&temp_path);
    let dest_metadata = metadata_path(dest);
    log::info!("archiving {:?} -> {:?}", dir, dest);

    let mut writer = HashingWriter::create(temp_path)?;
    let result = (|| -> Result<ArchiveMetadata, Error> {
        let tree_size = write_tree(dir, &mut writer, options)?;
        let (digest, size) = writer.finalize()?;
        let mut metadata = ArchiveMetadata::new();
        metadata.set("format", FORMAT);
        metadata.set("sha256", digest);
        metadata.set("size", size);
        metadata.set("tree_size", tree_size);
        if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
            metadata.set("created", now.as_secs());
        }
        metadata.write(&temp_metadata)?;
        fs::rename(&temp_metadata, &dest_metadata)?;
        writer.rename_temp(dest)?;
        Ok(metadata)
    })();

    if let Err(err) = &result {
        log::warn!("archiving {:?} failed, {}", dir, err);
        writer.remove_temp();
        remove_if_present(&temp_metadata);
        if !dest.exists() {
            remove_if_present(&dest_metadata);
        }
    }
    result
}

/// Stream the tree into `writer`, returning its on-disk size
fn write_tree(dir: &Path, writer: &mut HashingWriter, options: &ArchiveOptions) -> Result<u64, Error> {
    let encoder = GzEncoder::new(writer, Compression::new(options.level));
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut tree_size = 0;
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(|entry| match entry.path().strip_prefix(dir) {
            Ok(relative) => !options.is_excluded(relative),
            Err(_) => true,
        });
    for entry in walker {
        let entry = entry?;
        tree_size += entry.metadata()?.blocks() * 512;
        let relative = match entry.path().strip_prefix(dir) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            _ => continue,
        };
        if entry.file_type().is_socket() {
            log::debug!("not archiving socket {:?}", entry.path());
            continue;
        }
        builder.append_path_with_name(entry.path(), relative)?;
    }
    builder.into_inner()?.finish()?;
    Ok(tree_size)
}

/// Restore the archive at `src` as a new directory at `dir`
///
/// The payload is unpacked next to `dir` under a temporary name while its
/// digest is computed, then renamed into place if it matches the sidecar. A
/// sidecar without a digest only draws a warning. On mismatch this fails
/// with [Error::Integrity] and the partial tree is removed.
pub fn unpack_archive(src: &Path, dir: &Path) -> Result<ArchiveMetadata, Error> {
    let metadata = match ArchiveMetadata::read(&metadata_path(src)) {
        Ok(metadata) => metadata,
        Err(Error::IO(err)) if err.kind() == io::ErrorKind::NotFound => {
            log::warn!("archive {:?} has no metadata", src);
            ArchiveMetadata::new()
        }
        Err(err) => return Err(err),
    };
    let parent = dir
        .parent()
        .ok_or_else(|| Error::InvalidConfig(format!("{:?} has no parent directory", dir)))?;
    fs::create_dir_all(parent)?;
    let temp = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(parent)?;
    set_tree_permissions(temp.path())?;
    log::info!("unpacking {:?} -> {:?}", src, dir);

    let mut reader = HashingReader::new(BufReader::new(File::open(src)?));
    let unpacked = unpack_tree(&mut reader, temp.path());
    let found = reader.finish()?;
    match metadata.sha256() {
        Some(expected) if expected != found => {
            return Err(Error::Integrity {
                expected: expected.to_string(),
                found,
            })
        }
        Some(_) => {}
        None => log::warn!("archive {:?} has no digest, not verifying it", src),
    }
    unpacked?;
    rename_into_place(temp, dir)?;
    Ok(metadata)
}

/// Give a new tree's top directory the usual root permissions
pub(crate) fn set_tree_permissions(dir: &Path) -> Result<(), Error> {
    fs::set_permissions(dir, Permissions::from_mode(0o755))?;
    Ok(())
}

/// Move a finished temporary tree to `dest`, or remove it if that fails
pub(crate) fn rename_into_place(temp: tempfile::TempDir, dest: &Path) -> Result<(), Error> {
    let temp_path = temp.into_path();
    if let Err(err) = fs::rename(&temp_path, dest) {
        if let Err(err) = fs::remove_dir_all(&temp_path) {
            log::warn!("failed to remove {:?}, {}", temp_path, err);
        }
        return Err(err.into());
    }
    Ok(())
}

fn unpack_tree<R: Read>(reader: R, dest: &Path) -> Result<(), Error> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());
    archive.set_overwrite(true);
    archive.unpack(dest)?;
    Ok(())
}
