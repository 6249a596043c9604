use crate::errors::Error;
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

pub const FORMAT: &str = "tar.gz";

/// Sidecar file describing an archive payload
///
/// Plain text, one `key value` per line, sorted by key. Keys we don't know
/// about are kept but otherwise ignored.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ArchiveMetadata {
    values: BTreeMap<String, String>,
}

/// Where the sidecar for the archive at `archive` lives
pub fn metadata_path(archive: &Path) -> PathBuf {
    let mut name = archive
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(OsString::new);
    name.push(".metadata");
    archive.with_file_name(name)
}

impl ArchiveMetadata {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set<K: Into<String>, V: ToString>(&mut self, key: K, value: V) {
        self.values.insert(key.into(), value.to_string());
    }

    /// Hex SHA-256 of the compressed payload
    pub fn sha256(&self) -> Option<&str> {
        self.get("sha256")
    }

    /// Payload size in bytes
    pub fn size(&self) -> Option<u64> {
        self.get("size").and_then(|s| s.parse().ok())
    }

    /// Estimated bytes the unpacked tree occupies on disk
    pub fn tree_size(&self) -> Option<u64> {
        self.get("tree_size").and_then(|s| s.parse().ok())
    }

    pub fn read(path: &Path) -> Result<Self, Error> {
        fs::read_to_string(path)?.parse()
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, self.to_string())?;
        Ok(())
    }
}

impl FromStr for ArchiveMetadata {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut metadata = ArchiveMetadata::new();
        for line in s.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let mut parts = line.splitn(2, ' ');
            let key = parts.next().unwrap_or(line);
            let value = parts.next().unwrap_or("").trim();
            metadata.set(key, value);
        }
        Ok(metadata)
    }
}

impl fmt::Display for ArchiveMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.values {
            writeln!(f, "{} {}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sorted_lines() {
        let mut metadata = ArchiveMetadata::new();
        metadata.set("tree_size", 4096);
        metadata.set("sha256", "abcd");
        metadata.set("format", FORMAT);
        assert_eq!(
            metadata.to_string(),
            "format tar.gz\nsha256 abcd\ntree_size 4096\n"
        );
    }

    #[test]
    fn unknown_keys() {
        let metadata: ArchiveMetadata = "zzz later addition\nsha256 00ff\nflag\n".parse().unwrap();
        assert_eq!(metadata.sha256(), Some("00ff"));
        assert_eq!(metadata.get("zzz"), Some("later addition"));
        assert_eq!(metadata.get("flag"), Some(""));
        assert_eq!(metadata.tree_size(), None);
    }

    #[test]
    fn sidecar_path() {
        assert_eq!(
            metadata_path(Path::new("/a/b/abc.tar.gz")),
            Path::new("/a/b/abc.tar.gz.metadata")
        );
    }
}
