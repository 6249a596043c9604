use crate::{archive, manifest::ManifestHash};
use std::path::{Path, PathBuf};

/// Everything the root cache stores, and where it lives under the base dir
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum CacheKey {
    Root(ManifestHash),
    Archive(ManifestHash),
    Lock(ManifestHash),
    Scratch,
}

impl CacheKey {
    pub fn to_path(&self, base_dir: &Path) -> PathBuf {
        let mut path = base_dir.to_path_buf();
        match self {
            CacheKey::Root(hash) => {
                path.push("roots");
                path.push(hash.as_str());
            }
            CacheKey::Archive(hash) => {
                path.push("archive");
                path.push(format!("{}.{}", hash, archive::EXTENSION));
            }
            CacheKey::Lock(hash) => {
                path.push("locks");
                path.push(hash.as_str());
                path.set_extension("lock");
            }
            CacheKey::Scratch => path.push("tmp"),
        }
        path
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manifest::Manifest;

    #[test]
    fn layout() {
        let hash = Manifest::default().hash();
        let base = Path::new("/srv/corral");
        assert_eq!(
            CacheKey::Root(hash.clone()).to_path(base),
            base.join("roots").join(hash.as_str())
        );
        assert_eq!(
            CacheKey::Archive(hash.clone()).to_path(base),
            base.join("archive").join(format!("{}.tar.gz", hash))
        );
        assert_eq!(
            CacheKey::Lock(hash.clone()).to_path(base),
            base.join("locks").join(format!("{}.lock", hash))
        );
        assert_eq!(CacheKey::Scratch.to_path(base), base.join("tmp"));
    }
}
