use corral::{
    archive::{build_archive, metadata_path, unpack_archive, ArchiveMetadata, ArchiveOptions},
    Error,
};
use std::{
    fs,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
};
use tempfile::TempDir;

fn sample_tree() -> (TempDir, PathBuf) {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().join("src");
    fs::create_dir_all(root.join("usr/bin")).unwrap();
    fs::create_dir_all(root.join("var/cache/apt")).unwrap();
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::write(root.join("usr/bin/tool"), b"#!/bin/sh\necho hi\n").unwrap();
    fs::set_permissions(root.join("usr/bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(root.join("etc/os-release"), b"ID=test\n").unwrap();
    fs::write(root.join("var/cache/apt/pkgcache.bin"), vec![7u8; 4096]).unwrap();
    symlink("usr/bin", root.join("bin")).unwrap();
    (temp, root)
}

fn leftovers(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with('.'))
        .collect()
}

#[test]
fn round_trip() {
    let (temp, root) = sample_tree();
    let dest = temp.path().join("out/root.tar.gz");
    let built = build_archive(&root, &dest, &ArchiveOptions::new()).unwrap();
    assert!(dest.is_file());

    let sidecar = ArchiveMetadata::read(&metadata_path(&dest)).unwrap();
    assert_eq!(sidecar, built);
    assert_eq!(sidecar.get("format"), Some("tar.gz"));
    assert_eq!(sidecar.sha256().unwrap().len(), 64);
    assert_eq!(sidecar.size(), Some(fs::metadata(&dest).unwrap().len()));
    assert!(sidecar.tree_size().unwrap() > 0);
    assert!(sidecar.get("created").is_some());
    assert!(leftovers(&temp.path().join("out")).is_empty());

    let restored = temp.path().join("restored");
    let unpacked = unpack_archive(&dest, &restored).unwrap();
    assert_eq!(unpacked.sha256(), built.sha256());
    assert_eq!(
        fs::read(restored.join("usr/bin/tool")).unwrap(),
        b"#!/bin/sh\necho hi\n"
    );
    let mode = fs::metadata(restored.join("usr/bin/tool")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    assert_eq!(fs::read_link(restored.join("bin")).unwrap(), Path::new("usr/bin"));
    assert_eq!(
        fs::read(restored.join("var/cache/apt/pkgcache.bin")).unwrap().len(),
        4096
    );
    assert!(leftovers(temp.path()).is_empty());
}

#[test]
fn excludes_paths() {
    let (temp, root) = sample_tree();
    let dest = temp.path().join("root.tar.gz");
    let options = ArchiveOptions::new().exclude("/var/cache").level(1);
    build_archive(&root, &dest, &options).unwrap();

    let restored = temp.path().join("restored");
    unpack_archive(&dest, &restored).unwrap();
    assert!(restored.join("etc/os-release").is_file());
    assert!(restored.join("var").is_dir());
    assert!(!restored.join("var/cache").exists());
}

#[test]
fn corruption_is_detected() {
    let (temp, root) = sample_tree();
    let dest = temp.path().join("root.tar.gz");
    let built = build_archive(&root, &dest, &ArchiveOptions::new()).unwrap();

    let mut payload = fs::read(&dest).unwrap();
    let middle = payload.len() / 2;
    payload[middle] ^= 0xff;
    fs::write(&dest, &payload).unwrap();

    let restored = temp.path().join("restored");
    match unpack_archive(&dest, &restored) {
        Err(Error::Integrity { expected, found }) => {
            assert_eq!(Some(expected.as_str()), built.sha256());
            assert_ne!(expected, found);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!restored.exists());
    assert!(leftovers(temp.path()).is_empty());
}

#[test]
fn missing_metadata_still_unpacks() {
    let (temp, root) = sample_tree();
    let dest = temp.path().join("root.tar.gz");
    build_archive(&root, &dest, &ArchiveOptions::new()).unwrap();
    fs::remove_file(metadata_path(&dest)).unwrap();

    let restored = temp.path().join("restored");
    let metadata = unpack_archive(&dest, &restored).unwrap();
    assert!(metadata.sha256().is_none());
    assert!(restored.join("etc/os-release").is_file());
}

#[test]
fn refuses_existing_destination() {
    let (temp, root) = sample_tree();
    let dest = temp.path().join("root.tar.gz");
    build_archive(&root, &dest, &ArchiveOptions::new()).unwrap();

    let restored = temp.path().join("restored");
    fs::create_dir_all(&restored).unwrap();
    fs::write(restored.join("keep"), b"mine").unwrap();
    assert!(unpack_archive(&dest, &restored).is_err());
    assert_eq!(fs::read(restored.join("keep")).unwrap(), b"mine");
    assert!(leftovers(temp.path()).is_empty());
}

#[test]
fn failed_build_leaves_nothing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp = tempfile::tempdir().unwrap();
    let out = temp.path().join("out");
    let dest = out.join("root.tar.gz");
    let result = build_archive(&temp.path().join("missing"), &dest, &ArchiveOptions::new());
    assert!(matches!(result, Err(Error::Walk(_))));
    assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
}
