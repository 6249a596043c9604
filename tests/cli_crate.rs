use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::{fs, process::Command};

fn corral() -> Command {
    let mut command = Command::new(env!("CARGO"));
    command
        .arg("run")
        .arg("--quiet")
        .arg("-p")
        .arg("corral-cli")
        .arg("--")
        .arg("--log-level")
        .arg("error");
    command
}

#[test]
fn cli_no_args() {
    Command::new(env!("CARGO"))
        .arg("run")
        .arg("--quiet")
        .arg("-p")
        .arg("corral-cli")
        .assert()
        .failure()
        .stderr(predicate::str::contains("USAGE:"))
        .stdout(predicate::str::is_empty());
}

#[test]
fn cli_help() {
    corral()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("SUBCOMMANDS:"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn cli_archive_and_unpack() {
    let temp = tempfile::tempdir().unwrap();
    let tree = temp.path().join("tree");
    fs::create_dir_all(tree.join("etc")).unwrap();
    fs::write(tree.join("etc/hostname"), "builder\n").unwrap();
    let archive = temp.path().join("tree.tar.gz");

    corral()
        .arg("archive")
        .arg(&tree)
        .arg(&archive)
        .assert()
        .success()
        .stdout(predicate::str::contains("format tar.gz\n"))
        .stdout(predicate::str::contains("sha256 "))
        .stderr(predicate::str::is_empty());

    let restored = temp.path().join("restored");
    corral()
        .arg("unpack")
        .arg(&archive)
        .arg(&restored)
        .assert()
        .success()
        .stderr(predicate::str::is_empty());
    assert_eq!(
        fs::read_to_string(restored.join("etc/hostname")).unwrap(),
        "builder\n"
    );
}

#[test]
fn cli_unpack_corrupt() {
    let temp = tempfile::tempdir().unwrap();
    let tree = temp.path().join("tree");
    fs::create_dir_all(&tree).unwrap();
    fs::write(tree.join("data"), vec![0x5a; 65536]).unwrap();
    let archive = temp.path().join("tree.tar.gz");
    corral().arg("archive").arg(&tree).arg(&archive).assert().success();

    let mut payload = fs::read(&archive).unwrap();
    let last = payload.len() - 1;
    payload[last] ^= 0x01;
    fs::write(&archive, payload).unwrap();

    corral()
        .arg("unpack")
        .arg(&archive)
        .arg(temp.path().join("restored"))
        .assert()
        .code(0xFF)
        .stderr(predicate::str::contains("archive digest mismatch"))
        .stdout(predicate::str::is_empty());
    assert!(!temp.path().join("restored").exists());
}

#[test]
fn cli_scratch_size_too_large() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = temp.path().join("manifest");
    fs::write(&manifest, "busybox=1.33.0-r7\n").unwrap();

    corral()
        .arg("--base-dir")
        .arg(temp.path())
        .arg("run")
        .arg(&manifest)
        .arg("--scratch-mib")
        .arg(u64::MAX.to_string())
        .assert()
        .code(0xFF)
        .stderr(predicate::str::contains("bad scratch size"))
        .stdout(predicate::str::is_empty());
}
