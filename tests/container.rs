use corral::{
    container::{ContainerState, DEFAULT_HOSTNAME},
    mount::MountSpec,
    subprocess::{ExitStatus, Signal, Subprocess},
    Container, Error, Resource,
};
use nix::sched::{unshare, CloneFlags};
use std::{fs, thread, time::Duration};
use tempfile::TempDir;

/// Namespaces need real privileges; skip quietly without them
fn can_isolate() -> bool {
    let _ = env_logger::builder().is_test(true).try_init();
    if !nix::unistd::geteuid().is_root() {
        return false;
    }
    let check = Subprocess::builder().name("namespace check").spawn(|| {
        let flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWPID;
        Ok(if unshare(flags).is_ok() { 0 } else { 1 })
    });
    match check {
        Ok(mut check) => check.wait().map(|status| status.success()).unwrap_or(false),
        Err(_) => false,
    }
}

/// A root made of the host's own filesystem, read-only, plus a writable /tmp
fn host_root() -> (TempDir, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    (root, scratch)
}

fn builder(id: &str, root: &TempDir, scratch: &TempDir) -> corral::container::ContainerBuilder {
    Container::new(id, root.path())
        .mount(MountSpec::new("/", "/", true))
        .mount(MountSpec::new(scratch.path(), "tmp", false))
        .pseudo_filesystems(true)
}

#[test]
fn runs_only_after_release() {
    if !can_isolate() {
        return;
    }
    let (root, scratch) = host_root();
    let mut container = builder("run1", &root, &scratch)
        .file("/tmp/job/input", "hello", 0o644)
        .args(&[
            "/bin/sh",
            "-c",
            "test \"$(cat /tmp/job/input)\" = hello && hostname > /tmp/job/host && exit 7",
        ])
        .spawn()
        .unwrap();
    assert_eq!(container.lifecycle(), ContainerState::Cloned);
    assert_eq!(fs::read(scratch.path().join("job/input")).unwrap(), b"hello");

    thread::sleep(Duration::from_millis(200));
    assert_eq!(container.check().unwrap(), None);
    assert!(!scratch.path().join("job/host").exists());

    container.release().unwrap();
    assert_eq!(container.lifecycle(), ContainerState::Running);
    assert!(container.release().is_err());
    assert_eq!(container.wait().unwrap(), ExitStatus::Exited(7));
    assert_eq!(container.lifecycle(), ContainerState::Exited);
    assert_eq!(
        fs::read_to_string(scratch.path().join("job/host")).unwrap().trim(),
        DEFAULT_HOSTNAME
    );
    container.close().unwrap();
}

#[test]
fn root_is_read_only() {
    if !can_isolate() {
        return;
    }
    let (root, scratch) = host_root();
    let mut container = builder("ro1", &root, &scratch)
        .hostname("builder")
        .args(&["/bin/sh", "-c", "touch /corral-write-test 2>/dev/null && exit 1; exit 0"])
        .spawn()
        .unwrap();
    container.release().unwrap();
    assert!(container.wait().unwrap().success());
}

#[test]
fn null_stdio_detaches_payload_output() {
    if !can_isolate() {
        return;
    }
    let (root, scratch) = host_root();
    let mut container = builder("quiet1", &root, &scratch)
        .null_stdio(true)
        .args(&["/bin/sh", "-c", "stat -L -c %t:%T /proc/self/fd/2 > /tmp/stderr"])
        .spawn()
        .unwrap();
    container.release().unwrap();
    assert!(container.wait().unwrap().success());
    assert_eq!(
        fs::read_to_string(scratch.path().join("stderr")).unwrap().trim(),
        "1:3"
    );
}

#[test]
fn missing_payload_fails_before_running() {
    if !can_isolate() {
        return;
    }
    let (root, scratch) = host_root();
    let mut container = builder("bad1", &root, &scratch)
        .arg("/nonexistent/payload")
        .spawn()
        .unwrap();
    container.release().unwrap();
    assert_eq!(container.lifecycle(), ContainerState::Exited);
    assert_eq!(container.wait().unwrap().code(), Some(70));
}

#[test]
fn missing_mount_source_fails_setup() {
    if !can_isolate() {
        return;
    }
    let (root, scratch) = host_root();
    let err = builder("bad2", &root, &scratch)
        .mount(MountSpec::new("/nonexistent/source", "opt/src", true))
        .arg("/bin/true")
        .spawn()
        .unwrap_err();
    assert!(matches!(err.root_cause(), Error::Handshake(_)));
}

#[test]
fn close_kills_unreleased_container() {
    if !can_isolate() {
        return;
    }
    let (root, scratch) = host_root();
    let mut container = builder("kill1", &root, &scratch)
        .arg("/bin/true")
        .spawn()
        .unwrap();
    let pid = container.pid();
    container.close().unwrap();
    assert_eq!(container.lifecycle(), ContainerState::Killed);
    assert!(nix::sys::signal::kill(pid, None).is_err());
    container.close().unwrap();
}

#[test]
fn kill_running_container() {
    if !can_isolate() {
        return;
    }
    let (root, scratch) = host_root();
    let mut container = builder("kill2", &root, &scratch)
        .args(&["/bin/sleep", "60"])
        .spawn()
        .unwrap();
    container.release().unwrap();
    let status = container
        .kill(Signal::SIGTERM, Duration::from_millis(500))
        .unwrap();
    assert!(!status.success());
    assert_eq!(container.lifecycle(), ContainerState::Killed);
}
