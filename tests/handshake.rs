use corral::{
    handshake::{ChildHandshake, Handshake, ParentHandshake},
    subprocess::{ExitStatus, Subprocess},
    Error,
};
use std::{thread, time::Duration};

/// Fork a child running `body` with its half of a fresh handshake
fn spawn<F>(body: F) -> (ParentHandshake, Subprocess)
where
    F: FnOnce(&mut ChildHandshake) -> Result<i32, Error>,
{
    let _ = env_logger::builder().is_test(true).try_init();
    let (parent, mut child) = Handshake::new().unwrap().split();
    let mut builder = Subprocess::builder().name("handshake child");
    for fd in child.fds() {
        builder = builder.keep_fd(fd);
    }
    let process = builder.spawn(move || body(&mut child)).unwrap();
    (parent, process)
}

#[test]
fn child_waits_for_release() {
    let (mut parent, mut process) = spawn(|child| {
        child.ready()?;
        child.wait_release()?;
        Ok(5)
    });
    parent.wait_ready(process.pid()).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(process.check().unwrap(), None);

    assert!(!parent.is_released());
    parent.release().unwrap();
    assert!(parent.is_released());
    assert!(parent.release().is_err());
    assert!(parent.proceed().is_err());
    assert!(parent.wait_started().unwrap());
    assert_eq!(process.wait().unwrap(), ExitStatus::Exited(5));
}

#[test]
fn early_exit_is_a_handshake_error() {
    let (mut parent, mut process) = spawn(|_| Ok(9));
    let pid = process.pid();
    match parent.wait_ready(pid) {
        Err(Error::Handshake(failed)) => assert_eq!(failed, pid),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(process.wait().unwrap(), ExitStatus::Exited(9));
}

#[test]
fn failure_after_release_is_reported() {
    let (mut parent, mut process) = spawn(|child| {
        child.ready()?;
        child.wait_release()?;
        child.fail();
        Ok(70)
    });
    parent.wait_ready(process.pid()).unwrap();
    parent.release().unwrap();
    assert!(!parent.wait_started().unwrap());
    assert_eq!(process.wait().unwrap().code(), Some(70));
}

#[test]
fn proceed_before_release() {
    let (mut parent, mut process) = spawn(|child| {
        child.wait_proceed()?;
        child.ready()?;
        child.wait_release()?;
        Ok(0)
    });
    parent.proceed().unwrap();
    parent.wait_ready(process.pid()).unwrap();
    parent.release().unwrap();
    assert!(process.wait().unwrap().success());
}

#[test]
fn dropped_parent_fails_proceed() {
    let (parent, mut process) = spawn(|child| match child.wait_proceed() {
        Err(Error::InvalidState { .. }) => Ok(11),
        Err(err) => Err(err),
        Ok(()) => Ok(0),
    });
    drop(parent);
    assert_eq!(process.wait().unwrap().code(), Some(11));
}
