use corral::{
    abort,
    lock::{LockFile, LockLevel},
    Error,
};
use nix::sys::signal::{raise, Signal};
use std::time::{Duration, Instant};

// The stop flag is process-wide, so everything that touches it runs in one
// test function.
#[test]
fn stop_requests() {
    let _ = env_logger::builder().is_test(true).try_init();
    abort::install_handlers().unwrap();
    abort::clear();
    abort::check().unwrap();

    raise(Signal::SIGTERM).unwrap();
    assert!(abort::stop_requested());
    let err = abort::check().unwrap_err();
    assert!(err.is_aborted());
    assert!(Error::acquisition("scratch volume", err).is_aborted());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.lock");
    let mut holder = LockFile::new(&path);
    assert!(holder.try_lock(LockLevel::Exclusive).unwrap());
    let mut waiter = LockFile::new(&path);
    let started = Instant::now();
    let result = waiter.lock_wait(LockLevel::Shared, Duration::from_secs(30), || false);
    assert!(matches!(result, Err(Error::Aborted)));
    assert!(started.elapsed() < Duration::from_secs(5));

    abort::clear();
    holder.unlock();
    assert!(waiter
        .lock_wait(LockLevel::Shared, Duration::from_secs(5), || false)
        .unwrap());

    abort::request_stop();
    assert!(abort::check().is_err());
    abort::clear();
    abort::reset_handlers().unwrap();
}
