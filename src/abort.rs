//! Cooperative stop requests
//!
//! Termination signals set a process-wide flag instead of killing the
//! process, so in-progress provisioning can unwind through its normal
//! cleanup path. Long waits poll [check] and bail out with
//! [Error::Aborted].

use crate::errors::Error;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Signals that are turned into a stop request
pub const STOP_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

extern "C" fn on_stop_signal(_: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Route termination signals to the stop flag
pub fn install_handlers() -> Result<(), Error> {
    set_handlers(SigHandler::Handler(on_stop_signal))
}

/// Put termination signals back to their default behavior
pub fn reset_handlers() -> Result<(), Error> {
    set_handlers(SigHandler::SigDfl)
}

fn set_handlers(handler: SigHandler) -> Result<(), Error> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    for signal in STOP_SIGNALS.iter() {
        unsafe { sigaction(*signal, &action) }?;
    }
    Ok(())
}

pub fn request_stop() {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn clear() {
    STOP_REQUESTED.store(false, Ordering::SeqCst);
}

pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

/// Fail with [Error::Aborted] if a stop was requested
pub fn check() -> Result<(), Error> {
    if stop_requested() {
        Err(Error::Aborted)
    } else {
        Ok(())
    }
}
