//! Signal plumbing for the master and its workers.
//!
//! Handlers touch nothing but an atomic word; everything else happens on
//! the main loop. All handlers are installed without `SA_RESTART` so that a
//! signal makes the master's blocking `accept` (and a worker's blocking
//! `connect`) return `EINTR`, at which point the flags get consulted.

use divvy_base::Result;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static CHILD_EXITED: AtomicBool = AtomicBool::new(false);

const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

extern "C" fn handle_shutdown(_: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigchld(_: i32) {
    CHILD_EXITED.store(true, Ordering::SeqCst);
}

/// Install the master's traps: INT/TERM/QUIT request a graceful shutdown,
/// CHLD marks reaping as pending. SIGPIPE is ignored so that a worker dying
/// between connect and the master's write surfaces as `EPIPE` instead of
/// killing the master.
pub fn install_master_traps() -> Result<()> {
    let shutdown = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in SHUTDOWN_SIGNALS {
        unsafe { signal::sigaction(sig, &shutdown) }?;
    }
    let sigchld = SigAction::new(
        SigHandler::Handler(handle_sigchld),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGCHLD, &sigchld) }?;
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(Signal::SIGPIPE, &ignore) }?;
    Ok(())
}

/// Re-point the traps in a freshly forked worker. The child starts with a
/// clean slate: flags inherited from the master must not make it exit
/// before its first item. CHLD and PIPE go back to their defaults, since
/// siblings are the master's to reap and the commands a worker runs expect
/// ordinary pipe semantics.
pub fn install_child_traps() {
    SHUTDOWN.store(false, Ordering::SeqCst);
    CHILD_EXITED.store(false, Ordering::SeqCst);
    let shutdown = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in SHUTDOWN_SIGNALS {
        let _ = unsafe { signal::sigaction(sig, &shutdown) };
    }
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let _ = unsafe { signal::sigaction(Signal::SIGCHLD, &default) };
    let _ = unsafe { signal::sigaction(Signal::SIGPIPE, &default) };
}

/// A shutdown signal has arrived. The flag stays set: a second signal is a
/// no-op.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Consume the pending-reap flag. One CHLD can stand for several exited
/// children, so the caller must sweep the whole pool.
pub fn take_child_exited() -> bool {
    CHILD_EXITED.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    SHUTDOWN.store(false, Ordering::SeqCst);
    CHILD_EXITED.store(false, Ordering::SeqCst);
}
