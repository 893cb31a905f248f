//! Terminal resize notification
//!
//! The handler only sets a flag; the session loop picks it up between
//! readiness waits (a pending signal also cuts the wait short).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static RESIZED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_winch(_signal: libc::c_int) {
    RESIZED.store(true, Ordering::Relaxed);
}

/// Install the `SIGWINCH` handler
pub fn install() -> io::Result<()> {
    // SAFETY: the handler only touches an atomic, and the sigaction struct is
    // fully initialized before use
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_winch as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        if libc::sigaction(libc::SIGWINCH, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Whether the terminal was resized since the last call
pub fn take() -> bool {
    RESIZED.swap(false, Ordering::Relaxed)
}
