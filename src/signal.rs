// src/signal.rs

//! Cooperative shutdown on SIGINT/SIGTERM
//!
//! The first signal sets [`SHUTDOWN`] and restores the default handler so
//! a second signal terminates immediately. The command layer bridges the
//! flag into the engine's cancel flag; workers observe it at every
//! suspension point and exit cleanly, abandoning in-flight tokens.

use std::sync::atomic::{AtomicBool, Ordering};

/// Set to `true` on the first SIGINT/SIGTERM
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handlers() {
    #[cfg(unix)]
    {
        // Safety: the handler only stores an atomic bool and restores the
        // default disposition.
        unsafe {
            libc::signal(
                libc::SIGINT,
                handle_signal as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGTERM,
                handle_signal as *const () as libc::sighandler_t,
            );
        }
    }
}

#[cfg(unix)]
extern "C" fn handle_signal(sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    // A second signal kills the process immediately.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
