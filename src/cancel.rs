//! Cooperative cancellation.
//!
//! SIGINT/SIGTERM flip a process-wide flag. The pipeline and the streaming
//! command executor poll it between units of work; the current subprocess is
//! terminated and mounts are released before the runner exits.

use std::sync::atomic::{AtomicBool, Ordering};

static CANCELLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    CANCELLED.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers. Call once at program start.
pub fn install_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

/// True once a cancellation signal has been received.
pub fn is_cancelled() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}
