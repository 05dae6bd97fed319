//! Ctrl-C handling.
//!
//! The first Ctrl-C triggers the registered `Interrupt`, letting running
//! computations wind down and leave the graph retryable.  On unix the handler
//! then restores the default action, so a second Ctrl-C kills the process.

use crate::interrupt::Interrupt;
use std::sync::OnceLock;

static INTERRUPT: OnceLock<Interrupt> = OnceLock::new();

fn trigger() {
    if let Some(interrupt) = INTERRUPT.get() {
        interrupt.trigger();
    }
}

#[cfg(unix)]
mod imp {
    fn sigint_action(handler: libc::sighandler_t) {
        // Safety: registering a signal handler is libc unsafe code.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = handler;
            libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        }
    }

    extern "C" fn sigint_handler(_sig: libc::c_int) {
        super::trigger();
        sigint_action(libc::SIG_DFL);
    }

    pub fn install() {
        sigint_action(sigint_handler as libc::sighandler_t);
    }
}

#[cfg(windows)]
mod imp {
    use windows_sys::Win32::Foundation::BOOL;
    use windows_sys::Win32::System::Console::{SetConsoleCtrlHandler, CTRL_C_EVENT};

    unsafe extern "system" fn ctrl_handler(ctrl_type: u32) -> BOOL {
        if ctrl_type == CTRL_C_EVENT {
            super::trigger();
            1
        } else {
            0
        }
    }

    pub fn install() {
        // Safety: the handler only touches an atomic flag.
        unsafe {
            SetConsoleCtrlHandler(Some(ctrl_handler), 1);
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod imp {
    pub fn install() {}
}

/// Routes Ctrl-C to `interrupt`.  Only the first registration in a process
/// takes effect.
pub fn register_sigint(interrupt: &Interrupt) {
    if INTERRUPT.set(interrupt.clone()).is_ok() {
        imp::install();
    }
}
