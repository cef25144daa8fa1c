//! Edge-triggered notification flags, set by the signal handlers and drained
//! by the main loop with an atomic test-and-clear.
//!
//! The handlers store into an atomic and do nothing else: no allocation, no
//! I/O, no access to the sample buffer. All the actual work happens in the
//! main loop, which the signals merely wake up from its coarse sleep.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::{Context, Result};

static TICK: AtomicBool = AtomicBool::new(false);
static CHILD_EVENT: AtomicBool = AtomicBool::new(false);
static INTERRUPT: AtomicBool = AtomicBool::new(false);
static INTERRUPT_SIGNO: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_sigalrm(_signo: libc::c_int) {
    TICK.store(true, Ordering::Release);
}

extern "C" fn on_sigchld(_signo: libc::c_int) {
    CHILD_EVENT.store(true, Ordering::Release);
}

extern "C" fn on_interrupt(signo: libc::c_int) {
    INTERRUPT_SIGNO.store(signo, Ordering::Release);
    INTERRUPT.store(true, Ordering::Release);
}

/// Installs the handlers for the timer tick, child termination and
/// interruption signals.
pub fn install() -> Result<()> {
    install_handler(libc::SIGALRM, on_sigalrm).context("sigaction(SIGALRM)")?;
    install_handler(libc::SIGCHLD, on_sigchld).context("sigaction(SIGCHLD)")?;
    install_handler(libc::SIGINT, on_interrupt).context("sigaction(SIGINT)")?;
    install_handler(libc::SIGTERM, on_interrupt).context("sigaction(SIGTERM)")?;
    Ok(())
}

fn install_handler(signo: libc::c_int, handler: extern "C" fn(libc::c_int)) -> io::Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler as usize;
    // no SA_RESTART: the signals must interrupt the main loop's nanosleep
    action.sa_flags = 0;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signo, &action, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// True if the interval timer fired since the last call.
pub fn take_tick() -> bool {
    TICK.swap(false, Ordering::AcqRel)
}

/// True if a child of this process changed state since the last call.
pub fn take_child_event() -> bool {
    CHILD_EVENT.swap(false, Ordering::AcqRel)
}

/// The signal number, if SIGINT or SIGTERM was received since the last call.
pub fn take_interrupt() -> Option<i32> {
    if INTERRUPT.swap(false, Ordering::AcqRel) {
        Some(INTERRUPT_SIGNO.load(Ordering::Acquire))
    } else {
        None
    }
}
