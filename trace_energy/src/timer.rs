use std::io;
use std::ptr;

use anyhow::{Context, Result};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Periodic POSIX timer that delivers a SIGALRM to the process on every tick.
pub struct IntervalTimer {
    id: libc::timer_t,
    armed: bool,
}

impl IntervalTimer {
    /// Creates the timer and arms it with a period of `1 / frequency_hz` seconds.
    /// The first expiration is immediate; the sampler discards it as warm-up.
    pub fn arm(frequency_hz: f64) -> Result<IntervalTimer> {
        let mut ev: libc::sigevent = unsafe { std::mem::zeroed() };
        ev.sigev_notify = libc::SIGEV_SIGNAL;
        ev.sigev_signo = libc::SIGALRM;

        let mut id: libc::timer_t = ptr::null_mut();
        if unsafe { libc::timer_create(libc::CLOCK_REALTIME, &mut ev, &mut id) } < 0 {
            return Err(io::Error::last_os_error()).context("timer_create");
        }

        let spec = libc::itimerspec {
            it_interval: timespec_from_nanos(period_nanos(frequency_hz)),
            it_value: timespec_from_nanos(1),
        };
        if unsafe { libc::timer_settime(id, 0, &spec, ptr::null_mut()) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::timer_delete(id) };
            return Err(err).context("timer_settime");
        }

        Ok(IntervalTimer { id, armed: true })
    }

    /// Stops and deletes the timer. Called before draining the sample buffer,
    /// so that no pending tick can race with the teardown.
    pub fn disarm(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let spec = libc::itimerspec {
            it_interval: timespec_from_nanos(0),
            it_value: timespec_from_nanos(0),
        };
        unsafe {
            libc::timer_settime(self.id, 0, &spec, ptr::null_mut());
            libc::timer_delete(self.id);
        }
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// The timer period in nanoseconds for a sampling frequency in Hertz.
fn period_nanos(frequency_hz: f64) -> u64 {
    (NANOS_PER_SEC as f64 / frequency_hz).round() as u64
}

fn timespec_from_nanos(nanos: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (nanos / NANOS_PER_SEC) as libc::time_t,
        tv_nsec: (nanos % NANOS_PER_SEC) as libc::c_long,
    }
}
