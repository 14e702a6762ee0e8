// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process signalling for worker aborts.

/// Send SIGINT; the worker observes it at its next suspension point.
#[cfg(unix)]
pub fn interrupt(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGINT);
    }
}

/// Send SIGKILL after the grace window expires.
#[cfg(unix)]
pub fn kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn interrupt(_pid: u32) {}

#[cfg(not(unix))]
pub fn kill(_pid: u32) {}
