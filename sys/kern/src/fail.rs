// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel failures such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `continuum_kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is false
//!   until the kernel reaches [`die`] (either explicitly or via a `panic!`).
//!
//! - `continuum_kern::fail::KERNEL_EPITAPH` is a fixed-size `[u8]` buffer.
//!   `die` writes as much of the failure reason into it (as UTF-8) as
//!   possible, truncating if the buffer fills. Trim trailing NULs when
//!   printing it.

use core::fmt::{Display, Write};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Flag that gets set to `true` by all failure reporting functions, giving
/// tools a one-stop-shop for doing kernel triage.
#[used]
static KERNEL_HAS_FAILED: AtomicBool = AtomicBool::new(false);

const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes describing the
/// event that caused the kernel to fail, padded with NULs.
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Snapshot of uptime and live quantum count, refreshed by the scheduler on
/// every tick so that a fatal failure can report "how far we got" even
/// though the panic handler itself has no access to kernel state.
static LAST_KNOWN_UPTIME_TICKS: AtomicU64 = AtomicU64::new(0);
static LAST_KNOWN_QUANTUM_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Called by the scheduler each tick so a later fatal failure can report
/// approximately how long the kernel had been running.
pub fn record_snapshot(uptime_ticks: u64, quantum_count: usize) {
    LAST_KNOWN_UPTIME_TICKS.store(uptime_ticks, Ordering::Relaxed);
    LAST_KNOWN_QUANTUM_COUNT.store(quantum_count, Ordering::Relaxed);
}

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    let previous_fail = KERNEL_HAS_FAILED.swap(true, Ordering::SeqCst);
    if previous_fail {
        // A recursive failure. Don't try to report it, we'd likely just make
        // things worse; spin instead so a debugger can inspect the original
        // epitaph untouched.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: `KERNEL_HAS_FAILED`'s compare-and-swap above ensures exactly one
    // caller reaches this point, so handing out `&mut` here can't alias.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Halts the kernel forever after recording `msg` in the epitaph buffer.
///
/// This is the terminal point for every invariant violation named in the
/// error taxonomy's hard-failure column (double free, corrupted region
/// table, negative refcount, inconsistent wait queue).
#[inline(never)]
pub fn die(msg: impl Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    let uptime = LAST_KNOWN_UPTIME_TICKS.load(Ordering::Relaxed);
    let quanta = LAST_KNOWN_QUANTUM_COUNT.load(Ordering::Relaxed);
    write!(writer, "{msg} (uptime={uptime} quanta={quanta})").ok();

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

// `std` supplies its own panic handler for test binaries; only install ours
// when building for the real (no_std) target.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_snapshot_updates_atomics() {
        record_snapshot(42, 7);
        assert_eq!(LAST_KNOWN_UPTIME_TICKS.load(Ordering::Relaxed), 42);
        assert_eq!(LAST_KNOWN_QUANTUM_COUNT.load(Ordering::Relaxed), 7);
    }
}
