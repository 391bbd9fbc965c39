// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A static ring buffer for recording kernel trace events.
//!
//! The main constraint is that the entry type must implement [`Copy`] and
//! [`PartialEq`]: repeated identical entries are coalesced into a running
//! count on the most recent slot, rather than each getting their own entry,
//! so a busy loop doesn't evict the history that led up to it.
//!
//! ## Creating a ring buffer
//!
//! ```
//! ringbuf!(u32, 16, 0);
//! ringbuf_entry!(42);
//! ```
//!
//! You can also name the buffer, to keep more than one in scope:
//!
//! ```
//! ringbuf!(MY_TRACE, u32, 16, 0);
//! ringbuf_entry!(MY_TRACE, 42);
//! ```
#![cfg_attr(not(test), no_std)]

pub use static_cell::StaticCell;

/// Declares a ring buffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ring buffer named `NAME`,
/// containing entries of type `Type`, with room for `N` entries, all
/// initialized to `expr`. If you omit the name it defaults to `__RINGBUF`,
/// the common case of one ring buffer per module.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::StaticCell<$crate::Ringbuf<$t, $n>> =
            $crate::StaticCell::new($crate::Ringbuf::new($init));
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

/// Inserts data into a named ring buffer (declared with [`ringbuf!`]).
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let (p, buf) = ($payload, &$buf);
        $crate::RecordEntry::record_entry(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

/// A single recorded entry, carrying an arbitrary payload.
///
/// When an entry is recorded with the same `line` and `payload` as the most
/// recent entry, `count` is incremented instead of evicting another slot.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy> {
    pub line: u16,
    pub generation: u16,
    pub payload: T,
    pub count: u16,
}

/// A ring buffer of parametrized entry type and fixed capacity `N`.
///
/// Instantiating this directly is unusual; see [`ringbuf!`].
#[derive(Debug)]
pub struct Ringbuf<T: Copy, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry { line: 0, generation: 0, payload: init, count: 0 }; N],
        }
    }

    /// Returns the recorded entries, oldest first, starting just after the
    /// most recently written slot (so iteration order matches recording
    /// order once the buffer has wrapped at least once).
    pub fn entries(&self) -> impl Iterator<Item = &RingbufEntry<T>> {
        let start = self.last.map(|l| (l + 1) % N).unwrap_or(0);
        (0..N).map(move |i| &self.buffer[(start + i) % N])
    }
}

/// Abstraction over types that can record a ring buffer entry, so
/// [`ringbuf_entry!`] can dispatch without knowing the concrete buffer type.
pub trait RecordEntry<T: Copy> {
    fn record_entry(&self, line: u16, payload: T);
}

impl<T: Copy + PartialEq, const N: usize> RecordEntry<T> for StaticCell<Ringbuf<T, N>> {
    fn record_entry(&self, line: u16, payload: T) {
        let mut ring = self.borrow_mut();
        let last = ring.last.unwrap_or(usize::MAX);
        if let Some(ent) = ring.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }
        let ndx = {
            let next = last.wrapping_add(1);
            if next >= N { 0 } else { next }
        };
        let ent = &mut ring.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        ring.last = Some(ndx);
    }
}
