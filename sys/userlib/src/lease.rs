// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Borrowed buffers attached to a request, for operations that move a
//! variable amount of data (conduit send/receive/peek).

/// A borrowed buffer lent to the kernel for the duration of one request.
///
/// Unlike a raw pointer-and-length pair, this ties the lease's lifetime to
/// the borrow checker: the buffer cannot be mutated or freed out from under
/// the kernel while a request using it is outstanding.
pub enum Lease<'a> {
    /// The kernel may read this buffer but not write it (e.g. `send`'s
    /// message payload).
    Read(&'a [u8]),
    /// The kernel may write this buffer (e.g. `receive`'s destination).
    Write(&'a mut [u8]),
}

impl<'a> From<&'a [u8]> for Lease<'a> {
    fn from(data: &'a [u8]) -> Self {
        Lease::Read(data)
    }
}

impl<'a> From<&'a mut [u8]> for Lease<'a> {
    fn from(data: &'a mut [u8]) -> Self {
        Lease::Write(data)
    }
}
