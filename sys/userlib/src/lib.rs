// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Quantum-side client library for talking to the kernel's system-request
//! dispatcher.
//!
//! Unlike an architecture-specific syscall stub, this crate never assumes a
//! particular trap mechanism. Quantum code is handed a [`SyscallTransport`]
//! at startup (a thin adapter over whatever the host actually uses to reach
//! the kernel: a trap instruction on real hardware, or an in-process call
//! into `continuum-kern` under test), and every operation in this crate is
//! built as a safe wrapper over that trait. This keeps the client testable
//! on the host, which is how it's exercised here.

#![cfg_attr(not(test), no_std)]

use continuum_abi::{ConduitId, DomainId, ErrorCode, QuantumId, RequestParams};

pub mod client;
pub mod lease;

pub use client::{Client, SyscallTransport};
pub use lease::Lease;

/// Re-exported so callers don't need to depend on `continuum-abi` directly
/// for the common wire types.
pub mod abi {
    pub use continuum_abi::*;
}

/// Result type returned by every client operation.
pub type RequestResult<T> = Result<T, ErrorCode>;

/// A quantum-visible handle to a memory domain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Domain(pub DomainId);

/// A quantum-visible handle to an open conduit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Conduit(pub ConduitId);

/// A quantum-visible handle to another quantum, e.g. for `unblock`/`broadcast`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Peer(pub QuantumId);

pub(crate) fn request_u64(value: u64) -> RequestParams {
    let mut p = RequestParams::default();
    p.0[0] = value;
    p
}

pub(crate) fn decode_error(code: i64) -> ErrorCode {
    use core::convert::TryFrom;
    ErrorCode::try_from(code as i32).unwrap_or(ErrorCode::Internal)
}
