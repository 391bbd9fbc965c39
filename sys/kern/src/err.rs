// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`.

use continuum_abi::{ErrorCode, FaultInfo, UsageError};

/// The outcome of a request handler that didn't simply succeed.
///
/// Recoverable errors are reported back to the caller as an [`ErrorCode`]
/// and never change the caller's scheduling state. Faults mark the calling
/// quantum `Faulted` and remove it from scheduling; a request handler
/// returning one never expects to run again before the quantum is restarted.
#[derive(Copy, Clone, Debug)]
pub enum KernelError {
    Recoverable(ErrorCode),
    Fault(FaultInfo),
}

pub type KernelResult<T> = Result<T, KernelError>;

impl From<ErrorCode> for KernelError {
    fn from(e: ErrorCode) -> Self {
        Self::Recoverable(e)
    }
}

impl From<FaultInfo> for KernelError {
    fn from(f: FaultInfo) -> Self {
        Self::Fault(f)
    }
}

impl From<UsageError> for KernelError {
    fn from(e: UsageError) -> Self {
        Self::Fault(e.into())
    }
}

/// A fault that arose in the interaction between two quanta, i.e. during a
/// conduit transfer.
///
/// This can assign fault to either or both sides. By convention an
/// `InteractFault` won't have both fields `None`, though the type system
/// doesn't prevent it.
#[derive(Copy, Clone, Debug)]
pub struct InteractFault {
    /// Fault in the source quantum of a transfer.
    pub src: Option<FaultInfo>,
    /// Fault in the destination quantum of a transfer.
    pub dst: Option<FaultInfo>,
}

impl InteractFault {
    /// Blames the source side.
    pub fn in_src(fi: impl Into<FaultInfo>) -> Self {
        Self { src: Some(fi.into()), dst: None }
    }

    /// Blames the destination side.
    pub fn in_dst(fi: impl Into<FaultInfo>) -> Self {
        Self { src: None, dst: Some(fi.into()) }
    }

    /// Blames both sides.
    pub fn in_both(src: impl Into<FaultInfo>, dst: impl Into<FaultInfo>) -> Self {
        Self { src: Some(src.into()), dst: Some(dst.into()) }
    }
}

/// Conditions that leave the kernel itself unable to continue, as opposed to
/// a single quantum. Reaching one of these always ends in [`crate::fail::die`].
#[derive(Copy, Clone, Debug)]
pub enum FatalReason {
    /// The memory region table for a domain was found to contain
    /// overlapping or unsorted entries.
    CorruptRegionTable,
    /// A page or slab was freed twice.
    DoubleFree,
    /// A reference count underflowed past zero.
    NegativeRefcount,
    /// A scheduler or conduit wait queue referenced a quantum id that was
    /// not actually waiting.
    InconsistentWaitQueue,
    /// An arena slot was indexed with a generation that should have been
    /// impossible to observe.
    ArenaCorruption,
}

impl core::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::CorruptRegionTable => "corrupt region table",
            Self::DoubleFree => "double free",
            Self::NegativeRefcount => "negative refcount",
            Self::InconsistentWaitQueue => "inconsistent wait queue",
            Self::ArenaCorruption => "arena corruption",
        };
        f.write_str(msg)
    }
}

/// Halts the kernel for a named unrecoverable condition.
pub fn die(reason: FatalReason) -> ! {
    crate::fail::die(reason)
}
