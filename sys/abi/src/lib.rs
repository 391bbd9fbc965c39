// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire types shared between the kernel core and quantum-side client code.
//!
//! Nothing in here requires `alloc`; it's data definitions and small
//! conversions only, so both sides of a request can agree on the same types
//! without linking against kernel internals.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, Unaligned};

/// Number of bits of a packed id reserved for the arena index.
pub const ID_INDEX_BITS: u32 = 20;

/// A generation-tagged arena index, shared by [`QuantumId`], [`DomainId`],
/// and [`ConduitId`].
///
/// The low `ID_INDEX_BITS` bits name a slot in the owning arena; the
/// remaining high bits are a generation counter, bumped every time the slot
/// is reused. Looking a slot up under a stale generation is always an error
/// rather than touching freed state, which is the point of the scheme.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RawId(pub u32);

impl RawId {
    pub const INDEX_MASK: u32 = (1 << ID_INDEX_BITS) - 1;

    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        RawId((index as u32 & Self::INDEX_MASK) | (gen.0 << ID_INDEX_BITS))
    }

    pub fn index(&self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    pub fn generation(&self) -> Generation {
        Generation(self.0 >> ID_INDEX_BITS)
    }
}

/// Generation counter embedded in every arena id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Generation(pub u32);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

macro_rules! arena_id {
    ($name:ident) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(pub RawId);

        impl $name {
            pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
                Self(RawId::for_index_and_gen(index, gen))
            }

            pub fn index(&self) -> usize {
                self.0.index()
            }

            pub fn generation(&self) -> Generation {
                self.0.generation()
            }
        }
    };
}

arena_id!(QuantumId);
arena_id!(DomainId);
arena_id!(ConduitId);

/// Reserved id standing in for the kernel itself as a message sender.
pub const KERNEL_QUANTUM: QuantumId =
    QuantumId(RawId(RawId::INDEX_MASK));

/// Scheduling priority. Numerically smaller values are more important, so
/// priority 0 preempts everything else. This deliberately does not implement
/// `PartialOrd`/`Ord`, to avoid ever confusing "greater" with "more
/// important" at a call site.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, Unaligned, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Numerically larger is more important: priority 4 preempts priority 1.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// A quantum's scheduling state, mirroring spec.md's Quantum lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum QuantumState {
    /// Eligible to run, sitting in a ready queue.
    Ready,
    /// Currently assigned to a CPU.
    Running,
    /// Waiting on a blocking operation (named by [`BlockReason`]).
    Blocked(BlockReason),
    /// Stopped by an unrecoverable fault; requires intervention to resume.
    Faulted(FaultInfo),
    /// Not yet started, or torn down.
    Dormant,
}

/// Why a quantum is blocked, used by the scheduler's wait queues.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BlockReason {
    /// Blocked sending into a full conduit.
    ConduitSend(ConduitId),
    /// Blocked receiving from an empty conduit, or a `select` over several.
    ConduitReceive,
    /// Blocked in a CoW page fault awaiting a fresh page.
    PageFault,
    /// Blocked voluntarily until woken or a timeout elapses.
    Sleep,
    /// Blocked in `WaitForQuantum`, waiting for the named quantum to
    /// terminate.
    QuantumExit(QuantumId),
}

/// The closed error taxonomy returned by every component contract in
/// component design section 4. Negative values are reserved so it can be
/// returned across the ABI boundary as a signed response code alongside a
/// non-negative success value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    WouldBlock = -1,
    NotFound = -2,
    PermissionDenied = -3,
    InvalidArgument = -4,
    OutOfMemory = -5,
    QueueFull = -6,
    Closed = -7,
    AlreadyExists = -8,
    Busy = -9,
    Internal = -10,
    /// A `map` request overlaps an existing region.
    Conflict = -11,
    /// No gap of the requested size remains in the domain's address space.
    NoAddressSpace = -12,
    /// A blocking wait ended via explicit cancellation or a timeout deadline,
    /// rather than the event it was waiting for.
    Cancelled = -13,
    /// The dispatcher was asked for a `request_id` outside the known range.
    NoSuchCall = -14,
    /// A payload exceeds `max_message_size`, or a waiting message exceeds
    /// the destination buffer offered to `receive`/`peek`.
    MessageTooLarge = -15,
    /// The component is in an error state and must be reset before use.
    Broken = -16,
}

impl core::convert::TryFrom<i32> for ErrorCode {
    type Error = ();

    fn try_from(x: i32) -> Result<Self, Self::Error> {
        match x {
            -1 => Ok(Self::WouldBlock),
            -2 => Ok(Self::NotFound),
            -3 => Ok(Self::PermissionDenied),
            -4 => Ok(Self::InvalidArgument),
            -5 => Ok(Self::OutOfMemory),
            -6 => Ok(Self::QueueFull),
            -7 => Ok(Self::Closed),
            -8 => Ok(Self::AlreadyExists),
            -9 => Ok(Self::Busy),
            -10 => Ok(Self::Internal),
            -11 => Ok(Self::Conflict),
            -12 => Ok(Self::NoAddressSpace),
            -13 => Ok(Self::Cancelled),
            -14 => Ok(Self::NoSuchCall),
            -15 => Ok(Self::MessageTooLarge),
            -16 => Ok(Self::Broken),
            _ => Err(()),
        }
    }
}

/// A fault that leaves a quantum un-runnable until explicitly restarted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// Access outside of any mapped, permitted region.
    MemoryAccess { address: Option<u32> },
    /// Stack pointer ran off the end of its guarded region.
    StackOverflow { address: u32 },
    /// Division by zero trapped from quantum code.
    DivideByZero,
    /// A syscall's arguments were malformed in a way that can't be blamed on
    /// a recoverable error code (see [`UsageError`]).
    SyscallUsage(UsageError),
    /// The quantum panicked.
    Panic,
    /// Another quantum (or the kernel) injected this fault directly.
    Injected(QuantumId),
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A malformed request from quantum code: distinguished from [`ErrorCode`]
/// because it indicates a defect in the caller rather than a normal runtime
/// condition, and is always promoted to a [`FaultInfo`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UsageError {
    BadRequestNumber,
    InvalidSlice,
    BadQuantumId,
    BadDomainId,
    BadConduitId,
    MissingCapability,
}

/// Numbering for the dispatcher's system requests (component design
/// section 4.E). `TryFrom<u32>` rather than a derive, matching the
/// convention used elsewhere in this ABI for syscall numbering, since these
/// values are part of the wire contract and must never silently renumber.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequestId {
    SpawnQuantum = 0,
    DestroyQuantum = 1,
    Yield = 2,
    Block = 3,
    Unblock = 4,
    CreateDomain = 5,
    DestroyDomain = 6,
    Allocate = 7,
    Free = 8,
    Map = 9,
    Unmap = 10,
    Protect = 11,
    MarkCow = 12,
    Translate = 13,
    CreateConduit = 14,
    OpenConduit = 15,
    CloseConduit = 16,
    Send = 17,
    Receive = 18,
    Peek = 19,
    Broadcast = 20,
    Select = 21,
    SetTimer = 22,
    GetTimer = 23,
    WaitForQuantum = 24,
    QueryTime = 25,
    QueryStats = 26,
}

impl core::convert::TryFrom<u32> for RequestId {
    type Error = UsageError;

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::SpawnQuantum),
            1 => Ok(Self::DestroyQuantum),
            2 => Ok(Self::Yield),
            3 => Ok(Self::Block),
            4 => Ok(Self::Unblock),
            5 => Ok(Self::CreateDomain),
            6 => Ok(Self::DestroyDomain),
            7 => Ok(Self::Allocate),
            8 => Ok(Self::Free),
            9 => Ok(Self::Map),
            10 => Ok(Self::Unmap),
            11 => Ok(Self::Protect),
            12 => Ok(Self::MarkCow),
            13 => Ok(Self::Translate),
            14 => Ok(Self::CreateConduit),
            15 => Ok(Self::OpenConduit),
            16 => Ok(Self::CloseConduit),
            17 => Ok(Self::Send),
            18 => Ok(Self::Receive),
            19 => Ok(Self::Peek),
            20 => Ok(Self::Broadcast),
            21 => Ok(Self::Select),
            22 => Ok(Self::SetTimer),
            23 => Ok(Self::GetTimer),
            24 => Ok(Self::WaitForQuantum),
            25 => Ok(Self::QueryTime),
            26 => Ok(Self::QueryStats),
            _ => Err(UsageError::BadRequestNumber),
        }
    }
}

bitflags::bitflags! {
    /// A quantum's capability set: one bit per [`RequestId`] it is permitted
    /// to invoke. Checked by the dispatcher before any request handler runs.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
    pub struct CapabilitySet: u32 {
        const SPAWN_QUANTUM   = 1 << 0;
        const DESTROY_QUANTUM = 1 << 1;
        const SCHEDULE        = 1 << 2;
        const MEMORY_MANAGE   = 1 << 3;
        const CONDUIT_MANAGE  = 1 << 4;
        const CONDUIT_IO      = 1 << 5;
        const TIMER           = 1 << 6;
        const QUERY           = 1 << 7;

        const ALL = Self::SPAWN_QUANTUM.bits()
            | Self::DESTROY_QUANTUM.bits()
            | Self::SCHEDULE.bits()
            | Self::MEMORY_MANAGE.bits()
            | Self::CONDUIT_MANAGE.bits()
            | Self::CONDUIT_IO.bits()
            | Self::TIMER.bits()
            | Self::QUERY.bits();
    }
}

impl CapabilitySet {
    /// Which capability bit gates a given request.
    pub const fn required_for(req: RequestId) -> Self {
        match req {
            RequestId::SpawnQuantum => Self::SPAWN_QUANTUM,
            RequestId::DestroyQuantum => Self::DESTROY_QUANTUM,
            RequestId::Yield
            | RequestId::Block
            | RequestId::Unblock
            | RequestId::WaitForQuantum => Self::SCHEDULE,
            RequestId::CreateDomain
            | RequestId::DestroyDomain
            | RequestId::Allocate
            | RequestId::Free
            | RequestId::Map
            | RequestId::Unmap
            | RequestId::Protect
            | RequestId::MarkCow
            | RequestId::Translate => Self::MEMORY_MANAGE,
            RequestId::CreateConduit
            | RequestId::OpenConduit
            | RequestId::CloseConduit => Self::CONDUIT_MANAGE,
            RequestId::Send
            | RequestId::Receive
            | RequestId::Peek
            | RequestId::Broadcast
            | RequestId::Select => Self::CONDUIT_IO,
            RequestId::SetTimer | RequestId::GetTimer => Self::TIMER,
            RequestId::QueryTime | RequestId::QueryStats => Self::QUERY,
        }
    }
}

/// Fixed-shape request envelope passed across the dispatcher boundary. Six
/// word-sized parameters is deliberately generous for every request this
/// ABI defines, and keeps the envelope a plain, copyable struct.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, Unaligned)]
#[repr(C)]
pub struct RequestParams(pub [u64; 6]);

/// Memory region protection flags, shared between the quantum-visible API
/// and the memory manager's internal region table.
bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
    pub struct RegionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const COW = 1 << 3;
        /// Request that the pages be zero-filled before `allocate` returns.
        const ZERO = 1 << 4;
        /// Request physically contiguous backing frames.
        const CONTIGUOUS = 1 << 5;
        /// Prefer huge-page-sized backing when the region is large enough.
        const LARGE = 1 << 6;
    }
}

/// Largest conduit name (or broadcast glob pattern) that fits inline in a
/// [`RequestParams`] envelope alongside one more word of caller data (e.g.
/// `create_conduit`'s `capacity`).
pub const MAX_INLINE_NAME: usize = 32;

/// A short name or glob pattern packed into a fixed-size inline buffer so it
/// fits in the six-word request envelope alongside everything else, instead
/// of needing a second lease channel next to the message payload
/// `create`/`open`/`broadcast` already carry. Conduit names in this kernel
/// are short, stable identifiers (akin to the teacher's task names), so a
/// fixed cap is no real limitation. Occupies words 0..5, leaving word 5 free
/// for one more caller-supplied value.
#[derive(Copy, Clone)]
pub struct InlineName {
    bytes: [u8; MAX_INLINE_NAME],
    len: u8,
}

impl InlineName {
    /// Truncates to [`MAX_INLINE_NAME`] bytes if `name` is longer.
    pub fn new(name: &str) -> Self {
        let src = name.as_bytes();
        let len = src.len().min(MAX_INLINE_NAME);
        let mut bytes = [0u8; MAX_INLINE_NAME];
        bytes[..len].copy_from_slice(&src[..len]);
        Self { bytes, len: len as u8 }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    /// Packs into word 0 (length) and words 1..5 (up to 32 bytes of UTF-8),
    /// leaving word 5 of the returned envelope at its default (zero) for the
    /// caller to overwrite with one more value.
    pub fn to_params(self) -> RequestParams {
        let mut p = RequestParams::default();
        p.0[0] = self.len as u64;
        for (word, chunk) in p.0[1..5].iter_mut().zip(self.bytes.chunks_exact(8)) {
            *word = u64::from_le_bytes(chunk.try_into().expect("chunks_exact(8)"));
        }
        p
    }

    pub fn from_params(params: &RequestParams) -> Self {
        let len = (params.0[0] as usize).min(MAX_INLINE_NAME) as u8;
        let mut bytes = [0u8; MAX_INLINE_NAME];
        for (word, chunk) in params.0[1..5].iter().zip(bytes.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self { bytes, len }
    }
}

pub const MAX_QUANTUM_NAME: usize = 16;

/// A quantum's human-readable name. Smaller than [`InlineName`] (3 words
/// instead of 5) since `SpawnQuantum` only has four free words left in its
/// envelope after the domain and priority arguments.
#[derive(Copy, Clone, Debug, Default)]
pub struct QuantumName {
    bytes: [u8; MAX_QUANTUM_NAME],
    len: u8,
}

impl QuantumName {
    pub fn new(name: &str) -> Self {
        let src = name.as_bytes();
        let len = src.len().min(MAX_QUANTUM_NAME);
        let mut bytes = [0u8; MAX_QUANTUM_NAME];
        bytes[..len].copy_from_slice(&src[..len]);
        Self { bytes, len: len as u8 }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    /// Packs into 3 words: length, then 16 bytes of UTF-8.
    pub fn to_words(self) -> [u64; 3] {
        let mut words = [0u64; 3];
        words[0] = self.len as u64;
        for (word, chunk) in words[1..3].iter_mut().zip(self.bytes.chunks_exact(8)) {
            *word = u64::from_le_bytes(chunk.try_into().expect("chunks_exact(8)"));
        }
        words
    }

    pub fn from_words(words: &[u64]) -> Self {
        let len = (words[0] as usize).min(MAX_QUANTUM_NAME) as u8;
        let mut bytes = [0u8; MAX_QUANTUM_NAME];
        for (word, chunk) in words[1..3].iter().zip(bytes.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self { bytes, len }
    }
}

/// Architecture-specific CPU register snapshot. Opaque to every subsystem
/// but the (absent in this core) trap trampoline that would save and
/// restore it; the scheduler only ever moves it around, never reads it.
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuContext(pub [u64; 16]);

/// Per-quantum counters, queried via `QueryStats`. Distinct from
/// [`crate`]-wide aggregate counters: these track one quantum's own history.
#[derive(Copy, Clone, Debug, Default)]
pub struct QuantumStats {
    pub creation_time: u64,
    pub cpu_time: u64,
    pub context_switches: u32,
    pub page_faults: u32,
    pub system_requests: u32,
}
