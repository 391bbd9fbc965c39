// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot handoff: validating what firmware/bootloader passes in and turning
//! it into a running [`crate::Kernel`].
//!
//! Grounded on the teacher's `App` header (`sys/abi/src/lib.rs`), whose
//! `magic` field the kernel checks before trusting anything else in the
//! struct (`CURRENT_APP_MAGIC`). `BootContext` plays the same gatekeeping
//! role for the memory map a loader hands the kernel instead of the
//! teacher's flash-resident task/region descriptor arrays — this kernel has
//! no `arch` layer to walk an MPU region table, so RAM extent comes from the
//! memory map directly.

use alloc::vec::Vec;

use crate::config::KernelConfig;
use crate::err::FatalReason;
use crate::Kernel;

/// Fixed validation value every [`BootContext`] must carry. Arbitrary but
/// stable across a release, same role as the teacher's `CURRENT_APP_MAGIC`.
pub const BOOT_MAGIC: u64 = 0x434f_4e54_494e_5545; // "CONTINUE" in ASCII, as a sanity stamp

/// What kind of memory a [`MemoryMapEntry`] describes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    Usable,
    Reserved,
    Reclaimable,
}

/// One record in the boot memory map: a contiguous byte range and what it's
/// for. Mirrors the `{base, length, type}` triples a loader hands off in
/// firmware environments this kernel's teacher targets.
#[derive(Copy, Clone, Debug)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

/// Opaque platform-specific boot mode, passed through unexamined by the
/// core (per spec.md §6.1: "Boot mode (opaque)").
#[derive(Copy, Clone, Debug, Default)]
pub struct BootMode(pub u32);

/// The record a bootloader hands the kernel at entry.
pub struct BootContext {
    pub magic: u64,
    pub mode: BootMode,
    pub memory_map: Vec<MemoryMapEntry>,
}

impl BootContext {
    /// Total usable RAM across every [`MemoryKind::Usable`] entry, in bytes.
    pub fn usable_bytes(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|e| e.kind == MemoryKind::Usable)
            .map(|e| e.length)
            .sum()
    }
}

impl PartialEq for MemoryKind {
    fn eq(&self, other: &Self) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }
}
impl Eq for MemoryKind {}

/// Validates `ctx` and builds a [`Kernel`] sized to its usable RAM. A bad
/// magic number is the one boot-time condition spec.md calls out as a halt
/// rather than a recoverable error: there is no sensible degraded mode for
/// "the loader handed us garbage."
pub fn start_kernel(ctx: &BootContext, config: &KernelConfig) -> Kernel {
    if ctx.magic != BOOT_MAGIC {
        crate::err::die(FatalReason::ArenaCorruption);
    }
    let frame_count = (ctx.usable_bytes() / config.page_size as u64) as u32;
    Kernel::new(config, frame_count)
}
