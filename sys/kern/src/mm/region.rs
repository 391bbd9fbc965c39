// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A domain's region table: an ordered, non-overlapping set of mappings.
//!
//! The "does this access fall inside a permitted region" predicate is
//! `continuum_kerncore::can_access`, the same generic algorithm the teacher
//! runs over its build-time-fixed `RegionDesc` table
//! (`sys/kern/src/app.rs`'s `RegionDescExt::covers`), here run over a table
//! that's mutated at run time by `map`/`unmap`/`protect`/CoW forking instead
//! of baked in at link time.

use alloc::vec::Vec;
use continuum_abi::RegionFlags;
use continuum_kerncore::MemoryRegion;

/// A single mapped range within a domain's address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub base: u32,
    pub size: u32,
    pub flags: RegionFlags,
    /// The first physical frame backing this region. `None` for regions
    /// with no current backing (e.g. a reserved-but-unallocated hole).
    pub backing_frame: Option<u32>,
    /// Number of contiguous frames starting at `backing_frame`, for regions
    /// larger than one page. Meaningless when `backing_frame` is `None`.
    pub frame_count: u32,
    /// Set for regions installed by `map` over caller-supplied physical
    /// memory (e.g. MMIO), rather than pool frames. `backing_frame` and
    /// `frame_count` are unused for these; `free`/`destroy_domain` never
    /// hand this physical range back to the frame pool.
    pub external_paddr: Option<u32>,
}

impl Region {
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

impl MemoryRegion for Region {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base as usize && addr < self.end() as usize
    }

    fn base_addr(&self) -> usize {
        self.base as usize
    }

    fn end_addr(&self) -> usize {
        self.end() as usize
    }
}

/// An access span within a domain's address space, implementing
/// `continuum_kerncore::UserSlice`.
pub struct AccessSpan {
    pub base: u32,
    pub size: u32,
}

impl continuum_kerncore::UserSlice for AccessSpan {
    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn base_addr(&self) -> usize {
        self.base as usize
    }

    fn end_addr(&self) -> usize {
        (self.base + self.size) as usize
    }
}

/// Ordered, non-overlapping region table for one domain.
#[derive(Default, Debug)]
pub struct RegionTable {
    regions: Vec<Region>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self { regions: Vec::new() }
    }

    pub fn as_slice(&self) -> &[Region] {
        &self.regions
    }

    /// Inserts a new region, keeping the table sorted by base address.
    /// Fails if the new region overlaps an existing one.
    pub fn insert(&mut self, region: Region) -> Result<(), ()> {
        if self.regions.iter().any(|r| r.overlaps(&region)) {
            return Err(());
        }
        let pos = self.regions.partition_point(|r| r.base < region.base);
        self.regions.insert(pos, region);
        Ok(())
    }

    /// Removes the region with the given base address, if any.
    pub fn remove(&mut self, base: u32) -> Option<Region> {
        let pos = self.regions.iter().position(|r| r.base == base)?;
        Some(self.regions.remove(pos))
    }

    /// Finds the region containing `addr`, if any.
    pub fn find(&mut self, addr: u32) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.contains(addr as usize))
    }

    /// True iff `base..base+size` is fully covered by one or more regions
    /// each satisfying `region_ok`.
    pub fn can_access(&self, base: u32, size: u32, region_ok: impl Fn(&Region) -> bool) -> bool {
        continuum_kerncore::can_access(AccessSpan { base, size }, &self.regions, region_ok)
    }

    /// First-fit, address-ordered search for a gap of at least `size` bytes
    /// below `limit`, per spec.md §4.B's `allocate` policy. Considers the
    /// space before the first region, between consecutive regions, and
    /// after the last one.
    pub fn find_free_gap(&self, size: u32, limit: u32) -> Option<u32> {
        let mut cursor = 0u32;
        for region in &self.regions {
            if region.base.saturating_sub(cursor) >= size {
                return Some(cursor);
            }
            cursor = cursor.max(region.end());
        }
        if limit.saturating_sub(cursor) >= size {
            Some(cursor)
        } else {
            None
        }
    }
}
