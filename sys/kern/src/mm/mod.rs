// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Memory Manager: domains, regions, physical frames, and
//! copy-on-write forking.

pub mod domain;
pub mod fault;
pub mod pages;
pub mod region;
pub mod slab;

use continuum_abi::{DomainId, ErrorCode, RegionFlags};
use continuum_kerncore::MemoryRegion;

use crate::config::KernelConfig;
use crate::err::KernelError;
use domain::DomainTable;
use pages::PagePool;
use region::Region;

pub struct MemoryManager {
    domains: DomainTable,
    pages: PagePool,
    max_domains: usize,
    /// Exclusive upper bound of the address space `allocate` scans for a
    /// free gap, per domain.
    address_limit: u32,
}

impl MemoryManager {
    pub fn new(config: &KernelConfig, frame_count: u32) -> Self {
        Self {
            domains: DomainTable::new(),
            pages: PagePool::new(frame_count, config.page_size),
            max_domains: config.max_domains,
            address_limit: frame_count * config.page_size as u32,
        }
    }

    pub fn frame_count(&self) -> u32 {
        self.pages.frame_count()
    }

    pub fn create_domain(&mut self) -> Result<DomainId, KernelError> {
        self.domains
            .create(self.max_domains)
            .map_err(|_| KernelError::Recoverable(ErrorCode::OutOfMemory))
    }

    pub fn destroy_domain(&mut self, id: DomainId) -> Result<(), KernelError> {
        let domain = self
            .domains
            .destroy(id)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        for region in domain.regions.as_slice() {
            if let Some(frame) = region.backing_frame {
                self.pages.release_contiguous(frame, region.frame_count.max(1));
            }
        }
        Ok(())
    }

    /// Scans `domain`'s address space for a free gap of `size` bytes
    /// (first-fit, address-ordered), backs it with freshly allocated
    /// contiguous frames, and returns the chosen base. The kernel picks the
    /// address; callers never supply one.
    pub fn allocate(&mut self, domain: DomainId, size: u32, flags: RegionFlags) -> Result<u32, KernelError> {
        let page_size = self.pages.frame_size() as u32;
        let frame_count = size.div_ceil(page_size).max(1);
        let rounded_size = frame_count * page_size;

        let d = self
            .domains
            .get_mut(domain)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        let base = d
            .regions
            .find_free_gap(rounded_size, self.address_limit)
            .ok_or(KernelError::Recoverable(ErrorCode::NoAddressSpace))?;

        let frame = self.pages.alloc_contiguous(frame_count)?;
        let region = Region { base, size: rounded_size, flags, backing_frame: Some(frame), frame_count, external_paddr: None };
        if d.regions.insert(region).is_err() {
            self.pages.release_contiguous(frame, frame_count);
            return Err(KernelError::Recoverable(ErrorCode::AlreadyExists));
        }
        Ok(base)
    }

    pub fn free(&mut self, domain: DomainId, base: u32) -> Result<(), KernelError> {
        let d = self
            .domains
            .get_mut(domain)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        let region = d
            .regions
            .remove(base)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        if let Some(frame) = region.backing_frame {
            self.pages.release_contiguous(frame, region.frame_count.max(1));
        }
        Ok(())
    }

    /// Installs a fixed mapping from `vaddr` to caller-supplied `paddr`, for
    /// drivers exposing MMIO. Unlike `allocate`, the physical address is
    /// caller-chosen and never comes from (or returns to) the frame pool.
    pub fn map(&mut self, domain: DomainId, vaddr: u32, paddr: u32, size: u32, flags: RegionFlags) -> Result<(), KernelError> {
        let d = self
            .domains
            .get_mut(domain)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        let region = Region {
            base: vaddr,
            size,
            flags,
            backing_frame: None,
            frame_count: 0,
            external_paddr: Some(paddr),
        };
        d.regions
            .insert(region)
            .map_err(|_| KernelError::Recoverable(ErrorCode::Conflict))
    }

    /// Removes a mapping installed by `map`. Physical memory is left alone:
    /// it was never pool-owned.
    pub fn unmap(&mut self, domain: DomainId, vaddr: u32) -> Result<(), KernelError> {
        let d = self
            .domains
            .get_mut(domain)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        d.regions
            .remove(vaddr)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        Ok(())
    }

    pub fn protect(&mut self, domain: DomainId, base: u32, flags: RegionFlags) -> Result<(), KernelError> {
        let d = self
            .domains
            .get_mut(domain)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        let region = d
            .regions
            .find(base)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        region.flags = flags;
        Ok(())
    }

    /// Write-protects the region at `vaddr` in `domain` and tags it CoW: the
    /// next write through it faults into [`Self::handle_cow_fault`], which
    /// makes a private copy. `size` must match the whole region exactly;
    /// there's no support for CoW-protecting part of a region.
    pub fn mark_cow(&mut self, domain: DomainId, vaddr: u32, size: u32) -> Result<(), KernelError> {
        let d = self
            .domains
            .get_mut(domain)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        let region = d
            .regions
            .find(vaddr)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        if region.size != size {
            return Err(KernelError::Recoverable(ErrorCode::InvalidArgument));
        }
        region.flags.insert(RegionFlags::COW);
        region.flags.remove(RegionFlags::WRITE);
        Ok(())
    }

    /// Shares `domain`'s region at `vaddr` into `into`, at the same
    /// virtual address, bumping every backing frame's refcount. Used to set
    /// up the sharer's side of a CoW fork once the source side has already
    /// been through [`Self::mark_cow`].
    pub(crate) fn share_region(&mut self, domain: DomainId, vaddr: u32, into: DomainId) -> Result<(), KernelError> {
        let src_region = *self
            .domains
            .get_mut(domain)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?
            .regions
            .find(vaddr)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        let frame = src_region
            .backing_frame
            .ok_or(KernelError::Recoverable(ErrorCode::InvalidArgument))?;
        let count = src_region.frame_count.max(1);
        for f in frame..frame + count {
            self.pages.share(f);
        }
        let dst = self
            .domains
            .get_mut(into)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        dst.regions
            .insert(src_region)
            .map_err(|_| KernelError::Recoverable(ErrorCode::AlreadyExists))
    }

    pub fn handle_cow_fault(&mut self, domain: DomainId, addr: u32) -> Result<(), KernelError> {
        let d = self
            .domains
            .get_mut(domain)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        fault::handle_cow_fault(d, &mut self.pages, addr)
    }

    pub fn translate(&self, domain: DomainId, addr: u32) -> Result<u32, KernelError> {
        let d = self
            .domains
            .get(domain)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        let region = d
            .regions
            .as_slice()
            .iter()
            .find(|r| r.contains(addr as usize))
            .ok_or(KernelError::Recoverable(ErrorCode::InvalidArgument))?;

        if let Some(paddr) = region.external_paddr {
            return Ok(paddr + (addr - region.base));
        }

        let first_frame = region
            .backing_frame
            .ok_or(KernelError::Recoverable(ErrorCode::InvalidArgument))?;
        let frame_size = self.pages.frame_size() as u32;
        let frame = first_frame + (addr - region.base) / frame_size;
        let offset = addr % frame_size;
        Ok(frame * frame_size + offset)
    }

    /// No-op on every target this kernel runs on in this form: page table
    /// changes here are reflected immediately since there's no separate
    /// hardware walker to invalidate. Kept as an explicit operation so
    /// callers don't need to know that.
    pub fn flush_tlb(&mut self, _domain: DomainId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mm() -> MemoryManager {
        MemoryManager::new(&KernelConfig::default(), 8)
    }

    #[test]
    fn map_installs_a_fixed_mmio_mapping_without_touching_the_frame_pool() {
        let mut mm = mm();
        let domain = mm.create_domain().unwrap();
        mm.map(domain, 0x4000_0000, 0xE000_0000, 0x1000, RegionFlags::READ | RegionFlags::WRITE).unwrap();
        assert_eq!(mm.pages.frames_free(), 8, "MMIO mapping must not consume pool frames");
        assert_eq!(mm.translate(domain, 0x4000_0010).unwrap(), 0xE000_0010);
        mm.unmap(domain, 0x4000_0000).unwrap();
        assert_eq!(mm.pages.frames_free(), 8, "unmap must not release anything to the pool");
    }

    #[test]
    fn map_rejects_overlap_with_an_existing_region() {
        let mut mm = mm();
        let domain = mm.create_domain().unwrap();
        let base = mm.allocate(domain, 4096, RegionFlags::READ).unwrap();
        let err = mm.map(domain, base, 0xE000_0000, 4096, RegionFlags::READ).unwrap_err();
        assert!(matches!(err, KernelError::Recoverable(ErrorCode::Conflict)));
    }

    #[test]
    fn allocate_then_free_returns_frame_to_pool() {
        let mut mm = mm();
        let domain = mm.create_domain().unwrap();
        let base = mm.allocate(domain, 4096, RegionFlags::READ | RegionFlags::WRITE).unwrap();
        assert_eq!(base, 0);
        assert_eq!(mm.pages.frames_free(), 7);
        mm.free(domain, base).unwrap();
        assert_eq!(mm.pages.frames_free(), 8);
    }

    #[test]
    fn allocate_rounds_up_to_a_whole_number_of_frames() {
        let mut mm = mm();
        let domain = mm.create_domain().unwrap();
        let base = mm.allocate(domain, 4097, RegionFlags::READ).unwrap();
        assert_eq!(mm.pages.frames_free(), 6, "4097 bytes needs 2 frames");
        mm.free(domain, base).unwrap();
        assert_eq!(mm.pages.frames_free(), 8);
    }

    #[test]
    fn mark_cow_write_protects_and_tags_the_region() {
        let mut mm = mm();
        let domain = mm.create_domain().unwrap();
        let base = mm.allocate(domain, 4096, RegionFlags::READ | RegionFlags::WRITE).unwrap();
        mm.mark_cow(domain, base, 4096).unwrap();
        let region = &mm.domains.get(domain).unwrap().regions.as_slice()[0];
        assert!(region.flags.contains(RegionFlags::COW));
        assert!(!region.flags.contains(RegionFlags::WRITE));
    }

    #[test]
    fn mark_cow_rejects_a_size_that_does_not_match_the_region() {
        let mut mm = mm();
        let domain = mm.create_domain().unwrap();
        let base = mm.allocate(domain, 4096, RegionFlags::READ | RegionFlags::WRITE).unwrap();
        let err = mm.mark_cow(domain, base, 8192).unwrap_err();
        assert!(matches!(err, KernelError::Recoverable(ErrorCode::InvalidArgument)));
    }

    #[test]
    fn share_region_shares_every_frame_between_domains() {
        let mut mm = mm();
        let a = mm.create_domain().unwrap();
        let b = mm.create_domain().unwrap();
        let base = mm.allocate(a, 4096, RegionFlags::READ | RegionFlags::WRITE).unwrap();
        mm.mark_cow(a, base, 4096).unwrap();
        mm.share_region(a, base, b).unwrap();
        let frame_a = mm.domains.get(a).unwrap().regions.as_slice()[0].backing_frame.unwrap();
        let frame_b = mm.domains.get(b).unwrap().regions.as_slice()[0].backing_frame.unwrap();
        assert_eq!(frame_a, frame_b);
        assert_eq!(mm.pages.refcount(frame_a), 2);
    }

    #[test]
    fn destroy_domain_releases_all_its_frames() {
        let mut mm = mm();
        let domain = mm.create_domain().unwrap();
        mm.allocate(domain, 4096, RegionFlags::READ).unwrap();
        mm.allocate(domain, 4096, RegionFlags::READ).unwrap();
        mm.destroy_domain(domain).unwrap();
        assert_eq!(mm.pages.frames_free(), 8);
    }
}
