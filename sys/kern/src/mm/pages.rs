// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical frame pool with copy-on-write refcounting.

use alloc::vec;
use alloc::vec::Vec;

use crate::err::{FatalReason, KernelError};

/// A pool of `count` fixed-size physical frames, each either free or
/// resident with a refcount (>1 once shared by a CoW fork).
pub struct PagePool {
    refcounts: Vec<u16>,
    free: Vec<u32>,
    frame_size: usize,
}

impl PagePool {
    pub fn new(count: u32, frame_size: usize) -> Self {
        Self {
            refcounts: vec![0; count as usize],
            free: (0..count).rev().collect(),
            frame_size,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frame_count(&self) -> u32 {
        self.refcounts.len() as u32
    }

    pub fn frames_free(&self) -> usize {
        self.free.len()
    }

    /// Allocates a fresh frame with refcount 1.
    pub fn alloc(&mut self) -> Result<u32, KernelError> {
        let frame = self.free.pop().ok_or(KernelError::Recoverable(continuum_abi::ErrorCode::OutOfMemory))?;
        self.refcounts[frame as usize] = 1;
        Ok(frame)
    }

    /// Allocates `count` contiguous frames, for a region larger than one
    /// page. A first-fit linear scan over the refcount array (frame 0 is
    /// free iff `refcounts[0] == 0`), matching the pool's modest frame
    /// counts; returns the first frame number of the run.
    pub fn alloc_contiguous(&mut self, count: u32) -> Result<u32, KernelError> {
        if count == 0 {
            return Ok(0);
        }
        let total = self.refcounts.len() as u32;
        if count > total {
            return Err(KernelError::Recoverable(continuum_abi::ErrorCode::OutOfMemory));
        }
        for start in 0..=(total - count) {
            if (start..start + count).all(|f| self.refcounts[f as usize] == 0) {
                for f in start..start + count {
                    self.refcounts[f as usize] = 1;
                    self.free.retain(|&x| x != f);
                }
                return Ok(start);
            }
        }
        Err(KernelError::Recoverable(continuum_abi::ErrorCode::OutOfMemory))
    }

    /// Releases a run of `count` contiguous frames allocated together via
    /// [`Self::alloc_contiguous`].
    pub fn release_contiguous(&mut self, first: u32, count: u32) {
        for f in first..first + count {
            self.release(f);
        }
    }

    /// Bumps a frame's refcount, e.g. when a CoW fork shares it.
    pub fn share(&mut self, frame: u32) {
        let rc = &mut self.refcounts[frame as usize];
        *rc = rc.checked_add(1).unwrap_or_else(|| crate::err::die(FatalReason::NegativeRefcount));
    }

    pub fn refcount(&self, frame: u32) -> u16 {
        self.refcounts[frame as usize]
    }

    /// Drops a reference to `frame`, returning it to the free list once the
    /// refcount reaches zero. Dropping a reference on an already-free frame
    /// is a kernel-internal inconsistency.
    pub fn release(&mut self, frame: u32) {
        let rc = &mut self.refcounts[frame as usize];
        match rc.checked_sub(1) {
            Some(0) => {
                *rc = 0;
                self.free.push(frame);
            }
            Some(n) => *rc = n,
            None => crate::err::die(FatalReason::DoubleFree),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_freed_only_at_zero_refcount() {
        let mut pool = PagePool::new(4, 4096);
        let frame = pool.alloc().unwrap();
        pool.share(frame);
        assert_eq!(pool.refcount(frame), 2);
        pool.release(frame);
        assert_eq!(pool.frames_free(), 0, "still shared, must not be freed");
        pool.release(frame);
        assert_eq!(pool.frames_free(), 1, "last reference dropped, now free");
    }

    #[test]
    fn alloc_fails_once_exhausted() {
        let mut pool = PagePool::new(1, 4096);
        pool.alloc().unwrap();
        assert!(pool.alloc().is_err());
    }

    #[test]
    fn freed_frame_is_reusable() {
        let mut pool = PagePool::new(1, 4096);
        let frame = pool.alloc().unwrap();
        pool.release(frame);
        assert_eq!(pool.alloc().unwrap(), frame);
    }

    #[test]
    fn alloc_contiguous_finds_a_run_around_a_hole() {
        let mut pool = PagePool::new(8, 4096);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let _c = pool.alloc().unwrap();
        pool.release(a);
        pool.release(b);
        // Frames 0,1 are free again but frame 2 is still held, so a run of
        // 3 can't start at 0; it must land after frame 2.
        let run = pool.alloc_contiguous(3).unwrap();
        assert_eq!(run, 3);
        pool.release_contiguous(run, 3);
        assert_eq!(pool.frames_free(), 7);
    }

    #[test]
    fn alloc_contiguous_fails_when_no_run_fits() {
        let mut pool = PagePool::new(4, 4096);
        pool.alloc().unwrap();
        assert!(pool.alloc_contiguous(4).is_err());
    }
}
