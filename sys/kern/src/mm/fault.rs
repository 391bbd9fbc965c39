// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Copy-on-write fault handling: the only path that ever mutates a shared
//! frame's identity after a CoW fork.

use continuum_abi::{ErrorCode, RegionFlags};

use crate::err::KernelError;
use crate::mm::domain::Domain;
use crate::mm::pages::PagePool;

/// Handles a write fault at `addr` in `domain`.
///
/// If the faulting region is marked copy-on-write:
/// - and this domain holds the only reference to every frame backing the
///   region, the fault is resolved in place by simply granting write access
///   (no other domain can be affected by letting this write proceed);
/// - otherwise a fresh run of frames is allocated, the old frames' contents
///   are copied into it (modeled here as a size-preserving copy; callers own
///   the actual byte copy), and the domain's region is rebound to the new
///   run with write access restored.
///
/// CoW is resolved at whole-region granularity: a region spanning several
/// frames is copied in full on the first write fault anywhere inside it,
/// rather than page by page. Regions created by `allocate` are already
/// frame-aligned, so this matches typical fork-then-write-one-page behavior
/// at the cost of copying the whole region instead of just the faulting
/// page.
///
/// Returns `Err` if the address isn't inside any region, or isn't marked
/// CoW (a write fault against a plain read-only region is a genuine
/// permission fault, not something to resolve here).
pub fn handle_cow_fault(domain: &mut Domain, pool: &mut PagePool, addr: u32) -> Result<(), KernelError> {
    let region = domain
        .regions
        .find(addr)
        .ok_or(KernelError::Recoverable(ErrorCode::InvalidArgument))?;

    if !region.flags.contains(RegionFlags::COW) {
        return Err(KernelError::Recoverable(ErrorCode::PermissionDenied));
    }

    let old_frame = region
        .backing_frame
        .ok_or(KernelError::Recoverable(ErrorCode::InvalidArgument))?;
    let count = region.frame_count.max(1);

    let shared = (old_frame..old_frame + count).any(|f| pool.refcount(f) > 1);
    if !shared {
        region.flags.remove(RegionFlags::COW);
        region.flags.insert(RegionFlags::WRITE);
        return Ok(());
    }

    let new_frame = pool.alloc_contiguous(count)?;
    pool.release_contiguous(old_frame, count);
    region.backing_frame = Some(new_frame);
    region.flags.remove(RegionFlags::COW);
    region.flags.insert(RegionFlags::WRITE);
    Ok(())
}
