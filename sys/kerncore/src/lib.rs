// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

/// Describes types that act as "slices" (in the very abstract sense) referenced
/// by tasks in syscalls.
///
/// This is not the same thing as a Rust slice in the kernel, because this is
/// just a base-length pair --- taken by itself, it doesn't let you actually
/// _access_ the memory.
///
/// # Invariants
///
/// `s.is_empty()` implies `s.base_addr() == s.end_addr()`, and vice versa.
///
/// `s.base_addr() <= s.end_addr()` must hold.
pub trait UserSlice {
    /// Checks whether the slice spans zero bytes. Empty slices are opted out of
    /// access checking to allow task code to use literals like `&[]`.
    ///
    /// This must be consistent with the base/end addr implementations, such
    /// that `is_empty <==> base_addr == end_addr`.
    fn is_empty(&self) -> bool;

    /// The address of the first byte included in this slice.
    ///
    /// The value returned by `base_addr` must be less than or equal to that
    /// returned by `end_addr`.
    fn base_addr(&self) -> usize;

    /// The address of the first byte _not_ included in this slice, past the
    /// end.
    ///
    /// Note that this prevents a slice from touching the end of the address
    /// space. This is also prevented, in practice, by the definition of several
    /// Rust core types, so we accept it.
    ///
    /// The return value must be greater than or equal to the result of
    /// `base_addr`.
    fn end_addr(&self) -> usize;
}

impl<T: UserSlice> UserSlice for &T {
    #[inline(always)]
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Describes types that indicate region permissions.
///
/// This type is _almost_ identical to `UserSlice` but has slightly different
/// operations defined on it. Those operations _do not_ include region
/// attributes, which might be surprising, but we handle those generically using
/// a predicate when required.
///
/// # Invariants
///
/// `r.contains(x)` implies `r.base_addr() <= x < r.end_addr()` and vice versa.
///
/// By extension, `r.base_addr() <= r.end_addr()` must hold.
///
/// An empty region is weird but not impossible.
pub trait MemoryRegion {
    fn contains(&self, addr: usize) -> bool;
    fn base_addr(&self) -> usize;
    fn end_addr(&self) -> usize;
}

impl<T: MemoryRegion> MemoryRegion for &T {
    #[inline(always)]
    fn contains(&self, addr: usize) -> bool {
        (**self).contains(addr)
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Generic version of the kernel slice access checking code.
///
/// The purpose of this routine is to determine whether a task can access some
/// memory. The memory is described by `slice` and consists of a single
/// contiguous region. The task's memory access permissions are described by
/// `table`, which is an array of region descriptors.
///
/// The exact implementation of both the slice type `S` and the region type `R`
/// are left unspecified here, to avoid needing to rely on kernel-internal
/// types. The requirements for each type are specified by [`UserSlice`] and
/// [`MemoryRegion`], respectively.
///
/// Generally speaking, not all task region descriptors confer the same rights
/// --- some are read-only, some may represent an address space hole that cannot
/// be accessed, etc. To reflect this, this routine takes a `region_ok`
/// predicate over the `R` type. Provide a `region_ok` function to do any access
/// permission checking that you require.
///
/// # Preconditions
///
/// `table` must be sorted by region base address, and the regions in the table
/// must not overlap.
///
/// Both `slice` and each element of `table` must meet the properties described
/// on [`UserSlice`] and [`MemoryRegion`], respectively.
///
/// # Returns
///
/// `true` if `slice` is completely covered by one or more regions in `table`
/// that meet the `region_ok` condition.
///
/// `false` otherwise.
pub fn can_access<S, R>(
    slice: S,
    table: &[R],
    region_ok: impl Fn(&R) -> bool,
) -> bool
where
    S: UserSlice,
    R: MemoryRegion,
{
    if slice.is_empty() {
        // We deliberately omit tests for empty slices, as they confer no
        // authority as far as the kernel is concerned. This is pretty
        // important because a literal like `&[]` tends to produce a base
        // address of `0 + sizeof::<T>()`, which is almost certainly invalid
        // according to the task's region map... but fine with us.
        return true;
    }

    // We need to be convinced that this slice is _entirely covered_ by regions
    // with the right attributes. It _may_ span multiple regions, which is
    // important since the build system can insert region boundaries in
    // unpredictable locations in otherwise innocent programs.  But the regions
    // that are spanned must be perfectly contiguous.

    // Per the function's preconditions, the region table is sorted in ascending
    // order of base address, and the regions within it do not overlap. This
    // lets us use a one-pass algorithm.
    let start_addr = slice.base_addr();
    let end_addr = slice.end_addr();

    let mut i = 0;
    for region in table {
        if region.contains(start_addr) {
            // Make sure it's permissible!
            if !region_ok(region) {
                // The start region wasn't permissible, error out.
                return false;
            }

            if end_addr <= region.end_addr() {
                // We've exhausted the slice in this region, we don't have
                // to continue processing.
                return true;
            }

            // We found our start region, it is permissible and does not
            // contain the end address. We should look for the end region
            // starting from the next region over.
            i += 1;
            break;
        }
        if region.base_addr() > end_addr {
            // We've passed our target address without finding regions that
            // work!
            return false;
        }
        // Continue scanning from the next region
        i += 1;
    }

    // Start region was found; now to find the end region.
    for region in &table[i..] {
        if !region_ok(region) {
            // End or intermediate region wasn't permissible, skip to error
            // handling code at the end.
            break;
        }

        if end_addr <= region.end_addr() {
            // The slice ends in this region, the slice was okay.
            return true;
        }
    }

    // We reach this point by exhausting the region table, or finding a
    // region at a higher address than the slice.
    false
}

/// Describes a thing that can be considered for scheduling: a queue slot,
/// ready-to-run or not, with a priority.
///
/// This abstracts over whatever concrete "task" representation a scheduler
/// uses, so the selection algorithm below can be unit tested without any
/// kernel state.
pub trait Schedulable {
    fn is_ready(&self) -> bool;
    /// Numerically larger is more important, matching the kernel-wide
    /// priority convention.
    fn priority(&self) -> u8;
}

/// Scans `table` for the most eligible entry to run next, starting the scan
/// just after `previous` and wrapping around.
///
/// Ties (equal priority) are broken in favor of whichever entry is reached
/// first in the scan, which-since the scan starts at `previous + 1`
/// wrapping-gives equal-priority entries round-robin fairness rather than
/// always re-picking the lowest index.
///
/// # Preconditions
///
/// `table` must be non-empty.
///
/// # Returns
///
/// The index of the selected entry, or `None` if no entry is ready.
pub fn priority_scan<T: Schedulable>(
    table: &[T],
    previous: usize,
) -> Option<usize> {
    let n = table.len();
    if n == 0 {
        return None;
    }

    let mut best: Option<(usize, u8)> = None;
    for offset in 1..=n {
        let i = (previous + offset) % n;
        let candidate = &table[i];
        if !candidate.is_ready() {
            continue;
        }
        let p = candidate.priority();
        match best {
            Some((_, best_p)) if best_p >= p => {}
            _ => best = Some((i, p)),
        }
    }
    best.map(|(i, _)| i)
}
