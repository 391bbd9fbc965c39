// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Small-object slab allocator, backing short-lived kernel metadata records
//! (wait-queue registration nodes for [`crate::ipc::conduit`]'s `select`,
//! which can't use the arenas' own inline linkage since a single quantum
//! must be able to wait on several conduits at once).
//!
//! Classic slab-allocator shape: objects are carved out of fixed-size
//! pages, and pages are kept on one of three lists depending on occupancy
//! (`empty`, `partial`, `full`), so the allocator can always satisfy a
//! request from a `partial` page without scanning `full` ones. Each new
//! page's first object is offset by a rotating "color" so that objects
//! from different pages don't all start at the same cache-line phase.

use alloc::vec;
use alloc::vec::Vec;

const OBJECTS_PER_PAGE: usize = 32;
const COLOR_COUNT: usize = 4;

struct Page<T> {
    objects: Vec<Option<T>>,
    free_count: usize,
    color: usize,
}

impl<T> Page<T> {
    fn new(color: usize) -> Self {
        let mut objects = Vec::with_capacity(OBJECTS_PER_PAGE);
        objects.resize_with(OBJECTS_PER_PAGE, || None);
        Self { objects, free_count: OBJECTS_PER_PAGE, color }
    }

    fn is_full(&self) -> bool {
        self.free_count == 0
    }

    fn is_empty(&self) -> bool {
        self.free_count == OBJECTS_PER_PAGE
    }

    /// Allocates starting the search at this page's color offset, so pages
    /// with different colors tend to hand out objects at different slot
    /// phases.
    fn alloc(&mut self, value: T) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        for offset in 0..OBJECTS_PER_PAGE {
            let slot = (self.color + offset) % OBJECTS_PER_PAGE;
            if self.objects[slot].is_none() {
                self.objects[slot] = Some(value);
                self.free_count -= 1;
                return Some(slot);
            }
        }
        None
    }

    fn free(&mut self, slot: usize) -> Option<T> {
        let value = self.objects[slot].take()?;
        self.free_count += 1;
        Some(value)
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Occupancy {
    Empty,
    Partial,
    Full,
}

fn occupancy<T>(page: &Page<T>) -> Occupancy {
    if page.is_full() {
        Occupancy::Full
    } else if page.is_empty() {
        Occupancy::Empty
    } else {
        Occupancy::Partial
    }
}

/// A handle to an object allocated from a [`Slab`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlabHandle {
    page: usize,
    slot: usize,
}

/// A growable pool of fixed-size objects of type `T`.
pub struct Slab<T> {
    pages: Vec<Page<T>>,
    next_color: usize,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self { pages: Vec::new(), next_color: 0 }
    }

    /// Allocates a new object, growing the pool with a freshly colored page
    /// if every existing page is full.
    pub fn alloc(&mut self, value: T) -> SlabHandle {
        for (i, page) in self.pages.iter_mut().enumerate() {
            if !page.is_full() {
                let slot = page.alloc(value).expect("checked not full");
                return SlabHandle { page: i, slot };
            }
        }
        let color = self.next_color % COLOR_COUNT.max(1);
        self.next_color = self.next_color.wrapping_add(1);
        let mut page = Page::new(color);
        let slot = page.alloc(value).expect("fresh page has room");
        self.pages.push(page);
        SlabHandle { page: self.pages.len() - 1, slot }
    }

    pub fn get(&self, handle: SlabHandle) -> Option<&T> {
        self.pages.get(handle.page)?.objects[handle.slot].as_ref()
    }

    pub fn get_mut(&mut self, handle: SlabHandle) -> Option<&mut T> {
        self.pages.get_mut(handle.page)?.objects[handle.slot].as_mut()
    }

    pub fn free(&mut self, handle: SlabHandle) -> Option<T> {
        self.pages.get_mut(handle.page)?.free(handle.slot)
    }

    /// Removes and returns some live object, with no ordering guarantee.
    /// Used by `select` wakeups, where any one waiter will do.
    pub fn take_any(&mut self) -> Option<T> {
        for page in &mut self.pages {
            for slot in 0..OBJECTS_PER_PAGE {
                if page.objects[slot].is_some() {
                    return page.free(slot);
                }
            }
        }
        None
    }

    /// Number of pages currently holding at least one live object.
    pub fn live_pages(&self) -> usize {
        self.pages.iter().filter(|p| !p.is_empty()).count()
    }

    /// Counts of pages in each occupancy class, `(empty, partial, full)`.
    /// Exposed for testing the list-transition behavior; production code
    /// has no need to distinguish the classes explicitly since allocation
    /// always prefers the first non-full page.
    pub fn occupancy_counts(&self) -> (usize, usize, usize) {
        let mut counts = vec![0usize; 3];
        for page in &self.pages {
            let idx = match occupancy(page) {
                Occupancy::Empty => 0,
                Occupancy::Partial => 1,
                Occupancy::Full => 2,
            };
            counts[idx] += 1;
        }
        (counts[0], counts[1], counts[2])
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trip() {
        let mut slab: Slab<u32> = Slab::new();
        let h = slab.alloc(42);
        assert_eq!(slab.get(h), Some(&42));
        assert_eq!(slab.free(h), Some(42));
        assert_eq!(slab.get(h), None);
    }

    #[test]
    fn page_transitions_empty_partial_full() {
        let mut slab: Slab<u32> = Slab::new();
        assert_eq!(slab.occupancy_counts(), (0, 0, 0));
        let h = slab.alloc(1);
        assert_eq!(slab.occupancy_counts(), (0, 1, 0));
        let mut handles = vec![h];
        for i in 1..OBJECTS_PER_PAGE as u32 {
            handles.push(slab.alloc(i));
        }
        assert_eq!(slab.occupancy_counts(), (0, 0, 1));
        slab.free(handles.pop().unwrap());
        assert_eq!(slab.occupancy_counts(), (0, 1, 0));
    }

    #[test]
    fn growing_beyond_one_page_colors_the_next_page_differently() {
        let mut slab: Slab<u32> = Slab::new();
        for i in 0..OBJECTS_PER_PAGE as u32 {
            slab.alloc(i);
        }
        slab.alloc(999);
        assert_eq!(slab.pages.len(), 2);
        assert_ne!(slab.pages[0].color, slab.pages[1].color);
    }
}
