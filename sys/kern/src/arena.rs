// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generation-tagged slot arena backing quanta, domains, and conduits.
//!
//! The teacher addresses its task table with a plain `usize` index into a
//! `&mut [Task]` fixed at build time. Continuum creates and destroys quanta,
//! domains, and conduits at run time, so a bare index would eventually
//! alias a destroyed-and-recreated entity; every slot here also carries a
//! [`continuum_abi::Generation`] that's bumped on each reuse, and a lookup
//! under a stale generation is reported rather than silently aliasing.

use alloc::vec::Vec;
use continuum_abi::Generation;

enum Slot<T> {
    Occupied { generation: Generation, value: T },
    Free { generation: Generation, next_free: Option<usize> },
}

/// A growable arena of generation-tagged slots.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free_head: None, len: 0 }
    }

    /// Number of currently occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `value`, reusing a freed slot if one is available and the
    /// arena is already at `max` capacity otherwise failing and handing
    /// `value` back.
    pub fn try_insert(&mut self, value: T, max: usize) -> Result<(usize, Generation), T> {
        if let Some(index) = self.free_head {
            let Slot::Free { generation, next_free } = self.slots[index] else {
                unreachable!("free_head always names a Free slot")
            };
            self.free_head = next_free;
            self.slots[index] = Slot::Occupied { generation, value };
            self.len += 1;
            return Ok((index, generation));
        }

        if self.slots.len() >= max {
            return Err(value);
        }

        let index = self.slots.len();
        let generation = Generation::ZERO;
        self.slots.push(Slot::Occupied { generation, value });
        self.len += 1;
        Ok((index, generation))
    }

    /// Removes the slot at `index` if its generation matches, returning the
    /// stored value and bumping the slot's generation so future lookups at
    /// the old generation fail.
    pub fn remove(&mut self, index: usize, generation: Generation) -> Option<T> {
        let slot = self.slots.get_mut(index)?;
        match slot {
            Slot::Occupied { generation: g, .. } if *g == generation => {
                let next_gen = g.next();
                let Slot::Occupied { value, .. } =
                    core::mem::replace(slot, Slot::Free { generation: next_gen, next_free: self.free_head })
                else {
                    unreachable!()
                };
                self.free_head = Some(index);
                self.len -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get(&self, index: usize, generation: Generation) -> Option<&T> {
        match self.slots.get(index)? {
            Slot::Occupied { generation: g, value } if *g == generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: usize, generation: Generation) -> Option<&mut T> {
        match self.slots.get_mut(index)? {
            Slot::Occupied { generation: g, value } if *g == generation => Some(value),
            _ => None,
        }
    }

    /// Returns the current generation of the slot at `index`, whether or
    /// not it's occupied. Used to reconstruct an id from a bare index
    /// obtained by iterating the arena.
    pub fn generation_at(&self, index: usize) -> Option<Generation> {
        match self.slots.get(index)? {
            Slot::Occupied { generation, .. } | Slot::Free { generation, .. } => Some(*generation),
        }
    }

    /// Looks up a slot by index alone, ignoring generation.
    ///
    /// Reserved for intrusive wait-queue linkage ([`crate::waitq`]), where
    /// the index is already known-valid because it came from a list whose
    /// membership is maintained alongside the arena itself.
    pub(crate) fn get_mut_by_index(&mut self, index: usize) -> Option<&mut T> {
        match self.slots.get_mut(index)? {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Iterates all occupied slots as `(index, &T)`, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied { value, .. } => Some((i, value)),
            Slot::Free { .. } => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied { value, .. } => Some((i, value)),
            Slot::Free { .. } => None,
        })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
