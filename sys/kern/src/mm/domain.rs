// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A memory domain: one address space, owning an ordered region table.
//!
//! Grounded on a task's ownership of its `region_table` in the teacher's
//! `sys/kern/src/task.rs`, generalized from a static `&'static [&'static
//! RegionDesc]` slice fixed at build time to an owned, mutable table that
//! `map`/`unmap`/`protect`/CoW forking mutate at run time.

use continuum_abi::DomainId;

use crate::arena::Arena;
use crate::mm::region::{Region, RegionTable};

/// One domain's full region table plus basic accounting.
#[derive(Default)]
pub struct Domain {
    pub regions: RegionTable,
}

impl Domain {
    pub fn new() -> Self {
        Self { regions: RegionTable::new() }
    }

    /// Total bytes resident in this domain across all mapped regions.
    pub fn resident_size(&self) -> u64 {
        self.regions.as_slice().iter().map(|r| r.size as u64).sum()
    }
}

#[derive(Default)]
pub struct DomainTable {
    arena: Arena<Domain>,
}

impl DomainTable {
    pub fn new() -> Self {
        Self { arena: Arena::new() }
    }

    pub fn create(&mut self, max_domains: usize) -> Result<DomainId, ()> {
        self.arena
            .try_insert(Domain::new(), max_domains)
            .map(|(i, g)| DomainId::for_index_and_gen(i, g))
            .map_err(|_| ())
    }

    pub fn destroy(&mut self, id: DomainId) -> Option<Domain> {
        self.arena.remove(id.index(), id.generation())
    }

    pub fn get(&self, id: DomainId) -> Option<&Domain> {
        self.arena.get(id.index(), id.generation())
    }

    pub fn get_mut(&mut self, id: DomainId) -> Option<&mut Domain> {
        self.arena.get_mut(id.index(), id.generation())
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

pub use Region as DomainRegion;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_destroy_round_trip() {
        let mut table = DomainTable::new();
        let id = table.create(4).unwrap();
        assert!(table.get(id).is_some());
        table.destroy(id).unwrap();
        assert!(table.get(id).is_none());
    }
}
