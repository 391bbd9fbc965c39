// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot-time kernel configuration.
//!
//! The teacher links a static `App`/`TaskDesc` table into the image at build
//! time, since its task set never changes after flashing. Quanta here are
//! created dynamically with `SpawnQuantum`, so there is no equivalent static
//! table; instead `Kernel::new` takes a `KernelConfig` describing capacity
//! and timing parameters resolved once at boot.

/// Boot-time parameters for a [`crate::Kernel`].
#[derive(Copy, Clone, Debug)]
pub struct KernelConfig {
    /// Number of CPUs the scheduler distributes quanta across.
    pub cpu_count: usize,
    /// Number of distinct scheduling priorities, numbered `0..priority_count`.
    pub priority_count: u8,
    /// Upper bound on concurrently live quanta.
    pub max_quanta: usize,
    /// Upper bound on concurrently live memory domains.
    pub max_domains: usize,
    /// Upper bound on concurrently live conduits.
    pub max_conduits: usize,
    /// Largest single message any conduit created without an explicit
    /// override will accept.
    pub default_max_message_size: usize,
    /// Page size in bytes, used by the memory manager's frame pool.
    pub page_size: usize,
    /// Object sizes served by the small-object slab allocator, smallest
    /// first.
    pub slab_sizes: [usize; 4],
    /// Large-page size in bytes, for domains that opt into huge mappings.
    pub huge_page_size: usize,
    /// Default scheduling time slice, in clock ticks.
    pub base_time_slice_ticks: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            priority_count: 16,
            max_quanta: 256,
            max_domains: 256,
            max_conduits: 256,
            default_max_message_size: 4096,
            page_size: 4096,
            slab_sizes: [16, 32, 64, 128],
            huge_page_size: 2 * 1024 * 1024,
            base_time_slice_ticks: 10,
        }
    }
}
