// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Quantum: the kernel's unit of schedulable execution.

use alloc::vec::Vec;

use continuum_abi::{
    BlockReason, CapabilitySet, CpuContext, DomainId, FaultInfo, Generation, Priority, QuantumId,
    QuantumName, QuantumState, QuantumStats,
};
use continuum_kerncore::Schedulable;

use crate::arena::Arena;
use crate::err::{FatalReason, KernelError};
use crate::waitq::List;

/// One schedulable unit of execution, owning a memory domain and a
/// capability set.
pub struct Quantum {
    pub priority: Priority,
    pub domain: DomainId,
    pub state: QuantumState,
    pub capabilities: CapabilitySet,
    /// Remaining ticks in the current scheduling quantum (the time slice,
    /// not to be confused with the `Quantum` type itself).
    pub time_slice_remaining: u64,
    /// Which CPU currently runs this quantum, if `Running`.
    pub cpu: Option<usize>,
    /// The CPU this quantum was spawned on. Used to re-enqueue it after an
    /// `unblock` or timer wake, since `cpu` above is cleared while blocked.
    pub home_cpu: usize,
    /// Deadline set by `SetTimer`, in clock ticks, while blocked asleep.
    pub timer_deadline: Option<u64>,
    pub name: QuantumName,
    /// The quantum that spawned this one, or `None` for one created by
    /// kernel init.
    pub parent: Option<QuantumId>,
    /// Saved register state while not `Running`. The scheduler only ever
    /// moves this around; it never interprets it.
    pub context: CpuContext,
    pub stats: QuantumStats,
    /// Intrusive linkage into whichever list (a scheduler ready queue, or a
    /// conduit's blocked-waiter queue) this quantum currently belongs to.
    pub(crate) wait_next: Option<usize>,
    pub(crate) wait_prev: Option<usize>,
    /// Quanta parked in `WaitForQuantum` on this one's termination.
    pub(crate) waiters: List,
}

impl Quantum {
    pub fn new(domain: DomainId, priority: Priority) -> Self {
        Self {
            priority,
            domain,
            state: QuantumState::Dormant,
            capabilities: CapabilitySet::empty(),
            time_slice_remaining: 0,
            cpu: None,
            home_cpu: 0,
            timer_deadline: None,
            name: QuantumName::default(),
            parent: None,
            context: CpuContext::default(),
            stats: QuantumStats::default(),
            wait_next: None,
            wait_prev: None,
            waiters: List::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, QuantumState::Ready)
    }
}

impl Schedulable for Quantum {
    fn is_ready(&self) -> bool {
        Quantum::is_ready(self)
    }

    fn priority(&self) -> u8 {
        self.priority.0
    }
}

/// Owns the arena of live quanta and maps [`QuantumId`]s to slots.
#[derive(Default)]
pub struct QuantumTable {
    arena: Arena<Quantum>,
}

impl QuantumTable {
    pub fn new() -> Self {
        Self { arena: Arena::new() }
    }

    pub fn arena(&self) -> &Arena<Quantum> {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena<Quantum> {
        &mut self.arena
    }

    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        &mut self,
        domain: DomainId,
        priority: Priority,
        capabilities: CapabilitySet,
        home_cpu: usize,
        max_quanta: usize,
        name: QuantumName,
        parent: Option<QuantumId>,
        now: u64,
    ) -> Result<QuantumId, KernelError> {
        let mut quantum = Quantum::new(domain, priority);
        quantum.capabilities = capabilities;
        quantum.home_cpu = home_cpu;
        quantum.state = QuantumState::Ready;
        quantum.name = name;
        quantum.parent = parent;
        quantum.stats.creation_time = now;
        match self.arena.try_insert(quantum, max_quanta) {
            Ok((index, generation)) => Ok(QuantumId::for_index_and_gen(index, generation)),
            Err(_) => Err(KernelError::Recoverable(continuum_abi::ErrorCode::OutOfMemory)),
        }
    }

    /// Removes a quantum, waking every other quantum parked in
    /// `WaitForQuantum` on its termination. Callers are responsible for
    /// unblocking the returned ids on the scheduler.
    pub fn destroy(&mut self, id: QuantumId) -> Result<Vec<QuantumId>, KernelError> {
        let mut waiters = self
            .arena
            .get(id.index(), id.generation())
            .ok_or(KernelError::Recoverable(continuum_abi::ErrorCode::NotFound))?
            .waiters;
        let mut woken = Vec::new();
        while let Some(index) = waiters.pop_front(&mut self.arena) {
            if let Some(wid) = self.id_at(index) {
                woken.push(wid);
            }
        }
        self.arena
            .remove(id.index(), id.generation())
            .ok_or(KernelError::Recoverable(continuum_abi::ErrorCode::NotFound))?;
        Ok(woken)
    }

    /// Registers `waiter_index` to be woken when `target` terminates. If
    /// `target` no longer exists, it has already terminated and the caller
    /// should treat the wait as immediately satisfied.
    pub fn register_exit_waiter(&mut self, target: QuantumId, waiter_index: usize) -> bool {
        let mut waiters = match self.arena.get(target.index(), target.generation()) {
            Some(q) => q.waiters,
            None => return false,
        };
        waiters.push_back(&mut self.arena, waiter_index);
        if let Some(q) = self.arena.get_mut(target.index(), target.generation()) {
            q.waiters = waiters;
        }
        true
    }

    pub fn get(&self, id: QuantumId) -> Option<&Quantum> {
        self.arena.get(id.index(), id.generation())
    }

    pub fn get_mut(&mut self, id: QuantumId) -> Option<&mut Quantum> {
        self.arena.get_mut(id.index(), id.generation())
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Reconstructs the id for a slot known to be occupied, e.g. one just
    /// taken off a ready or wait list.
    pub fn id_at(&self, index: usize) -> Option<QuantumId> {
        self.arena
            .generation_at(index)
            .map(|gen| QuantumId::for_index_and_gen(index, gen))
    }

    /// Marks a quantum faulted, removing it from scheduling until explicitly
    /// restarted. Faulting an unknown id is a kernel-internal inconsistency,
    /// not a recoverable condition: callers only ever do this for ids they
    /// already resolved moments earlier.
    pub fn force_fault(&mut self, id: QuantumId, fault: FaultInfo) {
        match self.get_mut(id) {
            Some(q) => q.state = QuantumState::Faulted(fault),
            None => crate::err::die(FatalReason::ArenaCorruption),
        }
    }
}
