// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-based, multi-CPU preemptive scheduler.
//!
//! Grounded on `priority_scan`/`select` in the teacher's `task.rs`: picking
//! the next quantum to run is the same "scan forward from where we left
//! off, take the most important ready entry, break ties by scan order"
//! algorithm (`continuum_kerncore::priority_scan`), just applied one level
//! up. The teacher scans a single flat task table; here each CPU has one
//! ready queue per priority level, so `schedule()` first uses
//! `priority_scan` to pick the most important *non-empty* queue for a CPU,
//! then pops its front (ties between queues of equal priority can't arise,
//! since levels are distinct, so FIFO order within a queue gives the
//! round-robin fairness the teacher gets from `priority_scan`'s
//! scan-order tiebreak).

use alloc::vec::Vec;
use continuum_abi::{BlockReason, ConduitId, ErrorCode, FaultInfo, Priority, QuantumId, QuantumState};
use continuum_kerncore::{priority_scan, Schedulable};

use crate::clock::Clock;
use crate::err::KernelError;
use crate::quantum::QuantumTable;
use crate::waitq::List;

struct ReadyBucket<'a> {
    list: &'a List,
    level: u8,
}

impl Schedulable for ReadyBucket<'_> {
    fn is_ready(&self) -> bool {
        !self.list.is_empty()
    }

    fn priority(&self) -> u8 {
        self.level
    }
}

pub struct Scheduler {
    priority_count: u8,
    /// `ready[cpu][priority]`.
    ready: Vec<Vec<List>>,
    current: Vec<Option<QuantumId>>,
}

impl Scheduler {
    pub fn new(cpu_count: usize, priority_count: u8) -> Self {
        Self {
            priority_count,
            ready: (0..cpu_count)
                .map(|_| (0..priority_count).map(|_| List::new()).collect())
                .collect(),
            current: alloc::vec![None; cpu_count],
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.current.len()
    }

    /// The quantum currently running on `cpu`, if any.
    pub fn current(&self, cpu: usize) -> Option<QuantumId> {
        self.current.get(cpu).copied().flatten()
    }

    /// Moves `id` from wherever it is (nowhere, if newly spawned) into its
    /// priority's ready queue on `cpu`.
    pub fn enqueue(&mut self, quanta: &mut QuantumTable, id: QuantumId, cpu: usize) {
        if let Some(q) = quanta.get_mut(id) {
            q.state = QuantumState::Ready;
        }
        self.ready[cpu][self.level_of(quanta, id)].push_back(quanta.arena_mut(), id.index());
    }

    fn level_of(&self, quanta: &QuantumTable, id: QuantumId) -> usize {
        quanta.get(id).map(|q| q.priority.0 as usize).unwrap_or(0)
    }

    /// Removes `id` from its ready queue, e.g. because it's about to block.
    /// No-op if `id` isn't currently ready.
    pub fn remove(&mut self, quanta: &mut QuantumTable, id: QuantumId, cpu: usize) {
        let level = self.level_of(quanta, id);
        self.ready[cpu][level].remove(quanta.arena_mut(), id.index());
    }

    /// Picks the next quantum to run on `cpu` and assigns it, without
    /// removing the previously running quantum from any list (callers are
    /// responsible for first blocking or re-enqueuing it via [`Self::yield_now`]
    /// or [`Self::block`]).
    pub fn schedule(&mut self, quanta: &mut QuantumTable, cpu: usize, base_slice: u64) -> Option<QuantumId> {
        let buckets: Vec<ReadyBucket<'_>> = self.ready[cpu]
            .iter()
            .enumerate()
            .map(|(level, list)| ReadyBucket { list, level: level as u8 })
            .collect();
        let chosen_level = priority_scan(&buckets, self.priority_count as usize - 1)?;
        let index = self.ready[cpu][chosen_level].pop_front(quanta.arena_mut())?;
        let id = quanta.id_at(index)?;
        if let Some(q) = quanta.get_mut(id) {
            q.state = QuantumState::Running;
            q.cpu = Some(cpu);
            q.time_slice_remaining = base_slice;
            q.stats.context_switches += 1;
        }
        crate::stats::record(crate::stats::Event::ContextSwitch);
        self.current[cpu] = Some(id);
        Some(id)
    }

    /// Voluntarily gives up the CPU: the current quantum goes to the back
    /// of its ready queue.
    pub fn yield_now(&mut self, quanta: &mut QuantumTable, cpu: usize) {
        if let Some(id) = self.current[cpu].take() {
            self.enqueue(quanta, id, cpu);
        }
    }

    /// Blocks the currently running quantum on `cpu` for `reason`, removing
    /// it from scheduling entirely; the caller (IPC, memory manager, or the
    /// clock) is responsible for re-enqueuing it via [`Self::enqueue`] once
    /// the wait is satisfied.
    pub fn block(
        &mut self,
        quanta: &mut QuantumTable,
        cpu: usize,
        reason: BlockReason,
    ) -> Result<QuantumId, KernelError> {
        let id = self.current[cpu].take().ok_or(KernelError::Recoverable(ErrorCode::Internal))?;
        if let Some(q) = quanta.get_mut(id) {
            q.state = QuantumState::Blocked(reason);
            q.cpu = None;
        }
        Ok(id)
    }

    /// Wakes a blocked quantum, moving it back onto `cpu`'s ready queue.
    pub fn unblock(&mut self, quanta: &mut QuantumTable, id: QuantumId, cpu: usize) -> Result<(), KernelError> {
        match quanta.get(id).map(|q| q.state) {
            Some(QuantumState::Blocked(_)) => {
                self.enqueue(quanta, id, cpu);
                Ok(())
            }
            Some(_) => Err(KernelError::Recoverable(ErrorCode::InvalidArgument)),
            None => Err(KernelError::Recoverable(ErrorCode::NotFound)),
        }
    }

    /// Faults the currently running quantum on `cpu`, removing it from
    /// scheduling until externally restarted.
    pub fn fault_current(&mut self, quanta: &mut QuantumTable, cpu: usize, fault: FaultInfo) -> Option<QuantumId> {
        let id = self.current[cpu].take()?;
        quanta.force_fault(id, fault);
        Some(id)
    }

    /// Called once per timer tick for `cpu`: decrements the running
    /// quantum's time slice and, if exhausted, preempts it back onto its
    /// ready queue.
    pub fn tick(&mut self, quanta: &mut QuantumTable, cpu: usize, clock: &dyn Clock, base_slice: u64) {
        let _ = clock;
        if let Some(id) = self.current[cpu] {
            let exhausted = match quanta.get_mut(id) {
                Some(q) if q.time_slice_remaining > 0 => {
                    q.time_slice_remaining -= 1;
                    q.stats.cpu_time += 1;
                    q.time_slice_remaining == 0
                }
                _ => false,
            };
            if exhausted {
                self.current[cpu] = None;
                self.enqueue(quanta, id, cpu);
                self.schedule(quanta, cpu, base_slice);
            }
        } else {
            self.schedule(quanta, cpu, base_slice);
        }
    }

    /// Moves one ready quantum from the busiest CPU's lowest-priority
    /// non-empty queue onto the least busy CPU. New relative to the
    /// teacher, which is single-core; a minimal load balancer that keeps
    /// ready-queue lengths from diverging without attempting anything
    /// smarter (no affinity, no work stealing across locks).
    pub fn balance(&mut self, quanta: &mut QuantumTable) {
        if self.cpu_count() < 2 {
            return;
        }
        let lengths: Vec<usize> = (0..self.cpu_count())
            .map(|cpu| self.ready_len(cpu))
            .collect();
        let Some((busiest, &max_len)) = lengths.iter().enumerate().max_by_key(|(_, l)| **l) else {
            return;
        };
        let Some((idlest, &min_len)) = lengths.iter().enumerate().min_by_key(|(_, l)| **l) else {
            return;
        };
        if busiest == idlest || max_len < min_len + 2 {
            return;
        }
        for level in 0..self.priority_count as usize {
            if let Some(index) = self.ready[busiest][level].pop_front(quanta.arena_mut()) {
                if let Some(id) = quanta.id_at(index) {
                    self.ready[idlest][level].push_back(quanta.arena_mut(), index);
                    let _ = id;
                }
                return;
            }
        }
    }

    fn ready_len(&self, cpu: usize) -> usize {
        self.ready[cpu].iter().filter(|l| !l.is_empty()).count()
    }

    pub fn conduit_block_reason(conduit: ConduitId) -> BlockReason {
        BlockReason::ConduitSend(conduit)
    }
}
