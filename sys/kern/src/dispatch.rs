// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The system-request dispatcher: the single boundary quanta cross into
//! MM/SCH/CND, capability-checked on every call.
//!
//! Grounded on the teacher's `syscalls.rs`, which validates a task's
//! arguments, checks its capability/generation, then switches on syscall
//! number into `kipc`/`umem`/`task` handlers. `dispatch` plays the same
//! role here: one capability check (`CapabilitySet::required_for`) ahead of
//! a match over every [`RequestId`], each arm a thin adapter onto
//! [`MemoryManager`], [`Scheduler`], or [`ConduitTable`].
//!
//! The teacher resumes a blocked task by writing its reply directly into
//! the saved register context and returning through an architecture-specific
//! trap trampoline (`arch/*/src/lib.rs`). This crate has no `arch` layer, so
//! blocking is modeled more coarsely: a handler that can't complete
//! immediately registers the caller as a waiter on the relevant queue, blocks
//! it via [`Scheduler::block`], and returns [`DispatchOutcome::Blocked`].
//! Nothing here writes a reply into a blocked quantum's state later; the
//! quantum is simply made `Ready` again (by [`Dispatcher::process_timers`] or
//! a send/receive elsewhere waking it) and is expected to retry its own
//! request when it next runs. This is an explicit simplification, not an
//! oversight: see `DESIGN.md`.

use alloc::vec::Vec;

use continuum_abi::{
    BlockReason, CapabilitySet, ConduitId, DomainId, ErrorCode, FaultInfo, InlineName, Priority,
    QuantumId, QuantumName, QuantumState, RawId, RegionFlags, RequestId, RequestParams, UsageError,
};

use crate::clock::Clock;
use crate::config::KernelConfig;
use crate::err::KernelError;
use crate::ipc::ConduitTable;
use crate::mm::MemoryManager;
use crate::quantum::QuantumTable;
use crate::sched::Scheduler;
use crate::{stats, trace};

/// The result of routing one request through the dispatcher.
pub enum DispatchOutcome {
    /// The request ran to completion; carries the reply words.
    Complete(RequestParams),
    /// The caller was registered as a waiter and blocked. It must retry the
    /// same request once it runs again.
    Blocked,
}

/// Owns every subsystem a request can touch, and the one path into them.
pub struct Dispatcher {
    pub quanta: QuantumTable,
    pub mm: MemoryManager,
    pub sched: Scheduler,
    pub conduits: ConduitTable,
    max_quanta: usize,
}

impl Dispatcher {
    pub fn new(config: &KernelConfig, frame_count: u32) -> Self {
        Self {
            quanta: QuantumTable::new(),
            mm: MemoryManager::new(config, frame_count),
            sched: Scheduler::new(config.cpu_count, config.priority_count),
            conduits: ConduitTable::new(config.max_conduits, config.default_max_message_size),
            max_quanta: config.max_quanta,
        }
    }

    /// Routes `request_id_raw` from `caller`, running on `cpu`, through its
    /// capability check and handler. `lease_in`/`lease_out` carry the
    /// message payload for `Send`/`Receive`/`Peek`/`Broadcast`, which don't
    /// fit in the fixed-size [`RequestParams`] envelope.
    pub fn dispatch(
        &mut self,
        cpu: usize,
        caller: QuantumId,
        request_id_raw: u32,
        params: RequestParams,
        lease_in: Option<&[u8]>,
        lease_out: Option<&mut [u8]>,
        clock: &dyn Clock,
    ) -> Result<DispatchOutcome, KernelError> {
        stats::record(stats::Event::Syscall);

        let request_id = RequestId::try_from(request_id_raw)
            .map_err(|_| KernelError::Recoverable(ErrorCode::NoSuchCall))?;

        let caller_caps = self
            .quanta
            .get(caller)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?
            .capabilities;
        if !caller_caps.contains(CapabilitySet::required_for(request_id)) {
            trace::record(trace::Trace::RequestDenied(ErrorCode::PermissionDenied));
            return Err(KernelError::Recoverable(ErrorCode::PermissionDenied));
        }
        if let Some(q) = self.quanta.get_mut(caller) {
            q.stats.system_requests += 1;
        }

        match request_id {
            RequestId::SpawnQuantum => self.handle_spawn_quantum(caller, cpu, params, clock).map(DispatchOutcome::Complete),
            RequestId::DestroyQuantum => self.handle_destroy_quantum(params),
            RequestId::Yield => self.handle_yield(cpu).map(DispatchOutcome::Complete),
            RequestId::Block => self.handle_block(cpu).map(DispatchOutcome::Complete),
            RequestId::Unblock => self.handle_unblock(params).map(DispatchOutcome::Complete),
            RequestId::WaitForQuantum => self.handle_wait_for_quantum(caller, cpu, params),
            RequestId::CreateDomain => self.handle_create_domain().map(DispatchOutcome::Complete),
            RequestId::DestroyDomain => self.handle_destroy_domain(params).map(DispatchOutcome::Complete),
            RequestId::Allocate => self.handle_allocate(params).map(DispatchOutcome::Complete),
            RequestId::Free => self.handle_free(params).map(DispatchOutcome::Complete),
            RequestId::Map => self.handle_map(params).map(DispatchOutcome::Complete),
            RequestId::Unmap => self.handle_unmap(params).map(DispatchOutcome::Complete),
            RequestId::Protect => self.handle_protect(params).map(DispatchOutcome::Complete),
            RequestId::MarkCow => self.handle_mark_cow(params).map(DispatchOutcome::Complete),
            RequestId::Translate => self.handle_translate(params).map(DispatchOutcome::Complete),
            RequestId::CreateConduit => self.handle_create_conduit(params).map(DispatchOutcome::Complete),
            RequestId::OpenConduit => self.handle_open_conduit(params).map(DispatchOutcome::Complete),
            RequestId::CloseConduit => self.handle_close_conduit(params).map(DispatchOutcome::Complete),
            RequestId::Send => self.handle_send(cpu, caller, params, lease_in),
            RequestId::Receive => self.handle_receive(cpu, caller, params, lease_out),
            RequestId::Peek => self.handle_peek(params, lease_out).map(DispatchOutcome::Complete),
            RequestId::Broadcast => self.handle_broadcast(params, lease_in).map(DispatchOutcome::Complete),
            RequestId::Select => self.handle_select(cpu, caller, params),
            RequestId::SetTimer => self.handle_set_timer(caller, params).map(DispatchOutcome::Complete),
            RequestId::GetTimer => self.handle_get_timer(caller, clock).map(DispatchOutcome::Complete),
            RequestId::QueryTime => self.handle_query_time(clock).map(DispatchOutcome::Complete),
            RequestId::QueryStats => self.handle_query_stats(params).map(DispatchOutcome::Complete),
        }
    }

    /// Called once per timer tick: wakes every quantum sleeping past its
    /// armed `SetTimer` deadline, re-enqueuing it on the CPU it was spawned
    /// on (its `cpu` field is cleared while blocked).
    pub fn process_timers(&mut self, clock: &dyn Clock) {
        let now = clock.now_ticks().0;
        let mut ready: Vec<(usize, usize)> = Vec::new();
        for (index, q) in self.quanta.arena_mut().iter_mut() {
            if matches!(q.state, QuantumState::Blocked(BlockReason::Sleep)) {
                if let Some(deadline) = q.timer_deadline {
                    if deadline <= now {
                        q.timer_deadline = None;
                        ready.push((index, q.home_cpu));
                    }
                }
            }
        }
        for (index, home_cpu) in ready {
            if let Some(id) = self.quanta.id_at(index) {
                let _ = self.sched.unblock(&mut self.quanta, id, home_cpu);
            }
        }
    }

    /// Entry point for a write fault trapped outside the request protocol
    /// (there is no [`RequestId`] for this: a fault happens *to* a quantum,
    /// it isn't something a quantum asks for). If the fault resolves as a
    /// copy-on-write, the quantum is left exactly as it was and the caller
    /// should just resume it; otherwise it's faulted via
    /// [`Scheduler::fault_current`] and removed from scheduling.
    pub fn handle_page_fault(&mut self, cpu: usize, domain: DomainId, addr: u32) -> Result<(), KernelError> {
        stats::record(stats::Event::PageFault);
        if let Some(current) = self.sched.current(cpu) {
            if let Some(q) = self.quanta.get_mut(current) {
                q.stats.page_faults += 1;
            }
        }
        match self.mm.handle_cow_fault(domain, addr) {
            Ok(()) => Ok(()),
            Err(KernelError::Recoverable(code)) => {
                let fault = FaultInfo::MemoryAccess { address: addr };
                trace::record(trace::Trace::RequestDenied(code));
                self.sched.fault_current(&mut self.quanta, cpu, fault);
                Err(KernelError::Recoverable(code))
            }
            Err(e) => Err(e),
        }
    }

    // --- quantum lifecycle ------------------------------------------------

    fn handle_spawn_quantum(
        &mut self,
        caller: QuantumId,
        cpu: usize,
        params: RequestParams,
        clock: &dyn Clock,
    ) -> Result<RequestParams, KernelError> {
        let domain = DomainId(RawId(params.0[0] as u32));
        let priority = Priority(params.0[1] as u8);
        let name = QuantumName::from_words(&params.0[2..5]);
        // A spawned quantum can never hold more than its parent's
        // capabilities: the wire format carries no bitmap of its own, so
        // there is nothing to escalate from even if a caller wanted to.
        let capabilities = self
            .quanta
            .get(caller)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?
            .capabilities;
        let id = self.quanta.spawn(
            domain,
            priority,
            capabilities,
            cpu,
            self.max_quanta,
            name,
            Some(caller),
            clock.now_ticks().0,
        )?;
        self.sched.enqueue(&mut self.quanta, id, cpu);
        let mut r = RequestParams::default();
        r.0[0] = id.0 .0 as u64;
        Ok(r)
    }

    fn handle_destroy_quantum(&mut self, params: RequestParams) -> Result<DispatchOutcome, KernelError> {
        let target = QuantumId(RawId(params.0[0] as u32));
        let quantum = self
            .quanta
            .get(target)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        if quantum.is_ready() {
            self.sched.remove(&mut self.quanta, target, quantum.home_cpu);
        }
        let woken = self.quanta.destroy(target)?;
        for waiter in woken {
            if let Some(home_cpu) = self.quanta.get(waiter).map(|q| q.home_cpu) {
                let _ = self.sched.unblock(&mut self.quanta, waiter, home_cpu);
            }
        }
        Ok(DispatchOutcome::Complete(RequestParams::default()))
    }

    /// Suspends `caller` until `target` terminates. If `target` is already
    /// gone, the wait is satisfied immediately (spec.md's suspension point
    /// for `WaitForQuantum`, routed through `SCH.block` like every other).
    fn handle_wait_for_quantum(
        &mut self,
        caller: QuantumId,
        cpu: usize,
        params: RequestParams,
    ) -> Result<DispatchOutcome, KernelError> {
        let target = QuantumId(RawId(params.0[0] as u32));
        if self.quanta.get(target).is_none() {
            return Ok(DispatchOutcome::Complete(RequestParams::default()));
        }
        let blocked = self.sched.block(&mut self.quanta, cpu, BlockReason::QuantumExit(target))?;
        self.quanta.register_exit_waiter(target, blocked.index());
        Ok(DispatchOutcome::Blocked)
    }

    fn handle_yield(&mut self, cpu: usize) -> Result<RequestParams, KernelError> {
        self.sched.yield_now(&mut self.quanta, cpu);
        Ok(RequestParams::default())
    }

    fn handle_block(&mut self, cpu: usize) -> Result<RequestParams, KernelError> {
        self.sched.block(&mut self.quanta, cpu, BlockReason::Sleep)?;
        Ok(RequestParams::default())
    }

    fn handle_unblock(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let target = QuantumId(RawId(params.0[0] as u32));
        let home_cpu = self
            .quanta
            .get(target)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?
            .home_cpu;
        self.sched.unblock(&mut self.quanta, target, home_cpu)?;
        Ok(RequestParams::default())
    }

    // --- memory manager ----------------------------------------------------

    fn handle_create_domain(&mut self) -> Result<RequestParams, KernelError> {
        let id = self.mm.create_domain()?;
        let mut r = RequestParams::default();
        r.0[0] = id.0 .0 as u64;
        Ok(r)
    }

    fn handle_destroy_domain(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let domain = DomainId(RawId(params.0[0] as u32));
        self.mm.destroy_domain(domain)?;
        Ok(RequestParams::default())
    }

    fn handle_allocate(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let domain = DomainId(RawId(params.0[0] as u32));
        let size = params.0[1] as u32;
        let flags = RegionFlags::from_bits_truncate(params.0[2] as u32);
        let base = self.mm.allocate(domain, size, flags)?;
        let mut r = RequestParams::default();
        r.0[0] = base as u64;
        Ok(r)
    }

    fn handle_free(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let domain = DomainId(RawId(params.0[0] as u32));
        let base = params.0[1] as u32;
        self.mm.free(domain, base)?;
        Ok(RequestParams::default())
    }

    fn handle_map(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let domain = DomainId(RawId(params.0[0] as u32));
        let vaddr = params.0[1] as u32;
        let paddr = params.0[2] as u32;
        let size = params.0[3] as u32;
        let flags = RegionFlags::from_bits_truncate(params.0[4] as u32);
        self.mm.map(domain, vaddr, paddr, size, flags)?;
        Ok(RequestParams::default())
    }

    fn handle_unmap(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let domain = DomainId(RawId(params.0[0] as u32));
        let vaddr = params.0[1] as u32;
        self.mm.unmap(domain, vaddr)?;
        Ok(RequestParams::default())
    }

    fn handle_protect(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let domain = DomainId(RawId(params.0[0] as u32));
        let base = params.0[1] as u32;
        let flags = RegionFlags::from_bits_truncate(params.0[2] as u32);
        self.mm.protect(domain, base, flags)?;
        Ok(RequestParams::default())
    }

    fn handle_mark_cow(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let domain = DomainId(RawId(params.0[0] as u32));
        let vaddr = params.0[1] as u32;
        let size = params.0[2] as u32;
        self.mm.mark_cow(domain, vaddr, size)?;
        Ok(RequestParams::default())
    }

    fn handle_translate(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let domain = DomainId(RawId(params.0[0] as u32));
        let addr = params.0[1] as u32;
        let paddr = self.mm.translate(domain, addr)?;
        let mut r = RequestParams::default();
        r.0[0] = paddr as u64;
        Ok(r)
    }

    // --- conduits ----------------------------------------------------------

    fn handle_create_conduit(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let name = InlineName::from_params(&params);
        let capacity = params.0[5] as usize;
        let id = self.conduits.create(name.as_str(), capacity)?;
        let mut r = RequestParams::default();
        r.0[0] = id.0 .0 as u64;
        Ok(r)
    }

    fn handle_open_conduit(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let name = InlineName::from_params(&params);
        let id = self.conduits.open(name.as_str())?;
        let mut r = RequestParams::default();
        r.0[0] = id.0 .0 as u64;
        Ok(r)
    }

    fn handle_close_conduit(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let id = ConduitId(RawId(params.0[0] as u32));
        let woken = self.conduits.close(self.quanta.arena_mut(), id)?;
        for target in woken {
            if let Some(home_cpu) = self.quanta.get(target).map(|q| q.home_cpu) {
                let _ = self.sched.unblock(&mut self.quanta, target, home_cpu);
            }
        }
        Ok(RequestParams::default())
    }

    fn handle_send(
        &mut self,
        cpu: usize,
        caller: QuantumId,
        params: RequestParams,
        lease_in: Option<&[u8]>,
    ) -> Result<DispatchOutcome, KernelError> {
        let id = ConduitId(RawId(params.0[0] as u32));
        let payload = lease_in.ok_or(KernelError::Recoverable(ErrorCode::InvalidArgument))?;

        match self.conduits.send(self.quanta.arena_mut(), id, payload) {
            Ok(woken) => {
                stats::record(stats::Event::ConduitSend);
                trace::record(trace::Trace::ConduitSend(id));
                if let Some(target) = woken {
                    if let Some(home_cpu) = self.quanta.get(target).map(|q| q.home_cpu) {
                        let _ = self.sched.unblock(&mut self.quanta, target, home_cpu);
                    }
                }
                Ok(DispatchOutcome::Complete(RequestParams::default()))
            }
            Err(KernelError::Recoverable(ErrorCode::WouldBlock)) => {
                trace::record(trace::Trace::ConduitWouldBlock(id));
                self.conduits.register_sender(self.quanta.arena_mut(), id, caller.index());
                self.sched.block(&mut self.quanta, cpu, BlockReason::ConduitSend(id))?;
                Ok(DispatchOutcome::Blocked)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_receive(
        &mut self,
        cpu: usize,
        caller: QuantumId,
        params: RequestParams,
        lease_out: Option<&mut [u8]>,
    ) -> Result<DispatchOutcome, KernelError> {
        let id = ConduitId(RawId(params.0[0] as u32));
        let dest = lease_out.ok_or(KernelError::Recoverable(ErrorCode::InvalidArgument))?;

        match self.conduits.receive(id, dest) {
            Ok(n) => {
                stats::record(stats::Event::ConduitReceive);
                trace::record(trace::Trace::ConduitReceive(id));
                if let Ok(Some(target)) = self.conduits.wake_one_sender(self.quanta.arena_mut(), id) {
                    if let Some(home_cpu) = self.quanta.get(target).map(|q| q.home_cpu) {
                        let _ = self.sched.unblock(&mut self.quanta, target, home_cpu);
                    }
                }
                let mut r = RequestParams::default();
                r.0[0] = n as u64;
                Ok(DispatchOutcome::Complete(r))
            }
            Err(KernelError::Recoverable(ErrorCode::WouldBlock)) => {
                trace::record(trace::Trace::ConduitWouldBlock(id));
                self.conduits.register_receiver(self.quanta.arena_mut(), id, caller.index());
                self.sched.block(&mut self.quanta, cpu, BlockReason::ConduitReceive)?;
                Ok(DispatchOutcome::Blocked)
            }
            Err(e) => Err(e),
        }
    }

    fn handle_peek(
        &mut self,
        params: RequestParams,
        lease_out: Option<&mut [u8]>,
    ) -> Result<RequestParams, KernelError> {
        let id = ConduitId(RawId(params.0[0] as u32));
        let dest = lease_out.ok_or(KernelError::Recoverable(ErrorCode::InvalidArgument))?;
        let n = self.conduits.peek(id, dest)?;
        let mut r = RequestParams::default();
        r.0[0] = n as u64;
        Ok(r)
    }

    fn handle_broadcast(
        &mut self,
        params: RequestParams,
        lease_in: Option<&[u8]>,
    ) -> Result<RequestParams, KernelError> {
        let pattern = InlineName::from_params(&params);
        let payload = lease_in.ok_or(KernelError::Recoverable(ErrorCode::InvalidArgument))?;
        let delivered = self.conduits.broadcast(self.quanta.arena_mut(), pattern.as_str(), payload);
        let mut r = RequestParams::default();
        r.0[0] = delivered as u64;
        Ok(r)
    }

    fn handle_select(
        &mut self,
        cpu: usize,
        caller: QuantumId,
        params: RequestParams,
    ) -> Result<DispatchOutcome, KernelError> {
        let count = (params.0[0] as usize).min(5);
        let ids: Vec<ConduitId> = (0..count)
            .map(|i| ConduitId(RawId(params.0[i + 1] as u32)))
            .collect();

        if let Some(ready) = self.conduits.first_ready(&ids) {
            let mut r = RequestParams::default();
            r.0[0] = ready.0 .0 as u64;
            return Ok(DispatchOutcome::Complete(r));
        }

        // The handles `register_select` returns are dropped here: nothing
        // owns them across the blocked interval, so a resolved select never
        // cancels its registration on the conduits it didn't wake on. See
        // DESIGN.md.
        self.conduits.register_select(&ids, caller);
        self.sched.block(&mut self.quanta, cpu, BlockReason::ConduitReceive)?;
        Ok(DispatchOutcome::Blocked)
    }

    // --- clock ---------------------------------------------------------

    fn handle_set_timer(&mut self, caller: QuantumId, params: RequestParams) -> Result<RequestParams, KernelError> {
        let deadline = params.0[0];
        let quantum = self
            .quanta
            .get_mut(caller)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        quantum.timer_deadline = Some(deadline);
        Ok(RequestParams::default())
    }

    fn handle_get_timer(&mut self, caller: QuantumId, clock: &dyn Clock) -> Result<RequestParams, KernelError> {
        let quantum = self
            .quanta
            .get(caller)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        let now = clock.now_ticks().0;
        let remaining = quantum.timer_deadline.map(|d| d.saturating_sub(now)).unwrap_or(0);
        let mut r = RequestParams::default();
        r.0[0] = remaining;
        Ok(r)
    }

    fn handle_query_time(&mut self, clock: &dyn Clock) -> Result<RequestParams, KernelError> {
        let mut r = RequestParams::default();
        r.0[0] = clock.now_ticks().0;
        Ok(r)
    }

    /// Reports one quantum's statistics (spec.md §3): creation time,
    /// accumulated CPU time, context-switch count, page-fault count, and
    /// system-request count, in that word order.
    fn handle_query_stats(&mut self, params: RequestParams) -> Result<RequestParams, KernelError> {
        let target = QuantumId(RawId(params.0[0] as u32));
        let stats = self
            .quanta
            .get(target)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?
            .stats;
        let mut r = RequestParams::default();
        r.0[0] = stats.creation_time;
        r.0[1] = stats.cpu_time;
        r.0[2] = stats.context_switches as u64;
        r.0[3] = stats.page_faults as u64;
        r.0[4] = stats.system_requests as u64;
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&KernelConfig::default(), 16)
    }

    fn boot_quantum(d: &mut Dispatcher, caps: CapabilitySet) -> QuantumId {
        let domain = d.mm.create_domain().unwrap();
        let id = d
            .quanta
            .spawn(domain, Priority(0), caps, 0, d.max_quanta, QuantumName::default(), None, 0)
            .unwrap();
        d.sched.enqueue(&mut d.quanta, id, 0);
        id
    }

    #[test]
    fn unknown_request_number_is_no_such_call() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);
        let clock = FakeClock::new(1_000);
        let err = d
            .dispatch(0, caller, 999, RequestParams::default(), None, None, &clock)
            .unwrap_err();
        assert!(matches!(err, KernelError::Recoverable(ErrorCode::NoSuchCall)));
    }

    #[test]
    fn missing_capability_is_denied_not_faulted() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::empty());
        let clock = FakeClock::new(1_000);
        let err = d
            .dispatch(0, caller, RequestId::CreateDomain as u32, RequestParams::default(), None, None, &clock)
            .unwrap_err();
        assert!(matches!(err, KernelError::Recoverable(ErrorCode::PermissionDenied)));
    }

    #[test]
    fn spawn_quantum_inherits_callers_capabilities() {
        let mut d = dispatcher();
        let caps = CapabilitySet::SPAWN_QUANTUM | CapabilitySet::SCHEDULE;
        let caller = boot_quantum(&mut d, caps);
        let clock = FakeClock::new(1_000);

        let domain = d.mm.create_domain().unwrap();
        let mut p = RequestParams::default();
        p.0[0] = domain.0 .0 as u64;
        p.0[1] = 2;
        let outcome = d
            .dispatch(0, caller, RequestId::SpawnQuantum as u32, p, None, None, &clock)
            .unwrap();
        let DispatchOutcome::Complete(r) = outcome else { panic!("expected Complete") };
        let child = QuantumId(RawId(r.0[0] as u32));
        assert_eq!(d.quanta.get(child).unwrap().capabilities, caps);
    }

    #[test]
    fn allocate_then_translate_round_trip() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);
        let clock = FakeClock::new(1_000);
        let domain = d.quanta.get(caller).unwrap().domain;

        let mut p = RequestParams::default();
        p.0[0] = domain.0 .0 as u64;
        p.0[1] = 4096;
        p.0[2] = RegionFlags::READ.bits() as u64;
        let outcome = d
            .dispatch(0, caller, RequestId::Allocate as u32, p, None, None, &clock)
            .unwrap();
        let DispatchOutcome::Complete(r) = outcome else { panic!("expected Complete") };
        let base = r.0[0] as u32;

        let mut tp = RequestParams::default();
        tp.0[0] = domain.0 .0 as u64;
        tp.0[1] = base as u64;
        let outcome = d
            .dispatch(0, caller, RequestId::Translate as u32, tp, None, None, &clock)
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Complete(_)));
    }

    #[test]
    fn send_on_full_conduit_blocks_the_caller() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);
        let clock = FakeClock::new(1_000);

        let name = InlineName::new("pp");
        let mut cp = name.to_params();
        cp.0[5] = 8; // small enough to fill after one frame
        let outcome = d
            .dispatch(0, caller, RequestId::CreateConduit as u32, cp, None, None, &clock)
            .unwrap();
        let DispatchOutcome::Complete(r) = outcome else { panic!("expected Complete") };
        let conduit = ConduitId(RawId(r.0[0] as u32));

        let mut sp = RequestParams::default();
        sp.0[0] = conduit.0 .0 as u64;
        let payload = [0xAAu8; 16];
        let outcome = d
            .dispatch(0, caller, RequestId::Send as u32, sp, Some(&payload), None, &clock)
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Blocked));
        assert!(matches!(
            d.quanta.get(caller).unwrap().state,
            QuantumState::Blocked(BlockReason::ConduitSend(_))
        ));
    }

    #[test]
    fn send_wakes_a_blocked_receiver() {
        let mut d = dispatcher();
        let sender = boot_quantum(&mut d, CapabilitySet::ALL);
        let receiver = boot_quantum(&mut d, CapabilitySet::ALL);
        let clock = FakeClock::new(1_000);

        let name = InlineName::new("pp");
        let mut cp = name.to_params();
        cp.0[5] = 4096;
        let outcome = d
            .dispatch(0, sender, RequestId::CreateConduit as u32, cp, None, None, &clock)
            .unwrap();
        let DispatchOutcome::Complete(r) = outcome else { panic!("expected Complete") };
        let conduit = ConduitId(RawId(r.0[0] as u32));

        let mut rp = RequestParams::default();
        rp.0[0] = conduit.0 .0 as u64;
        let mut buf = [0u8; 16];
        let outcome = d
            .dispatch(0, receiver, RequestId::Receive as u32, rp, None, Some(&mut buf), &clock)
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Blocked));
        assert_eq!(d.sched.schedule(&mut d.quanta, 0, 10), None, "receiver off the ready queue while blocked");

        let mut sp = RequestParams::default();
        sp.0[0] = conduit.0 .0 as u64;
        d.dispatch(0, sender, RequestId::Send as u32, sp, Some(b"hi"), None, &clock)
            .unwrap();
        assert!(d.quanta.get(receiver).unwrap().is_ready());
    }

    #[test]
    fn set_timer_then_process_timers_wakes_a_sleeper() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);
        let clock = FakeClock::new(1_000);

        let mut tp = RequestParams::default();
        tp.0[0] = 5;
        d.dispatch(0, caller, RequestId::SetTimer as u32, tp, None, None, &clock)
            .unwrap();
        d.dispatch(0, caller, RequestId::Block as u32, RequestParams::default(), None, None, &clock)
            .unwrap();
        assert!(matches!(
            d.quanta.get(caller).unwrap().state,
            QuantumState::Blocked(BlockReason::Sleep)
        ));

        clock.advance(10);
        d.process_timers(&clock);
        assert!(d.quanta.get(caller).unwrap().is_ready());
    }

    #[test]
    fn destroy_quantum_removes_a_ready_quantum_from_its_queue() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);
        let target = boot_quantum(&mut d, CapabilitySet::empty());
        let clock = FakeClock::new(1_000);

        let mut p = RequestParams::default();
        p.0[0] = target.0 .0 as u64;
        d.dispatch(0, caller, RequestId::DestroyQuantum as u32, p, None, None, &clock)
            .unwrap();
        assert!(d.quanta.get(target).is_none());
    }

    #[test]
    fn wait_for_quantum_blocks_then_wakes_on_destroy() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);
        let target = boot_quantum(&mut d, CapabilitySet::empty());
        let clock = FakeClock::new(1_000);
        d.sched.schedule(&mut d.quanta, 0, 10);

        let mut p = RequestParams::default();
        p.0[0] = target.0 .0 as u64;
        let outcome = d
            .dispatch(0, caller, RequestId::WaitForQuantum as u32, p, None, None, &clock)
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Blocked));
        assert!(matches!(
            d.quanta.get(caller).unwrap().state,
            QuantumState::Blocked(BlockReason::QuantumExit(t)) if t == target
        ));

        d.dispatch(0, caller, RequestId::DestroyQuantum as u32, p, None, None, &clock)
            .unwrap();
        assert!(d.quanta.get(caller).unwrap().is_ready());
    }

    #[test]
    fn wait_for_quantum_on_an_already_gone_target_completes_immediately() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);
        let clock = FakeClock::new(1_000);

        let mut p = RequestParams::default();
        p.0[0] = 9999;
        let outcome = d
            .dispatch(0, caller, RequestId::WaitForQuantum as u32, p, None, None, &clock)
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Complete(_)));
    }

    #[test]
    fn query_time_reports_the_clock() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);
        let clock = FakeClock::new(42);

        let outcome = d
            .dispatch(0, caller, RequestId::QueryTime as u32, RequestParams::default(), None, None, &clock)
            .unwrap();
        let DispatchOutcome::Complete(r) = outcome else { panic!("expected Complete") };
        assert_eq!(r.0[0], 42);
    }

    #[test]
    fn query_stats_reports_creation_time_and_request_count() {
        let mut d = dispatcher();
        let clock = FakeClock::new(7);
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);

        d.dispatch(0, caller, RequestId::Yield as u32, RequestParams::default(), None, None, &clock)
            .unwrap();

        let mut p = RequestParams::default();
        p.0[0] = caller.0 .0 as u64;
        let outcome = d
            .dispatch(0, caller, RequestId::QueryStats as u32, p, None, None, &clock)
            .unwrap();
        let DispatchOutcome::Complete(r) = outcome else { panic!("expected Complete") };
        assert_eq!(r.0[0], 0, "boot_quantum spawns directly, bypassing SpawnQuantum's clock stamp");
        assert_eq!(r.0[4], 2, "yield plus this query itself are both counted");
    }

    #[test]
    fn page_fault_on_a_cow_region_resolves_without_faulting_the_quantum() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);
        let domain = d.quanta.get(caller).unwrap().domain;
        let child = d.mm.create_domain().unwrap();

        let mut ap = RequestParams::default();
        ap.0[0] = domain.0 .0 as u64;
        ap.0[1] = 4096;
        ap.0[2] = (RegionFlags::READ | RegionFlags::WRITE).bits() as u64;
        let clock = FakeClock::new(1_000);
        let outcome = d
            .dispatch(0, caller, RequestId::Allocate as u32, ap, None, None, &clock)
            .unwrap();
        let DispatchOutcome::Complete(r) = outcome else { panic!("expected Complete") };
        let base = r.0[0] as u32;

        let mut mp = RequestParams::default();
        mp.0[0] = domain.0 .0 as u64;
        mp.0[1] = base as u64;
        mp.0[2] = 4096;
        d.dispatch(0, caller, RequestId::MarkCow as u32, mp, None, None, &clock)
            .unwrap();
        d.mm.share_region(domain, base, child).unwrap();

        d.sched.schedule(&mut d.quanta, 0, 10);
        d.handle_page_fault(0, domain, base).unwrap();
        assert!(!matches!(d.quanta.get(caller).unwrap().state, QuantumState::Faulted(_)));
    }

    #[test]
    fn page_fault_on_a_plain_region_faults_the_quantum() {
        let mut d = dispatcher();
        let caller = boot_quantum(&mut d, CapabilitySet::ALL);
        let domain = d.quanta.get(caller).unwrap().domain;

        let mut ap = RequestParams::default();
        ap.0[0] = domain.0 .0 as u64;
        ap.0[1] = 4096;
        ap.0[2] = RegionFlags::READ.bits() as u64;
        let clock = FakeClock::new(1_000);
        let outcome = d
            .dispatch(0, caller, RequestId::Allocate as u32, ap, None, None, &clock)
            .unwrap();
        let DispatchOutcome::Complete(r) = outcome else { panic!("expected Complete") };
        let base = r.0[0] as u32;

        d.sched.schedule(&mut d.quanta, 0, 10);
        let err = d.handle_page_fault(0, domain, base).unwrap_err();
        assert!(matches!(err, KernelError::Recoverable(ErrorCode::PermissionDenied)));
        assert!(matches!(d.quanta.get(caller).unwrap().state, QuantumState::Faulted(_)));
    }
}
