// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Continuum kernel.
//!
//! This is the application-independent execution substrate: a scheduler, a
//! memory manager, and named IPC conduits, reachable only through the
//! capability-checked system-request dispatcher in [`dispatch`]. Everything
//! here runs in whatever privileged mode the platform provides; there is no
//! `arch` layer in this crate, so a platform integration supplies its own
//! trap entry that decodes a request off its register convention and calls
//! [`Kernel::dispatch`].
//!
//! # Design principles
//!
//! 1. Separate compilation. The kernel and each quantum's image are built
//!    independently and combined by a loader.
//! 2. Static configuration. Scheduler, memory, and conduit limits are fixed
//!    at boot via [`config::KernelConfig`], not negotiated at run time.
//! 3. A strong preference for safe code where reasonable.
//! 4. A preference for simple, clear algorithms over fast, clever ones.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arena;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod err;
pub mod fail;
pub mod ipc;
pub mod mm;
pub mod quantum;
pub mod sched;
pub mod startup;
pub mod stats;
pub mod trace;
pub mod waitq;

use clock::Clock;
use config::KernelConfig;
use continuum_abi::{DomainId, QuantumId, RequestParams};
use dispatch::{DispatchOutcome, Dispatcher};
use err::KernelError;

/// The kernel as a whole: every subsystem plus the one entry point
/// (`dispatch`) and the one periodic callback (`on_timer_tick`) a platform
/// integration needs to drive it.
pub struct Kernel {
    pub dispatcher: Dispatcher,
    base_time_slice_ticks: u64,
}

impl Kernel {
    pub fn new(config: &KernelConfig, frame_count: u32) -> Self {
        Self {
            dispatcher: Dispatcher::new(config, frame_count),
            base_time_slice_ticks: config.base_time_slice_ticks,
        }
    }

    /// Routes one system request from `caller`, running on `cpu`, through
    /// the dispatcher. See [`Dispatcher::dispatch`].
    #[allow(clippy::too_many_arguments)]
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
        self.dispatcher.dispatch(cpu, caller, request_id_raw, params, lease_in, lease_out, clock)
    }

    /// The timer-interrupt handler contract from spec.md §6.2: reads the
    /// clock, decrements `cpu`'s running quantum's time slice, preempting it
    /// if exhausted, then wakes any quantum whose `SetTimer` deadline has
    /// passed.
    pub fn on_timer_tick(&mut self, cpu: usize, clock: &dyn Clock) {
        let now = clock.now_ticks();
        fail::record_snapshot(now.0, self.dispatcher.quanta.len());
        self.dispatcher.sched.tick(&mut self.dispatcher.quanta, cpu, clock, self.base_time_slice_ticks);
        self.dispatcher.process_timers(clock);
    }

    /// Entry point for a write fault trapped outside the request protocol.
    /// See [`Dispatcher::handle_page_fault`].
    pub fn handle_page_fault(&mut self, cpu: usize, domain: DomainId, addr: u32) -> Result<(), KernelError> {
        self.dispatcher.handle_page_fault(cpu, domain, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::FakeClock;
    use continuum_abi::{CapabilitySet, Priority, QuantumName, RequestId};

    #[test]
    fn new_kernel_boots_with_no_quanta() {
        let kernel = Kernel::new(&KernelConfig::default(), 16);
        assert!(kernel.dispatcher.quanta.is_empty());
    }

    #[test]
    fn on_timer_tick_preempts_an_exhausted_quantum() {
        let config = KernelConfig { base_time_slice_ticks: 1, ..KernelConfig::default() };
        let mut kernel = Kernel::new(&config, 16);
        let clock = FakeClock::new(1_000);

        let domain = kernel.dispatcher.mm.create_domain().unwrap();
        let a = kernel
            .dispatcher
            .quanta
            .spawn(domain, Priority(0), CapabilitySet::ALL, 0, 64, QuantumName::default(), None, 0)
            .unwrap();
        let b = kernel
            .dispatcher
            .quanta
            .spawn(domain, Priority(0), CapabilitySet::ALL, 0, 64, QuantumName::default(), None, 0)
            .unwrap();
        kernel.dispatcher.sched.enqueue(&mut kernel.dispatcher.quanta, a, 0);
        kernel.dispatcher.sched.enqueue(&mut kernel.dispatcher.quanta, b, 0);
        kernel.dispatcher.sched.schedule(&mut kernel.dispatcher.quanta, 0, 1);

        kernel.on_timer_tick(0, &clock);
        assert_eq!(kernel.dispatcher.sched.current(0), Some(b));
    }

    #[test]
    fn dispatch_round_trips_through_the_kernel_facade() {
        let mut kernel = Kernel::new(&KernelConfig::default(), 16);
        let clock = FakeClock::new(1_000);
        let domain = kernel.dispatcher.mm.create_domain().unwrap();
        let caller = kernel
            .dispatcher
            .quanta
            .spawn(domain, Priority(0), CapabilitySet::ALL, 0, 64, QuantumName::default(), None, 0)
            .unwrap();
        kernel.dispatcher.sched.enqueue(&mut kernel.dispatcher.quanta, caller, 0);

        let outcome = kernel
            .dispatch(0, caller, RequestId::CreateDomain as u32, RequestParams::default(), None, None, &clock)
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Complete(_)));
    }
}
