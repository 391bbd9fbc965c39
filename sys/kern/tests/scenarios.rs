// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios and cross-cutting round-trip/boundary properties
//! that don't fit naturally as a unit test inside a single module.

use continuum_abi::{
    CapabilitySet, DomainId, ErrorCode, InlineName, Priority, QuantumId, QuantumState, RegionFlags,
    RequestId, RequestParams,
};
use continuum_kern::clock::FakeClock;
use continuum_kern::config::KernelConfig;
use continuum_kern::dispatch::DispatchOutcome;
use continuum_kern::err::KernelError;
use continuum_kern::Kernel;

fn boot() -> Kernel {
    Kernel::new(&KernelConfig::default(), 64)
}

/// Spawns a quantum with `caps` in a fresh domain, ready on CPU 0.
fn spawn(kernel: &mut Kernel, caps: CapabilitySet) -> QuantumId {
    let domain = kernel.dispatcher.mm.create_domain().unwrap();
    let max_quanta = kernel.dispatcher.quanta.len() + 1;
    let id = kernel.dispatcher.quanta.spawn(domain, Priority(0), caps, 0, max_quanta.max(256)).unwrap();
    kernel.dispatcher.sched.enqueue(&mut kernel.dispatcher.quanta, id, 0);
    id
}

fn complete(outcome: DispatchOutcome) -> RequestParams {
    match outcome {
        DispatchOutcome::Complete(r) => r,
        DispatchOutcome::Blocked => panic!("expected Complete, got Blocked"),
    }
}

fn create_conduit(kernel: &mut Kernel, clock: &FakeClock, caller: QuantumId, name: &str, capacity: u64) -> u32 {
    let mut p = InlineName::new(name).to_params();
    p.0[5] = capacity;
    let r = complete(kernel.dispatch(0, caller, RequestId::CreateConduit as u32, p, None, None, clock).unwrap());
    r.0[0] as u32
}

fn send(kernel: &mut Kernel, clock: &FakeClock, cpu: usize, caller: QuantumId, conduit: u32, payload: &[u8]) -> Result<DispatchOutcome, KernelError> {
    let mut p = RequestParams::default();
    p.0[0] = conduit as u64;
    kernel.dispatch(cpu, caller, RequestId::Send as u32, p, Some(payload), None, clock)
}

fn receive(kernel: &mut Kernel, clock: &FakeClock, cpu: usize, caller: QuantumId, conduit: u32, dest: &mut [u8]) -> Result<DispatchOutcome, KernelError> {
    let mut p = RequestParams::default();
    p.0[0] = conduit as u64;
    kernel.dispatch(cpu, caller, RequestId::Receive as u32, p, None, Some(dest), clock)
}

/// Scenario 1 — Ping-pong: A sends 0x41 to "pp", B receives it, B sends
/// 0x42 back, A receives it.
#[test]
fn scenario_1_ping_pong() {
    let mut kernel = boot();
    let clock = FakeClock::new(1_000);
    let a = spawn(&mut kernel, CapabilitySet::ALL);
    let b = spawn(&mut kernel, CapabilitySet::ALL);
    let pp = create_conduit(&mut kernel, &clock, a, "pp", 4096);

    send(&mut kernel, &clock, 0, a, pp, &[0x41]).unwrap();
    let mut buf = [0u8; 1];
    let outcome = receive(&mut kernel, &clock, 0, b, pp, &mut buf).unwrap();
    let r = complete(outcome);
    assert_eq!(r.0[0], 1, "one byte received");
    assert_eq!(buf, [0x41]);

    send(&mut kernel, &clock, 0, b, pp, &[0x42]).unwrap();
    let mut buf = [0u8; 1];
    receive(&mut kernel, &clock, 0, a, pp, &mut buf).unwrap();
    assert_eq!(buf, [0x42]);
}

/// Scenario 3 — Select: X and Y start empty; T selects on both and blocks;
/// a send to Y wakes T, whose retried select then resolves to Y.
#[test]
fn scenario_3_select_resolves_to_the_conduit_that_received() {
    let mut kernel = boot();
    let clock = FakeClock::new(1_000);
    let t = spawn(&mut kernel, CapabilitySet::ALL);
    let sender = spawn(&mut kernel, CapabilitySet::ALL);
    let x = create_conduit(&mut kernel, &clock, t, "x", 1024);
    let y = create_conduit(&mut kernel, &clock, t, "y", 1024);

    let mut p = RequestParams::default();
    p.0[0] = 2;
    p.0[1] = x as u64;
    p.0[2] = y as u64;
    kernel.dispatcher.sched.schedule(&mut kernel.dispatcher.quanta, 0, 10);
    let outcome = kernel.dispatch(0, t, RequestId::Select as u32, p, None, None, &clock).unwrap();
    assert!(matches!(outcome, DispatchOutcome::Blocked));
    assert!(matches!(kernel.dispatcher.quanta.get(t).unwrap().state, QuantumState::Blocked(_)));

    send(&mut kernel, &clock, 0, sender, y, &[0x99]).unwrap();
    assert!(kernel.dispatcher.quanta.get(t).unwrap().is_ready(), "select wakes on the send");

    kernel.dispatcher.sched.schedule(&mut kernel.dispatcher.quanta, 0, 10);
    let r = complete(kernel.dispatch(0, t, RequestId::Select as u32, p, None, None, &clock).unwrap());
    assert_eq!(r.0[0] as u32, y, "select resolves to the conduit that actually has a message");
}

/// Scenario 4 — Back-pressure: fill a small conduit, observe a
/// non-blocking WouldBlock once full, then a blocking send that parks the
/// caller instead of failing.
#[test]
fn scenario_4_back_pressure_blocks_rather_than_fails() {
    let mut kernel = boot();
    let clock = FakeClock::new(1_000);
    let producer = spawn(&mut kernel, CapabilitySet::ALL);
    // Small enough that two 64-byte messages (plus 4-byte length headers)
    // exhaust the ring.
    let z = create_conduit(&mut kernel, &clock, producer, "z", 136);

    send(&mut kernel, &clock, 0, producer, z, &[7; 64]).unwrap();
    send(&mut kernel, &clock, 0, producer, z, &[7; 64]).unwrap();

    kernel.dispatcher.sched.schedule(&mut kernel.dispatcher.quanta, 0, 10);
    let outcome = send(&mut kernel, &clock, 0, producer, z, &[7; 64]).unwrap();
    assert!(matches!(outcome, DispatchOutcome::Blocked), "full ring parks the sender instead of erroring");
    assert!(matches!(kernel.dispatcher.quanta.get(producer).unwrap().state, QuantumState::Blocked(_)));
}

/// Scenario 6 — Capability denial: a quantum without CONDUIT_IO is denied
/// at the dispatcher, before the conduit is ever touched.
#[test]
fn scenario_6_capability_denial_never_touches_the_conduit() {
    let mut kernel = boot();
    let clock = FakeClock::new(1_000);
    let owner = spawn(&mut kernel, CapabilitySet::ALL);
    let restricted = spawn(&mut kernel, CapabilitySet::ALL & !CapabilitySet::CONDUIT_IO);
    let z = create_conduit(&mut kernel, &clock, owner, "z", 1024);

    let err = send(&mut kernel, &clock, 0, restricted, z, &[1]).unwrap_err();
    assert!(matches!(err, KernelError::Recoverable(ErrorCode::PermissionDenied)));

    let mut buf = [0u8; 16];
    let outcome = receive(&mut kernel, &clock, 0, owner, z, &mut buf).unwrap();
    assert!(matches!(outcome, DispatchOutcome::Blocked), "conduit untouched, still empty");
}

/// `allocate` followed by `free` restores the region table to its prior
/// shape: the next `allocate` of the same size lands at the same base.
#[test]
fn round_trip_allocate_then_free_restores_region_table_shape() {
    let mut kernel = boot();
    let clock = FakeClock::new(1_000);
    let caller = spawn(&mut kernel, CapabilitySet::ALL);
    let domain = kernel.dispatcher.quanta.get(caller).unwrap().domain;

    let mut p = RequestParams::default();
    p.0[0] = domain.0 .0 as u64;
    p.0[1] = 4096;
    p.0[2] = (RegionFlags::READ | RegionFlags::WRITE).bits() as u64;
    let r1 = complete(kernel.dispatch(0, caller, RequestId::Allocate as u32, p, None, None, &clock).unwrap());

    let mut fp = RequestParams::default();
    fp.0[0] = domain.0 .0 as u64;
    fp.0[1] = r1.0[0];
    kernel.dispatch(0, caller, RequestId::Free as u32, fp, None, None, &clock).unwrap();

    let r2 = complete(kernel.dispatch(0, caller, RequestId::Allocate as u32, p, None, None, &clock).unwrap());
    assert_eq!(r1.0[0], r2.0[0], "freeing restores the address space to its prior shape");
}

/// `create_domain` followed by `destroy_domain` leaves the frame pool's
/// free-page count unchanged.
#[test]
fn round_trip_create_then_destroy_domain_leaves_pool_untouched() {
    let mut kernel = boot();
    let before = kernel.dispatcher.mm.frame_count();
    let domain = kernel.dispatcher.mm.create_domain().unwrap();
    kernel.dispatcher.mm.destroy_domain(domain).unwrap();
    assert_eq!(kernel.dispatcher.mm.frame_count(), before);
}

/// `send` + `receive` of an N-byte message returns the same bytes, in
/// order, regardless of message size.
#[test]
fn round_trip_send_receive_preserves_bytes() {
    let mut kernel = boot();
    let clock = FakeClock::new(1_000);
    let caller = spawn(&mut kernel, CapabilitySet::ALL);
    let c = create_conduit(&mut kernel, &clock, caller, "rt", 4096);

    let payload: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();
    send(&mut kernel, &clock, 0, caller, c, &payload).unwrap();
    let mut dest = vec![0u8; payload.len()];
    let outcome = receive(&mut kernel, &clock, 0, caller, c, &mut dest).unwrap();
    let r = complete(outcome);
    assert_eq!(r.0[0] as usize, payload.len());
    assert_eq!(dest, payload);
}

/// `block` then `unblock` leaves the target quantum Ready.
#[test]
fn round_trip_block_then_unblock_leaves_quantum_ready() {
    let mut kernel = boot();
    let clock = FakeClock::new(1_000);
    let a = spawn(&mut kernel, CapabilitySet::ALL);
    let controller = spawn(&mut kernel, CapabilitySet::ALL);

    kernel.dispatcher.sched.schedule(&mut kernel.dispatcher.quanta, 0, 10);
    kernel.dispatch(0, a, RequestId::Block as u32, RequestParams::default(), None, None, &clock).unwrap();
    assert!(matches!(kernel.dispatcher.quanta.get(a).unwrap().state, QuantumState::Blocked(_)));

    let mut p = RequestParams::default();
    p.0[0] = a.0 .0 as u64;
    kernel.dispatch(0, controller, RequestId::Unblock as u32, p, None, None, &clock).unwrap();
    assert!(kernel.dispatcher.quanta.get(a).unwrap().is_ready());
}

/// Boundary: a zero-length message is allowed and is delivered with size 0.
#[test]
fn boundary_zero_length_message_is_delivered() {
    let mut kernel = boot();
    let clock = FakeClock::new(1_000);
    let caller = spawn(&mut kernel, CapabilitySet::ALL);
    let c = create_conduit(&mut kernel, &clock, caller, "zero", 1024);

    send(&mut kernel, &clock, 0, caller, c, &[]).unwrap();
    let mut dest = [0u8; 8];
    let r = complete(receive(&mut kernel, &clock, 0, caller, c, &mut dest).unwrap());
    assert_eq!(r.0[0], 0);
}

/// Boundary: a message exactly at the conduit's configured
/// `default_max_message_size` is allowed.
#[test]
fn boundary_message_exactly_at_max_size_is_allowed() {
    let mut kernel = boot();
    let clock = FakeClock::new(1_000);
    let caller = spawn(&mut kernel, CapabilitySet::ALL);
    let max = KernelConfig::default().default_max_message_size;
    let c = create_conduit(&mut kernel, &clock, caller, "maxmsg", (max * 2) as u64);

    let payload = vec![0xAB; max];
    let outcome = send(&mut kernel, &clock, 0, caller, c, &payload).unwrap();
    assert!(matches!(outcome, DispatchOutcome::Complete(_)));
}

/// Unknown request ids are rejected at the dispatcher before any
/// capability or argument is inspected.
#[test]
fn unknown_request_id_is_no_such_call_end_to_end() {
    let mut kernel = boot();
    let clock = FakeClock::new(1_000);
    let caller = spawn(&mut kernel, CapabilitySet::ALL);
    let err = kernel.dispatch(0, caller, 9999, RequestParams::default(), None, None, &clock).unwrap_err();
    assert!(matches!(err, KernelError::Recoverable(ErrorCode::NoSuchCall)));
}

/// `DomainId` not yet covered by a unit test: a fresh domain starts with
/// no regions at all, so translating any address fails cleanly rather
/// than reading uninitialized state.
#[test]
fn fresh_domain_has_no_regions() {
    let mut kernel = boot();
    let domain: DomainId = kernel.dispatcher.mm.create_domain().unwrap();
    assert!(kernel.dispatcher.mm.translate(domain, 0).is_err());
}
