// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A single conduit: a bounded byte ring carrying length-prefixed messages,
//! plus the quanta waiting to send into or receive from it.
//!
//! The ring itself is `circq::CircQ`, the teacher's payload-agnostic
//! circular byte queue (`lib/circq`). `circq` is built to borrow memory it
//! doesn't own (so a queue can live in a named `static` for debug
//! visibility); a conduit instead owns its backing buffer and is created
//! and destroyed at run time, so it persists `head`/`tail`/`available`
//! itself and reconstructs a transient `CircQ` over them
//! (`CircQ::from_parts`) for each operation. The length-prefix framing this
//! module adds on top mirrors how the teacher layers `ssmarshal`-encoded
//! messages over raw `USlice` copies in `sys/kern/src/kipc.rs`.

use alloc::vec;
use alloc::vec::Vec;
use circq::CircQ;
use continuum_abi::{ErrorCode, QuantumId};
use serde::{Deserialize, Serialize};

use crate::arena::Arena;
use crate::mm::slab::{Slab, SlabHandle};
use crate::quantum::Quantum;
use crate::waitq::List;

#[derive(Serialize, Deserialize)]
struct FrameHeader {
    len: u32,
}

const HEADER_LEN: usize = 4;

/// A conduit's lifecycle, per spec.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConduitState {
    /// Accepting sends and receives normally.
    Open,
    /// The last open handle has dropped but waiters still need draining.
    /// Reachable only transiently, between [`Conduit::close`] zeroing the
    /// refcount and the table's [`Conduit::drain_waiters`] call.
    Closing,
    /// Refcount is zero and every waiter has been drained; sends and
    /// receives now fail with `Closed`.
    Closed,
    /// An internal invariant broke (e.g. corrupt frame header). The conduit
    /// must be torn down; every operation fails with `Broken`.
    Error,
}

/// A bounded, length-framed byte channel.
pub struct Conduit {
    backing: Vec<u8>,
    head: usize,
    tail: usize,
    available: usize,
    open_count: u32,
    state: ConduitState,
    max_message_size: usize,
    /// Quanta blocked in `receive`/`peek` on this specific conduit.
    pub receivers: List,
    /// Quanta blocked in `send` because the ring is full.
    pub senders: List,
    /// Quanta blocked in a `select` that includes this conduit among
    /// others. A successful send or close wakes (at most) one of these in
    /// addition to the head of `receivers`.
    select_waiters: Slab<QuantumId>,
}

impl Conduit {
    pub fn new(capacity: usize, max_message_size: usize) -> Self {
        Self {
            backing: vec![0; capacity],
            head: 0,
            tail: 0,
            available: 0,
            open_count: 1,
            state: ConduitState::Open,
            max_message_size,
            receivers: List::new(),
            senders: List::new(),
            select_waiters: Slab::new(),
        }
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn open(&mut self) {
        self.open_count += 1;
    }

    /// Drops one open handle, returning `true` once the last one is gone
    /// and the conduit is ready to be torn down (drained via
    /// [`Self::drain_waiters`] and removed from the table).
    pub fn close(&mut self) -> bool {
        self.open_count = self.open_count.saturating_sub(1);
        if self.open_count == 0 {
            self.state = ConduitState::Closing;
        }
        self.open_count == 0
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConduitState::Closing | ConduitState::Closed)
    }

    pub fn state(&self) -> ConduitState {
        self.state
    }

    pub fn has_message(&self) -> bool {
        self.available > 0
    }

    /// The error a send/receive/peek against this conduit would currently
    /// fail with, or `None` if it's open for business.
    fn io_error(&self) -> Option<ErrorCode> {
        match self.state {
            ConduitState::Open => None,
            ConduitState::Closing | ConduitState::Closed => Some(ErrorCode::Closed),
            ConduitState::Error => Some(ErrorCode::Broken),
        }
    }

    /// Pops every quantum parked on this conduit — senders, receivers, and
    /// select waiters alike — for the caller to unblock with a `Closed`
    /// error. Marks the conduit fully [`ConduitState::Closed`].
    pub fn drain_waiters(&mut self, quanta: &mut Arena<Quantum>) -> Vec<QuantumId> {
        let mut woken = Vec::new();
        while let Some(i) = self.receivers.pop_front(quanta) {
            woken.extend(quanta_id_at(quanta, i));
        }
        while let Some(i) = self.senders.pop_front(quanta) {
            woken.extend(quanta_id_at(quanta, i));
        }
        while let Some(id) = self.select_waiters.take_any() {
            woken.push(id);
        }
        self.state = ConduitState::Closed;
        woken
    }

    fn with_ring<R>(&mut self, f: impl FnOnce(&mut CircQ<'_>) -> R) -> R {
        let mut ring = CircQ::from_parts(&mut self.backing, self.head, self.tail, self.available);
        let result = f(&mut ring);
        self.head = ring.head();
        self.tail = ring.tail();
        self.available = ring.available();
        result
    }

    /// Attempts to enqueue `payload`, framed with a length header. Returns
    /// `Err(WouldBlock)` if the ring doesn't currently have room for the
    /// whole frame; on success, wakes one waiting receiver and one select
    /// waiter if present.
    pub fn try_send(
        &mut self,
        quanta: &mut Arena<Quantum>,
        payload: &[u8],
    ) -> Result<Option<QuantumId>, ErrorCode> {
        if let Some(err) = self.io_error() {
            return Err(err);
        }
        if payload.len() > self.max_message_size {
            return Err(ErrorCode::MessageTooLarge);
        }
        let mut frame = vec![0u8; HEADER_LEN];
        ssmarshal::serialize(&mut frame, &FrameHeader { len: payload.len() as u32 })
            .map_err(|_| ErrorCode::Internal)?;
        frame.extend_from_slice(payload);

        let enqueued = self.with_ring(|ring| ring.enqueue(&frame));
        enqueued.map_err(|_| ErrorCode::WouldBlock)?;

        let woken_receiver = self.receivers.pop_front(quanta).and_then(|i| quanta_id_at(quanta, i));
        let woken_selector = self.select_waiters.take_any();
        Ok(woken_receiver.or(woken_selector))
    }

    /// Registers `quantum` as waiting to send once room is available.
    pub fn register_sender(&mut self, quanta: &mut Arena<Quantum>, quantum_index: usize) {
        self.senders.push_back(quanta, quantum_index);
    }

    /// Registers `quantum` as waiting to receive a message.
    pub fn register_receiver(&mut self, quanta: &mut Arena<Quantum>, quantum_index: usize) {
        self.receivers.push_back(quanta, quantum_index);
    }

    /// Wakes and removes the front of the senders queue, e.g. after a
    /// `receive` frees up ring space. The woken quantum must itself retry
    /// its send; nothing here resumes it automatically.
    pub fn wake_one_sender(&mut self, quanta: &mut Arena<Quantum>) -> Option<QuantumId> {
        self.senders.pop_front(quanta).and_then(|i| quanta_id_at(quanta, i))
    }

    /// Registers `quantum` as one of several conduits a `select` is
    /// waiting across.
    pub fn register_select_waiter(&mut self, quantum: QuantumId) -> SlabHandle {
        self.select_waiters.alloc(quantum)
    }

    pub fn cancel_select_waiter(&mut self, handle: SlabHandle) {
        self.select_waiters.free(handle);
    }

    /// Receives one message into `dest`. Fails with `MessageTooLarge` if
    /// `dest` is shorter than the waiting message, leaving it in the ring
    /// for a retry with a bigger buffer. Returns the number of bytes
    /// copied on success.
    pub fn try_receive(&mut self, dest: &mut [u8]) -> Result<usize, ErrorCode> {
        self.try_take(dest, false)
    }

    /// Like [`Self::try_receive`] but leaves the message in the ring even
    /// on success.
    pub fn try_peek(&mut self, dest: &mut [u8]) -> Result<usize, ErrorCode> {
        self.try_take(dest, true)
    }

    fn try_take(&mut self, dest: &mut [u8], peek: bool) -> Result<usize, ErrorCode> {
        if let Some(err) = self.io_error() {
            return Err(err);
        }
        if self.available == 0 {
            return Err(ErrorCode::WouldBlock);
        }
        let saved = (self.head, self.tail, self.available);

        let mut header_buf = [0u8; HEADER_LEN];
        self.with_ring(|ring| ring.dequeue_into(&mut header_buf))
            .map_err(|_| ErrorCode::Internal)?;
        let header: FrameHeader = match ssmarshal::deserialize(&header_buf) {
            Ok((header, _)) => header,
            Err(_) => {
                self.state = ConduitState::Error;
                return Err(ErrorCode::Broken);
            }
        };
        let len = header.len as usize;

        if len > dest.len() {
            // Leave the message (header included) exactly where it was;
            // the caller needs a bigger buffer and can retry.
            let (head, tail, available) = saved;
            self.head = head;
            self.tail = tail;
            self.available = available;
            return Err(ErrorCode::MessageTooLarge);
        }

        let mut payload = vec![0u8; len];
        self.with_ring(|ring| ring.dequeue_into(&mut payload))
            .map_err(|_| ErrorCode::Internal)?;
        dest[..len].copy_from_slice(&payload);

        if peek {
            let (head, tail, available) = saved;
            self.head = head;
            self.tail = tail;
            self.available = available;
        }

        Ok(len)
    }
}

fn quanta_id_at(quanta: &Arena<Quantum>, index: usize) -> Option<QuantumId> {
    quanta.generation_at(index).map(|g| QuantumId::for_index_and_gen(index, g))
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_abi::{DomainId, Priority, RawId};

    fn fresh_quanta() -> Arena<Quantum> {
        Arena::new()
    }

    #[test]
    fn fifo_single_sender_receiver() {
        let mut quanta = fresh_quanta();
        let mut conduit = Conduit::new(64, 32);
        conduit.try_send(&mut quanta, b"hello").unwrap();
        conduit.try_send(&mut quanta, b"world").unwrap();

        let mut buf = [0u8; 16];
        let n = conduit.try_receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = conduit.try_receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn receive_on_empty_conduit_would_block() {
        let mut conduit = Conduit::new(64, 32);
        let mut buf = [0u8; 16];
        assert_eq!(conduit.try_receive(&mut buf), Err(ErrorCode::WouldBlock));
    }

    #[test]
    fn send_wakes_waiting_reader() {
        let mut quanta = fresh_quanta();
        let (index, generation) = quanta
            .try_insert(Quantum::new(DomainId(RawId(0)), Priority(0)), 8)
            .unwrap();
        let id = QuantumId::for_index_and_gen(index, generation);

        let mut conduit = Conduit::new(64, 32);
        conduit.register_receiver(&mut quanta, index);
        let woken = conduit.try_send(&mut quanta, b"ping").unwrap();
        assert_eq!(woken, Some(id));
    }

    #[test]
    fn oversize_receive_leaves_message_in_ring() {
        let mut quanta = fresh_quanta();
        let mut conduit = Conduit::new(64, 32);
        conduit.try_send(&mut quanta, b"hello world").unwrap();
        let mut small = [0u8; 4];
        assert_eq!(conduit.try_receive(&mut small), Err(ErrorCode::MessageTooLarge));
        assert_eq!(small, [0u8; 4], "nothing was copied");

        let mut big = [0u8; 32];
        let n = conduit.try_receive(&mut big).unwrap();
        assert_eq!(&big[..n], b"hello world", "message is intact after the failed attempt");
    }

    #[test]
    fn oversize_peek_leaves_message_in_ring() {
        let mut quanta = fresh_quanta();
        let mut conduit = Conduit::new(64, 32);
        conduit.try_send(&mut quanta, b"hello world").unwrap();
        let mut small = [0u8; 4];
        assert_eq!(conduit.try_peek(&mut small), Err(ErrorCode::MessageTooLarge));

        let mut big = [0u8; 32];
        let n = conduit.try_receive(&mut big).unwrap();
        assert_eq!(&big[..n], b"hello world");
    }

    #[test]
    fn oversize_send_fails_with_message_too_large() {
        let mut quanta = fresh_quanta();
        let mut conduit = Conduit::new(64, 8);
        assert_eq!(conduit.try_send(&mut quanta, b"this is too long"), Err(ErrorCode::MessageTooLarge));
    }

    #[test]
    fn peek_does_not_consume_the_message() {
        let mut quanta = fresh_quanta();
        let mut conduit = Conduit::new(64, 32);
        conduit.try_send(&mut quanta, b"hi").unwrap();
        let mut buf = [0u8; 4];
        let n = conduit.try_peek(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        let n2 = conduit.try_receive(&mut buf).unwrap();
        assert_eq!(&buf[..n2], b"hi");
    }

    #[test]
    fn destroyed_only_after_refcount_zero_and_closed() {
        let mut conduit = Conduit::new(64, 32);
        conduit.open();
        assert!(!conduit.close());
        assert!(conduit.close());
        assert!(conduit.is_closed());
    }

    #[test]
    fn drain_waiters_wakes_every_blocked_role_and_marks_closed() {
        let mut quanta = fresh_quanta();
        let mut conduit = Conduit::new(8, 32);
        let mut spawn = || {
            let (index, generation) =
                quanta.try_insert(Quantum::new(DomainId(RawId(0)), Priority(0)), 8).unwrap();
            (index, QuantumId::for_index_and_gen(index, generation))
        };
        let (receiver_index, receiver) = spawn();
        let (sender_index, sender) = spawn();
        let (_, selector) = spawn();

        conduit.register_receiver(&mut quanta, receiver_index);
        conduit.register_sender(&mut quanta, sender_index);
        conduit.register_select_waiter(selector);

        conduit.close();
        let mut woken = conduit.drain_waiters(&mut quanta);
        woken.sort_by_key(|id| id.0 .0);
        let mut expected = [receiver, sender, selector];
        expected.sort_by_key(|id| id.0 .0);
        assert_eq!(woken, expected);
        assert_eq!(conduit.state(), ConduitState::Closed);
        assert_eq!(conduit.try_send(&mut quanta, b"x"), Err(ErrorCode::Closed));
    }

    #[test]
    fn send_wakes_a_select_waiter_when_no_receiver_registered() {
        let mut quanta = fresh_quanta();
        let (index, generation) = quanta
            .try_insert(Quantum::new(DomainId(RawId(0)), Priority(0)), 8)
            .unwrap();
        let id = QuantumId::for_index_and_gen(index, generation);

        let mut conduit = Conduit::new(64, 32);
        conduit.register_select_waiter(id);
        let woken = conduit.try_send(&mut quanta, b"ping").unwrap();
        assert_eq!(woken, Some(id));
    }

    #[test]
    fn wake_one_sender_wakes_the_front_of_the_senders_queue() {
        let mut quanta = fresh_quanta();
        let (index, generation) = quanta
            .try_insert(Quantum::new(DomainId(RawId(0)), Priority(0)), 8)
            .unwrap();
        let id = QuantumId::for_index_and_gen(index, generation);

        let mut conduit = Conduit::new(64, 32);
        conduit.register_sender(&mut quanta, index);
        assert_eq!(conduit.wake_one_sender(&mut quanta), Some(id));
        assert_eq!(conduit.wake_one_sender(&mut quanta), None);
    }

    #[test]
    fn send_to_closed_conduit_fails() {
        let mut quanta = fresh_quanta();
        let mut conduit = Conduit::new(64, 32);
        conduit.close();
        assert_eq!(conduit.try_send(&mut quanta, b"x"), Err(ErrorCode::Closed));
    }
}
