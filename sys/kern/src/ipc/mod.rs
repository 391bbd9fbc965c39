// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named conduits: creation, lookup by name, and the operations that move
//! messages and block/wake quanta across them.

pub mod conduit;

use alloc::string::String;
use alloc::vec::Vec;

use continuum_abi::{ConduitId, ErrorCode, QuantumId};

use crate::arena::Arena;
use crate::err::KernelError;
use crate::mm::slab::SlabHandle;
use crate::quantum::Quantum;
use conduit::Conduit;

struct Entry {
    name: String,
    conduit: Conduit,
}

/// Owns every live conduit and the name → id lookup (a linear scan, per
/// SPEC_FULL.md: conduit counts in this kernel are modest enough that a
/// name table doesn't pay for itself).
pub struct ConduitTable {
    arena: Arena<Entry>,
    max_conduits: usize,
    default_max_message_size: usize,
}

impl ConduitTable {
    pub fn new(max_conduits: usize, default_max_message_size: usize) -> Self {
        Self { arena: Arena::new(), max_conduits, default_max_message_size }
    }

    /// Finds a conduit by name, skipping zombie entries a closed-with-
    /// waiters [`Self::close`] left behind: those are dead in all but name
    /// and shouldn't satisfy `open` or block a fresh `create`.
    fn find_by_name(&self, name: &str) -> Option<ConduitId> {
        for (index, entry) in self.arena.iter() {
            if entry.name == name && !entry.conduit.is_closed() {
                let generation = self.arena.generation_at(index)?;
                return Some(ConduitId::for_index_and_gen(index, generation));
            }
        }
        None
    }

    pub fn create(&mut self, name: &str, capacity: usize) -> Result<ConduitId, KernelError> {
        if self.find_by_name(name).is_some() {
            return Err(KernelError::Recoverable(ErrorCode::AlreadyExists));
        }
        let entry = Entry {
            name: String::from(name),
            conduit: Conduit::new(capacity, self.default_max_message_size),
        };
        self.arena
            .try_insert(entry, self.max_conduits)
            .map(|(i, g)| ConduitId::for_index_and_gen(i, g))
            .map_err(|_| KernelError::Recoverable(ErrorCode::OutOfMemory))
    }

    /// Opens an existing conduit by name, bumping its open-handle count.
    pub fn open(&mut self, name: &str) -> Result<ConduitId, KernelError> {
        let id = self.find_by_name(name).ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        self.arena
            .get_mut(id.index(), id.generation())
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?
            .conduit
            .open();
        Ok(id)
    }

    /// Drops one open handle. Once the last handle is gone, every quantum
    /// still parked on the conduit (a sender, a receiver, a select waiter)
    /// is drained and returned so the caller can unblock it; a retried
    /// send/receive/select then observes the conduit's `Closed` state and
    /// fails cleanly instead of deadlocking.
    ///
    /// If nobody was waiting, the conduit is removed from the table
    /// immediately. If someone was, the now-`Closed` entry is left in
    /// place rather than removed, so that a woken waiter's retry still
    /// finds it and gets `Closed` rather than `NotFound`. Nothing currently
    /// garbage-collects such zombie entries once drained; see DESIGN.md.
    pub fn close(&mut self, quanta: &mut Arena<Quantum>, id: ConduitId) -> Result<Vec<QuantumId>, KernelError> {
        let entry = self
            .arena
            .get_mut(id.index(), id.generation())
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))?;
        if entry.conduit.close() {
            let woken = entry.conduit.drain_waiters(quanta);
            if woken.is_empty() {
                self.arena.remove(id.index(), id.generation());
            }
            Ok(woken)
        } else {
            Ok(Vec::new())
        }
    }

    fn conduit_mut(&mut self, id: ConduitId) -> Result<&mut Conduit, KernelError> {
        self.arena
            .get_mut(id.index(), id.generation())
            .map(|e| &mut e.conduit)
            .ok_or(KernelError::Recoverable(ErrorCode::NotFound))
    }

    /// Attempts to send; `Ok(Some(id))` names a quantum the send just
    /// woke (a blocked receiver or select waiter), `Ok(None)` means the
    /// send succeeded with no one waiting, and `Err(Recoverable(WouldBlock))`
    /// means the caller must block (the dispatcher registers it via
    /// [`Self::register_sender`] and calls into the scheduler).
    pub fn send(
        &mut self,
        quanta: &mut Arena<Quantum>,
        id: ConduitId,
        payload: &[u8],
    ) -> Result<Option<QuantumId>, KernelError> {
        self.conduit_mut(id)?.try_send(quanta, payload).map_err(KernelError::Recoverable)
    }

    pub fn receive(&mut self, id: ConduitId, dest: &mut [u8]) -> Result<usize, KernelError> {
        self.conduit_mut(id)?.try_receive(dest).map_err(KernelError::Recoverable)
    }

    pub fn peek(&mut self, id: ConduitId, dest: &mut [u8]) -> Result<usize, KernelError> {
        self.conduit_mut(id)?.try_peek(dest).map_err(KernelError::Recoverable)
    }

    /// Wakes one quantum blocked sending into `id`, e.g. after a `receive`
    /// frees ring space. `Ok(None)` means no one was waiting.
    pub fn wake_one_sender(&mut self, quanta: &mut Arena<Quantum>, id: ConduitId) -> Result<Option<QuantumId>, KernelError> {
        Ok(self.conduit_mut(id)?.wake_one_sender(quanta))
    }

    pub fn register_sender(&mut self, quanta: &mut Arena<Quantum>, id: ConduitId, quantum_index: usize) {
        if let Ok(c) = self.conduit_mut(id) {
            c.register_sender(quanta, quantum_index);
        }
    }

    pub fn register_receiver(&mut self, quanta: &mut Arena<Quantum>, id: ConduitId, quantum_index: usize) {
        if let Ok(c) = self.conduit_mut(id) {
            c.register_receiver(quanta, quantum_index);
        }
    }

    /// Registers `quantum` as a select-waiter on every id in `ids`,
    /// returning the per-conduit handles a later cancel needs. Callers
    /// check readiness with [`Self::has_message`] first; this is only for
    /// the blocking path.
    pub fn register_select(&mut self, ids: &[ConduitId], quantum: QuantumId) -> Vec<(ConduitId, SlabHandle)> {
        let mut handles = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Ok(c) = self.conduit_mut(id) {
                handles.push((id, c.register_select_waiter(quantum)));
            }
        }
        handles
    }

    pub fn cancel_select(&mut self, handles: &[(ConduitId, SlabHandle)]) {
        for &(id, handle) in handles {
            if let Ok(c) = self.conduit_mut(id) {
                c.cancel_select_waiter(handle);
            }
        }
    }

    pub fn has_message(&self, id: ConduitId) -> bool {
        self.arena
            .get(id.index(), id.generation())
            .map(|e| e.conduit.has_message())
            .unwrap_or(false)
    }

    /// Finds the first id among `ids` with a message already waiting, for
    /// `select`'s initial non-blocking poll.
    pub fn first_ready(&self, ids: &[ConduitId]) -> Option<ConduitId> {
        ids.iter().copied().find(|&id| self.has_message(id))
    }

    /// Sends `payload` non-blocking to every live conduit whose name
    /// matches `pattern` (shell-style `*`/`?` wildcards). Returns the
    /// count of conduits the message was actually enqueued to; conduits
    /// that are full or closed are silently skipped, matching spec.md
    /// §4.D's "per-destination success counts" without requiring a
    /// per-destination result vector from callers that only want the
    /// total.
    pub fn broadcast(&mut self, quanta: &mut Arena<Quantum>, pattern: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        let matching: Vec<ConduitId> = self
            .arena
            .iter()
            .filter(|(_, entry)| glob_match(pattern, &entry.name))
            .filter_map(|(index, _)| {
                self.arena.generation_at(index).map(|g| ConduitId::for_index_and_gen(index, g))
            })
            .collect();
        for id in matching {
            if let Ok(c) = self.conduit_mut(id) {
                if c.try_send(quanta, payload).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

/// Matches `text` against a shell-style glob `pattern` (`*` for any run of
/// characters, `?` for exactly one). Classic two-pointer scan with
/// backtracking to the last `*`, not a recursive descent, so pathological
/// patterns don't blow the kernel's stack.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let (mut star_idx, mut star_ti) = (None, 0);

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star_idx = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(si) = star_idx {
            pi = si + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_abi::{DomainId, Priority, RawId};

    fn fresh_quanta() -> Arena<Quantum> {
        Arena::new()
    }

    fn table() -> ConduitTable {
        ConduitTable::new(16, 64)
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let mut t = table();
        t.create("pp", 128).unwrap();
        assert!(matches!(
            t.create("pp", 128).unwrap_err(),
            KernelError::Recoverable(ErrorCode::AlreadyExists)
        ));
    }

    #[test]
    fn open_by_name_finds_existing_conduit() {
        let mut t = table();
        let id = t.create("pp", 128).unwrap();
        let opened = t.open("pp").unwrap();
        assert_eq!(id, opened);
    }

    #[test]
    fn close_destroys_only_after_every_handle_is_closed() {
        let mut t = table();
        let mut quanta = fresh_quanta();
        let id = t.create("pp", 128).unwrap();
        t.open("pp").unwrap();
        t.close(&mut quanta, id).unwrap();
        assert_eq!(t.len(), 1);
        t.close(&mut quanta, id).unwrap();
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn close_wakes_blocked_receiver_instead_of_leaving_it_parked() {
        let mut t = table();
        let mut quanta = fresh_quanta();
        let (index, generation) =
            quanta.try_insert(Quantum::new(DomainId(RawId(0)), Priority(0)), 8).unwrap();
        let receiver = QuantumId::for_index_and_gen(index, generation);

        let id = t.create("pp", 128).unwrap();
        t.register_receiver(&mut quanta, id, index);

        let woken = t.close(&mut quanta, id).unwrap();
        assert_eq!(woken, alloc::vec![receiver]);

        // The conduit lingers, now closed, so the retried receive fails
        // cleanly instead of hitting `NotFound`.
        let mut buf = [0u8; 4];
        assert!(matches!(t.receive(id, &mut buf), Err(KernelError::Recoverable(ErrorCode::Closed))));
    }

    #[test]
    fn ping_pong_round_trip() {
        let mut quanta = fresh_quanta();
        let mut t = table();
        let id = t.create("pp", 4096).unwrap();
        t.send(&mut quanta, id, &[0x41]).unwrap();
        let mut buf = [0u8; 1];
        let n = t.receive(id, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x41]);
        t.send(&mut quanta, id, &[0x42]).unwrap();
        let n = t.receive(id, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x42]);
    }

    #[test]
    fn broadcast_matches_wildcard_names() {
        let mut quanta = fresh_quanta();
        let mut t = table();
        t.create("log.kernel", 128).unwrap();
        t.create("log.driver", 128).unwrap();
        t.create("ctl.main", 128).unwrap();
        let delivered = t.broadcast(&mut quanta, "log.*", b"hi");
        assert_eq!(delivered, 2);
    }

    #[test]
    fn select_reports_the_conduit_already_ready() {
        let mut quanta = fresh_quanta();
        let mut t = table();
        let a = t.create("a", 64).unwrap();
        let b = t.create("b", 64).unwrap();
        t.send(&mut quanta, b, b"x").unwrap();
        assert_eq!(t.first_ready(&[a, b]), Some(b));
    }

    #[test]
    fn select_registers_and_cancels_across_every_candidate() {
        let mut t = table();
        let a = t.create("a", 64).unwrap();
        let b = t.create("b", 64).unwrap();
        let (index, generation) = (0usize, continuum_abi::Generation::ZERO);
        let quantum = QuantumId::for_index_and_gen(index, generation);
        let handles = t.register_select(&[a, b], quantum);
        assert_eq!(handles.len(), 2);
        t.cancel_select(&handles);
    }

    #[test]
    fn glob_matching_handles_star_and_question_mark() {
        assert!(glob_match("log.*", "log.kernel"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(!glob_match("log.*", "ctl.main"));
    }
}
