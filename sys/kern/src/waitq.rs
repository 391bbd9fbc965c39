// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive doubly-linked lists of quanta.
//!
//! A blocked or ready quantum's list linkage lives inline on its own arena
//! slot (`Quantum::wait_next`/`wait_prev`), exactly as the teacher keeps a
//! task's timer/notification state inline in `Task` rather than allocating
//! a separate list node. This makes membership changes, including
//! cancellation, an O(1) unlink using only the quantum's index: no list
//! traversal is ever needed to remove an arbitrary member.
//!
//! A [`List`] is just the head/tail pointers; the actual link fields live
//! on [`crate::quantum::Quantum`], so a quantum can only ever be a member of
//! one list at a time. That's true for every use in this kernel (a quantum
//! is ready, or blocked on exactly one thing, never both).

use crate::arena::Arena;
use crate::quantum::Quantum;

#[derive(Copy, Clone, Debug, Default)]
pub struct List {
    head: Option<usize>,
    tail: Option<usize>,
}

impl List {
    pub const fn new() -> Self {
        Self { head: None, tail: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn front(&self) -> Option<usize> {
        self.head
    }

    /// Appends the quantum at `index` to the back of this list.
    pub fn push_back(&mut self, quanta: &mut Arena<Quantum>, index: usize) {
        if let Some(q) = quanta.get_mut_by_index(index) {
            q.wait_next = None;
            q.wait_prev = self.tail;
        }
        if let Some(tail) = self.tail {
            if let Some(t) = quanta.get_mut_by_index(tail) {
                t.wait_next = Some(index);
            }
        } else {
            self.head = Some(index);
        }
        self.tail = Some(index);
    }

    /// Removes and returns the quantum at the front of this list.
    pub fn pop_front(&mut self, quanta: &mut Arena<Quantum>) -> Option<usize> {
        let index = self.head?;
        let next = quanta.get_mut_by_index(index).and_then(|q| q.wait_next.take());
        self.head = next;
        match next {
            Some(n) => {
                if let Some(q) = quanta.get_mut_by_index(n) {
                    q.wait_prev = None;
                }
            }
            None => self.tail = None,
        }
        Some(index)
    }

    /// Unlinks an arbitrary member of this list in O(1), e.g. for timeout
    /// cancellation. No-op if `index` isn't actually linked into a list
    /// (both its neighbor fields are `None` and it isn't this list's sole
    /// member).
    pub fn remove(&mut self, quanta: &mut Arena<Quantum>, index: usize) {
        let (prev, next) = match quanta.get_mut_by_index(index) {
            Some(q) => (q.wait_prev.take(), q.wait_next.take()),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(q) = quanta.get_mut_by_index(p) {
                    q.wait_next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(q) = quanta.get_mut_by_index(n) {
                    q.wait_prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }
}
