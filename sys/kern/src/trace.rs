// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured, debugger-visible kernel event logging.
//!
//! Events are recorded into a fixed-capacity ring buffer rather than
//! printed; there is nowhere to print to on bare metal, and a debugger (or,
//! here, a test) can read `TRACE`'s entries directly.

use continuum_abi::{ConduitId, DomainId, ErrorCode, QuantumId};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    Empty,
    ContextSwitch { from: QuantumId, to: QuantumId },
    QuantumBlocked(QuantumId),
    QuantumFaulted(QuantumId),
    DomainCreated(DomainId),
    DomainDestroyed(DomainId),
    ConduitSend(ConduitId),
    ConduitReceive(ConduitId),
    ConduitWouldBlock(ConduitId),
    RequestDenied(ErrorCode),
}

ringbuf::ringbuf!(TRACE, Trace, 64, Trace::Empty);

pub fn record(event: Trace) {
    ringbuf::ringbuf_entry!(TRACE, event);
}

#[cfg(test)]
pub(crate) fn recorded() -> alloc::vec::Vec<Trace> {
    use alloc::vec::Vec;
    TRACE.borrow_mut().entries().map(|e| e.payload).collect::<Vec<_>>()
}
