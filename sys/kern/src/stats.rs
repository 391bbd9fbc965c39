// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monotonic kernel-wide event counters, too frequent to trace individually.

use core::sync::atomic::{AtomicU32, Ordering};
use counters::Count;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    ContextSwitch,
    PageFault,
    Syscall,
    ConduitSend,
    ConduitReceive,
}

#[derive(Default)]
pub struct Counters {
    context_switches: AtomicU32,
    page_faults: AtomicU32,
    syscalls: AtomicU32,
    conduit_sends: AtomicU32,
    conduit_receives: AtomicU32,
}

impl Count for Event {
    type Counters = Counters;

    const NEW_COUNTERS: Self::Counters = Counters {
        context_switches: AtomicU32::new(0),
        page_faults: AtomicU32::new(0),
        syscalls: AtomicU32::new(0),
        conduit_sends: AtomicU32::new(0),
        conduit_receives: AtomicU32::new(0),
    };

    fn count(&self, counters: &Self::Counters) {
        let counter = match self {
            Event::ContextSwitch => &counters.context_switches,
            Event::PageFault => &counters.page_faults,
            Event::Syscall => &counters.syscalls,
            Event::ConduitSend => &counters.conduit_sends,
            Event::ConduitReceive => &counters.conduit_receives,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

counters::counters!(KERNEL_COUNTERS, Event);

pub fn record(event: Event) {
    counters::count!(KERNEL_COUNTERS, event);
}
