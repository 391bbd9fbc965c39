// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Safe wrappers over the raw [`SyscallTransport`] boundary.

use continuum_abi::{
    ConduitId, DomainId, InlineName, Priority, QuantumId, QuantumName, QuantumStats, RegionFlags,
    RequestId, RequestParams,
};

use crate::lease::Lease;
use crate::{decode_error, request_u64, RequestResult};

/// The one unsafe-adjacent seam in this crate: something that can carry a
/// request envelope across the boundary into the kernel and bring back a
/// response.
///
/// On real hardware this is backed by a trap instruction; in tests it is
/// backed by a direct call into `continuum_kern::dispatch::Dispatcher`. Both
/// implementations are outside this crate, which only depends on the trait.
pub trait SyscallTransport {
    /// Issues `request` with `params` and any attached lease, returning the
    /// kernel's response words on success or an error code on failure.
    fn invoke(
        &self,
        request: RequestId,
        params: RequestParams,
        lease: Option<&[u8]>,
        lease_out: Option<&mut [u8]>,
    ) -> Result<RequestParams, i64>;
}

/// Ergonomic client over a [`SyscallTransport`].
pub struct Client<'t, T: SyscallTransport> {
    transport: &'t T,
}

impl<'t, T: SyscallTransport> Client<'t, T> {
    pub fn new(transport: &'t T) -> Self {
        Self { transport }
    }

    fn call(&self, request: RequestId, params: RequestParams) -> RequestResult<RequestParams> {
        self.transport
            .invoke(request, params, None, None)
            .map_err(decode_error)
    }

    fn call_with_lease(
        &self,
        request: RequestId,
        params: RequestParams,
        lease: Lease<'_>,
    ) -> RequestResult<RequestParams> {
        match lease {
            Lease::Read(data) => self
                .transport
                .invoke(request, params, Some(data), None)
                .map_err(decode_error),
            Lease::Write(data) => self
                .transport
                .invoke(request, params, None, Some(data))
                .map_err(decode_error),
        }
    }

    // --- scheduler & quantum lifecycle -------------------------------

    pub fn spawn_quantum(&self, domain: DomainId, priority: Priority, name: &str) -> RequestResult<QuantumId> {
        let mut p = RequestParams::default();
        p.0[0] = domain.0 .0 as u64;
        p.0[1] = priority.0 as u64;
        p.0[2..5].copy_from_slice(&QuantumName::new(name).to_words());
        let r = self.call(RequestId::SpawnQuantum, p)?;
        Ok(QuantumId(continuum_abi::RawId(r.0[0] as u32)))
    }

    pub fn destroy_quantum(&self, quantum: QuantumId) -> RequestResult<()> {
        self.call(RequestId::DestroyQuantum, request_u64(quantum.0 .0 as u64))?;
        Ok(())
    }

    /// Suspends the caller until `quantum` terminates.
    pub fn wait_for_quantum(&self, quantum: QuantumId) -> RequestResult<()> {
        self.call(RequestId::WaitForQuantum, request_u64(quantum.0 .0 as u64))?;
        Ok(())
    }

    pub fn yield_now(&self) -> RequestResult<()> {
        self.call(RequestId::Yield, RequestParams::default())?;
        Ok(())
    }

    pub fn block(&self) -> RequestResult<()> {
        self.call(RequestId::Block, RequestParams::default())?;
        Ok(())
    }

    pub fn unblock(&self, target: QuantumId) -> RequestResult<()> {
        self.call(RequestId::Unblock, request_u64(target.0 .0 as u64))?;
        Ok(())
    }

    // --- memory manager -------------------------------------------------

    pub fn create_domain(&self) -> RequestResult<DomainId> {
        let r = self.call(RequestId::CreateDomain, RequestParams::default())?;
        Ok(DomainId(continuum_abi::RawId(r.0[0] as u32)))
    }

    pub fn destroy_domain(&self, domain: DomainId) -> RequestResult<()> {
        self.call(RequestId::DestroyDomain, request_u64(domain.0 .0 as u64))?;
        Ok(())
    }

    pub fn allocate(&self, domain: DomainId, size: usize, flags: RegionFlags) -> RequestResult<u32> {
        let mut p = RequestParams::default();
        p.0[0] = domain.0 .0 as u64;
        p.0[1] = size as u64;
        p.0[2] = flags.bits() as u64;
        let r = self.call(RequestId::Allocate, p)?;
        Ok(r.0[0] as u32)
    }

    pub fn free(&self, domain: DomainId, base: u32) -> RequestResult<()> {
        let mut p = RequestParams::default();
        p.0[0] = domain.0 .0 as u64;
        p.0[1] = base as u64;
        self.call(RequestId::Free, p)?;
        Ok(())
    }

    pub fn map(&self, domain: DomainId, vaddr: u32, paddr: u32, size: usize, flags: RegionFlags) -> RequestResult<()> {
        let mut p = RequestParams::default();
        p.0[0] = domain.0 .0 as u64;
        p.0[1] = vaddr as u64;
        p.0[2] = paddr as u64;
        p.0[3] = size as u64;
        p.0[4] = flags.bits() as u64;
        self.call(RequestId::Map, p)?;
        Ok(())
    }

    pub fn unmap(&self, domain: DomainId, base: u32) -> RequestResult<()> {
        let mut p = RequestParams::default();
        p.0[0] = domain.0 .0 as u64;
        p.0[1] = base as u64;
        self.call(RequestId::Unmap, p)?;
        Ok(())
    }

    pub fn protect(&self, domain: DomainId, base: u32, flags: RegionFlags) -> RequestResult<()> {
        let mut p = RequestParams::default();
        p.0[0] = domain.0 .0 as u64;
        p.0[1] = base as u64;
        p.0[2] = flags.bits() as u64;
        self.call(RequestId::Protect, p)?;
        Ok(())
    }

    pub fn mark_cow(&self, domain: DomainId, vaddr: u32, size: usize) -> RequestResult<()> {
        let mut p = RequestParams::default();
        p.0[0] = domain.0 .0 as u64;
        p.0[1] = vaddr as u64;
        p.0[2] = size as u64;
        self.call(RequestId::MarkCow, p)?;
        Ok(())
    }

    pub fn translate(&self, domain: DomainId, addr: u32) -> RequestResult<u32> {
        let mut p = RequestParams::default();
        p.0[0] = domain.0 .0 as u64;
        p.0[1] = addr as u64;
        let r = self.call(RequestId::Translate, p)?;
        Ok(r.0[0] as u32)
    }

    // --- conduits --------------------------------------------------------

    pub fn create_conduit(&self, name: &str, capacity: usize) -> RequestResult<ConduitId> {
        let mut p = InlineName::new(name).to_params();
        p.0[5] = capacity as u64;
        let r = self.call(RequestId::CreateConduit, p)?;
        Ok(ConduitId(continuum_abi::RawId(r.0[0] as u32)))
    }

    pub fn open_conduit(&self, name: &str) -> RequestResult<ConduitId> {
        let p = InlineName::new(name).to_params();
        let r = self.call(RequestId::OpenConduit, p)?;
        Ok(ConduitId(continuum_abi::RawId(r.0[0] as u32)))
    }

    pub fn close_conduit(&self, conduit: ConduitId) -> RequestResult<()> {
        self.call(RequestId::CloseConduit, request_u64(conduit.0 .0 as u64))?;
        Ok(())
    }

    pub fn send(&self, conduit: ConduitId, message: &[u8]) -> RequestResult<()> {
        let mut p = RequestParams::default();
        p.0[0] = conduit.0 .0 as u64;
        self.call_with_lease(RequestId::Send, p, Lease::Read(message))?;
        Ok(())
    }

    pub fn receive(&self, conduit: ConduitId, into: &mut [u8]) -> RequestResult<usize> {
        let mut p = RequestParams::default();
        p.0[0] = conduit.0 .0 as u64;
        let len = into.len();
        let r = self.call_with_lease(RequestId::Receive, p, Lease::Write(into))?;
        let _ = len;
        Ok(r.0[0] as usize)
    }

    pub fn peek(&self, conduit: ConduitId, into: &mut [u8]) -> RequestResult<usize> {
        let mut p = RequestParams::default();
        p.0[0] = conduit.0 .0 as u64;
        let r = self.call_with_lease(RequestId::Peek, p, Lease::Write(into))?;
        Ok(r.0[0] as usize)
    }

    pub fn broadcast(&self, pattern: &str, message: &[u8]) -> RequestResult<u32> {
        let p = InlineName::new(pattern).to_params();
        let r = self.call_with_lease(RequestId::Broadcast, p, Lease::Read(message))?;
        Ok(r.0[0] as u32)
    }

    /// Waits for the first of up to 5 conduits to become ready. A count
    /// word precedes the packed ids so the dispatcher can tell "3 conduits,
    /// one of which happens to be id 0" apart from unused padding.
    pub fn select(&self, conduits: &[ConduitId]) -> RequestResult<ConduitId> {
        let mut p = RequestParams::default();
        let n = conduits.len().min(5);
        p.0[0] = n as u64;
        for (i, c) in conduits.iter().take(5).enumerate() {
            p.0[i + 1] = c.0 .0 as u64;
        }
        let r = self.call(RequestId::Select, p)?;
        Ok(ConduitId(continuum_abi::RawId(r.0[0] as u32)))
    }

    // --- clock -----------------------------------------------------------

    pub fn set_timer(&self, deadline_ticks: u64) -> RequestResult<()> {
        self.call(RequestId::SetTimer, request_u64(deadline_ticks))?;
        Ok(())
    }

    pub fn get_timer(&self) -> RequestResult<u64> {
        let r = self.call(RequestId::GetTimer, RequestParams::default())?;
        Ok(r.0[0])
    }

    // --- meta --------------------------------------------------------------

    pub fn query_time(&self) -> RequestResult<u64> {
        let r = self.call(RequestId::QueryTime, RequestParams::default())?;
        Ok(r.0[0])
    }

    pub fn query_stats(&self, quantum: QuantumId) -> RequestResult<QuantumStats> {
        let r = self.call(RequestId::QueryStats, request_u64(quantum.0 .0 as u64))?;
        Ok(QuantumStats {
            creation_time: r.0[0],
            cpu_time: r.0[1],
            context_switches: r.0[2] as u32,
            page_faults: r.0[3] as u32,
            system_requests: r.0[4] as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuum_abi::ErrorCode;
    use core::cell::RefCell;

    struct FakeTransport {
        next_id: RefCell<u32>,
    }

    impl SyscallTransport for FakeTransport {
        fn invoke(
            &self,
            request: RequestId,
            params: RequestParams,
            _lease: Option<&[u8]>,
            _lease_out: Option<&mut [u8]>,
        ) -> Result<RequestParams, i64> {
            match request {
                RequestId::CreateDomain => {
                    let mut id = self.next_id.borrow_mut();
                    let mut r = RequestParams::default();
                    r.0[0] = *id as u64;
                    *id += 1;
                    Ok(r)
                }
                RequestId::DestroyDomain if params.0[0] == 999 => {
                    Err(ErrorCode::NotFound as i32 as i64)
                }
                _ => Ok(RequestParams::default()),
            }
        }
    }

    #[test]
    fn create_domain_decodes_response() {
        let transport = FakeTransport { next_id: RefCell::new(5) };
        let client = Client::new(&transport);
        let domain = client.create_domain().unwrap();
        assert_eq!(domain.0, continuum_abi::RawId(5));
    }

    #[test]
    fn error_response_decodes_to_error_code() {
        let transport = FakeTransport { next_id: RefCell::new(0) };
        let client = Client::new(&transport);
        let err = client
            .destroy_domain(DomainId(continuum_abi::RawId(999)))
            .unwrap_err();
        assert_eq!(err, ErrorCode::NotFound);
    }
}
