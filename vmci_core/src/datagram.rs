// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Datagram messages, host-side receive endpoints, and the dispatcher.
//!
//! The dispatcher is the single entry point for traffic from guests, host
//! drivers, and the engine itself. It validates sizes and source identity,
//! routes, enforces the privilege-interaction predicate, and then delivers:
//! inline to a registered endpoint, deferred onto the worker pool, into the
//! event bus, or onto a guest context's pending queue.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;
use vmci_protocol::DatagramHeader;
use vmci_protocol::PrivFlags;
use vmci_protocol::VmciHandle;
use vmci_protocol::DATAGRAM_HEADER_SIZE;
use vmci_protocol::EVENT_HANDLER_RESOURCE_ID;
use vmci_protocol::HOST_CONTEXT_ID;
use vmci_protocol::MAX_DATAGRAM_PAYLOAD;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::context::ContextRegistry;
use crate::error::Result;
use crate::error::VmciError;
use crate::event::EventBus;
use crate::resource::ResourceKind;
use crate::resource::ResourceObject;
use crate::resource::ResourceRegistry;
use crate::route::is_guest_cid;
use crate::route::route;
use crate::route::GuestTransport;
use crate::route::Route;
use crate::worker::WorkQueue;

/// An owned datagram: two addressing handles plus a bounded payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    pub dst: VmciHandle,
    pub src: VmciHandle,
    pub payload: Vec<u8>,
}

impl Datagram {
    pub fn new(dst: VmciHandle, src: VmciHandle, payload: Vec<u8>) -> Result<Datagram> {
        if payload.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(VmciError::InvalidArgs);
        }
        Ok(Datagram { dst, src, payload })
    }

    /// Header plus payload size in bytes; this is the unit all queue caps
    /// and return values are measured in.
    pub fn total_size(&self) -> usize {
        DATAGRAM_HEADER_SIZE + self.payload.len()
    }

    /// Serializes to the wire shape: fixed header followed by the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = DatagramHeader {
            dst: self.dst,
            src: self.src,
            payload_size: self.payload.len() as u64,
        };
        let mut bytes = Vec::with_capacity(self.total_size());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parses the wire shape, rejecting truncated buffers, trailing bytes,
    /// and oversized payload claims.
    pub fn from_bytes(bytes: &[u8]) -> Result<Datagram> {
        let (header, rest) =
            DatagramHeader::read_from_prefix(bytes).map_err(|_| VmciError::InvalidArgs)?;
        if header.payload_size > MAX_DATAGRAM_PAYLOAD as u64
            || header.payload_size != rest.len() as u64
        {
            return Err(VmciError::InvalidArgs);
        }
        Ok(Datagram {
            dst: header.dst,
            src: header.src,
            payload: rest.to_vec(),
        })
    }
}

pub type DatagramRecvFn = Box<dyn Fn(&Datagram) + Send + Sync>;

/// A host-side receive endpoint registered in the resource registry.
///
/// Teardown discipline: `destroy_endpoint` unlinks the registry entry so no
/// new lookups succeed, then blocks on the release latch until every
/// in-flight invocation (each holding its own registry reference) has
/// finished. The receive closure therefore never runs against a destroyed
/// endpoint.
pub struct DatagramEndpoint {
    handle: AtomicU64,
    priv_flags: PrivFlags,
    run_delayed: bool,
    recv: DatagramRecvFn,
    destroyed: Mutex<bool>,
    destroy_event: Condvar,
}

impl DatagramEndpoint {
    pub fn new(priv_flags: PrivFlags, run_delayed: bool, recv: DatagramRecvFn) -> DatagramEndpoint {
        DatagramEndpoint {
            handle: AtomicU64::new(vmci_protocol::INVALID_HANDLE.to_u64()),
            priv_flags,
            run_delayed,
            recv,
            destroyed: Mutex::new(false),
            destroy_event: Condvar::new(),
        }
    }

    pub fn handle(&self) -> VmciHandle {
        VmciHandle::from_u64(self.handle.load(Ordering::SeqCst))
    }

    pub fn priv_flags(&self) -> PrivFlags {
        self.priv_flags
    }

    pub fn run_delayed(&self) -> bool {
        self.run_delayed
    }

    fn set_handle(&self, handle: VmciHandle) {
        self.handle.store(handle.to_u64(), Ordering::SeqCst);
    }

    fn invoke(&self, dg: &Datagram) {
        (self.recv)(dg)
    }

    /// Free hook, called by the registry exactly once when the last
    /// reference drops.
    pub(crate) fn released(&self) {
        *self.destroyed.lock() = true;
        self.destroy_event.notify_all();
    }

    fn wait_released(&self) {
        let mut destroyed = self.destroyed.lock();
        while !*destroyed {
            self.destroy_event.wait(&mut destroyed);
        }
    }
}

/// Dispatcher wiring: registries, event bus, worker pool, and the optional
/// guest transport.
pub struct DatagramHub {
    resources: Arc<ResourceRegistry>,
    contexts: Arc<ContextRegistry>,
    events: Arc<EventBus>,
    worker: Arc<WorkQueue>,
    guest_transport: Mutex<Option<Arc<dyn GuestTransport>>>,
    delayed_pending: Arc<AtomicUsize>,
    delayed_limit: usize,
}

impl DatagramHub {
    pub fn new(
        resources: Arc<ResourceRegistry>,
        contexts: Arc<ContextRegistry>,
        events: Arc<EventBus>,
        worker: Arc<WorkQueue>,
        delayed_limit: usize,
    ) -> DatagramHub {
        DatagramHub {
            resources,
            contexts,
            events,
            worker,
            guest_transport: Mutex::new(None),
            delayed_pending: Arc::new(AtomicUsize::new(0)),
            delayed_limit,
        }
    }

    pub fn set_guest_transport(&self, transport: Arc<dyn GuestTransport>) {
        *self.guest_transport.lock() = Some(transport);
    }

    /// Registers a receive endpoint. A resource id of `INVALID_ID` asks for
    /// a free id; the final handle is returned. `run_delayed` forces every
    /// invocation through the worker pool.
    pub fn create_endpoint(
        &self,
        handle: VmciHandle,
        priv_flags: PrivFlags,
        run_delayed: bool,
        recv: DatagramRecvFn,
    ) -> Result<VmciHandle> {
        let endpoint = Arc::new(DatagramEndpoint::new(priv_flags, run_delayed, recv));
        let entry = self
            .resources
            .add(handle, ResourceObject::Datagram(endpoint.clone()))?;
        endpoint.set_handle(entry.handle());
        Ok(entry.handle())
    }

    /// Unlinks the endpoint and blocks until in-flight invocations drain.
    pub fn destroy_endpoint(&self, handle: VmciHandle) -> Result<()> {
        let entry = self.resources.get(handle, ResourceKind::Datagram)?;
        let endpoint = entry
            .value()
            .as_datagram()
            .expect("kind-filtered lookup returned a non-datagram resource")
            .clone();
        if let Err(e) = self.resources.remove(handle) {
            self.resources.release(&entry);
            return Err(e);
        }
        // Drop the lookup reference and the creator reference; any further
        // references belong to in-flight invocations.
        self.resources.release(&entry);
        self.resources.release(&entry);
        endpoint.wait_released();
        Ok(())
    }

    /// Routes and delivers one datagram on behalf of `caller_cid`. Returns
    /// the datagram's total size on success.
    pub fn dispatch(&self, caller_cid: u32, dg: Datagram, from_guest: bool) -> Result<usize> {
        if dg.payload.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(VmciError::InvalidArgs);
        }
        match route(&dg.src, &dg.dst, from_guest)? {
            Route::AsGuest => self.dispatch_as_guest(dg),
            Route::AsHost => self.dispatch_as_host(caller_cid, dg),
        }
    }

    fn dispatch_as_guest(&self, dg: Datagram) -> Result<usize> {
        // Hypervisor-bound sends require a trusted source context.
        let src_flags = self.source_priv_flags(&dg)?;
        if !src_flags.contains(PrivFlags::TRUSTED) {
            return Err(VmciError::NoAccess);
        }
        let transport = self.guest_transport.lock().clone();
        match transport {
            Some(t) => t.deliver(&dg),
            None => Err(VmciError::Unavailable),
        }
    }

    fn dispatch_as_host(&self, caller_cid: u32, dg: Datagram) -> Result<usize> {
        // Anti-spoofing: the claimed source context must be the caller's.
        if dg.src.context != caller_cid {
            return Err(VmciError::NoAccess);
        }
        let src_flags = self.source_priv_flags(&dg)?;
        if dg.dst == VmciHandle::new(HOST_CONTEXT_ID, EVENT_HANDLER_RESOURCE_ID) {
            return self.events.dispatch(&dg);
        }
        // Registered host resources (wildcard entries included) win over
        // context delivery.
        if let Ok(entry) = self.resources.get(dg.dst, ResourceKind::Datagram) {
            return self.deliver_to_endpoint(src_flags, entry, dg);
        }
        self.deliver_to_context(src_flags, dg)
    }

    /// Privilege flags of the datagram's source: the sending context's
    /// flags, except that a host-registered source resource carries its own.
    fn source_priv_flags(&self, dg: &Datagram) -> Result<PrivFlags> {
        if dg.src.context == HOST_CONTEXT_ID {
            if let Ok(entry) = self.resources.get(dg.src, ResourceKind::Datagram) {
                let flags = entry
                    .value()
                    .as_datagram()
                    .expect("kind-filtered lookup returned a non-datagram resource")
                    .priv_flags();
                self.resources.release(&entry);
                return Ok(flags);
            }
        }
        let ctx = self
            .contexts
            .get(dg.src.context)
            .ok_or(VmciError::NotFound)?;
        let flags = ctx.priv_flags();
        self.contexts.release(&ctx);
        Ok(flags)
    }

    fn deliver_to_endpoint(
        &self,
        src_flags: PrivFlags,
        entry: crate::resource::ResourceEntry,
        dg: Datagram,
    ) -> Result<usize> {
        let endpoint = entry
            .value()
            .as_datagram()
            .expect("kind-filtered lookup returned a non-datagram resource")
            .clone();
        if !src_flags.can_interact(endpoint.priv_flags()) {
            self.resources.release(&entry);
            return Err(VmciError::NoAccess);
        }
        let size = dg.total_size();
        // Deferral is mandatory for endpoints that asked for it and whenever
        // the host context is both source and destination, so no callback
        // ever runs in the sender's locked context.
        let delayed = endpoint.run_delayed() || dg.src.context == HOST_CONTEXT_ID;
        if !delayed {
            endpoint.invoke(&dg);
            self.resources.release(&entry);
            return Ok(size);
        }
        let prev = self.delayed_pending.fetch_add(1, Ordering::SeqCst);
        if prev >= self.delayed_limit {
            self.delayed_pending.fetch_sub(1, Ordering::SeqCst);
            self.resources.release(&entry);
            return Err(VmciError::NoMem);
        }
        let delivery = EndpointDelivery {
            resources: self.resources.clone(),
            entry,
            pending: self.delayed_pending.clone(),
            endpoint,
            dg,
        };
        // If submit fails the closure is dropped unrun and the delivery
        // guard still releases the entry reference and admission slot.
        self.worker.submit(move || delivery.run())?;
        Ok(size)
    }

    fn deliver_to_context(&self, src_flags: PrivFlags, dg: Datagram) -> Result<usize> {
        let dst_cid = dg.dst.context;
        // Guests may not reach other guests through the host unless the
        // source is trusted. Keyed on the source cid, not the entry path:
        // a host-side dispatch on behalf of a guest gets no exemption.
        if is_guest_cid(dg.src.context)
            && is_guest_cid(dst_cid)
            && !src_flags.contains(PrivFlags::TRUSTED)
        {
            return Err(VmciError::DstUnreachable);
        }
        let ctx = self.contexts.get(dst_cid).ok_or(VmciError::NotFound)?;
        if !src_flags.can_interact(ctx.priv_flags()) {
            self.contexts.release(&ctx);
            return Err(VmciError::NoAccess);
        }
        let result = ctx.enqueue_datagram(dg, true);
        self.contexts.release(&ctx);
        result
    }
}

/// One deferred endpoint invocation. Dropping the guard (run or unrun)
/// returns the registry reference and the admission slot.
struct EndpointDelivery {
    resources: Arc<ResourceRegistry>,
    entry: crate::resource::ResourceEntry,
    pending: Arc<AtomicUsize>,
    endpoint: Arc<DatagramEndpoint>,
    dg: Datagram,
}

impl EndpointDelivery {
    fn run(&self) {
        self.endpoint.invoke(&self.dg);
    }
}

impl Drop for EndpointDelivery {
    fn drop(&mut self) {
        self.resources.release(&self.entry);
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    use vmci_protocol::HYPERVISOR_CONTEXT_ID;
    use vmci_protocol::INVALID_ID;

    use super::*;

    struct Fixture {
        resources: Arc<ResourceRegistry>,
        contexts: Arc<ContextRegistry>,
        hub: DatagramHub,
    }

    fn fixture(delayed_limit: usize) -> Fixture {
        let worker = Arc::new(WorkQueue::new("dg-test", 1, 64));
        let events = Arc::new(EventBus::new(worker.clone()));
        let resources = Arc::new(ResourceRegistry::new(16));
        let contexts = Arc::new(ContextRegistry::new(events.clone()));
        let hub = DatagramHub::new(
            resources.clone(),
            contexts.clone(),
            events,
            worker,
            delayed_limit,
        );
        Fixture {
            resources,
            contexts,
            hub,
        }
    }

    fn dg(src: VmciHandle, dst: VmciHandle, len: usize) -> Datagram {
        Datagram::new(dst, src, vec![0x5a; len]).unwrap()
    }

    #[test]
    fn wire_shape_round_trip_and_rejects() {
        let d = dg(VmciHandle::new(20, 1), VmciHandle::new(21, 2), 33);
        let bytes = d.to_bytes();
        assert_eq!(bytes.len(), DATAGRAM_HEADER_SIZE + 33);
        assert_eq!(Datagram::from_bytes(&bytes).unwrap(), d);

        // Truncated header.
        assert_eq!(
            Datagram::from_bytes(&bytes[..10]).unwrap_err(),
            VmciError::InvalidArgs
        );
        // Payload size disagreeing with the buffer, both directions.
        let mut lying = bytes.clone();
        lying[16] ^= 1;
        assert_eq!(Datagram::from_bytes(&lying).unwrap_err(), VmciError::InvalidArgs);
        let mut trailing = bytes;
        trailing.push(0);
        assert_eq!(
            Datagram::from_bytes(&trailing).unwrap_err(),
            VmciError::InvalidArgs
        );
    }

    #[test]
    fn source_context_spoofing_rejected() {
        let f = fixture(16);
        f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        f.contexts.init_context(21, PrivFlags::empty()).unwrap();
        let d = dg(VmciHandle::new(21, 1), VmciHandle::new(20, 9), 4);
        assert_eq!(
            f.hub.dispatch(20, d, false).unwrap_err(),
            VmciError::NoAccess
        );
    }

    #[test]
    fn wildcard_endpoint_receives_any_context() {
        let f = fixture(16);
        f.contexts.init_context(21, PrivFlags::empty()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        f.hub
            .create_endpoint(
                VmciHandle::new(INVALID_ID, 77),
                PrivFlags::empty(),
                false,
                Box::new(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let d = dg(VmciHandle::new(21, 1), VmciHandle::new(20, 77), 4);
        let size = f.hub.dispatch(21, d, false).unwrap();
        assert_eq!(size, DATAGRAM_HEADER_SIZE + 4);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn falls_back_to_context_queue() {
        let f = fixture(16);
        f.contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let target = f.contexts.init_context(21, PrivFlags::empty()).unwrap();
        let d = dg(VmciHandle::new(HOST_CONTEXT_ID, 1), VmciHandle::new(21, 99), 8);
        f.hub.dispatch(HOST_CONTEXT_ID, d.clone(), false).unwrap();
        assert_eq!(target.pending_datagrams(), 1);
        assert_eq!(target.dequeue_datagram(usize::MAX).unwrap().0, d);
    }

    #[test]
    fn guest_to_guest_needs_trusted_source() {
        let f = fixture(16);
        f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        let target = f.contexts.init_context(21, PrivFlags::empty()).unwrap();
        let d = dg(VmciHandle::new(20, 1), VmciHandle::new(21, 99), 8);
        assert_eq!(
            f.hub.dispatch(20, d.clone(), true).unwrap_err(),
            VmciError::DstUnreachable
        );
        // A host-side dispatch on an untrusted guest's behalf is no
        // loophole: isolation keys on the source cid.
        assert_eq!(
            f.hub.dispatch(20, d, false).unwrap_err(),
            VmciError::DstUnreachable
        );
        assert_eq!(target.pending_datagrams(), 0);

        let trusted = f.contexts.init_context(22, PrivFlags::TRUSTED).unwrap();
        let d = dg(VmciHandle::new(22, 1), VmciHandle::new(21, 99), 8);
        f.hub.dispatch(trusted.cid(), d, true).unwrap();
        assert_eq!(target.pending_datagrams(), 1);
    }

    #[test]
    fn restricted_endpoint_vetoes_untrusted_source() {
        let f = fixture(16);
        f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        f.hub
            .create_endpoint(
                VmciHandle::new(INVALID_ID, 77),
                PrivFlags::RESTRICTED,
                false,
                Box::new(|_| panic!("restricted endpoint reached by untrusted source")),
            )
            .unwrap();
        let d = dg(VmciHandle::new(20, 1), VmciHandle::new(2, 77), 4);
        assert_eq!(
            f.hub.dispatch(20, d, true).unwrap_err(),
            VmciError::NoAccess
        );
    }

    #[test]
    fn hypervisor_bound_traffic_uses_transport() {
        struct Recorder(mpsc::Sender<Datagram>);
        impl GuestTransport for Recorder {
            fn deliver(&self, dg: &Datagram) -> Result<usize> {
                self.0.send(dg.clone()).map_err(|_| VmciError::Unavailable)?;
                Ok(dg.total_size())
            }
        }

        let f = fixture(16);
        f.contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let d = dg(
            VmciHandle::new(HOST_CONTEXT_ID, 1),
            VmciHandle::new(HYPERVISOR_CONTEXT_ID, 5),
            16,
        );
        assert_eq!(
            f.hub.dispatch(HOST_CONTEXT_ID, d.clone(), false).unwrap_err(),
            VmciError::Unavailable
        );

        let (tx, rx) = mpsc::channel();
        f.hub.set_guest_transport(Arc::new(Recorder(tx)));
        let size = f.hub.dispatch(HOST_CONTEXT_ID, d.clone(), false).unwrap();
        assert_eq!(size, d.total_size());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), d);

        // An untrusted source may not reach the hypervisor.
        f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        let d = dg(
            VmciHandle::new(20, 1),
            VmciHandle::new(HYPERVISOR_CONTEXT_ID, 5),
            16,
        );
        assert_eq!(
            f.hub.dispatch(20, d, false).unwrap_err(),
            VmciError::NoAccess
        );
    }

    #[test]
    fn host_sourced_delivery_is_deferred() {
        let f = fixture(16);
        f.contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = f
            .hub
            .create_endpoint(
                VmciHandle::new(HOST_CONTEXT_ID, INVALID_ID),
                PrivFlags::empty(),
                false,
                Box::new(move |_| {
                    tx.send(std::thread::current().name().map(String::from))
                        .unwrap();
                }),
            )
            .unwrap();
        let d = dg(VmciHandle::new(HOST_CONTEXT_ID, 1), handle, 4);
        f.hub.dispatch(HOST_CONTEXT_ID, d, false).unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(name.unwrap_or_default().starts_with("dg-test"));
    }

    #[test]
    fn delayed_admission_cap() {
        let f = fixture(1);
        f.contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let (enter_tx, enter_rx) = mpsc::channel();
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let block_rx = Mutex::new(block_rx);
        let handle = f
            .hub
            .create_endpoint(
                VmciHandle::new(HOST_CONTEXT_ID, INVALID_ID),
                PrivFlags::empty(),
                true,
                Box::new(move |_| {
                    enter_tx.send(()).unwrap();
                    block_rx.lock().recv().unwrap();
                }),
            )
            .unwrap();
        let d = dg(VmciHandle::new(HOST_CONTEXT_ID, 1), handle, 4);
        f.hub.dispatch(HOST_CONTEXT_ID, d.clone(), false).unwrap();
        enter_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // The slot is still occupied by the blocked delivery.
        assert_eq!(
            f.hub.dispatch(HOST_CONTEXT_ID, d, false).unwrap_err(),
            VmciError::NoMem
        );
        block_tx.send(()).unwrap();
    }

    #[test]
    fn destroy_endpoint_stops_lookups() {
        let f = fixture(16);
        f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        let handle = f
            .hub
            .create_endpoint(
                VmciHandle::new(20, INVALID_ID),
                PrivFlags::empty(),
                false,
                Box::new(|_| {}),
            )
            .unwrap();
        let looked_up = f.resources.get(handle, ResourceKind::Datagram).unwrap();
        f.resources.release(&looked_up);
        f.hub.destroy_endpoint(handle).unwrap();
        assert_eq!(
            f.hub.destroy_endpoint(handle).unwrap_err(),
            VmciError::NotFound
        );
        assert_eq!(
            f.resources
                .get(handle, ResourceKind::Datagram)
                .unwrap_err(),
            VmciError::NotFound
        );
    }
}
