// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Top-level engine: builds and wires the registries, broker, hubs, and
//! worker pool, owns the host context, and exposes the public surface.

use std::sync::Arc;

use log::info;
use serde::Deserialize;
use serde::Serialize;
use vmci_protocol::PrivFlags;
use vmci_protocol::QueuePairFlags;
use vmci_protocol::VmciHandle;
use vmci_protocol::VmciId;
use vmci_protocol::HOST_CONTEXT_ID;
use vmci_protocol::MAX_DATAGRAM_QUEUE_SIZE;

use crate::context::Context;
use crate::context::ContextRegistry;
use crate::datagram::Datagram;
use crate::datagram::DatagramHub;
use crate::datagram::DatagramRecvFn;
use crate::doorbell::DoorbellHub;
use crate::doorbell::DoorbellNotifyFn;
use crate::error::Result;
use crate::error::VmciError;
use crate::event::EventBus;
use crate::event::EventCallback;
use crate::event::EventDelivery;
use crate::queue_pair::PageStore;
use crate::queue_pair::QueuePairBroker;
use crate::queue_pair::WakeupFn;
use crate::resource::ResourceRegistry;
use crate::route::GuestTransport;
use crate::worker::WorkQueue;

fn default_worker_threads() -> usize {
    2
}

fn default_max_pending_jobs() -> usize {
    1024
}

fn default_resource_buckets() -> usize {
    64
}

fn default_max_delayed_datagrams() -> usize {
    MAX_DATAGRAM_QUEUE_SIZE / vmci_protocol::DATAGRAM_HEADER_SIZE
}

/// Engine tuning knobs; all defaulted, deserializable from a config file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct VmciOptions {
    /// Threads in the delayed-work pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Admission cap on outstanding worker jobs.
    #[serde(default = "default_max_pending_jobs")]
    pub max_pending_jobs: usize,
    /// Bucket count for the resource handle table.
    #[serde(default = "default_resource_buckets")]
    pub resource_buckets: usize,
    /// Admission cap on datagrams deferred to the worker pool.
    #[serde(default = "default_max_delayed_datagrams")]
    pub max_delayed_datagrams: usize,
}

impl Default for VmciOptions {
    fn default() -> VmciOptions {
        VmciOptions {
            worker_threads: default_worker_threads(),
            max_pending_jobs: default_max_pending_jobs(),
            resource_buckets: default_resource_buckets(),
            max_delayed_datagrams: default_max_delayed_datagrams(),
        }
    }
}

/// The assembled engine. Construction creates the host context; `shutdown`
/// gates the resource registry, releases the host context, and stops the
/// workers.
pub struct Vmci {
    worker: Arc<WorkQueue>,
    events: Arc<EventBus>,
    resources: Arc<ResourceRegistry>,
    contexts: Arc<ContextRegistry>,
    broker: Arc<QueuePairBroker>,
    datagrams: DatagramHub,
    doorbells: DoorbellHub,
    host: Arc<Context>,
}

// Manual impl: the hubs and registries hold callbacks all the way down.
impl std::fmt::Debug for Vmci {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vmci")
            .field("host", &self.host)
            .field("live_contexts", &self.contexts.len())
            .finish_non_exhaustive()
    }
}

impl Vmci {
    pub fn new(opts: &VmciOptions) -> Result<Vmci> {
        if opts.worker_threads == 0 {
            return Err(VmciError::InvalidArgs);
        }
        let worker = Arc::new(WorkQueue::new(
            "vmci-work",
            opts.worker_threads,
            opts.max_pending_jobs,
        ));
        let events = Arc::new(EventBus::new(worker.clone()));
        let resources = Arc::new(ResourceRegistry::new(opts.resource_buckets));
        let contexts = Arc::new(ContextRegistry::new(events.clone()));
        let broker = Arc::new(QueuePairBroker::new(contexts.clone(), events.clone()));
        contexts.set_collaborators(&broker, &resources);
        let datagrams = DatagramHub::new(
            resources.clone(),
            contexts.clone(),
            events.clone(),
            worker.clone(),
            opts.max_delayed_datagrams,
        );
        let doorbells = DoorbellHub::new(resources.clone(), contexts.clone(), worker.clone());
        let host = contexts.init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)?;
        info!(
            "engine up: {} worker threads, host context {}",
            opts.worker_threads, HOST_CONTEXT_ID
        );
        Ok(Vmci {
            worker,
            events,
            resources,
            contexts,
            broker,
            datagrams,
            doorbells,
            host,
        })
    }

    pub fn contexts(&self) -> &Arc<ContextRegistry> {
        &self.contexts
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn broker(&self) -> &Arc<QueuePairBroker> {
        &self.broker
    }

    pub fn host_context(&self) -> &Arc<Context> {
        &self.host
    }

    pub fn set_guest_transport(&self, transport: Arc<dyn GuestTransport>) {
        self.datagrams.set_guest_transport(transport);
    }

    /// Creates a context for a powering-on VM (or another host client).
    pub fn init_context(&self, cid: VmciId, priv_flags: PrivFlags) -> Result<Arc<Context>> {
        self.contexts.init_context(cid, priv_flags)
    }

    /// Drops a context reference; the last one tears the context down.
    pub fn release_context(&self, context: &Arc<Context>) {
        self.contexts.release(context)
    }

    /// Routes and delivers one datagram. Returns its total size on success.
    pub fn dispatch(&self, caller_cid: VmciId, dg: Datagram, from_guest: bool) -> Result<usize> {
        self.datagrams.dispatch(caller_cid, dg, from_guest)
    }

    /// Registers a host-side datagram receive endpoint.
    pub fn register_datagram_endpoint(
        &self,
        handle: VmciHandle,
        priv_flags: PrivFlags,
        run_delayed: bool,
        recv: DatagramRecvFn,
    ) -> Result<VmciHandle> {
        self.datagrams
            .create_endpoint(handle, priv_flags, run_delayed, recv)
    }

    /// Destroys an endpoint, draining in-flight deliveries first.
    pub fn unregister_datagram_endpoint(&self, handle: VmciHandle) -> Result<()> {
        self.datagrams.destroy_endpoint(handle)
    }

    pub fn doorbell_create(
        &self,
        handle: VmciHandle,
        priv_flags: PrivFlags,
        run_delayed: bool,
        notify: DoorbellNotifyFn,
    ) -> Result<VmciHandle> {
        self.doorbells.create(handle, priv_flags, run_delayed, notify)
    }

    pub fn doorbell_destroy(&self, handle: VmciHandle) -> Result<()> {
        self.doorbells.destroy(handle)
    }

    pub fn doorbell_link(&self, cid: VmciId, handle: VmciHandle) -> Result<()> {
        self.doorbells.link(cid, handle)
    }

    pub fn doorbell_unlink(&self, cid: VmciId, handle: VmciHandle) -> Result<()> {
        self.doorbells.unlink(cid, handle)
    }

    pub fn doorbell_notify(&self, caller_cid: VmciId, handle: VmciHandle) -> Result<()> {
        self.doorbells.notify(caller_cid, handle)
    }

    /// Subscribes `cid` to `remote_cid`'s removal event.
    pub fn add_notification(&self, cid: VmciId, remote_cid: VmciId) -> Result<()> {
        self.contexts.add_notification(cid, remote_cid)
    }

    pub fn remove_notification(&self, cid: VmciId, remote_cid: VmciId) -> Result<()> {
        self.contexts.remove_notification(cid, remote_cid)
    }

    /// Pauses or unpauses a guest context, announcing the change.
    pub fn set_context_paused(&self, context: &Arc<Context>, paused: bool) {
        self.contexts.set_paused(context, paused)
    }

    /// Guest memory became available: map queue pairs and announce.
    pub fn register_guest_mem(&self, context: &Arc<Context>, gid: u64) -> Result<()> {
        self.contexts.register_guest_mem(context, gid)
    }

    /// Guest memory is going away: unmap queue pairs and announce.
    pub fn release_guest_mem(&self, context: &Arc<Context>, gid: u64) -> Result<()> {
        self.contexts.release_guest_mem(context, gid)
    }

    pub fn subscribe_event(
        &self,
        kind: vmci_protocol::EventKind,
        delivery: EventDelivery,
        callback: EventCallback,
    ) -> Result<u32> {
        self.events.subscribe(kind, delivery, callback)
    }

    pub fn unsubscribe_event(&self, id: u32) -> Result<()> {
        self.events.unsubscribe(id)
    }

    /// Creates or attaches a queue pair on behalf of `cid`.
    #[allow(clippy::too_many_arguments)]
    pub fn qp_alloc(
        &self,
        cid: VmciId,
        handle: VmciHandle,
        peer: VmciId,
        flags: QueuePairFlags,
        produce_size: u64,
        consume_size: u64,
        page_store: Option<PageStore>,
        wakeup: Option<WakeupFn>,
    ) -> Result<bool> {
        let ctx = self.contexts.get(cid).ok_or(VmciError::NotFound)?;
        let result = self.broker.alloc(
            handle,
            peer,
            flags,
            produce_size,
            consume_size,
            page_store,
            &ctx,
            wakeup,
        );
        self.contexts.release(&ctx);
        result
    }

    pub fn qp_set_page_store(
        &self,
        cid: VmciId,
        handle: VmciHandle,
        store: PageStore,
    ) -> Result<()> {
        let ctx = self.contexts.get(cid).ok_or(VmciError::NotFound)?;
        let result = self.broker.set_page_store(handle, store, &ctx);
        self.contexts.release(&ctx);
        result
    }

    pub fn qp_detach(&self, cid: VmciId, handle: VmciHandle) -> Result<()> {
        let ctx = self.contexts.get(cid).ok_or(VmciError::NotFound)?;
        let result = self.broker.detach(handle, &ctx);
        self.contexts.release(&ctx);
        result
    }

    pub fn qp_map(&self, cid: VmciId, handle: VmciHandle) -> Result<()> {
        let ctx = self.contexts.get(cid).ok_or(VmciError::NotFound)?;
        let result = self.broker.map(handle, &ctx);
        self.contexts.release(&ctx);
        result
    }

    pub fn qp_unmap(&self, cid: VmciId, handle: VmciHandle) -> Result<()> {
        let ctx = self.contexts.get(cid).ok_or(VmciError::NotFound)?;
        let result = self.broker.unmap(handle, &ctx);
        self.contexts.release(&ctx);
        result
    }

    /// Orderly stop: no new resources, host context released, workers
    /// joined. Surviving guest contexts are torn down by their owners.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.resources.shutdown();
        self.contexts.release(&self.host);
        self.worker.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use vmci_protocol::DATAGRAM_HEADER_SIZE;

    use super::*;

    fn engine() -> Vmci {
        let _ = env_logger::builder().is_test(true).try_init();
        Vmci::new(&VmciOptions::default()).unwrap()
    }

    #[test]
    fn options_defaults_and_config_parse() {
        let opts: VmciOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.worker_threads, VmciOptions::default().worker_threads);
        let opts: VmciOptions =
            serde_json::from_str(r#"{"worker-threads": 4, "resource-buckets": 8}"#).unwrap();
        assert_eq!(opts.worker_threads, 4);
        assert_eq!(opts.resource_buckets, 8);
        assert!(serde_json::from_str::<VmciOptions>(r#"{"bogus": 1}"#).is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let opts = VmciOptions {
            worker_threads: 0,
            ..Default::default()
        };
        assert_eq!(Vmci::new(&opts).unwrap_err(), VmciError::InvalidArgs);
    }

    #[test]
    fn end_to_end_datagram_delivery() {
        let vmci = engine();
        let a = vmci.init_context(10, PrivFlags::empty()).unwrap();
        let b = vmci.init_context(11, PrivFlags::empty()).unwrap();
        assert_eq!(a.cid(), 10);
        assert_eq!(b.cid(), 11);

        let deliveries = Arc::new(AtomicUsize::new(0));
        let d = deliveries.clone();
        let endpoint = vmci
            .register_datagram_endpoint(
                VmciHandle::new(10, 40),
                PrivFlags::empty(),
                false,
                Box::new(move |dg| {
                    assert_eq!(dg.payload.len(), 100);
                    d.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let dg = Datagram::new(endpoint, VmciHandle::new(11, 41), vec![7; 100]).unwrap();
        let size = vmci.dispatch(11, dg, false).unwrap();
        assert_eq!(size, 100 + DATAGRAM_HEADER_SIZE);
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);

        vmci.unregister_datagram_endpoint(endpoint).unwrap();
        vmci.release_context(&a);
        vmci.release_context(&b);
        vmci.shutdown();
    }

    #[test]
    fn shutdown_gates_new_endpoints() {
        let vmci = engine();
        vmci.shutdown();
        assert_eq!(
            vmci.register_datagram_endpoint(
                VmciHandle::new(HOST_CONTEXT_ID, vmci_protocol::INVALID_ID),
                PrivFlags::empty(),
                false,
                Box::new(|_| {}),
            )
            .unwrap_err(),
            VmciError::Unavailable
        );
    }
}
