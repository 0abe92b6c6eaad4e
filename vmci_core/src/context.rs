// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-VM (and host) context registry.
//!
//! A context owns its pending datagram queue, its queue-pair and doorbell
//! handle sets, and the list of peers subscribed to its removal. Lifetime is
//! refcount driven: `get` borrows, `release` returns, and the last release
//! tears the context down — queue pairs detached through the broker, queued
//! datagrams dropped, doorbells unregistered, and a removal notification
//! fired to every subscriber before the entry disappears.
//!
//! Lock order: the registry map lock and a context's state lock are never
//! held together with another context's state lock; multi-context updates
//! serialize on the global firing lock, which ranks above every per-context
//! lock.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use log::debug;
use log::warn;
use parking_lot::Mutex;
use vmci_protocol::CheckpointDatagramRecord;
use vmci_protocol::EventKind;
use vmci_protocol::EventPayloadContext;
use vmci_protocol::PrivFlags;
use vmci_protocol::VmciHandle;
use vmci_protocol::VmciId;
use vmci_protocol::EVENT_HANDLER_RESOURCE_ID;
use vmci_protocol::HOST_CONTEXT_ID;
use vmci_protocol::HYPERVISOR_CONTEXT_ID;
use vmci_protocol::INVALID_ID;
use vmci_protocol::MAX_DATAGRAM_QUEUE_SIZE;
use vmci_protocol::MAX_HYPERVISOR_QUEUE_SIZE;
use vmci_protocol::RESERVED_CID_LIMIT;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::datagram::Datagram;
use crate::error::Result;
use crate::error::VmciError;
use crate::event::EventBus;
use crate::queue_pair::QueuePairBroker;
use crate::resource::ResourceRegistry;

pub type NotifyHookFn = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ContextState {
    datagram_queue: VecDeque<Datagram>,
    queue_bytes: usize,
    qp_handles: BTreeSet<VmciHandle>,
    doorbells: BTreeSet<VmciHandle>,
    pending_doorbells: BTreeSet<VmciHandle>,
    /// Contexts that asked to hear about this context's removal.
    removal_subscribers: BTreeSet<VmciId>,
    /// Contexts this one is watching; mirrored so teardown and
    /// checkpointing need no registry scan.
    watching: BTreeSet<VmciId>,
    paused: bool,
    guest_mem: Option<u64>,
}

pub struct Context {
    cid: VmciId,
    priv_flags: PrivFlags,
    // Guarded by the registry map lock; atomic only for lock-free reads.
    refs: AtomicU64,
    state: Mutex<ContextState>,
    notify_hook: Mutex<Option<NotifyHookFn>>,
}

// Manual impl: the notify hook is a callback and the queue contents are
// not worth printing.
impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cid", &self.cid)
            .field("priv_flags", &self.priv_flags)
            .field("refs", &self.refs)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn cid(&self) -> VmciId {
        self.cid
    }

    pub fn priv_flags(&self) -> PrivFlags {
        self.priv_flags
    }

    /// Installs the "work pending" signal, the stand-in for the platform
    /// doorbell/interrupt that wakes the VM's consumer thread.
    pub fn set_notify_hook(&self, hook: NotifyHookFn) {
        *self.notify_hook.lock() = Some(hook);
    }

    fn signal_work_pending(&self) {
        if let Some(hook) = self.notify_hook.lock().as_ref() {
            hook();
        }
    }

    /// Appends `dg` to the pending queue, subject to the byte cap: ordinary
    /// traffic is bounded by `MAX_DATAGRAM_QUEUE_SIZE`, hypervisor-origin
    /// traffic by the larger `MAX_HYPERVISOR_QUEUE_SIZE`. Returns the
    /// datagram's total size.
    pub fn enqueue_datagram(&self, dg: Datagram, notify: bool) -> Result<usize> {
        let size = dg.total_size();
        let cap = if dg.src.context == HYPERVISOR_CONTEXT_ID {
            MAX_HYPERVISOR_QUEUE_SIZE
        } else {
            MAX_DATAGRAM_QUEUE_SIZE
        };
        {
            let mut state = self.state.lock();
            if state.queue_bytes + size >= cap {
                return Err(VmciError::NoResources);
            }
            state.datagram_queue.push_back(dg);
            state.queue_bytes += size;
        }
        if notify {
            self.signal_work_pending();
        }
        Ok(size)
    }

    /// Pops the head datagram if it fits in `max_size` bytes.
    ///
    /// Returns the datagram and the size of the new head (0 when the queue
    /// is now empty) so the caller can size its next read. An undersized
    /// buffer fails with `BufferTooSmall` and leaves the head in place, so
    /// the retry after resizing succeeds.
    pub fn dequeue_datagram(&self, max_size: usize) -> Result<(Datagram, usize)> {
        let mut state = self.state.lock();
        let head_size = match state.datagram_queue.front() {
            None => return Err(VmciError::NoMoreDatagrams),
            Some(head) => head.total_size(),
        };
        if head_size > max_size {
            return Err(VmciError::BufferTooSmall {
                required: head_size as u64,
            });
        }
        let dg = state
            .datagram_queue
            .pop_front()
            .expect("non-empty queue lost its head");
        state.queue_bytes -= head_size;
        let next = state
            .datagram_queue
            .front()
            .map_or(0, |next| next.total_size());
        Ok((dg, next))
    }

    /// Number of datagrams waiting to be dequeued.
    pub fn pending_datagrams(&self) -> usize {
        self.state.lock().datagram_queue.len()
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub(crate) fn add_qp_handle(&self, handle: VmciHandle) {
        self.state.lock().qp_handles.insert(handle);
    }

    pub(crate) fn remove_qp_handle(&self, handle: VmciHandle) {
        self.state.lock().qp_handles.remove(&handle);
    }

    pub fn qp_handles(&self) -> Vec<VmciHandle> {
        self.state.lock().qp_handles.iter().copied().collect()
    }

    pub(crate) fn add_doorbell(&self, handle: VmciHandle) {
        self.state.lock().doorbells.insert(handle);
    }

    pub(crate) fn has_doorbell(&self, handle: VmciHandle) -> bool {
        self.state.lock().doorbells.contains(&handle)
    }

    pub(crate) fn remove_doorbell(&self, handle: VmciHandle) {
        let mut state = self.state.lock();
        state.doorbells.remove(&handle);
        state.pending_doorbells.remove(&handle);
    }

    /// Records a fired doorbell and signals work pending.
    pub(crate) fn post_doorbell(&self, handle: VmciHandle) {
        {
            let mut state = self.state.lock();
            state.pending_doorbells.insert(handle);
        }
        self.signal_work_pending();
    }

    /// Drains and returns the set of doorbells fired since the last call.
    pub fn take_pending_doorbells(&self) -> Vec<VmciHandle> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.pending_doorbells)
            .into_iter()
            .collect()
    }

    /// Serializes the cids this context subscribed to, as packed
    /// little-endian u32s.
    pub fn checkpoint_notifications(&self) -> Vec<u8> {
        let state = self.state.lock();
        let mut blob = Vec::with_capacity(state.watching.len() * 4);
        for cid in &state.watching {
            blob.extend_from_slice(&cid.to_le_bytes());
        }
        blob
    }

    /// Serializes the context's doorbell handles as packed 64-bit encodings.
    pub fn checkpoint_doorbells(&self) -> Vec<u8> {
        let state = self.state.lock();
        let mut blob = Vec::with_capacity(state.doorbells.len() * 8);
        for handle in &state.doorbells {
            blob.extend_from_slice(&handle.to_u64().to_le_bytes());
        }
        blob
    }

    /// Rebuilds the doorbell handle set from a `checkpoint_doorbells` blob.
    ///
    /// Every stored handle must name this context; the resource-registry
    /// entries themselves are recreated by the owner re-issuing its creates,
    /// so only the link set is restored here.
    pub fn restore_doorbells(&self, blob: &[u8]) -> Result<()> {
        if blob.len() % 8 != 0 {
            return Err(VmciError::InvalidArgs);
        }
        let mut handles = Vec::with_capacity(blob.len() / 8);
        for chunk in blob.chunks_exact(8) {
            let handle =
                VmciHandle::from_u64(u64::from_le_bytes(chunk.try_into().expect("chunk size is 8")));
            if handle.context != self.cid {
                return Err(VmciError::InvalidArgs);
            }
            handles.push(handle);
        }
        let mut state = self.state.lock();
        for handle in handles {
            state.doorbells.insert(handle);
        }
        Ok(())
    }

    /// Serializes pending hypervisor-originated datagrams as length-prefixed
    /// records, dropping (best effort, by design) any record that does not
    /// fit in `max_size` bytes. Each drop is logged.
    pub fn checkpoint_datagrams(&self, max_size: usize) -> Vec<u8> {
        let state = self.state.lock();
        let mut blob = Vec::new();
        for dg in &state.datagram_queue {
            if dg.src.context != HYPERVISOR_CONTEXT_ID {
                continue;
            }
            let bytes = dg.to_bytes();
            let record_size = std::mem::size_of::<CheckpointDatagramRecord>() + bytes.len();
            if blob.len() + record_size > max_size {
                warn!(
                    "context {}: dropping {} byte pending datagram from checkpoint",
                    self.cid,
                    bytes.len()
                );
                continue;
            }
            let record = CheckpointDatagramRecord {
                size: bytes.len() as u32,
            };
            blob.extend_from_slice(record.as_bytes());
            blob.extend_from_slice(&bytes);
        }
        blob
    }

    /// Rebuilds the pending queue from a `checkpoint_datagrams` blob.
    pub fn restore_datagrams(&self, blob: &[u8]) -> Result<()> {
        let mut rest = blob;
        while !rest.is_empty() {
            let (record, tail) = CheckpointDatagramRecord::read_from_prefix(rest)
                .map_err(|_| VmciError::InvalidArgs)?;
            let size = record.size as usize;
            if tail.len() < size {
                return Err(VmciError::InvalidArgs);
            }
            let dg = Datagram::from_bytes(&tail[..size])?;
            if let Err(e) = self.enqueue_datagram(dg, false) {
                warn!("context {}: dropping restored datagram: {}", self.cid, e);
            }
            rest = &tail[size..];
        }
        Ok(())
    }

    /// Records guest memory availability; the broker map/unmap calls are
    /// driven by the registry wrappers below.
    fn set_guest_mem(&self, gid: Option<u64>) {
        self.state.lock().guest_mem = gid;
    }

    pub fn guest_mem(&self) -> Option<u64> {
        self.state.lock().guest_mem
    }
}

struct Collaborators {
    broker: Weak<QueuePairBroker>,
    resources: Weak<ResourceRegistry>,
}

pub struct ContextRegistry {
    contexts: Mutex<BTreeMap<VmciId, Arc<Context>>>,
    /// Serializes every multi-context walk (removal notification fan-out,
    /// subscription updates); ranks above all per-context state locks.
    firing: Mutex<()>,
    events: Arc<EventBus>,
    collaborators: Mutex<Option<Collaborators>>,
}

impl ContextRegistry {
    pub fn new(events: Arc<EventBus>) -> ContextRegistry {
        ContextRegistry {
            contexts: Mutex::new(BTreeMap::new()),
            firing: Mutex::new(()),
            events,
            collaborators: Mutex::new(None),
        }
    }

    /// Wires the registry to the broker and resource registry it needs for
    /// teardown; called once by the driver after construction.
    pub fn set_collaborators(
        &self,
        broker: &Arc<QueuePairBroker>,
        resources: &Arc<ResourceRegistry>,
    ) {
        *self.collaborators.lock() = Some(Collaborators {
            broker: Arc::downgrade(broker),
            resources: Arc::downgrade(resources),
        });
    }

    /// Creates a context. An explicitly requested cid below the reserved
    /// limit fails hard on collision; a dynamic cid that collides is bumped
    /// to the next free id above the reserved range.
    pub fn init_context(&self, cid: VmciId, priv_flags: PrivFlags) -> Result<Arc<Context>> {
        if cid == INVALID_ID {
            return Err(VmciError::InvalidArgs);
        }
        if !PrivFlags::all().contains(priv_flags) {
            return Err(VmciError::InvalidArgs);
        }
        let mut contexts = self.contexts.lock();
        let cid = if cid < RESERVED_CID_LIMIT {
            if contexts.contains_key(&cid) {
                return Err(VmciError::AlreadyExists);
            }
            cid
        } else {
            let mut candidate = cid;
            while contexts.contains_key(&candidate) {
                candidate = match candidate.checked_add(1) {
                    Some(c) if c != INVALID_ID => c,
                    _ => RESERVED_CID_LIMIT,
                };
                if candidate == cid {
                    return Err(VmciError::NoResources);
                }
            }
            candidate
        };
        let context = Arc::new(Context {
            cid,
            priv_flags,
            refs: AtomicU64::new(1),
            state: Mutex::new(ContextState::default()),
            notify_hook: Mutex::new(None),
        });
        contexts.insert(cid, context.clone());
        debug!("created context {} with flags {:?}", cid, priv_flags);
        Ok(context)
    }

    /// Refcounted borrow.
    pub fn get(&self, cid: VmciId) -> Option<Arc<Context>> {
        let contexts = self.contexts.lock();
        let context = contexts.get(&cid)?;
        context.refs.fetch_add(1, Ordering::SeqCst);
        Some(context.clone())
    }

    /// Drops a reference; the last one removes the context from the map and
    /// tears it down.
    pub fn release(&self, context: &Arc<Context>) {
        {
            let mut contexts = self.contexts.lock();
            let prev = context.refs.fetch_sub(1, Ordering::SeqCst);
            assert!(prev > 0, "release of a context with zero refcount");
            if prev > 1 {
                return;
            }
            contexts.remove(&context.cid);
        }
        self.teardown(context);
    }

    fn teardown(&self, context: &Arc<Context>) {
        debug!("destroying context {}", context.cid);
        self.fire_removal_notification(context);

        let (broker, resources) = {
            let collaborators = self.collaborators.lock();
            match collaborators.as_ref() {
                Some(c) => (c.broker.upgrade(), c.resources.upgrade()),
                None => (None, None),
            }
        };

        // Detach every queue pair the context still holds.
        let qp_handles = context.qp_handles();
        if let Some(broker) = broker {
            for handle in qp_handles {
                if let Err(e) = broker.detach(handle, context) {
                    warn!(
                        "context {}: queue pair {:?} detach at teardown: {}",
                        context.cid, handle, e
                    );
                }
            }
        } else if !qp_handles.is_empty() {
            warn!(
                "context {}: leaking {} queue pairs, broker is gone",
                context.cid,
                qp_handles.len()
            );
        }

        // Unregister doorbells the owner never destroyed.
        let mut state = context.state.lock();
        if let Some(resources) = resources {
            for handle in std::mem::take(&mut state.doorbells) {
                let _ = resources.remove(handle);
            }
        }
        let dropped = state.datagram_queue.len();
        state.datagram_queue.clear();
        state.queue_bytes = 0;
        state.pending_doorbells.clear();
        if dropped > 0 {
            debug!("context {}: dropped {} queued datagrams", context.cid, dropped);
        }
    }

    /// Notifies every subscriber that `context` is going away: an event
    /// datagram on each subscriber's queue plus a bus publication for host
    /// listeners. Runs under the firing lock so per-context lock order
    /// stays single-level.
    fn fire_removal_notification(&self, context: &Arc<Context>) {
        // References taken while the firing lock is held are returned, and
        // subscriber notify hooks run, only after it is dropped: a release
        // (or a hook dropping a last reference) can recurse into teardown,
        // and teardown takes the firing lock.
        let mut borrowed = Vec::new();
        let mut notified = Vec::new();
        {
            let _firing = self.firing.lock();
            let (subscribers, watching) = {
                let mut state = context.state.lock();
                (
                    std::mem::take(&mut state.removal_subscribers),
                    std::mem::take(&mut state.watching),
                )
            };
            for cid in &subscribers {
                if let Some(subscriber) = self.get(*cid) {
                    subscriber.state.lock().watching.remove(&context.cid);
                    match self.post_event_to(&subscriber, EventKind::CtxRemoved, context.cid) {
                        Ok(_) => notified.push(subscriber.clone()),
                        Err(e) => warn!(
                            "context removed event for {} dropped on {}: {}",
                            context.cid, cid, e
                        ),
                    }
                    borrowed.push(subscriber);
                }
            }
            // Drop the reverse edges for contexts this one was watching.
            for cid in &watching {
                if let Some(watched) = self.get(*cid) {
                    watched.state.lock().removal_subscribers.remove(&context.cid);
                    borrowed.push(watched);
                }
            }
        }
        for ctx in &notified {
            ctx.signal_work_pending();
        }
        for ctx in &borrowed {
            self.release(ctx);
        }
        let payload = EventPayloadContext {
            context_id: context.cid,
            _pad: 0,
        };
        if let Err(e) = self.events.publish(EventKind::CtxRemoved, payload.as_bytes()) {
            warn!("context removed publication for {}: {}", context.cid, e);
        }
    }

    fn post_event_to(
        &self,
        target: &Arc<Context>,
        kind: EventKind,
        subject_cid: VmciId,
    ) -> Result<usize> {
        let payload = EventPayloadContext {
            context_id: subject_cid,
            _pad: 0,
        };
        let mut bytes =
            Vec::with_capacity(std::mem::size_of::<vmci_protocol::EventHeader>() + 8);
        bytes.extend_from_slice(
            vmci_protocol::EventHeader {
                event: kind as u32,
                _pad: 0,
            }
            .as_bytes(),
        );
        bytes.extend_from_slice(payload.as_bytes());
        let dg = Datagram::new(
            VmciHandle::new(target.cid, EVENT_HANDLER_RESOURCE_ID),
            VmciHandle::new(HOST_CONTEXT_ID, EVENT_HANDLER_RESOURCE_ID),
            bytes,
        )?;
        // Queued without a wakeup; the caller signals once the firing lock
        // is back down.
        target.enqueue_datagram(dg, false)
    }

    /// Convenience wrapper resolving `cid` before enqueueing.
    pub fn enqueue_datagram(&self, cid: VmciId, dg: Datagram, notify: bool) -> Result<usize> {
        let context = self.get(cid).ok_or(VmciError::NotFound)?;
        let result = context.enqueue_datagram(dg, notify);
        self.release(&context);
        result
    }

    /// Subscribes `cid` to `remote_cid`'s removal event.
    pub fn add_notification(&self, cid: VmciId, remote_cid: VmciId) -> Result<()> {
        if cid == remote_cid
            || (!crate::route::is_guest_cid(remote_cid) && remote_cid != HOST_CONTEXT_ID)
        {
            return Err(VmciError::InvalidArgs);
        }
        let mut borrowed = Vec::new();
        let result = {
            let _firing = self.firing.lock();
            match (self.get(cid), self.get(remote_cid)) {
                (Some(subscriber), Some(watched)) => {
                    let inserted = subscriber.state.lock().watching.insert(remote_cid);
                    let result = if !inserted {
                        Err(VmciError::DuplicateEntry)
                    } else {
                        watched.state.lock().removal_subscribers.insert(cid);
                        Ok(())
                    };
                    borrowed.push(subscriber);
                    borrowed.push(watched);
                    result
                }
                (subscriber, watched) => {
                    borrowed.extend(subscriber);
                    borrowed.extend(watched);
                    Err(VmciError::NotFound)
                }
            }
        };
        for ctx in &borrowed {
            self.release(ctx);
        }
        result
    }

    /// Removes a removal-event subscription.
    pub fn remove_notification(&self, cid: VmciId, remote_cid: VmciId) -> Result<()> {
        let mut borrowed = Vec::new();
        let result = {
            let _firing = self.firing.lock();
            let subscriber = self.get(cid).ok_or(VmciError::NotFound)?;
            let removed = subscriber.state.lock().watching.remove(&remote_cid);
            if let Some(watched) = self.get(remote_cid) {
                watched.state.lock().removal_subscribers.remove(&cid);
                borrowed.push(watched);
            }
            borrowed.push(subscriber);
            if removed {
                Ok(())
            } else {
                Err(VmciError::NotFound)
            }
        };
        for ctx in &borrowed {
            self.release(ctx);
        }
        result
    }

    /// Rebuilds removal subscriptions from a `checkpoint_notifications`
    /// blob.
    pub fn restore_notifications(&self, cid: VmciId, blob: &[u8]) -> Result<()> {
        if blob.len() % 4 != 0 {
            return Err(VmciError::InvalidArgs);
        }
        for chunk in blob.chunks_exact(4) {
            let remote = u32::from_le_bytes(chunk.try_into().expect("chunk size is 4"));
            match self.add_notification(cid, remote) {
                Ok(()) | Err(VmciError::DuplicateEntry) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Marks a context paused or unpaused and announces the change on the
    /// event bus.
    pub fn set_paused(&self, context: &Arc<Context>, paused: bool) {
        context.set_paused(paused);
        let kind = if paused {
            EventKind::GuestPaused
        } else {
            EventKind::GuestUnpaused
        };
        let payload = EventPayloadContext {
            context_id: context.cid,
            _pad: 0,
        };
        if let Err(e) = self.events.publish(kind, payload.as_bytes()) {
            warn!("{:?} publication for {}: {}", kind, context.cid, e);
        }
    }

    /// Maps every queue pair owned by `context` once its guest memory is
    /// registered (VM unquiesce / restore path).
    pub fn register_guest_mem(&self, context: &Arc<Context>, gid: u64) -> Result<()> {
        let broker = self.broker().ok_or(VmciError::Unavailable)?;
        context.set_guest_mem(Some(gid));
        for handle in context.qp_handles() {
            if let Err(e) = broker.map(handle, context) {
                warn!("context {}: map of {:?} failed: {}", context.cid, handle, e);
            }
        }
        let payload = EventPayloadContext {
            context_id: context.cid,
            _pad: 0,
        };
        if let Err(e) = self.events.publish(EventKind::MemAccessOn, payload.as_bytes()) {
            warn!("memory access publication for {}: {}", context.cid, e);
        }
        Ok(())
    }

    /// Unmaps every queue pair owned by `context` before its guest memory
    /// goes away (VM quiesce / snapshot path).
    pub fn release_guest_mem(&self, context: &Arc<Context>, gid: u64) -> Result<()> {
        let broker = self.broker().ok_or(VmciError::Unavailable)?;
        if context.guest_mem() != Some(gid) {
            return Err(VmciError::InvalidArgs);
        }
        for handle in context.qp_handles() {
            if let Err(e) = broker.unmap(handle, context) {
                warn!(
                    "context {}: unmap of {:?} failed: {}",
                    context.cid, handle, e
                );
            }
        }
        context.set_guest_mem(None);
        let payload = EventPayloadContext {
            context_id: context.cid,
            _pad: 0,
        };
        if let Err(e) = self.events.publish(EventKind::MemAccessOff, payload.as_bytes()) {
            warn!("memory access publication for {}: {}", context.cid, e);
        }
        Ok(())
    }

    fn broker(&self) -> Option<Arc<QueuePairBroker>> {
        self.collaborators
            .lock()
            .as_ref()
            .and_then(|c| c.broker.upgrade())
    }

    /// Number of live contexts; used by tests and shutdown diagnostics.
    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }
}
