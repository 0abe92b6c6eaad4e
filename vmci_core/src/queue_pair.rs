// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Broker for shared-memory queue pairs.
//!
//! A queue pair is two ring buffers shared by exactly two endpoints. The
//! broker tracks each pair through an eight-state lifecycle; the
//! `_NO_MEM`/`_MEM` siblings of each phase differ only in whether guest
//! memory backing the rings is currently available, and quiesce/unquiesce
//! toggles between them without losing ring positions.
//!
//! Sizes are always stored from the guest's point of view. A host-side
//! creator or attacher works with swapped produce/consume queues, except on
//! a local (same-context) pair where the attacher swaps instead; `alloc`
//! reports the swap so callers present the right orientation upward.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use log::warn;
use parking_lot::Mutex;
use vmci_protocol::EventKind;
use vmci_protocol::EventPayloadQueuePair;
use vmci_protocol::PrivFlags;
use vmci_protocol::QueueHeader;
use vmci_protocol::QueuePairFlags;
use vmci_protocol::VmciHandle;
use vmci_protocol::VmciId;
use vmci_protocol::EVENT_HANDLER_RESOURCE_ID;
use vmci_protocol::HOST_CONTEXT_ID;
use vmci_protocol::INVALID_ID;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::context::Context;
use crate::context::ContextRegistry;
use crate::datagram::Datagram;
use crate::error::Result;
use crate::error::VmciError;
use crate::event::EventBus;
use crate::route::is_guest_cid;

/// Lifecycle of a broker entry. The numeric layout keeps each `_NO_MEM`
/// state immediately below its `_MEM` sibling so the memory toggle is a
/// single step.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum QpState {
    New = 0,
    CreatedNoMem = 1,
    CreatedMem = 2,
    AttachedNoMem = 3,
    AttachedMem = 4,
    ShutdownNoMem = 5,
    ShutdownMem = 6,
    Gone = 7,
}

impl QpState {
    pub fn has_mem(self) -> bool {
        matches!(
            self,
            QpState::CreatedMem | QpState::AttachedMem | QpState::ShutdownMem
        )
    }

    fn with_mem(self) -> QpState {
        match self {
            QpState::CreatedNoMem => QpState::CreatedMem,
            QpState::AttachedNoMem => QpState::AttachedMem,
            QpState::ShutdownNoMem => QpState::ShutdownMem,
            other => other,
        }
    }

    fn without_mem(self) -> QpState {
        match self {
            QpState::CreatedMem => QpState::CreatedNoMem,
            QpState::AttachedMem => QpState::AttachedNoMem,
            QpState::ShutdownMem => QpState::ShutdownNoMem,
            other => other,
        }
    }
}

/// Opaque description of the guest memory backing a pair, registered at
/// alloc time or later through `set_page_store`. The addresses are tokens
/// owned by the platform layer; the broker never dereferences them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageStore {
    pub produce_uva: u64,
    pub consume_uva: u64,
}

pub type WakeupFn = Arc<dyn Fn() + Send + Sync>;

/// One ring buffer direction. The ring header occupies the front of the
/// backing memory; `header` holds the snapshot taken at unmap so ring
/// positions survive while the memory is away.
struct QpQueue {
    size: u64,
    header: QueueHeader,
    mem: Option<Vec<u8>>,
}

impl QpQueue {
    fn new(size: u64) -> QpQueue {
        QpQueue {
            size,
            header: QueueHeader::default(),
            mem: None,
        }
    }

    fn map(&mut self) {
        if self.mem.is_none() {
            let mut mem = vec![0; std::mem::size_of::<QueueHeader>() + self.size as usize];
            mem[..std::mem::size_of::<QueueHeader>()].copy_from_slice(self.header.as_bytes());
            self.mem = Some(mem);
        }
    }

    fn unmap(&mut self) {
        if let Some(mem) = self.mem.take() {
            if let Ok((header, _)) = QueueHeader::read_from_prefix(&mem) {
                self.header = header;
            }
        }
    }
}

struct QpBrokerEntry {
    handle: VmciHandle,
    peer: VmciId,
    flags: QueuePairFlags,
    /// Guest-perspective sizes.
    produce_size: u64,
    consume_size: u64,
    create_id: VmciId,
    attach_id: VmciId,
    state: QpState,
    require_trusted_attach: bool,
    created_by_trusted: bool,
    produce_q: QpQueue,
    consume_q: QpQueue,
    page_store: Option<PageStore>,
    page_store_owner: Option<VmciId>,
    wakeup: Option<WakeupFn>,
    refs: u32,
}

pub struct QueuePairBroker {
    entries: Mutex<BTreeMap<VmciHandle, Arc<Mutex<QpBrokerEntry>>>>,
    contexts: Arc<ContextRegistry>,
    events: Arc<EventBus>,
}

impl QueuePairBroker {
    pub fn new(contexts: Arc<ContextRegistry>, events: Arc<EventBus>) -> QueuePairBroker {
        QueuePairBroker {
            entries: Mutex::new(BTreeMap::new()),
            contexts,
            events,
        }
    }

    fn find(&self, handle: VmciHandle) -> Option<Arc<Mutex<QpBrokerEntry>>> {
        self.entries.lock().get(&handle).cloned()
    }

    /// Creates or attaches to the queue pair named by `handle` on behalf of
    /// `context`. Returns true when the caller must swap its produce and
    /// consume views (host endpoint of a non-local pair, or the attaching
    /// endpoint of a local pair).
    pub fn alloc(
        &self,
        handle: VmciHandle,
        peer: VmciId,
        flags: QueuePairFlags,
        produce_size: u64,
        consume_size: u64,
        page_store: Option<PageStore>,
        context: &Arc<Context>,
        wakeup: Option<WakeupFn>,
    ) -> Result<bool> {
        if handle.context == INVALID_ID || handle.resource == INVALID_ID {
            return Err(VmciError::InvalidArgs);
        }
        if produce_size == 0 && consume_size == 0 {
            return Err(VmciError::InvalidArgs);
        }
        if !QueuePairFlags::all().contains(flags) {
            return Err(VmciError::InvalidArgs);
        }
        let existing = self.find(handle);
        match existing {
            None => self.create(handle, peer, flags, produce_size, consume_size, page_store, context, wakeup),
            Some(entry) => self.attach(
                entry,
                flags,
                produce_size,
                consume_size,
                page_store,
                context,
                wakeup,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &self,
        handle: VmciHandle,
        peer: VmciId,
        flags: QueuePairFlags,
        produce_size: u64,
        consume_size: u64,
        page_store: Option<PageStore>,
        context: &Arc<Context>,
        wakeup: Option<WakeupFn>,
    ) -> Result<bool> {
        if flags.contains(QueuePairFlags::ATTACH_ONLY) {
            return Err(VmciError::NotFound);
        }
        let cid = context.cid();
        let local = flags.contains(QueuePairFlags::LOCAL);
        let peer = if local { cid } else { peer };
        if handle.context != cid && peer != cid {
            return Err(VmciError::NoAccess);
        }
        if is_guest_cid(cid) && is_guest_cid(peer) && peer != cid {
            // The broker never sets up guest-to-guest shared memory.
            return Err(VmciError::DstUnreachable);
        }
        let is_host = cid == HOST_CONTEXT_ID;
        let swap = is_host && !local;
        let (guest_produce, guest_consume) = if swap {
            (consume_size, produce_size)
        } else {
            (produce_size, consume_size)
        };
        let have_mem = page_store.is_some() || local;
        let mut entry = QpBrokerEntry {
            handle,
            peer,
            flags,
            produce_size: guest_produce,
            consume_size: guest_consume,
            create_id: cid,
            attach_id: INVALID_ID,
            state: if have_mem {
                QpState::CreatedMem
            } else {
                QpState::CreatedNoMem
            },
            require_trusted_attach: context.priv_flags().contains(PrivFlags::RESTRICTED),
            created_by_trusted: context.priv_flags().contains(PrivFlags::TRUSTED),
            produce_q: QpQueue::new(guest_produce),
            consume_q: QpQueue::new(guest_consume),
            page_store,
            page_store_owner: page_store.map(|_| cid),
            wakeup,
            refs: 1,
        };
        if have_mem {
            entry.produce_q.map();
            entry.consume_q.map();
        }
        let mut entries = self.entries.lock();
        // A concurrent create may have won the race since `find`.
        if entries.contains_key(&handle) {
            return Err(VmciError::AlreadyExists);
        }
        entries.insert(handle, Arc::new(Mutex::new(entry)));
        drop(entries);
        context.add_qp_handle(handle);
        debug!("queue pair {:?} created by context {}", handle, cid);
        Ok(swap)
    }

    #[allow(clippy::too_many_arguments)]
    fn attach(
        &self,
        entry: Arc<Mutex<QpBrokerEntry>>,
        flags: QueuePairFlags,
        produce_size: u64,
        consume_size: u64,
        page_store: Option<PageStore>,
        context: &Arc<Context>,
        wakeup: Option<WakeupFn>,
    ) -> Result<bool> {
        let cid = context.cid();
        let (handle, peer_cid, event_flags, swap) = {
            let mut e = entry.lock();
            if e.state != QpState::CreatedNoMem && e.state != QpState::CreatedMem {
                return Err(VmciError::Unavailable);
            }
            let local = e.flags.contains(QueuePairFlags::LOCAL);
            if local {
                if cid != e.create_id {
                    return Err(VmciError::InvalidArgs);
                }
            } else if cid == e.create_id || cid == e.attach_id {
                return Err(VmciError::AlreadyExists);
            }
            if is_guest_cid(cid) && is_guest_cid(e.create_id) && cid != e.create_id {
                return Err(VmciError::DstUnreachable);
            }
            if e.peer != INVALID_ID && e.peer != cid {
                return Err(VmciError::NoAccess);
            }
            if e.require_trusted_attach && !context.priv_flags().contains(PrivFlags::TRUSTED) {
                return Err(VmciError::NoAccess);
            }
            if context.priv_flags().contains(PrivFlags::RESTRICTED) && !e.created_by_trusted {
                return Err(VmciError::NoAccess);
            }
            let attach_only = QueuePairFlags::ATTACH_ONLY;
            if (e.flags - attach_only) != (flags - attach_only) {
                return Err(VmciError::QueuePairMismatch);
            }
            // Convert the attacher's view to the guest perspective before
            // comparing against the stored sizes.
            let swap = local || cid == HOST_CONTEXT_ID;
            let (guest_produce, guest_consume) = if swap {
                (consume_size, produce_size)
            } else {
                (produce_size, consume_size)
            };
            if guest_produce != e.produce_size || guest_consume != e.consume_size {
                return Err(VmciError::QueuePairMismatch);
            }
            // The pair holds at most one memory registration; an attacher
            // bringing a second store is a caller bug, not something to
            // drop on the floor.
            if page_store.is_some() && e.state.has_mem() {
                return Err(VmciError::Unavailable);
            }
            e.attach_id = cid;
            e.refs += 1;
            if let Some(store) = page_store {
                e.page_store = Some(store);
                e.page_store_owner = Some(cid);
                e.produce_q.map();
                e.consume_q.map();
                e.state = QpState::AttachedMem;
            } else {
                e.state = if e.state.has_mem() {
                    QpState::AttachedMem
                } else {
                    QpState::AttachedNoMem
                };
            }
            if wakeup.is_some() {
                e.wakeup = wakeup;
            }
            (e.handle, e.create_id, e.flags.bits(), swap)
        };
        context.add_qp_handle(handle);
        debug!("queue pair {:?} attached by context {}", handle, cid);
        self.fire_peer_event(EventKind::QpPeerAttach, handle, cid, peer_cid, event_flags);
        Ok(swap)
    }

    /// Supplies backing memory after the fact (legacy VMX compatibility
    /// path). Only valid from a `_NO_MEM` state and only for an endpoint of
    /// the pair. Completing an attach this way fires the peer-attach event.
    pub fn set_page_store(
        &self,
        handle: VmciHandle,
        store: PageStore,
        context: &Arc<Context>,
    ) -> Result<()> {
        let entry = self.find(handle).ok_or(VmciError::NotFound)?;
        let cid = context.cid();
        let completed_attach = {
            let mut e = entry.lock();
            if cid != e.create_id && cid != e.attach_id {
                return Err(VmciError::QueuePairNotAttached);
            }
            if e.state != QpState::CreatedNoMem && e.state != QpState::AttachedNoMem {
                return Err(VmciError::Unavailable);
            }
            e.page_store = Some(store);
            e.page_store_owner = Some(cid);
            e.produce_q.map();
            e.consume_q.map();
            e.state = e.state.with_mem();
            e.state == QpState::AttachedMem
        };
        if completed_attach {
            let (peer_cid, flags) = {
                let e = entry.lock();
                (
                    if cid == e.create_id { e.attach_id } else { e.create_id },
                    e.flags.bits(),
                )
            };
            self.fire_peer_event(EventKind::QpPeerAttach, handle, cid, peer_cid, flags);
        }
        Ok(())
    }

    /// Detaches `context` from the pair. The first of two detaches releases
    /// the detacher's memory registration (if it owned one), notifies the
    /// peer, and parks the pair in a `SHUTDOWN_*` state; the second frees
    /// everything.
    pub fn detach(&self, handle: VmciHandle, context: &Arc<Context>) -> Result<()> {
        let entry = self.find(handle).ok_or(VmciError::NotFound)?;
        let cid = context.cid();
        let mut peer_event = None;
        let gone = {
            let mut e = entry.lock();
            if cid != e.create_id && cid != e.attach_id {
                return Err(VmciError::QueuePairNotAttached);
            }
            assert!(e.refs > 0, "detach of a queue pair with zero refcount");
            e.refs -= 1;
            // Retire the detacher's id slot so a second call from the same
            // context is rejected (local pairs burn the attach slot first).
            if cid == e.attach_id {
                e.attach_id = INVALID_ID;
            } else {
                e.create_id = INVALID_ID;
            }
            if e.refs > 0 {
                if e.page_store_owner == Some(cid) && e.state.has_mem() {
                    e.produce_q.unmap();
                    e.consume_q.unmap();
                    e.page_store = None;
                    e.page_store_owner = None;
                    e.state = QpState::ShutdownNoMem;
                } else {
                    e.state = if e.state.has_mem() {
                        QpState::ShutdownMem
                    } else {
                        QpState::ShutdownNoMem
                    };
                }
                let peer_cid = if e.create_id != INVALID_ID {
                    e.create_id
                } else {
                    e.attach_id
                };
                peer_event = Some((peer_cid, e.flags.bits()));
                false
            } else {
                e.state = QpState::Gone;
                true
            }
        };
        context.remove_qp_handle(handle);
        if gone {
            self.entries.lock().remove(&handle);
            debug!("queue pair {:?} freed", handle);
        }
        if let Some((peer_cid, flags)) = peer_event {
            self.fire_peer_event(EventKind::QpPeerDetach, handle, cid, peer_cid, flags);
        }
        Ok(())
    }

    /// Restores backing memory after a quiesce: reallocates the mapping,
    /// keeps the snapshotted ring headers, replays the wakeup callback so
    /// blocked producers and consumers resume.
    pub fn map(&self, handle: VmciHandle, context: &Arc<Context>) -> Result<()> {
        let entry = self.find(handle).ok_or(VmciError::NotFound)?;
        let cid = context.cid();
        let wakeup = {
            let mut e = entry.lock();
            if cid != e.create_id && cid != e.attach_id {
                return Err(VmciError::QueuePairNotAttached);
            }
            if e.state.has_mem() || e.state == QpState::Gone || e.state == QpState::New {
                return Err(VmciError::Unavailable);
            }
            // Remapping re-registers the stored page store; a pair that never
            // had backing memory has nothing to restore.
            if e.page_store.is_none() && !e.flags.contains(QueuePairFlags::LOCAL) {
                return Err(VmciError::Unavailable);
            }
            e.produce_q.map();
            e.consume_q.map();
            e.state = e.state.with_mem();
            e.wakeup.clone()
        };
        // Run the callback with the entry unlocked; it may call back in.
        if let Some(wakeup) = wakeup {
            wakeup();
        }
        let payload = EventPayloadQueuePair {
            handle,
            peer_id: cid,
            flags: 0,
        };
        if let Err(e) = self.events.publish(EventKind::QpResumed, payload.as_bytes()) {
            warn!("queue pair resumed publication for {:?}: {}", handle, e);
        }
        Ok(())
    }

    /// Releases backing memory for a quiesce, snapshotting ring headers
    /// first so positions survive until `map`.
    pub fn unmap(&self, handle: VmciHandle, context: &Arc<Context>) -> Result<()> {
        let entry = self.find(handle).ok_or(VmciError::NotFound)?;
        let cid = context.cid();
        let mut e = entry.lock();
        if cid != e.create_id && cid != e.attach_id {
            return Err(VmciError::QueuePairNotAttached);
        }
        if !e.state.has_mem() {
            return Err(VmciError::Unavailable);
        }
        e.produce_q.unmap();
        e.consume_q.unmap();
        e.state = e.state.without_mem();
        Ok(())
    }

    /// Current state of a pair; diagnostics and tests.
    pub fn state_of(&self, handle: VmciHandle) -> Option<QpState> {
        self.find(handle).map(|e| e.lock().state)
    }

    /// Guest-perspective produce/consume sizes of a pair.
    pub fn sizes_of(&self, handle: VmciHandle) -> Option<(u64, u64)> {
        self.find(handle)
            .map(|e| {
                let e = e.lock();
                (e.produce_size, e.consume_size)
            })
    }

    /// Sends the peer event both ways host listeners see: on the event bus,
    /// and as an event datagram on the peer context's queue when the peer
    /// is a guest.
    fn fire_peer_event(
        &self,
        kind: EventKind,
        handle: VmciHandle,
        actor_cid: VmciId,
        peer_cid: VmciId,
        flags: u32,
    ) {
        let payload = EventPayloadQueuePair {
            handle,
            peer_id: actor_cid,
            flags,
        };
        if let Err(e) = self.events.publish(kind, payload.as_bytes()) {
            warn!("{:?} publication for {:?}: {}", kind, handle, e);
        }
        if !is_guest_cid(peer_cid) {
            return;
        }
        let mut bytes = Vec::with_capacity(
            std::mem::size_of::<vmci_protocol::EventHeader>()
                + std::mem::size_of::<EventPayloadQueuePair>(),
        );
        bytes.extend_from_slice(
            vmci_protocol::EventHeader {
                event: kind as u32,
                _pad: 0,
            }
            .as_bytes(),
        );
        bytes.extend_from_slice(payload.as_bytes());
        let dg = match Datagram::new(
            VmciHandle::new(peer_cid, EVENT_HANDLER_RESOURCE_ID),
            VmciHandle::new(HOST_CONTEXT_ID, EVENT_HANDLER_RESOURCE_ID),
            bytes,
        ) {
            Ok(dg) => dg,
            Err(e) => {
                warn!("{:?} datagram for {:?}: {}", kind, handle, e);
                return;
            }
        };
        if let Err(e) = self.contexts.enqueue_datagram(peer_cid, dg, true) {
            warn!("{:?} delivery to context {}: {}", kind, peer_cid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use crate::event::EventDelivery;
    use crate::worker::WorkQueue;

    use super::*;

    struct Fixture {
        contexts: Arc<ContextRegistry>,
        events: Arc<EventBus>,
        broker: Arc<QueuePairBroker>,
    }

    fn fixture() -> Fixture {
        let worker = Arc::new(WorkQueue::new("qp-test", 2, 64));
        let events = Arc::new(EventBus::new(worker));
        let contexts = Arc::new(ContextRegistry::new(events.clone()));
        let broker = Arc::new(QueuePairBroker::new(contexts.clone(), events.clone()));
        Fixture {
            contexts,
            events,
            broker,
        }
    }

    fn store() -> PageStore {
        PageStore {
            produce_uva: 0x1000,
            consume_uva: 0x2000,
        }
    }

    #[test]
    fn create_attach_detach_lifecycle() {
        let f = fixture();
        let guest = f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        let host = f
            .contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let handle = VmciHandle::new(20, 7);

        let swap = f
            .broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::empty(),
                1024,
                512,
                Some(store()),
                &guest,
                None,
            )
            .unwrap();
        assert!(!swap);
        assert_eq!(f.broker.state_of(handle), Some(QpState::CreatedMem));
        assert_eq!(f.broker.sizes_of(handle), Some((1024, 512)));

        // The host sees the rings swapped; its sizes are converted back to
        // the guest perspective before comparison.
        let swap = f
            .broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::empty(),
                512,
                1024,
                None,
                &host,
                None,
            )
            .unwrap();
        assert!(swap);
        assert_eq!(f.broker.state_of(handle), Some(QpState::AttachedMem));
        // The creating guest got a peer-attach event datagram.
        assert_eq!(guest.pending_datagrams(), 1);

        // The host does not own the page store, so its detach keeps the
        // memory around for the remaining guest endpoint.
        f.broker.detach(handle, &host).unwrap();
        assert_eq!(f.broker.state_of(handle), Some(QpState::ShutdownMem));
        // A second detach from the same context is rejected.
        assert_eq!(
            f.broker.detach(handle, &host).unwrap_err(),
            VmciError::QueuePairNotAttached
        );
        f.broker.detach(handle, &guest).unwrap();
        assert_eq!(f.broker.state_of(handle), None);
        assert_eq!(
            f.broker.detach(handle, &guest).unwrap_err(),
            VmciError::NotFound
        );
    }

    #[test]
    fn attach_size_mismatch() {
        let f = fixture();
        let guest = f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        let host = f
            .contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let handle = VmciHandle::new(20, 7);
        f.broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::empty(),
                1024,
                512,
                None,
                &guest,
                None,
            )
            .unwrap();
        // Unswapped host sizes no longer line up after perspective
        // conversion.
        assert_eq!(
            f.broker
                .alloc(
                    handle,
                    INVALID_ID,
                    QueuePairFlags::empty(),
                    1024,
                    512,
                    None,
                    &host,
                    None,
                )
                .unwrap_err(),
            VmciError::QueuePairMismatch
        );
    }

    #[test]
    fn attach_rejects_second_page_store() {
        let f = fixture();
        let guest = f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        let host = f
            .contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let handle = VmciHandle::new(20, 7);
        f.broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::empty(),
                64,
                64,
                Some(store()),
                &guest,
                None,
            )
            .unwrap();
        assert_eq!(
            f.broker
                .alloc(
                    handle,
                    INVALID_ID,
                    QueuePairFlags::empty(),
                    64,
                    64,
                    Some(store()),
                    &host,
                    None,
                )
                .unwrap_err(),
            VmciError::Unavailable
        );
        // The failed attempt burned nothing: the same context can still
        // attach without a store, and the creator keeps ownership.
        f.broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::empty(),
                64,
                64,
                None,
                &host,
                None,
            )
            .unwrap();
        assert_eq!(f.broker.state_of(handle), Some(QpState::AttachedMem));
        let entry = f.broker.find(handle).unwrap();
        assert_eq!(entry.lock().page_store_owner, Some(20));
    }

    #[test]
    fn attach_only_requires_existing_pair() {
        let f = fixture();
        let host = f
            .contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let handle = VmciHandle::new(HOST_CONTEXT_ID, 7);
        assert_eq!(
            f.broker
                .alloc(
                    handle,
                    INVALID_ID,
                    QueuePairFlags::ATTACH_ONLY,
                    64,
                    64,
                    None,
                    &host,
                    None,
                )
                .unwrap_err(),
            VmciError::NotFound
        );
    }

    #[test]
    fn guest_to_guest_is_unreachable() {
        let f = fixture();
        let guest = f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        let handle = VmciHandle::new(20, 7);
        assert_eq!(
            f.broker
                .alloc(
                    handle,
                    21,
                    QueuePairFlags::empty(),
                    64,
                    64,
                    None,
                    &guest,
                    None,
                )
                .unwrap_err(),
            VmciError::DstUnreachable
        );
    }

    #[test]
    fn restricted_creator_requires_trusted_attacher() {
        let f = fixture();
        let guest = f.contexts.init_context(20, PrivFlags::RESTRICTED).unwrap();
        let host = f
            .contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::empty())
            .unwrap();
        let handle = VmciHandle::new(20, 7);
        f.broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::empty(),
                64,
                64,
                None,
                &guest,
                None,
            )
            .unwrap();
        assert_eq!(
            f.broker
                .alloc(
                    handle,
                    INVALID_ID,
                    QueuePairFlags::empty(),
                    64,
                    64,
                    None,
                    &host,
                    None,
                )
                .unwrap_err(),
            VmciError::NoAccess
        );
    }

    #[test]
    fn late_page_store_completes_attach() {
        let f = fixture();
        let guest = f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        let host = f
            .contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let handle = VmciHandle::new(20, 7);
        let attaches = Arc::new(AtomicUsize::new(0));
        let a = attaches.clone();
        f.events
            .subscribe(
                EventKind::QpPeerAttach,
                EventDelivery::Immediate,
                Box::new(move |_, _| {
                    a.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        f.broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::empty(),
                64,
                64,
                None,
                &guest,
                None,
            )
            .unwrap();
        f.broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::empty(),
                64,
                64,
                None,
                &host,
                None,
            )
            .unwrap();
        assert_eq!(f.broker.state_of(handle), Some(QpState::AttachedNoMem));
        assert_eq!(attaches.load(Ordering::SeqCst), 1);

        // Memory arriving later flips to AttachedMem and re-announces.
        f.broker.set_page_store(handle, store(), &host).unwrap();
        assert_eq!(f.broker.state_of(handle), Some(QpState::AttachedMem));
        assert_eq!(attaches.load(Ordering::SeqCst), 2);
        assert_eq!(
            f.broker.set_page_store(handle, store(), &host).unwrap_err(),
            VmciError::Unavailable
        );
    }

    #[test]
    fn unmap_and_map_preserve_attachment() {
        let f = fixture();
        let guest = f.contexts.init_context(20, PrivFlags::empty()).unwrap();
        let host = f
            .contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let handle = VmciHandle::new(20, 7);
        let woken = Arc::new(AtomicUsize::new(0));
        let w = woken.clone();
        f.broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::empty(),
                256,
                256,
                Some(store()),
                &guest,
                Some(Arc::new(move || {
                    w.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        f.broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::empty(),
                256,
                256,
                None,
                &host,
                None,
            )
            .unwrap();

        let resumed = Arc::new(AtomicUsize::new(0));
        let r = resumed.clone();
        f.events
            .subscribe(
                EventKind::QpResumed,
                EventDelivery::Immediate,
                Box::new(move |_, _| {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        // Ring positions written into the backing memory must survive the
        // unmap/map round trip.
        let positions = QueueHeader {
            producer_tail: 7,
            consumer_head: 3,
        };
        {
            let entry = f.broker.find(handle).unwrap();
            let mut e = entry.lock();
            let mem = e.produce_q.mem.as_mut().unwrap();
            mem[..std::mem::size_of::<QueueHeader>()].copy_from_slice(positions.as_bytes());
        }

        f.broker.unmap(handle, &guest).unwrap();
        assert_eq!(f.broker.state_of(handle), Some(QpState::AttachedNoMem));
        assert_eq!(
            f.broker.unmap(handle, &guest).unwrap_err(),
            VmciError::Unavailable
        );
        f.broker.map(handle, &guest).unwrap();
        assert_eq!(f.broker.state_of(handle), Some(QpState::AttachedMem));
        assert_eq!(f.broker.sizes_of(handle), Some((256, 256)));
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
        {
            let entry = f.broker.find(handle).unwrap();
            let e = entry.lock();
            let mem = e.produce_q.mem.as_ref().unwrap();
            let (restored, _) = QueueHeader::read_from_prefix(mem).unwrap();
            assert_eq!(restored, positions);
        }
    }

    #[test]
    fn local_pair_swaps_on_attach() {
        let f = fixture();
        let host = f
            .contexts
            .init_context(HOST_CONTEXT_ID, PrivFlags::TRUSTED)
            .unwrap();
        let handle = VmciHandle::new(HOST_CONTEXT_ID, 9);
        let swap = f
            .broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::LOCAL,
                128,
                64,
                None,
                &host,
                None,
            )
            .unwrap();
        // Local pairs are backed immediately and the creator keeps its
        // orientation.
        assert!(!swap);
        assert_eq!(f.broker.state_of(handle), Some(QpState::CreatedMem));
        let swap = f
            .broker
            .alloc(
                handle,
                INVALID_ID,
                QueuePairFlags::LOCAL,
                64,
                128,
                None,
                &host,
                None,
            )
            .unwrap();
        assert!(swap);
        assert_eq!(f.broker.state_of(handle), Some(QpState::AttachedMem));
    }
}
