// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Publish/subscribe bus for system events.
//!
//! Dispatch is two-phase: matching subscriptions are collected under the
//! single subscriber lock, then invoked with the lock released (immediate
//! subscribers) or handed a payload copy on the worker pool (delayed
//! subscribers). A callback is therefore free to call back into the engine,
//! including to unsubscribe itself.

use std::sync::Arc;

use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;
use vmci_protocol::EventHeader;
use vmci_protocol::EventKind;
use vmci_protocol::VmciHandle;
use vmci_protocol::EVENT_HANDLER_RESOURCE_ID;
use vmci_protocol::HOST_CONTEXT_ID;
use vmci_protocol::INVALID_ID;
use vmci_protocol::NUM_EVENT_KINDS;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::datagram::Datagram;
use crate::error::Result;
use crate::error::VmciError;
use crate::worker::WorkQueue;

/// A decoded event as seen by subscribers: the kind plus the payload bytes
/// following the event header.
#[derive(Clone, Debug)]
pub struct EventMsg {
    pub kind: EventKind,
    pub payload: Vec<u8>,
}

pub type EventCallback = Box<dyn Fn(u32, &EventMsg) + Send + Sync>;

/// How a subscriber wants its callback run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventDelivery {
    /// Called directly from `dispatch`, after the subscriber lock is
    /// released.
    Immediate,
    /// Scheduled on the worker pool with a copy of the payload.
    Delayed,
}

struct Subscription {
    id: u32,
    kind: EventKind,
    delivery: EventDelivery,
    callback: EventCallback,
    // In-flight accounting: one reference held by the subscriber list plus
    // one per invocation not yet finished. Unsubscribe waits for zero.
    refs: Mutex<u64>,
    drained: Condvar,
}

impl Subscription {
    fn get(&self) {
        let mut refs = self.refs.lock();
        assert!(*refs > 0, "get on a drained subscription");
        *refs += 1;
    }

    fn put(&self) {
        let mut refs = self.refs.lock();
        assert!(*refs > 0, "put on a drained subscription");
        *refs -= 1;
        if *refs == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut refs = self.refs.lock();
        while *refs > 0 {
            self.drained.wait(&mut refs);
        }
    }
}

struct SubscriberLists {
    lists: Vec<Vec<Arc<Subscription>>>,
    next_id: u32,
}

pub struct EventBus {
    inner: Mutex<SubscriberLists>,
    worker: Arc<WorkQueue>,
}

impl EventBus {
    pub fn new(worker: Arc<WorkQueue>) -> EventBus {
        let mut lists = Vec::with_capacity(NUM_EVENT_KINDS);
        lists.resize_with(NUM_EVENT_KINDS, Vec::new);
        EventBus {
            inner: Mutex::new(SubscriberLists { lists, next_id: 0 }),
            worker,
        }
    }

    /// Registers `callback` for `kind` and returns the subscription id.
    pub fn subscribe(
        &self,
        kind: EventKind,
        delivery: EventDelivery,
        callback: EventCallback,
    ) -> Result<u32> {
        let mut inner = self.inner.lock();
        let id = loop {
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            if id != INVALID_ID && !inner.lists.iter().flatten().any(|s| s.id == id) {
                break id;
            }
        };
        let sub = Arc::new(Subscription {
            id,
            kind,
            delivery,
            callback,
            refs: Mutex::new(1),
            drained: Condvar::new(),
        });
        inner.lists[kind as usize].push(sub);
        Ok(id)
    }

    /// Removes the subscription so it sees no further events, then blocks
    /// until any in-flight invocation has finished.
    pub fn unsubscribe(&self, id: u32) -> Result<()> {
        let sub = {
            let mut inner = self.inner.lock();
            let mut found = None;
            for list in inner.lists.iter_mut() {
                if let Some(pos) = list.iter().position(|s| s.id == id) {
                    found = Some(list.remove(pos));
                    break;
                }
            }
            found.ok_or(VmciError::NotFound)?
        };
        // Drop the list's reference; in-flight invocations hold their own.
        sub.put();
        sub.wait_drained();
        Ok(())
    }

    /// Decodes an event datagram and fans it out to subscribers. Returns the
    /// datagram's total size, whether or not anyone was subscribed.
    pub fn dispatch(&self, dg: &Datagram) -> Result<usize> {
        if dg.dst.resource != EVENT_HANDLER_RESOURCE_ID {
            return Err(VmciError::InvalidArgs);
        }
        let (header, payload) =
            EventHeader::read_from_prefix(&dg.payload).map_err(|_| VmciError::InvalidArgs)?;
        let kind = EventKind::n(header.event).ok_or(VmciError::EventUnknown)?;
        let msg = EventMsg {
            kind,
            payload: payload.to_vec(),
        };
        let mut immediate = Vec::new();
        {
            let inner = self.inner.lock();
            for sub in &inner.lists[kind as usize] {
                sub.get();
                match sub.delivery {
                    EventDelivery::Delayed => {
                        let job_sub = sub.clone();
                        let msg = msg.clone();
                        if let Err(e) = self.worker.submit(move || {
                            (job_sub.callback)(job_sub.id, &msg);
                            job_sub.put();
                        }) {
                            // Dropped unrun; balance the in-flight count.
                            warn!("dropping delayed event {:?}: {}", kind, e);
                            sub.put();
                        }
                    }
                    EventDelivery::Immediate => immediate.push(sub.clone()),
                }
            }
        }
        // Each immediate subscriber gets its own copy of the payload, with
        // no engine lock held.
        for sub in immediate {
            let copy = msg.clone();
            (sub.callback)(sub.id, &copy);
            sub.put();
        }
        Ok(dg.total_size())
    }

    /// Builds and dispatches an event datagram from the host event source.
    pub fn publish(&self, kind: EventKind, payload: &[u8]) -> Result<usize> {
        let handler = VmciHandle::new(HOST_CONTEXT_ID, EVENT_HANDLER_RESOURCE_ID);
        let header = EventHeader {
            event: kind as u32,
            _pad: 0,
        };
        let mut bytes = Vec::with_capacity(std::mem::size_of::<EventHeader>() + payload.len());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(payload);
        let dg = Datagram::new(handler, handler, bytes)?;
        self.dispatch(&dg)
    }
}
