// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed resource registry over the handle table.
//!
//! Datagram endpoints and doorbells register here and are addressed by
//! handle from then on. The registry owns the "free hook" discipline: when
//! the last reference to an entry is dropped, the object's `released` hook
//! runs exactly once, after the entry is unlinked and with no table lock
//! held, so teardown waiters can be signaled without deadlocking against
//! the registry.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use vmci_protocol::VmciHandle;
use vmci_protocol::INVALID_ID;
use vmci_protocol::RESERVED_RESOURCE_ID_MAX;

use crate::datagram::DatagramEndpoint;
use crate::doorbell::DoorbellEntry;
use crate::error::Result;
use crate::error::VmciError;
use crate::handle_table::HandleTable;
use crate::handle_table::Released;
use crate::handle_table::TableEntry;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    Api,
    Group,
    Datagram,
    Doorbell,
}

/// A registered object. `Api` and `Group` are legacy kinds kept for
/// compatibility with older callers; they carry no payload.
#[derive(Clone)]
pub enum ResourceObject {
    Api,
    Group,
    Datagram(Arc<DatagramEndpoint>),
    Doorbell(Arc<DoorbellEntry>),
}

impl ResourceObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceObject::Api => ResourceKind::Api,
            ResourceObject::Group => ResourceKind::Group,
            ResourceObject::Datagram(_) => ResourceKind::Datagram,
            ResourceObject::Doorbell(_) => ResourceKind::Doorbell,
        }
    }

    fn released(&self) {
        match self {
            ResourceObject::Api | ResourceObject::Group => {}
            ResourceObject::Datagram(d) => d.released(),
            ResourceObject::Doorbell(d) => d.released(),
        }
    }

    pub fn as_datagram(&self) -> Option<&Arc<DatagramEndpoint>> {
        match self {
            ResourceObject::Datagram(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_doorbell(&self) -> Option<&Arc<DoorbellEntry>> {
        match self {
            ResourceObject::Doorbell(d) => Some(d),
            _ => None,
        }
    }
}

pub type ResourceEntry = Arc<TableEntry<ResourceObject>>;

pub struct ResourceRegistry {
    table: HandleTable<ResourceObject>,
    next_id: AtomicU32,
}

impl ResourceRegistry {
    pub fn new(bucket_count: usize) -> ResourceRegistry {
        ResourceRegistry {
            table: HandleTable::new(bucket_count),
            next_id: AtomicU32::new(RESERVED_RESOURCE_ID_MAX + 1),
        }
    }

    /// Registers `object` under `handle`. A resource id of `INVALID_ID`
    /// asks the registry to assign a free id above the reserved range; the
    /// chosen handle is returned.
    pub fn add(&self, handle: VmciHandle, object: ResourceObject) -> Result<ResourceEntry> {
        if handle.resource != INVALID_ID {
            return self.table.add(handle, object);
        }
        // Assigned ids race with explicit registrations, so retry on
        // collision rather than reserving.
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if id == INVALID_ID || id <= RESERVED_RESOURCE_ID_MAX {
                self.next_id
                    .store(RESERVED_RESOURCE_ID_MAX + 1, Ordering::SeqCst);
                continue;
            }
            match self
                .table
                .add(VmciHandle::new(handle.context, id), object.clone())
            {
                Ok(entry) => return Ok(entry),
                Err(VmciError::AlreadyExists) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Refcounted lookup filtered by kind; a handle bound to a different
    /// kind reports `NotFound` rather than leaking the entry.
    pub fn get(&self, handle: VmciHandle, kind: ResourceKind) -> Result<ResourceEntry> {
        let entry = self.table.get(handle).ok_or(VmciError::NotFound)?;
        if entry.value().kind() != kind {
            self.release(&entry);
            return Err(VmciError::NotFound);
        }
        Ok(entry)
    }

    pub fn hold(&self, entry: &ResourceEntry) {
        self.table.hold(entry);
    }

    /// Drops a reference; on the last one, runs the object's release hook
    /// outside the table lock. Returns whether the entry died.
    pub fn release(&self, entry: &ResourceEntry) -> bool {
        match self.table.release(entry) {
            Released::Alive => false,
            Released::Dead => {
                entry.value().released();
                true
            }
        }
    }

    /// Unlinks `handle` so new lookups fail; outstanding references keep the
    /// object alive until released.
    pub fn remove(&self, handle: VmciHandle) -> Result<()> {
        self.table.remove(handle)
    }

    /// Gates all further registration with `Unavailable`; used at module
    /// unload so no new resource can race teardown.
    pub fn shutdown(&self) {
        self.table.shutdown();
    }
}
