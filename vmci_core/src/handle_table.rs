// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Refcounted handle-to-object table underlying the resource registry.
//!
//! Entries are bucketed by resource id and matched with the wildcard rule: a
//! lookup context of `INVALID_ID` matches any stored context, and a stored
//! context of `INVALID_ID` matches any lookup. This lets a resource be
//! claimed before its owning context is finalized.
//!
//! Reference counts are mutated only while the table lock is held, so a
//! concurrent lookup can never observe a linked entry with a zero refcount.
//! An entry whose count reaches zero is unlinked (if it still was linked)
//! before `release` reports it dead; the caller then runs any free hook with
//! no table lock held.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use vmci_protocol::VmciHandle;
use vmci_protocol::INVALID_ID;

use crate::error::Result;
use crate::error::VmciError;

/// Outcome of dropping a reference.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Released {
    /// Other references remain.
    Alive,
    /// The count reached zero and the entry has been unlinked; the caller
    /// owns the teardown.
    Dead,
}

pub struct TableEntry<T> {
    handle: VmciHandle,
    // Guarded by the owning table's lock; atomic only so the struct is Sync.
    refs: AtomicU64,
    linked: AtomicU64,
    value: T,
}

impl<T> TableEntry<T> {
    pub fn handle(&self) -> VmciHandle {
        self.handle
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

// Manual impl: the payload need not be Debug (endpoints carry callbacks).
impl<T> std::fmt::Debug for TableEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TableEntry")
            .field("handle", &self.handle)
            .field("refs", &self.refs)
            .field("linked", &self.linked)
            .finish_non_exhaustive()
    }
}

struct Buckets<T> {
    buckets: Vec<Vec<Arc<TableEntry<T>>>>,
    can_create: bool,
}

pub struct HandleTable<T> {
    inner: Mutex<Buckets<T>>,
}

fn handles_match(stored: VmciHandle, lookup: VmciHandle) -> bool {
    stored.resource == lookup.resource
        && (stored.context == lookup.context
            || stored.context == INVALID_ID
            || lookup.context == INVALID_ID)
}

impl<T> HandleTable<T> {
    pub fn new(bucket_count: usize) -> HandleTable<T> {
        assert!(bucket_count > 0);
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, Vec::new);
        HandleTable {
            inner: Mutex::new(Buckets {
                buckets,
                can_create: true,
            }),
        }
    }

    fn bucket_of(&self, inner: &Buckets<T>, resource: u32) -> usize {
        resource as usize % inner.buckets.len()
    }

    /// Inserts a new entry holding one reference for the creator.
    ///
    /// Fails with `AlreadyExists` if any stored entry matches `handle` under
    /// the wildcard rule, and with `Unavailable` once the table has been
    /// shut down.
    pub fn add(&self, handle: VmciHandle, value: T) -> Result<Arc<TableEntry<T>>> {
        if handle.resource == INVALID_ID {
            return Err(VmciError::InvalidArgs);
        }
        let mut inner = self.inner.lock();
        if !inner.can_create {
            return Err(VmciError::Unavailable);
        }
        let idx = self.bucket_of(&inner, handle.resource);
        if inner.buckets[idx]
            .iter()
            .any(|e| handles_match(e.handle, handle))
        {
            return Err(VmciError::AlreadyExists);
        }
        let entry = Arc::new(TableEntry {
            handle,
            refs: AtomicU64::new(1),
            linked: AtomicU64::new(1),
            value,
        });
        // Most recently added first, so fresh registrations win lookups.
        inner.buckets[idx].insert(0, entry.clone());
        Ok(entry)
    }

    /// Looks up `handle` (wildcard-aware) and takes a reference on the match.
    pub fn get(&self, handle: VmciHandle) -> Option<Arc<TableEntry<T>>> {
        let inner = self.inner.lock();
        let idx = self.bucket_of(&inner, handle.resource);
        let entry = inner.buckets[idx]
            .iter()
            .find(|e| handles_match(e.handle, handle))?;
        entry.refs.fetch_add(1, Ordering::SeqCst);
        Some(entry.clone())
    }

    /// Takes an additional reference on an entry already in hand.
    pub fn hold(&self, entry: &Arc<TableEntry<T>>) {
        let _inner = self.inner.lock();
        let prev = entry.refs.fetch_add(1, Ordering::SeqCst);
        assert!(prev > 0, "hold of a dead table entry");
    }

    /// Unlinks the entry for `handle` so no new lookups succeed. Existing
    /// references stay valid until released.
    pub fn remove(&self, handle: VmciHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = self.bucket_of(&inner, handle.resource);
        let pos = inner.buckets[idx]
            .iter()
            .position(|e| handles_match(e.handle, handle))
            .ok_or(VmciError::NotFound)?;
        let entry = inner.buckets[idx].remove(pos);
        entry.linked.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Drops one reference. On the last release the entry is unlinked (if
    /// `remove` had not already run) and `Released::Dead` is returned with
    /// the table lock no longer held.
    pub fn release(&self, entry: &Arc<TableEntry<T>>) -> Released {
        let mut inner = self.inner.lock();
        let prev = entry.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "release of a table entry with zero refcount");
        if prev > 1 {
            return Released::Alive;
        }
        if entry.linked.swap(0, Ordering::SeqCst) == 1 {
            let idx = self.bucket_of(&inner, entry.handle.resource);
            inner.buckets[idx].retain(|e| !Arc::ptr_eq(e, entry));
        }
        Released::Dead
    }

    /// Stops all future `add` calls; in-flight entries are unaffected.
    pub fn shutdown(&self) {
        self.inner.lock().can_create = false;
    }
}
