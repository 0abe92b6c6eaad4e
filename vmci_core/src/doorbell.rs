// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Doorbells: payload-free wake endpoints.
//!
//! A host client creates a doorbell with a callback and hands the handle to
//! its peer; ringing it invokes the callback, inline or on the worker pool.
//! A guest links a doorbell into its own context instead; ringing that one
//! records it in the context's pending set and raises the work-pending
//! signal, the same path a queued datagram takes.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;
use vmci_protocol::PrivFlags;
use vmci_protocol::VmciHandle;
use vmci_protocol::VmciId;

use crate::context::ContextRegistry;
use crate::error::Result;
use crate::error::VmciError;
use crate::resource::ResourceKind;
use crate::resource::ResourceObject;
use crate::resource::ResourceRegistry;
use crate::worker::WorkQueue;

pub type DoorbellNotifyFn = Box<dyn Fn() + Send + Sync>;

/// A host-side doorbell registered in the resource registry.
///
/// Same teardown discipline as a datagram endpoint: destroy unlinks the
/// entry, then waits on the release latch until in-flight rings drain, so
/// the callback never outlives its owner.
pub struct DoorbellEntry {
    handle: AtomicU64,
    priv_flags: PrivFlags,
    run_delayed: bool,
    notify: DoorbellNotifyFn,
    destroyed: Mutex<bool>,
    destroy_event: Condvar,
}

impl DoorbellEntry {
    pub fn new(priv_flags: PrivFlags, run_delayed: bool, notify: DoorbellNotifyFn) -> DoorbellEntry {
        DoorbellEntry {
            handle: AtomicU64::new(vmci_protocol::INVALID_HANDLE.to_u64()),
            priv_flags,
            run_delayed,
            notify,
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

    fn set_handle(&self, handle: VmciHandle) {
        self.handle.store(handle.to_u64(), Ordering::SeqCst);
    }

    fn ring(&self) {
        (self.notify)()
    }

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

pub struct DoorbellHub {
    resources: Arc<ResourceRegistry>,
    contexts: Arc<ContextRegistry>,
    worker: Arc<WorkQueue>,
}

impl DoorbellHub {
    pub fn new(
        resources: Arc<ResourceRegistry>,
        contexts: Arc<ContextRegistry>,
        worker: Arc<WorkQueue>,
    ) -> DoorbellHub {
        DoorbellHub {
            resources,
            contexts,
            worker,
        }
    }

    /// Registers a host doorbell. A resource id of `INVALID_ID` asks for a
    /// free id; the final handle is returned.
    pub fn create(
        &self,
        handle: VmciHandle,
        priv_flags: PrivFlags,
        run_delayed: bool,
        notify: DoorbellNotifyFn,
    ) -> Result<VmciHandle> {
        let entry_obj = Arc::new(DoorbellEntry::new(priv_flags, run_delayed, notify));
        let entry = self
            .resources
            .add(handle, ResourceObject::Doorbell(entry_obj.clone()))?;
        entry_obj.set_handle(entry.handle());
        Ok(entry.handle())
    }

    /// Unlinks the doorbell and blocks until in-flight rings drain.
    pub fn destroy(&self, handle: VmciHandle) -> Result<()> {
        let entry = self.resources.get(handle, ResourceKind::Doorbell)?;
        let doorbell = entry
            .value()
            .as_doorbell()
            .expect("kind-filtered lookup returned a non-doorbell resource")
            .clone();
        if let Err(e) = self.resources.remove(handle) {
            self.resources.release(&entry);
            return Err(e);
        }
        self.resources.release(&entry);
        self.resources.release(&entry);
        doorbell.wait_released();
        Ok(())
    }

    /// Links `handle` as a guest-context doorbell on `cid`. The handle must
    /// name the owning context.
    pub fn link(&self, cid: VmciId, handle: VmciHandle) -> Result<()> {
        if handle.context != cid {
            return Err(VmciError::InvalidArgs);
        }
        let ctx = self.contexts.get(cid).ok_or(VmciError::NotFound)?;
        if ctx.has_doorbell(handle) {
            self.contexts.release(&ctx);
            return Err(VmciError::DuplicateEntry);
        }
        ctx.add_doorbell(handle);
        self.contexts.release(&ctx);
        Ok(())
    }

    /// Unlinks a guest-context doorbell.
    pub fn unlink(&self, cid: VmciId, handle: VmciHandle) -> Result<()> {
        let ctx = self.contexts.get(cid).ok_or(VmciError::NotFound)?;
        if !ctx.has_doorbell(handle) {
            self.contexts.release(&ctx);
            return Err(VmciError::NotFound);
        }
        ctx.remove_doorbell(handle);
        self.contexts.release(&ctx);
        Ok(())
    }

    /// Rings the doorbell named by `handle` on behalf of `caller_cid`.
    /// Host-registered doorbells win over guest-context links, mirroring
    /// datagram destination resolution.
    pub fn notify(&self, caller_cid: VmciId, handle: VmciHandle) -> Result<()> {
        let src_flags = {
            let caller = self.contexts.get(caller_cid).ok_or(VmciError::NotFound)?;
            let flags = caller.priv_flags();
            self.contexts.release(&caller);
            flags
        };
        if let Ok(entry) = self.resources.get(handle, ResourceKind::Doorbell) {
            return self.ring_host_doorbell(src_flags, entry);
        }
        let ctx = self
            .contexts
            .get(handle.context)
            .ok_or(VmciError::NotFound)?;
        if !src_flags.can_interact(ctx.priv_flags()) {
            self.contexts.release(&ctx);
            return Err(VmciError::NoAccess);
        }
        if !ctx.has_doorbell(handle) {
            self.contexts.release(&ctx);
            return Err(VmciError::NotFound);
        }
        ctx.post_doorbell(handle);
        self.contexts.release(&ctx);
        Ok(())
    }

    fn ring_host_doorbell(
        &self,
        src_flags: PrivFlags,
        entry: crate::resource::ResourceEntry,
    ) -> Result<()> {
        let doorbell = entry
            .value()
            .as_doorbell()
            .expect("kind-filtered lookup returned a non-doorbell resource")
            .clone();
        if !src_flags.can_interact(doorbell.priv_flags()) {
            self.resources.release(&entry);
            return Err(VmciError::NoAccess);
        }
        if !doorbell.run_delayed {
            doorbell.ring();
            self.resources.release(&entry);
            return Ok(());
        }
        let ring = DoorbellRing {
            resources: self.resources.clone(),
            entry,
            doorbell,
        };
        self.worker.submit(move || ring.run())?;
        Ok(())
    }
}

/// One deferred ring. Dropping the guard (run or unrun) returns the
/// registry reference.
struct DoorbellRing {
    resources: Arc<ResourceRegistry>,
    entry: crate::resource::ResourceEntry,
    doorbell: Arc<DoorbellEntry>,
}

impl DoorbellRing {
    fn run(&self) {
        self.doorbell.ring();
    }
}

impl Drop for DoorbellRing {
    fn drop(&mut self) {
        self.resources.release(&self.entry);
    }
}
