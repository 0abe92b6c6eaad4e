// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Routing decisions for outbound datagrams.

use vmci_protocol::VmciHandle;
use vmci_protocol::HOST_CONTEXT_ID;
use vmci_protocol::HYPERVISOR_CONTEXT_ID;
use vmci_protocol::INVALID_ID;
use vmci_protocol::WELL_KNOWN_CONTEXT_ID;

use crate::datagram::Datagram;
use crate::error::Result;
use crate::error::VmciError;

/// Where a datagram leaves the router.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Route {
    /// Deliver within this host: a registered endpoint, the event handler,
    /// or a guest context's pending queue.
    AsHost,
    /// Hand off to the guest-side transport (hypervisor-bound traffic).
    AsGuest,
}

/// Trait implemented by the guest transport collaborator. The router hands
/// it every datagram routed `AsGuest`; it returns the number of bytes it
/// accepted.
pub trait GuestTransport: Send + Sync {
    fn deliver(&self, dg: &Datagram) -> Result<usize>;
}

/// True for dynamically allocated VM context ids.
pub fn is_guest_cid(cid: u32) -> bool {
    cid != HYPERVISOR_CONTEXT_ID
        && cid != WELL_KNOWN_CONTEXT_ID
        && cid != HOST_CONTEXT_ID
        && cid != INVALID_ID
}

/// Computes the route for `(src, dst, from_guest)`.
///
/// Hypervisor-bound traffic is only routable for host-originated sends; a
/// guest reaches the hypervisor over its own transport, never through the
/// host router. The legacy well-known context is no longer routable.
pub fn route(src: &VmciHandle, dst: &VmciHandle, from_guest: bool) -> Result<Route> {
    if dst.context == INVALID_ID || dst.resource == INVALID_ID {
        return Err(VmciError::InvalidArgs);
    }
    if dst.context == HYPERVISOR_CONTEXT_ID {
        if src.context == HYPERVISOR_CONTEXT_ID {
            return Err(VmciError::InvalidArgs);
        }
        if from_guest {
            return Err(VmciError::DstUnreachable);
        }
        return Ok(Route::AsGuest);
    }
    if dst.context == WELL_KNOWN_CONTEXT_ID {
        return Err(VmciError::DstUnreachable);
    }
    Ok(Route::AsHost)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(context: u32, resource: u32) -> VmciHandle {
        VmciHandle::new(context, resource)
    }

    #[test]
    fn host_and_guest_contexts_route_as_host() {
        assert_eq!(
            route(&h(10, 1), &h(HOST_CONTEXT_ID, 99), true).unwrap(),
            Route::AsHost
        );
        assert_eq!(
            route(&h(HOST_CONTEXT_ID, 1), &h(11, 99), false).unwrap(),
            Route::AsHost
        );
    }

    #[test]
    fn hypervisor_bound() {
        assert_eq!(
            route(&h(HOST_CONTEXT_ID, 1), &h(HYPERVISOR_CONTEXT_ID, 5), false).unwrap(),
            Route::AsGuest
        );
        assert_eq!(
            route(&h(10, 1), &h(HYPERVISOR_CONTEXT_ID, 5), true).unwrap_err(),
            VmciError::DstUnreachable
        );
    }

    #[test]
    fn invalid_and_legacy_destinations() {
        assert_eq!(
            route(&h(10, 1), &h(INVALID_ID, 5), true).unwrap_err(),
            VmciError::InvalidArgs
        );
        assert_eq!(
            route(&h(10, 1), &h(10, INVALID_ID), true).unwrap_err(),
            VmciError::InvalidArgs
        );
        assert_eq!(
            route(&h(10, 1), &h(WELL_KNOWN_CONTEXT_ID, 5), true).unwrap_err(),
            VmciError::DstUnreachable
        );
    }
}
