// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire-level definitions for the VMCI messaging substrate.
//!
//! Everything in this crate is shared between the engine and its
//! collaborators (guest transport, host drivers, snapshot consumers): handle
//! encoding, reserved ids, size limits, privilege and queue-pair flags, the
//! datagram header, event payloads, and queue-pair ring headers. All wire
//! structs are `zerocopy` types so they round-trip byte-for-byte.

use bitflags::bitflags;
use enumn::N;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Identifier for a context or a resource within a context.
pub type VmciId = u32;

/// Reserved id meaning "no id" or, in a handle's context position, a
/// wildcard that matches any context during lookup.
pub const INVALID_ID: VmciId = 0xffff_ffff;

/// Context id of the hypervisor itself.
pub const HYPERVISOR_CONTEXT_ID: VmciId = 0;

/// Legacy well-known context id; never allocated to a VM.
pub const WELL_KNOWN_CONTEXT_ID: VmciId = 1;

/// Context id of the host endpoint.
pub const HOST_CONTEXT_ID: VmciId = 2;

/// Context ids below this value are reserved; dynamically allocated VM
/// context ids start here.
pub const RESERVED_CID_LIMIT: VmciId = 16;

/// Resource id on the host context that receives event datagrams.
pub const EVENT_HANDLER_RESOURCE_ID: VmciId = 0;

/// Resource ids at or below this value are reserved for fixed protocol
/// endpoints; dynamically allocated resource ids start just above.
pub const RESERVED_RESOURCE_ID_MAX: VmciId = 1023;

/// Size in bytes of the datagram wire header.
pub const DATAGRAM_HEADER_SIZE: usize = 24;

/// Largest datagram payload accepted by the router.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65536;

/// Absolute ceiling on a datagram including its header.
pub const MAX_DATAGRAM_SIZE: usize = MAX_DATAGRAM_PAYLOAD + DATAGRAM_HEADER_SIZE;

/// Byte cap on a context's pending datagram queue for ordinary traffic.
pub const MAX_DATAGRAM_QUEUE_SIZE: usize = 2 * MAX_DATAGRAM_SIZE;

/// Higher byte cap applied only to hypervisor-originated traffic, so host
/// events cannot be starved out by a guest flooding its own queue.
pub const MAX_HYPERVISOR_QUEUE_SIZE: usize = 4 * MAX_DATAGRAM_SIZE;

/// Addresses any object in the engine: a `(context, resource)` pair.
///
/// The 64-bit encoding places the context id in the high 32 bits and the
/// resource id in the low 32 bits.
#[repr(C)]
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, FromBytes, Immutable,
    IntoBytes, KnownLayout,
)]
pub struct VmciHandle {
    pub context: VmciId,
    pub resource: VmciId,
}

/// Handle value that refers to nothing.
pub const INVALID_HANDLE: VmciHandle = VmciHandle {
    context: INVALID_ID,
    resource: INVALID_ID,
};

impl VmciHandle {
    pub const fn new(context: VmciId, resource: VmciId) -> Self {
        VmciHandle { context, resource }
    }

    pub fn is_invalid(&self) -> bool {
        self.context == INVALID_ID && self.resource == INVALID_ID
    }

    pub fn to_u64(&self) -> u64 {
        (u64::from(self.context) << 32) | u64::from(self.resource)
    }

    pub fn from_u64(v: u64) -> Self {
        VmciHandle {
            context: (v >> 32) as u32,
            resource: v as u32,
        }
    }
}

bitflags! {
    /// Privilege bits attached to a context or a registered endpoint.
    ///
    /// The low two bits are the protocol-defined trust levels; the remainder
    /// of the low byte is reserved for deployment-specific bits that the
    /// interaction predicate ignores.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct PrivFlags: u32 {
        /// May only interact with TRUSTED entities.
        const RESTRICTED = 0x01;
        /// May interact with anything, including RESTRICTED entities.
        const TRUSTED = 0x02;
    }
}

impl PrivFlags {
    /// Whether two entities are allowed to exchange datagrams or share a
    /// queue pair. Interaction is denied only when one side is RESTRICTED
    /// and the other is not TRUSTED; the predicate is symmetric.
    pub fn can_interact(self, other: PrivFlags) -> bool {
        let veto = |a: PrivFlags, b: PrivFlags| {
            a.contains(PrivFlags::RESTRICTED) && !b.contains(PrivFlags::TRUSTED)
        };
        !veto(self, other) && !veto(other, self)
    }
}

bitflags! {
    /// Flags supplied to queue-pair alloc.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct QueuePairFlags: u32 {
        /// Fail rather than create if the pair does not already exist.
        const ATTACH_ONLY = 0x01;
        /// Both endpoints live in the same context.
        const LOCAL = 0x02;
    }
}

/// Fixed-size header preceding every datagram payload on the wire.
///
/// Field order (destination first) matches the original wire layout and must
/// not change: this struct crosses into the guest transport byte-for-byte.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct DatagramHeader {
    pub dst: VmciHandle,
    pub src: VmciHandle,
    pub payload_size: u64,
}

/// System events published through the event bus and, for guest contexts,
/// delivered as datagrams addressed to the event-handler resource.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, N)]
#[repr(u32)]
pub enum EventKind {
    CtxIdUpdate = 0,
    CtxRemoved = 1,
    QpResumed = 2,
    QpPeerAttach = 3,
    QpPeerDetach = 4,
    MemAccessOn = 5,
    MemAccessOff = 6,
    GuestPaused = 7,
    GuestUnpaused = 8,
}

/// Number of distinct event kinds; subscription lists are indexed by kind.
pub const NUM_EVENT_KINDS: usize = 9;

/// Leading bytes of every event datagram payload.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct EventHeader {
    pub event: u32,
    pub _pad: u32,
}

/// Payload for context-scoped events (`CtxRemoved`, `CtxIdUpdate`,
/// `GuestPaused`, ...).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct EventPayloadContext {
    pub context_id: u32,
    pub _pad: u32,
}

/// Payload for queue-pair peer events.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct EventPayloadQueuePair {
    pub handle: VmciHandle,
    pub peer_id: u32,
    pub flags: u32,
}

/// Ring bookkeeping for one direction of a queue pair. Snapshotted across
/// unmap/map so in-flight positions survive a quiesce with memory released.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct QueueHeader {
    pub producer_tail: u64,
    pub consumer_head: u64,
}

/// Length prefix for one pending-datagram record in a checkpoint blob.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct CheckpointDatagramRecord {
    pub size: u32,
}
