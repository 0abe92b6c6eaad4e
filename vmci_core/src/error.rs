// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use remain::sorted;
use thiserror::Error;

/// Errors surfaced by the registries, the router, and the queue-pair broker.
///
/// Every variant is recoverable by the caller; none of these conditions
/// takes the process down. Contract violations inside the engine itself
/// (refcount underflow and the like) are asserts, not errors.
#[sorted]
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum VmciError {
    #[error("object already exists")]
    AlreadyExists,
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: u64 },
    #[error("destination unreachable")]
    DstUnreachable,
    #[error("duplicate entry")]
    DuplicateEntry,
    #[error("unknown event kind")]
    EventUnknown,
    #[error("invalid argument")]
    InvalidArgs,
    #[error("not permitted by privilege flags")]
    NoAccess,
    #[error("out of memory or admission limit reached")]
    NoMem,
    #[error("no more datagrams pending")]
    NoMoreDatagrams,
    #[error("queue full")]
    NoResources,
    #[error("object not found")]
    NotFound,
    #[error("queue pair size or flags mismatch")]
    QueuePairMismatch,
    #[error("caller is not attached to the queue pair")]
    QueuePairNotAttached,
    #[error("object exists but is in the wrong state")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, VmciError>;
