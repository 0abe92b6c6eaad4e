// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side virtual machine communication engine.
//!
//! The engine tracks one [`context::Context`] per VM (plus one for the
//! host), routes bounded datagrams between them and host-registered
//! endpoints, brokers shared-memory queue pairs through their
//! memory-availability lifecycle, and fans out lifecycle events over a
//! publish/subscribe bus. [`driver::Vmci`] is the composition root; the
//! guest transport and host drivers plug in as collaborators.

pub mod context;
pub mod datagram;
pub mod doorbell;
pub mod driver;
pub mod error;
pub mod event;
pub mod handle_table;
pub mod queue_pair;
pub mod resource;
pub mod route;
pub mod worker;

pub use error::Result;
pub use error::VmciError;
