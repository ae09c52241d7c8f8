// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors

//! Shared-memory remote-service transport core.
//!
//! Two cooperating processes exchange request/reply messages through a
//! pooled POSIX shared-memory segment: the requesting side reserves a slot,
//! writes its payload and blocks on an in-segment condition variable; the
//! replying side reads the request, dispatches it to the exported service
//! through a [`ServiceInvoker`], and publishes the reply into the same slot.
//! [`ImportBinding`] manages the consumer-side lifecycle, creating a local
//! proxy whenever a matching RPC factory is available.
//!
//! Unix only: the slot protocol relies on process-shared (and, where
//! available, robust) pthread primitives living inside the segment.

#![cfg(unix)]

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod import;
pub mod invoker;
pub mod msg;
pub mod shm;
pub mod sync;
pub mod tracker;

pub use channel::ShmChannel;
pub use config::RsaShmConfig;
pub use endpoint::{EndpointDescription, Properties};
pub use error::{Result, RsaError};
pub use import::{ImportBinding, RpcFactory};
pub use invoker::{DynamicInterface, Interceptor, InterfaceMeta, ServiceInvoker, SharedService};
pub use msg::{MsgDescriptor, MsgState};
pub use shm::{ShmOpenMode, ShmSegment};
pub use tracker::{Tracker, TrackerHandle, TrackingEvent};
