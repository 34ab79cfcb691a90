/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reliable-connection ping-pong over RDMA.
//!
//! Two peers connect through the connection manager, register one buffer
//! each, and bounce a byte pattern back and forth with two-sided
//! send/receive, timing every half-cycle. The transport sits behind the
//! [`transport::Fabric`] seam: [`loopback::LoopbackFabric`] runs both
//! peers in one process, and `verbs::RdmaCmFabric` (feature `verbs`) drives
//! librdmacm and libibverbs.

// RDMA requires frequent unsafe code blocks
#![allow(clippy::undocumented_unsafe_blocks)]

pub mod config;
pub mod connection;
pub mod error;
pub mod loopback;
pub mod memory_region;
pub mod metrics;
pub mod report;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod window;

#[cfg(feature = "verbs")]
pub mod devices;
#[cfg(feature = "verbs")]
pub mod verbs;

pub use config::PingPongConfig;
pub use error::ExitStatus;
pub use error::PingPongError;
pub use loopback::LoopbackFabric;
pub use session::Session;
pub use session::SessionReport;
pub use transfer::CancelToken;
