/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Transport seam
//!
//! The connection manager, memory region manager and transfer engine are
//! written against the traits in this module rather than against
//! librdmacm directly:
//!
//! * [`Fabric`] - address resolution and endpoint/listener creation
//! * [`Listener`] - the passive side; hands out exactly one inbound endpoint
//! * [`Endpoint`] - a reliable-connected channel with one send and one
//!   receive queue, plus memory registration against its protection domain
//! * [`MemoryKey`] - a registration handle, deregistered on drop
//!
//! Two fabrics implement them: `verbs::RdmaCmFabric` (real hardware,
//! behind the `verbs` feature) and [`crate::loopback::LoopbackFabric`]
//! (in-process, used by the tests and the `loopback` subcommand).

use std::fmt;
use std::io;
use std::ops::BitOr;

/// Largest payload the engine ever asks to be carried inline.
pub const DEFAULT_MAX_INLINE_DATA: u32 = 16;

/// A failed transport primitive: which call failed and why.
#[derive(Debug)]
pub struct TransportError {
    operation: &'static str,
    cause: io::Error,
}

impl TransportError {
    pub fn new(operation: &'static str, cause: io::Error) -> Self {
        Self { operation, cause }
    }

    /// Captures `errno` for a primitive that reported failure through it.
    pub fn last_os_error(operation: &'static str) -> Self {
        Self::new(operation, io::Error::last_os_error())
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn cause(&self) -> &io::Error {
        &self.cause
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.cause)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// What to resolve: a remote service for the initiator, or a local
/// wildcard bind with passive intent for the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressHint<'a> {
    Active { host: &'a str, port: u16 },
    Passive { port: u16 },
}

impl AddressHint<'_> {
    pub fn port(&self) -> u16 {
        match self {
            AddressHint::Active { port, .. } | AddressHint::Passive { port } => *port,
        }
    }

    pub fn is_passive(&self) -> bool {
        matches!(self, AddressHint::Passive { .. })
    }
}

impl fmt::Display for AddressHint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressHint::Active { host, port } => write!(f, "{}:{}", host, port),
            AddressHint::Passive { port } => write!(f, "*:{} (passive)", port),
        }
    }
}

/// Queue-pair capacities requested at endpoint creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCapacity {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
    /// Every send request generates a completion.
    pub signal_all: bool,
}

impl QueueCapacity {
    /// The fixed ping-pong capacities: depth one each way, one SGE, every
    /// send signaled, inline bound capped at `inline_limit`.
    pub fn for_chunk(size: usize, inline_limit: u32) -> Self {
        let max_inline_data = u32::try_from(size).map_or(inline_limit, |s| s.min(inline_limit));
        Self {
            max_send_wr: 1,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data,
            signal_all: true,
        }
    }
}

impl fmt::Display for QueueCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueCapacity {{ send_wr: {}, recv_wr: {}, send_sge: {}, recv_sge: {}, inline: {}, signal_all: {} }}",
            self.max_send_wr,
            self.max_recv_wr,
            self.max_send_sge,
            self.max_recv_sge,
            self.max_inline_data,
            self.signal_all,
        )
    }
}

/// Memory registration access rights.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);

    pub fn contains(&self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A single scatter/gather element over registered memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: usize,
    pub length: u32,
}

impl Sge {
    pub fn end(&self) -> usize {
        self.addr + self.length as usize
    }
}

/// Which completion queue to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTarget {
    Send,
    Recv,
}

/// A work completion pulled from a completion queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// `wr_id` - Work Request ID, used to identify the completed operation
    pub wr_id: u64,
    /// `len` - Length of the data transferred
    pub len: usize,
    /// `error` - `(status, vendor_err)` when the work request did not succeed
    pub error: Option<(u32, u32)>,
    /// `detail` - Human-readable status, when the fabric can provide one
    pub detail: Option<String>,
}

impl Completion {
    pub fn success(wr_id: u64, len: usize) -> Self {
        Self {
            wr_id,
            len,
            error: None,
            detail: None,
        }
    }

    pub fn failed(wr_id: u64, status: u32, vendor_err: u32, detail: impl Into<String>) -> Self {
        Self {
            wr_id,
            len: 0,
            error: Some((status, vendor_err)),
            detail: Some(detail.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, &self.detail) {
            (None, _) => write!(f, "wr_id {} ok ({} bytes)", self.wr_id, self.len),
            (Some((status, vendor_err)), detail) => write!(
                f,
                "wr_id {} status {} vendor error {}{}",
                self.wr_id,
                status,
                vendor_err,
                detail
                    .as_deref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default(),
            ),
        }
    }
}

/// A registration handle. Dropping it deregisters the memory.
pub trait MemoryKey {
    fn lkey(&self) -> u32;
}

/// A reliable-connected communication endpoint.
pub trait Endpoint {
    type Key: MemoryKey;

    /// Registers `len` bytes at `addr` against this endpoint's protection
    /// domain. The memory must stay valid until the returned key is dropped.
    fn register(
        &mut self,
        addr: usize,
        len: usize,
        access: AccessFlags,
    ) -> Result<Self::Key, TransportError>;

    /// Active connect; blocks until the transport confirms.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Accepts the inbound request this endpoint was created from.
    fn accept(&mut self) -> Result<(), TransportError>;

    fn post_send(&mut self, sge: Sge, key: &Self::Key, inline: bool)
    -> Result<(), TransportError>;

    fn post_recv(&mut self, sge: Sge, key: &Self::Key) -> Result<(), TransportError>;

    /// Non-blocking poll of the send completion queue.
    fn poll_send(&mut self) -> Result<Option<Completion>, TransportError>;

    /// Non-blocking poll of the receive completion queue.
    fn poll_recv(&mut self) -> Result<Option<Completion>, TransportError>;

    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Name of the local device carrying this endpoint, when known.
    fn device_name(&self) -> Option<String>;

    fn poll(&mut self, target: PollTarget) -> Result<Option<Completion>, TransportError> {
        match target {
            PollTarget::Send => self.poll_send(),
            PollTarget::Recv => self.poll_recv(),
        }
    }
}

/// The passive side of connection establishment.
pub trait Listener {
    type Endpoint: Endpoint;

    fn listen(&mut self) -> Result<(), TransportError>;

    /// Blocks until one inbound connection request arrives and returns the
    /// endpoint for it (not yet accepted).
    fn get_request(&mut self) -> Result<Self::Endpoint, TransportError>;
}

/// Address resolution and endpoint creation.
pub trait Fabric {
    type AddrInfo;
    type Endpoint: Endpoint;
    type Listener: Listener<Endpoint = Self::Endpoint>;

    fn resolve(&self, hint: &AddressHint<'_>) -> Result<Self::AddrInfo, TransportError>;

    fn create_endpoint(
        &self,
        info: Self::AddrInfo,
        caps: &QueueCapacity,
    ) -> Result<Self::Endpoint, TransportError>;

    fn create_listener(
        &self,
        info: Self::AddrInfo,
        caps: &QueueCapacity,
    ) -> Result<Self::Listener, TransportError>;
}
