/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Loopback fabric
//!
//! An in-process implementation of the transport traits. Two endpoints in
//! the same process (normally driven from two threads) find each other
//! through a port registry shared by every clone of a [`LoopbackFabric`].
//!
//! Data movement mimics a reliable-connected queue pair:
//!
//! * a send copies the registered source bytes straight into the peer's
//!   oldest posted receive buffer, so the peer observes the data before it
//!   polls its completion queue (busy-wait detection behaves as on a NIC);
//! * with no receive posted the message is parked until one is
//!   (receiver-not-ready retry);
//! * queue depth, registration coverage and access rights are enforced;
//! * a send towards a disconnected peer completes with an error status;
//!   disconnecting flushes outstanding receives on both sides, and a
//!   receive posted after the peer left is flushed at once.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;
use std::time::Instant;

use crate::memory_region::byte_cells;
use crate::transport::AccessFlags;
use crate::transport::AddressHint;
use crate::transport::Completion;
use crate::transport::Endpoint;
use crate::transport::Fabric;
use crate::transport::Listener;
use crate::transport::MemoryKey;
use crate::transport::QueueCapacity;
use crate::transport::Sge;
use crate::transport::TransportError;

/// Work completion status codes, numbered as in `enum ibv_wc_status`.
const WC_LOC_LEN_ERR: u32 = 1;
const WC_WR_FLUSH_ERR: u32 = 5;
const WC_RETRY_EXC_ERR: u32 = 12;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTRY_POLL_INTERVAL: Duration = Duration::from_millis(1);

const RESOLVABLE_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "loopback", "*"];

static NEXT_LKEY: AtomicU32 = AtomicU32::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn os_error(operation: &'static str, errno: i32) -> TransportError {
    TransportError::new(operation, io::Error::from_raw_os_error(errno))
}

struct ConnectRequest {
    wire: Arc<Mutex<Wire>>,
    initiator_qp: u32,
    accepted: mpsc::Sender<u32>,
}

/// An in-process fabric. Clones share one port registry.
#[derive(Clone)]
pub struct LoopbackFabric {
    registry: Arc<Mutex<HashMap<u16, mpsc::Sender<ConnectRequest>>>>,
    connect_timeout: Duration,
}

impl fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports: Vec<u16> = lock(&self.registry).keys().copied().collect();
        f.debug_struct("LoopbackFabric")
            .field("listening", &ports)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bounds how long `connect` waits for a listener to appear and accept,
    /// and how long `get_request` waits for a peer.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn lookup(&self, port: u16) -> Option<mpsc::Sender<ConnectRequest>> {
        lock(&self.registry).get(&port).cloned()
    }
}

/// Result of loopback address resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackAddr {
    pub port: u16,
    pub passive: bool,
}

impl Fabric for LoopbackFabric {
    type AddrInfo = LoopbackAddr;
    type Endpoint = LoopbackEndpoint;
    type Listener = LoopbackListener;

    fn resolve(&self, hint: &AddressHint<'_>) -> Result<LoopbackAddr, TransportError> {
        match hint {
            AddressHint::Active { host, port } => {
                if !RESOLVABLE_HOSTS.contains(host) {
                    return Err(TransportError::new(
                        "rdma_getaddrinfo",
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("{} is not reachable over the loopback fabric", host),
                        ),
                    ));
                }
                Ok(LoopbackAddr {
                    port: *port,
                    passive: false,
                })
            }
            AddressHint::Passive { port } => Ok(LoopbackAddr {
                port: *port,
                passive: true,
            }),
        }
    }

    fn create_endpoint(
        &self,
        info: LoopbackAddr,
        caps: &QueueCapacity,
    ) -> Result<LoopbackEndpoint, TransportError> {
        if info.passive {
            return Err(os_error("rdma_create_ep", libc::EINVAL));
        }
        check_caps(caps)?;
        let endpoint = LoopbackEndpoint {
            wire: Arc::new(Mutex::new(Wire::new(*caps))),
            side: 0,
            qp_num: rand::random::<u32>() & 0x00ff_ffff,
            next_wr_id: 0,
            link: Link::Idle,
            fabric: self.clone(),
            port: info.port,
        };
        tracing::debug!(
            "created loopback endpoint qp {} towards port {} with {}",
            endpoint.qp_num,
            info.port,
            caps
        );
        Ok(endpoint)
    }

    fn create_listener(
        &self,
        info: LoopbackAddr,
        caps: &QueueCapacity,
    ) -> Result<LoopbackListener, TransportError> {
        if !info.passive {
            return Err(os_error("rdma_create_ep", libc::EINVAL));
        }
        check_caps(caps)?;
        Ok(LoopbackListener {
            fabric: self.clone(),
            port: info.port,
            caps: *caps,
            requests: None,
        })
    }
}

fn check_caps(caps: &QueueCapacity) -> Result<(), TransportError> {
    if caps.max_send_wr == 0
        || caps.max_recv_wr == 0
        || caps.max_send_sge == 0
        || caps.max_recv_sge == 0
    {
        return Err(os_error("rdma_create_ep", libc::EINVAL));
    }
    Ok(())
}

/// The passive side: owns a registry entry while listening.
pub struct LoopbackListener {
    fabric: LoopbackFabric,
    port: u16,
    caps: QueueCapacity,
    requests: Option<mpsc::Receiver<ConnectRequest>>,
}

impl fmt::Debug for LoopbackListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackListener")
            .field("port", &self.port)
            .field("listening", &self.requests.is_some())
            .finish()
    }
}

impl Listener for LoopbackListener {
    type Endpoint = LoopbackEndpoint;

    fn listen(&mut self) -> Result<(), TransportError> {
        let mut registry = lock(&self.fabric.registry);
        if registry.contains_key(&self.port) {
            return Err(os_error("rdma_listen", libc::EADDRINUSE));
        }
        let (tx, rx) = mpsc::channel();
        registry.insert(self.port, tx);
        self.requests = Some(rx);
        tracing::debug!("loopback listener bound to port {}", self.port);
        Ok(())
    }

    fn get_request(&mut self) -> Result<LoopbackEndpoint, TransportError> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| os_error("rdma_get_request", libc::EINVAL))?;
        let request = requests
            .recv_timeout(self.fabric.connect_timeout)
            .map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => {
                    os_error("rdma_get_request", libc::ETIMEDOUT)
                }
                mpsc::RecvTimeoutError::Disconnected => {
                    os_error("rdma_get_request", libc::ECONNABORTED)
                }
            })?;
        lock(&request.wire).sides[1] = Side::new(self.caps);
        let qp_num = rand::random::<u32>() & 0x00ff_ffff;
        tracing::debug!(
            "loopback port {} got request from qp {}, local qp {}",
            self.port,
            request.initiator_qp,
            qp_num
        );
        Ok(LoopbackEndpoint {
            wire: request.wire,
            side: 1,
            qp_num,
            next_wr_id: 0,
            link: Link::Requested(request.accepted),
            fabric: self.fabric.clone(),
            port: self.port,
        })
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        if self.requests.take().is_some() {
            lock(&self.fabric.registry).remove(&self.port);
            tracing::debug!("loopback listener on port {} destroyed", self.port);
        }
    }
}

struct Registration {
    addr: usize,
    len: usize,
    access: AccessFlags,
}

struct PostedRecv {
    wr_id: u64,
    sge: Sge,
    lkey: u32,
}

struct Side {
    caps: QueueCapacity,
    registrations: HashMap<u32, Registration>,
    posted: VecDeque<PostedRecv>,
    parked: VecDeque<Vec<u8>>,
    send_cq: VecDeque<Completion>,
    recv_cq: VecDeque<Completion>,
    closed: bool,
}

impl Side {
    fn new(caps: QueueCapacity) -> Self {
        Self {
            caps,
            registrations: HashMap::new(),
            posted: VecDeque::new(),
            parked: VecDeque::new(),
            send_cq: VecDeque::new(),
            recv_cq: VecDeque::new(),
            closed: false,
        }
    }

    /// Places `payload` into `recv` and queues its completion.
    fn deliver(&mut self, recv: PostedRecv, payload: &[u8]) {
        if payload.len() > recv.sge.length as usize {
            self.recv_cq.push_back(Completion::failed(
                recv.wr_id,
                WC_LOC_LEN_ERR,
                0,
                format!(
                    "{} byte message overruns {} byte receive",
                    payload.len(),
                    recv.sge.length
                ),
            ));
            return;
        }
        // SAFETY: the range was checked against a live registration when the
        // receive was posted, and registrations outlive their posted receives.
        let cells = unsafe { byte_cells(recv.sge.addr, payload.len()) };
        for (cell, byte) in cells.iter().zip(payload) {
            cell.store(*byte, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::SeqCst);
        self.recv_cq
            .push_back(Completion::success(recv.wr_id, payload.len()));
    }

    fn flush_posted(&mut self, reason: &str) {
        while let Some(recv) = self.posted.pop_front() {
            self.recv_cq
                .push_back(Completion::failed(recv.wr_id, WC_WR_FLUSH_ERR, 0, reason));
        }
    }

    fn covers(&self, lkey: u32, sge: &Sge) -> Option<&Registration> {
        self.registrations
            .get(&lkey)
            .filter(|reg| sge.addr >= reg.addr && sge.end() <= reg.addr + reg.len)
    }
}

struct Wire {
    sides: [Side; 2],
}

impl Wire {
    fn new(caps: QueueCapacity) -> Self {
        Self {
            sides: [Side::new(caps), Side::new(caps)],
        }
    }
}

enum Link {
    Idle,
    Requested(mpsc::Sender<u32>),
    Connected,
    Disconnected,
}

/// One side of a loopback connection.
pub struct LoopbackEndpoint {
    wire: Arc<Mutex<Wire>>,
    side: usize,
    qp_num: u32,
    next_wr_id: u64,
    link: Link,
    fabric: LoopbackFabric,
    port: u16,
}

impl fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackEndpoint")
            .field("qp_num", &self.qp_num)
            .field("port", &self.port)
            .field("side", &self.side)
            .field("connected", &matches!(self.link, Link::Connected))
            .finish()
    }
}

impl LoopbackEndpoint {
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    fn peer(&self) -> usize {
        1 - self.side
    }

    fn wr_id(&mut self) -> u64 {
        let id = self.next_wr_id;
        self.next_wr_id += 1;
        id
    }

    fn close_link(&mut self) {
        let mut wire = lock(&self.wire);
        wire.sides[self.side].closed = true;
        wire.sides[self.side].flush_posted("local endpoint disconnected");
        let peer = self.peer();
        wire.sides[peer].flush_posted("remote endpoint disconnected");
    }
}

impl Endpoint for LoopbackEndpoint {
    type Key = LoopbackKey;

    fn register(
        &mut self,
        addr: usize,
        len: usize,
        access: AccessFlags,
    ) -> Result<LoopbackKey, TransportError> {
        if addr == 0 || len == 0 {
            return Err(os_error("ibv_reg_mr", libc::EINVAL));
        }
        let lkey = NEXT_LKEY.fetch_add(1, Ordering::Relaxed);
        lock(&self.wire).sides[self.side]
            .registrations
            .insert(lkey, Registration { addr, len, access });
        tracing::debug!(
            "qp {} registered {} bytes at {:#x}, lkey {:#x}, access {:#x}",
            self.qp_num,
            len,
            addr,
            lkey,
            access.0
        );
        Ok(LoopbackKey {
            wire: Arc::clone(&self.wire),
            side: self.side,
            lkey,
        })
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if !matches!(self.link, Link::Idle) || self.side != 0 {
            return Err(os_error("rdma_connect", libc::EINVAL));
        }
        let deadline = Instant::now() + self.fabric.connect_timeout;
        let listener = loop {
            if let Some(tx) = self.fabric.lookup(self.port) {
                break tx;
            }
            if Instant::now() >= deadline {
                return Err(os_error("rdma_connect", libc::ECONNREFUSED));
            }
            std::thread::sleep(REGISTRY_POLL_INTERVAL);
        };

        let (accepted_tx, accepted_rx) = mpsc::channel();
        listener
            .send(ConnectRequest {
                wire: Arc::clone(&self.wire),
                initiator_qp: self.qp_num,
                accepted: accepted_tx,
            })
            .map_err(|_| os_error("rdma_connect", libc::ECONNREFUSED))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let peer_qp = accepted_rx.recv_timeout(remaining).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => os_error("rdma_connect", libc::ETIMEDOUT),
            mpsc::RecvTimeoutError::Disconnected => {
                os_error("rdma_connect", libc::ECONNREFUSED)
            }
        })?;
        self.link = Link::Connected;
        tracing::debug!(
            "qp {} connected to qp {} on port {}",
            self.qp_num,
            peer_qp,
            self.port
        );
        Ok(())
    }

    fn accept(&mut self) -> Result<(), TransportError> {
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Requested(accepted) => {
                accepted
                    .send(self.qp_num)
                    .map_err(|_| os_error("rdma_accept", libc::ECONNABORTED))?;
                self.link = Link::Connected;
                tracing::debug!("qp {} accepted on port {}", self.qp_num, self.port);
                Ok(())
            }
            other => {
                self.link = other;
                Err(os_error("rdma_accept", libc::EINVAL))
            }
        }
    }

    fn post_send(
        &mut self,
        sge: Sge,
        key: &LoopbackKey,
        inline: bool,
    ) -> Result<(), TransportError> {
        if !matches!(self.link, Link::Connected) {
            return Err(os_error("rdma_post_send", libc::ENOTCONN));
        }
        let wr_id = self.wr_id();
        let (me, peer) = (self.side, self.peer());
        let mut wire = lock(&self.wire);
        {
            let local = &wire.sides[me];
            if local.send_cq.len() >= local.caps.max_send_wr as usize {
                return Err(os_error("rdma_post_send", libc::ENOMEM));
            }
            if inline {
                if sge.length > local.caps.max_inline_data {
                    return Err(os_error("rdma_post_send", libc::EINVAL));
                }
            } else if local.covers(key.lkey, &sge).is_none() {
                return Err(os_error("rdma_post_send", libc::EINVAL));
            }
        }

        std::sync::atomic::fence(Ordering::SeqCst);
        // SAFETY: inline sends read the caller's live buffer at post time;
        // otherwise the range lies within a live registration (checked above).
        let payload: Vec<u8> = unsafe { byte_cells(sge.addr, sge.length as usize) }
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect();

        if wire.sides[peer].closed {
            wire.sides[me].send_cq.push_back(Completion::failed(
                wr_id,
                WC_RETRY_EXC_ERR,
                0,
                "remote endpoint disconnected",
            ));
            return Ok(());
        }
        match wire.sides[peer].posted.pop_front() {
            Some(recv) => wire.sides[peer].deliver(recv, &payload),
            None => wire.sides[peer].parked.push_back(payload),
        }
        wire.sides[me]
            .send_cq
            .push_back(Completion::success(wr_id, sge.length as usize));
        tracing::debug!(
            "qp {} posted send wr {} ({} bytes{})",
            self.qp_num,
            wr_id,
            sge.length,
            if inline { ", inline" } else { "" }
        );
        Ok(())
    }

    fn post_recv(&mut self, sge: Sge, key: &LoopbackKey) -> Result<(), TransportError> {
        if matches!(self.link, Link::Disconnected) {
            return Err(os_error("rdma_post_recv", libc::ENOTCONN));
        }
        let wr_id = self.wr_id();
        let (me, peer) = (self.side, self.peer());
        let mut wire = lock(&self.wire);
        let peer_closed = wire.sides[peer].closed;
        let local = &mut wire.sides[me];
        match local.covers(key.lkey, &sge) {
            Some(reg) if reg.access.contains(AccessFlags::LOCAL_WRITE) => {}
            _ => return Err(os_error("rdma_post_recv", libc::EINVAL)),
        }
        if local.posted.len() >= local.caps.max_recv_wr as usize {
            return Err(os_error("rdma_post_recv", libc::ENOMEM));
        }
        let recv = PostedRecv {
            wr_id,
            sge,
            lkey: key.lkey,
        };
        // Parked messages arrived before the peer left and are still delivered.
        match local.parked.pop_front() {
            Some(payload) => local.deliver(recv, &payload),
            None if peer_closed => local.recv_cq.push_back(Completion::failed(
                recv.wr_id,
                WC_WR_FLUSH_ERR,
                0,
                "remote endpoint disconnected",
            )),
            None => local.posted.push_back(recv),
        }
        tracing::debug!(
            "qp {} posted recv wr {} ({} bytes)",
            self.qp_num,
            wr_id,
            sge.length
        );
        Ok(())
    }

    fn poll_send(&mut self) -> Result<Option<Completion>, TransportError> {
        Ok(lock(&self.wire).sides[self.side].send_cq.pop_front())
    }

    fn poll_recv(&mut self) -> Result<Option<Completion>, TransportError> {
        Ok(lock(&self.wire).sides[self.side].recv_cq.pop_front())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if !matches!(self.link, Link::Connected) {
            return Err(os_error("rdma_disconnect", libc::ENOTCONN));
        }
        self.close_link();
        self.link = Link::Disconnected;
        tracing::debug!("qp {} disconnected", self.qp_num);
        Ok(())
    }

    fn device_name(&self) -> Option<String> {
        Some("loopback".to_string())
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        if !matches!(self.link, Link::Disconnected) {
            self.close_link();
        }
    }
}

/// Registration handle of the loopback fabric.
pub struct LoopbackKey {
    wire: Arc<Mutex<Wire>>,
    side: usize,
    lkey: u32,
}

impl fmt::Debug for LoopbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoopbackKey({:#x})", self.lkey)
    }
}

impl MemoryKey for LoopbackKey {
    fn lkey(&self) -> u32 {
        self.lkey
    }
}

impl Drop for LoopbackKey {
    fn drop(&mut self) {
        let mut wire = lock(&self.wire);
        let side = &mut wire.sides[self.side];
        side.registrations.remove(&self.lkey);
        side.posted.retain(|recv| recv.lkey != self.lkey);
        tracing::debug!("deregistered lkey {:#x}", self.lkey);
    }
}
