/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # librdmacm fabric
//!
//! The transport traits over the RDMA connection manager:
//!
//! * `resolve` - `rdma_getaddrinfo` in the TCP port space, `RAI_PASSIVE`
//!   for the responder
//! * `create_endpoint` / `create_listener` - `rdma_create_ep` with the
//!   requested queue capacities (the listener hands them to every
//!   endpoint returned by `rdma_get_request`)
//! * data path - `ibv_reg_mr` on the endpoint's protection domain,
//!   `rdma_post_send` / `rdma_post_recv` and non-blocking `ibv_poll_cq`
//!   on the endpoint's own send and receive completion queues
//!
//! Each raw handle is owned by a Rust value that releases it on drop.

use std::ffi::CStr;
use std::ffi::CString;
use std::fmt;
use std::io;
use std::ptr;
use std::ptr::NonNull;

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

/// Fabric backed by librdmacm and the local RDMA devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct RdmaCmFabric;

/// Owned result of `rdma_getaddrinfo`.
pub struct CmAddrInfo {
    ptr: NonNull<rdmacm_sys::rdma_addrinfo>,
}

impl fmt::Debug for CmAddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CmAddrInfo({:p})", self.ptr)
    }
}

impl Drop for CmAddrInfo {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from a successful `rdma_getaddrinfo` and is
        // freed exactly once.
        unsafe { rdmacm_sys::rdma_freeaddrinfo(self.ptr.as_ptr()) };
    }
}

fn qp_init_attr(caps: &QueueCapacity) -> rdmacm_sys::ibv_qp_init_attr {
    let mut attr = rdmacm_sys::ibv_qp_init_attr::default();
    attr.cap.max_send_wr = caps.max_send_wr;
    attr.cap.max_recv_wr = caps.max_recv_wr;
    attr.cap.max_send_sge = caps.max_send_sge;
    attr.cap.max_recv_sge = caps.max_recv_sge;
    attr.cap.max_inline_data = caps.max_inline_data;
    attr.qp_type = rdmacm_sys::IBV_QPT_RC;
    attr.sq_sig_all = i32::from(caps.signal_all);
    attr
}

fn create_ep(
    info: &CmAddrInfo,
    caps: &QueueCapacity,
) -> Result<NonNull<rdmacm_sys::rdma_cm_id>, TransportError> {
    let mut attr = qp_init_attr(caps);
    let mut id: *mut rdmacm_sys::rdma_cm_id = ptr::null_mut();
    // SAFETY: `info` is a live addrinfo; `attr` outlives the call.
    let ret = unsafe {
        rdmacm_sys::rdma_create_ep(&mut id, info.ptr.as_ptr(), ptr::null_mut(), &mut attr)
    };
    if ret != 0 {
        return Err(TransportError::last_os_error("rdma_create_ep"));
    }
    NonNull::new(id).ok_or_else(|| {
        TransportError::new("rdma_create_ep", io::Error::other("returned a null id"))
    })
}

impl Fabric for RdmaCmFabric {
    type AddrInfo = CmAddrInfo;
    type Endpoint = CmEndpoint;
    type Listener = CmListener;

    fn resolve(&self, hint: &AddressHint<'_>) -> Result<CmAddrInfo, TransportError> {
        let invalid = |e: std::ffi::NulError| {
            TransportError::new(
                "rdma_getaddrinfo",
                io::Error::new(io::ErrorKind::InvalidInput, e),
            )
        };
        let mut hints = rdmacm_sys::rdma_addrinfo::default();
        hints.ai_port_space = rdmacm_sys::rdma_port_space::RDMA_PS_TCP as i32;
        let node = match hint {
            AddressHint::Active { host, .. } => Some(CString::new(*host).map_err(invalid)?),
            AddressHint::Passive { .. } => {
                hints.ai_flags = rdmacm_sys::RAI_PASSIVE as i32;
                None
            }
        };
        let service = CString::new(hint.port().to_string()).map_err(invalid)?;
        let node_ptr = node.as_ref().map_or(ptr::null(), |n| n.as_ptr());

        let mut res: *mut rdmacm_sys::rdma_addrinfo = ptr::null_mut();
        // SAFETY: the strings and hints outlive the call; `res` is written on
        // success only.
        let ret = unsafe {
            rdmacm_sys::rdma_getaddrinfo(
                node_ptr as *mut std::ffi::c_char,
                service.as_ptr() as *mut std::ffi::c_char,
                &mut hints,
                &mut res,
            )
        };
        if ret != 0 {
            return Err(TransportError::last_os_error("rdma_getaddrinfo"));
        }
        let ptr = NonNull::new(res).ok_or_else(|| {
            TransportError::new(
                "rdma_getaddrinfo",
                io::Error::new(io::ErrorKind::NotFound, format!("no route to {}", hint)),
            )
        })?;
        Ok(CmAddrInfo { ptr })
    }

    fn create_endpoint(
        &self,
        info: CmAddrInfo,
        caps: &QueueCapacity,
    ) -> Result<CmEndpoint, TransportError> {
        let id = create_ep(&info, caps)?;
        tracing::debug!("created active endpoint {:p} with {}", id, caps);
        Ok(CmEndpoint::new(id))
    }

    fn create_listener(
        &self,
        info: CmAddrInfo,
        caps: &QueueCapacity,
    ) -> Result<CmListener, TransportError> {
        let id = create_ep(&info, caps)?;
        tracing::debug!("created passive endpoint {:p} with {}", id, caps);
        Ok(CmListener { id })
    }
}

/// A passive `rdma_cm_id`.
pub struct CmListener {
    id: NonNull<rdmacm_sys::rdma_cm_id>,
}

impl fmt::Debug for CmListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CmListener({:p})", self.id)
    }
}

impl Listener for CmListener {
    type Endpoint = CmEndpoint;

    fn listen(&mut self) -> Result<(), TransportError> {
        // SAFETY: `id` is a live passive id.
        if unsafe { rdmacm_sys::rdma_listen(self.id.as_ptr(), 0) } != 0 {
            return Err(TransportError::last_os_error("rdma_listen"));
        }
        Ok(())
    }

    fn get_request(&mut self) -> Result<CmEndpoint, TransportError> {
        let mut id: *mut rdmacm_sys::rdma_cm_id = ptr::null_mut();
        // SAFETY: `id` is a live listening id; `rdma_get_request` blocks
        // until a request arrives and creates its queue pair.
        if unsafe { rdmacm_sys::rdma_get_request(self.id.as_ptr(), &mut id) } != 0 {
            return Err(TransportError::last_os_error("rdma_get_request"));
        }
        let id = NonNull::new(id).ok_or_else(|| {
            TransportError::new("rdma_get_request", io::Error::other("returned a null id"))
        })?;
        Ok(CmEndpoint::new(id))
    }
}

impl Drop for CmListener {
    fn drop(&mut self) {
        // SAFETY: the listener owns `id`.
        unsafe { rdmacm_sys::rdma_destroy_ep(self.id.as_ptr()) };
    }
}

/// An active or accepted `rdma_cm_id` with its queue pair.
pub struct CmEndpoint {
    id: NonNull<rdmacm_sys::rdma_cm_id>,
    next_wr_id: u64,
}

impl fmt::Debug for CmEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmEndpoint")
            .field("id", &self.id)
            .field("device", &self.device_name())
            .finish()
    }
}

impl CmEndpoint {
    fn new(id: NonNull<rdmacm_sys::rdma_cm_id>) -> Self {
        Self { id, next_wr_id: 0 }
    }

    fn wr_id(&mut self) -> u64 {
        let id = self.next_wr_id;
        self.next_wr_id += 1;
        id
    }

    fn poll_cq(&mut self, send: bool) -> Result<Option<Completion>, TransportError> {
        let mut wc = rdmacm_sys::ibv_wc::default();
        // SAFETY: `id` is live and its CQs exist once the endpoint has a QP.
        let ret = unsafe {
            if send {
                rdmacm_sys::rdmacm_poll_send_cq(self.id.as_ptr(), &mut wc)
            } else {
                rdmacm_sys::rdmacm_poll_recv_cq(self.id.as_ptr(), &mut wc)
            }
        };
        match ret {
            0 => Ok(None),
            n if n < 0 => Err(TransportError::new(
                "ibv_poll_cq",
                io::Error::other(format!("ibv_poll_cq returned {}", n)),
            )),
            _ => Ok(Some(completion(&wc))),
        }
    }
}

fn completion(wc: &rdmacm_sys::ibv_wc) -> Completion {
    match wc.error() {
        None => Completion::success(wc.wr_id(), wc.len()),
        Some((status, vendor_err)) => {
            // SAFETY: `ibv_wc_status_str` returns a static string.
            let detail = unsafe {
                let s = rdmacm_sys::ibv_wc_status_str(status);
                if s.is_null() {
                    "unknown status".to_string()
                } else {
                    CStr::from_ptr(s).to_string_lossy().into_owned()
                }
            };
            Completion::failed(wc.wr_id(), status, vendor_err, detail)
        }
    }
}

fn verbs_access(access: AccessFlags) -> i32 {
    let mut flags = rdmacm_sys::ibv_access_flags(0);
    if access.contains(AccessFlags::LOCAL_WRITE) {
        flags |= rdmacm_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_WRITE) {
        flags |= rdmacm_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_READ) {
        flags |= rdmacm_sys::ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    flags.0 as i32
}

impl Endpoint for CmEndpoint {
    type Key = CmMemoryKey;

    fn register(
        &mut self,
        addr: usize,
        len: usize,
        access: AccessFlags,
    ) -> Result<CmMemoryKey, TransportError> {
        // SAFETY: the caller keeps `addr..addr + len` alive until the key
        // is dropped.
        let mr = unsafe {
            rdmacm_sys::rdmacm_reg_mr(
                self.id.as_ptr(),
                addr as *mut std::ffi::c_void,
                len,
                verbs_access(access),
            )
        };
        let mr = NonNull::new(mr).ok_or_else(|| TransportError::last_os_error("ibv_reg_mr"))?;
        Ok(CmMemoryKey { mr })
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        // SAFETY: `id` is a live active id with a QP.
        if unsafe { rdmacm_sys::rdma_connect(self.id.as_ptr(), ptr::null_mut()) } != 0 {
            return Err(TransportError::last_os_error("rdma_connect"));
        }
        Ok(())
    }

    fn accept(&mut self) -> Result<(), TransportError> {
        // SAFETY: `id` came from `rdma_get_request`.
        if unsafe { rdmacm_sys::rdma_accept(self.id.as_ptr(), ptr::null_mut()) } != 0 {
            return Err(TransportError::last_os_error("rdma_accept"));
        }
        Ok(())
    }

    fn post_send(
        &mut self,
        sge: Sge,
        key: &CmMemoryKey,
        inline: bool,
    ) -> Result<(), TransportError> {
        let flags = if inline {
            rdmacm_sys::ibv_send_flags::IBV_SEND_INLINE.0 as i32
        } else {
            0
        };
        let wr_id = self.wr_id();
        // SAFETY: `sge` lies within the registration behind `key`; the wr_id
        // travels as the opaque context pointer.
        let ret = unsafe {
            rdmacm_sys::rdmacm_post_send(
                self.id.as_ptr(),
                wr_id as usize as *mut std::ffi::c_void,
                sge.addr as *mut std::ffi::c_void,
                sge.length as usize,
                key.mr.as_ptr(),
                flags,
            )
        };
        if ret != 0 {
            return Err(TransportError::last_os_error("rdma_post_send"));
        }
        Ok(())
    }

    fn post_recv(&mut self, sge: Sge, key: &CmMemoryKey) -> Result<(), TransportError> {
        let wr_id = self.wr_id();
        // SAFETY: `sge` lies within the registration behind `key`.
        let ret = unsafe {
            rdmacm_sys::rdmacm_post_recv(
                self.id.as_ptr(),
                wr_id as usize as *mut std::ffi::c_void,
                sge.addr as *mut std::ffi::c_void,
                sge.length as usize,
                key.mr.as_ptr(),
            )
        };
        if ret != 0 {
            return Err(TransportError::last_os_error("rdma_post_recv"));
        }
        Ok(())
    }

    fn poll_send(&mut self) -> Result<Option<Completion>, TransportError> {
        self.poll_cq(true)
    }

    fn poll_recv(&mut self) -> Result<Option<Completion>, TransportError> {
        self.poll_cq(false)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        // SAFETY: `id` is live.
        if unsafe { rdmacm_sys::rdma_disconnect(self.id.as_ptr()) } != 0 {
            return Err(TransportError::last_os_error("rdma_disconnect"));
        }
        Ok(())
    }

    fn device_name(&self) -> Option<String> {
        // SAFETY: `id` is live; the name is owned by the device list.
        unsafe {
            let name = rdmacm_sys::rdmacm_device_name(self.id.as_ptr());
            if name.is_null() {
                None
            } else {
                Some(CStr::from_ptr(name).to_string_lossy().into_owned())
            }
        }
    }
}

impl Drop for CmEndpoint {
    fn drop(&mut self) {
        // SAFETY: the endpoint owns `id` and its QP.
        unsafe { rdmacm_sys::rdma_destroy_ep(self.id.as_ptr()) };
    }
}

/// An `ibv_mr` registered against an endpoint's protection domain.
pub struct CmMemoryKey {
    mr: NonNull<rdmacm_sys::ibv_mr>,
}

impl fmt::Debug for CmMemoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CmMemoryKey(lkey {:#x})", self.lkey())
    }
}

impl MemoryKey for CmMemoryKey {
    fn lkey(&self) -> u32 {
        // SAFETY: `mr` is live until drop.
        unsafe { self.mr.as_ref().lkey }
    }
}

impl Drop for CmMemoryKey {
    fn drop(&mut self) {
        // SAFETY: the key owns `mr`.
        let ret = unsafe { rdmacm_sys::ibv_dereg_mr(self.mr.as_ptr()) };
        if ret != 0 {
            tracing::warn!(
                "ibv_dereg_mr failed: {}",
                io::Error::from_raw_os_error(ret)
            );
        }
    }
}
