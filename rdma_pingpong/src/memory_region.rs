/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Memory region
//!
//! A session owns exactly one [`MemoryRegion`]: a fixed-size buffer plus,
//! once registered, the transport key that lets the queue pair DMA into and
//! out of it. The buffer is either a page-aligned host allocation
//! ([`RegionMode::Owned`]) or an external window obtained from a
//! [`WindowMapper`] ([`RegionMode::ExternalMapped`]).
//!
//! The NIC (or the loopback fabric) writes the buffer behind the
//! compiler's back, so every CPU access goes through byte-wise atomics
//! followed by a sequentially consistent fence.

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;

use crate::error::PingPongError;
use crate::transport::AccessFlags;
use crate::transport::Endpoint;
use crate::transport::MemoryKey;
use crate::transport::Sge;
use crate::window::MappedWindow;
use crate::window::WindowMapper;

const PAGE_SIZE: usize = 4096;

/// Views `len` bytes at `addr` as atomic cells.
///
/// # Safety
///
/// `addr..addr + len` must be valid for reads and writes for `'a`.
pub(crate) unsafe fn byte_cells<'a>(addr: usize, len: usize) -> &'a [AtomicU8] {
    if len == 0 {
        return &[];
    }
    // SAFETY: `AtomicU8` has the same in-memory representation as `u8`;
    // validity of the range is the caller's obligation.
    unsafe { std::slice::from_raw_parts(addr as *const AtomicU8, len) }
}

/// The byte written into the buffer for pattern value `value`.
pub fn pattern_byte(value: u32) -> u8 {
    (value & 0xff) as u8
}

/// How the buffer is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMode {
    /// Freshly allocated host memory owned by the region.
    Owned,
    /// An externally mapped device window (peer-direct).
    ExternalMapped,
}

impl RegionMode {
    pub fn access_flags(&self) -> AccessFlags {
        match self {
            RegionMode::Owned => AccessFlags::LOCAL_WRITE,
            RegionMode::ExternalMapped => {
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ
            }
        }
    }
}

impl fmt::Display for RegionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionMode::Owned => write!(f, "owned"),
            RegionMode::ExternalMapped => write!(f, "external-mapped"),
        }
    }
}

struct HostBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostBuffer {
    fn allocate(size: usize) -> Result<Self, PingPongError> {
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|_| PingPongError::Allocation { size })?;
        // SAFETY: `size` is non-zero (validated by the caller).
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(PingPongError::Allocation { size })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

enum Backing {
    Host(HostBuffer),
    Window(Box<dyn MappedWindow>),
}

impl Backing {
    fn addr(&self) -> usize {
        match self {
            Backing::Host(buffer) => buffer.ptr.as_ptr() as usize,
            Backing::Window(window) => window.as_ptr() as usize,
        }
    }
}

/// A fixed-size buffer and its registration.
pub struct MemoryRegion<K: MemoryKey> {
    size: usize,
    mode: RegionMode,
    // The key must be dropped before the memory it covers.
    key: Option<K>,
    backing: Option<Backing>,
}

// SAFETY: the region exclusively owns its allocation or mapping; all access
// through shared references uses atomics.
unsafe impl<K: MemoryKey + Send> Send for MemoryRegion<K> {}

impl<K: MemoryKey> fmt::Debug for MemoryRegion<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("size", &self.size)
            .field("mode", &self.mode)
            .field("addr", &format!("{:#x}", self.addr()))
            .field("lkey", &self.lkey())
            .finish()
    }
}

impl<K: MemoryKey> MemoryRegion<K> {
    /// Allocates (`Owned`) or maps (`ExternalMapped`) a buffer of `size`
    /// bytes. An external mapping needs a `mapper`.
    pub fn acquire(
        size: usize,
        mode: RegionMode,
        mapper: Option<&dyn WindowMapper>,
    ) -> Result<Self, PingPongError> {
        if size == 0 {
            return Err(PingPongError::BadArgs("buffer size must be non-zero".into()));
        }
        let backing = match mode {
            RegionMode::Owned => Backing::Host(HostBuffer::allocate(size)?),
            RegionMode::ExternalMapped => {
                let mapper = mapper.ok_or_else(|| {
                    PingPongError::Mapping(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no external window configured",
                    ))
                })?;
                let window = mapper.map(size).map_err(PingPongError::Mapping)?;
                if window.len() < size {
                    return Err(PingPongError::Mapping(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("window of {} bytes is smaller than {}", window.len(), size),
                    )));
                }
                Backing::Window(window)
            }
        };
        tracing::debug!(
            "acquired {} byte {} buffer at {:#x}",
            size,
            mode,
            backing.addr()
        );
        Ok(Self {
            size,
            mode,
            key: None,
            backing: Some(backing),
        })
    }

    /// Registers the buffer against `endpoint`'s protection domain.
    /// A previous registration is dropped first.
    pub fn register<E>(&mut self, endpoint: &mut E, access: AccessFlags) -> Result<(), PingPongError>
    where
        E: Endpoint<Key = K>,
    {
        let addr = self.addr();
        if addr == 0 {
            return Err(PingPongError::Registration(
                crate::transport::TransportError::new(
                    "ibv_reg_mr",
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "region released"),
                ),
            ));
        }
        self.key = None;
        let key = endpoint
            .register(addr, self.size, access)
            .map_err(PingPongError::Registration)?;
        tracing::debug!(
            "registered {} bytes at {:#x} with lkey {:#x}",
            self.size,
            addr,
            key.lkey()
        );
        self.key = Some(key);
        Ok(())
    }

    /// Deregisters and frees (or unmaps) the buffer. Safe to call again.
    pub fn release(&mut self) {
        if let Some(key) = self.key.take() {
            tracing::debug!("deregistering lkey {:#x}", key.lkey());
            drop(key);
        }
        if let Some(backing) = self.backing.take() {
            tracing::debug!("releasing {} buffer at {:#x}", self.mode, backing.addr());
            drop(backing);
        }
    }

    pub fn is_released(&self) -> bool {
        self.backing.is_none()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn mode(&self) -> RegionMode {
        self.mode
    }

    /// Buffer address, or 0 once released.
    pub fn addr(&self) -> usize {
        self.backing.as_ref().map_or(0, Backing::addr)
    }

    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    pub fn lkey(&self) -> Option<u32> {
        self.key.as_ref().map(MemoryKey::lkey)
    }

    /// The whole buffer as one scatter/gather element.
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.addr(),
            length: u32::try_from(self.size).unwrap_or(u32::MAX),
        }
    }

    fn cells(&self) -> &[AtomicU8] {
        match &self.backing {
            // SAFETY: the backing stays alive for as long as `self` is borrowed.
            Some(backing) => unsafe { byte_cells(backing.addr(), self.size) },
            None => &[],
        }
    }

    /// Fills the buffer with the pattern byte for `value` and fences.
    pub fn stamp(&self, value: u32) {
        let byte = pattern_byte(value);
        for cell in self.cells() {
            cell.store(byte, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }

    /// True when every byte equals the pattern byte for `value`.
    pub fn holds(&self, value: u32) -> bool {
        fence(Ordering::SeqCst);
        let byte = pattern_byte(value);
        let cells = self.cells();
        !cells.is_empty() && cells.iter().all(|cell| cell.load(Ordering::Relaxed) == byte)
    }

    pub fn first_byte(&self) -> Option<u8> {
        fence(Ordering::SeqCst);
        self.cells().first().map(|cell| cell.load(Ordering::Relaxed))
    }

    /// Copies a snapshot of the buffer out.
    pub fn to_vec(&self) -> Vec<u8> {
        fence(Ordering::SeqCst);
        self.cells()
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect()
    }

    /// Copies the window into the buffer (up to the shorter length).
    pub fn copy_from_window(&self, window: &dyn MappedWindow) {
        // SAFETY: the window is mapped for its full length while borrowed.
        let src = unsafe { byte_cells(window.as_ptr() as usize, window.len()) };
        for (dst, src) in self.cells().iter().zip(src) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }

    /// Copies the buffer into the window (up to the shorter length).
    pub fn copy_to_window(&self, window: &dyn MappedWindow) {
        fence(Ordering::SeqCst);
        // SAFETY: the window is mapped for its full length while borrowed.
        let dst = unsafe { byte_cells(window.as_ptr() as usize, window.len()) };
        for (dst, src) in dst.iter().zip(self.cells()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }
}

impl<K: MemoryKey> Drop for MemoryRegion<K> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Fills a window with the pattern byte for `value`.
pub fn stamp_window(window: &dyn MappedWindow, value: u32) {
    let byte = pattern_byte(value);
    // SAFETY: the window is mapped for its full length while borrowed.
    for cell in unsafe { byte_cells(window.as_ptr() as usize, window.len()) } {
        cell.store(byte, Ordering::Relaxed);
    }
    fence(Ordering::SeqCst);
}
