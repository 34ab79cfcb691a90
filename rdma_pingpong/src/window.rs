/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! External mapped windows.
//!
//! Peer-direct and copy-through modes operate on a device memory window
//! (a p2pmem allocation, a PCI BAR resource file, ...) mapped into the
//! process. Whether the NIC can actually address that window is a property
//! of the platform that cannot be checked from here, so the window is an
//! injected capability: the core asks a [`WindowMapper`] for a byte range
//! and releases it by dropping the returned [`MappedWindow`].

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use memmap2::MmapMut;
use memmap2::MmapOptions;

/// A mapped byte range. Unmapped on drop.
pub trait MappedWindow: fmt::Debug + Send {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps external windows on request.
pub trait WindowMapper: fmt::Debug + Send + Sync {
    fn map(&self, len: usize) -> io::Result<Box<dyn MappedWindow>>;
}

/// Maps the first `len` bytes of a file or device node read-write.
#[derive(Debug, Clone)]
pub struct FileWindowMapper {
    path: PathBuf,
}

impl FileWindowMapper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WindowMapper for FileWindowMapper {
    fn map(&self, len: usize) -> io::Result<Box<dyn MappedWindow>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        let metadata = file.metadata()?;
        // Character devices report a zero size; only regular files can be
        // checked up front.
        if metadata.is_file() && metadata.len() < len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} is {} bytes, window needs {}",
                    self.path.display(),
                    metadata.len(),
                    len
                ),
            ));
        }
        // SAFETY: the mapping is shared with whatever device backs the file;
        // all buffer access goes through byte-wise atomics in `MemoryRegion`.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        tracing::debug!(
            "mapped {} bytes of {} at {:p}",
            len,
            self.path.display(),
            ptr
        );
        Ok(Box::new(FileWindow {
            path: self.path.clone(),
            ptr,
            mmap,
        }))
    }
}

struct FileWindow {
    path: PathBuf,
    ptr: *mut u8,
    mmap: MmapMut,
}

// SAFETY: the window exclusively owns its mapping; the raw pointer is a
// cached `mmap.as_mut_ptr()` and is only dereferenced by the owning session.
unsafe impl Send for FileWindow {}

impl fmt::Debug for FileWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWindow")
            .field("path", &self.path)
            .field("ptr", &format!("{:p}", self.ptr))
            .field("len", &self.mmap.len())
            .finish()
    }
}

impl MappedWindow for FileWindow {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.mmap.len()
    }
}

impl Drop for FileWindow {
    fn drop(&mut self) {
        if let Err(e) = self.mmap.flush() {
            tracing::warn!("failed to flush window {}: {}", self.path.display(), e);
        }
        tracing::debug!("unmapping window {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;

    use super::*;

    #[test]
    fn test_map_file_window() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(64).unwrap();
        let mapper = FileWindowMapper::new(file.path());

        {
            let window = mapper.map(32).unwrap();
            assert_eq!(window.len(), 32);
            // SAFETY: the window is 32 bytes long and owned by this test.
            unsafe { std::ptr::write_bytes(window.as_ptr(), 0xab, 32) };
        }

        let mut contents = Vec::new();
        file.as_file_mut().seek(SeekFrom::Start(0)).unwrap();
        file.as_file_mut().read_to_end(&mut contents).unwrap();
        assert!(contents[..32].iter().all(|b| *b == 0xab));
        assert!(contents[32..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_map_short_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(8).unwrap();
        let err = FileWindowMapper::new(file.path()).map(16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_map_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileWindowMapper::new(dir.path().join("absent"))
            .map(16)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
