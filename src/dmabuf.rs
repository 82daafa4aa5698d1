//! Shareable buffer handles
//!
//! A [`DmaBufHandle`] wraps an exportable file descriptor to device/CPU
//! shareable memory. The core never allocates raw memory itself: handles come
//! from a [`DmaBufAllocator`], which on a real system fronts a dmabuf heap.
//! [`MemfdAllocator`] is a software allocator producing real, mappable,
//! exportable fds; the emulated device and the test suite run on it.

use crate::error::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Allocator seam for shareable buffer memory
pub trait DmaBufAllocator: Send + Sync {
    /// Allocate a buffer of at least `size` bytes
    fn alloc(&self, size: usize) -> Result<DmaBufHandle>;
}

/// CPU mapping of a buffer, valid until unmapped
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

/// An opaque handle to shareable memory
///
/// Owns the underlying descriptor. `len` tracks the bytes in use, which never
/// exceeds the allocated `size`. CPU access requires an explicit [`map`]
/// call; the mapping is released on [`unmap`] or drop.
///
/// [`map`]: DmaBufHandle::map
/// [`unmap`]: DmaBufHandle::unmap
#[derive(Debug)]
pub struct DmaBufHandle {
    fd: OwnedFd,
    size: usize,
    len: usize,
    mapping: Option<Mapping>,
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping").field("len", &self.len).finish()
    }
}

// Safety: the mapping pointer is exclusively owned by this handle and only
// dereferenced through &self/&mut self access.
unsafe impl Send for DmaBufHandle {}
unsafe impl Sync for DmaBufHandle {}

impl DmaBufHandle {
    /// Wrap an allocator-produced descriptor
    pub fn new(fd: OwnedFd, size: usize) -> Self {
        DmaBufHandle {
            fd,
            size,
            len: 0,
            mapping: None,
        }
    }

    /// Import an externally-owned descriptor
    ///
    /// # Safety contract
    /// `fd` must reference mappable shareable memory of at least `size`
    /// bytes; the handle takes ownership of it.
    pub fn import(fd: OwnedFd, size: usize) -> Self {
        DmaBufHandle::new(fd, size)
    }

    /// Allocated capacity in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes currently in use
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether any bytes are in use
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record the number of bytes in use
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.size {
            return Err(Error::invalid_input(format!(
                "length {} exceeds buffer capacity {}",
                len, self.size
            )));
        }
        self.len = len;
        Ok(())
    }

    /// Raw descriptor, for queueing into the device; no ownership transfer
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicate the descriptor for hand-off to another consumer
    ///
    /// The duplicate references the same underlying memory; the caller owns
    /// the returned fd.
    pub fn dup_fd(&self) -> Result<OwnedFd> {
        let fd = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::from_errno("dup"));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Map the buffer for CPU access
    ///
    /// Idempotent: mapping an already-mapped handle is a no-op.
    pub fn map(&mut self) -> Result<()> {
        if self.mapping.is_some() {
            return Ok(());
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::from_errno("mmap"));
        }
        self.mapping = Some(Mapping {
            ptr: ptr as *mut u8,
            len: self.size,
        });
        Ok(())
    }

    /// Release the CPU mapping
    pub fn unmap(&mut self) {
        if let Some(m) = self.mapping.take() {
            unsafe {
                libc::munmap(m.ptr as *mut libc::c_void, m.len);
            }
        }
    }

    /// Whether a CPU mapping is active
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// CPU-visible contents; only valid while mapped
    pub fn data(&self) -> Option<&[u8]> {
        self.mapping
            .as_ref()
            .map(|m| unsafe { std::slice::from_raw_parts(m.ptr, m.len) })
    }

    /// Mutable CPU-visible contents; only valid while mapped
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.mapping
            .as_mut()
            .map(|m| unsafe { std::slice::from_raw_parts_mut(m.ptr, m.len) })
    }
}

impl Drop for DmaBufHandle {
    fn drop(&mut self) {
        self.unmap();
    }
}

/// Software allocator producing memfd-backed handles
///
/// Stands in for a platform dmabuf heap where none is available. The fds it
/// produces behave like dmabuf fds for every operation this crate performs:
/// mmap, dup, cross-handle content sharing.
#[derive(Debug, Default)]
pub struct MemfdAllocator {
    _priv: (),
}

impl MemfdAllocator {
    /// Create a memfd allocator
    pub fn new() -> Self {
        MemfdAllocator { _priv: () }
    }
}

impl DmaBufAllocator for MemfdAllocator {
    fn alloc(&self, size: usize) -> Result<DmaBufHandle> {
        if size == 0 {
            return Err(Error::invalid_input("zero-sized buffer"));
        }
        let name = b"vidreq-buf\0";
        let fd = unsafe {
            libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(Error::allocation(format!(
                "memfd_create: {}",
                std::io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            return Err(Error::allocation(format!(
                "ftruncate to {}: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }
        Ok(DmaBufHandle::new(fd, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_map_write_read() {
        let alloc = MemfdAllocator::new();
        let mut buf = alloc.alloc(4096).unwrap();
        assert_eq!(buf.size(), 4096);
        assert!(buf.data().is_none());

        buf.map().unwrap();
        buf.data_mut().unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&buf.data().unwrap()[..4], &[1, 2, 3, 4]);

        buf.unmap();
        assert!(buf.data().is_none());
    }

    #[test]
    fn test_dup_fd_shares_memory() {
        let alloc = MemfdAllocator::new();
        let mut buf = alloc.alloc(4096).unwrap();
        buf.map().unwrap();
        buf.data_mut().unwrap()[..5].copy_from_slice(b"hello");

        // A duplicated descriptor must reference the same memory
        let dup = buf.dup_fd().unwrap();
        let mut imported = DmaBufHandle::import(dup, 4096);
        imported.map().unwrap();
        assert_eq!(&imported.data().unwrap()[..5], b"hello");

        // Writes through the import are visible through the original
        imported.data_mut().unwrap()[0] = b'H';
        assert_eq!(&buf.data().unwrap()[..5], b"Hello");
    }

    #[test]
    fn test_set_len_bounds() {
        let alloc = MemfdAllocator::new();
        let mut buf = alloc.alloc(100).unwrap();
        assert!(buf.set_len(100).is_ok());
        assert!(buf.set_len(101).is_err());
        assert_eq!(buf.len(), 100);
    }

    #[test]
    fn test_zero_alloc_rejected() {
        assert!(MemfdAllocator::new().alloc(0).is_err());
    }
}
