//! Doubled virtual mapping for seamless ring wraparound.
//!
//! A [`MirroredBuffer`] is `capacity` physical bytes made visible twice in
//! one contiguous virtual range: `base[i]` and `base[i + capacity]` address
//! the same byte for every `i < capacity`. A reader or writer positioned at
//! any `offset % capacity` can therefore touch up to `capacity` bytes
//! without ever seeing the physical wrap.
//!
//! The mapping is built from an anonymous memfd: reserve `2 * capacity` of
//! virtual address space, then map the same `capacity`-byte file into both
//! halves with `MAP_FIXED`.
//!
//! ```text
//! virtual:  ┌────────── capacity ──────────┬────────── capacity ──────────┐
//!           │            map #1            │            map #2            │
//!           └──────────────┬───────────────┴───────────────┬──────────────┘
//! physical:                └────────── same memfd ─────────┘
//! ```

use crate::error::{Error, Result};
use crate::memory::ALIGNMENT;
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// A `capacity`-byte buffer mapped twice into adjacent virtual pages.
pub struct MirroredBuffer {
    /// The memfd backing both mappings.
    fd: OwnedFd,
    /// Base of the doubled virtual range (`2 * capacity` bytes).
    base: NonNull<u8>,
    /// Physical size of the buffer.
    capacity: usize,
}

impl MirroredBuffer {
    /// Create a mirrored buffer of `capacity` bytes.
    ///
    /// `capacity` must be a non-zero multiple of the page size; callers that
    /// cannot meet that requirement should fall back to staged storage.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is not page-granular or if any of
    /// `memfd_create`, `ftruncate`, or `mmap` fails.
    pub fn new(name: &str, capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity % ALIGNMENT != 0 {
            return Err(Error::InvalidArgument(format!(
                "mirrored capacity {capacity} is not a multiple of {ALIGNMENT}"
            )));
        }

        let cname =
            CString::new(name).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, capacity as u64)?;

        // Reserve the doubled range first so both fixed mappings land
        // adjacent to each other.
        let base = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                2 * capacity,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )?
        };

        let map_half = |at: *mut std::ffi::c_void| -> Result<()> {
            // SAFETY: `at` lies inside the reservation we just made;
            // MAP_FIXED replaces exactly `capacity` bytes of it.
            let mapped = unsafe {
                rustix::mm::mmap(
                    at,
                    capacity,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::SHARED | MapFlags::FIXED,
                    &fd,
                    0,
                )?
            };
            debug_assert_eq!(mapped, at);
            Ok(())
        };

        let mirror = unsafe { base.cast::<u8>().add(capacity).cast() };
        if let Err(e) = map_half(base).and_then(|_| map_half(mirror)) {
            // SAFETY: unmaps only the reservation made above.
            unsafe {
                let _ = rustix::mm::munmap(base, 2 * capacity);
            }
            return Err(e);
        }

        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        Ok(Self { fd, base, capacity })
    }

    /// Physical size of the buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pointer to the byte at `offset % capacity`, valid for up to
    /// `capacity` contiguous bytes through the mirror.
    pub fn wrapped_ptr(&self, offset: u64) -> *mut u8 {
        let physical = (offset % self.capacity as u64) as usize;
        // SAFETY: physical < capacity, and the doubled mapping makes
        // [physical, physical + capacity) addressable.
        unsafe { self.base.as_ptr().add(physical) }
    }

    /// The memfd backing this buffer.
    pub fn as_fd(&self) -> &OwnedFd {
        &self.fd
    }
}

impl Drop for MirroredBuffer {
    fn drop(&mut self) {
        // SAFETY: base/2*capacity is exactly the range mapped in `new`.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), 2 * self.capacity);
        }
    }
}

// SAFETY: the mapping is plain shared memory; the fd is kernel
// reference-counted and no thread-local state is held.
unsafe impl Send for MirroredBuffer {}
unsafe impl Sync for MirroredBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_creation() {
        let buf = MirroredBuffer::new("test-mirror", 4096).unwrap();
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    fn test_mirror_rejects_unaligned_capacity() {
        assert!(MirroredBuffer::new("test", 2048).is_err());
        assert!(MirroredBuffer::new("test", 0).is_err());
        assert!(MirroredBuffer::new("test", 4097).is_err());
    }

    #[test]
    fn test_mirror_aliases_physical_bytes() {
        let buf = MirroredBuffer::new("test-alias", 4096).unwrap();
        unsafe {
            *buf.wrapped_ptr(0) = 0x5A;
            *buf.wrapped_ptr(4095) = 0xA5;
            // Same bytes through the second mapping.
            assert_eq!(*buf.wrapped_ptr(0).add(4096), 0x5A);
            assert_eq!(*buf.wrapped_ptr(4095).add(4096), 0xA5);
        }
    }

    #[test]
    fn test_mirror_contiguous_across_wrap() {
        let buf = MirroredBuffer::new("test-wrap", 4096).unwrap();
        // Write 256 bytes starting 128 before the physical end.
        let start = 4096 - 128;
        unsafe {
            let ptr = buf.wrapped_ptr(start as u64);
            for i in 0..256u16 {
                *ptr.add(i as usize) = (i % 251) as u8;
            }
            // The tail of the write landed at the physical start.
            assert_eq!(*buf.wrapped_ptr(0), (128 % 251) as u8);
            // And reads through the wrapped pointer see one contiguous run.
            let back = std::slice::from_raw_parts(buf.wrapped_ptr(start as u64), 256);
            for (i, b) in back.iter().enumerate() {
                assert_eq!(*b, (i % 251) as u8);
            }
        }
    }

    #[test]
    fn test_mirror_offset_wraps_modulo_capacity() {
        let buf = MirroredBuffer::new("test-mod", 4096).unwrap();
        assert_eq!(buf.wrapped_ptr(0), buf.wrapped_ptr(4096));
        assert_eq!(buf.wrapped_ptr(100), buf.wrapped_ptr(4096 + 100));
    }
}
