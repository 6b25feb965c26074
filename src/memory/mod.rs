//! Memory-space-aware allocation and data transfer.
//!
//! Every byte buffer in Bifrost lives in one of four [`Space`]s: ordinary
//! system memory, CUDA pinned host memory, CUDA device memory, or CUDA
//! managed memory. This module provides a uniform allocate/free/copy/memset
//! surface that dispatches on the space tag, so ring storage and capture
//! slots never need to know where their bytes live.
//!
//! This build is CPU-only: the CUDA spaces are present in the dispatch
//! table but report [`Error::Unsupported`] at runtime. The dispatch
//! structure is what the rest of the crate programs against, so enabling a
//! device backend is a local change here.
//!
//! # Example
//!
//! ```rust
//! use bifrost::memory::{self, Space};
//!
//! let block = memory::alloc(4096, Space::System).unwrap();
//! unsafe {
//!     memory::memset(block.as_ptr(), Space::System, 0, 4096).unwrap();
//!     memory::free(block, 4096, Space::System);
//! }
//! ```

mod mirror;

pub use mirror::MirroredBuffer;

use crate::error::{Error, Result};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Alignment of all host allocations, in bytes.
///
/// One page: keeps DMA-friendly alignment for network payloads and lets a
/// future pinned-host backend register the same blocks without copying.
pub const ALIGNMENT: usize = 4096;

/// Locality class of a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    /// Ordinary host memory (aligned heap allocation).
    System,
    /// CUDA pinned (page-locked) host memory.
    CudaHost,
    /// CUDA device memory.
    Cuda,
    /// CUDA managed memory, migrated on demand.
    CudaManaged,
}

impl Space {
    /// Parse a space from its canonical lowercase name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "system" => Ok(Space::System),
            "cuda_host" => Ok(Space::CudaHost),
            "cuda" => Ok(Space::Cuda),
            "cuda_managed" => Ok(Space::CudaManaged),
            other => Err(Error::InvalidArgument(format!(
                "unknown memory space '{other}'"
            ))),
        }
    }

    /// Canonical lowercase name of this space.
    pub fn name(&self) -> &'static str {
        match self {
            Space::System => "system",
            Space::CudaHost => "cuda_host",
            Space::Cuda => "cuda",
            Space::CudaManaged => "cuda_managed",
        }
    }

    /// Whether pointers in this space can be dereferenced by host code.
    pub fn is_host_accessible(&self) -> bool {
        match self {
            Space::System | Space::CudaHost | Space::CudaManaged => true,
            Space::Cuda => false,
        }
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn layout_for(size: usize) -> Result<Layout> {
    Layout::from_size_align(size, ALIGNMENT)
        .map_err(|e| Error::InvalidArgument(format!("bad allocation size {size}: {e}")))
}

/// Allocate `size` bytes in `space`.
///
/// Host allocations are aligned to [`ALIGNMENT`]. Zero-size allocations are
/// rejected.
pub fn alloc(size: usize, space: Space) -> Result<NonNull<u8>> {
    if size == 0 {
        return Err(Error::InvalidArgument("allocation size must be > 0".into()));
    }
    match space {
        Space::System => {
            // SAFETY: layout has non-zero size, checked above.
            let ptr = unsafe { std::alloc::alloc(layout_for(size)?) };
            NonNull::new(ptr)
                .ok_or_else(|| Error::AllocationFailed(format!("system alloc of {size} bytes")))
        }
        Space::CudaHost | Space::Cuda | Space::CudaManaged => {
            Err(Error::Unsupported("CUDA memory spaces"))
        }
    }
}

/// Free a block previously returned by [`alloc`].
///
/// # Safety
///
/// `ptr` must have been returned by [`alloc`] with the same `size` and
/// `space`, and must not be used afterwards.
pub unsafe fn free(ptr: NonNull<u8>, size: usize, space: Space) {
    match space {
        Space::System => {
            if let Ok(layout) = layout_for(size) {
                // SAFETY: caller guarantees ptr/layout match the allocation.
                unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            }
        }
        // Nothing to free: alloc in these spaces never succeeds.
        Space::CudaHost | Space::Cuda | Space::CudaManaged => {}
    }
}

/// Determine the memory space of a pointer.
///
/// Without a device backend every valid pointer is host memory.
pub fn space_of(_ptr: *const u8) -> Space {
    Space::System
}

/// Copy `count` bytes between memory spaces.
///
/// Host-to-host copies are plain `memcpy`; any pair involving a CUDA space
/// dispatches to the device backend, which this build does not have.
///
/// # Safety
///
/// `dst` and `src` must be valid for `count` bytes in their respective
/// spaces and must not overlap.
pub unsafe fn copy(
    dst: *mut u8,
    dst_space: Space,
    src: *const u8,
    src_space: Space,
    count: usize,
) -> Result<()> {
    match (dst_space, src_space) {
        (Space::System, Space::System) => {
            // SAFETY: caller guarantees validity and non-overlap.
            unsafe { std::ptr::copy_nonoverlapping(src, dst, count) };
            Ok(())
        }
        (d, s) => Err(Error::InvalidSpace(format!(
            "copy {s} -> {d} requires a device backend"
        ))),
    }
}

/// Copy a 2-D region of `height` rows of `width` bytes between spaces,
/// with independent row strides.
///
/// # Safety
///
/// Every row addressed by `ptr + i * stride` must be valid for `width`
/// bytes in its space, and the regions must not overlap.
pub unsafe fn copy_2d(
    dst: *mut u8,
    dst_stride: usize,
    dst_space: Space,
    src: *const u8,
    src_stride: usize,
    src_space: Space,
    width: usize,
    height: usize,
) -> Result<()> {
    if width > dst_stride || width > src_stride {
        return Err(Error::InvalidArgument(format!(
            "row width {width} exceeds stride ({dst_stride}/{src_stride})"
        )));
    }
    for row in 0..height {
        // SAFETY: caller guarantees each row is valid for `width` bytes.
        unsafe {
            copy(
                dst.add(row * dst_stride),
                dst_space,
                src.add(row * src_stride),
                src_space,
                width,
            )?;
        }
    }
    Ok(())
}

/// Fill `count` bytes at `ptr` with `value`.
///
/// # Safety
///
/// `ptr` must be valid for `count` writable bytes in `space`.
pub unsafe fn memset(ptr: *mut u8, space: Space, value: u8, count: usize) -> Result<()> {
    match space {
        Space::System => {
            // SAFETY: caller guarantees validity.
            unsafe { std::ptr::write_bytes(ptr, value, count) };
            Ok(())
        }
        Space::CudaHost | Space::Cuda | Space::CudaManaged => {
            Err(Error::Unsupported("CUDA memory spaces"))
        }
    }
}

/// An owned allocation in a single memory space.
///
/// Thin RAII wrapper over [`alloc`]/[`free`] used for ring storage bounce
/// buffers and capture slots.
pub struct Allocation {
    ptr: NonNull<u8>,
    size: usize,
    space: Space,
}

impl Allocation {
    /// Allocate `size` bytes in `space`.
    pub fn new(size: usize, space: Space) -> Result<Self> {
        let ptr = alloc(size, space)?;
        Ok(Self { ptr, size, space })
    }

    /// Allocate and zero-fill.
    pub fn zeroed(size: usize, space: Space) -> Result<Self> {
        let this = Self::new(size, space)?;
        // SAFETY: freshly allocated, exclusively owned.
        unsafe { memset(this.ptr.as_ptr(), space, 0, size)? };
        Ok(this)
    }

    /// Base pointer of the allocation.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True if the allocation has zero length (never: rejected at alloc).
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The space this allocation lives in.
    pub fn space(&self) -> Space {
        self.space
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: ptr/size/space recorded at allocation time.
        unsafe { free(self.ptr, self.size, self.space) };
    }
}

// SAFETY: the allocation is plain memory with no thread-local state; access
// synchronization is the responsibility of whoever shares it.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_page_aligned() {
        let block = alloc(100, Space::System).unwrap();
        assert_eq!(block.as_ptr() as usize % ALIGNMENT, 0);
        unsafe { free(block, 100, Space::System) };
    }

    #[test]
    fn test_alloc_zero_size_fails() {
        assert!(alloc(0, Space::System).is_err());
    }

    #[test]
    fn test_device_space_unsupported() {
        assert!(matches!(
            alloc(64, Space::Cuda),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            alloc(64, Space::CudaHost),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_copy_host_to_host() {
        let src = Allocation::new(64, Space::System).unwrap();
        let dst = Allocation::new(64, Space::System).unwrap();
        unsafe {
            memset(src.as_ptr(), Space::System, 0xAB, 64).unwrap();
            copy(dst.as_ptr(), Space::System, src.as_ptr(), Space::System, 64).unwrap();
            assert_eq!(std::slice::from_raw_parts(dst.as_ptr(), 64), &[0xAB; 64]);
        }
    }

    #[test]
    fn test_copy_cross_space_rejected() {
        let a = Allocation::new(16, Space::System).unwrap();
        let err = unsafe {
            copy(a.as_ptr(), Space::Cuda, a.as_ptr(), Space::System, 16).unwrap_err()
        };
        assert!(matches!(err, Error::InvalidSpace(_)));
    }

    #[test]
    fn test_copy_2d_strided() {
        let src = Allocation::zeroed(64, Space::System).unwrap();
        let dst = Allocation::zeroed(64, Space::System).unwrap();
        unsafe {
            // Two rows of 4 bytes at stride 8 in src, packed stride 4 in dst.
            for i in 0..16u8 {
                *src.as_ptr().add(i as usize) = i;
            }
            copy_2d(
                dst.as_ptr(),
                4,
                Space::System,
                src.as_ptr(),
                8,
                Space::System,
                4,
                2,
            )
            .unwrap();
            let got = std::slice::from_raw_parts(dst.as_ptr(), 8);
            assert_eq!(got, &[0, 1, 2, 3, 8, 9, 10, 11]);
        }
    }

    #[test]
    fn test_space_names_round_trip() {
        for space in [Space::System, Space::CudaHost, Space::Cuda, Space::CudaManaged] {
            assert_eq!(Space::from_name(space.name()).unwrap(), space);
        }
        assert!(Space::from_name("vram").is_err());
    }
}
