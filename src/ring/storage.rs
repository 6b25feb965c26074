//! Physical storage behind a ring.
//!
//! Ring offsets are monotone 64-bit byte positions; storage maps an offset
//! onto `offset % capacity` physical bytes while keeping every span
//! contiguous in the caller's address space. Two backings provide that
//! contract:
//!
//! - [`RingStorage::Mirrored`]: host rings with page-granular capacity get
//!   the doubled virtual mapping, so a span that crosses the physical wrap
//!   is contiguous for free.
//! - [`RingStorage::Staged`]: rings that cannot be double-mapped (device
//!   spaces, capacities that are not page-multiples) keep a plain buffer
//!   and bounce wrap-straddling spans through a scratch allocation. This
//!   requires `contiguous_span <= capacity / 2`, which the resize logic
//!   guarantees.

use crate::error::{Error, Result};
use crate::memory::{self, Allocation, MirroredBuffer, Space, ALIGNMENT};

/// Plain (singly-mapped) ring storage with scratch staging at the wrap.
pub(crate) struct StagedBuffer {
    data: Allocation,
    space: Space,
}

impl StagedBuffer {
    fn new(capacity: usize, space: Space) -> Result<Self> {
        Ok(Self {
            data: Allocation::zeroed(capacity, space)?,
            space,
        })
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Copy `len` bytes at wrapped position `offset` out into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` bytes in this buffer's space.
    unsafe fn gather(&self, offset: u64, dst: *mut u8, len: usize) -> Result<()> {
        let cap = self.capacity();
        let phys = (offset % cap as u64) as usize;
        let first = len.min(cap - phys);
        // SAFETY: both pieces lie inside the allocation; dst per caller.
        unsafe {
            memory::copy(dst, self.space, self.data.as_ptr().add(phys), self.space, first)?;
            if first < len {
                memory::copy(
                    dst.add(first),
                    self.space,
                    self.data.as_ptr(),
                    self.space,
                    len - first,
                )?;
            }
        }
        Ok(())
    }

    /// Copy `len` bytes from `src` into wrapped position `offset`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` bytes in this buffer's space.
    unsafe fn scatter(&self, offset: u64, src: *const u8, len: usize) -> Result<()> {
        let cap = self.capacity();
        let phys = (offset % cap as u64) as usize;
        let first = len.min(cap - phys);
        // SAFETY: both pieces lie inside the allocation; src per caller.
        unsafe {
            memory::copy(self.data.as_ptr().add(phys), self.space, src, self.space, first)?;
            if first < len {
                memory::copy(
                    self.data.as_ptr(),
                    self.space,
                    src.add(first),
                    self.space,
                    len - first,
                )?;
            }
        }
        Ok(())
    }
}

/// Memory backing one held span.
pub(crate) enum SpanMem {
    /// Pointer straight into ring storage.
    Direct(*mut u8),
    /// Bounce buffer for a wrap-straddling span on staged storage.
    Scratch(Allocation),
}

impl SpanMem {
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        match self {
            SpanMem::Direct(p) => *p,
            SpanMem::Scratch(a) => a.as_ptr(),
        }
    }
}

// SAFETY: the pointer addresses ring storage kept alive by the span's Arc
// on the ring; exclusivity of the addressed range is enforced by the
// reserve/commit and acquire/release protocol.
unsafe impl Send for SpanMem {}
unsafe impl Sync for SpanMem {}

/// Storage for one ring, selected per memory space at resize time.
pub(crate) enum RingStorage {
    Mirrored(MirroredBuffer),
    Staged(StagedBuffer),
}

impl RingStorage {
    /// Allocate storage of `capacity` bytes for `space`.
    ///
    /// Host rings take the mirrored path when the capacity is
    /// page-granular; anything else stages at the wrap.
    pub(crate) fn allocate(name: &str, space: Space, capacity: usize) -> Result<Self> {
        if space == Space::System && capacity % ALIGNMENT == 0 {
            match MirroredBuffer::new(name, capacity) {
                Ok(buf) => return Ok(RingStorage::Mirrored(buf)),
                Err(e) => {
                    tracing::warn!(ring = name, error = %e,
                        "mirrored mapping unavailable, staging at the wrap");
                }
            }
        }
        Ok(RingStorage::Staged(StagedBuffer::new(capacity, space)?))
    }

    pub(crate) fn capacity(&self) -> u64 {
        match self {
            RingStorage::Mirrored(b) => b.capacity() as u64,
            RingStorage::Staged(b) => b.capacity() as u64,
        }
    }

    fn staged_space(&self) -> Space {
        match self {
            RingStorage::Mirrored(_) => Space::System,
            RingStorage::Staged(b) => b.space,
        }
    }

    fn wraps(&self, offset: u64, len: usize) -> bool {
        let cap = self.capacity();
        (offset % cap) + len as u64 > cap
    }

    /// Prepare memory for a writer span at `offset`.
    ///
    /// The returned memory is exclusively the caller's until passed back to
    /// [`RingStorage::commit_write`].
    pub(crate) fn begin_write(&self, offset: u64, len: usize) -> Result<SpanMem> {
        match self {
            RingStorage::Mirrored(b) => Ok(SpanMem::Direct(b.wrapped_ptr(offset))),
            RingStorage::Staged(b) => {
                if self.wraps(offset, len) {
                    Ok(SpanMem::Scratch(Allocation::zeroed(len, self.staged_space())?))
                } else {
                    let phys = (offset % b.capacity() as u64) as usize;
                    // SAFETY: phys + len <= capacity, checked by wraps().
                    Ok(SpanMem::Direct(unsafe { b.data.as_ptr().add(phys) }))
                }
            }
        }
    }

    /// Flush a writer span's bytes into the ring.
    pub(crate) fn commit_write(&self, mem: &SpanMem, offset: u64, len: usize) -> Result<()> {
        match (self, mem) {
            (RingStorage::Staged(b), SpanMem::Scratch(scratch)) => {
                // SAFETY: scratch holds exactly `len` bytes staged by the writer.
                unsafe { b.scatter(offset, scratch.as_ptr(), len) }
            }
            _ => Ok(()),
        }
    }

    /// Materialize a reader span at `offset`.
    pub(crate) fn begin_read(&self, offset: u64, len: usize) -> Result<SpanMem> {
        match self {
            RingStorage::Mirrored(b) => Ok(SpanMem::Direct(b.wrapped_ptr(offset))),
            RingStorage::Staged(b) => {
                if self.wraps(offset, len) {
                    let scratch = Allocation::new(len, self.staged_space())?;
                    // SAFETY: scratch was just allocated with `len` bytes.
                    unsafe { b.gather(offset, scratch.as_ptr(), len)? };
                    Ok(SpanMem::Scratch(scratch))
                } else {
                    let phys = (offset % b.capacity() as u64) as usize;
                    // SAFETY: phys + len <= capacity, checked by wraps().
                    Ok(SpanMem::Direct(unsafe { b.data.as_ptr().add(phys) }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(mem: &SpanMem, len: usize, f: impl Fn(usize) -> u8) {
        let slice = unsafe { std::slice::from_raw_parts_mut(mem.as_ptr(), len) };
        for (i, b) in slice.iter_mut().enumerate() {
            *b = f(i);
        }
    }

    fn read_back(mem: &SpanMem, len: usize) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(mem.as_ptr(), len) }.to_vec()
    }

    #[test]
    fn test_mirrored_selected_for_page_multiple() {
        let storage = RingStorage::allocate("t", Space::System, 8192).unwrap();
        assert!(matches!(storage, RingStorage::Mirrored(_)));
    }

    #[test]
    fn test_staged_selected_for_odd_capacity() {
        let storage = RingStorage::allocate("t", Space::System, 2048).unwrap();
        assert!(matches!(storage, RingStorage::Staged(_)));
    }

    #[test]
    fn test_mirrored_wrap_round_trip() {
        let storage = RingStorage::allocate("t", Space::System, 4096).unwrap();
        // Span straddling the physical end.
        let offset = 4096 - 100;
        let w = storage.begin_write(offset as u64, 300).unwrap();
        fill(&w, 300, |i| (i % 256) as u8);
        storage.commit_write(&w, offset as u64, 300).unwrap();

        let r = storage.begin_read(offset as u64, 300).unwrap();
        let got = read_back(&r, 300);
        assert!(got.iter().enumerate().all(|(i, b)| *b == (i % 256) as u8));
    }

    #[test]
    fn test_staged_wrap_round_trip() {
        let storage = RingStorage::allocate("t", Space::System, 2048).unwrap();
        let offset = 2048 - 100;
        let w = storage.begin_write(offset as u64, 300).unwrap();
        assert!(matches!(w, SpanMem::Scratch(_)));
        fill(&w, 300, |i| (i * 7 % 256) as u8);
        storage.commit_write(&w, offset as u64, 300).unwrap();

        let r = storage.begin_read(offset as u64, 300).unwrap();
        let got = read_back(&r, 300);
        assert!(got.iter().enumerate().all(|(i, b)| *b == (i * 7 % 256) as u8));
    }

    #[test]
    fn test_staged_non_wrapping_is_direct() {
        let storage = RingStorage::allocate("t", Space::System, 2048).unwrap();
        let w = storage.begin_write(100, 500).unwrap();
        assert!(matches!(w, SpanMem::Direct(_)));
    }

    #[test]
    fn test_offsets_alias_modulo_capacity() {
        let storage = RingStorage::allocate("t", Space::System, 4096).unwrap();
        let w = storage.begin_write(0, 16).unwrap();
        fill(&w, 16, |_| 0xEE);
        storage.commit_write(&w, 0, 16).unwrap();

        // A full lap later the same physical bytes come back.
        let r = storage.begin_read(4096, 16).unwrap();
        assert_eq!(read_back(&r, 16), vec![0xEE; 16]);
    }
}
