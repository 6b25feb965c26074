//! Writer side of the sequence/span protocol.
//!
//! A [`RingWriter`] is the exclusive writer token for one ring epoch. It
//! begins sequences; each [`WriteSequence`] hands out [`WriteSpan`]s via
//! reserve/commit. Reservations advance the reservation cursor immediately
//! (blocking if a guaranteed reader would be overrun), commits advance the
//! commit cursor and wake readers. Spans may be committed out of order;
//! the commit cursor advances once the committed prefix is contiguous.

use super::storage::{RingStorage, SpanMem};
use super::{Ring, Wait};
use crate::error::{Error, Result};
use crate::telemetry;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

/// Exclusive writer token for a ring.
///
/// Obtained from [`Ring::begin_writing`]; dropped (or explicitly closed)
/// to end the writing epoch. Ending the epoch ends any open sequence, so
/// readers waiting on it observe end-of-data.
pub struct RingWriter {
    ring: Ring,
    closed: bool,
}

impl RingWriter {
    pub(crate) fn new(ring: Ring) -> Self {
        Self { ring, closed: false }
    }

    /// The ring this writer belongs to.
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Begin a new sequence at the current reservation cursor.
    ///
    /// Any sequence still open is ended first: a sequence runs until the
    /// writer begins the next one or closes the epoch. Readers parked on
    /// "next sequence" are woken.
    ///
    /// `time_tag` is expected to be non-decreasing within one epoch; a
    /// regression is logged but not rejected.
    pub fn begin_sequence(
        &mut self,
        name: impl Into<String>,
        time_tag: u64,
        header: &[u8],
    ) -> Result<WriteSequence> {
        let name = name.into();
        let shared = &self.ring.shared;
        let mut state = shared.lock();

        if let Some(open) = state.open_seq.take() {
            let end = state.reserve_head;
            if let Some(seq) = state.registry.get_mut(open) {
                seq.end = Some(end);
            }
        }
        if let Some(prev) = state.registry.latest() {
            if time_tag < prev.time_tag {
                tracing::warn!(
                    ring = %shared.name,
                    sequence = %name,
                    time_tag,
                    prev = prev.time_tag,
                    "time tag regressed within a writing epoch"
                );
            }
        }

        let begin = state.reserve_head;
        let id = state
            .registry
            .begin(name.clone(), time_tag, Arc::from(header), begin);
        state.open_seq = Some(id);
        state.prune_registry();
        drop(state);

        tracing::debug!(ring = %shared.name, sequence = %name, time_tag, "sequence begun");
        shared.data_available.notify_all();
        Ok(WriteSequence {
            ring: self.ring.clone(),
            seq_id: id,
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let shared = &self.ring.shared;
        let mut state = shared.lock();
        if let Some(open) = state.open_seq.take() {
            let end = state.reserve_head;
            if let Some(seq) = state.registry.get_mut(open) {
                seq.end = Some(end);
            }
        }
        state.writing = false;
        state.eod = true;
        state.prune_registry();
        drop(state);
        tracing::debug!(ring = %shared.name, "writer closed");
        shared.data_available.notify_all();
    }

    /// End the writing epoch explicitly.
    pub fn end_writing(mut self) {
        self.close();
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// A sequence open for writing.
///
/// Dropping the handle ends the sequence unless a later
/// [`RingWriter::begin_sequence`] already did.
pub struct WriteSequence {
    ring: Ring,
    seq_id: u64,
}

impl WriteSequence {
    /// This sequence's registry id.
    pub fn id(&self) -> u64 {
        self.seq_id
    }

    /// Reserve `n` contiguous bytes, blocking while a guaranteed reader
    /// would be overrun.
    pub fn reserve(&self, n: usize) -> Result<WriteSpan> {
        self.reserve_inner(n, Wait::Block)
    }

    /// Like [`WriteSequence::reserve`] but gives up after `timeout`.
    pub fn reserve_timeout(&self, n: usize, timeout: Duration) -> Result<WriteSpan> {
        self.reserve_inner(n, Wait::Timeout(timeout))
    }

    /// Like [`WriteSequence::reserve`] but returns `WouldBlock` instead of
    /// waiting.
    pub fn try_reserve(&self, n: usize) -> Result<WriteSpan> {
        self.reserve_inner(n, Wait::NonBlock)
    }

    fn reserve_inner(&self, n: usize, wait: Wait) -> Result<WriteSpan> {
        if n == 0 {
            return Err(Error::InvalidArgument("cannot reserve an empty span".into()));
        }
        let deadline = wait.deadline();
        let shared = &self.ring.shared;
        let mut state = shared.lock();
        loop {
            if state.interrupted {
                return Err(Error::Interrupted);
            }
            if state.open_seq != Some(self.seq_id) {
                return Err(Error::InvalidState(
                    "sequence is no longer open for writing".into(),
                ));
            }
            if state.storage.is_none() {
                return Err(Error::InvalidState(
                    "ring has no storage; call resize first".into(),
                ));
            }
            if n as u64 > state.contiguous {
                return Err(Error::InvalidArgument(format!(
                    "reserve of {n} bytes exceeds the contiguous span ({})",
                    state.contiguous
                )));
            }

            // Backpressure: never move more than one capacity ahead of the
            // slowest guaranteed reader.
            let blocked = state
                .min_guaranteed_cursor()
                .is_some_and(|min| state.reserve_head + n as u64 > min + state.capacity);
            if !blocked {
                break;
            }
            match wait {
                Wait::NonBlock => return Err(Error::WouldBlock),
                _ => state = shared.park(state, &shared.space_available, deadline)?,
            }
        }

        let offset = state.reserve_head;
        state.reserve_head += n as u64;
        state.prune_registry();
        let storage = state.storage.clone().expect("checked above");
        drop(state);

        match storage.begin_write(offset, n) {
            Ok(mem) => Ok(WriteSpan {
                ring: self.ring.clone(),
                offset,
                len: n,
                mem,
                storage,
                committed: false,
            }),
            Err(e) => {
                // The reservation is already visible; close the hole so the
                // commit cursor can keep advancing.
                tracing::error!(ring = %shared.name, offset, len = n, error = %e,
                    "failed to back a reserved span");
                let mut state = shared.lock();
                commit_range(&mut state, offset, n as u64);
                drop(state);
                shared.data_available.notify_all();
                Err(e)
            }
        }
    }

    /// End this sequence, recording its end offset.
    ///
    /// A no-op if a later `begin_sequence` already ended it.
    pub fn end(self) {
        // Drop does the work.
    }
}

impl Drop for WriteSequence {
    fn drop(&mut self) {
        let shared = &self.ring.shared;
        let mut state = shared.lock();
        if state.open_seq == Some(self.seq_id) {
            state.open_seq = None;
            let end = state.reserve_head;
            if let Some(seq) = state.registry.get_mut(self.seq_id) {
                seq.end = Some(end);
                tracing::debug!(ring = %shared.name, sequence = %seq.name, end, "sequence ended");
            }
            state.prune_registry();
            drop(state);
            shared.data_available.notify_all();
        }
    }
}

fn commit_range(state: &mut super::RingState, offset: u64, len: u64) {
    state.pending.insert(offset, len);
    while let Some(len) = state.pending.remove(&state.commit_head) {
        state.commit_head += len;
    }
}

/// A reserved, writable byte range of a ring.
///
/// The span is exclusively the writer's until committed. Committing (or
/// dropping, which commits with a warning) makes the bytes readable once
/// all earlier reservations have also committed.
///
/// For host-accessible spaces the span derefs to a byte slice; for device
/// spaces use [`WriteSpan::as_mut_ptr`] and a device copy.
pub struct WriteSpan {
    ring: Ring,
    offset: u64,
    len: usize,
    mem: SpanMem,
    storage: Arc<RingStorage>,
    committed: bool,
}

impl WriteSpan {
    /// Ring byte offset of the first byte of this span.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Span length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the span is empty (never: zero-size reserves are rejected).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the span's contiguous bytes.
    pub fn as_ptr(&self) -> *const u8 {
        self.mem.as_ptr()
    }

    /// Raw mutable pointer to the span's contiguous bytes.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mem.as_ptr()
    }

    /// Mark the span's bytes readable.
    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;

        // Payload flush happens outside the ring lock; the range is still
        // exclusively ours.
        self.storage.commit_write(&self.mem, self.offset, self.len)?;

        let shared = &self.ring.shared;
        let mut state = shared.lock();
        commit_range(&mut state, self.offset, self.len as u64);
        let head = state.commit_head;
        let tail = state.valid_tail();
        drop(state);
        shared.data_available.notify_all();
        telemetry::ring_cursors(&shared.name, head, tail);
        Ok(())
    }
}

impl fmt::Debug for WriteSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSpan")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("committed", &self.committed)
            .finish()
    }
}

impl Deref for WriteSpan {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the span's range is exclusively owned between reserve and
        // commit, and `mem` points at `len` contiguous bytes.
        unsafe { std::slice::from_raw_parts(self.mem.as_ptr(), self.len) }
    }
}

impl DerefMut for WriteSpan {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above.
        unsafe { std::slice::from_raw_parts_mut(self.mem.as_ptr(), self.len) }
    }
}

impl Drop for WriteSpan {
    fn drop(&mut self) {
        if !self.committed {
            tracing::warn!(
                ring = %self.ring.shared.name,
                offset = self.offset,
                len = self.len,
                "write span dropped without commit; committing as-is"
            );
            let _ = self.commit_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Space;

    fn ring() -> Ring {
        let ring = Ring::new("writer-tests", Space::System);
        ring.resize(1024, 4096, 1).unwrap();
        ring
    }

    #[test]
    fn test_reserve_zero_rejected() {
        let ring = ring();
        let mut writer = ring.begin_writing().unwrap();
        let seq = writer.begin_sequence("s", 0, b"").unwrap();
        assert!(matches!(seq.reserve(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_reserve_beyond_contiguous_rejected() {
        let ring = ring();
        let mut writer = ring.begin_writing().unwrap();
        let seq = writer.begin_sequence("s", 0, b"").unwrap();
        assert!(seq.reserve(1024).is_ok());
        assert!(matches!(
            seq.reserve(1025),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reserve_without_storage_rejected() {
        let ring = Ring::new("no-storage", Space::System);
        let mut writer = ring.begin_writing().unwrap();
        let seq = writer.begin_sequence("s", 0, b"").unwrap();
        assert!(matches!(seq.reserve(64), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_out_of_order_commit_advances_contiguously() {
        let ring = ring();
        let mut writer = ring.begin_writing().unwrap();
        let seq = writer.begin_sequence("s", 0, b"").unwrap();

        let a = seq.reserve(512).unwrap();
        let b = seq.reserve(512).unwrap();
        assert_eq!(ring.head(), 0);

        // Committing the later span first leaves the cursor parked.
        b.commit().unwrap();
        assert_eq!(ring.head(), 0);
        a.commit().unwrap();
        assert_eq!(ring.head(), 1024);
    }

    #[test]
    fn test_begin_sequence_ends_previous() {
        let ring = ring();
        let mut writer = ring.begin_writing().unwrap();
        let first = writer.begin_sequence("one", 10, b"").unwrap();
        let span = first.reserve(256).unwrap();
        span.commit().unwrap();

        let _second = writer.begin_sequence("two", 20, b"").unwrap();
        // The stale handle can no longer reserve.
        assert!(matches!(first.reserve(64), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_span_drop_commits() {
        let ring = ring();
        let mut writer = ring.begin_writing().unwrap();
        let seq = writer.begin_sequence("s", 0, b"").unwrap();
        {
            let mut span = seq.reserve(128).unwrap();
            span[..4].copy_from_slice(b"data");
        }
        assert_eq!(ring.head(), 128);
    }
}
