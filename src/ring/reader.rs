//! Reader side of the sequence/span protocol.
//!
//! A [`RingReader`] registers a cursor with the ring; [`ReadSequence`]
//! walks the sequence registry; [`ReadSpan`]s are acquired in order and
//! released when consumed. Guaranteed readers hold the writer back via
//! their cursor; opportunistic readers observe [`Error::Overrun`] and keep
//! going.

use super::storage::{RingStorage, SpanMem};
use super::{Ring, Wait};
use crate::error::{Error, Result};
use crate::telemetry;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// Immutable description of a sequence, snapshotted from the registry.
#[derive(Debug, Clone)]
pub struct SequenceInfo {
    /// Registry id; strictly increasing per ring.
    pub id: u64,
    /// Name given by the writer.
    pub name: String,
    /// The writer's 64-bit time tag.
    pub time_tag: u64,
    /// Opaque header bytes.
    pub header: Arc<[u8]>,
}

/// A reader cursor registered with a ring.
pub struct RingReader {
    ring: Ring,
    id: u64,
    guaranteed: bool,
}

impl RingReader {
    pub(crate) fn new(ring: Ring, id: u64, guaranteed: bool) -> Self {
        Self { ring, id, guaranteed }
    }

    /// The ring this reader belongs to.
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Whether this reader currently participates in backpressure.
    pub fn is_guaranteed(&self) -> bool {
        self.guaranteed
    }

    /// Change the guarantee flag mid-flight.
    ///
    /// Re-acquiring the guarantee snaps the cursor forward to the oldest
    /// valid byte so the writer is not stalled retroactively; dropping it
    /// may unblock a waiting writer immediately.
    pub fn set_guaranteed(&mut self, guaranteed: bool) {
        let shared = &self.ring.shared;
        let mut state = shared.lock();
        let tail = state.valid_tail();
        if let Some(reader) = state.readers.get_mut(&self.id) {
            reader.guaranteed = guaranteed;
            if guaranteed {
                reader.read_offset = reader.read_offset.max(tail);
            }
        }
        drop(state);
        self.guaranteed = guaranteed;
        if !guaranteed {
            shared.space_available.notify_all();
        }
    }

    /// Open the most recently begun sequence, blocking until one exists.
    pub fn open_latest(&self) -> Result<ReadSequence> {
        self.open_scan(Wait::Block, |state| state.registry.latest().map(|s| s.id))
    }

    /// Like [`RingReader::open_latest`] with a timeout.
    pub fn open_latest_timeout(&self, timeout: Duration) -> Result<ReadSequence> {
        self.open_scan(Wait::Timeout(timeout), |state| {
            state.registry.latest().map(|s| s.id)
        })
    }

    /// Open the oldest live sequence, blocking until one exists.
    pub fn open_earliest(&self) -> Result<ReadSequence> {
        self.open_scan(Wait::Block, |state| state.registry.earliest().map(|s| s.id))
    }

    /// Like [`RingReader::open_earliest`] with a timeout.
    pub fn open_earliest_timeout(&self, timeout: Duration) -> Result<ReadSequence> {
        self.open_scan(Wait::Timeout(timeout), |state| {
            state.registry.earliest().map(|s| s.id)
        })
    }

    /// Open the live sequence with the given name.
    pub fn open_sequence(&self, name: &str) -> Result<ReadSequence> {
        let mut state = self.ring.shared.lock();
        let id = state
            .registry
            .find_by_name(name)
            .map(|s| s.id)
            .ok_or_else(|| Error::InvalidArgument(format!("no live sequence named '{name}'")))?;
        self.attach(&mut state, id)
    }

    /// Open the live sequence covering `time_tag` (largest tag not after
    /// the request).
    pub fn open_at(&self, time_tag: u64) -> Result<ReadSequence> {
        let mut state = self.ring.shared.lock();
        let id = state
            .registry
            .find_at_time(time_tag)
            .map(|s| s.id)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no live sequence at time tag {time_tag}"))
            })?;
        self.attach(&mut state, id)
    }

    fn open_scan(
        &self,
        wait: Wait,
        pick: impl Fn(&super::RingState) -> Option<u64>,
    ) -> Result<ReadSequence> {
        let deadline = wait.deadline();
        let shared = &self.ring.shared;
        let mut state = shared.lock();
        loop {
            if state.interrupted {
                return Err(Error::Interrupted);
            }
            if let Some(id) = pick(&state) {
                return self.attach(&mut state, id);
            }
            if state.eod {
                return Err(Error::EndOfData);
            }
            match wait {
                Wait::NonBlock => return Err(Error::WouldBlock),
                _ => state = shared.park(state, &shared.data_available, deadline)?,
            }
        }
    }

    fn attach(
        &self,
        state: &mut super::RingState,
        seq_id: u64,
    ) -> Result<ReadSequence> {
        let tail = state.valid_tail();
        let begin = state
            .registry
            .get(seq_id)
            .map(|s| s.begin)
            .ok_or_else(|| Error::InvalidState("sequence expired".into()))?;
        state
            .registry
            .get_mut(seq_id)
            .expect("checked above")
            .nreader += 1;
        if let Some(reader) = state.readers.get_mut(&self.id) {
            reader.read_offset = begin.max(tail);
        }
        Ok(ReadSequence {
            ring: self.ring.clone(),
            reader_id: self.id,
            seq_id,
        })
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        let shared = &self.ring.shared;
        let mut state = shared.lock();
        state.readers.remove(&self.id);
        state.prune_registry();
        drop(state);
        // A guaranteed cursor may have been the one holding the writer.
        shared.space_available.notify_all();
        tracing::debug!(ring = %shared.name, reader = self.id, "reader closed");
    }
}

/// A sequence opened for reading by one reader.
pub struct ReadSequence {
    ring: Ring,
    reader_id: u64,
    seq_id: u64,
}

impl ReadSequence {
    /// Snapshot this sequence's metadata.
    ///
    /// Fails with `InvalidState` if the record has been pruned.
    pub fn info(&self) -> Result<SequenceInfo> {
        let state = self.ring.shared.lock();
        let seq = state
            .registry
            .get(self.seq_id)
            .ok_or_else(|| Error::InvalidState("sequence expired".into()))?;
        Ok(SequenceInfo {
            id: seq.id,
            name: seq.name.clone(),
            time_tag: seq.time_tag,
            header: Arc::clone(&seq.header),
        })
    }

    /// The sequence's opaque header bytes.
    pub fn header(&self) -> Result<Arc<[u8]>> {
        Ok(self.info()?.header)
    }

    /// Acquire the next `n` committed bytes, blocking until they commit or
    /// the sequence ends (in which case the span is truncated to what
    /// remains, and a subsequent acquire returns `EndOfData`).
    pub fn acquire(&mut self, n: usize) -> Result<ReadSpan> {
        self.acquire_inner(n, Wait::Block)
    }

    /// Like [`ReadSequence::acquire`] but gives up after `timeout`.
    pub fn acquire_timeout(&mut self, n: usize, timeout: Duration) -> Result<ReadSpan> {
        self.acquire_inner(n, Wait::Timeout(timeout))
    }

    /// Like [`ReadSequence::acquire`] but returns `WouldBlock` instead of
    /// waiting.
    pub fn try_acquire(&mut self, n: usize) -> Result<ReadSpan> {
        self.acquire_inner(n, Wait::NonBlock)
    }

    fn acquire_inner(&mut self, n: usize, wait: Wait) -> Result<ReadSpan> {
        if n == 0 {
            return Err(Error::InvalidArgument("cannot acquire an empty span".into()));
        }
        {
            let state = self.ring.shared.lock();
            if n as u64 > state.capacity {
                return Err(Error::InvalidArgument(format!(
                    "acquire of {n} bytes exceeds ring capacity ({})",
                    state.capacity
                )));
            }
        }
        let deadline = wait.deadline();
        let shared = &self.ring.shared;
        let mut state = shared.lock();
        let mut overwritten: u64 = 0;
        loop {
            if state.interrupted {
                return Err(Error::Interrupted);
            }
            let (seq_end, guaranteed, start) = {
                let seq = state
                    .registry
                    .get(self.seq_id)
                    .ok_or_else(|| Error::InvalidState("sequence expired".into()))?;
                let reader = state
                    .readers
                    .get(&self.reader_id)
                    .ok_or_else(|| Error::InvalidState("reader closed".into()))?;
                (seq.end, reader.guaranteed, reader.read_offset)
            };

            if let Some(end) = seq_end {
                if start >= end {
                    return Err(Error::EndOfData);
                }
            }

            // Lapped opportunistic reader: jump to the oldest surviving
            // byte and account for the loss.
            if !guaranteed {
                let tail = state.valid_tail();
                if start < tail {
                    if let Some(end) = seq_end {
                        if tail >= end {
                            // The rest of this sequence is gone entirely.
                            let skipped = end - start;
                            if let Some(reader) = state.readers.get_mut(&self.reader_id) {
                                reader.read_offset = end;
                            }
                            tracing::warn!(ring = %shared.name, reader = self.reader_id,
                                skipped, "reader lapped past end of sequence");
                            return Err(Error::Overrun { skipped });
                        }
                    }
                    overwritten += tail - start;
                    if let Some(reader) = state.readers.get_mut(&self.reader_id) {
                        reader.read_offset = tail;
                    }
                    continue;
                }
            }

            let want = start + n as u64;
            let target = seq_end.map_or(want, |end| want.min(end));
            if state.commit_head >= target {
                let len = (target - start) as usize;
                let storage = state
                    .storage
                    .clone()
                    .ok_or_else(|| Error::InvalidState("ring has no storage".into()))?;
                if let Some(reader) = state.readers.get_mut(&self.reader_id) {
                    reader.read_offset = target;
                    reader.held.push((start, target));
                }
                drop(state);

                if overwritten > 0 {
                    tracing::warn!(ring = %shared.name, reader = self.reader_id,
                        skipped = overwritten, "reader overrun");
                }
                match storage.begin_read(start, len) {
                    Ok(mem) => {
                        return Ok(ReadSpan {
                            ring: self.ring.clone(),
                            reader_id: self.reader_id,
                            offset: start,
                            len,
                            mem,
                            _storage: storage,
                            overwritten,
                            released: false,
                        })
                    }
                    Err(e) => {
                        let mut state = shared.lock();
                        if let Some(reader) = state.readers.get_mut(&self.reader_id) {
                            reader.held.retain(|&(s, _)| s != start);
                            reader.read_offset = start;
                        }
                        return Err(e);
                    }
                }
            }

            match wait {
                Wait::NonBlock => return Err(Error::WouldBlock),
                _ => state = shared.park(state, &shared.data_available, deadline)?,
            }
        }
    }

    /// Advance to the next sequence the writer created, blocking until it
    /// appears or the writing epoch ends.
    pub fn next(&mut self) -> Result<()> {
        self.next_inner(Wait::Block)
    }

    /// Like [`ReadSequence::next`] with a timeout.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.next_inner(Wait::Timeout(timeout))
    }

    fn next_inner(&mut self, wait: Wait) -> Result<()> {
        let deadline = wait.deadline();
        let shared = &self.ring.shared;
        let mut state = shared.lock();
        loop {
            if state.interrupted {
                return Err(Error::Interrupted);
            }
            let found = state
                .registry
                .next_after(self.seq_id)
                .map(|s| (s.id, s.begin));
            if let Some((next_id, begin)) = found {
                let tail = state.valid_tail();
                if let Some(cur) = state.registry.get_mut(self.seq_id) {
                    cur.nreader -= 1;
                }
                state
                    .registry
                    .get_mut(next_id)
                    .expect("still present: registry is locked")
                    .nreader += 1;
                if let Some(reader) = state.readers.get_mut(&self.reader_id) {
                    // Skipping the remainder of the old sequence releases
                    // its bytes to the writer.
                    reader.read_offset = reader.read_offset.max(begin).max(tail);
                }
                self.seq_id = next_id;
                state.prune_registry();
                drop(state);
                shared.space_available.notify_all();
                return Ok(());
            }
            if state.eod {
                return Err(Error::EndOfData);
            }
            match wait {
                Wait::NonBlock => return Err(Error::WouldBlock),
                _ => state = shared.park(state, &shared.data_available, deadline)?,
            }
        }
    }
}

impl Drop for ReadSequence {
    fn drop(&mut self) {
        let mut state = self.ring.shared.lock();
        if let Some(seq) = state.registry.get_mut(self.seq_id) {
            seq.nreader -= 1;
        }
        state.prune_registry();
    }
}

/// A contiguous committed byte range held by one reader.
///
/// Releasing (or dropping) the span advances the reader's cursor past it,
/// which may unblock a writer waiting on backpressure.
pub struct ReadSpan {
    ring: Ring,
    reader_id: u64,
    offset: u64,
    len: usize,
    mem: SpanMem,
    _storage: Arc<RingStorage>,
    overwritten: u64,
    released: bool,
}

impl ReadSpan {
    /// Ring byte offset of the first byte of this span.
    ///
    /// May be later than requested if the reader was lapped; the
    /// difference is reported by [`ReadSpan::size_overwritten`].
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Span length in bytes. Shorter than requested only at a sequence
    /// end.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the span is empty (never: zero-size acquires are rejected).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of the request lost to the writer before this span could be
    /// acquired. Zero for guaranteed readers.
    pub fn size_overwritten(&self) -> u64 {
        self.overwritten
    }

    /// True if the reader was lapped while acquiring this span.
    pub fn overrun(&self) -> bool {
        self.overwritten > 0
    }

    /// Raw pointer to the span's contiguous bytes.
    pub fn as_ptr(&self) -> *const u8 {
        self.mem.as_ptr()
    }

    /// Release the span, advancing this reader's cursor.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let shared = &self.ring.shared;
        let mut state = shared.lock();
        let end = self.offset + self.len as u64;
        if let Some(reader) = state.readers.get_mut(&self.reader_id) {
            if let Some(pos) = reader
                .held
                .iter()
                .position(|&(s, e)| s == self.offset && e == end)
            {
                reader.held.swap_remove(pos);
            }
        }
        let lag = state.commit_head.saturating_sub(end);
        state.prune_registry();
        drop(state);
        shared.space_available.notify_all();
        telemetry::reader_lag(&shared.name, self.reader_id, lag);
    }
}

impl fmt::Debug for ReadSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSpan")
            .field("reader_id", &self.reader_id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("overwritten", &self.overwritten)
            .field("released", &self.released)
            .finish()
    }
}

impl Deref for ReadSpan {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `mem` points at `len` contiguous committed bytes; for a
        // guaranteed reader the writer cannot touch them until release.
        unsafe { std::slice::from_raw_parts(self.mem.as_ptr(), self.len) }
    }
}

impl Drop for ReadSpan {
    fn drop(&mut self) {
        self.release_inner();
    }
}
