//! Memory-space-aware ring buffers with a sequence/span protocol.
//!
//! A [`Ring`] is a bounded circular byte buffer shared by exactly one
//! writer and any number of independent readers. Data flows in *sequences*
//! (contiguous epochs described by an immutable header) and is exchanged in
//! *spans* (contiguous byte ranges held by one side at a time):
//!
//! - the writer reserves a span ahead of its cursor, fills it, and commits;
//! - each reader acquires committed spans of a sequence in order and
//!   releases them when done.
//!
//! Guaranteed readers participate in backpressure: the writer blocks rather
//! than overwrite bytes they have not released. Opportunistic readers never
//! block the writer; when lapped, their next acquire reports the overrun
//! and resumes at the oldest surviving byte.
//!
//! Ring offsets are monotone 64-bit byte positions mapped onto physical
//! storage modulo the capacity; the storage layer guarantees every span is
//! virtually contiguous even across the physical wrap.
//!
//! # Example
//!
//! ```rust,ignore
//! use bifrost::memory::Space;
//! use bifrost::ring::Ring;
//!
//! let ring = Ring::new("gulp", Space::System);
//! ring.resize(1024, 4096, 1)?;
//!
//! let mut writer = ring.begin_writing()?;
//! let seq = writer.begin_sequence("obs-1", 0, b"{\"nchan\":64}")?;
//! let mut span = seq.reserve(1024)?;
//! span.copy_from_slice(&payload);
//! span.commit()?;
//! ```

mod reader;
mod sequence;
mod storage;
mod writer;

pub use reader::{ReadSequence, ReadSpan, RingReader, SequenceInfo};
pub use writer::{RingWriter, WriteSequence, WriteSpan};

use crate::error::{Error, Result};
use crate::memory::Space;
use crate::telemetry;
use sequence::SequenceRegistry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use storage::RingStorage;

/// How a blocking ring operation should wait.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wait {
    Block,
    Timeout(Duration),
    NonBlock,
}

impl Wait {
    fn deadline(&self) -> Option<Instant> {
        match self {
            Wait::Timeout(t) => Some(Instant::now() + *t),
            _ => None,
        }
    }
}

/// Per-reader bookkeeping.
pub(crate) struct ReaderState {
    pub guaranteed: bool,
    /// Where the next acquire starts.
    pub read_offset: u64,
    /// Outstanding (start, end) spans, not yet released.
    pub held: Vec<(u64, u64)>,
}

impl ReaderState {
    /// Oldest byte this reader still needs; the writer may not pass
    /// `cursor + capacity` while the reader is guaranteed.
    pub fn guarantee_cursor(&self) -> u64 {
        self.held
            .iter()
            .map(|&(start, _)| start)
            .min()
            .unwrap_or(self.read_offset)
            .min(self.read_offset)
    }
}

pub(crate) struct RingState {
    pub storage: Option<Arc<RingStorage>>,
    pub contiguous: u64,
    pub capacity: u64,
    pub writing: bool,
    /// Set when a writing epoch ends; cleared when a new one begins.
    /// Readers that exhaust the registry see end-of-data only while this
    /// is set (before the first epoch they wait instead).
    pub eod: bool,
    pub interrupted: bool,
    /// Reservation cursor: all bytes below are spoken for by the writer.
    pub reserve_head: u64,
    /// Commit cursor: all bytes below are readable.
    pub commit_head: u64,
    /// Spans committed out of order, waiting for the commit cursor.
    pub pending: BTreeMap<u64, u64>,
    pub registry: SequenceRegistry,
    /// The sequence currently accepting writes, if any.
    pub open_seq: Option<u64>,
    pub readers: HashMap<u64, ReaderState>,
    pub next_reader_id: u64,
}

impl RingState {
    /// Oldest offset whose byte is still valid: anything below this has
    /// been handed back to the writer.
    pub fn valid_tail(&self) -> u64 {
        self.reserve_head.saturating_sub(self.capacity)
    }

    pub fn min_guaranteed_cursor(&self) -> Option<u64> {
        self.readers
            .values()
            .filter(|r| r.guaranteed)
            .map(|r| r.guarantee_cursor())
            .min()
    }

    /// True when the ring holds no live data or reservations.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
            && self.open_seq.is_none()
            && self.pending.is_empty()
            && self.reserve_head == self.commit_head
    }

    pub fn prune_registry(&mut self) {
        let tail = self.valid_tail();
        self.registry.prune(tail);
    }
}

pub(crate) struct RingShared {
    pub name: String,
    pub space: Space,
    pub state: Mutex<RingState>,
    /// Writers park here when a guaranteed reader holds them back.
    pub space_available: Condvar,
    /// Readers park here for commits and new sequences.
    pub data_available: Condvar,
}

impl RingShared {
    pub fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap()
    }

    /// One park step in a wait loop. Returns the reacquired guard, or
    /// `Timeout` when the deadline has passed.
    pub fn park<'a>(
        &self,
        guard: MutexGuard<'a, RingState>,
        cv: &Condvar,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, RingState>> {
        match deadline {
            None => Ok(cv.wait(guard).unwrap()),
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(Error::Timeout);
                }
                let (guard, _) = cv.wait_timeout(guard, d - now).unwrap();
                Ok(guard)
            }
        }
    }
}

/// A named, memory-space-aware ring buffer.
///
/// `Ring` is a cheap handle: clones share the same underlying buffer and
/// metadata, so it can be handed to writer, readers, and a capture engine
/// on different threads.
#[derive(Clone)]
pub struct Ring {
    pub(crate) shared: Arc<RingShared>,
}

impl Ring {
    /// Create an empty ring in `space`.
    ///
    /// The ring holds no storage until the first [`Ring::resize`].
    pub fn new(name: impl Into<String>, space: Space) -> Self {
        let name = name.into();
        tracing::debug!(ring = %name, space = %space, "ring created");
        Self {
            shared: Arc::new(RingShared {
                name,
                space,
                state: Mutex::new(RingState {
                    storage: None,
                    contiguous: 0,
                    capacity: 0,
                    writing: false,
                    eod: false,
                    interrupted: false,
                    reserve_head: 0,
                    commit_head: 0,
                    pending: BTreeMap::new(),
                    registry: SequenceRegistry::default(),
                    open_seq: None,
                    readers: HashMap::new(),
                    next_reader_id: 0,
                }),
                space_available: Condvar::new(),
                data_available: Condvar::new(),
            }),
        }
    }

    /// The ring's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The memory space the ring's storage lives in.
    pub fn space(&self) -> Space {
        self.shared.space
    }

    /// Total capacity in bytes (zero before the first resize).
    pub fn capacity(&self) -> u64 {
        self.shared.lock().capacity
    }

    /// Largest single span the ring guarantees to be contiguous.
    pub fn contiguous_span(&self) -> u64 {
        self.shared.lock().contiguous
    }

    /// The writer's commit frontier.
    pub fn head(&self) -> u64 {
        self.shared.lock().commit_head
    }

    /// Oldest byte offset still backed by valid data.
    pub fn tail(&self) -> u64 {
        self.shared.lock().valid_tail()
    }

    /// Size the ring.
    ///
    /// `contiguous_span` is the largest single reserve any writer will ask
    /// for; `total_capacity` is rounded up to at least `2 * contiguous_span`
    /// and to a whole number of contiguous strides. Both only ever grow.
    /// `nringlet` is the ringlet count; this build supports exactly one.
    ///
    /// Resizing is data-safe only while the ring is empty (or has never
    /// been written); otherwise it fails with `InvalidState`.
    pub fn resize(&self, contiguous_span: u64, total_capacity: u64, nringlet: u64) -> Result<()> {
        if contiguous_span == 0 {
            return Err(Error::InvalidArgument("contiguous span must be > 0".into()));
        }
        if nringlet != 1 {
            return Err(Error::Unsupported("rings with more than one ringlet"));
        }

        let mut state = self.shared.lock();
        if state.storage.is_some() && !state.is_empty() {
            return Err(Error::InvalidState(format!(
                "cannot resize non-empty ring '{}'",
                self.shared.name
            )));
        }

        let contiguous = contiguous_span.max(state.contiguous);
        let mut capacity = total_capacity
            .max(state.capacity)
            .max(2 * contiguous);
        capacity = capacity.div_ceil(contiguous) * contiguous;

        if state.storage.is_some() && capacity == state.capacity && contiguous == state.contiguous
        {
            return Ok(());
        }

        let storage = RingStorage::allocate(&self.shared.name, self.shared.space, capacity as usize)?;
        state.storage = Some(Arc::new(storage));
        state.contiguous = contiguous;
        state.capacity = capacity;
        tracing::debug!(
            ring = %self.shared.name,
            capacity,
            contiguous,
            "ring resized"
        );
        telemetry::ring_resized(&self.shared.name, self.shared.space.name(), capacity);

        // A writer parked on reserve may fit in the grown ring.
        self.shared.space_available.notify_all();
        Ok(())
    }

    /// Open the ring for writing and return the exclusive writer token.
    ///
    /// Fails with `InvalidState` if a writer is already open.
    pub fn begin_writing(&self) -> Result<RingWriter> {
        let mut state = self.shared.lock();
        if state.writing {
            return Err(Error::InvalidState(format!(
                "ring '{}' is already open for writing",
                self.shared.name
            )));
        }
        state.writing = true;
        state.eod = false;
        tracing::debug!(ring = %self.shared.name, "writer opened");
        Ok(RingWriter::new(self.clone()))
    }

    /// Register a reader.
    ///
    /// A guaranteed reader participates in backpressure: the writer will
    /// block rather than overwrite bytes the reader has not released. An
    /// opportunistic reader never blocks the writer and instead observes
    /// overruns. The reader joins at the writer's current commit frontier.
    pub fn open_reading(&self, guaranteed: bool) -> RingReader {
        let mut state = self.shared.lock();
        let id = state.next_reader_id;
        state.next_reader_id += 1;
        let read_offset = state.commit_head;
        state.readers.insert(
            id,
            ReaderState {
                guaranteed,
                read_offset,
                held: Vec::new(),
            },
        );
        tracing::debug!(ring = %self.shared.name, reader = id, guaranteed, "reader opened");
        RingReader::new(self.clone(), id, guaranteed)
    }

    /// Wake every thread parked on this ring with `Interrupted`.
    ///
    /// Cursors and registry are untouched; after [`Ring::resume`] the ring
    /// continues where it left off.
    pub fn interrupt(&self) {
        let mut state = self.shared.lock();
        state.interrupted = true;
        tracing::debug!(ring = %self.shared.name, "ring interrupted");
        self.shared.space_available.notify_all();
        self.shared.data_available.notify_all();
    }

    /// Clear a previous [`Ring::interrupt`] so blocking operations park
    /// again.
    pub fn resume(&self) {
        self.shared.lock().interrupted = false;
        tracing::debug!(ring = %self.shared.name, "ring resumed");
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Ring")
            .field("name", &self.shared.name)
            .field("space", &self.shared.space)
            .field("capacity", &state.capacity)
            .field("head", &state.commit_head)
            .field("writing", &state.writing)
            .finish()
    }
}
