//! # Bifrost
//!
//! A streaming substrate for high-throughput signal processing: memory-
//! space-aware ring buffers plus a packet capture engine that turns
//! UDP or disk packet streams into time-ordered ring sequences.
//!
//! Processing stages exchange bulk array data through in-memory rings,
//! one writer and many independent readers per ring, each stage on its
//! own thread. Host rings use a doubled virtual mapping (memfd mapped
//! twice) so spans never see the buffer seam; rings in spaces that cannot
//! be double-mapped stage wrap-straddling spans through scratch memory
//! behind the same contract.
//!
//! ## Features
//!
//! - **Guaranteed and opportunistic readers**: backpressure the writer,
//!   or skip ahead on overrun
//! - **Sequence/span protocol**: immutable per-epoch headers, contiguous
//!   byte spans, at-most-once notification
//! - **Packet capture**: gap zero-filling, a two-slot reordering window,
//!   duplicate detection, sequence-change callbacks
//! - **Linux-optimized**: memfd_create double mapping, CPU pinning
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bifrost::memory::Space;
//! use bifrost::ring::Ring;
//!
//! let ring = Ring::new("gulps", Space::System);
//! ring.resize(1 << 20, 4 << 20, 1)?;
//!
//! // Writer thread
//! let mut writer = ring.begin_writing()?;
//! let seq = writer.begin_sequence("obs-1", time_tag, header_json)?;
//! let mut span = seq.reserve(1 << 20)?;
//! fill(&mut span);
//! span.commit()?;
//!
//! // Reader thread
//! let reader = ring.open_reading(true);
//! let mut rseq = reader.open_earliest()?;
//! let span = rseq.acquire(1 << 20)?;
//! process(&span);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod affinity;
pub mod capture;
pub mod error;
pub mod memory;
pub mod ring;
mod telemetry;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::capture::{CaptureBuilder, CaptureEngine, CaptureStatus};
    pub use crate::error::{Error, Result};
    pub use crate::memory::Space;
    pub use crate::ring::{ReadSpan, Ring, RingReader, RingWriter, WriteSpan};
}

pub use error::{Error, Result};
