//! Packet capture: turning packet streams into ring sequences.
//!
//! The capture engine reads opaque packets from a [`PacketSource`] (UDP
//! socket, raw sniffer socket, or disk packet stream), hands them to a
//! format plugin ([`PacketDecoder`] / [`PacketProcessor`]), reassembles
//! them into time-ordered slots with gap zero-filling and duplicate
//! detection, and commits the slots to a [`crate::ring::Ring`] as spans.
//! Whenever a new structural epoch starts, a user [`SequenceHandler`]
//! supplies the ring sequence's time tag and header bytes.
//!
//! # Architecture
//!
//! ```text
//! source ──▶ decoder ──▶ slot pair (front/back) ──▶ ring writer
//!               │              ▲
//!               └─ descriptor ─┘        sequence handler on epoch change
//! ```
//!
//! The engine is single-threaded by design: run it on a dedicated thread
//! (optionally pinned with [`CaptureBuilder::with_core`]) and drive it
//! with [`CaptureEngine::recv`].

mod engine;
mod format;
mod slot;
mod source;

pub mod simple;

pub use engine::{CaptureBuilder, CaptureEngine};
pub use format::{
    PacketDecoder, PacketDesc, PacketProcessor, PacketSignature, SequenceChange, SequenceHandler,
    SequenceStart, SlotGeometry,
};
pub use source::{CaptureMethod, DiskSource, PacketSource, SnifferSource, UdpSource, VerbsSource};

/// Result of one iteration of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// The first sequence began.
    Started,
    /// Packets were committed into the current sequence.
    Continued,
    /// A sequence change occurred (structural change, time-window
    /// boundary, or discontinuity).
    Changed,
    /// End of input reached; capture is finished.
    Ended,
    /// No packet arrived within the source timeout. The current sequence
    /// stays open.
    NoData,
    /// The ring was interrupted while the engine was blocked on it.
    Interrupted,
}

/// Monotone packet counters for one capture engine.
///
/// At any quiescent point `received` equals the sum of the other four.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    /// Packets read from the source.
    pub received: u64,
    /// Packets accepted into a slot that reached the ring.
    pub committed: u64,
    /// Packets dropped: malformed, foreign source, or rejected epoch.
    pub rejected: u64,
    /// Packets older than the front slot.
    pub late: u64,
    /// Packets whose `(source, time)` cell was already filled.
    pub duplicated: u64,
}
