//! Format-plugin interface for the capture engine.
//!
//! The engine never interprets wire bytes itself: a [`PacketDecoder`]
//! validates each packet and extracts a [`PacketDesc`], and a
//! [`PacketProcessor`] scatters the payload into slot memory. A
//! [`SequenceHandler`] is consulted whenever a new structural epoch starts
//! and supplies the ring sequence's time tag and header bytes.

use crate::error::Result;

/// Descriptor extracted from one valid packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDesc {
    /// Time index of the packet, in packet-time units.
    pub seq: u64,
    /// Source stream id (antenna, beam, board, ...).
    pub src: u32,
    /// Number of source streams the sender claims.
    pub nsrc: u32,
    /// First channel carried.
    pub chan0: u32,
    /// Number of channels carried.
    pub nchan: u32,
    /// Decimation factor relative to the native sample rate.
    pub decimation: u32,
    /// Sample bit depth.
    pub nbit: u8,
    /// Byte offset of the payload within the packet.
    pub payload_offset: usize,
    /// Payload length in bytes.
    pub payload_size: usize,
}

impl PacketDesc {
    /// The structural fields of this descriptor.
    ///
    /// Two packets with different signatures cannot share a ring sequence;
    /// the engine ends the current sequence when the signature changes.
    pub fn signature(&self) -> PacketSignature {
        PacketSignature {
            nsrc: self.nsrc,
            chan0: self.chan0,
            nchan: self.nchan,
            decimation: self.decimation,
            nbit: self.nbit,
        }
    }
}

/// Structural identity of a packet stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSignature {
    /// Number of source streams.
    pub nsrc: u32,
    /// First channel carried.
    pub chan0: u32,
    /// Number of channels carried.
    pub nchan: u32,
    /// Decimation factor.
    pub decimation: u32,
    /// Sample bit depth.
    pub nbit: u8,
}

/// Validates packets and extracts descriptors.
pub trait PacketDecoder: Send {
    /// Fixed on-wire packet size, if the format has one.
    ///
    /// Disk streams require this for framing; datagram sources ignore it.
    fn packet_size(&self) -> Option<usize>;

    /// Decode one packet. `None` rejects it (malformed or foreign).
    fn decode(&mut self, packet: &[u8]) -> Option<PacketDesc>;
}

/// Placement of one packet within a capture slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotGeometry {
    /// Packet time index relative to the slot start.
    pub time_in_slot: usize,
    /// Source index relative to the engine's first source.
    pub src_index: usize,
    /// Number of sources interleaved in the slot.
    pub nsrc: usize,
    /// Bytes each packet contributes.
    pub frame_nbyte: usize,
}

impl SlotGeometry {
    /// Byte offset of this packet's frame within the slot.
    pub fn frame_offset(&self) -> usize {
        (self.time_in_slot * self.nsrc + self.src_index) * self.frame_nbyte
    }
}

/// Scatters packet payloads into slot memory.
pub trait PacketProcessor: Send {
    /// Bytes one packet of this shape contributes to a slot.
    fn frame_nbyte(&self, desc: &PacketDesc) -> usize;

    /// Write `payload` into `slot` at the position described by `geo`.
    ///
    /// Formats that transpose or unpack samples do it here; the default
    /// layout is `[time][source][frame bytes]`.
    fn scatter(&mut self, desc: &PacketDesc, payload: &[u8], slot: &mut [u8], geo: &SlotGeometry);
}

/// Everything a [`SequenceHandler`] needs to describe a new epoch.
#[derive(Debug, Clone, Copy)]
pub struct SequenceChange {
    /// Packet-time index at which the new sequence starts.
    pub time_offset: u64,
    /// Structural identity of the stream.
    pub signature: PacketSignature,
}

/// The handler's answer: how to label the new ring sequence.
#[derive(Debug, Clone)]
pub struct SequenceStart {
    /// Time tag for the ring sequence.
    pub time_tag: u64,
    /// Sequence name; generated from the time tag when `None`.
    pub name: Option<String>,
    /// Opaque header bytes (typically JSON synthesized by the handler).
    pub header: Vec<u8>,
}

/// User hook invoked once per structural epoch, on the capture thread,
/// before any span of the new sequence is visible to readers.
///
/// The handler must not touch the capture ring's writer (the engine holds
/// it); header synthesis, time-tag arithmetic, and metadata publication
/// are all fine. Returning an error rejects the epoch: its packets are
/// dropped and counted until the next structural change.
pub trait SequenceHandler: Send {
    /// Label the sequence that starts at `change`.
    fn on_sequence(&mut self, change: &SequenceChange) -> Result<SequenceStart>;
}

impl<F> SequenceHandler for F
where
    F: FnMut(&SequenceChange) -> Result<SequenceStart> + Send,
{
    fn on_sequence(&mut self, change: &SequenceChange) -> Result<SequenceStart> {
        self(change)
    }
}
