//! The capture loop: packets in, ring sequences out.
//!
//! One engine owns a ring's writer token, a packet source, and a format
//! plugin (decoder + processor + sequence handler). Each [`CaptureEngine::recv`]
//! call ingests packets until something reportable happens:
//!
//! - a new structural epoch begins ([`CaptureStatus::Started`] /
//!   [`CaptureStatus::Changed`]),
//! - a slot fills and commits into the current sequence
//!   ([`CaptureStatus::Continued`]),
//! - the source times out ([`CaptureStatus::NoData`]) or ends
//!   ([`CaptureStatus::Ended`]),
//! - the ring is interrupted ([`CaptureStatus::Interrupted`]).
//!
//! Packets are indexed by `(source, time)` and scattered into a
//! double-buffered slot pair; slots commit in time order with gaps left
//! zero-filled. A packet older than the front slot is late and dropped.

use super::format::{PacketDecoder, PacketDesc, PacketProcessor, SequenceChange, SequenceHandler, SlotGeometry};
use super::slot::CaptureSlot;
use super::source::{CaptureMethod, PacketSource};
use super::{CaptureStats, CaptureStatus};
use crate::error::{Error, Result};
use crate::ring::{Ring, RingWriter, WriteSequence};
use crate::telemetry;
use std::fmt;
use std::io::SeekFrom;

enum PlaceOutcome {
    Stored,
    Late,
    Duplicate,
}

/// Configuration for a capture engine.
///
/// # Example
///
/// ```rust,ignore
/// let engine = CaptureBuilder::new(ring)
///     .with_nsrc(4)
///     .with_buffer_ntime(250)
///     .with_slot_ntime(1000)
///     .with_core(2)
///     .start(source, decoder, processor, handler)?;
/// ```
pub struct CaptureBuilder {
    ring: Ring,
    nsrc: usize,
    src0: u32,
    max_payload: usize,
    buffer_ntime: usize,
    slot_ntime: usize,
    core: Option<usize>,
}

impl CaptureBuilder {
    /// Start configuring capture into `ring`.
    pub fn new(ring: Ring) -> Self {
        Self {
            ring,
            nsrc: 1,
            src0: 0,
            max_payload: 9000,
            buffer_ntime: 256,
            slot_ntime: 4096,
            core: None,
        }
    }

    /// Number of concurrent source streams (default 1).
    pub fn with_nsrc(mut self, nsrc: usize) -> Self {
        self.nsrc = nsrc;
        self
    }

    /// First source id (default 0).
    pub fn with_src0(mut self, src0: u32) -> Self {
        self.src0 = src0;
        self
    }

    /// Largest packet the source can deliver, in bytes (default 9000).
    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    /// Time samples per commit (slot size; default 256).
    pub fn with_buffer_ntime(mut self, ntime: usize) -> Self {
        self.buffer_ntime = ntime;
        self
    }

    /// Time samples per ring sequence; must be a multiple of
    /// `buffer_ntime` (default 4096).
    pub fn with_slot_ntime(mut self, ntime: usize) -> Self {
        self.slot_ntime = ntime;
        self
    }

    /// Pin the capture thread to this CPU core.
    pub fn with_core(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }

    /// Validate the configuration, claim the ring's writer token, and
    /// build the engine. Pins the calling thread if a core was requested.
    pub fn start(
        self,
        source: Box<dyn PacketSource>,
        decoder: Box<dyn PacketDecoder>,
        processor: Box<dyn PacketProcessor>,
        handler: Box<dyn SequenceHandler>,
    ) -> Result<CaptureEngine> {
        if self.nsrc == 0 {
            return Err(Error::InvalidArgument("nsrc must be > 0".into()));
        }
        if self.buffer_ntime == 0 {
            return Err(Error::InvalidArgument("buffer_ntime must be > 0".into()));
        }
        if self.slot_ntime == 0 || self.slot_ntime % self.buffer_ntime != 0 {
            return Err(Error::InvalidArgument(format!(
                "slot_ntime ({}) must be a positive multiple of buffer_ntime ({})",
                self.slot_ntime, self.buffer_ntime
            )));
        }
        if self.max_payload == 0 {
            return Err(Error::InvalidArgument("max_payload must be > 0".into()));
        }
        if let Some(core) = self.core {
            crate::affinity::bind_to_core(core)?;
        }

        // Fixed-size formats dictate their own minimum receive buffer.
        let buf_len = self.max_payload.max(decoder.packet_size().unwrap_or(0));

        let writer = self.ring.begin_writing()?;
        tracing::debug!(
            ring = %self.ring.name(),
            method = ?source.method(),
            nsrc = self.nsrc,
            buffer_ntime = self.buffer_ntime,
            slot_ntime = self.slot_ntime,
            "capture engine started"
        );
        Ok(CaptureEngine {
            pkt_buf: vec![0; buf_len],
            ring: self.ring,
            writer: Some(writer),
            wseq: None,
            source,
            decoder,
            processor,
            handler,
            nsrc: self.nsrc,
            src0: self.src0,
            buffer_ntime: self.buffer_ntime,
            slot_ntime: self.slot_ntime,
            slots: None,
            signature: None,
            epoch_rejected: false,
            started: false,
            seq_time0: 0,
            frame_nbyte: 0,
            stats: CaptureStats::default(),
            ended: false,
        })
    }
}

/// A running packet capture, driving one ring.
pub struct CaptureEngine {
    ring: Ring,
    writer: Option<RingWriter>,
    wseq: Option<WriteSequence>,
    source: Box<dyn PacketSource>,
    decoder: Box<dyn PacketDecoder>,
    processor: Box<dyn PacketProcessor>,
    handler: Box<dyn SequenceHandler>,
    nsrc: usize,
    src0: u32,
    buffer_ntime: usize,
    slot_ntime: usize,
    pkt_buf: Vec<u8>,
    /// Front and back slots; `back` always covers the window after
    /// `front`.
    slots: Option<(CaptureSlot, CaptureSlot)>,
    signature: Option<super::format::PacketSignature>,
    /// The handler rejected the current epoch; its packets are dropped.
    epoch_rejected: bool,
    started: bool,
    /// Packet-time index where the current ring sequence began.
    seq_time0: u64,
    frame_nbyte: usize,
    stats: CaptureStats,
    ended: bool,
}

impl fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("nsrc", &self.nsrc)
            .field("src0", &self.src0)
            .field("buffer_ntime", &self.buffer_ntime)
            .field("slot_ntime", &self.slot_ntime)
            .field("epoch_rejected", &self.epoch_rejected)
            .field("started", &self.started)
            .field("seq_time0", &self.seq_time0)
            .field("frame_nbyte", &self.frame_nbyte)
            .field("stats", &self.stats)
            .field("ended", &self.ended)
            .finish()
    }
}

impl CaptureEngine {
    /// The ring this engine writes into.
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// The datapath packets arrive on.
    pub fn method(&self) -> CaptureMethod {
        self.source.method()
    }

    /// Packet counters so far.
    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Run one iteration of the capture loop.
    ///
    /// Ring interruption surfaces as `Ok(Interrupted)`; unrecoverable
    /// source or ring failures as `Err`.
    pub fn recv(&mut self) -> Result<CaptureStatus> {
        match self.recv_inner() {
            Err(Error::Interrupted) => Ok(CaptureStatus::Interrupted),
            other => other,
        }
    }

    fn recv_inner(&mut self) -> Result<CaptureStatus> {
        if self.ended {
            return Ok(CaptureStatus::Ended);
        }
        loop {
            let n = match self.source.recv_packet(&mut self.pkt_buf) {
                Ok(n) => n,
                Err(Error::Timeout) => return Ok(CaptureStatus::NoData),
                Err(Error::EndOfData) => {
                    self.finish()?;
                    return Ok(CaptureStatus::Ended);
                }
                Err(e) => return Err(e),
            };
            self.stats.received += 1;

            let Some(desc) = self.decoder.decode(&self.pkt_buf[..n]) else {
                self.reject();
                continue;
            };
            if desc.src < self.src0
                || desc.src >= self.src0 + self.nsrc as u32
                || desc.payload_offset + desc.payload_size > n
            {
                self.reject();
                continue;
            }

            let sig = desc.signature();
            if self.signature != Some(sig) {
                self.begin_epoch(&desc)?;
                let (outcome, ..) = self.ingest(&desc)?;
                self.count(&outcome);
                if !self.epoch_rejected {
                    let was_started = self.started;
                    self.started = true;
                    return Ok(if was_started {
                        CaptureStatus::Changed
                    } else {
                        CaptureStatus::Started
                    });
                }
                continue;
            }

            let (outcome, committed, rotated) = self.ingest(&desc)?;
            self.count(&outcome);
            // A rejected epoch drains through the slot machinery silently;
            // each window boundary re-consults the handler.
            if self.epoch_rejected {
                continue;
            }
            if rotated {
                return Ok(CaptureStatus::Changed);
            }
            if committed {
                return Ok(CaptureStatus::Continued);
            }
        }
    }

    /// Commit any partially filled slots to the ring immediately.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_slots()
    }

    /// Flush, end the current ring sequence, and end ring writing.
    ///
    /// Subsequent [`CaptureEngine::recv`] calls return `Ended`.
    pub fn end(&mut self) -> Result<()> {
        self.finish()
    }

    /// Reposition a disk packet stream. Buffered slots are flushed first.
    ///
    /// Fails with `InvalidArgument` if the target lands inside a packet
    /// (the format interface has no resync), `InvalidState` for
    /// non-seekable sources.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.flush_slots()?;
        self.source.seek(pos)
    }

    /// Current byte offset of a disk packet stream.
    pub fn tell(&mut self) -> Result<u64> {
        self.source.tell()
    }

    fn reject(&mut self) {
        self.stats.rejected += 1;
        telemetry::capture_packets(self.ring.name(), "rejected", 1);
    }

    fn count(&mut self, outcome: &PlaceOutcome) {
        match outcome {
            PlaceOutcome::Stored => {}
            PlaceOutcome::Late => {
                self.stats.late += 1;
                telemetry::capture_packets(self.ring.name(), "late", 1);
            }
            PlaceOutcome::Duplicate => {
                self.stats.duplicated += 1;
                telemetry::capture_packets(self.ring.name(), "duplicated", 1);
            }
        }
    }

    fn slot_t0(&self, time: u64) -> u64 {
        time - time % self.buffer_ntime as u64
    }

    /// Enter a new structural epoch: flush the old one, re-derive the slot
    /// geometry, and consult the handler for the new sequence's label.
    fn begin_epoch(&mut self, desc: &PacketDesc) -> Result<()> {
        self.flush_slots()?;

        let frame_nbyte = self.processor.frame_nbyte(desc);
        if frame_nbyte == 0 {
            return Err(Error::InvalidArgument(
                "processor reports zero bytes per packet".into(),
            ));
        }
        self.frame_nbyte = frame_nbyte;
        self.signature = Some(desc.signature());

        let slot_bytes = (self.buffer_ntime * self.nsrc * frame_nbyte) as u64;
        if slot_bytes > self.ring.contiguous_span() {
            // Room for a few slots of headroom between writer and readers.
            self.ring.resize(slot_bytes, 4 * slot_bytes, 1)?;
        }

        let t0 = self.slot_t0(desc.seq);
        self.rotate_sequence(t0)?;
        self.slots = Some((
            CaptureSlot::new(t0, self.buffer_ntime, self.nsrc, frame_nbyte),
            CaptureSlot::new(
                t0 + self.buffer_ntime as u64,
                self.buffer_ntime,
                self.nsrc,
                frame_nbyte,
            ),
        ));
        Ok(())
    }

    /// End the current ring sequence and begin the next at packet time
    /// `t0`, consulting the handler for its label.
    fn rotate_sequence(&mut self, t0: u64) -> Result<()> {
        let signature = self
            .signature
            .ok_or_else(|| Error::Internal("sequence rotation before first packet".into()))?;
        let change = SequenceChange {
            time_offset: t0,
            signature,
        };
        self.seq_time0 = t0;
        match self.handler.on_sequence(&change) {
            Ok(start) => {
                // End the previous sequence before the new header goes live.
                self.wseq = None;
                let name = start
                    .name
                    .unwrap_or_else(|| format!("{}:{}", self.ring.name(), start.time_tag));
                let writer = self
                    .writer
                    .as_mut()
                    .ok_or_else(|| Error::InvalidState("capture already ended".into()))?;
                self.wseq = Some(writer.begin_sequence(name, start.time_tag, &start.header)?);
                self.epoch_rejected = false;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(ring = %self.ring.name(), time_offset = t0, error = %e,
                    "sequence rejected by handler");
                self.wseq = None;
                self.epoch_rejected = true;
                Ok(())
            }
        }
    }

    /// Place one decoded packet, advancing slots as needed.
    ///
    /// Returns the packet's fate plus whether any slot committed and
    /// whether the ring sequence rotated.
    fn ingest(&mut self, desc: &PacketDesc) -> Result<(PlaceOutcome, bool, bool)> {
        let mut committed = false;
        let mut rotated = false;

        if self.slots.is_none() {
            // Re-seed after a flush; the sequence itself continues.
            let t0 = self.slot_t0(desc.seq);
            self.slots = Some((
                CaptureSlot::new(t0, self.buffer_ntime, self.nsrc, self.frame_nbyte),
                CaptureSlot::new(
                    t0 + self.buffer_ntime as u64,
                    self.buffer_ntime,
                    self.nsrc,
                    self.frame_nbyte,
                ),
            ));
        }

        loop {
            {
                let (front, back) = self.slots.as_ref().expect("seeded above");
                if desc.seq < front.t0() {
                    return Ok((PlaceOutcome::Late, committed, rotated));
                }
                if front.contains(desc.seq) || back.contains(desc.seq) {
                    break;
                }
            }
            let (c, r) = self.advance_slots(desc.seq)?;
            committed |= c;
            rotated |= r;
        }

        let src_index = (desc.src - self.src0) as usize;
        let (front, back) = self.slots.as_mut().expect("seeded above");
        let slot = if front.contains(desc.seq) { front } else { back };
        if !slot.mark(desc.seq, src_index) {
            return Ok((PlaceOutcome::Duplicate, committed, rotated));
        }
        let geo = SlotGeometry {
            time_in_slot: (desc.seq - slot.t0()) as usize,
            src_index,
            nsrc: self.nsrc,
            frame_nbyte: self.frame_nbyte,
        };
        let payload = &self.pkt_buf[desc.payload_offset..desc.payload_offset + desc.payload_size];
        self.processor.scatter(desc, payload, slot.bytes_mut(), &geo);
        Ok((PlaceOutcome::Stored, committed, rotated))
    }

    /// Roll the slot pair forward until `time` fits in the back slot.
    fn advance_slots(&mut self, time: u64) -> Result<(bool, bool)> {
        let mut committed = false;
        let mut rotated = false;

        // A jump of more than one sequence window is a discontinuity:
        // commit what we have and re-seed at the packet instead of
        // committing a flood of zero-filled slots.
        let back_end = self.slots.as_ref().expect("caller seeded slots").1.end();
        if time >= back_end + self.slot_ntime as u64 {
            let had_data = {
                let (front, back) = self.slots.as_ref().expect("checked above");
                front.ngood() > 0 || back.ngood() > 0
            };
            if had_data {
                self.flush_slots()?;
                committed = true;
            } else {
                self.slots = None;
            }
            let t0 = self.slot_t0(time);
            tracing::warn!(ring = %self.ring.name(), from = back_end, to = time,
                "time discontinuity, restarting sequence");
            self.rotate_sequence(t0)?;
            rotated = true;
            self.slots = Some((
                CaptureSlot::new(t0, self.buffer_ntime, self.nsrc, self.frame_nbyte),
                CaptureSlot::new(
                    t0 + self.buffer_ntime as u64,
                    self.buffer_ntime,
                    self.nsrc,
                    self.frame_nbyte,
                ),
            ));
            return Ok((committed, rotated));
        }

        while self.slots.as_ref().expect("present in this loop").1.end() <= time {
            let front_t0 = self.slots.as_ref().expect("present in this loop").0.t0();
            if front_t0 >= self.seq_time0 + self.slot_ntime as u64 {
                self.rotate_sequence(front_t0)?;
                rotated = true;
            }
            let (front, back) = self.slots.take().expect("present in this loop");
            if let Err(e) = self.commit_slot(&front) {
                self.slots = Some((front, back));
                return Err(e);
            }
            committed = true;
            // The old back becomes the front; the committed slot is
            // recycled as the new back.
            let mut recycled = front;
            let new_front = back;
            recycled.reset(new_front.end());
            self.slots = Some((new_front, recycled));
        }
        Ok((committed, rotated))
    }

    /// Commit one slot's window to the ring (or drop it if the epoch was
    /// rejected). Gaps in the slot are already zero.
    fn commit_slot(&mut self, slot: &CaptureSlot) -> Result<()> {
        match &self.wseq {
            Some(seq) => {
                let mut span = seq.reserve(slot.len())?;
                span.copy_from_slice(slot.bytes());
                span.commit()?;
                self.stats.committed += slot.ngood() as u64;
                telemetry::capture_packets(self.ring.name(), "committed", slot.ngood() as u64);
                tracing::trace!(ring = %self.ring.name(), t0 = slot.t0(),
                    ngood = slot.ngood(), "slot committed");
            }
            None => {
                self.stats.rejected += slot.ngood() as u64;
                telemetry::capture_packets(self.ring.name(), "rejected", slot.ngood() as u64);
            }
        }
        Ok(())
    }

    fn flush_slots(&mut self) -> Result<()> {
        if let Some((front, back)) = self.slots.take() {
            // Keep time contiguous: an empty front still commits when the
            // back slot holds data.
            if front.ngood() > 0 || back.ngood() > 0 {
                if let Err(e) = self.commit_slot(&front) {
                    self.slots = Some((front, back));
                    return Err(e);
                }
                if back.ngood() > 0 {
                    if let Err(e) = self.commit_slot(&back) {
                        // Front is already committed; drop only the back.
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.flush_slots()?;
        self.wseq = None;
        self.writer = None;
        self.ended = true;
        tracing::debug!(ring = %self.ring.name(), stats = ?self.stats, "capture ended");
        Ok(())
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if !self.ended {
            if let Err(e) = self.finish() {
                tracing::warn!(ring = %self.ring.name(), error = %e,
                    "failed to flush capture on drop");
            }
        }
    }
}
