//! The `simple` reference packet format.
//!
//! One packet carries one time sample of `nchan` complex int8 values for
//! one source, behind a fixed 16-byte header. It exists to exercise the
//! full decoder/processor interface and to generate synthetic streams in
//! tests and loopback demos; instrument formats live out of tree and plug
//! in through the same traits.
//!
//! ```text
//! 0        4        8     10     12        16
//! ├─ sync ─┼─ seq ──┼─ src ┼ nchan ┼─ chan0 ─┤ payload: nchan * 2 bytes
//! ```
//!
//! All header fields are big-endian.

use super::format::{PacketDecoder, PacketDesc, PacketProcessor, SlotGeometry};

/// Sync word opening every `simple` packet.
pub const SYNC_WORD: u32 = 0xB1F0_C0DE;

/// Header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Encode one `simple` packet into a fresh buffer.
///
/// `payload` must hold `nchan * 2` bytes.
pub fn encode_packet(seq: u32, src: u16, chan0: u32, nchan: u16, payload: &[u8]) -> Vec<u8> {
    assert_eq!(payload.len(), nchan as usize * 2, "payload is nchan complex int8");
    let mut pkt = Vec::with_capacity(HEADER_LEN + payload.len());
    pkt.extend_from_slice(&SYNC_WORD.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&src.to_be_bytes());
    pkt.extend_from_slice(&nchan.to_be_bytes());
    pkt.extend_from_slice(&chan0.to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

/// Decoder for the `simple` format.
pub struct SimpleDecoder {
    nsrc: u32,
    nchan: u16,
}

impl SimpleDecoder {
    /// `nsrc` is the expected number of source streams (reported in every
    /// descriptor); `nchan` fixes the on-disk packet size for framing.
    pub fn new(nsrc: u32, nchan: u16) -> Self {
        Self { nsrc, nchan }
    }
}

impl PacketDecoder for SimpleDecoder {
    fn packet_size(&self) -> Option<usize> {
        Some(HEADER_LEN + self.nchan as usize * 2)
    }

    fn decode(&mut self, packet: &[u8]) -> Option<PacketDesc> {
        if packet.len() < HEADER_LEN {
            return None;
        }
        let sync = u32::from_be_bytes(packet[0..4].try_into().ok()?);
        if sync != SYNC_WORD {
            return None;
        }
        let seq = u32::from_be_bytes(packet[4..8].try_into().ok()?) as u64;
        let src = u16::from_be_bytes(packet[8..10].try_into().ok()?) as u32;
        let nchan = u16::from_be_bytes(packet[10..12].try_into().ok()?);
        let chan0 = u32::from_be_bytes(packet[12..16].try_into().ok()?);
        let payload_size = nchan as usize * 2;
        if packet.len() < HEADER_LEN + payload_size {
            return None;
        }
        Some(PacketDesc {
            seq,
            src,
            nsrc: self.nsrc,
            chan0,
            nchan: nchan as u32,
            decimation: 1,
            nbit: 8,
            payload_offset: HEADER_LEN,
            payload_size,
        })
    }
}

/// Processor for the `simple` format: payloads land in the slot verbatim,
/// `[time][source][channel]`.
pub struct SimpleProcessor;

impl PacketProcessor for SimpleProcessor {
    fn frame_nbyte(&self, desc: &PacketDesc) -> usize {
        desc.payload_size
    }

    fn scatter(&mut self, _desc: &PacketDesc, payload: &[u8], slot: &mut [u8], geo: &SlotGeometry) {
        let offset = geo.frame_offset();
        slot[offset..offset + payload.len()].copy_from_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_round_trip() {
        let payload: Vec<u8> = (0..128).collect();
        let pkt = encode_packet(7, 3, 100, 64, &payload);

        let mut decoder = SimpleDecoder::new(4, 64);
        let desc = decoder.decode(&pkt).unwrap();
        assert_eq!(desc.seq, 7);
        assert_eq!(desc.src, 3);
        assert_eq!(desc.chan0, 100);
        assert_eq!(desc.nchan, 64);
        assert_eq!(desc.payload_size, 128);
        assert_eq!(&pkt[desc.payload_offset..], &payload[..]);
        assert_eq!(decoder.packet_size(), Some(144));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut decoder = SimpleDecoder::new(1, 4);
        assert!(decoder.decode(b"short").is_none());
        // Right length, wrong sync word.
        let mut pkt = encode_packet(0, 0, 0, 4, &[0; 8]);
        pkt[0] ^= 0xFF;
        assert!(decoder.decode(&pkt).is_none());
        // Truncated payload.
        let pkt = encode_packet(0, 0, 0, 4, &[0; 8]);
        assert!(decoder.decode(&pkt[..HEADER_LEN + 4]).is_none());
    }

    #[test]
    fn test_scatter_places_frame() {
        let desc = SimpleDecoder::new(2, 2).decode(&encode_packet(0, 1, 0, 2, &[9, 8, 7, 6])).unwrap();
        let geo = SlotGeometry {
            time_in_slot: 1,
            src_index: 1,
            nsrc: 2,
            frame_nbyte: 4,
        };
        let mut slot = vec![0u8; 4 * 4];
        SimpleProcessor.scatter(&desc, &[9, 8, 7, 6], &mut slot, &geo);
        assert_eq!(&slot[12..16], &[9, 8, 7, 6]);
        assert!(slot[..12].iter().all(|b| *b == 0));
    }
}
