//! Ingest datapaths feeding the capture engine.
//!
//! Each source delivers one opaque packet per call. The engine does not
//! care where packets come from; UDP sockets, raw sniffer sockets, and
//! disk packet streams all implement [`PacketSource`]. Kernel-bypass
//! receive is part of the interface but not compiled into this build.

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::UdpSocket;
use std::time::Duration;

/// Which datapath a capture engine ingests from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMethod {
    /// Bound kernel UDP socket.
    Udp,
    /// Raw socket sniffing UDP traffic not addressed to this process.
    Sniffer,
    /// Kernel-bypass receive queue (not available in this build).
    Verbs,
    /// Packet stream read from a file.
    Disk,
}

/// A stream of opaque packets.
pub trait PacketSource: Send {
    /// Read one packet into `buf`, returning its length.
    ///
    /// Returns `Timeout` when no packet arrived within the source's
    /// receive timeout and `EndOfData` when the stream is exhausted.
    fn recv_packet(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// The datapath this source implements.
    fn method(&self) -> CaptureMethod;

    /// Reposition a seekable stream (disk only), returning the new byte
    /// offset.
    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        Err(Error::InvalidState(
            "seek is only supported on disk packet streams".into(),
        ))
    }

    /// Current byte offset of a seekable stream (disk only).
    fn tell(&mut self) -> Result<u64> {
        Err(Error::InvalidState(
            "tell is only supported on disk packet streams".into(),
        ))
    }
}

/// Packets from a bound UDP socket, one datagram each.
pub struct UdpSource {
    socket: UdpSocket,
}

impl UdpSource {
    /// Wrap a bound socket, installing `timeout` as its receive timeout.
    pub fn new(socket: UdpSocket, timeout: Duration) -> Result<Self> {
        socket.set_read_timeout(Some(timeout))?;
        Ok(Self { socket })
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl PacketSource for UdpSource {
    fn recv_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(Error::Timeout)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn method(&self) -> CaptureMethod {
        CaptureMethod::Udp
    }
}

/// UDP payloads sniffed from a raw packet socket.
///
/// The caller supplies an `AF_PACKET`/`SOCK_DGRAM` socket (which requires
/// `CAP_NET_RAW`); this source strips the IPv4 and UDP headers and filters
/// on the destination port. Non-UDP and fragmented traffic is skipped.
pub struct SnifferSource {
    file: File,
    /// Destination port filter; 0 accepts every UDP packet.
    port: u16,
}

impl SnifferSource {
    /// Wrap a raw socket fd, installing `timeout` as its receive timeout.
    pub fn new(fd: OwnedFd, port: u16, timeout: Duration) -> Result<Self> {
        rustix::net::sockopt::set_socket_timeout(
            &fd,
            rustix::net::sockopt::Timeout::Recv,
            Some(timeout),
        )?;
        Ok(Self {
            file: File::from(fd),
            port,
        })
    }

    /// Extract the UDP payload range from a cooked IPv4 frame.
    fn udp_payload(&self, frame: &[u8]) -> Option<(usize, usize)> {
        // IPv4 fixed header: version/IHL first, protocol at byte 9.
        if frame.len() < 20 || frame[0] >> 4 != 4 {
            return None;
        }
        let ihl = ((frame[0] & 0x0F) as usize) * 4;
        if ihl < 20 || frame.len() < ihl + 8 || frame[9] != 17 {
            return None;
        }
        // More-fragments or a nonzero offset: reassembly is out of scope.
        let frag = u16::from_be_bytes([frame[6], frame[7]]);
        if frag & 0x3FFF != 0 {
            return None;
        }
        let udp = &frame[ihl..];
        let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
        if self.port != 0 && dst_port != self.port {
            return None;
        }
        let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
        if udp_len < 8 || frame.len() < ihl + udp_len {
            return None;
        }
        Some((ihl + 8, udp_len - 8))
    }
}

impl PacketSource for SnifferSource {
    fn recv_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        // Skip foreign traffic until a matching payload or the timeout.
        loop {
            let n = match self.file.read(buf) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(Error::Timeout)
                }
                Err(e) => return Err(Error::Io(e)),
            };
            if let Some((offset, len)) = self.udp_payload(&buf[..n]) {
                buf.copy_within(offset..offset + len, 0);
                return Ok(len);
            }
        }
    }

    fn method(&self) -> CaptureMethod {
        CaptureMethod::Sniffer
    }
}

/// Kernel-bypass receive queue (Infiniband verbs).
///
/// Not compiled into this build: the constructor reports
/// [`Error::Unsupported`]. The variant exists so deployments select the
/// datapath by configuration and fail cleanly where the hardware stack is
/// absent.
pub struct VerbsSource {
    _private: (),
}

impl VerbsSource {
    /// Always fails in this build.
    pub fn new() -> Result<Self> {
        Err(Error::Unsupported("kernel-bypass (verbs) capture"))
    }
}

impl PacketSource for VerbsSource {
    fn recv_packet(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported("kernel-bypass (verbs) capture"))
    }

    fn method(&self) -> CaptureMethod {
        CaptureMethod::Verbs
    }
}

/// Fixed-size packets read sequentially from a file.
pub struct DiskSource {
    file: File,
    packet_size: usize,
}

impl DiskSource {
    /// Read `packet_size`-byte packets from `file`.
    pub fn new(file: File, packet_size: usize) -> Result<Self> {
        if packet_size == 0 {
            return Err(Error::InvalidArgument("packet size must be > 0".into()));
        }
        Ok(Self { file, packet_size })
    }

    /// The fixed on-disk packet size.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }
}

impl PacketSource for DiskSource {
    fn recv_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.packet_size {
            return Err(Error::InvalidArgument(format!(
                "receive buffer ({}) smaller than packet size ({})",
                buf.len(),
                self.packet_size
            )));
        }
        let mut read = 0;
        while read < self.packet_size {
            match self.file.read(&mut buf[read..self.packet_size]) {
                Ok(0) => {
                    if read > 0 {
                        tracing::warn!(read, expected = self.packet_size,
                            "trailing partial packet at end of stream");
                    }
                    return Err(Error::EndOfData);
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(self.packet_size)
    }

    fn method(&self) -> CaptureMethod {
        CaptureMethod::Disk
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos = self.file.seek(pos)?;
        if new_pos % self.packet_size as u64 != 0 {
            // Land back on the packet grid before anyone reads from the
            // middle of a packet; the format has no resync marker.
            let aligned = new_pos - new_pos % self.packet_size as u64;
            self.file.seek(SeekFrom::Start(aligned))?;
            return Err(Error::InvalidArgument(format!(
                "seek to byte {new_pos} lands inside a {}-byte packet",
                self.packet_size
            )));
        }
        Ok(new_pos)
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }
}
