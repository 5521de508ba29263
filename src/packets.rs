//! IPv4/TCP/UDP packet construction and strict single-layer decoding.
//!
//! Builders fill in every length and checksum field (IPv4 header checksum,
//! TCP/UDP checksums over the IPv4 pseudo-header). Decoders accept a buffer
//! only if the requested layer parses completely; a partially valid buffer is
//! an error, never a best-effort result.
//!
//! IPv4 header as emitted by the builders:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version=4|IHL=5|    TOS = 0    |          Total Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       Identification = 0      |Flags|   Fragment Offset = 0   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   TTL = 64    |   Protocol    |        Header Checksum        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Address                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use pnet::packet::{
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::{self, Ipv4Packet, MutableIpv4Packet},
    tcp::{self, MutableTcpPacket, TcpPacket},
    udp::{self, MutableUdpPacket, UdpPacket},
};
use thiserror::Error;

/// IPv4 header length without options.
pub const IPV4_HEADER_LEN: usize = 20;
/// TCP header length without options.
pub const TCP_HEADER_LEN: usize = 20;
/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;
/// TTL for every datagram we build.
pub const DEFAULT_TTL: u8 = 64;
/// Receive window advertised by the handshake and challenge segments.
pub const HANDSHAKE_WINDOW: u16 = 4380;

/// Layer a raw buffer is expected to start with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    Ipv4,
    Tcp,
    Udp,
}

/// Errors that can occur while building or decoding packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer is shorter than the fixed header.
    #[error("buffer too small for {layer:?} header: need {needed} bytes, got {actual}")]
    Truncated {
        layer: LayerType,
        needed: usize,
        actual: usize,
    },

    /// The version nibble is not 4.
    #[error("not an IPv4 header (version {0})")]
    NotIpv4(u8),

    /// Header length field is below the minimum or past the buffer end.
    #[error("invalid {layer:?} header length {length}")]
    BadHeaderLength { layer: LayerType, length: usize },

    /// Total length field disagrees with the buffer.
    #[error("{layer:?} length field {declared} does not fit buffer of {actual} bytes")]
    BadLength {
        layer: LayerType,
        declared: usize,
        actual: usize,
    },

    /// IPv4 payload is neither TCP nor UDP.
    #[error("unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),

    /// Result would not fit the 16-bit length fields.
    #[error("payload of {0} bytes is too large")]
    TooLarge(usize),
}

/// TCP header fields carried by the handshake and challenge segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    /// Bitwise OR of `pnet::packet::tcp::TcpFlags` constants.
    pub flags: u8,
    pub window: u16,
}

/// Fields recovered from a successful decode.
///
/// Only the fields belonging to the decoded layers are set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    /// Top-level layer that was decoded.
    pub layer: LayerType,
    pub source: Option<Ipv4Addr>,
    pub destination: Option<Ipv4Addr>,
    pub protocol: Option<IpNextHeaderProtocol>,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub tcp: Option<TcpHeader>,
    /// Bytes after the innermost decoded header.
    pub payload: Vec<u8>,
}

impl DecodedPacket {
    fn empty(layer: LayerType) -> Self {
        DecodedPacket {
            layer,
            source: None,
            destination: None,
            protocol: None,
            source_port: None,
            destination_port: None,
            tcp: None,
            payload: Vec::new(),
        }
    }

    /// Application payload as text, if any.
    pub fn payload_text(&self) -> Option<String> {
        if self.payload.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.payload).into_owned())
        }
    }
}

/// Builds a checksummed TCP segment (no IP header).
///
/// The checksum covers the IPv4 pseudo-header for `source` and `destination`.
pub fn build_tcp_segment(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    header: &TcpHeader,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let len = TCP_HEADER_LEN + payload.len();
    if len + IPV4_HEADER_LEN > u16::MAX as usize {
        return Err(PacketError::TooLarge(payload.len()));
    }

    let mut buf = vec![0u8; len];
    let mut segment = MutableTcpPacket::new(&mut buf).ok_or(PacketError::Truncated {
        layer: LayerType::Tcp,
        needed: TCP_HEADER_LEN,
        actual: len,
    })?;
    segment.set_source(header.source_port);
    segment.set_destination(header.destination_port);
    segment.set_sequence(header.sequence);
    segment.set_acknowledgement(header.acknowledgement);
    segment.set_data_offset((TCP_HEADER_LEN / 4) as u8);
    segment.set_flags(header.flags);
    segment.set_window(header.window);
    segment.set_payload(payload);
    let checksum = tcp::ipv4_checksum(&segment.to_immutable(), &source, &destination);
    segment.set_checksum(checksum);

    Ok(buf)
}

/// Builds a checksummed UDP datagram (no IP header).
pub fn build_udp_datagram(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let len = UDP_HEADER_LEN + payload.len();
    if len + IPV4_HEADER_LEN > u16::MAX as usize {
        return Err(PacketError::TooLarge(payload.len()));
    }

    let mut buf = vec![0u8; len];
    let mut datagram = MutableUdpPacket::new(&mut buf).ok_or(PacketError::Truncated {
        layer: LayerType::Udp,
        needed: UDP_HEADER_LEN,
        actual: len,
    })?;
    datagram.set_source(source.port());
    datagram.set_destination(destination.port());
    datagram.set_length(len as u16);
    datagram.set_payload(payload);
    let checksum = udp::ipv4_checksum(&datagram.to_immutable(), source.ip(), destination.ip());
    // Zero on the wire means "no checksum" (RFC 768).
    datagram.set_checksum(if checksum == 0 { 0xFFFF } else { checksum });

    Ok(buf)
}

/// Wraps an already-built transport payload in an IPv4 header.
pub fn build_ipv4(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: IpNextHeaderProtocol,
    transport: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let len = IPV4_HEADER_LEN + transport.len();
    if len > u16::MAX as usize {
        return Err(PacketError::TooLarge(transport.len()));
    }

    let mut buf = vec![0u8; len];
    let mut ip = MutableIpv4Packet::new(&mut buf).ok_or(PacketError::Truncated {
        layer: LayerType::Ipv4,
        needed: IPV4_HEADER_LEN,
        actual: len,
    })?;
    ip.set_version(4);
    ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
    ip.set_total_length(len as u16);
    ip.set_ttl(DEFAULT_TTL);
    ip.set_next_level_protocol(protocol);
    ip.set_source(source);
    ip.set_destination(destination);
    ip.set_payload(transport);
    let checksum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(checksum);

    Ok(buf)
}

/// Builds a complete IPv4 datagram carrying a TCP segment.
pub fn build_ipv4_tcp(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    header: &TcpHeader,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let segment = build_tcp_segment(source, destination, header, payload)?;
    build_ipv4(source, destination, IpNextHeaderProtocols::Tcp, &segment)
}

/// Builds a complete IPv4 datagram carrying a UDP datagram.
pub fn build_ipv4_udp(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let datagram = build_udp_datagram(source, destination, payload)?;
    build_ipv4(
        *source.ip(),
        *destination.ip(),
        IpNextHeaderProtocols::Udp,
        &datagram,
    )
}

/// Decodes exactly one layer of the given type from the start of `buf`.
pub fn decode(buf: &[u8], layer: LayerType) -> Result<DecodedPacket, PacketError> {
    match layer {
        LayerType::Ipv4 => decode_ipv4(buf),
        LayerType::Tcp => decode_tcp(buf),
        LayerType::Udp => decode_udp(buf),
    }
}

/// Decodes an IPv4 datagram together with its TCP or UDP header.
///
/// Fails if the IPv4 layer is invalid, carries another protocol, or the
/// transport header does not decode.
pub fn decode_ipv4_transport(buf: &[u8]) -> Result<DecodedPacket, PacketError> {
    let ip = decode_ipv4(buf)?;
    let inner = match ip.protocol {
        Some(IpNextHeaderProtocols::Tcp) => decode_tcp(&ip.payload)?,
        Some(IpNextHeaderProtocols::Udp) => decode_udp(&ip.payload)?,
        Some(other) => return Err(PacketError::UnsupportedProtocol(other.0)),
        None => return Err(PacketError::UnsupportedProtocol(0)),
    };

    Ok(DecodedPacket {
        layer: LayerType::Ipv4,
        source: ip.source,
        destination: ip.destination,
        protocol: ip.protocol,
        ..inner
    })
}

/// Checks the IPv4 header checksum and, for TCP/UDP, the transport checksum.
pub fn verify_checksums(buf: &[u8]) -> Result<bool, PacketError> {
    let decoded = decode_ipv4(buf)?;
    let ip = Ipv4Packet::new(buf).ok_or(PacketError::Truncated {
        layer: LayerType::Ipv4,
        needed: IPV4_HEADER_LEN,
        actual: buf.len(),
    })?;
    if ipv4::checksum(&ip) != ip.get_checksum() {
        return Ok(false);
    }

    let source = ip.get_source();
    let destination = ip.get_destination();
    let transport = &decoded.payload;
    match ip.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            decode_tcp(transport)?;
            let segment = TcpPacket::new(transport).ok_or(PacketError::Truncated {
                layer: LayerType::Tcp,
                needed: TCP_HEADER_LEN,
                actual: transport.len(),
            })?;
            Ok(tcp::ipv4_checksum(&segment, &source, &destination) == segment.get_checksum())
        }
        IpNextHeaderProtocols::Udp => {
            decode_udp(transport)?;
            let datagram = UdpPacket::new(transport).ok_or(PacketError::Truncated {
                layer: LayerType::Udp,
                needed: UDP_HEADER_LEN,
                actual: transport.len(),
            })?;
            let computed = udp::ipv4_checksum(&datagram, &source, &destination);
            Ok(match datagram.get_checksum() {
                0 => true,
                0xFFFF => computed == 0 || computed == 0xFFFF,
                stored => stored == computed,
            })
        }
        _ => Ok(true),
    }
}

fn decode_ipv4(buf: &[u8]) -> Result<DecodedPacket, PacketError> {
    let ip = Ipv4Packet::new(buf).ok_or(PacketError::Truncated {
        layer: LayerType::Ipv4,
        needed: IPV4_HEADER_LEN,
        actual: buf.len(),
    })?;

    let version = ip.get_version();
    if version != 4 {
        return Err(PacketError::NotIpv4(version));
    }
    let header_len = ip.get_header_length() as usize * 4;
    if header_len < IPV4_HEADER_LEN || header_len > buf.len() {
        return Err(PacketError::BadHeaderLength {
            layer: LayerType::Ipv4,
            length: header_len,
        });
    }
    let total_len = ip.get_total_length() as usize;
    if total_len < header_len || total_len > buf.len() {
        return Err(PacketError::BadLength {
            layer: LayerType::Ipv4,
            declared: total_len,
            actual: buf.len(),
        });
    }

    let mut decoded = DecodedPacket::empty(LayerType::Ipv4);
    decoded.source = Some(ip.get_source());
    decoded.destination = Some(ip.get_destination());
    decoded.protocol = Some(ip.get_next_level_protocol());
    decoded.payload = buf[header_len..total_len].to_vec();
    Ok(decoded)
}

fn decode_tcp(buf: &[u8]) -> Result<DecodedPacket, PacketError> {
    let segment = TcpPacket::new(buf).ok_or(PacketError::Truncated {
        layer: LayerType::Tcp,
        needed: TCP_HEADER_LEN,
        actual: buf.len(),
    })?;

    let header_len = segment.get_data_offset() as usize * 4;
    if header_len < TCP_HEADER_LEN || header_len > buf.len() {
        return Err(PacketError::BadHeaderLength {
            layer: LayerType::Tcp,
            length: header_len,
        });
    }

    let mut decoded = DecodedPacket::empty(LayerType::Tcp);
    decoded.source_port = Some(segment.get_source());
    decoded.destination_port = Some(segment.get_destination());
    decoded.tcp = Some(TcpHeader {
        source_port: segment.get_source(),
        destination_port: segment.get_destination(),
        sequence: segment.get_sequence(),
        acknowledgement: segment.get_acknowledgement(),
        flags: segment.get_flags(),
        window: segment.get_window(),
    });
    decoded.payload = buf[header_len..].to_vec();
    Ok(decoded)
}

fn decode_udp(buf: &[u8]) -> Result<DecodedPacket, PacketError> {
    let datagram = UdpPacket::new(buf).ok_or(PacketError::Truncated {
        layer: LayerType::Udp,
        needed: UDP_HEADER_LEN,
        actual: buf.len(),
    })?;

    let declared = datagram.get_length() as usize;
    if declared < UDP_HEADER_LEN || declared > buf.len() {
        return Err(PacketError::BadLength {
            layer: LayerType::Udp,
            declared,
            actual: buf.len(),
        });
    }

    let mut decoded = DecodedPacket::empty(LayerType::Udp);
    decoded.source_port = Some(datagram.get_source());
    decoded.destination_port = Some(datagram.get_destination());
    decoded.payload = buf[UDP_HEADER_LEN..declared].to_vec();
    Ok(decoded)
}
