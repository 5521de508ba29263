//! Raw IPv4/TCP connection used for the spoofed handshake.
//!
//! The OS performs no handshake: we write bare TCP segments and read every
//! TCP segment the reflector sends to this host. Requires raw socket
//! capabilities (root/CAP_NET_RAW on Linux).

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use pnet::packet::{ip::IpNextHeaderProtocols, tcp::TcpPacket, Packet};
use pnet::transport::{
    tcp_packet_iter, transport_channel, TransportChannelType, TransportProtocol,
    TransportReceiver, TransportSender,
};

/// Kernel buffer for the raw transport channel.
const CHANNEL_BUFFER: usize = 4096;

/// Blocking raw TCP connection to one peer.
pub trait RawConnection: Send {
    /// Sends one TCP segment (no IP header).
    fn write(&mut self, segment: &[u8]) -> io::Result<usize>;

    /// Reads one TCP segment from the peer (no IP header).
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// `None` blocks indefinitely.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

/// Opens raw connections.
pub trait RawDialer: Send + Sync {
    fn dial(&self, peer: Ipv4Addr) -> io::Result<Box<dyn RawConnection>>;
}

/// Dials through a `pnet` layer-4 TCP transport channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct PnetDialer;

impl RawDialer for PnetDialer {
    fn dial(&self, peer: Ipv4Addr) -> io::Result<Box<dyn RawConnection>> {
        let (tx, rx) = transport_channel(
            CHANNEL_BUFFER,
            TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Tcp)),
        )?;
        Ok(Box::new(PnetTcpConnection {
            peer,
            tx,
            rx,
            read_timeout: None,
        }))
    }
}

/// Raw TCP channel filtered to segments from a single peer.
pub struct PnetTcpConnection {
    peer: Ipv4Addr,
    tx: TransportSender,
    rx: TransportReceiver,
    read_timeout: Option<Duration>,
}

impl RawConnection for PnetTcpConnection {
    fn write(&mut self, segment: &[u8]) -> io::Result<usize> {
        let packet = TcpPacket::new(segment).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "segment shorter than TCP header")
        })?;
        self.tx.send_to(packet, IpAddr::V4(self.peer))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let peer = IpAddr::V4(self.peer);
        let deadline = self.read_timeout.map(|t| Instant::now() + t);
        let mut iter = tcp_packet_iter(&mut self.rx);

        loop {
            let (segment, from) = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // A zero receive timeout would block forever.
                    if remaining.is_zero() {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "no segment from reflector",
                        ));
                    }
                    match iter.next_with_timeout(remaining)? {
                        Some(next) => next,
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "no segment from reflector",
                            ))
                        }
                    }
                }
                None => iter.next()?,
            };

            // Other TCP traffic to this host is visible on the raw socket too.
            if from != peer {
                continue;
            }
            let bytes = segment.packet();
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            return Ok(n);
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }
}
