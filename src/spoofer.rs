//! Spoofed-packet injection on a raw link.
//!
//! Every datagram goes through [`Spoofer::inject`], which decodes its IPv4
//! header and refuses it unless the destination equals the one the caller is
//! authorized for. Accepted datagrams are handed to a [`FrameSink`]: the raw
//! Ethernet link in production, or an in-memory capture channel for tests and
//! dry runs.

use std::io;
use std::net::IpAddr;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};

use pnet::{
    datalink::{self, Channel::Ethernet, DataLinkSender, NetworkInterface},
    packet::ethernet::{EtherTypes, MutableEthernetPacket},
    util::MacAddr,
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    error::{Error, Result},
    packets::{self, LayerType},
};

/// Destination MAC, source MAC and EtherType.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Packets buffered per forwarding stream before the session blocks.
const STREAM_QUEUE_DEPTH: usize = 64;

/// Transmit side of a raw link.
///
/// Implementations receive a complete IPv4 datagram and are responsible for
/// any link-layer framing.
pub trait FrameSink: Send {
    fn transmit(&mut self, datagram: &[u8]) -> io::Result<()>;
}

/// Builds the fixed Ethernet header prepended to every datagram.
pub fn link_header(source: MacAddr, destination: MacAddr) -> [u8; ETHERNET_HEADER_LEN] {
    let mut header = [0u8; ETHERNET_HEADER_LEN];
    if let Some(mut frame) = MutableEthernetPacket::new(&mut header[..]) {
        frame.set_destination(destination);
        frame.set_source(source);
        frame.set_ethertype(EtherTypes::Ipv4);
    }
    header
}

/// Ethernet transmit handle opened through `pnet::datalink`.
///
/// Requires raw socket capabilities (root/CAP_NET_RAW on Linux).
pub struct LinkSink {
    interface: NetworkInterface,
    tx: Box<dyn DataLinkSender>,
    header: [u8; ETHERNET_HEADER_LEN],
}

impl LinkSink {
    /// Opens an Ethernet channel on the named device.
    pub fn open(device: &str, source: MacAddr, destination: MacAddr) -> Result<Self> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == device)
            .ok_or_else(|| Error::configuration(format!("no interface named {}", device)))?;

        let tx = match datalink::channel(&interface, Default::default()) {
            Ok(Ethernet(tx, _)) => tx,
            Ok(_) => {
                return Err(Error::Unsupported(format!(
                    "unhandled channel type for interface {}",
                    interface.name
                )))
            }
            Err(e) => return Err(Error::Network(e)),
        };

        log::info!(
            "Raw link opened on {} ({} -> {})",
            interface.name,
            source,
            destination
        );
        Ok(LinkSink {
            interface,
            tx,
            header: link_header(source, destination),
        })
    }
}

impl FrameSink for LinkSink {
    fn transmit(&mut self, datagram: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + datagram.len());
        frame.extend_from_slice(&self.header);
        frame.extend_from_slice(datagram);
        match self.tx.send_to(&frame, None) {
            Some(result) => result,
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("no buffer space on {}", self.interface.name),
            )),
        }
    }
}

/// Hands raw IPv4 datagrams to a channel instead of a link.
pub struct CaptureSink {
    tx: std_mpsc::Sender<Vec<u8>>,
}

impl FrameSink for CaptureSink {
    fn transmit(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "capture channel closed"))
    }
}

/// Serializes injections onto a single raw transmit handle.
pub struct Spoofer {
    sink: Mutex<Box<dyn FrameSink>>,
}

impl Spoofer {
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Spoofer {
            sink: Mutex::new(sink),
        }
    }

    /// Opens the raw link on `device`.
    pub fn open_link(device: &str, source: MacAddr, destination: MacAddr) -> Result<Self> {
        Ok(Self::new(Box::new(LinkSink::open(
            device,
            source,
            destination,
        )?)))
    }

    /// Creates a spoofer whose datagrams are delivered to the returned receiver.
    pub fn capture() -> (Self, std_mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = std_mpsc::channel();
        (Self::new(Box::new(CaptureSink { tx })), rx)
    }

    /// Emits `packet` if its IPv4 destination is `authorized_destination`.
    ///
    /// `claimed_source` is the observed address of the sender on whose behalf
    /// the packet is injected; it is only used for logging.
    pub fn inject(
        &self,
        packet: &[u8],
        claimed_source: IpAddr,
        authorized_destination: IpAddr,
    ) -> Result<()> {
        let decoded = packets::decode(packet, LayerType::Ipv4)?;
        let (spoofed, actual) = match (decoded.source, decoded.destination) {
            (Some(src), Some(dst)) => (src, IpAddr::V4(dst)),
            _ => return Err(Error::protocol("IPv4 header without addresses")),
        };

        if actual != authorized_destination {
            log::warn!(
                "Intended packet was to {} not the authorized {}",
                actual,
                authorized_destination
            );
            return Err(Error::InvalidDestination {
                actual,
                authorized: authorized_destination,
            });
        }

        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = sink.transmit(packet) {
            log::error!("Couldn't send packet: {}", e);
            return Err(Error::Network(e));
        }
        log::debug!(
            "{} bytes sent to {} as {} from {}",
            packet.len(),
            actual,
            spoofed,
            claimed_source
        );
        Ok(())
    }

    /// Opens a forwarding stream restricted to `destination`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_stream(
        self: &Arc<Self>,
        source: IpAddr,
        destination: IpAddr,
    ) -> Result<ForwardingStream> {
        if !destination.is_ipv4() {
            return Err(Error::Unsupported(format!(
                "spoofing towards {} (IPv6)",
                destination
            )));
        }

        let (queue, mut rx) = mpsc::channel::<Vec<u8>>(STREAM_QUEUE_DEPTH);
        let spoofer = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = spoofer.inject(&packet, source, destination) {
                    log::warn!(
                        "Could not spoof message [{} -> {}]: {}",
                        source,
                        destination,
                        e
                    );
                }
            }
        });

        Ok(ForwardingStream {
            destination,
            queue: Some(queue),
            task: Some(task),
        })
    }
}

/// Per-session queue of outbound packets bound to one destination.
///
/// Dropping the stream aborts its worker so nothing more is emitted for the
/// session; [`ForwardingStream::close`] drains queued packets first.
pub struct ForwardingStream {
    destination: IpAddr,
    queue: Option<mpsc::Sender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl ForwardingStream {
    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    /// Queues a packet for injection.
    pub async fn forward(&self, packet: Vec<u8>) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| Error::ConnectionFailed("forwarding stream closed".to_string()))?;
        queue
            .send(packet)
            .await
            .map_err(|_| Error::ConnectionFailed("forwarding stream closed".to_string()))
    }

    /// Stops accepting packets and waits until queued ones are processed.
    pub async fn close(mut self) {
        self.queue.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ForwardingStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
