//! Error types shared by the relay server, the client and the authenticators.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use thiserror::Error;

use crate::packets::PacketError;
use crate::protocol::Status;

/// Result type alias for SP3 operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad failure categories.
///
/// None of them is retried automatically. A caller may rerun a whole
/// authentication attempt, which always starts from a fresh handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed configuration, fatal to the attempt.
    Configuration,
    /// Dial, read or write failure on a raw or control socket.
    Network,
    /// Malformed or unexpected message; the connection is closed.
    Protocol,
    /// The peer could not prove what it claimed.
    Authentication,
    /// A packet violated the destination restriction of its stream.
    Validation,
}

/// Errors that can occur while authenticating or relaying packets.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The reflector registry is empty.
    #[error("no servers configured for reflection")]
    NoServersConfigured,

    /// Network I/O error on a raw or control socket.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Control channel (websocket) failure.
    #[error("control channel error: {0}")]
    Channel(#[from] tokio_tungstenite::tungstenite::Error),

    /// A blocking read did not complete in time.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The control channel failed earlier; the connection is unusable.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Message could not be encoded or decoded.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// Message arrived in a state that does not accept it.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Raw buffer did not decode as the expected layer.
    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),

    /// The reply to our SYN carried no TCP segment.
    #[error("SYN-ACK not understood")]
    SynAckNotUnderstood,

    /// The challenge was never delivered, or was delivered empty.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The server answered with a non-Okay status.
    #[error("server rejected authentication with status {0:?}")]
    AuthenticationRejected(Status),

    /// Claimed reflector is not in the registry.
    #[error("untrusted reflector {0}")]
    UntrustedReflector(Ipv4Addr),

    /// No live session from the requested destination to relay through.
    #[error("no active connection from requested destination {0}")]
    NoActiveConnection(IpAddr),

    /// Challenge in the Authorization does not match the one issued.
    #[error("challenge mismatch")]
    ChallengeMismatch,

    /// Requested method or address family is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Packet is addressed somewhere other than the authorized destination.
    #[error("intended packet was to {actual}, not the authorized {authorized}")]
    InvalidDestination { actual: IpAddr, authorized: IpAddr },
}

impl Error {
    /// Returns the failure category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::NoServersConfigured => ErrorKind::Configuration,
            Error::Network(_)
            | Error::Channel(_)
            | Error::Timeout(_)
            | Error::ConnectionFailed(_) => ErrorKind::Network,
            Error::Json(_) | Error::Protocol(_) | Error::Packet(_) | Error::SynAckNotUnderstood => {
                ErrorKind::Protocol
            }
            Error::AuthenticationFailed
            | Error::AuthenticationRejected(_)
            | Error::UntrustedReflector(_)
            | Error::NoActiveConnection(_)
            | Error::ChallengeMismatch
            | Error::Unsupported(_) => ErrorKind::Authentication,
            Error::InvalidDestination { .. } => ErrorKind::Validation,
        }
    }

    /// Creates a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}
