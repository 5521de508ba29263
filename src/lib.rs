//! SP3 Suite - spoofed-packet relay with source address authentication.
//!
//! A sender proves to the relay that it controls the source address it claims
//! before the relay forwards raw packets spoofed from that address. Proof is
//! either a challenge relayed over a live control connection of the
//! destination, or path reflection: a TCP handshake spoofed towards a trusted
//! reflector so that only the real holder of the address sees the token.
//!
//! # Usage
//!
//! Run the relay:
//! ```bash
//! sp3d --port 8080 --device eth0 --dst-mac 0a1b2c3d4e5f
//! ```
//!
//! Send a spoofed datagram through it:
//! ```bash
//! sp3 --server ws://relay:8080/sp3 --destination 192.0.2.7 --method path-reflection --claimed-addr 198.51.100.4
//! ```

/// Client-side authentication methods.
pub mod authenticator;
/// Path reflection challenges and tokens.
pub mod challenger;
/// Control-channel client.
pub mod client;
/// Command-line configuration and validation.
pub mod configuration;
/// Crate error taxonomy.
pub mod error;
/// IPv4/TCP/UDP packet building and parsing.
pub mod packets;
/// Control messages and their JSON wire form.
pub mod protocol;
/// Trusted reflector registry.
pub mod reflectors;
/// Relay server and session state machine.
pub mod server;
/// Spoofed packet injection.
pub mod spoofer;

pub use error::{Error, ErrorKind, Result};
