//! Path reflection, client role.
//!
//! We open a raw TCP handshake towards a trusted reflector while claiming our
//! public address, learn the reflector's initial sequence number from its
//! SYN-ACK, and hand the resulting handshake state to the server. The server
//! then injects a request into that connection; the reflector's answer comes
//! back to us, and the listener started here pulls the token out of it.

use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pnet::packet::tcp::TcpFlags;
use rand::Rng;

use super::{raw::PnetDialer, Authenticator, ChallengeSender, RawConnection, RawDialer};
use crate::{
    challenger::TOKEN_MARKER,
    error::{Error, Result},
    packets::{self, LayerType, TcpHeader, HANDSHAKE_WINDOW},
    protocol::{AuthenticationMethod, HandshakeState},
    reflectors::ReflectorRegistry,
};

/// Lower bound of the ephemeral port range (Linux default).
pub const IP_LOCAL_PORT_LOW: u16 = 32768;
/// Upper bound of the ephemeral port range (Linux default).
pub const IP_LOCAL_PORT_HIGH: u16 = 60999;
/// Reflectors are contacted over plain HTTP.
pub const REFLECTOR_PORT: u16 = 80;

const READ_BUFFER_LEN: usize = 2048;

/// Proves address ownership through a trusted reflector.
///
/// One instance may run several attempts; each attempt draws a fresh
/// reflector, port and initial sequence number.
pub struct PathReflectionAuth {
    registry: Arc<ReflectorRegistry>,
    client_ip: Ipv4Addr,
    dialer: Box<dyn RawDialer>,
    read_timeout: Option<Duration>,
}

impl PathReflectionAuth {
    /// Uses the real raw socket dialer and blocks on reads without a timeout.
    pub fn new(registry: Arc<ReflectorRegistry>, client_ip: Ipv4Addr) -> Self {
        PathReflectionAuth {
            registry,
            client_ip,
            dialer: Box::new(PnetDialer),
            read_timeout: None,
        }
    }

    /// Loads the reflector registry from a JSON file.
    pub fn from_file(path: &Path, client_ip: Ipv4Addr) -> Result<Self> {
        Ok(Self::new(
            Arc::new(ReflectorRegistry::load(path)?),
            client_ip,
        ))
    }

    /// Uses the registry a relay publishes at `url`, so the chosen reflector
    /// is one that relay trusts.
    pub async fn from_url(url: &str, client_ip: Ipv4Addr) -> Result<Self> {
        Ok(Self::new(
            Arc::new(ReflectorRegistry::fetch(url).await?),
            client_ip,
        ))
    }

    pub fn with_dialer(mut self, dialer: Box<dyn RawDialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Bounds the SYN-ACK read and the reflected-token read.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Authenticator for PathReflectionAuth {
    async fn authenticate(
        &mut self,
        notify: ChallengeSender,
    ) -> Result<(AuthenticationMethod, Vec<u8>)> {
        let (reflector, client_port, sequence_number) = {
            let mut rng = rand::thread_rng();
            let reflector = self
                .registry
                .choose(&mut rng)
                .ok_or(Error::NoServersConfigured)?;
            (
                reflector,
                rng.gen_range(IP_LOCAL_PORT_LOW..IP_LOCAL_PORT_HIGH),
                rng.gen::<u32>(),
            )
        };
        log::info!("Connection will be to {}", reflector);

        let mut conn = self.dialer.dial(reflector)?;
        conn.set_read_timeout(self.read_timeout)?;

        let state = HandshakeState {
            server_ip: reflector,
            server_port: REFLECTOR_PORT,
            client_ip: self.client_ip,
            client_port,
            sequence_number,
            acknowledgement_number: 0,
        };

        let timeout = self.read_timeout;
        let (conn, state) =
            tokio::task::spawn_blocking(move || handshake(conn, state, timeout))
                .await
                .map_err(|e| Error::protocol(format!("handshake task failed: {}", e)))??;

        tokio::task::spawn_blocking(move || listen(conn, notify));

        Ok((AuthenticationMethod::PathReflection, state.to_options()?))
    }
}

/// Sends the SYN and records the reflector's sequence number.
fn handshake(
    mut conn: Box<dyn RawConnection>,
    mut state: HandshakeState,
    timeout: Option<Duration>,
) -> Result<(Box<dyn RawConnection>, HandshakeState)> {
    let syn = TcpHeader {
        source_port: state.client_port,
        destination_port: state.server_port,
        sequence: state.sequence_number,
        acknowledgement: 0,
        flags: TcpFlags::SYN,
        window: HANDSHAKE_WINDOW,
    };
    let segment = packets::build_tcp_segment(state.client_ip, state.server_ip, &syn, &[])?;

    log::debug!("About to write SYN to {}", state.server_ip);
    conn.write(&segment)?;

    log::debug!("Waiting for SYN-ACK");
    let mut buf = [0u8; READ_BUFFER_LEN];
    let n = conn.read(&mut buf).map_err(|e| read_error(e, timeout))?;
    let reply = packets::decode(&buf[..n], LayerType::Tcp).map_err(|e| {
        log::debug!("SYN-ACK decode failed: {}", e);
        Error::SynAckNotUnderstood
    })?;
    let tcp = reply.tcp.ok_or(Error::SynAckNotUnderstood)?;
    state.acknowledgement_number = tcp.sequence.wrapping_add(1);

    Ok((conn, state))
}

/// Waits for the reflected traffic and delivers the token (or "").
fn listen(mut conn: Box<dyn RawConnection>, notify: ChallengeSender) {
    let mut buf = [0u8; READ_BUFFER_LEN];
    let token = match conn.read(&mut buf) {
        Ok(n) => {
            log::debug!("Path reflection got an incoming packet");
            match packets::decode(&buf[..n], LayerType::Tcp) {
                Ok(decoded) => decoded
                    .payload_text()
                    .map(|text| extract_token(&text))
                    .unwrap_or_default(),
                Err(e) => {
                    log::warn!("Couldn't parse path reflection packet: {}", e);
                    String::new()
                }
            }
        }
        Err(e) => {
            log::warn!("Couldn't read path reflection packet: {}", e);
            String::new()
        }
    };

    if notify.blocking_send(token).is_err() {
        log::debug!("Challenge receiver went away before the token arrived");
    }
}

fn read_error(e: io::Error, timeout: Option<Duration>) -> Error {
    match (e.kind(), timeout) {
        (io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock, Some(t)) => Error::Timeout(t),
        _ => Error::Network(e),
    }
}

/// Returns the alphanumeric run right after the first `sp3.` marker.
///
/// Empty when the marker is missing or directly followed by a
/// non-alphanumeric character.
pub fn extract_token(text: &str) -> String {
    match text.find(TOKEN_MARKER) {
        Some(idx) => text[idx + TOKEN_MARKER.len()..]
            .chars()
            .take_while(char::is_ascii_alphanumeric)
            .collect(),
        None => String::new(),
    }
}
