//! Server side of path reflection.
//!
//! The server replays the client's half-open TCP connection to a trusted
//! reflector by injecting an ACK, spoofed from the client's claimed address,
//! that carries `GET /sp3.<token>/`. The reflector answers the claimed
//! address, so only the real holder of that address sees traffic containing
//! the token and can echo it back as its Authorization.

use std::net::IpAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use pnet::packet::tcp::TcpFlags;
use rand::RngCore;

use crate::{
    error::{Error, Result},
    packets::{self, TcpHeader, HANDSHAKE_WINDOW},
    protocol::HandshakeState,
    reflectors::ReflectorRegistry,
    spoofer::Spoofer,
};

/// Marker that precedes the token in the reflected traffic.
pub const TOKEN_MARKER: &str = "sp3.";

/// Random bytes behind each token.
const TOKEN_ENTROPY: usize = 16;

/// Generates a fresh challenge token.
///
/// 16 random bytes, base64 encoded with `+`, `/` and `=` removed so the token
/// is a single alphanumeric run that survives a URL path and free text.
pub fn generate_token() -> String {
    let mut raw = [0u8; TOKEN_ENTROPY];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    STANDARD
        .encode(raw)
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Builds the HTTP request carried by the injected segment.
pub fn reflection_request(token: &str, host: &str) -> String {
    format!(
        "GET /{}{}/ HTTP/1.0\r\nHost: {}\r\n\r\n",
        TOKEN_MARKER, token, host
    )
}

/// Issues path-reflection challenges through the spoofer.
pub struct PathReflectionChallenger {
    registry: Arc<ReflectorRegistry>,
    spoofer: Arc<Spoofer>,
}

impl PathReflectionChallenger {
    pub fn new(registry: Arc<ReflectorRegistry>, spoofer: Arc<Spoofer>) -> Self {
        PathReflectionChallenger { registry, spoofer }
    }

    pub fn is_trusted(&self, state: &HandshakeState) -> bool {
        self.registry.is_trusted(state.server_ip)
    }

    /// Injects the token-carrying request and returns the expected challenge.
    pub fn challenge(&self, state: &HandshakeState) -> Result<String> {
        let host = self
            .registry
            .hostname(state.server_ip)
            .ok_or(Error::UntrustedReflector(state.server_ip))?;

        let token = generate_token();
        let request = reflection_request(&token, host);
        let header = TcpHeader {
            source_port: state.client_port,
            destination_port: state.server_port,
            sequence: state.sequence_number,
            acknowledgement: state.acknowledgement_number,
            flags: TcpFlags::ACK,
            window: HANDSHAKE_WINDOW,
        };
        let packet =
            packets::build_ipv4_tcp(state.client_ip, state.server_ip, &header, request.as_bytes())?;

        self.spoofer.inject(
            &packet,
            IpAddr::V4(state.client_ip),
            IpAddr::V4(state.server_ip),
        )?;
        log::debug!(
            "Sent path reflection challenge via {} ({}) for {}:{}",
            state.server_ip,
            host,
            state.client_ip,
            state.client_port
        );

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::decode_ipv4_transport;
    use std::collections::{HashMap, HashSet};
    use std::net::Ipv4Addr;

    fn state(server_ip: Ipv4Addr) -> HandshakeState {
        HandshakeState {
            server_ip,
            server_port: 80,
            client_ip: Ipv4Addr::new(192, 0, 2, 33),
            client_port: 45000,
            sequence_number: 1000,
            acknowledgement_number: 5001,
        }
    }

    fn challenger() -> (PathReflectionChallenger, std::sync::mpsc::Receiver<Vec<u8>>) {
        let registry = ReflectorRegistry::new(HashMap::from([(
            Ipv4Addr::LOCALHOST,
            "test-host".to_string(),
        )]));
        let (spoofer, rx) = Spoofer::capture();
        (
            PathReflectionChallenger::new(Arc::new(registry), Arc::new(spoofer)),
            rx,
        )
    }

    #[test]
    fn test_token_shape() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let token = generate_token();
            assert!(!token.is_empty());
            assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(seen.insert(token));
        }
    }

    #[test]
    fn test_reflection_request() {
        assert_eq!(
            reflection_request("AbC123", "test-host"),
            "GET /sp3.AbC123/ HTTP/1.0\r\nHost: test-host\r\n\r\n"
        );
    }

    #[test]
    fn test_trust() {
        let (challenger, _rx) = challenger();
        assert!(challenger.is_trusted(&state(Ipv4Addr::LOCALHOST)));
        assert!(!challenger.is_trusted(&state(Ipv4Addr::new(10, 9, 9, 9))));
    }

    #[test]
    fn test_challenge_packet() {
        let (challenger, rx) = challenger();
        let st = state(Ipv4Addr::LOCALHOST);
        let token = challenger.challenge(&st).unwrap();

        let packet = rx.try_recv().unwrap();
        assert!(packets::verify_checksums(&packet).unwrap());
        let decoded = decode_ipv4_transport(&packet).unwrap();
        assert_eq!(decoded.source, Some(st.client_ip));
        assert_eq!(decoded.destination, Some(st.server_ip));

        let tcp = decoded.tcp.unwrap();
        assert_eq!(tcp.source_port, 45000);
        assert_eq!(tcp.destination_port, 80);
        assert_eq!(tcp.sequence, 1000);
        assert_eq!(tcp.acknowledgement, 5001);
        assert_eq!(tcp.flags, TcpFlags::ACK);
        assert_eq!(tcp.window, HANDSHAKE_WINDOW);
        assert_eq!(
            decoded.payload_text().unwrap(),
            reflection_request(&token, "test-host")
        );
    }

    #[test]
    fn test_challenge_untrusted_reflector() {
        let (challenger, rx) = challenger();
        let err = challenger
            .challenge(&state(Ipv4Addr::new(10, 9, 9, 9)))
            .unwrap_err();
        assert!(matches!(err, Error::UntrustedReflector(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_challenges_are_fresh() {
        let (challenger, _rx) = challenger();
        let st = state(Ipv4Addr::LOCALHOST);
        assert_ne!(
            challenger.challenge(&st).unwrap(),
            challenger.challenge(&st).unwrap()
        );
    }
}
