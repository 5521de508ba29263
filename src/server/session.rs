//! Per-connection protocol state machine.
//!
//! ```text
//!  AwaitingHello --Hello(text)--> HelloReceived --Authorization(text)--> Authorized
//!        |                             |                                   |
//!        +------- anything else -------+------- close on violation ------- +--Binary--> stream
//! ```
//!
//! A session only decides what happens next; the connection task owns the
//! websocket and acts on the returned [`Step`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::registry::SessionRegistry;
use crate::{
    challenger::{generate_token, PathReflectionChallenger},
    error::{Error, Result},
    protocol::{
        self, AuthenticationMethod, Authorization, HandshakeState, Hello, ServerMessage, Status,
    },
    reflectors::ReflectorRegistry,
    spoofer::{ForwardingStream, Spoofer},
};

/// Shared collaborators of all sessions on one server.
pub struct ServerContext {
    pub challenger: PathReflectionChallenger,
    /// Published at the registry endpoint.
    pub reflectors: Arc<ReflectorRegistry>,
    pub spoofer: Arc<Spoofer>,
    pub sessions: Arc<SessionRegistry>,
}

/// One control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

/// What the connection task does after a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Reply(ServerMessage),
    /// Send the message, if any, then close.
    Close(Option<ServerMessage>),
}

pub enum SessionState {
    AwaitingHello,
    HelloReceived {
        destination: IpAddr,
        challenge: String,
    },
    Authorized {
        stream: ForwardingStream,
    },
}

pub struct Session {
    remote: SocketAddr,
    connected_at: DateTime<Utc>,
    state: SessionState,
}

impl Session {
    pub fn new(remote: SocketAddr) -> Self {
        Session {
            remote,
            connected_at: Utc::now(),
            state: SessionState::AwaitingHello,
        }
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self.state, SessionState::Authorized { .. })
    }

    /// Declared destination, once a Hello was accepted.
    pub fn destination(&self) -> Option<IpAddr> {
        match &self.state {
            SessionState::AwaitingHello => None,
            SessionState::HelloReceived { destination, .. } => Some(*destination),
            SessionState::Authorized { stream } => Some(stream.destination()),
        }
    }

    pub async fn on_frame(&mut self, frame: Frame, ctx: &ServerContext) -> Step {
        match frame {
            Frame::Text(data) => match self.state {
                SessionState::AwaitingHello => self.on_hello(&data, ctx),
                SessionState::HelloReceived { .. } => self.on_authorization(&data, ctx),
                SessionState::Authorized { .. } => self.unexpected("text"),
            },
            Frame::Binary(packet) => match &self.state {
                SessionState::Authorized { stream } => {
                    log::debug!("Forwarding {} bytes for {}", packet.len(), self.remote);
                    match stream.forward(packet).await {
                        Ok(()) => Step::Continue,
                        Err(e) => {
                            log::warn!("Forwarding stream for {} failed: {}", self.remote, e);
                            Step::Close(None)
                        }
                    }
                }
                _ => self.unexpected("binary"),
            },
        }
    }

    fn unexpected(&self, kind: &str) -> Step {
        log::warn!("Unexpected {} frame from {}", kind, self.remote);
        Step::Close(None)
    }

    fn on_hello(&mut self, data: &[u8], ctx: &ServerContext) -> Step {
        let hello: Hello = match protocol::decode(data) {
            Ok(hello) => hello,
            Err(e) => {
                log::warn!("Hello from {} not understood: {}", self.remote, e);
                return Step::Close(Some(ServerMessage::status(Status::Invalid)));
            }
        };
        let destination: IpAddr = match hello.destination.parse() {
            Ok(ip) => ip,
            Err(_) => {
                log::warn!(
                    "Hello from {} names bad destination {:?}",
                    self.remote,
                    hello.destination
                );
                return Step::Close(Some(ServerMessage::status(Status::Invalid)));
            }
        };

        match authorize(&hello, destination, ctx) {
            Ok(challenge) => {
                log::info!(
                    "{} asked to send to {} ({})",
                    self.remote,
                    destination,
                    hello.method
                );
                self.state = SessionState::HelloReceived {
                    destination,
                    challenge,
                };
                Step::Continue
            }
            Err(e) => {
                log::warn!("Authorize {} failed: {}", self.remote, e);
                let status = match e {
                    Error::Unsupported(_) => Status::Unsupported,
                    _ => Status::Unauthorized,
                };
                Step::Close(Some(ServerMessage::status(status)))
            }
        }
    }

    fn on_authorization(&mut self, data: &[u8], ctx: &ServerContext) -> Step {
        let (destination, expected) = match &self.state {
            SessionState::HelloReceived {
                destination,
                challenge,
            } => (*destination, challenge.as_str()),
            _ => return Step::Close(None),
        };

        let auth: Authorization = match protocol::decode(data) {
            Ok(auth) => auth,
            Err(e) => {
                log::warn!("Authorization from {} not understood: {}", self.remote, e);
                return Step::Close(Some(ServerMessage::status(Status::Invalid)));
            }
        };

        if expected.is_empty() || auth.challenge != expected {
            log::warn!("{} from {}", Error::ChallengeMismatch, self.remote);
            return Step::Close(Some(ServerMessage::status(Status::Unauthorized)));
        }
        if auth.destination.parse::<IpAddr>().ok() != Some(destination) {
            log::warn!(
                "{} authorized for {} but asked for {:?}",
                self.remote,
                destination,
                auth.destination
            );
            return Step::Close(Some(ServerMessage::status(Status::Unauthorized)));
        }

        let stream = match ctx.spoofer.open_stream(self.remote.ip(), destination) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("No forwarding stream for {}: {}", self.remote, e);
                return Step::Close(Some(ServerMessage::status(Status::Unsupported)));
            }
        };
        self.state = SessionState::Authorized { stream };
        log::info!("Authorized {} to send to {}", self.remote, destination);
        Step::Reply(ServerMessage::status(Status::Okay))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let elapsed = Utc::now().signed_duration_since(self.connected_at);
        log::info!(
            "Closed connection from {} after {}s",
            self.remote,
            elapsed.num_seconds()
        );
    }
}

/// Issues the challenge for a Hello, returning the value to expect back.
fn authorize(hello: &Hello, destination: IpAddr, ctx: &ServerContext) -> Result<String> {
    match hello.method {
        AuthenticationMethod::PathReflection => {
            let state = HandshakeState::from_options(&hello.options)?;
            if !ctx.challenger.is_trusted(&state) {
                return Err(Error::UntrustedReflector(state.server_ip));
            }
            ctx.challenger.challenge(&state)
        }
        AuthenticationMethod::DirectChannel => {
            let challenge = generate_token();
            ctx.sessions
                .relay_challenge(destination, ServerMessage::challenge(challenge.clone()))?;
            Ok(challenge)
        }
        AuthenticationMethod::StunInjection => Err(Error::Unsupported(format!(
            "authentication method {}",
            hello.method
        ))),
    }
}
