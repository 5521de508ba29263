//! Control-channel messages and their JSON wire form.
//!
//! Field names follow the established wire format (`DestinationAddress`,
//! `AuthenticationMethod`, ...) so that existing clients interoperate. Byte
//! fields travel as standard base64 strings; `null` decodes as empty.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a sender proves it may use the claimed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AuthenticationMethod {
    /// Challenge relayed over a live control connection of the destination.
    DirectChannel,
    /// Reserved, never accepted.
    StunInjection,
    /// Token reflected back through a trusted third-party web server.
    PathReflection,
}

impl TryFrom<u8> for AuthenticationMethod {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(AuthenticationMethod::DirectChannel),
            1 => Ok(AuthenticationMethod::StunInjection),
            2 => Ok(AuthenticationMethod::PathReflection),
            other => Err(format!("unknown authentication method {}", other)),
        }
    }
}

impl From<AuthenticationMethod> for u8 {
    fn from(method: AuthenticationMethod) -> u8 {
        match method {
            AuthenticationMethod::DirectChannel => 0,
            AuthenticationMethod::StunInjection => 1,
            AuthenticationMethod::PathReflection => 2,
        }
    }
}

impl fmt::Display for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AuthenticationMethod::DirectChannel => write!(f, "direct"),
            AuthenticationMethod::StunInjection => write!(f, "stun-injection"),
            AuthenticationMethod::PathReflection => write!(f, "path-reflection"),
        }
    }
}

/// Server verdict attached to every server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Status {
    #[default]
    Okay,
    /// Sender isn't authorized to send to that destination.
    Unauthorized,
    /// Server doesn't support the requested method.
    Unsupported,
    /// Server failed to parse the message.
    Invalid,
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Okay),
            1 => Ok(Status::Unauthorized),
            2 => Ok(Status::Unsupported),
            3 => Ok(Status::Invalid),
            other => Err(format!("unknown status {}", other)),
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        match status {
            Status::Okay => 0,
            Status::Unauthorized => 1,
            Status::Unsupported => 2,
            Status::Invalid => 3,
        }
    }
}

/// First message of every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "DestinationAddress")]
    pub destination: String,
    #[serde(rename = "AuthenticationMethod")]
    pub method: AuthenticationMethod,
    /// Method-specific payload, e.g. a serialized [`HandshakeState`].
    #[serde(rename = "AuthenticationOptions", default, with = "base64_bytes")]
    pub options: Vec<u8>,
}

/// Echo of the challenge, sent once after [`Hello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    #[serde(rename = "DestinationAddress")]
    pub destination: String,
    #[serde(rename = "Challenge")]
    pub challenge: String,
}

/// Server to client message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "Status", default)]
    pub status: Status,
    #[serde(rename = "Challenge", default)]
    pub challenge: String,
    #[serde(rename = "Sent", default, with = "base64_bytes")]
    pub sent: Vec<u8>,
}

impl ServerMessage {
    /// A bare status message.
    pub fn status(status: Status) -> Self {
        ServerMessage {
            status,
            ..Default::default()
        }
    }

    /// An Okay message carrying a challenge for relay.
    pub fn challenge(challenge: impl Into<String>) -> Self {
        ServerMessage {
            status: Status::Okay,
            challenge: challenge.into(),
            sent: Vec::new(),
        }
    }
}

/// TCP handshake state captured by the client and replayed by the server.
///
/// Serialized as the `AuthenticationOptions` of a path-reflection [`Hello`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeState {
    #[serde(rename = "ServerIP")]
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    #[serde(rename = "ClientIP")]
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    pub sequence_number: u32,
    pub acknowledgement_number: u32,
}

impl HandshakeState {
    /// Serializes the state as opaque authentication options.
    pub fn to_options(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses authentication options produced by [`HandshakeState::to_options`].
    pub fn from_options(options: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(options)?)
    }
}

/// Encodes a message as JSON text for a control frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes a control frame's JSON payload.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(Error::from)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_wire_format() {
        let hello = Hello {
            destination: "10.0.0.5".to_string(),
            method: AuthenticationMethod::PathReflection,
            options: b"{}".to_vec(),
        };
        let json = encode(&hello).unwrap();
        assert_eq!(
            json,
            r#"{"DestinationAddress":"10.0.0.5","AuthenticationMethod":2,"AuthenticationOptions":"e30="}"#
        );
        let back: Hello = decode(json.as_bytes()).unwrap();
        assert_eq!(back, hello);
    }

    #[test]
    fn test_hello_null_options() {
        let json = r#"{"DestinationAddress":"1.2.3.4","AuthenticationMethod":0,"AuthenticationOptions":null}"#;
        let hello: Hello = decode(json.as_bytes()).unwrap();
        assert_eq!(hello.method, AuthenticationMethod::DirectChannel);
        assert!(hello.options.is_empty());

        let json = r#"{"DestinationAddress":"1.2.3.4","AuthenticationMethod":0}"#;
        let hello: Hello = decode(json.as_bytes()).unwrap();
        assert!(hello.options.is_empty());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let json = r#"{"DestinationAddress":"1.2.3.4","AuthenticationMethod":7}"#;
        assert!(decode::<Hello>(json.as_bytes()).is_err());
    }

    #[test]
    fn test_server_message_defaults() {
        let msg: ServerMessage = decode(br#"{"Status":1}"#).unwrap();
        assert_eq!(msg.status, Status::Unauthorized);
        assert!(msg.challenge.is_empty());
        assert!(msg.sent.is_empty());

        let json = encode(&ServerMessage::challenge("abc")).unwrap();
        assert_eq!(json, r#"{"Status":0,"Challenge":"abc","Sent":""}"#);
    }

    #[test]
    fn test_authorization_wire_format() {
        let auth = Authorization {
            destination: "127.0.0.1".to_string(),
            challenge: "T0ken".to_string(),
        };
        assert_eq!(
            encode(&auth).unwrap(),
            r#"{"DestinationAddress":"127.0.0.1","Challenge":"T0ken"}"#
        );
    }

    #[test]
    fn test_handshake_state_wire_format() {
        let state = HandshakeState {
            server_ip: Ipv4Addr::new(127, 0, 0, 1),
            server_port: 80,
            client_ip: Ipv4Addr::new(192, 0, 2, 10),
            client_port: 40001,
            sequence_number: 12345,
            acknowledgement_number: 678,
        };
        let options = state.to_options().unwrap();
        let text = String::from_utf8(options.clone()).unwrap();
        assert_eq!(
            text,
            r#"{"ServerIP":"127.0.0.1","ServerPort":80,"ClientIP":"192.0.2.10","ClientPort":40001,"SequenceNumber":12345,"AcknowledgementNumber":678}"#
        );
        assert_eq!(HandshakeState::from_options(&options).unwrap(), state);
    }

    #[test]
    fn test_handshake_state_garbage_rejected() {
        assert!(HandshakeState::from_options(b"not json").is_err());
        assert!(HandshakeState::from_options(&[]).is_err());
    }
}
