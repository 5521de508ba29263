//! Live control connections, indexed by peer and by host.
//!
//! The first connection from a host becomes that host's session: DirectChannel
//! challenges for the host are relayed through it. When it goes away another
//! connection from the same host, if any, takes its place.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::{
    error::{Error, Result},
    protocol::ServerMessage,
};

/// Queue feeding one connection's websocket writer.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

#[derive(Default)]
struct Inner {
    connections: HashMap<SocketAddr, Outbound>,
    host_sessions: HashMap<IpAddr, SocketAddr>,
}

/// Shared registry of connections; every access goes through one mutex.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a connection. Returns true if it became its host's session.
    pub fn register(&self, peer: SocketAddr, outbound: Outbound) -> bool {
        let mut inner = self.lock();
        inner.connections.insert(peer, outbound);
        match inner.host_sessions.get(&peer.ip()) {
            Some(_) => false,
            None => {
                inner.host_sessions.insert(peer.ip(), peer);
                true
            }
        }
    }

    /// Sends `message` over the session registered for `host`.
    pub fn relay_challenge(&self, host: IpAddr, message: ServerMessage) -> Result<()> {
        let inner = self.lock();
        let outbound = inner
            .host_sessions
            .get(&host)
            .and_then(|peer| inner.connections.get(peer))
            .ok_or(Error::NoActiveConnection(host))?;
        outbound
            .send(message)
            .map_err(|_| Error::NoActiveConnection(host))
    }

    /// Removes a connection, promoting another one from the same host if the
    /// removed connection was the host's session. Returns the promoted peer.
    pub fn cleanup(&self, peer: SocketAddr) -> Option<SocketAddr> {
        let mut inner = self.lock();
        inner.connections.remove(&peer)?;

        let host = peer.ip();
        if inner.host_sessions.get(&host) != Some(&peer) {
            return None;
        }
        inner.host_sessions.remove(&host);

        let next = inner
            .connections
            .keys()
            .find(|other| other.ip() == host)
            .copied()?;
        inner.host_sessions.insert(host, next);
        Some(next)
    }

    /// Peer currently acting as `host`'s session.
    pub fn host_session(&self, host: IpAddr) -> Option<SocketAddr> {
        self.lock().host_sessions.get(&host).copied()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }
}
