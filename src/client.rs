//! Control-channel client.
//!
//! [`connect`] runs an [`Authenticator`], performs the Hello/Authorization
//! exchange over a websocket and returns a send-only [`Connection`] that can
//! only reach the authorized destination.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{
    authenticator::Authenticator,
    error::{Error, Result},
    protocol::{self, AuthenticationMethod, Authorization, Hello, ServerMessage, Status},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Incoming = mpsc::UnboundedReceiver<Result<ServerMessage>>;

/// An authorized connection to an SP3 server.
///
/// Packets sent through it are injected by the server as if they came from
/// the authenticated address.
pub struct Connection {
    sink: SplitSink<Socket, Message>,
    destination: IpAddr,
    failure: Arc<Mutex<Option<String>>>,
    reader: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

/// Authenticates with `authenticator` and opens a connection to `url`
/// allowed to send packets to `destination`.
///
/// With DirectChannel the server relays the challenge over the
/// destination's host session, which is the oldest live connection from
/// that host. If this host already has a [`Connection`] open, the challenge
/// goes to that older connection, which does not pass it on, so this call
/// waits until the older connection closes and the session moves elsewhere.
/// Wrap it in a timeout, or close the older connection first.
pub async fn connect<A>(url: &str, destination: IpAddr, authenticator: &mut A) -> Result<Connection>
where
    A: Authenticator + ?Sized,
{
    let (notify, mut challenges) = mpsc::channel::<String>(1);
    let relay = notify.clone();
    let (method, options) = authenticator.authenticate(notify).await?;

    let (socket, _) = tokio_tungstenite::connect_async(url).await?;
    log::info!("Connected to {}", url);
    let (mut sink, source) = socket.split();

    let hello = Hello {
        destination: destination.to_string(),
        method,
        options,
    };
    sink.send(Message::Text(protocol::encode(&hello)?)).await?;

    let (incoming_tx, mut incoming) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_loop(source, incoming_tx));

    let authorized = async {
        let challenge = loop {
            tokio::select! {
                token = challenges.recv() => match token {
                    Some(token) if !token.is_empty() => break token,
                    _ => return Err(Error::AuthenticationFailed),
                },
                message = incoming.recv() => {
                    let message = next_message(message)?;
                    if message.status != Status::Okay {
                        return Err(Error::AuthenticationRejected(message.status));
                    }
                    if method == AuthenticationMethod::DirectChannel && !message.challenge.is_empty() {
                        // The challenge slot holds one value; later ones are stale.
                        let _ = relay.try_send(message.challenge);
                    }
                }
            }
        };

        let auth = Authorization {
            destination: destination.to_string(),
            challenge,
        };
        sink.send(Message::Text(protocol::encode(&auth)?)).await?;

        let reply = next_message(incoming.recv().await)?;
        if reply.status != Status::Okay {
            return Err(Error::AuthenticationRejected(reply.status));
        }
        Ok::<(), Error>(())
    }
    .await;

    if let Err(e) = authorized {
        log::warn!("Authentication with {} failed: {}", url, e);
        reader.abort();
        let _ = sink.close().await;
        return Err(e);
    }
    log::info!("Authorized to send to {}", destination);

    let failure = Arc::new(Mutex::new(None));
    let watcher = tokio::spawn(watch_loop(incoming, Arc::clone(&failure)));

    Ok(Connection {
        sink,
        destination,
        failure,
        reader,
        watcher,
    })
}

fn next_message(message: Option<Result<ServerMessage>>) -> Result<ServerMessage> {
    match message {
        Some(message) => message,
        None => Err(Error::ConnectionFailed(
            "control channel closed during authentication".to_string(),
        )),
    }
}

/// Republishes every server message, ending with the error that stopped it.
async fn read_loop(
    mut source: SplitStream<Socket>,
    incoming: mpsc::UnboundedSender<Result<ServerMessage>>,
) {
    while let Some(frame) = source.next().await {
        let message = match frame {
            Ok(Message::Text(text)) => protocol::decode(text.as_bytes()),
            Ok(Message::Binary(data)) => protocol::decode(&data),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => Err(Error::from(e)),
        };
        let failed = message.is_err();
        if incoming.send(message).is_err() || failed {
            break;
        }
    }
}

/// Latches the first error or non-Okay status.
async fn watch_loop(mut incoming: Incoming, failure: Arc<Mutex<Option<String>>>) {
    let reason = loop {
        match incoming.recv().await {
            Some(Ok(message)) if message.status == Status::Okay => continue,
            Some(Ok(message)) => {
                break format!("server closed connection with status {:?}", message.status)
            }
            Some(Err(e)) => break e.to_string(),
            None => break "network connection closed".to_string(),
        }
    };
    log::warn!("Connection failed: {}", reason);
    *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
}

impl Connection {
    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    /// Terminal failure observed on the control channel, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sends one raw IPv4 packet for injection.
    pub async fn send(&mut self, packet: &[u8]) -> Result<()> {
        if let Some(reason) = self.failure() {
            return Err(Error::ConnectionFailed(reason));
        }
        self.sink.send(Message::Binary(packet.to_vec())).await?;
        Ok(())
    }

    /// Like [`Connection::send`], refusing any address but the destination.
    pub async fn send_to(&mut self, packet: &[u8], addr: IpAddr) -> Result<()> {
        if addr != self.destination {
            log::warn!("Invalid destination {} vs {}", addr, self.destination);
            return Err(Error::InvalidDestination {
                actual: addr,
                authorized: self.destination,
            });
        }
        self.send(packet).await
    }

    /// Closes the control channel.
    pub async fn close(mut self) -> Result<()> {
        self.watcher.abort();
        let closed = self.sink.close().await;
        self.reader.abort();
        if let Some(reason) = self.failure() {
            return Err(Error::ConnectionFailed(reason));
        }
        closed.map_err(Error::from)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.watcher.abort();
    }
}
