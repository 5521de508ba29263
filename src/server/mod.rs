//! Relay server.
//!
//! Accepts websocket control connections on [`ENDPOINT_PATH`], runs each
//! through a [`Session`] and forwards authorized binary frames as spoofed
//! packets. The same listener answers a plain `GET` of [`REGISTRY_PATH`]
//! with the trusted reflector registry.
//!
//! ```text
//!   TcpListener ──accept──▶ connection task ──frames──▶ Session ──▶ Spoofer
//!                                 │  ▲                     │
//!                                 ▼  │ ServerMessage        ▼
//!                            writer task ◀──────────── SessionRegistry
//! ```

mod registry;
mod session;

pub use registry::{Outbound, SessionRegistry};
pub use session::{Frame, ServerContext, Session, SessionState, Step};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
    Message,
};

use crate::{
    challenger::PathReflectionChallenger,
    error::{Error, Result},
    protocol::{self, ServerMessage},
    reflectors::ReflectorRegistry,
    spoofer::Spoofer,
};

/// HTTP path of the websocket endpoint.
pub const ENDPOINT_PATH: &str = "/sp3";
/// HTTP path the reflector registry is published at.
pub const REGISTRY_PATH: &str = "/pathreflection.json";

/// Pause after a failed accept, e.g. when out of file descriptors.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const REQUEST_HEAD_LIMIT: usize = 8192;
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Main server instance.
pub struct Server {
    context: Arc<ServerContext>,
}

impl Server {
    pub fn new(reflectors: Arc<ReflectorRegistry>, spoofer: Arc<Spoofer>) -> Self {
        Server {
            context: Arc::new(ServerContext {
                challenger: PathReflectionChallenger::new(
                    Arc::clone(&reflectors),
                    Arc::clone(&spoofer),
                ),
                reflectors,
                spoofer,
                sessions: Arc::new(SessionRegistry::new()),
            }),
        }
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.context.sessions)
    }

    /// Binds `addr` and serves until the listener fails.
    pub async fn serve(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        log::info!("SP3 server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(context, stream, peer).await {
                            log::debug!("Connection error from {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Accept error: {}", e);
                    sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

fn check_path(request: &Request, response: Response) -> std::result::Result<Response, ErrorResponse> {
    if request.uri().path() == ENDPOINT_PATH {
        Ok(response)
    } else {
        let mut refusal = ErrorResponse::new(Some(format!("no endpoint at {}", request.uri().path())));
        *refusal.status_mut() = StatusCode::NOT_FOUND;
        Err(refusal)
    }
}

/// Path of the request line, once the whole line has arrived.
fn request_path(head: &[u8]) -> Option<&str> {
    let end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&head[..end]).ok()?;
    let mut parts = line.split(' ');
    let _method = parts.next()?;
    parts.next()
}

/// Waits until the request line is buffered and tells whether it asks for
/// the registry. Nothing is consumed from the stream.
async fn wants_registry(stream: &TcpStream) -> Result<bool> {
    let mut head = vec![0u8; REQUEST_HEAD_LIMIT];
    let peeked = timeout(REQUEST_HEAD_TIMEOUT, async {
        loop {
            let n = stream.peek(&mut head).await?;
            if n == 0 || n == head.len() {
                return Ok::<_, std::io::Error>(false);
            }
            if let Some(path) = request_path(&head[..n]) {
                return Ok(path == REGISTRY_PATH);
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    match peeked {
        Ok(wanted) => Ok(wanted?),
        Err(_) => Err(Error::Timeout(REQUEST_HEAD_TIMEOUT)),
    }
}

/// Answers a plain HTTP request with the registry JSON and closes.
async fn serve_registry(
    context: &ServerContext,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    // Read the request fully so closing does not reset the connection.
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < REQUEST_HEAD_LIMIT {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }

    let body = context.reflectors.to_json()?;
    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    log::debug!("Served reflector registry to {}", peer);
    Ok(())
}

async fn handle_connection(
    context: Arc<ServerContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    stream.set_nodelay(true)?;
    if wants_registry(&stream).await? {
        return serve_registry(&context, stream, peer).await;
    }
    let ws = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    log::info!("New connection from {}", peer);

    let (mut sink, mut source) = ws.split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<ServerMessage>();
    if context.sessions.register(peer, outbound.clone()) {
        log::debug!("{} is now the session for host {}", peer, peer.ip());
    }

    // All server messages, including challenges relayed from other
    // connections, are written here so frames never interleave.
    let writer = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            let text = match protocol::encode(&message) {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Couldn't encode server message: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                log::debug!("Write to {} failed: {}", peer, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(peer);
    while let Some(frame) = source.next().await {
        let frame = match frame {
            Ok(Message::Text(text)) => Frame::Text(text.into_bytes()),
            Ok(Message::Binary(data)) => Frame::Binary(data),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                log::debug!("Read from {} failed: {}", peer, e);
                break;
            }
        };

        match session.on_frame(frame, &context).await {
            Step::Continue => {}
            Step::Reply(message) => {
                if outbound.send(message).is_err() {
                    break;
                }
            }
            Step::Close(message) => {
                if let Some(message) = message {
                    let _ = outbound.send(message);
                }
                break;
            }
        }
    }

    // Tears down the forwarding stream before anything else.
    drop(session);
    if let Some(promoted) = context.sessions.cleanup(peer) {
        log::info!("Promoted {} to session for host {}", promoted, peer.ip());
    }
    drop(outbound);
    let _ = writer.await;
    Ok(())
}
