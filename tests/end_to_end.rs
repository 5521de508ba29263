//! End-to-end tests of the relay over loopback websockets.
//!
//! The server injects into a capture channel instead of a raw link, and path
//! reflection runs against an in-memory reflector.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pnet::packet::tcp::TcpFlags;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use sp3_suite::authenticator::{
    Authenticator, DirectAuth, PathReflectionAuth, RawConnection, RawDialer,
};
use sp3_suite::client;
use sp3_suite::packets::{self, LayerType, TcpHeader, IPV4_HEADER_LEN};
use sp3_suite::protocol::{self, AuthenticationMethod, Authorization, Hello, ServerMessage, Status};
use sp3_suite::reflectors::ReflectorRegistry;
use sp3_suite::server::{Server, SessionRegistry};
use sp3_suite::spoofer::Spoofer;
use sp3_suite::Error;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct TestServer {
    addr: SocketAddr,
    sessions: Arc<SessionRegistry>,
    injected: std_mpsc::Receiver<Vec<u8>>,
}

impl TestServer {
    fn url(&self) -> String {
        format!("ws://{}/sp3", self.addr)
    }

    fn registry_url(&self) -> String {
        format!("http://{}/pathreflection.json", self.addr)
    }
}

fn test_host_registry() -> Arc<ReflectorRegistry> {
    Arc::new(ReflectorRegistry::new(HashMap::from([(
        Ipv4Addr::LOCALHOST,
        "test-host".to_string(),
    )])))
}

async fn start_server(reflectors: Arc<ReflectorRegistry>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (spoofer, injected) = Spoofer::capture();
    let server = Server::new(reflectors, Arc::new(spoofer));
    let sessions = server.sessions();
    tokio::spawn(async move { server.run(listener).await });
    TestServer {
        addr,
        sessions,
        injected,
    }
}

async fn next_injected(rx: &std_mpsc::Receiver<Vec<u8>>) -> Option<Vec<u8>> {
    for _ in 0..200 {
        if let Ok(packet) = rx.try_recv() {
            return Some(packet);
        }
        sleep(Duration::from_millis(10)).await;
    }
    None
}

fn udp_to(destination: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    packets::build_ipv4_udp(
        SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
        SocketAddrV4::new(destination, 4000),
        payload,
    )
    .unwrap()
}

#[tokio::test]
async fn test_direct_channel_send() {
    let server = start_server(test_host_registry()).await;
    let mut conn = timeout(
        Duration::from_secs(5),
        client::connect(&server.url(), LOCALHOST, &mut DirectAuth),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(conn.destination(), LOCALHOST);

    // Refused locally.
    let err = conn
        .send_to(&udp_to(Ipv4Addr::new(10, 0, 0, 9), b"x"), "10.0.0.9".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidDestination { .. }));

    // Refused by the server's injector.
    conn.send(&udp_to(Ipv4Addr::new(10, 0, 0, 9), b"third party"))
        .await
        .unwrap();

    let good = udp_to(Ipv4Addr::LOCALHOST, b"Hello World!");
    conn.send_to(&good, LOCALHOST).await.unwrap();

    assert_eq!(next_injected(&server.injected).await, Some(good));
    assert!(server.injected.try_recv().is_err());
    assert!(conn.failure().is_none());
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_direct_channel_without_live_destination() {
    let server = start_server(test_host_registry()).await;
    let result = client::connect(&server.url(), "10.0.0.5".parse().unwrap(), &mut DirectAuth).await;
    assert!(matches!(
        result,
        Err(Error::AuthenticationRejected(Status::Unauthorized))
    ));
}

type RawSocket = WebSocketStream<TcpStream>;

async fn raw_client(server: &TestServer, path: &str) -> Result<(RawSocket, SocketAddr), Error> {
    let tcp = TcpStream::connect(server.addr).await?;
    let local = tcp.local_addr()?;
    let (ws, _) =
        tokio_tungstenite::client_async(format!("ws://{}{}", server.addr, path), tcp).await?;
    Ok((ws, local))
}

async fn send_json<T: serde::Serialize>(ws: &mut RawSocket, message: &T) {
    ws.send(Message::Text(protocol::encode(message).unwrap()))
        .await
        .unwrap();
}

async fn next_message(ws: &mut RawSocket) -> Option<ServerMessage> {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return Some(protocol::decode(text.as_bytes()).unwrap()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

fn direct_hello() -> Hello {
    Hello {
        destination: "127.0.0.1".to_string(),
        method: AuthenticationMethod::DirectChannel,
        options: Vec::new(),
    }
}

fn authorization(challenge: String) -> Authorization {
    Authorization {
        destination: "127.0.0.1".to_string(),
        challenge,
    }
}

#[tokio::test]
async fn test_promotion_after_close() {
    let server = start_server(test_host_registry()).await;

    let (mut first, first_addr) = raw_client(&server, "/sp3").await.unwrap();
    send_json(&mut first, &direct_hello()).await;
    let challenge = next_message(&mut first).await.unwrap().challenge;
    send_json(&mut first, &authorization(challenge)).await;
    assert_eq!(next_message(&mut first).await.unwrap().status, Status::Okay);

    // The second session's challenge is relayed over the first one.
    let (mut second, second_addr) = raw_client(&server, "/sp3").await.unwrap();
    send_json(&mut second, &direct_hello()).await;
    let challenge = next_message(&mut first).await.unwrap().challenge;
    send_json(&mut second, &authorization(challenge)).await;
    assert_eq!(next_message(&mut second).await.unwrap().status, Status::Okay);

    assert_eq!(server.sessions.host_session(LOCALHOST), Some(first_addr));
    first.close(None).await.unwrap();

    let mut promoted = false;
    for _ in 0..200 {
        if server.sessions.host_session(LOCALHOST) == Some(second_addr) {
            promoted = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(promoted);
    assert_eq!(server.sessions.connection_count(), 1);

    // The promoted session keeps forwarding.
    let packet = udp_to(Ipv4Addr::LOCALHOST, b"still here");
    second.send(Message::Binary(packet.clone())).await.unwrap();
    assert_eq!(next_injected(&server.injected).await, Some(packet));
}

#[tokio::test]
async fn test_second_direct_connect_waits_for_older_session() {
    let server = start_server(test_host_registry()).await;
    let first = client::connect(&server.url(), LOCALHOST, &mut DirectAuth)
        .await
        .unwrap();

    // The challenge goes to `first`, which does not hand it over.
    let second = timeout(
        Duration::from_millis(500),
        client::connect(&server.url(), LOCALHOST, &mut DirectAuth),
    )
    .await;
    assert!(second.is_err());
    assert!(first.failure().is_none());
    first.close().await.unwrap();
}

#[tokio::test]
async fn test_authorization_before_hello_closes() {
    let server = start_server(test_host_registry()).await;
    let (mut ws, _) = raw_client(&server, "/sp3").await.unwrap();

    send_json(&mut ws, &authorization("guess".to_string())).await;
    assert_eq!(next_message(&mut ws).await.unwrap().status, Status::Invalid);
    assert!(next_message(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_unknown_path_refused() {
    let server = start_server(test_host_registry()).await;
    assert!(raw_client(&server, "/other").await.is_err());
}

/// One end of an in-memory raw connection.
struct PipeEnd {
    tx: std_mpsc::Sender<Vec<u8>>,
    rx: std_mpsc::Receiver<Vec<u8>>,
}

fn pipe() -> (PipeEnd, PipeEnd) {
    let (a_tx, a_rx) = std_mpsc::channel();
    let (b_tx, b_rx) = std_mpsc::channel();
    (PipeEnd { tx: a_tx, rx: b_rx }, PipeEnd { tx: b_tx, rx: a_rx })
}

impl RawConnection for PipeEnd {
    fn write(&mut self, segment: &[u8]) -> io::Result<usize> {
        self.tx
            .send(segment.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(segment.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self
            .rx
            .recv()
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionAborted))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

struct PipeDialer(Mutex<Option<PipeEnd>>);

impl RawDialer for PipeDialer {
    fn dial(&self, _peer: Ipv4Addr) -> io::Result<Box<dyn RawConnection>> {
        match self.0.lock().unwrap().take() {
            Some(end) => Ok(Box::new(end)),
            None => Err(io::Error::from(io::ErrorKind::AddrInUse)),
        }
    }
}

/// Plays the reflector: answers the SYN, then bounces whatever the server
/// injects back to the client as a TCP segment.
fn run_reflector(
    mut reflector: PipeEnd,
    injected: std_mpsc::Receiver<Vec<u8>>,
) -> thread::JoinHandle<Option<String>> {
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        let n = reflector.read(&mut buf).ok()?;
        let syn = packets::decode(&buf[..n], LayerType::Tcp).ok()?.tcp?;
        let synack = TcpHeader {
            source_port: syn.destination_port,
            destination_port: syn.source_port,
            sequence: 424242,
            acknowledgement: syn.sequence.wrapping_add(1),
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: 65535,
        };
        let segment = packets::build_tcp_segment(
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            &synack,
            &[],
        )
        .ok()?;
        reflector.write(&segment).ok()?;

        // Dropping the pipe unblocks the client's listener if nothing comes.
        let packet = injected.recv_timeout(Duration::from_secs(2)).ok()?;
        let request = packets::decode_ipv4_transport(&packet).ok()?;
        assert_eq!(request.tcp.as_ref()?.acknowledgement, 424243);
        reflector.write(&packet[IPV4_HEADER_LEN..]).ok()?;
        request.payload_text()
    })
}

#[tokio::test]
async fn test_path_reflection_end_to_end() {
    let server = start_server(test_host_registry()).await;
    let TestServer {
        addr, injected, ..
    } = server;

    let (client_end, reflector_end) = pipe();
    let reflector = run_reflector(reflector_end, injected);
    let mut auth = PathReflectionAuth::new(test_host_registry(), Ipv4Addr::LOCALHOST)
        .with_dialer(Box::new(PipeDialer(Mutex::new(Some(client_end)))));

    let conn = timeout(
        Duration::from_secs(5),
        client::connect(&format!("ws://{}/sp3", addr), LOCALHOST, &mut auth),
    )
    .await
    .unwrap()
    .unwrap();

    let request = reflector.join().unwrap().unwrap();
    assert!(request.starts_with("GET /sp3."));
    assert!(request.contains("Host: test-host\r\n"));
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_path_reflection_untrusted_reflector() {
    let other = Arc::new(ReflectorRegistry::new(HashMap::from([(
        Ipv4Addr::new(203, 0, 113, 7),
        "elsewhere".to_string(),
    )])));
    let server = start_server(other).await;
    let url = server.url();

    let (client_end, reflector_end) = pipe();
    let reflector = run_reflector(reflector_end, server.injected);
    let mut auth = PathReflectionAuth::new(test_host_registry(), Ipv4Addr::LOCALHOST)
        .with_dialer(Box::new(PipeDialer(Mutex::new(Some(client_end)))));

    let result = client::connect(&url, LOCALHOST, &mut auth).await;
    assert!(matches!(
        result,
        Err(Error::AuthenticationRejected(Status::Unauthorized))
    ));
    assert_eq!(reflector.join().unwrap(), None);
}

#[tokio::test]
async fn test_registry_endpoint() {
    let server = start_server(test_host_registry()).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /pathreflection.json HTTP/1.1\r\nHost: relay\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.0 200 OK"));
    assert_eq!(ReflectorRegistry::from_json(body).unwrap(), *test_host_registry());

    // The websocket endpoint on the same listener is unaffected.
    assert!(raw_client(&server, "/sp3").await.is_ok());
}

/// Records the reflector it is asked to dial and refuses.
struct RecordingDialer(Arc<Mutex<Vec<Ipv4Addr>>>);

impl RawDialer for RecordingDialer {
    fn dial(&self, peer: Ipv4Addr) -> io::Result<Box<dyn RawConnection>> {
        self.0.lock().unwrap().push(peer);
        Err(io::Error::from(io::ErrorKind::PermissionDenied))
    }
}

#[tokio::test]
async fn test_published_registry_picks_trusted_reflector() {
    let trusted = Ipv4Addr::new(203, 0, 113, 7);
    let server = start_server(Arc::new(ReflectorRegistry::new(HashMap::from([(
        trusted,
        "elsewhere".to_string(),
    )]))))
    .await;

    let dialed = Arc::new(Mutex::new(Vec::new()));
    let mut auth = PathReflectionAuth::from_url(&server.registry_url(), Ipv4Addr::LOCALHOST)
        .await
        .unwrap()
        .with_dialer(Box::new(RecordingDialer(Arc::clone(&dialed))));

    let (notify, _challenges) = mpsc::channel(1);
    assert!(auth.authenticate(notify).await.is_err());
    assert_eq!(*dialed.lock().unwrap(), vec![trusted]);
}

#[tokio::test]
async fn test_path_reflection_with_published_registry() {
    let server = start_server(test_host_registry()).await;
    let registry_url = server.registry_url();
    let TestServer {
        addr, injected, ..
    } = server;

    let (client_end, reflector_end) = pipe();
    let reflector = run_reflector(reflector_end, injected);
    let mut auth = PathReflectionAuth::from_url(&registry_url, Ipv4Addr::LOCALHOST)
        .await
        .unwrap()
        .with_dialer(Box::new(PipeDialer(Mutex::new(Some(client_end)))));

    let conn = timeout(
        Duration::from_secs(5),
        client::connect(&format!("ws://{}/sp3", addr), LOCALHOST, &mut auth),
    )
    .await
    .unwrap()
    .unwrap();

    // The relay still names the reflector by its own registered hostname.
    let request = reflector.join().unwrap().unwrap();
    assert!(request.contains("Host: test-host\r\n"));
    conn.close().await.unwrap();
}
