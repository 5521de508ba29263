#[macro_use]
extern crate log;

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use sp3_suite::authenticator::{Authenticator, DirectAuth, PathReflectionAuth};
use sp3_suite::client;
use sp3_suite::configuration::DEFAULT_REFLECTORS;
use sp3_suite::packets;
use sp3_suite::server::{ENDPOINT_PATH, REGISTRY_PATH};

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum Method {
    /// Challenge relayed over a control connection of the destination
    Direct,
    /// Token reflected through a trusted web server
    PathReflection,
}

#[derive(Parser, Debug)]
#[clap(author = "Piotr Olszewski", version, about = "Sends a spoofed UDP datagram through an SP3 relay", long_about = None)]
struct Args {
    /// Websocket URL of the relay
    #[clap(short, long, default_value = "ws://localhost:8080/sp3")]
    server: String,
    /// Address the datagram is sent to
    #[clap(short, long)]
    destination: Ipv4Addr,
    /// Authentication method
    #[clap(short, long, value_enum, default_value_t = Method::PathReflection)]
    method: Method,
    /// Public address we claim to own (path reflection)
    #[clap(short = 'a', long)]
    claimed_addr: Option<Ipv4Addr>,
    /// JSON file of trusted path reflection servers
    #[clap(short, long, default_value = DEFAULT_REFLECTORS)]
    reflectors: PathBuf,
    /// Fetch trusted path reflection servers from the relay instead of --reflectors
    #[clap(long)]
    fetch_reflectors: bool,
    /// Seconds to wait for each reflector reply; waits forever if unset
    #[clap(short, long)]
    timeout: Option<u64>,
    /// Spoofed source of the datagram
    #[clap(long, default_value = "8.8.8.8:53")]
    source: SocketAddrV4,
    /// UDP port the datagram is sent to
    #[clap(long, default_value_t = 4000)]
    target_port: u16,
    /// Datagram payload
    #[clap(long, default_value = "Hello World!")]
    message: String,
}

/// The relay serves its registry next to the websocket endpoint.
fn registry_url(server: &str) -> String {
    let base = server.strip_suffix(ENDPOINT_PATH).unwrap_or(server);
    format!("{}{}", base.trim_end_matches('/'), REGISTRY_PATH)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> sp3_suite::Result<()> {
    let mut authenticator: Box<dyn Authenticator> = match args.method {
        Method::Direct => Box::new(DirectAuth),
        Method::PathReflection => {
            let claimed = args.claimed_addr.ok_or_else(|| {
                sp3_suite::Error::configuration("path reflection needs --claimed-addr")
            })?;
            let mut auth = if args.fetch_reflectors {
                PathReflectionAuth::from_url(&registry_url(&args.server), claimed).await?
            } else {
                PathReflectionAuth::from_file(&args.reflectors, claimed)?
            };
            if let Some(secs) = args.timeout {
                auth = auth.with_read_timeout(Duration::from_secs(secs));
            }
            Box::new(auth)
        }
    };

    info!("Connecting to SP3 at {}", args.server);
    let destination = IpAddr::V4(args.destination);
    let mut conn = client::connect(&args.server, destination, authenticator.as_mut()).await?;
    info!("Connection established. Sending packet.");

    // Only useful when the destination is this host.
    let listener = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, args.target_port)).await {
        Ok(socket) => Some(socket),
        Err(e) => {
            debug!("Not listening on port {}: {}", args.target_port, e);
            None
        }
    };

    let datagram = packets::build_ipv4_udp(
        args.source,
        SocketAddrV4::new(args.destination, args.target_port),
        args.message.as_bytes(),
    )?;
    info!(
        "UDP packet should be sent to {}:{}",
        args.destination, args.target_port
    );
    conn.send_to(&datagram, destination).await?;

    if let Some(socket) = listener {
        let mut buf = [0u8; 2048];
        match timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => info!(
                "Got spoofed packet from {}: {}",
                from,
                String::from_utf8_lossy(&buf[..n])
            ),
            Ok(Err(e)) => warn!("Listening failed: {}", e),
            Err(_) => info!("Nothing arrived on port {}", args.target_port),
        }
    }

    conn.close().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_url() {
        assert_eq!(
            registry_url("ws://localhost:8080/sp3"),
            "ws://localhost:8080/pathreflection.json"
        );
        assert_eq!(
            registry_url("ws://relay:9000/"),
            "ws://relay:9000/pathreflection.json"
        );
    }
}
