#[macro_use]
extern crate log;

use std::net::{Ipv4Addr, SocketAddr};
use std::process;
use std::sync::{mpsc, Arc};
use std::thread;

use sp3_suite::configuration::{Configuration, Parser};
use sp3_suite::packets;
use sp3_suite::reflectors::ReflectorRegistry;
use sp3_suite::server::Server;
use sp3_suite::spoofer::Spoofer;

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Configuration::parse();
    if let Err(e) = args.validate() {
        error!("Configuration is broken: {}", e);
        process::exit(2);
    }

    if let Err(e) = run(args).await {
        error!("{}", e);
        process::exit(1);
    }
}

async fn run(args: Configuration) -> sp3_suite::Result<()> {
    let settings = args.settings()?;
    let reflectors = Arc::new(ReflectorRegistry::load(&settings.path_reflection_file)?);

    let spoofer = if args.dry_run {
        let (spoofer, captured) = Spoofer::capture();
        thread::spawn(move || log_captured(captured));
        warn!("Dry run: packets are logged, not sent");
        spoofer
    } else {
        Spoofer::open_link(&settings.device, settings.src_mac()?, settings.dst_mac()?)?
    };

    info!("Configuration valid. Starting up...");

    let server = Server::new(reflectors, Arc::new(spoofer));
    server
        .serve(SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.port)))
        .await
}

fn log_captured(captured: mpsc::Receiver<Vec<u8>>) {
    for datagram in captured {
        match packets::decode_ipv4_transport(&datagram) {
            Ok(packet) => info!(
                "Would send {} bytes {:?}:{:?} -> {:?}:{:?}",
                datagram.len(),
                packet.source,
                packet.source_port,
                packet.destination,
                packet.destination_port
            ),
            Err(e) => info!("Would send {} bytes ({})", datagram.len(), e),
        }
    }
}
