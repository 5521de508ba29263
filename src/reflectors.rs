//! Registry of trusted path-reflection servers.
//!
//! Loaded once from a JSON object mapping reflector IPv4 address to the
//! hostname used in the injected request's `Host` header:
//!
//! ```json
//! { "93.184.216.34": "example.com" }
//! ```
//!
//! Read-only after load, so it is shared between sessions behind an `Arc`.
//! The relay publishes the same object over HTTP so clients can pick a
//! reflector it trusts, see [`ReflectorRegistry::fetch`].

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use rand::seq::IteratorRandom;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::Uri;

use crate::error::{Error, Result};

/// Trusted reflector address to hostname mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReflectorRegistry {
    servers: HashMap<Ipv4Addr, String>,
}

impl ReflectorRegistry {
    /// Creates a registry from an address to hostname map.
    pub fn new(servers: HashMap<Ipv4Addr, String>) -> Self {
        ReflectorRegistry { servers }
    }

    /// Reads the registry from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!(
                "couldn't read path reflection config {}: {}",
                path.display(),
                e
            ))
        })?;
        let registry = Self::from_json(&data)?;
        log::info!(
            "Loaded {} path reflection servers from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Parses the registry from JSON text.
    pub fn from_json(data: &str) -> Result<Self> {
        let raw: HashMap<String, String> = serde_json::from_str(data).map_err(|e| {
            Error::configuration(format!("couldn't parse path reflection config: {}", e))
        })?;

        let mut servers = HashMap::with_capacity(raw.len());
        for (addr, host) in raw {
            let ip: Ipv4Addr = addr.parse().map_err(|_| {
                Error::configuration(format!("reflector address {:?} is not IPv4", addr))
            })?;
            servers.insert(ip, host);
        }
        Ok(ReflectorRegistry { servers })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Whether `addr` is an allowed reflector.
    pub fn is_trusted(&self, addr: Ipv4Addr) -> bool {
        self.servers.contains_key(&addr)
    }

    /// Registered hostname for a reflector.
    pub fn hostname(&self, addr: Ipv4Addr) -> Option<&str> {
        self.servers.get(&addr).map(String::as_str)
    }

    /// Uniformly picks one reflector address.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Ipv4Addr> {
        self.servers.keys().copied().choose(rng)
    }

    /// JSON object in the same form [`ReflectorRegistry::from_json`] reads.
    pub fn to_json(&self) -> Result<String> {
        let raw: HashMap<String, &str> = self
            .servers
            .iter()
            .map(|(addr, host)| (addr.to_string(), host.as_str()))
            .collect();
        Ok(serde_json::to_string(&raw)?)
    }

    /// Downloads the registry a relay publishes at `url` (`http://` or the
    /// relay's own `ws://` authority).
    ///
    /// Only the addresses are kept; each one doubles as its own hostname.
    pub async fn fetch(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::configuration(format!("bad registry URL {:?}: {}", url, e)))?;
        match uri.scheme_str() {
            Some("http") | Some("ws") => {}
            _ => {
                return Err(Error::configuration(format!(
                    "registry URL {:?} must be http:// or ws://",
                    url
                )))
            }
        }
        let host = uri
            .host()
            .ok_or_else(|| Error::configuration(format!("registry URL {:?} has no host", url)))?;
        let port = uri.port_u16().unwrap_or(80);
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        let mut stream = TcpStream::connect((host, port)).await?;
        let request = format!(
            "GET {} HTTP/1.0\r\nHost: {}:{}\r\nAccept: application/json\r\n\r\n",
            path, host, port
        );
        stream.write_all(request.as_bytes()).await?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;

        let body = http_body(&response)?;
        let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(body)?;
        let mut servers = HashMap::with_capacity(raw.len());
        for addr in raw.into_keys() {
            let ip: Ipv4Addr = addr.parse().map_err(|_| {
                Error::protocol(format!("published reflector {:?} is not IPv4", addr))
            })?;
            servers.insert(ip, addr);
        }
        log::info!("Fetched {} path reflection servers from {}", servers.len(), url);
        Ok(ReflectorRegistry { servers })
    }
}

/// Body of a complete `200` HTTP response.
fn http_body(response: &[u8]) -> Result<&[u8]> {
    let end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Error::protocol("truncated registry response"))?;
    let head = String::from_utf8_lossy(&response[..end]);
    let status = head.lines().next().unwrap_or_default();
    if status.split_whitespace().nth(1) != Some("200") {
        return Err(Error::protocol(format!("registry request failed: {}", status)));
    }
    Ok(&response[end + 4..])
}
