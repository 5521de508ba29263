//! Relay server configuration: command-line flags and the JSON settings file.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use clap::Parser;
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DEVICE: &str = "eth0";
pub const DEFAULT_REFLECTORS: &str = "pathreflection.json";

/// ConfigurationError represents a configuration that cannot be used.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid MAC address {0:?}")]
    InvalidMac(String),
    #[error("Port must not be 0")]
    InvalidPort,
    #[error("Device name is empty")]
    MissingDevice,
    #[error("--init needs a --config path to write to")]
    InitWithoutPath,
    #[error("Cannot access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed settings file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl From<ConfigurationError> for Error {
    fn from(e: ConfigurationError) -> Self {
        Error::Configuration(e.to_string())
    }
}

/// Command-line flags of the relay server.
#[derive(Parser, Debug, Clone)]
#[clap(author = "Piotr Olszewski", version, about = "SP3 spoofed-packet relay", long_about = None)]
pub struct Configuration {
    /// Port for incoming websocket connections
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Network device to inject packets on
    #[clap(short, long, default_value = DEFAULT_DEVICE)]
    pub device: String,
    /// Source MAC of injected frames (hex, colons optional)
    #[clap(long, default_value = "")]
    pub src_mac: String,
    /// Destination MAC of injected frames, usually the gateway (hex, colons optional)
    #[clap(long, default_value = "")]
    pub dst_mac: String,
    /// JSON file of trusted path reflection servers
    #[clap(short, long, default_value = DEFAULT_REFLECTORS)]
    pub reflectors: PathBuf,
    /// JSON settings file; overrides the flags above
    #[clap(short, long)]
    pub config: Option<PathBuf>,
    /// Write the settings given by flags to --config before starting
    #[clap(long)]
    pub init: bool,
    /// Log injected packets instead of opening the raw link
    #[clap(long)]
    pub dry_run: bool,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.init && self.config.is_none() {
            return Err(ConfigurationError::InitWithoutPath);
        }
        self.flag_settings().validate()
    }

    fn flag_settings(&self) -> ServerSettings {
        ServerSettings {
            port: self.port,
            device: self.device.clone(),
            src: self.src_mac.clone(),
            dst: self.dst_mac.clone(),
            path_reflection_file: self.reflectors.clone(),
        }
    }

    /// Resolves the effective settings.
    ///
    /// With `--init` the flag settings are written to `--config` first; with
    /// only `--config` the file is read; otherwise the flags are used.
    pub fn settings(&self) -> Result<ServerSettings, ConfigurationError> {
        let settings = match (&self.config, self.init) {
            (Some(path), true) => {
                let settings = self.flag_settings();
                settings.save(path)?;
                log::info!("Wrote settings to {}", path.display());
                settings
            }
            (Some(path), false) => ServerSettings::load(path)?,
            (None, true) => return Err(ConfigurationError::InitWithoutPath),
            (None, false) => self.flag_settings(),
        };
        settings.validate()?;
        Ok(settings)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

fn default_reflectors() -> PathBuf {
    PathBuf::from(DEFAULT_REFLECTORS)
}

/// Persistent server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub dst: String,
    #[serde(default = "default_reflectors")]
    pub path_reflection_file: PathBuf,
}

impl ServerSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigurationError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigurationError> {
        let data = serde_json::to_string_pretty(self).map_err(|source| {
            ConfigurationError::Malformed {
                path: path.to_path_buf(),
                source,
            }
        })?;
        fs::write(path, data).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.port == 0 {
            return Err(ConfigurationError::InvalidPort);
        }
        if self.device.is_empty() {
            return Err(ConfigurationError::MissingDevice);
        }
        parse_mac(&self.src)?;
        parse_mac(&self.dst)?;
        Ok(())
    }

    pub fn src_mac(&self) -> Result<MacAddr, ConfigurationError> {
        parse_mac(&self.src)
    }

    pub fn dst_mac(&self) -> Result<MacAddr, ConfigurationError> {
        parse_mac(&self.dst)
    }
}

/// Parses `0a1b2c3d4e5f` or `0a:1b:2c:3d:4e:5f`. Empty means all zeros.
pub fn parse_mac(s: &str) -> Result<MacAddr, ConfigurationError> {
    if s.is_empty() {
        return Ok(MacAddr::zero());
    }
    if s.contains(':') {
        return MacAddr::from_str(s).map_err(|_| ConfigurationError::InvalidMac(s.to_string()));
    }
    if s.len() != 12 || !s.is_ascii() {
        return Err(ConfigurationError::InvalidMac(s.to_string()));
    }

    let mut octets = [0u8; 6];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
            .map_err(|_| ConfigurationError::InvalidMac(s.to_string()))?;
    }
    Ok(MacAddr::new(
        octets[0], octets[1], octets[2], octets[3], octets[4], octets[5],
    ))
}
