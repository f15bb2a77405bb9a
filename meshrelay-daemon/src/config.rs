/*!
meshrelay daemon configuration

TOML configuration file, including:
- meta-connection listeners and peers (`[server]`)
- TLS material (`[tls]`)
- the local device (`[device]`)
- the datagram data plane (`[datagram]`)
*/

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use base64::Engine;
use meshrelay::{
    DataPlane, Options, TunnelMode, DEFAULT_FRAME_SIZE, DEFAULT_UDP_PORT, MAX_FRAME_SIZE,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Toml parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Toml serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid base64 key: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required configuration: {0}")]
    Missing(String),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConfigFile {
    pub server: Server,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub datagram: Datagram,
}

/// Meta-connection settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Server {
    #[serde(default)]
    pub listen: Vec<String>,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// DER encoded TLS material
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Tls {
    pub cert_file: String,
    pub key_file: String,
    /// Certificates trusted to sign peer certificates
    pub ca_file: String,
    /// Name every peer certificate must be valid for
    pub server_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Device {
    pub mode: TunnelMode,
    pub address: Option<String>,
    /// Drive the device from dedicated threads
    pub threaded: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Datagram {
    pub plane: DataPlane,
    pub port: u16,
    /// Base64 pre-shared key; datagrams travel in the clear without one
    pub key: Option<String>,
}

fn default_max_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            cert_file: "meshrelay-cert.der".to_string(),
            key_file: "meshrelay-key.der".to_string(),
            ca_file: "meshrelay-ca.der".to_string(),
            server_name: "meshrelay".to_string(),
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self {
            mode: TunnelMode::Ethernet,
            address: None,
            threaded: false,
        }
    }
}

impl Default for Datagram {
    fn default() -> Self {
        Self {
            plane: DataPlane::Stream,
            port: DEFAULT_UDP_PORT,
            key: None,
        }
    }
}

impl ConfigFile {
    /// Runtime options for the relay core
    pub fn to_options(&self) -> Result<Options, ConfigError> {
        let udp_key = match &self.datagram.key {
            Some(encoded) => Some(decode_key(encoded)?),
            None => None,
        };
        Ok(Options {
            listen: parse_addrs("server.listen", &self.server.listen)?,
            peers: parse_addrs("server.peers", &self.server.peers)?,
            encryption: self.server.encryption,
            max_frame_size: self.server.max_frame_size,
            data_plane: self.datagram.plane,
            tunnel: self.device.mode,
            udp_port: self.datagram.port,
            udp_key,
            address: self.device.address.clone(),
        })
    }
}

fn parse_addrs(field: &str, addrs: &[String]) -> Result<Vec<SocketAddr>, ConfigError> {
    addrs
        .iter()
        .map(|addr| {
            addr.parse()
                .map_err(|e| ConfigError::Invalid(format!("{field}: {addr}: {e}")))
        })
        .collect()
}

fn decode_key(encoded: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        ConfigError::Invalid(format!(
            "datagram.key must be 32 bytes, got {}",
            bytes.len()
        ))
    })
}

/// Default configuration with a freshly generated datagram key
pub fn default_config() -> ConfigFile {
    let mut rng = rand::thread_rng();
    let key = base64::engine::general_purpose::STANDARD.encode(rng.gen::<[u8; 32]>());

    ConfigFile {
        server: Server {
            listen: vec!["0.0.0.0:4242".to_string()],
            peers: Vec::new(),
            encryption: false,
            max_frame_size: default_max_frame_size(),
        },
        tls: Tls::default(),
        device: Device::default(),
        datagram: Datagram {
            key: Some(key),
            ..Datagram::default()
        },
    }
}

pub fn save_config(config: &ConfigFile, path: &Path) -> Result<(), ConfigError> {
    let toml_str = toml::to_string_pretty(config)?;
    fs::write(path, toml_str)?;
    Ok(())
}

/// Load `path`, writing the default configuration there first if it does
/// not exist yet.
pub fn load_or_generate_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    } else {
        let config = default_config();
        save_config(&config, path)?;
        log::info!("wrote a default configuration to {}", path.display());
        Ok(config)
    }
}

pub fn validate_config(config: &ConfigFile) -> Result<(), ConfigError> {
    if config.server.listen.is_empty() && config.server.peers.is_empty() {
        return Err(ConfigError::Missing(
            "server.listen or server.peers".to_string(),
        ));
    }
    if config.server.max_frame_size == 0 || config.server.max_frame_size > MAX_FRAME_SIZE {
        return Err(ConfigError::Invalid(format!(
            "server.max_frame_size must be between 1 and {MAX_FRAME_SIZE}"
        )));
    }

    if config.server.encryption {
        if config.tls.cert_file.is_empty() {
            return Err(ConfigError::Missing("tls.cert_file".to_string()));
        }
        if config.tls.key_file.is_empty() {
            return Err(ConfigError::Missing("tls.key_file".to_string()));
        }
        if config.tls.ca_file.is_empty() {
            return Err(ConfigError::Missing("tls.ca_file".to_string()));
        }
        if config.tls.server_name.is_empty() {
            return Err(ConfigError::Missing("tls.server_name".to_string()));
        }
    }

    if config.datagram.port == 0 {
        return Err(ConfigError::Invalid(
            "datagram.port must be greater than 0".to_string(),
        ));
    }

    // Parses the addresses and the key.
    config.to_options()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_config_is_written_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshrelay.toml");

        let generated = load_or_generate_config(&path).unwrap();
        assert!(path.exists());
        let reloaded = load_or_generate_config(&path).unwrap();
        assert_eq!(generated, reloaded);
        validate_config(&reloaded).unwrap();
    }

    #[test]
    fn default_bound_fits_a_full_mtu_ethernet_frame() {
        let config = default_config();
        assert_eq!(config.device.mode, TunnelMode::Ethernet);
        assert!(config.server.max_frame_size >= meshrelay::UDP_MTU + 14);
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(default_config().datagram.key, default_config().datagram.key);
    }

    #[test]
    fn minimal_file_gets_section_defaults() {
        let config: ConfigFile = toml::from_str(
            r#"
            [server]
            peers = ["192.0.2.7:4242"]
            "#,
        )
        .unwrap();
        validate_config(&config).unwrap();

        let options = config.to_options().unwrap();
        assert_eq!(options.peers, vec!["192.0.2.7:4242".parse().unwrap()]);
        assert_eq!(options.udp_port, DEFAULT_UDP_PORT);
        assert_eq!(options.max_frame_size, DEFAULT_FRAME_SIZE);
        assert_eq!(options.data_plane, DataPlane::Stream);
        assert_eq!(options.tunnel, TunnelMode::Ethernet);
        assert!(options.udp_key.is_none());
    }

    #[test]
    fn modes_are_read_in_lowercase() {
        let config: ConfigFile = toml::from_str(
            r#"
            [server]
            listen = ["127.0.0.1:4242"]

            [device]
            mode = "tunnel"
            address = "10.0.0.1/24"

            [datagram]
            plane = "datagram"
            port = 9000
            "#,
        )
        .unwrap();
        let options = config.to_options().unwrap();
        assert_eq!(options.tunnel, TunnelMode::Tunnel);
        assert_eq!(options.data_plane, DataPlane::Datagram);
        assert_eq!(options.udp_port, 9000);
        assert_eq!(options.address.as_deref(), Some("10.0.0.1/24"));
    }

    #[test]
    fn short_key_is_rejected() {
        let mut config = default_config();
        config.datagram.key = Some(base64::engine::general_purpose::STANDARD.encode([1u8; 16]));
        assert!(matches!(validate_config(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_address_is_rejected() {
        let mut config = default_config();
        config.server.peers.push("not-an-address".to_string());
        assert!(matches!(validate_config(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn encryption_needs_tls_files() {
        let mut config = default_config();
        config.server.encryption = true;
        config.tls.ca_file.clear();
        assert!(matches!(validate_config(&config), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn nothing_to_do_is_rejected() {
        let mut config = default_config();
        config.server.listen.clear();
        assert!(matches!(validate_config(&config), Err(ConfigError::Missing(_))));
    }
}
