/*!
Runtime options

The single configuration value the core reads. It is built once by the
bootstrap layer and handed by reference to the connection manager, the relay
engines and the server.
*/

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::frame::MAX_FRAME_SIZE;
use crate::DEFAULT_UDP_PORT;

/// Which transport carries frames read from the local device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataPlane {
    /// Length-prefixed over the established meta-connections
    Stream,
    /// One datagram per frame to every datagram peer
    Datagram,
}

/// Layer of the frames the device produces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Layer 3, raw IP packets (tun)
    Tunnel,
    /// Layer 2, ethernet frames (tap)
    Ethernet,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Addresses to accept meta-connections on
    pub listen: Vec<SocketAddr>,
    /// Other daemons to dial at startup
    pub peers: Vec<SocketAddr>,
    /// Wrap meta-connections in TLS
    pub encryption: bool,
    /// Upper bound for a decoded frame payload
    pub max_frame_size: usize,
    pub data_plane: DataPlane,
    pub tunnel: TunnelMode,
    pub udp_port: u16,
    /// Pre-shared key sealing datagrams; plaintext datagrams when absent
    pub udp_key: Option<[u8; 32]>,
    /// Address requested for the device once it is ready
    pub address: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            peers: Vec::new(),
            encryption: false,
            max_frame_size: MAX_FRAME_SIZE,
            data_plane: DataPlane::Stream,
            tunnel: TunnelMode::Ethernet,
            udp_port: DEFAULT_UDP_PORT,
            udp_key: None,
            address: None,
        }
    }
}

impl Options {
    /// Datagram endpoint of the daemon reachable at `addr`
    pub fn udp_endpoint(&self, addr: SocketAddr) -> SocketAddr {
        SocketAddr::new(addr.ip(), self.udp_port)
    }
}
