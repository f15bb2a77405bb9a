/*!
meshrelay - mesh VPN relay core

Bridges a local tun/tap device to a set of remote peers, including:
- length-prefixed framing over plain or TLS meta-connections
- the pending/established peer lifecycle
- best-effort fan-out of device and peer frames
- a datagram data plane with optional sealed sessions
- device backends (inherited descriptor, threaded handoff)
*/

pub mod datagram;
pub mod device;
pub mod error;
pub mod frame;
pub mod handoff;
pub mod manager;
pub mod meta;
pub mod options;
pub mod registry;
pub mod relay;
pub mod server;
pub mod tls;

pub use datagram::{DatagramRelay, DatagramSession, PlainSession, SealedSession};
pub use device::{Device, DeviceControl, TunDevice};
pub use error::{Error, Result};
pub use frame::{Frame, FrameBuffer, FrameError, MAX_FRAME_SIZE};
pub use manager::ConnectionManager;
pub use meta::{LinkStats, MetaConnection, Role, Stream};
pub use options::{DataPlane, Options, TunnelMode};
pub use registry::{Collection, Handle, Peer, PeerRegistry};
pub use relay::FrameRelay;
pub use server::Server;
pub use tls::TlsContext;

#[cfg(unix)]
pub use device::FdDevice;

/// meshrelay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default data-plane port
pub const DEFAULT_UDP_PORT: u16 = 7676;

/// Link MTU the tunnel is sized for
pub const UDP_MTU: usize = 1500;

/// Default frame bound: a full MTU plus an ethernet header with one VLAN tag
pub const DEFAULT_FRAME_SIZE: usize = UDP_MTU + 18;
