/*!
Datagram data plane

Connectionless counterpart of the meta-connections. Every datagram carries
exactly one frame, so no length prefix is needed:

```text
sealed:  +------------+-------------------+-----------+
         | nonce (12) | ciphertext        | tag (16)  |
         +------------+-------------------+-----------+
plain:   +--------------------------------+
         | frame payload                  |
         +--------------------------------+
```

Datagram peers are keyed by remote address. A sender is registered the first
time one of its datagrams opens successfully; configured peers are registered
up front. Without a key every datagram opens, so any host that sends one
joins the mesh and receives every later frame until shutdown. Set a key on
any network that is not trusted. Loss is tolerated everywhere: a datagram that fails to open, or a
send the socket refuses, is logged and dropped.
*/

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::meta::LinkStats;
use crate::options::Options;

/// Largest datagram accepted from the socket
const MAX_DATAGRAM: usize = 65_535;

/// Envelope of the secure datagram layer
pub trait DatagramSession {
    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// No envelope at all
#[derive(Debug, Default)]
pub struct PlainSession;

impl DatagramSession for PlainSession {
    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

/// AES-256-GCM under a pre-shared key with a random nonce per datagram
pub struct SealedSession {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SealedSession {
    pub fn new(key: &[u8; 32]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl DatagramSession for SealedSession {
    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce)?;

        let mut body = plain.to_vec();
        self.key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::empty(),
            &mut body,
        )?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + body.len());
        sealed.extend_from_slice(&nonce);
        sealed.append(&mut body);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + self.key.algorithm().tag_len() {
            return Err(Error::Seal("datagram shorter than its envelope"));
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)?;

        let mut body = body.to_vec();
        let len = self.key.open_in_place(nonce, Aad::empty(), &mut body)?.len();
        body.truncate(len);
        Ok(body)
    }
}

/// Session for a new datagram peer, sealed when a key is configured.
pub fn new_session(key: Option<&[u8; 32]>) -> Result<Box<dyn DatagramSession>> {
    Ok(match key {
        Some(key) => Box::new(SealedSession::new(key)?),
        None => Box::new(PlainSession),
    })
}

/// One remote node on the data plane
pub struct DatagramPeer {
    addr: SocketAddr,
    session: Box<dyn DatagramSession>,
    stats: LinkStats,
}

impl DatagramPeer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

/// Datagram peers by remote address, in registration order
pub struct DatagramPeers {
    peers: HashMap<SocketAddr, DatagramPeer>,
    order: Vec<SocketAddr>,
    key: Option<[u8; 32]>,
}

impl DatagramPeers {
    pub fn new(key: Option<[u8; 32]>) -> Self {
        Self {
            peers: HashMap::new(),
            order: Vec::new(),
            key,
        }
    }

    /// Register `addr` if it is not known yet. Returns whether it was added.
    pub fn register(&mut self, addr: SocketAddr) -> Result<bool> {
        if self.peers.contains_key(&addr) {
            return Ok(false);
        }
        let session = new_session(self.key.as_ref())?;
        self.insert(addr, session);
        Ok(true)
    }

    fn insert(&mut self, addr: SocketAddr, session: Box<dyn DatagramSession>) {
        self.peers.insert(
            addr,
            DatagramPeer {
                addr,
                session,
                stats: LinkStats::default(),
            },
        );
        self.order.push(addr);
        log::debug!("datagram peer {addr} registered");
    }

    pub fn get(&self, addr: SocketAddr) -> Option<&DatagramPeer> {
        self.peers.get(&addr)
    }

    /// Open a datagram from `addr`. An unknown sender is registered only if
    /// its datagram opens.
    pub fn open(&mut self, addr: SocketAddr, sealed: &[u8]) -> Result<Vec<u8>> {
        let plain = match self.peers.get(&addr) {
            Some(peer) => peer.session.open(sealed)?,
            None => {
                let session = new_session(self.key.as_ref())?;
                let plain = session.open(sealed)?;
                self.insert(addr, session);
                if self.key.is_some() {
                    log::info!("new datagram peer {addr}");
                } else {
                    log::warn!("new datagram peer {addr} registered without a key");
                }
                plain
            }
        };
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.stats.frames_in += 1;
            peer.stats.bytes_in += sealed.len() as u64;
        }
        Ok(plain)
    }

    pub fn seal(&mut self, addr: SocketAddr, plain: &[u8]) -> Result<Vec<u8>> {
        let peer = self
            .peers
            .get_mut(&addr)
            .ok_or(Error::Seal("no session for this address"))?;
        let sealed = peer.session.seal(plain)?;
        peer.stats.frames_out += 1;
        peer.stats.bytes_out += sealed.len() as u64;
        Ok(sealed)
    }

    pub fn remove(&mut self, addr: SocketAddr) -> bool {
        let Some(peer) = self.peers.remove(&addr) else {
            return false;
        };
        self.order.retain(|a| *a != addr);
        log::debug!(
            "datagram peer {addr} removed ({} frames in, {} frames out)",
            peer.stats.frames_in,
            peer.stats.frames_out
        );
        true
    }

    /// Snapshot of the registered addresses
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        for addr in self.addrs() {
            self.remove(addr);
        }
    }
}

/// Non-blocking datagram socket
pub trait DatagramSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl DatagramSocket for mio::net::UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        mio::net::UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        mio::net::UdpSocket::recv_from(self, buf)
    }
}

impl DatagramSocket for std::net::UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        std::net::UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        std::net::UdpSocket::recv_from(self, buf)
    }
}

/// Relay engine of the data plane
pub struct DatagramRelay {
    peers: DatagramPeers,
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl DatagramRelay {
    pub fn new(options: &Options) -> Self {
        Self {
            peers: DatagramPeers::new(options.udp_key),
            buf: vec![0u8; MAX_DATAGRAM],
            max_frame_size: options.max_frame_size,
        }
    }

    pub fn peers(&self) -> &DatagramPeers {
        &self.peers
    }

    pub fn register(&mut self, addr: SocketAddr) -> Result<bool> {
        self.peers.register(addr)
    }

    /// Socket readable: open every pending datagram, write it to the device
    /// and forward it to every other datagram peer. Returns the number of
    /// frames relayed.
    pub fn on_readable<S, D>(&mut self, socket: &S, mut device: Option<&mut D>) -> usize
    where
        S: DatagramSocket + ?Sized,
        D: Device + ?Sized,
    {
        let mut relayed = 0;
        loop {
            let (n, from) = match socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP errors of earlier sends surface on the next receive.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    log::debug!("datagram socket: {e}");
                    continue;
                }
                // Keep draining: the socket is edge-triggered.
                Err(e) => {
                    log::warn!("datagram receive failed: {e}");
                    continue;
                }
            };

            let payload = match self.peers.open(from, &self.buf[..n]) {
                Ok(payload) => payload,
                Err(e) => {
                    log::debug!("dropping datagram from {from}: {e}");
                    continue;
                }
            };
            if payload.len() > self.max_frame_size {
                log::debug!(
                    "dropping {} byte datagram from {from}: over the frame limit",
                    payload.len()
                );
                continue;
            }

            if let Some(dev) = device.as_deref_mut() {
                if let Err(e) = dev.send(&payload) {
                    log::warn!("failed to write a {} byte frame to the device: {e}", payload.len());
                }
            }
            self.forward(socket, &payload, Some(from));
            relayed += 1;
        }
        relayed
    }

    /// Send device frames to every datagram peer. Returns the number of
    /// datagrams handed to the socket.
    pub fn broadcast<S: DatagramSocket + ?Sized>(&mut self, socket: &S, frames: &[Frame]) -> usize {
        frames
            .iter()
            .map(|frame| self.forward(socket, frame.as_bytes(), None))
            .sum()
    }

    fn forward<S: DatagramSocket + ?Sized>(
        &mut self,
        socket: &S,
        payload: &[u8],
        exclude: Option<SocketAddr>,
    ) -> usize {
        let mut sent = 0;
        for addr in self.peers.addrs() {
            if Some(addr) == exclude {
                continue;
            }
            let datagram = match self.peers.seal(addr, payload) {
                Ok(datagram) => datagram,
                Err(e) => {
                    log::warn!("cannot seal a datagram for {addr}: {e}");
                    continue;
                }
            };
            match socket.send_to(&datagram, addr) {
                Ok(_) => sent += 1,
                Err(e) => log::debug!("datagram to {addr} lost: {e}"),
            }
        }
        sent
    }

    pub fn shutdown(&mut self) {
        self.peers.clear();
    }
}
