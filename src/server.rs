/*!
Event reactor

Single-threaded mio loop owning every socket, the device and all peer state.
Token layout:
- `0` waker (shutdown)
- `1` datagram socket
- `2` device
- `16..` listeners
- `1024..` meta-connections, one fresh token per connection
*/

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::datagram::DatagramRelay;
use crate::device::{DeviceControl, TunDevice};
use crate::error::{Error, Result};
use crate::manager::ConnectionManager;
use crate::meta::MetaConnection;
use crate::options::{DataPlane, Options};
use crate::registry::{Collection, Handle};
use crate::relay::FrameRelay;
use crate::tls::TlsContext;

const WAKER: Token = Token(0);
const UDP: Token = Token(1);
const DEVICE: Token = Token(2);
const FIRST_LISTENER: usize = 16;
const FIRST_PEER: usize = 1024;

const EVENTS_CAPACITY: usize = 256;

pub struct Server {
    poll: Poll,
    options: Options,
    listeners: Vec<(Token, TcpListener)>,
    udp: Option<UdpSocket>,
    device: Option<Box<dyn TunDevice>>,
    manager: ConnectionManager<TcpStream>,
    relay: FrameRelay,
    datagrams: DatagramRelay,
    waker: Arc<Waker>,
    next_peer: usize,
}

impl Server {
    /// Bind the listeners and the datagram socket.
    ///
    /// Listen addresses that fail to bind are skipped; the server only fails
    /// when none of them could be bound.
    pub fn new(options: Options, tls: Option<TlsContext>) -> Result<Self> {
        if options.encryption && tls.is_none() {
            return Err(Error::TlsContext(
                "encryption is enabled but no TLS context was supplied".into(),
            ));
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let mut listeners = Vec::new();
        for addr in &options.listen {
            match TcpListener::bind(*addr) {
                Ok(mut listener) => {
                    let token = Token(FIRST_LISTENER + listeners.len());
                    poll.registry()
                        .register(&mut listener, token, Interest::READABLE)?;
                    log::info!("listening on {}", listener.local_addr()?);
                    listeners.push((token, listener));
                }
                Err(e) => log::error!("cannot listen on {addr}: {e}"),
            }
        }
        if listeners.is_empty() && !options.listen.is_empty() {
            return Err(Error::NoListener(options.listen.len()));
        }

        let udp = bind_udp(&poll, &options, &listeners)?;
        let mut datagrams = DatagramRelay::new(&options);
        for peer in &options.peers {
            datagrams.register(options.udp_endpoint(*peer))?;
        }

        Ok(Self {
            poll,
            manager: ConnectionManager::new(&options, tls),
            relay: FrameRelay::new(&options),
            datagrams,
            listeners,
            udp,
            device: None,
            waker,
            next_peer: FIRST_PEER,
            options,
        })
    }

    /// Handle that stops `run` from any thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Bound listener addresses, in configuration order
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(_, listener)| listener.local_addr().ok())
            .collect()
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|udp| udp.local_addr().ok())
    }

    pub fn manager(&self) -> &ConnectionManager<TcpStream> {
        &self.manager
    }

    pub fn set_established_hook(
        &mut self,
        hook: impl FnMut(&mut MetaConnection<TcpStream>) + 'static,
    ) {
        self.manager.set_established_hook(hook);
    }

    /// Dial every configured peer once.
    pub fn connect_peers(&mut self) {
        for peer in self.options.peers.clone() {
            if let Err(e) = self.dial(peer) {
                log::warn!("cannot connect to {peer}: {e}");
            }
        }
    }

    /// Start a non-blocking connect to `addr`; the peer stays pending until
    /// the connect (and handshake) completes.
    pub fn dial(&mut self, addr: SocketAddr) -> Result<Handle> {
        let mut stream = TcpStream::connect(addr)?;
        let handle = self.next_handle();
        self.poll.registry().register(
            &mut stream,
            handle.into(),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.manager.dial(handle, addr, stream)?;
        Ok(handle)
    }

    /// Install the ready device and request its address.
    pub fn set_device(
        &mut self,
        mut device: Box<dyn TunDevice>,
        control: &mut dyn DeviceControl,
    ) -> Result<()> {
        self.poll.registry().register(
            &mut *device,
            DEVICE,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        if let Some(address) = &self.options.address {
            control
                .set_address(address)
                .map_err(|e| Error::Device(format!("cannot set address {address}: {e}")))?;
        }
        if let Some(mut old) = self.device.replace(device) {
            if let Err(e) = self.poll.registry().deregister(&mut *old) {
                log::debug!("previous device deregister: {e}");
            }
        }
        log::info!("device ready");
        Ok(())
    }

    /// Run until the waker fires.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while self.run_once(&mut events, None)? {}
        log::info!("shutdown requested");
        Ok(())
    }

    /// Wait for one batch of events and dispatch it. Returns `false` once
    /// the waker fired.
    pub fn run_once(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<bool> {
        if let Err(e) = self.poll.poll(events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(true);
            }
            return Err(e.into());
        }

        for event in events.iter() {
            match event.token() {
                WAKER => return Ok(false),
                UDP => self.on_udp_readable(),
                DEVICE => self.on_device_event(event),
                token if token.0 >= FIRST_PEER => self.on_peer_event(Handle::from(token), event),
                token => self.accept_all(token),
            }
        }
        Ok(true)
    }

    /// Close every peer and forget the datagram peers.
    pub fn shutdown(&mut self) {
        self.manager.shutdown();
        self.datagrams.shutdown();
        if let Some(mut device) = self.device.take() {
            if let Err(e) = self.poll.registry().deregister(&mut *device) {
                log::debug!("device deregister: {e}");
            }
        }
    }

    fn next_handle(&mut self) -> Handle {
        let handle = Handle(self.next_peer);
        self.next_peer += 1;
        handle
    }

    fn accept_all(&mut self, token: Token) {
        let Some(index) = self.listeners.iter().position(|(t, _)| *t == token) else {
            log::debug!("event for unknown token {}", token.0);
            return;
        };
        loop {
            let (mut stream, addr) = match self.listeners[index].1.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                log::debug!("{addr}: cannot set TCP_NODELAY: {e}");
            }

            let handle = self.next_handle();
            if let Err(e) = self.poll.registry().register(
                &mut stream,
                handle.into(),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                log::warn!("cannot watch the connection from {addr}: {e}");
                continue;
            }
            if let Err(e) = self.manager.accept(handle, addr, stream) {
                log::warn!("dropping the connection from {addr}: {e}");
                continue;
            }
            // Without TLS there is no handshake to wait for.
            if !self.options.encryption {
                self.manager.on_connected(handle);
            }
        }
    }

    fn on_peer_event(&mut self, handle: Handle, event: &Event) {
        let Some(collection) = self.manager.peers().locate(handle) else {
            log::debug!("event for {handle}, which is already gone");
            return;
        };

        if let Some(conn) = self.manager.get_mut(handle) {
            if event.is_writable() || !conn.is_connected() {
                if let Err(e) = conn.on_writable() {
                    self.manager.on_error(handle, &e);
                    return;
                }
            }
        }

        match collection {
            Collection::Established => {
                if event.is_readable() {
                    self.relay
                        .on_peer_readable(handle, self.device.as_deref_mut(), &mut self.manager);
                }
            }
            Collection::Pending => {
                let Some(conn) = self.manager.get_mut(handle) else {
                    return;
                };
                if event.is_readable() {
                    if let Err(e) = conn.read_available() {
                        self.manager.on_error(handle, &e);
                        return;
                    }
                }
                if conn.handshake_complete() && self.manager.on_connected(handle) {
                    // Frames that arrived together with the handshake.
                    self.relay
                        .drain_peer(handle, self.device.as_deref_mut(), &mut self.manager);
                }
            }
        }
    }

    fn on_udp_readable(&mut self) {
        if let Some(udp) = &self.udp {
            self.datagrams.on_readable(udp, self.device.as_deref_mut());
        }
    }

    fn on_device_event(&mut self, event: &Event) {
        let Some(device) = self.device.as_deref_mut() else {
            return;
        };
        if event.is_writable() {
            if let Err(e) = device.flush() {
                log::warn!("device flush failed: {e}");
            }
        }
        if !event.is_readable() {
            return;
        }

        let read = match self.options.data_plane {
            DataPlane::Stream => self.relay.on_device_readable(device, &mut self.manager),
            DataPlane::Datagram => {
                let read = self.relay.read_device(device);
                let frames = self.relay.take_queued();
                if let Some(udp) = &self.udp {
                    self.datagrams.broadcast(udp, &frames);
                }
                read
            }
        };
        if let Err(e) = read {
            log::error!("{e}, detaching the device");
            if let Some(mut device) = self.device.take() {
                if let Err(e) = self.poll.registry().deregister(&mut *device) {
                    log::debug!("device deregister: {e}");
                }
            }
        }
    }
}

/// Datagram socket on the first listener's address and the data-plane port.
/// A daemon without listeners only gets one in datagram mode.
fn bind_udp(
    poll: &Poll,
    options: &Options,
    listeners: &[(Token, TcpListener)],
) -> Result<Option<UdpSocket>> {
    let ip = match listeners.first() {
        Some((_, listener)) => listener.local_addr()?.ip(),
        None if options.data_plane == DataPlane::Datagram => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        None => return Ok(None),
    };
    let addr = SocketAddr::new(ip, options.udp_port);
    match UdpSocket::bind(addr) {
        Ok(mut socket) => {
            poll.registry()
                .register(&mut socket, UDP, Interest::READABLE)?;
            log::info!("datagram socket bound to {}", socket.local_addr()?);
            Ok(Some(socket))
        }
        Err(e) if options.data_plane == DataPlane::Datagram => Err(e.into()),
        Err(e) => {
            log::warn!("no datagram socket on {addr}: {e}");
            Ok(None)
        }
    }
}
