/*!
Connection manager

Drives the control-channel lifecycle from transport events:

```text
  dial ──> Dialing  ─┐
                     ├─ connected ──> Established ─ error ──> (removed)
accept ──> Accepting ┘
     pending ─ error ──> (removed)
```

Events for handles the registry no longer knows are logged and ignored: a
duplicate "connected" or a late error must never fault.
*/

use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::meta::{MetaConnection, Role, Stream};
use crate::options::Options;
use crate::registry::{Collection, Handle, PeerRegistry};
use crate::tls::TlsContext;

/// Callback run once when a dialed peer becomes established
pub type EstablishedHook<S> = Box<dyn FnMut(&mut MetaConnection<S>)>;

pub struct ConnectionManager<S> {
    peers: PeerRegistry<MetaConnection<S>>,
    tls: Option<TlsContext>,
    max_frame_size: usize,
    on_established: Option<EstablishedHook<S>>,
}

impl<S: Stream> ConnectionManager<S> {
    /// `tls` is required when `options.encryption` is set; without it the
    /// connections stay in plaintext.
    pub fn new(options: &Options, tls: Option<TlsContext>) -> Self {
        let tls = if options.encryption { tls } else { None };
        Self {
            peers: PeerRegistry::new(),
            tls,
            max_frame_size: options.max_frame_size,
            on_established: None,
        }
    }

    /// Register the peer-hello side action for completed dials.
    pub fn set_established_hook(&mut self, hook: impl FnMut(&mut MetaConnection<S>) + 'static) {
        self.on_established = Some(Box::new(hook));
    }

    pub fn peers(&self) -> &PeerRegistry<MetaConnection<S>> {
        &self.peers
    }

    /// Track an inbound connection; it stays pending until `on_connected`.
    pub fn accept(&mut self, handle: Handle, addr: SocketAddr, stream: S) -> Result<()> {
        let tls = match &self.tls {
            Some(ctx) => Some(ctx.server_session()?),
            None => None,
        };
        let conn = MetaConnection::accepted(handle, addr, stream, tls, self.max_frame_size);
        if !self.peers.insert_pending(conn) {
            return Err(Error::DuplicateHandle(handle));
        }
        log::info!("accepted meta-connection from {addr}");
        Ok(())
    }

    /// Track an outbound connection whose connect is in progress.
    pub fn dial(&mut self, handle: Handle, addr: SocketAddr, stream: S) -> Result<()> {
        let tls = match &self.tls {
            Some(ctx) => Some(ctx.client_session()?),
            None => None,
        };
        let conn = MetaConnection::dialed(handle, addr, stream, tls, self.max_frame_size);
        if !self.peers.insert_pending(conn) {
            return Err(Error::DuplicateHandle(handle));
        }
        log::info!("connecting to {addr}");
        Ok(())
    }

    /// The transport reported a completed connect/handshake for `handle`.
    pub fn on_connected(&mut self, handle: Handle) -> bool {
        if !self.peers.move_to_established(handle) {
            log::debug!("ignoring connected event for {handle}");
            return false;
        }
        let Some(conn) = self.peers.find_mut(Collection::Established, handle) else {
            return false;
        };
        log::info!("connection established with {}", conn.addr());
        if conn.role() == Role::Dialed {
            if let Some(hook) = self.on_established.as_mut() {
                hook(conn);
            }
        }
        true
    }

    /// The transport reported an error or close for `handle`.
    pub fn on_error(&mut self, handle: Handle, err: &Error) -> bool {
        let Some(collection) = self.peers.locate(handle) else {
            log::debug!("ignoring error event for unknown handle {handle}: {err}");
            return false;
        };
        let addr = self
            .peers
            .find(collection, handle)
            .map(|conn| conn.addr().to_string())
            .unwrap_or_default();

        match err {
            Error::Closed => log::info!("{addr} closed the meta-connection"),
            _ => log::warn!("unexpected shutdown of the meta-connection with {addr}: {err}"),
        }
        self.peers.remove(collection, handle);
        log::debug!("{addr} removed from the {collection} list");
        true
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut MetaConnection<S>> {
        let collection = self.peers.locate(handle)?;
        self.peers.find_mut(collection, handle)
    }

    pub fn established_mut(&mut self, handle: Handle) -> Option<&mut MetaConnection<S>> {
        self.peers.find_mut(Collection::Established, handle)
    }

    /// Snapshot of established handles, safe to iterate while removing.
    pub fn established(&self) -> Vec<Handle> {
        self.peers.handles(Collection::Established)
    }

    /// Close every peer, pending and established.
    pub fn shutdown(&mut self) {
        let closed = self.peers.close_all();
        if closed > 0 {
            log::info!("closed {closed} meta-connections");
        }
    }
}
