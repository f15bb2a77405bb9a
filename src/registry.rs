/*!
Peer registry

Owns the control-channel peers, split in two disjoint collections:
- pending: socket open, handshake not confirmed yet
- established: handshake confirmed, eligible for relay

Peers are identified by the handle of their connection, never by address:
two sockets to the same remote are two peers. Each collection keeps insertion
order and a handle index, so lookups do not scan.
*/

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Identity of one connection inside the reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub usize);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<mio::Token> for Handle {
    fn from(token: mio::Token) -> Self {
        Handle(token.0)
    }
}

impl From<Handle> for mio::Token {
    fn from(handle: Handle) -> Self {
        mio::Token(handle.0)
    }
}

/// Lifecycle collection a peer lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Pending,
    Established,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::Pending => f.write_str("pending"),
            Collection::Established => f.write_str("established"),
        }
    }
}

/// What the registry needs from the peers it stores
pub trait Peer {
    fn handle(&self) -> Handle;

    /// Release the peer's connection. Called exactly once, on removal.
    fn close(&mut self);
}

#[derive(Debug)]
struct Ordered<P> {
    next_seq: u64,
    order: BTreeMap<u64, Handle>,
    index: HashMap<Handle, (u64, P)>,
}

impl<P> Default for Ordered<P> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            order: BTreeMap::new(),
            index: HashMap::new(),
        }
    }
}

impl<P> Ordered<P> {
    fn insert(&mut self, handle: Handle, peer: P) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, handle);
        self.index.insert(handle, (seq, peer));
    }

    fn remove(&mut self, handle: Handle) -> Option<P> {
        let (seq, peer) = self.index.remove(&handle)?;
        self.order.remove(&seq);
        Some(peer)
    }

    fn get(&self, handle: Handle) -> Option<&P> {
        self.index.get(&handle).map(|(_, peer)| peer)
    }

    fn get_mut(&mut self, handle: Handle) -> Option<&mut P> {
        self.index.get_mut(&handle).map(|(_, peer)| peer)
    }

    fn handles(&self) -> Vec<Handle> {
        self.order.values().copied().collect()
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[derive(Debug)]
pub struct PeerRegistry<P> {
    pending: Ordered<P>,
    established: Ordered<P>,
}

impl<P> Default for PeerRegistry<P> {
    fn default() -> Self {
        Self {
            pending: Ordered::default(),
            established: Ordered::default(),
        }
    }
}

impl<P: Peer> PeerRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    fn collection(&self, collection: Collection) -> &Ordered<P> {
        match collection {
            Collection::Pending => &self.pending,
            Collection::Established => &self.established,
        }
    }

    fn collection_mut(&mut self, collection: Collection) -> &mut Ordered<P> {
        match collection {
            Collection::Pending => &mut self.pending,
            Collection::Established => &mut self.established,
        }
    }

    fn insert(&mut self, collection: Collection, mut peer: P) -> bool {
        let handle = peer.handle();
        if let Some(existing) = self.locate(handle) {
            log::warn!("handle {handle} is already {existing}, refusing duplicate peer");
            peer.close();
            return false;
        }
        self.collection_mut(collection).insert(handle, peer);
        true
    }

    /// Register a peer whose handshake is still in progress.
    ///
    /// A handle already known to the registry is refused and the new peer is
    /// closed.
    pub fn insert_pending(&mut self, peer: P) -> bool {
        self.insert(Collection::Pending, peer)
    }

    pub fn insert_established(&mut self, peer: P) -> bool {
        self.insert(Collection::Established, peer)
    }

    pub fn find(&self, collection: Collection, handle: Handle) -> Option<&P> {
        self.collection(collection).get(handle)
    }

    pub fn find_mut(&mut self, collection: Collection, handle: Handle) -> Option<&mut P> {
        self.collection_mut(collection).get_mut(handle)
    }

    /// Which collection currently holds `handle`, if any
    pub fn locate(&self, handle: Handle) -> Option<Collection> {
        if self.pending.get(handle).is_some() {
            Some(Collection::Pending)
        } else if self.established.get(handle).is_some() {
            Some(Collection::Established)
        } else {
            None
        }
    }

    /// Move a peer from pending to established.
    ///
    /// Returns false, and changes nothing, when the handle is not pending:
    /// duplicate or late lifecycle events are expected.
    pub fn move_to_established(&mut self, handle: Handle) -> bool {
        match self.pending.remove(handle) {
            Some(peer) => {
                self.established.insert(handle, peer);
                true
            }
            None => {
                log::debug!("handle {handle} is not pending, nothing to establish");
                false
            }
        }
    }

    /// Remove a peer from `collection` and release it.
    pub fn remove(&mut self, collection: Collection, handle: Handle) -> bool {
        match self.collection_mut(collection).remove(handle) {
            Some(mut peer) => {
                peer.close();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the handles in `collection`, in insertion order.
    ///
    /// Loops that may remove peers iterate over this copy, never over the
    /// collection itself.
    pub fn handles(&self, collection: Collection) -> Vec<Handle> {
        self.collection(collection).handles()
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.collection(collection).len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.len() == 0 && self.established.len() == 0
    }

    /// Close and drop every peer. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for collection in [Collection::Pending, Collection::Established] {
            for handle in self.handles(collection) {
                if self.remove(collection, handle) {
                    closed += 1;
                }
            }
        }
        closed
    }
}
