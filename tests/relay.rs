//! Multi-node relay scenarios over in-memory links.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;

use meshrelay::{
    Collection, ConnectionManager, Device, FrameRelay, Handle, Options, Role, Stream,
};

/// One end of an in-memory duplex link
struct Pipe {
    rx: Rc<RefCell<VecDeque<u8>>>,
    tx: Rc<RefCell<VecDeque<u8>>>,
    closed: Rc<Cell<bool>>,
}

fn pipe_pair() -> (Pipe, Pipe) {
    let a = Rc::new(RefCell::new(VecDeque::new()));
    let b = Rc::new(RefCell::new(VecDeque::new()));
    let closed = Rc::new(Cell::new(false));
    (
        Pipe {
            rx: a.clone(),
            tx: b.clone(),
            closed: closed.clone(),
        },
        Pipe {
            rx: b,
            tx: a,
            closed,
        },
    )
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.borrow_mut();
        if rx.is_empty() {
            return if self.closed.get() {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.get() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.tx.borrow_mut().extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Stream for Pipe {
    fn poll_connected(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    fn shutdown(&mut self) {
        self.closed.set(true);
    }
}

#[derive(Default)]
struct Tap {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
}

impl Device for Tap {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let frame = self
            .inbound
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.written.push(frame.to_vec());
        Ok(())
    }
}

struct Node {
    peers: ConnectionManager<Pipe>,
    relay: FrameRelay,
    tap: Tap,
}

impl Node {
    fn new() -> Self {
        let options = Options {
            max_frame_size: 1500,
            ..Options::default()
        };
        Self {
            peers: ConnectionManager::new(&options, None),
            relay: FrameRelay::new(&options),
            tap: Tap::default(),
        }
    }

    /// Device produced `frames`; broadcast them.
    fn emit(&mut self, frames: &[&[u8]]) -> usize {
        self.tap.inbound.extend(frames.iter().map(|f| f.to_vec()));
        self.relay
            .on_device_readable(&mut self.tap, &mut self.peers)
            .unwrap()
    }

    /// `handle` became readable.
    fn pump(&mut self, handle: Handle) -> usize {
        self.relay
            .on_peer_readable(handle, Some(&mut self.tap), &mut self.peers)
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Connect `dialer` to `acceptor`, both ends established.
fn link(dialer: &mut Node, dial_handle: Handle, acceptor: &mut Node, accept_handle: Handle) {
    let (near, far) = pipe_pair();
    dialer
        .peers
        .dial(dial_handle, addr(4000 + accept_handle.0 as u16), near)
        .unwrap();
    acceptor
        .peers
        .accept(accept_handle, addr(5000 + dial_handle.0 as u16), far)
        .unwrap();

    dialer.peers.get_mut(dial_handle).unwrap().on_writable().unwrap();
    assert!(dialer.peers.on_connected(dial_handle));
    assert!(acceptor.peers.on_connected(accept_handle));
}

/// Hub `h` with spokes `a` and `b`. Handles on the hub: a = 1, b = 2.
fn star() -> (Node, Node, Node) {
    let (mut a, mut b, mut h) = (Node::new(), Node::new(), Node::new());
    link(&mut a, Handle(10), &mut h, Handle(1));
    link(&mut b, Handle(20), &mut h, Handle(2));
    (a, b, h)
}

#[test]
fn frame_crosses_the_hub_and_never_returns_to_its_origin() {
    let (mut a, mut b, mut h) = star();

    assert_eq!(a.emit(&[b"hello mesh"]), 1);
    assert_eq!(h.pump(Handle(1)), 1);
    assert_eq!(b.pump(Handle(20)), 1);
    assert_eq!(a.pump(Handle(10)), 0);

    assert_eq!(h.tap.written, vec![b"hello mesh".to_vec()]);
    assert_eq!(b.tap.written, vec![b"hello mesh".to_vec()]);
    assert!(a.tap.written.is_empty());
}

#[test]
fn frames_from_one_peer_keep_their_order() {
    let (mut a, mut b, mut h) = star();
    let frames: Vec<Vec<u8>> = (0u8..20).map(|i| vec![i; 10 + i as usize]).collect();
    let refs: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();

    assert_eq!(a.emit(&refs), 20);
    assert_eq!(h.pump(Handle(1)), 20);
    assert_eq!(b.pump(Handle(20)), 20);
    assert_eq!(b.tap.written, frames);
}

#[test]
fn departed_peer_is_dropped_and_the_rest_keeps_working() {
    let (mut a, mut b, mut h) = star();

    b.peers.shutdown();
    assert_eq!(h.pump(Handle(2)), 0);
    assert_eq!(h.peers.peers().locate(Handle(2)), None);
    assert_eq!(h.peers.established(), vec![Handle(1)]);

    a.emit(&[b"still here"]);
    assert_eq!(h.pump(Handle(1)), 1);
    assert_eq!(h.tap.written, vec![b"still here".to_vec()]);
}

#[test]
fn only_the_dialing_side_runs_the_established_hook() {
    let calls = Rc::new(Cell::new(0));
    let (mut dialer, mut acceptor) = (Node::new(), Node::new());
    for node in [&mut dialer, &mut acceptor] {
        let seen = calls.clone();
        node.peers.set_established_hook(move |conn| {
            assert_eq!(conn.role(), Role::Dialed);
            seen.set(seen.get() + 1);
        });
    }

    link(&mut dialer, Handle(1), &mut acceptor, Handle(2));
    assert_eq!(calls.get(), 1);
    assert_eq!(
        acceptor.peers.peers().locate(Handle(2)),
        Some(Collection::Established)
    );
}

#[test]
fn hub_fans_device_frames_out_to_every_spoke() {
    let (mut a, mut b, mut h) = star();

    assert_eq!(h.emit(&[&[0x11u8; 100][..], &[0x22u8; 200][..]]), 4);
    assert_eq!(a.pump(Handle(10)), 2);
    assert_eq!(b.pump(Handle(20)), 2);
    assert_eq!(a.tap.written, vec![vec![0x11; 100], vec![0x22; 200]]);
    assert_eq!(b.tap.written, a.tap.written);
}
