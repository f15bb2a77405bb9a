/*!
Frame relay engine

Moves frames between the local device and the established meta-connections:
- device -> every established peer
- peer -> device, and peer -> every other established peer

Delivery is best-effort per peer. A failed send is logged and the peer is
closed once the pass is over, so removals never happen under a running
iteration and one bad peer never holds back the others.
*/

use std::io;

use crate::device::{describe, Device};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::manager::ConnectionManager;
use crate::meta::Stream;
use crate::options::{Options, TunnelMode};
use crate::registry::Handle;

pub struct FrameRelay {
    /// Frames read from the device, waiting for the next broadcast pass
    queue: Vec<Frame>,
    /// One byte over the frame bound, so oversized reads are detected
    buf: Vec<u8>,
    max_frame_size: usize,
    tunnel: TunnelMode,
}

impl FrameRelay {
    pub fn new(options: &Options) -> Self {
        Self {
            queue: Vec::new(),
            buf: vec![0u8; options.max_frame_size + 1],
            max_frame_size: options.max_frame_size,
            tunnel: options.tunnel,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Read every frame the device has ready and queue it.
    ///
    /// Frames read before a device error stay queued. A frame over the
    /// frame bound is dropped whole rather than cut down.
    pub fn read_device<D: Device + ?Sized>(&mut self, device: &mut D) -> Result<usize> {
        let mut read = 0;
        loop {
            match device.recv(&mut self.buf) {
                Ok(0) => break,
                Ok(n) if n > self.max_frame_size => {
                    log::warn!(
                        "dropping a device frame over the {} byte limit",
                        self.max_frame_size
                    );
                }
                Ok(n) => {
                    let frame = Frame::new(&self.buf[..n])?;
                    if log::log_enabled!(log::Level::Trace) {
                        log::trace!("device frame: {}", describe(frame.as_bytes(), self.tunnel));
                    }
                    self.queue.push(frame);
                    read += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Device(e.to_string())),
            }
        }
        Ok(read)
    }

    /// Hand the queued frames to another data plane, clearing the queue.
    pub fn take_queued(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.queue)
    }

    /// Send every queued frame to every established peer, then clear the
    /// queue. Returns the number of successful sends.
    pub fn broadcast_queued<S: Stream>(&mut self, peers: &mut ConnectionManager<S>) -> usize {
        let frames = self.take_queued();
        let mut failed = Vec::new();
        let sent = frames
            .iter()
            .map(|frame| broadcast(peers, frame, None, &mut failed))
            .sum::<usize>();
        close_failed(peers, failed);
        sent
    }

    /// Device readable: read what it has and broadcast it.
    pub fn on_device_readable<D, S>(
        &mut self,
        device: &mut D,
        peers: &mut ConnectionManager<S>,
    ) -> Result<usize>
    where
        D: Device + ?Sized,
        S: Stream,
    {
        let read = self.read_device(device);
        let sent = self.broadcast_queued(peers);
        read.map(|_| sent)
    }

    /// Established peer readable: read its socket, then relay every complete
    /// frame. Returns the number of frames relayed.
    pub fn on_peer_readable<D, S>(
        &mut self,
        handle: Handle,
        device: Option<&mut D>,
        peers: &mut ConnectionManager<S>,
    ) -> usize
    where
        D: Device + ?Sized,
        S: Stream,
    {
        let read = match peers.established_mut(handle) {
            Some(conn) => conn.read_available(),
            None => {
                log::debug!("readable event for {handle}, which is not established");
                return 0;
            }
        };
        // Frames completed before an EOF or error are still delivered.
        let relayed = self.drain_peer(handle, device, peers);
        if let Err(e) = read {
            peers.on_error(handle, &e);
        }
        relayed
    }

    /// Relay the frames already buffered on `handle`'s connection to the
    /// device and to every other established peer.
    pub fn drain_peer<D, S>(
        &mut self,
        handle: Handle,
        mut device: Option<&mut D>,
        peers: &mut ConnectionManager<S>,
    ) -> usize
    where
        D: Device + ?Sized,
        S: Stream,
    {
        let mut failed = Vec::new();
        let mut relayed = 0;
        loop {
            let next = match peers.established_mut(handle) {
                Some(conn) => conn.next_frame(),
                None => break,
            };
            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    failed.push((handle, e));
                    break;
                }
            };

            if let Some(dev) = device.as_deref_mut() {
                if let Err(e) = dev.send(frame.as_bytes()) {
                    log::warn!("failed to write a {} byte frame to the device: {e}", frame.len());
                }
            }
            broadcast(peers, &frame, Some(handle), &mut failed);
            relayed += 1;
        }
        close_failed(peers, failed);
        relayed
    }
}

/// Send `frame` to every established peer except `exclude` and the peers
/// that already failed during this pass.
fn broadcast<S: Stream>(
    peers: &mut ConnectionManager<S>,
    frame: &Frame,
    exclude: Option<Handle>,
    failed: &mut Vec<(Handle, Error)>,
) -> usize {
    let mut sent = 0;
    for handle in peers.established() {
        if Some(handle) == exclude || failed.iter().any(|(h, _)| *h == handle) {
            continue;
        }
        let Some(conn) = peers.established_mut(handle) else {
            continue;
        };
        match conn.send_frame(frame) {
            Ok(()) => sent += 1,
            Err(e) => {
                log::warn!("failed to relay a frame to {}: {e}", conn.addr());
                failed.push((handle, e));
            }
        }
    }
    sent
}

fn close_failed<S: Stream>(peers: &mut ConnectionManager<S>, failed: Vec<(Handle, Error)>) {
    for (handle, err) in failed {
        peers.on_error(handle, &err);
    }
}
