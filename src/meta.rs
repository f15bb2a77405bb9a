/*!
Meta-connection

The control channel to one peer: a non-blocking byte stream, optionally
wrapped in TLS, plus the buffers that make partial reads and writes safe.
- inbound bytes accumulate until the frame codec can cut a frame out
- outbound bytes the socket refused stay queued for the next writable event
*/

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use rustls::Connection;

use crate::error::{Error, Result};
use crate::frame::{self, Frame, FrameBuffer};
use crate::registry::{Handle, Peer};

const READ_CHUNK: usize = 16 * 1024;

/// Plaintext allowed to queue up behind a slow peer
const MAX_PENDING_OUTPUT: usize = 4 * 1024 * 1024;

/// Byte stream a meta-connection runs over
pub trait Stream: Read + Write {
    /// Whether the transport-level connect has completed. Errors report a
    /// failed connect.
    fn poll_connected(&mut self) -> io::Result<bool>;

    fn shutdown(&mut self);
}

impl Stream for mio::net::TcpStream {
    fn poll_connected(&mut self) -> io::Result<bool> {
        if let Some(err) = self.take_error()? {
            return Err(err);
        }
        match self.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn shutdown(&mut self) {
        if let Err(e) = mio::net::TcpStream::shutdown(self, Shutdown::Both) {
            log::debug!("socket shutdown: {e}");
        }
    }
}

/// Which side opened the connection; decides the handshake role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialed,
    Accepted,
}

/// Frame and byte counters of one link
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub struct MetaConnection<S> {
    handle: Handle,
    addr: SocketAddr,
    role: Role,
    stream: S,
    tls: Option<Connection>,
    connected: bool,
    input: FrameBuffer,
    output: Vec<u8>,
    stats: LinkStats,
}

impl<S: Stream> MetaConnection<S> {
    /// Outbound connection; nothing is written until the connect completes.
    pub fn dialed(
        handle: Handle,
        addr: SocketAddr,
        stream: S,
        tls: Option<Connection>,
        max_frame_size: usize,
    ) -> Self {
        Self::new(handle, addr, Role::Dialed, stream, tls, max_frame_size, false)
    }

    pub fn accepted(
        handle: Handle,
        addr: SocketAddr,
        stream: S,
        tls: Option<Connection>,
        max_frame_size: usize,
    ) -> Self {
        Self::new(handle, addr, Role::Accepted, stream, tls, max_frame_size, true)
    }

    fn new(
        handle: Handle,
        addr: SocketAddr,
        role: Role,
        stream: S,
        tls: Option<Connection>,
        max_frame_size: usize,
        connected: bool,
    ) -> Self {
        Self {
            handle,
            addr,
            role,
            stream,
            tls,
            connected,
            input: FrameBuffer::new(max_frame_size),
            output: Vec::new(),
            stats: LinkStats::default(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Transport connected and, when secured, the TLS handshake is done.
    pub fn handshake_complete(&self) -> bool {
        self.connected && !self.tls.as_ref().is_some_and(|tls| tls.is_handshaking())
    }

    pub fn wants_write(&self) -> bool {
        match &self.tls {
            Some(tls) => tls.wants_write(),
            None => !self.output.is_empty(),
        }
    }

    /// Handle a writable event: finish a pending connect, then flush.
    pub fn on_writable(&mut self) -> Result<()> {
        if !self.connected {
            if !self.stream.poll_connected()? {
                return Ok(());
            }
            self.connected = true;
            log::debug!("transport connected to {}", self.addr);
        }
        self.flush()
    }

    /// Pull everything the socket has into the input buffer.
    ///
    /// Returns the number of plaintext bytes gained. End of stream is
    /// reported as `Error::Closed` after the bytes that preceded it were
    /// buffered, so complete frames can still be drained.
    pub fn read_available(&mut self) -> Result<usize> {
        if !self.connected {
            return Ok(0);
        }
        let read = match self.tls.as_mut() {
            Some(tls) => read_secure(tls, &mut self.stream, &mut self.input),
            None => read_plain(&mut self.stream, &mut self.input),
        };
        // Handshake replies and alerts go out even if the read failed.
        let flushed = self.flush();
        let n = read?;
        flushed?;
        self.stats.bytes_in += n as u64;
        Ok(n)
    }

    /// Next complete frame from the input buffer, if any.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.input.next_frame()?;
        if frame.is_some() {
            self.stats.frames_in += 1;
        }
        Ok(frame)
    }

    pub fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send_raw(&frame::encode_to_vec(frame))?;
        self.stats.frames_out += 1;
        Ok(())
    }

    /// Queue bytes as-is, without framing.
    pub fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        match self.tls.as_mut() {
            Some(tls) => tls.writer().write_all(data)?,
            None => {
                if self.output.len() + data.len() > MAX_PENDING_OUTPUT {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "send buffer full",
                    )));
                }
                self.output.extend_from_slice(data);
            }
        }
        self.stats.bytes_out += data.len() as u64;
        self.flush()
    }

    /// Write as much queued output as the socket accepts.
    pub fn flush(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        match self.tls.as_mut() {
            Some(tls) => {
                while tls.wants_write() {
                    match tls.write_tls(&mut self.stream) {
                        Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
            None => {
                let mut written = 0;
                let mut result = Ok(());
                while written < self.output.len() {
                    match self.stream.write(&self.output[written..]) {
                        Ok(0) => {
                            result = Err(io::Error::from(io::ErrorKind::WriteZero).into());
                            break;
                        }
                        Ok(n) => written += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            result = Err(e.into());
                            break;
                        }
                    }
                }
                self.output.drain(..written);
                result
            }
        }
    }

    /// Send close_notify when secured, then shut the socket down.
    pub fn close(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.send_close_notify();
        }
        if let Err(e) = self.flush() {
            log::debug!("{}: final flush failed: {e}", self.addr);
        }
        self.stream.shutdown();
        self.connected = false;
        log::debug!(
            "closed meta-connection {} with {} ({} frames in, {} frames out)",
            self.handle,
            self.addr,
            self.stats.frames_in,
            self.stats.frames_out
        );
    }
}

impl<S: Stream> Peer for MetaConnection<S> {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn close(&mut self) {
        MetaConnection::close(self);
    }
}

fn read_plain<S: Read>(stream: &mut S, input: &mut FrameBuffer) -> Result<usize> {
    let mut buf = [0u8; READ_CHUNK];
    let mut total = 0;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Err(Error::Closed),
            Ok(n) => {
                input.extend(&buf[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn read_secure<S: Read>(
    tls: &mut Connection,
    stream: &mut S,
    input: &mut FrameBuffer,
) -> Result<usize> {
    let mut total = 0;
    loop {
        let read = match tls.read_tls(stream) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        let state = tls.process_new_packets()?;
        let available = state.plaintext_bytes_to_read();
        if available > 0 {
            let mut plain = vec![0u8; available];
            tls.reader().read_exact(&mut plain)?;
            input.extend(&plain);
            total += available;
        }

        if read == 0 || state.peer_has_closed() {
            return Err(Error::Closed);
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    pub(crate) struct MockState {
        pub incoming: VecDeque<u8>,
        pub outgoing: Vec<u8>,
        pub connected: bool,
        pub connect_error: bool,
        pub eof: bool,
        pub fail_writes: bool,
        /// Bytes accepted before writes start blocking
        pub write_budget: Option<usize>,
        pub shutdown: bool,
    }

    /// In-memory stream whose state stays inspectable after the connection
    /// took ownership of it.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MockStream(pub Rc<RefCell<MockState>>);

    impl MockStream {
        pub fn connected() -> Self {
            let stream = Self::default();
            stream.0.borrow_mut().connected = true;
            stream
        }

        pub fn push_incoming(&self, data: &[u8]) {
            self.0.borrow_mut().incoming.extend(data);
        }

        pub fn take_outgoing(&self) -> Vec<u8> {
            std::mem::take(&mut self.0.borrow_mut().outgoing)
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.0.borrow_mut();
            if state.incoming.is_empty() {
                return if state.eof {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }
            let n = buf.len().min(state.incoming.len());
            for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.0.borrow_mut();
            if state.fail_writes {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let n = match state.write_budget {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(budget) => {
                    let n = budget.min(buf.len());
                    state.write_budget = Some(budget - n);
                    n
                }
                None => buf.len(),
            };
            state.outgoing.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Stream for MockStream {
        fn poll_connected(&mut self) -> io::Result<bool> {
            let state = self.0.borrow();
            if state.connect_error {
                return Err(io::ErrorKind::ConnectionRefused.into());
            }
            Ok(state.connected)
        }

        fn shutdown(&mut self) {
            self.0.borrow_mut().shutdown = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockStream;
    use super::*;
    use crate::frame::MAX_FRAME_SIZE;

    fn addr() -> SocketAddr {
        "192.0.2.10:4000".parse().unwrap()
    }

    fn accepted(stream: &MockStream) -> MetaConnection<MockStream> {
        MetaConnection::accepted(Handle(1), addr(), stream.clone(), None, MAX_FRAME_SIZE)
    }

    #[test]
    fn accepted_plain_connection_is_ready_at_once() {
        let stream = MockStream::connected();
        let conn = accepted(&stream);
        assert!(conn.handshake_complete());
        assert!(!conn.is_secure());
        assert_eq!(conn.role(), Role::Accepted);
    }

    #[test]
    fn send_frame_writes_length_prefix_and_payload() {
        let stream = MockStream::connected();
        let mut conn = accepted(&stream);

        conn.send_frame(&Frame::new(b"abc".to_vec()).unwrap()).unwrap();
        assert_eq!(stream.take_outgoing(), vec![0x00, 0x03, b'a', b'b', b'c']);
        assert_eq!(conn.stats().frames_out, 1);
    }

    #[test]
    fn partial_write_keeps_the_rest_for_the_next_writable_event() {
        let stream = MockStream::connected();
        stream.0.borrow_mut().write_budget = Some(3);
        let mut conn = accepted(&stream);

        conn.send_frame(&Frame::new(vec![7u8; 10]).unwrap()).unwrap();
        assert_eq!(stream.take_outgoing().len(), 3);
        assert!(conn.wants_write());

        stream.0.borrow_mut().write_budget = None;
        conn.on_writable().unwrap();
        assert_eq!(stream.take_outgoing().len(), 9);
        assert!(!conn.wants_write());
    }

    #[test]
    fn dialed_connection_writes_nothing_before_connect_completes() {
        let stream = MockStream::default();
        let mut conn =
            MetaConnection::dialed(Handle(2), addr(), stream.clone(), None, MAX_FRAME_SIZE);
        assert!(!conn.handshake_complete());

        conn.send_raw(b"hello").unwrap();
        conn.on_writable().unwrap();
        assert!(stream.take_outgoing().is_empty());

        stream.0.borrow_mut().connected = true;
        conn.on_writable().unwrap();
        assert!(conn.handshake_complete());
        assert_eq!(stream.take_outgoing(), b"hello");
    }

    #[test]
    fn failed_connect_is_reported() {
        let stream = MockStream::default();
        stream.0.borrow_mut().connect_error = true;
        let mut conn =
            MetaConnection::dialed(Handle(2), addr(), stream.clone(), None, MAX_FRAME_SIZE);
        assert!(conn.on_writable().is_err());
    }

    #[test]
    fn frame_split_across_reads_is_reassembled() {
        let stream = MockStream::connected();
        let mut conn = accepted(&stream);
        let bytes = frame::encode_to_vec(&Frame::new(b"split frame".to_vec()).unwrap());

        stream.push_incoming(&bytes[..4]);
        assert_eq!(conn.read_available().unwrap(), 4);
        assert_eq!(conn.next_frame().unwrap(), None);

        stream.push_incoming(&bytes[4..]);
        conn.read_available().unwrap();
        assert_eq!(
            conn.next_frame().unwrap().unwrap().as_bytes(),
            b"split frame"
        );
        assert_eq!(conn.stats().frames_in, 1);
    }

    #[test]
    fn end_of_stream_keeps_already_buffered_frames() {
        let stream = MockStream::connected();
        let mut conn = accepted(&stream);
        stream.push_incoming(&[0x00, 0x01, 0x42]);
        stream.0.borrow_mut().eof = true;

        assert!(matches!(conn.read_available(), Err(Error::Closed)));
        assert_eq!(conn.next_frame().unwrap().unwrap().as_bytes(), &[0x42]);
    }

    #[test]
    fn oversized_length_is_a_framing_error() {
        let stream = MockStream::connected();
        let mut conn =
            MetaConnection::accepted(Handle(1), addr(), stream.clone(), None, 1500);
        stream.push_incoming(&[0xFF, 0xFF]);
        conn.read_available().unwrap();
        assert!(matches!(conn.next_frame(), Err(Error::Frame(_))));
    }

    #[test]
    fn close_shuts_the_stream_down() {
        let stream = MockStream::connected();
        let mut conn = accepted(&stream);
        conn.close();
        assert!(stream.0.borrow().shutdown);
        assert!(!conn.is_connected());
    }
}
