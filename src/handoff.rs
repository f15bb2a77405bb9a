/*!
Threaded device handoff

For devices that can only be driven with blocking I/O. Two OS threads own the
device; the reactor only ever sees one end of a loopback TCP pair:

```text
 device.read ──> [reader thread] ──frame──┐
                                          ├── loopback ──> HandoffDevice (reactor)
 device.write <── [writer thread] <─frame─┘
```

Frames cross the pair with the same length-prefixed codec as the
meta-connections. Nothing but frames is shared between the threads.
*/

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::thread;

use mio::event::Source;
use mio::{Interest, Registry, Token};

use crate::device::Device;
use crate::frame::{self, Frame, FrameBuffer};

const READ_CHUNK: usize = 16 * 1024;

/// Frames allowed to queue up behind a busy device thread
const MAX_PENDING_OUTPUT: usize = 1024 * 1024;

/// Start the device threads and return the reactor side of the handoff.
pub fn spawn<R, W>(reader: R, writer: W, max_frame_size: usize) -> io::Result<HandoffDevice>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (near, far) = loopback_pair()?;
    let far_reader = far.try_clone()?;

    thread::Builder::new()
        .name("device-reader".into())
        .spawn(move || device_to_socket(reader, far, max_frame_size))?;
    thread::Builder::new()
        .name("device-writer".into())
        .spawn(move || socket_to_device(far_reader, writer, max_frame_size))?;

    near.set_nodelay(true)?;
    near.set_nonblocking(true)?;
    Ok(HandoffDevice {
        stream: mio::net::TcpStream::from_std(near),
        input: FrameBuffer::new(max_frame_size),
        output: Vec::new(),
    })
}

fn loopback_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let near = TcpStream::connect(listener.local_addr()?)?;
    let (far, from) = listener.accept()?;
    if from != near.local_addr()? {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("unexpected connection from {from} on the handoff socket"),
        ));
    }
    far.set_nodelay(true)?;
    Ok((near, far))
}

fn device_to_socket<R: Read>(mut device: R, mut socket: TcpStream, max_frame_size: usize) {
    let mut buf = vec![0u8; max_frame_size + 1];
    let mut wire = Vec::new();
    loop {
        let n = match device.read(&mut buf) {
            Ok(0) => {
                log::info!("device reached end of file");
                break;
            }
            Ok(n) if n > max_frame_size => {
                log::warn!("dropping a device frame over the {max_frame_size} byte limit");
                continue;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("device read failed: {e}");
                break;
            }
        };
        let frame = match Frame::new(&buf[..n]) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("dropping device frame: {e}");
                continue;
            }
        };
        wire.clear();
        frame::encode(&frame, &mut wire);
        if let Err(e) = socket.write_all(&wire) {
            log::debug!("handoff socket closed: {e}");
            return;
        }
    }
    // The reactor sees end of stream and reports the device as gone.
    if let Err(e) = socket.shutdown(Shutdown::Write) {
        log::debug!("handoff socket shutdown: {e}");
    }
}

fn socket_to_device<W: Write>(mut socket: TcpStream, mut device: W, max_frame_size: usize) {
    let mut input = FrameBuffer::new(max_frame_size);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match socket.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => input.extend(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("handoff socket closed: {e}");
                return;
            }
        }
        loop {
            match input.next_frame() {
                Ok(Some(frame)) => {
                    let written = device.write_all(frame.as_bytes()).and_then(|_| device.flush());
                    if let Err(e) = written {
                        log::warn!("device write failed: {e}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("corrupt handoff stream: {e}");
                    return;
                }
            }
        }
    }
}

/// Reactor side of the handoff
pub struct HandoffDevice {
    stream: mio::net::TcpStream,
    input: FrameBuffer,
    output: Vec<u8>,
}

impl Device for HandoffDevice {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let next = self
                .input
                .next_frame()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if let Some(frame) = next {
                let dst = buf.get_mut(..frame.len()).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "frame larger than the read buffer")
                })?;
                dst.copy_from_slice(frame.as_bytes());
                return Ok(frame.len());
            }
            match self.stream.read(&mut chunk)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "device thread stopped",
                    ))
                }
                n => self.input.extend(&chunk[..n]),
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let frame = Frame::new(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if self.output.len() + frame.wire_size() > MAX_PENDING_OUTPUT {
            return Err(io::Error::new(io::ErrorKind::Other, "handoff buffer full"));
        }
        frame::encode(&frame, &mut self.output);
        Device::flush(self)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut written = 0;
        let mut result = Ok(());
        while written < self.output.len() {
            match self.stream.write(&self.output[written..]) {
                Ok(0) => {
                    result = Err(io::ErrorKind::WriteZero.into());
                    break;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.output.drain(..written);
        result
    }
}

impl Source for HandoffDevice {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}
