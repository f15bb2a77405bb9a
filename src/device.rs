/*!
Device interface

The local tun/tap device as the relay sees it, including:
- non-blocking frame read/write (`Device`)
- reactor registration (`TunDevice`)
- the device-ready contract with the privileged side (`DeviceControl`)
- an inherited file descriptor backend (`FdDevice`, unix)
- frame summaries for debug logs
*/

use std::io;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::Packet;

use crate::options::TunnelMode;

/// A byte-oriented virtual network device.
pub trait Device {
    /// Read one raw frame. `WouldBlock` when nothing is pending.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one raw frame.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Push out writes the device could not take immediately.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A device the reactor can poll for readiness
pub trait TunDevice: Device + mio::event::Source {}

impl<T: Device + mio::event::Source> TunDevice for T {}

/// Requests the core sends back to whoever created the device.
pub trait DeviceControl {
    /// Ask for `address` to be configured on the device.
    fn set_address(&mut self, address: &str) -> io::Result<()>;
}

/// One-line description of a frame for logs
pub fn describe(frame: &[u8], mode: TunnelMode) -> String {
    match mode {
        TunnelMode::Ethernet => match EthernetPacket::new(frame) {
            Some(eth) => {
                let ethertype = eth.get_ethertype();
                let inner = if ethertype == EtherTypes::Ipv4 || ethertype == EtherTypes::Ipv6 {
                    describe_ip(eth.payload())
                } else {
                    format!("ethertype 0x{:04x}", ethertype.0)
                };
                format!(
                    "{} > {} {} ({} bytes)",
                    eth.get_source(),
                    eth.get_destination(),
                    inner,
                    frame.len()
                )
            }
            None => format!("short ethernet frame ({} bytes)", frame.len()),
        },
        TunnelMode::Tunnel => format!("{} ({} bytes)", describe_ip(frame), frame.len()),
    }
}

fn describe_ip(packet: &[u8]) -> String {
    match packet.first().map(|b| b >> 4) {
        Some(4) => match Ipv4Packet::new(packet) {
            Some(ip) => format!(
                "{} > {} proto {}",
                ip.get_source(),
                ip.get_destination(),
                ip.get_next_level_protocol().0
            ),
            None => "truncated ipv4".to_string(),
        },
        Some(6) => match Ipv6Packet::new(packet) {
            Some(ip) => format!(
                "{} > {} next {}",
                ip.get_source(),
                ip.get_destination(),
                ip.get_next_header().0
            ),
            None => "truncated ipv6".to_string(),
        },
        _ => "non-ip payload".to_string(),
    }
}

#[cfg(unix)]
pub use self::unix::FdDevice;

#[cfg(unix)]
mod unix {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, OwnedFd};

    use mio::event::Source;
    use mio::unix::SourceFd;
    use mio::{Interest, Registry, Token};
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    use super::Device;

    /// tun/tap device handed over as an open descriptor
    #[derive(Debug)]
    pub struct FdDevice {
        file: File,
    }

    impl FdDevice {
        /// Take ownership of `fd` and switch it to non-blocking mode.
        pub fn new(fd: OwnedFd) -> io::Result<Self> {
            let raw = fd.as_raw_fd();
            let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(io::Error::from)?;
            let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
            fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
            Ok(Self { file: File::from(fd) })
        }
    }

    impl Device for FdDevice {
        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.file.read(buf)
        }

        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            let n = self.file.write(frame)?;
            if n != frame.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("device took {n} of {} bytes", frame.len()),
                ));
            }
            Ok(())
        }
    }

    impl Source for FdDevice {
        fn register(
            &mut self,
            registry: &Registry,
            token: Token,
            interests: Interest,
        ) -> io::Result<()> {
            SourceFd(&self.file.as_raw_fd()).register(registry, token, interests)
        }

        fn reregister(
            &mut self,
            registry: &Registry,
            token: Token,
            interests: Interest,
        ) -> io::Result<()> {
            SourceFd(&self.file.as_raw_fd()).reregister(registry, token, interests)
        }

        fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
            SourceFd(&self.file.as_raw_fd()).deregister(registry)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_ipv4_in_ethernet() {
        let mut frame = vec![0u8; 14 + 20];
        frame[..6].copy_from_slice(&[0xff; 6]);
        frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        frame[12..14].copy_from_slice(&[0x08, 0x00]);
        let ip = &mut frame[14..];
        ip[0] = 0x45;
        ip[9] = 17;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

        let text = describe(&frame, TunnelMode::Ethernet);
        assert!(text.contains("10.0.0.1 > 10.0.0.2 proto 17"), "{text}");
        assert!(text.contains("02:00:00:00:00:01"), "{text}");
    }

    #[test]
    fn garbage_is_still_described() {
        assert_eq!(describe(&[1, 2, 3], TunnelMode::Ethernet), "short ethernet frame (3 bytes)");
        assert_eq!(describe(&[0x10], TunnelMode::Tunnel), "non-ip payload (1 bytes)");
    }
}
