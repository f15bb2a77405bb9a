/*!
meshrelay daemon

Bootstraps the relay core:
- configuration file and command line overrides
- TLS material
- listeners, peers and the datagram socket
- the device handed over by the privileged side
*/

use std::error::Error;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use meshrelay::{DeviceControl, Server, TlsContext};

mod config;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file, generated when missing
    #[arg(short, long, default_value = "meshrelay.toml", env = "MESHRELAY_CONFIG")]
    config: PathBuf,

    /// Enable debug logs
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    debug: bool,

    /// Listen address, replaces the configured ones (repeatable)
    #[arg(short, long)]
    listen: Vec<SocketAddr>,

    /// Additional peer to dial (repeatable)
    #[arg(short, long)]
    peer: Vec<SocketAddr>,

    /// tun/tap descriptor inherited from the privileged process
    #[arg(long)]
    device_fd: Option<i32>,

    /// Drive the device from dedicated threads
    #[arg(long, action = clap::ArgAction::SetTrue)]
    threaded_device: bool,
}

/// Forwards device requests to the privileged process, which owns device
/// configuration.
struct PrivilegedSide;

impl DeviceControl for PrivilegedSide {
    fn set_address(&mut self, address: &str) -> std::io::Result<()> {
        log::info!("requesting address {address} for the device");
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut logger = Builder::new();
    logger.filter(None, if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    logger.parse_env("RUST_LOG");
    logger.init();

    log::info!("meshrelay {} starting...", meshrelay::VERSION);

    let mut config = config::load_or_generate_config(&args.config)?;
    if !args.listen.is_empty() {
        config.server.listen = args.listen.iter().map(ToString::to_string).collect();
    }
    config
        .server
        .peers
        .extend(args.peer.iter().map(ToString::to_string));
    if args.threaded_device {
        config.device.threaded = true;
    }
    config::validate_config(&config)?;
    log::debug!("Config loaded: {:?}", config);

    let options = config.to_options()?;
    let tls = if options.encryption {
        Some(load_tls(&config.tls).map_err(|e| {
            log::error!("TLS setup failed: {e}");
            e
        })?)
    } else {
        None
    };

    let max_frame_size = options.max_frame_size;
    let mut server = Server::new(options, tls).map_err(|e| {
        log::error!("{e}");
        e
    })?;
    server.set_established_hook(|conn| {
        log::info!(
            "peer {} ready ({})",
            conn.addr(),
            if conn.is_secure() { "tls" } else { "plaintext" }
        );
    });

    let waker = server.waker();
    ctrlc::set_handler(move || {
        if let Err(e) = waker.wake() {
            log::error!("cannot stop the event loop: {e}");
        }
    })?;

    server.connect_peers();

    match args.device_fd {
        Some(fd) => attach_device(&mut server, fd, config.device.threaded, max_frame_size)?,
        None => log::warn!("no device descriptor given, relaying between peers only"),
    }

    let result = server.run();
    server.shutdown();
    log::info!("meshrelay stopped");
    Ok(result?)
}

fn load_tls(tls: &config::Tls) -> Result<TlsContext, Box<dyn Error>> {
    let cert = rustls::Certificate(read(&tls.cert_file)?);
    let key = rustls::PrivateKey(read(&tls.key_file)?);
    let ca = read(&tls.ca_file)?;
    Ok(TlsContext::new(vec![cert], key, &[ca], &tls.server_name)?)
}

fn read(path: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    fs::read(path).map_err(|e| format!("{path}: {e}").into())
}

#[cfg(unix)]
fn attach_device(
    server: &mut Server,
    fd: i32,
    threaded: bool,
    max_frame_size: usize,
) -> Result<(), Box<dyn Error>> {
    use std::os::fd::{FromRawFd, OwnedFd};

    use meshrelay::{handoff, FdDevice, TunDevice};

    // SAFETY: the descriptor is inherited open from the privileged process,
    // which hands it over and never touches it again.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let device: Box<dyn TunDevice> = if threaded {
        let writer = fs::File::from(fd);
        let reader = writer.try_clone()?;
        Box::new(handoff::spawn(reader, writer, max_frame_size)?)
    } else {
        Box::new(FdDevice::new(fd)?)
    };
    server.set_device(device, &mut PrivilegedSide)?;
    Ok(())
}

#[cfg(not(unix))]
fn attach_device(
    _server: &mut Server,
    _fd: i32,
    _threaded: bool,
    _max_frame_size: usize,
) -> Result<(), Box<dyn Error>> {
    Err("device descriptors are only supported on unix".into())
}
