//! camd - camera HTTP daemon
//!
//! This daemon:
//! 1. Loads configuration (file, environment, then command line)
//! 2. Initialises the configured frame source once
//! 3. Serves /, /capture, /stream and /status until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::sync::{mpsc, Arc};

use doorguard_cam::{open_source, CamdConfig, Camera, CameraServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve a camera as JPEG stills and an MJPEG stream")]
struct Args {
    /// Address to listen on (overrides CAMD_ADDR and the config file).
    #[arg(long)]
    addr: Option<String>,

    /// Frame source: stub://<name>, file://<dir> or /dev/videoN.
    #[arg(long)]
    source: Option<String>,

    /// IP reported by /status instead of the accepting socket's address.
    #[arg(long)]
    advertise_ip: Option<IpAddr>,

    /// Maximum concurrent /stream clients.
    #[arg(long)]
    max_streams: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = CamdConfig::load()?;
    if let Some(addr) = args.addr {
        config.bind_addr = addr;
    }
    if let Some(source) = args.source {
        config.source.url = source;
    }
    if let Some(ip) = args.advertise_ip {
        config.advertise_ip = Some(ip);
    }
    if let Some(max) = args.max_streams {
        config.max_streams = max;
    }
    config.validate()?;

    let source = open_source(&config.source)
        .with_context(|| format!("initialise camera source {}", config.source.url))?;
    let camera = Arc::new(Camera::new(source));
    log::info!("camera ready: {}", camera.describe());

    let handle = CameraServer::new(ServerConfig::from(&config), camera.clone()).spawn()?;
    log::info!("camd listening on http://{}", handle.addr);
    match config.stream.write_timeout {
        Some(timeout) => log::info!("stream write timeout: {:?}", timeout),
        None => log::info!("stream write timeout: disabled"),
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping camera server...");
    handle.stop()?;

    let stats = camera.stats();
    log::info!(
        "frames acquired={} released={} failed={}",
        stats.acquired(),
        stats.released(),
        stats.failed()
    );
    Ok(())
}
