//! HTTP surface of the camera.
//!
//! Routes:
//! - `GET /`        landing page
//! - `GET /capture` one JPEG still
//! - `GET /stream`  endless multipart MJPEG
//! - `GET /status`  `{"status":"connected","ip":"..."}`
//!
//! The accept loop runs on its own thread and hands each connection to a
//! worker thread, so a long-lived stream does not block the other routes.
//! Camera access is still serialized by `Camera` itself.

pub mod capture;
pub mod connection;
pub mod stream;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::camera::Camera;
use crate::config::CamdConfig;
use connection::{write_response, CORS_HEADERS};

pub use capture::handle_capture;
pub use connection::{Connection, TcpConnection};
pub use stream::{StopReason, StreamReport, StreamSession, StreamState};

const MAX_REQUEST_BYTES: usize = 8192;

pub const LANDING_PAGE: &str = "<html><body><h1>DoorGuard Camera</h1>\
<p><a href='/stream'>View stream</a></p>\
<p><a href='/capture'>Capture photo</a></p>\
</body></html>";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub advertise_ip: Option<IpAddr>,
    pub max_streams: usize,
    pub write_timeout: Option<Duration>,
    /// Longest `/capture` waits for a camera held by another handler.
    pub capture_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            advertise_ip: None,
            max_streams: 1,
            write_timeout: None,
            capture_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&CamdConfig> for ServerConfig {
    fn from(cfg: &CamdConfig) -> Self {
        Self {
            addr: cfg.bind_addr.clone(),
            advertise_ip: cfg.advertise_ip,
            max_streams: cfg.max_streams,
            write_timeout: cfg.stream.write_timeout,
            capture_timeout: cfg.capture_timeout,
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, end active streams and wait for every worker.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("camera server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct CameraServer {
    cfg: ServerConfig,
    camera: Arc<Camera>,
}

/// Everything a worker needs; no global state.
struct ServerContext {
    cfg: ServerConfig,
    camera: Arc<Camera>,
    shutdown: Arc<AtomicBool>,
    active_streams: AtomicUsize,
}

impl CameraServer {
    pub fn new(cfg: ServerConfig, camera: Arc<Camera>) -> Self {
        Self { cfg, camera }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("parse bind address {}", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind camera server on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(ServerContext {
            cfg: self.cfg,
            camera: self.camera,
            shutdown: shutdown.clone(),
            active_streams: AtomicUsize::new(0),
        });
        let join = std::thread::Builder::new()
            .name("camd-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_server(listener, ctx) {
                    log::error!("camera server stopped: {}", err);
                }
            })?;

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(listener: TcpListener, ctx: Arc<ServerContext>) -> Result<()> {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let worker = std::thread::Builder::new()
                    .name("camd-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("request from {} rejected: {}", peer, err);
                        }
                    });
                match worker {
                    Ok(worker) => workers.push(worker),
                    Err(err) => log::error!("failed to spawn connection worker: {}", err),
                }
                workers.retain(|worker| !worker.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for worker in workers {
        if worker.join().is_err() {
            log::error!("connection worker panicked");
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &ServerContext) -> Result<()> {
    // Some platforms hand out accepted sockets in the listener's mode.
    stream.set_nonblocking(false)?;
    let local = stream.local_addr()?;
    let head = read_request(&mut stream);

    let mut conn = TcpConnection::new(stream, ctx.shutdown.clone(), ctx.cfg.write_timeout)?;
    let request = match head.and_then(|data| parse_request(&data)) {
        Ok(request) => request,
        Err(err) => {
            if let Err(write_err) =
                write_response(&mut conn, 400, "text/plain", &[], b"bad request")
            {
                log::debug!("bad request response not delivered: {}", write_err);
            }
            return Err(err);
        }
    };
    log::debug!(
        "{} {} ({})",
        request.method,
        request.path,
        request.headers.get("user-agent").map(String::as_str).unwrap_or("-")
    );

    if request.method != "GET" {
        write_response(
            &mut conn,
            405,
            "text/plain",
            &[("Allow", "GET")],
            b"method not allowed",
        )?;
        return Ok(());
    }

    match request.path.as_str() {
        "/" => {
            write_response(&mut conn, 200, "text/html", &[], LANDING_PAGE.as_bytes())?;
        }
        "/capture" => match handle_capture(&mut conn, &ctx.camera, ctx.cfg.capture_timeout) {
            Ok(_) => {}
            Err(err) if err.is_transport() => log::debug!("capture client went away: {}", err),
            // The client already has its error response.
            Err(err) => log::debug!("capture request ended: {}", err),
        },
        "/stream" => serve_stream(&mut conn, ctx)?,
        "/status" => {
            let ip = ctx.cfg.advertise_ip.unwrap_or(local.ip());
            let body = status_body(ip)?;
            write_response(
                &mut conn,
                200,
                "application/json",
                &CORS_HEADERS,
                body.as_bytes(),
            )?;
        }
        _ => {
            write_response(&mut conn, 404, "text/plain", &[], b"not found")?;
        }
    }
    Ok(())
}

fn serve_stream(conn: &mut TcpConnection, ctx: &ServerContext) -> Result<()> {
    let Some(_slot) = StreamSlot::claim(&ctx.active_streams, ctx.cfg.max_streams) else {
        log::info!("stream rejected: {} already active", ctx.cfg.max_streams);
        write_response(
            conn,
            503,
            "text/plain",
            &CORS_HEADERS,
            b"stream busy; try again later",
        )?;
        return Ok(());
    };

    log::info!("stream started ({})", ctx.camera.describe());
    let report = StreamSession::new(conn, &ctx.camera).run();
    log::info!(
        "stream stopped: {:?} after {} frames ({} bytes)",
        report.stop_reason,
        report.frames_sent,
        report.bytes_sent
    );
    if report.stop_reason == StopReason::CameraUnavailable && !ctx.camera.is_healthy() {
        log::warn!("camera {} reports unhealthy", ctx.camera.describe());
    }
    Ok(())
}

/// Counts one active stream for as long as it lives.
struct StreamSlot<'a> {
    active: &'a AtomicUsize,
}

impl<'a> StreamSlot<'a> {
    fn claim(active: &'a AtomicUsize, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self { active })
    }
}

impl Drop for StreamSlot<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
    ip: String,
}

/// `{"status":"connected","ip":"<ip>"}`
pub fn status_body(ip: IpAddr) -> Result<String> {
    let body = StatusBody {
        status: "connected",
        ip: ip.to_string(),
    };
    Ok(serde_json::to_string(&body)?)
}

fn read_request(stream: &mut TcpStream) -> Result<Vec<u8>> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok(data)
}

fn parse_request(data: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
    })
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}
