//! Client connection seam.
//!
//! Handlers only talk to a `Connection`, never to a socket, so their
//! ownership and framing behaviour can be driven by a scripted peer in tests.

use std::io::{ErrorKind, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CamError, Result};

/// Headers sent on every camera response so browser apps on other origins
/// can embed the feed.
pub const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

pub trait Connection {
    /// Best-effort liveness. Once false it stays false.
    fn is_connected(&mut self) -> bool;

    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Write the status line and headers, terminated by the blank line.
    fn send_headers(
        &mut self,
        status: u16,
        content_type: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<()> {
        let head = format_head(status, content_type, extra_headers);
        self.write(head.as_bytes())
    }
}

pub fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

pub fn format_head(status: u16, content_type: &str, extra_headers: &[(&str, &str)]) -> String {
    let mut head = format!(
        "{}\r\nContent-Type: {}\r\n",
        status_line(status),
        content_type
    );
    for (name, value) in extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

/// Send a complete single-shot response: headers, then the whole body in one write.
pub fn write_response<C: Connection + ?Sized>(
    conn: &mut C,
    status: u16,
    content_type: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> Result<()> {
    let len = body.len().to_string();
    let mut headers: Vec<(&str, &str)> = Vec::with_capacity(extra_headers.len() + 3);
    headers.extend_from_slice(extra_headers);
    headers.push(("Content-Length", len.as_str()));
    headers.push(("Cache-Control", "no-store"));
    headers.push(("Connection", "close"));
    conn.send_headers(status, content_type, &headers)?;
    conn.write(body)
}

/// `Connection` over an accepted TCP socket.
pub struct TcpConnection {
    stream: TcpStream,
    connected: bool,
    shutdown: Arc<AtomicBool>,
}

impl TcpConnection {
    /// `shutdown` is the server's stop flag; once set the connection reports
    /// itself closed so long-lived handlers wind down.
    pub fn new(
        stream: TcpStream,
        shutdown: Arc<AtomicBool>,
        write_timeout: Option<Duration>,
    ) -> Result<Self> {
        stream.set_write_timeout(write_timeout)?;
        // MJPEG parts are latency sensitive and already written in large chunks.
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            connected: true,
            shutdown,
        })
    }

    /// Non-blocking peek: EOF or a socket error means the peer is gone.
    fn peer_alive(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let alive = match self.stream.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) if err.kind() == ErrorKind::WouldBlock => true,
            Err(err) if err.kind() == ErrorKind::Interrupted => true,
            Err(_) => false,
        };
        alive && self.stream.set_nonblocking(false).is_ok()
    }
}

impl Connection for TcpConnection {
    fn is_connected(&mut self) -> bool {
        if self.connected && self.shutdown.load(Ordering::SeqCst) {
            self.connected = false;
        }
        if self.connected && !self.peer_alive() {
            self.connected = false;
        }
        self.connected
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(err) = self.stream.write_all(bytes) {
            self.connected = false;
            return Err(CamError::Transport(err));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Scripted peer that records everything written to it.
    ///
    /// After `disconnect_after` successful writes it reports itself closed and
    /// rejects further writes, like a client that hung up.
    #[derive(Default)]
    pub struct MockConnection {
        pub written: Vec<u8>,
        pub writes: usize,
        pub rejected_writes: usize,
        pub disconnect_after: Option<usize>,
        pub fail_writes: bool,
    }

    impl MockConnection {
        pub fn disconnect_after(writes: usize) -> Self {
            Self {
                disconnect_after: Some(writes),
                ..Self::default()
            }
        }

        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.written).into_owned()
        }

        fn hung_up(&self) -> bool {
            self.fail_writes || self.disconnect_after.is_some_and(|n| self.writes >= n)
        }
    }

    impl Connection for MockConnection {
        fn is_connected(&mut self) -> bool {
            !self.hung_up()
        }

        fn write(&mut self, bytes: &[u8]) -> Result<()> {
            if self.hung_up() {
                self.rejected_writes += 1;
                return Err(CamError::Transport(std::io::Error::new(
                    ErrorKind::BrokenPipe,
                    "peer closed",
                )));
            }
            self.written.extend_from_slice(bytes);
            self.writes += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockConnection;
    use super::*;

    #[test]
    fn head_lists_extra_headers_in_order() {
        let head = format_head(200, "image/jpeg", &CORS_HEADERS);
        assert_eq!(
            head,
            "HTTP/1.1 200 OK\r\n\
             Content-Type: image/jpeg\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET\r\n\
             Access-Control-Allow-Headers: Content-Type\r\n\
             \r\n"
        );
    }

    #[test]
    fn single_shot_response_carries_length() {
        let mut conn = MockConnection::default();
        write_response(&mut conn, 404, "text/plain", &[], b"nope").unwrap();
        let text = conn.text();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nnope"));
    }

    #[test]
    fn unknown_status_maps_to_500() {
        assert_eq!(status_line(418), "HTTP/1.1 500 Internal Server Error");
    }
}
