//! Continuous MJPEG stream (`GET /stream`).
//!
//! A `StreamSession` drives one open connection through
//! `Starting -> Streaming -> Stopped`. Per frame it acquires, writes one
//! multipart part and releases before looking at the next frame, so a
//! session never holds more than one buffer and a slow client cannot drain
//! the driver's pool.
//!
//! Disconnects are detected by polling `Connection::is_connected` before
//! each acquire and after each part. A write that blocks on a stalled client
//! delays detection by up to one frame; without a write timeout it holds the
//! camera until the client reads or goes away.
//!
//! While another handler holds the camera the session keeps polling
//! liveness instead of queueing on the lock, so a client that leaves during
//! the wait is noticed.

use std::time::Duration;

use super::connection::{Connection, CORS_HEADERS};
use crate::camera::Camera;
use crate::error::{CamError, Result};
use crate::frame::FrameBuffer;

pub const BOUNDARY: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const BUSY_POLL: Duration = Duration::from_millis(250);

/// Headers that precede one part's JPEG bytes.
pub fn encode_part_header(len: usize) -> String {
    format!(
        "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n",
        boundary = BOUNDARY,
        len = len
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Starting,
    Streaming,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The peer went away (or the server is shutting down).
    Disconnected,
    /// Acquisition failed; the stream ends rather than retrying.
    CameraUnavailable,
    /// A write failed mid-part; treated as a disconnect.
    TransportError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamReport {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub stop_reason: StopReason,
}

pub struct StreamSession<'a, C: Connection + ?Sized> {
    conn: &'a mut C,
    camera: &'a Camera,
    state: StreamState,
    frames_sent: u64,
    bytes_sent: u64,
    stop_reason: Option<StopReason>,
}

impl<'a, C: Connection + ?Sized> StreamSession<'a, C> {
    pub fn new(conn: &'a mut C, camera: &'a Camera) -> Self {
        Self {
            conn,
            camera,
            state: StreamState::Starting,
            frames_sent: 0,
            bytes_sent: 0,
            stop_reason: None,
        }
    }

    /// Run until the peer disconnects or the camera fails.
    pub fn run(mut self) -> StreamReport {
        loop {
            match self.state {
                StreamState::Starting => self.start(),
                StreamState::Streaming => self.step(),
                StreamState::Stopped => break,
            }
        }
        StreamReport {
            frames_sent: self.frames_sent,
            bytes_sent: self.bytes_sent,
            stop_reason: self.stop_reason.unwrap_or(StopReason::Disconnected),
        }
    }

    fn start(&mut self) {
        let mut headers: Vec<(&str, &str)> = CORS_HEADERS.to_vec();
        headers.push(("Cache-Control", "no-cache"));
        match self.conn.send_headers(200, STREAM_CONTENT_TYPE, &headers) {
            Ok(()) => self.state = StreamState::Streaming,
            Err(err) => {
                log::debug!("stream preamble not delivered: {}", err);
                self.stop(StopReason::TransportError);
            }
        }
    }

    /// One acquire / write / release cycle.
    fn step(&mut self) {
        if !self.conn.is_connected() {
            self.stop(StopReason::Disconnected);
            return;
        }

        let frame = match self.camera.acquire_timeout(BUSY_POLL) {
            Ok(frame) => frame,
            Err(CamError::Busy(_)) => return,
            Err(err) => {
                log::warn!("stream frame capture failed: {}", err);
                self.stop(StopReason::CameraUnavailable);
                return;
            }
        };
        let written = write_part(&mut *self.conn, &frame);
        drop(frame);

        match written {
            Ok(bytes) => {
                self.frames_sent += 1;
                self.bytes_sent += bytes as u64;
            }
            Err(err) => {
                log::debug!("stream write failed: {}", err);
                self.stop(StopReason::TransportError);
                return;
            }
        }

        if !self.conn.is_connected() {
            self.stop(StopReason::Disconnected);
        }
    }

    fn stop(&mut self, reason: StopReason) {
        self.state = StreamState::Stopped;
        self.stop_reason = Some(reason);
    }
}

/// Write one multipart part; returns the bytes put on the wire.
fn write_part<C: Connection + ?Sized>(conn: &mut C, frame: &FrameBuffer) -> Result<usize> {
    let header = encode_part_header(frame.len());
    conn.write(header.as_bytes())?;
    conn.write(frame.as_bytes())?;
    conn.write(b"\r\n")?;
    Ok(header.len() + frame.len() + 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::connection::testing::MockConnection;
    use crate::camera::testing::{jpeg, Event, ScriptedSource};

    /// Writes per part: header, payload, trailing CRLF. The preamble is one more.
    const WRITES_PER_PART: usize = 3;

    /// Split a recorded stream body into (declared length, payload) pairs.
    fn parse_parts(body: &[u8]) -> Vec<(usize, Vec<u8>)> {
        let mut parts = Vec::new();
        let mut rest = body;
        while !rest.is_empty() {
            let head_end = rest
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .expect("part header terminator");
            let head = std::str::from_utf8(&rest[..head_end]).unwrap();
            let mut lines = head.split("\r\n");
            assert_eq!(lines.next(), Some("--frame"));
            assert_eq!(lines.next(), Some("Content-Type: image/jpeg"));
            let len: usize = lines
                .next()
                .and_then(|l| l.strip_prefix("Content-Length: "))
                .expect("content length line")
                .parse()
                .unwrap();
            let start = head_end + 4;
            let payload = rest[start..start + len].to_vec();
            assert_eq!(&rest[start + len..start + len + 2], b"\r\n");
            parts.push((len, payload));
            rest = &rest[start + len + 2..];
        }
        parts
    }

    fn body_after_preamble(conn: &MockConnection) -> &[u8] {
        let end = conn
            .written
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("preamble terminator");
        &conn.written[end + 4..]
    }

    #[test]
    fn part_header_matches_wire_format() {
        assert_eq!(
            encode_part_header(1234),
            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 1234\r\n\r\n"
        );
    }

    #[test]
    fn frames_are_framed_exactly_until_camera_fails() {
        let payloads = vec![jpeg(10), jpeg(300), jpeg(7)];
        let source = ScriptedSource::new(payloads.clone());
        let log = source.log.clone();
        let camera = Camera::new(Box::new(source));
        let mut conn = MockConnection::default();

        let report = StreamSession::new(&mut conn, &camera).run();

        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.stop_reason, StopReason::CameraUnavailable);
        assert!(conn.text().starts_with(
            "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\n"
        ));

        let parts = parse_parts(body_after_preamble(&conn));
        assert_eq!(parts.len(), 3);
        for ((len, bytes), expected) in parts.iter().zip(&payloads) {
            assert_eq!(*len, expected.len());
            assert_eq!(bytes, expected);
        }
        assert_eq!(report.bytes_sent as usize, body_after_preamble(&conn).len());

        let events = log.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                Event::Acquire(1),
                Event::Release(1),
                Event::Acquire(2),
                Event::Release(2),
                Event::Acquire(3),
                Event::Release(3),
                Event::Fail,
            ]
        );
    }

    #[test]
    fn stops_after_disconnect_without_further_writes() {
        let payloads = (0..10).map(|_| jpeg(16)).collect();
        let source = ScriptedSource::new(payloads);
        let camera = Camera::new(Box::new(source));
        // Preamble plus two complete parts, then the peer hangs up.
        let mut conn = MockConnection::disconnect_after(1 + 2 * WRITES_PER_PART);

        let report = StreamSession::new(&mut conn, &camera).run();

        assert_eq!(report.stop_reason, StopReason::Disconnected);
        assert_eq!(report.frames_sent, 2);
        assert_eq!(conn.rejected_writes, 0);
        assert_eq!(camera.stats().acquired(), 2);
        assert_eq!(camera.stats().released(), 2);
    }

    #[test]
    fn waits_out_a_busy_camera() {
        let source = ScriptedSource::new(vec![jpeg(10), jpeg(20)]);
        let log = source.log.clone();
        let camera = std::sync::Arc::new(Camera::new(Box::new(source)));
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let holder = {
            let camera = camera.clone();
            std::thread::spawn(move || {
                let _frame = camera.acquire().unwrap();
                held_tx.send(()).unwrap();
                // Longer than one busy poll, so the session has to go round again.
                std::thread::sleep(BUSY_POLL * 2);
            })
        };
        held_rx.recv().unwrap();
        let mut conn = MockConnection::disconnect_after(1 + WRITES_PER_PART);

        let report = StreamSession::new(&mut conn, &camera).run();
        holder.join().unwrap();

        assert_eq!(report.stop_reason, StopReason::Disconnected);
        assert_eq!(report.frames_sent, 1);
        let parts = parse_parts(body_after_preamble(&conn));
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, 20);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Event::Acquire(1),
                Event::Release(1),
                Event::Acquire(2),
                Event::Release(2)
            ]
        );
    }

    #[test]
    fn mid_part_write_failure_releases_and_stops() {
        let payloads = (0..10).map(|_| jpeg(16)).collect();
        let source = ScriptedSource::new(payloads);
        let log = source.log.clone();
        let camera = Camera::new(Box::new(source));
        // The peer disappears right after the first part's header.
        let mut conn = MockConnection::disconnect_after(1 + WRITES_PER_PART + 1);

        let report = StreamSession::new(&mut conn, &camera).run();

        assert_eq!(report.stop_reason, StopReason::TransportError);
        assert_eq!(report.frames_sent, 1);
        assert_eq!(conn.rejected_writes, 1);
        assert_eq!(camera.stats().outstanding(), 0);

        let events = log.lock().unwrap();
        assert_eq!(events.last(), Some(&Event::Release(2)));
    }

    #[test]
    fn never_holds_two_buffers() {
        let payloads = (0..25).map(|n| jpeg(8 + n)).collect();
        let source = ScriptedSource::new(payloads);
        let log = source.log.clone();
        let camera = Camera::new(Box::new(source));
        let mut conn = MockConnection::default();

        StreamSession::new(&mut conn, &camera).run();

        let mut held = 0i32;
        for event in log.lock().unwrap().iter() {
            match event {
                Event::Acquire(_) => held += 1,
                Event::Release(_) => held -= 1,
                Event::Fail => {}
            }
            assert!((0..=1).contains(&held), "overlapping buffers");
        }
        assert_eq!(held, 0);
    }

    #[test]
    fn failed_preamble_never_touches_camera() {
        let source = ScriptedSource::new(vec![jpeg(8)]);
        let camera = Camera::new(Box::new(source));
        let mut conn = MockConnection {
            fail_writes: true,
            ..MockConnection::default()
        };

        let report = StreamSession::new(&mut conn, &camera).run();

        assert_eq!(report.stop_reason, StopReason::TransportError);
        assert_eq!(camera.stats().acquired(), 0);
    }
}
