//! Single-shot still capture (`GET /capture`).

use std::time::Duration;

use super::connection::{write_response, Connection, CORS_HEADERS};
use crate::camera::Camera;
use crate::error::{CamError, Result};

pub const CAPTURE_FAILED_BODY: &str = "camera capture failed";
pub const CAPTURE_BUSY_BODY: &str = "camera busy; try again later";

/// Acquire one frame, send it as the whole response body, release it.
///
/// Waits at most `wait` for the camera. If another handler keeps it longer, a
/// `503` is sent instead. On acquisition failure a `500` with a plain-text
/// body is sent. Either way the camera error is returned and no buffer is held.
pub fn handle_capture<C: Connection + ?Sized>(
    conn: &mut C,
    camera: &Camera,
    wait: Duration,
) -> Result<usize> {
    let frame = match camera.acquire_timeout(wait) {
        Ok(frame) => frame,
        Err(err) => {
            let (status, body) = match &err {
                CamError::Busy(_) => (503, CAPTURE_BUSY_BODY),
                _ => (500, CAPTURE_FAILED_BODY),
            };
            log::warn!("capture failed: {}", err);
            if let Err(write_err) =
                write_response(conn, status, "text/plain", &CORS_HEADERS, body.as_bytes())
            {
                log::debug!("capture error response not delivered: {}", write_err);
            }
            return Err(err);
        }
    };

    let len = frame.len();
    write_response(
        conn,
        200,
        frame.format().content_type(),
        &CORS_HEADERS,
        frame.as_bytes(),
    )?;
    log::debug!("capture sent frame #{} ({} bytes)", frame.sequence, len);
    Ok(len)
}
