//! Frame buffer ownership.
//!
//! - `FrameBuffer`: one JPEG-encoded image owned by exactly one holder.
//! - `FrameGuard`: scoped lease on a `FrameBuffer` handed out by `Camera`.
//!   Dropping the guard returns the buffer to its source.
//!
//! There is no path from a guard back to an owned `FrameBuffer`, so a buffer
//! cannot be kept past its release or released twice.

use std::ops::Deref;
use std::sync::MutexGuard;

use crate::camera::{CameraStats, FrameSource};
use crate::error::{CamError, Result};

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Encoding of a frame payload. Only JPEG is produced in this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
}

impl FrameFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "image/jpeg",
        }
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// One captured image. Deliberately not `Clone`.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Vec<u8>,
    format: FrameFormat,
    pub width: u32,
    pub height: u32,
    /// Per-source capture counter, starting at 1.
    pub sequence: u64,
}

impl FrameBuffer {
    /// Wrap an encoded JPEG. Empty or non-JPEG payloads are rejected so a
    /// zero-length buffer is never treated as a frame.
    pub fn new_jpeg(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        if data.is_empty() {
            return Err(CamError::unavailable("driver returned an empty frame buffer"));
        }
        if !data.starts_with(&JPEG_SOI) {
            return Err(CamError::unavailable("malformed jpeg (missing SOI marker)"));
        }
        Ok(Self {
            data,
            format: FrameFormat::Jpeg,
            width,
            height,
            sequence,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Hand the payload back to a source so it can reuse the allocation.
    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

// ----------------------------------------------------------------------------
// FrameGuard
// ----------------------------------------------------------------------------

/// Exclusive lease on the camera and one of its frame buffers.
///
/// Holding a guard holds the camera's ownership token, so no other handler
/// can acquire until this one is dropped.
pub struct FrameGuard<'a> {
    source: MutexGuard<'a, Box<dyn FrameSource>>,
    stats: &'a CameraStats,
    frame: Option<FrameBuffer>,
}

impl<'a> FrameGuard<'a> {
    pub(crate) fn new(
        source: MutexGuard<'a, Box<dyn FrameSource>>,
        stats: &'a CameraStats,
        frame: FrameBuffer,
    ) -> Self {
        Self {
            source,
            stats,
            frame: Some(frame),
        }
    }
}

impl Deref for FrameGuard<'_> {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        // Only `drop` takes the frame out.
        match &self.frame {
            Some(frame) => frame,
            None => unreachable!("frame guard used after release"),
        }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.source.release(frame);
            self.stats.record_release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_payload() {
        let err = FrameBuffer::new_jpeg(Vec::new(), 4, 4, 1).unwrap_err();
        assert!(matches!(err, CamError::CameraUnavailable(_)));
    }

    #[test]
    fn rejects_payload_without_soi() {
        let err = FrameBuffer::new_jpeg(vec![0x00, 0x01, 0x02], 4, 4, 1).unwrap_err();
        assert!(err.to_string().contains("malformed jpeg"));
    }

    #[test]
    fn exposes_payload_and_metadata() {
        let frame = FrameBuffer::new_jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9], 320, 240, 7).unwrap();
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.as_bytes(), &[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(frame.format().content_type(), "image/jpeg");
        assert_eq!((frame.width, frame.height, frame.sequence), (320, 240, 7));
    }
}
