//! Frame source backends.
//!
//! The configured source URL picks the backend:
//! - `stub://<name>[?fail_after=N]`: synthetic test pattern, JPEG-encoded in-process
//! - `file://<dir>`: replays the JPEG files in a local directory
//! - `/dev/videoN`: V4L2 device delivering MJPEG (feature: ingest-v4l2)
//!
//! Every backend hands out `FrameBuffer`s that are already JPEG-encoded and
//! gets them back through `FrameSource::release`. Opening a source is the
//! camera's one-time initialisation; nothing here is retried.

pub mod file;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::time::{Duration, Instant};

use crate::camera::FrameSource;
use crate::config::SourceSettings;
use crate::error::{CamError, Result};

pub use file::{FileConfig, FileSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// Build and connect the backend named by `settings.url`.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let url = settings.url.trim();
    if url.starts_with("stub://") {
        let mut source = SyntheticSource::new(SyntheticConfig::from_settings(settings)?)?;
        source.connect()?;
        return Ok(Box::new(source));
    }
    if let Some(dir) = url.strip_prefix("file://") {
        let mut source = FileSource::new(FileConfig {
            dir: dir.into(),
            target_fps: settings.target_fps,
        });
        source.connect()?;
        return Ok(Box::new(source));
    }
    if url.starts_with("/dev/") {
        return open_device(settings);
    }
    Err(CamError::config(format!(
        "unsupported source '{}'; expected stub://, file:// or /dev/videoN",
        url
    )))
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let mut source = V4l2Source::new(V4l2Config {
        device: settings.url.clone(),
        target_fps: settings.target_fps,
        width: settings.width,
        height: settings.height,
        buffer_count: settings.fb_count,
    });
    source.connect()?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    Err(CamError::config(format!(
        "device source {} requires the ingest-v4l2 feature",
        settings.url
    )))
}

/// Minimum spacing between frames for a target rate. Zero means unpaced.
pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

/// Block until `interval` has passed since `last`, emulating sensor frame time.
pub(crate) fn pace(last: Option<Instant>, interval: Duration) {
    if let Some(last) = last {
        let elapsed = last.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
}

pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> SourceSettings {
        SourceSettings {
            url: url.to_string(),
            width: 64,
            height: 48,
            target_fps: 0,
            jpeg_quality: 80,
            fb_count: 1,
        }
    }

    #[test]
    fn opens_stub_source() {
        let mut source = open_source(&settings("stub://test")).unwrap();
        let frame = source.acquire().unwrap();
        assert_eq!((frame.width, frame.height), (64, 48));
        source.release(frame);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = open_source(&settings("rtsp://camera-1/stream"))
            .err()
            .expect("rtsp is not a camera source");
        assert!(matches!(err, CamError::Config(_)));
    }

    #[test]
    fn frame_interval_handles_zero_fps() {
        assert_eq!(frame_interval(0), Duration::from_millis(0));
        assert_eq!(frame_interval(10), Duration::from_millis(100));
        assert_eq!(frame_interval(5000), Duration::from_millis(1));
    }
}
