//! Synthetic camera (`stub://`).
//!
//! Renders a moving test pattern and JPEG-encodes it with the `image` crate,
//! so the HTTP surface can run without hardware. It emulates the driver's
//! frame buffer pool: `fb_count` buffers exist, a buffer is unavailable until
//! released, and released allocations are reused.

use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use url::Url;

use super::{frame_interval, health_grace, pace};
use crate::camera::FrameSource;
use crate::config::SourceSettings;
use crate::error::{CamError, Result};
use crate::frame::FrameBuffer;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub jpeg_quality: u8,
    pub fb_count: u32,
    /// Fail every acquisition after this many successful ones.
    pub fail_after: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "camera".to_string(),
            width: 800,
            height: 600,
            target_fps: 10,
            jpeg_quality: 12,
            fb_count: 1,
            fail_after: None,
        }
    }
}

impl SyntheticConfig {
    /// Parse `stub://<name>[?fail_after=N]` together with the shared settings.
    pub fn from_settings(settings: &SourceSettings) -> Result<Self> {
        let url = Url::parse(&settings.url)
            .map_err(|err| CamError::config(format!("parse stub url {}: {}", settings.url, err)))?;
        let mut fail_after = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "fail_after" => {
                    let n = value.parse::<u64>().map_err(|_| {
                        CamError::config(format!("fail_after must be an integer, got '{}'", value))
                    })?;
                    fail_after = Some(n);
                }
                other => log::warn!("SyntheticSource: ignoring unknown option '{}'", other),
            }
        }
        Ok(Self {
            name: url.host_str().unwrap_or("camera").to_string(),
            width: settings.width,
            height: settings.height,
            target_fps: settings.target_fps,
            jpeg_quality: settings.jpeg_quality,
            fb_count: settings.fb_count,
            fail_after,
        })
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    connected: bool,
    /// Released allocations waiting for reuse.
    free: Vec<Vec<u8>>,
    outstanding: u32,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(CamError::config("synthetic frame size must be non-zero"));
        }
        if config.fb_count == 0 {
            return Err(CamError::config("fb_count must be at least 1"));
        }
        Ok(Self {
            config,
            connected: false,
            free: Vec::new(),
            outstanding: 0,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        })
    }

    /// Synthetic cameras are always reachable.
    pub fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "SyntheticSource: connected to stub://{} ({}x{}, {} fps, {} buffer(s))",
            self.config.name,
            self.config.width,
            self.config.height,
            self.config.target_fps,
            self.config.fb_count
        );
        Ok(())
    }

    fn render(&self, sequence: u64, mut out: Vec<u8>) -> Result<Vec<u8>> {
        let shift = (sequence * 4) as u32;
        let image = RgbImage::from_fn(self.config.width, self.config.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                (y % 256) as u8,
                (((x + y) / 2 + shift) % 256) as u8,
            ])
        });
        out.clear();
        JpegEncoder::new_with_quality(&mut out, self.config.jpeg_quality)
            .encode_image(&image)
            .map_err(|err| CamError::unavailable(format!("jpeg encode failed: {}", err)))?;
        Ok(out)
    }

    fn fail(&mut self, reason: &str) -> CamError {
        self.last_error = Some(reason.to_string());
        CamError::unavailable(reason)
    }
}

impl FrameSource for SyntheticSource {
    fn acquire(&mut self) -> Result<FrameBuffer> {
        if !self.connected {
            return Err(self.fail("synthetic source not connected; call connect() first"));
        }
        if let Some(limit) = self.config.fail_after {
            if self.frame_count >= limit {
                return Err(self.fail("simulated sensor fault"));
            }
        }
        if self.outstanding >= self.config.fb_count {
            return Err(self.fail("frame buffer pool exhausted"));
        }

        pace(self.last_frame_at, frame_interval(self.config.target_fps));

        let sequence = self.frame_count + 1;
        let scratch = self.free.pop().unwrap_or_default();
        let data = self.render(sequence, scratch)?;
        let frame = FrameBuffer::new_jpeg(data, self.config.width, self.config.height, sequence)?;

        self.frame_count = sequence;
        self.outstanding += 1;
        self.last_frame_at = Some(Instant::now());
        self.last_error = None;
        Ok(frame)
    }

    fn release(&mut self, frame: FrameBuffer) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() < self.config.fb_count as usize {
            self.free.push(frame.into_bytes());
        }
    }

    fn describe(&self) -> String {
        format!(
            "stub://{} {}x{} q{}",
            self.config.name, self.config.width, self.config.height, self.config.jpeg_quality
        )
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || !self.connected {
            return false;
        }
        match self.last_frame_at {
            Some(at) => at.elapsed() <= health_grace(self.config.target_fps),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SyntheticConfig {
        SyntheticConfig {
            width: 32,
            height: 24,
            target_fps: 0,
            jpeg_quality: 80,
            ..SyntheticConfig::default()
        }
    }

    fn connected(config: SyntheticConfig) -> SyntheticSource {
        let mut source = SyntheticSource::new(config).unwrap();
        source.connect().unwrap();
        source
    }

    #[test]
    fn produces_decodable_jpeg() {
        let mut source = connected(small_config());
        let frame = source.acquire().unwrap();

        let decoded = image::load_from_memory(frame.as_bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        assert_eq!(frame.sequence, 1);
        source.release(frame);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let mut source = connected(small_config());
        let held = source.acquire().unwrap();

        let err = source.acquire().unwrap_err();
        assert!(err.to_string().contains("pool exhausted"));

        source.release(held);
        assert!(source.acquire().is_ok());
    }

    #[test]
    fn fail_after_simulates_sensor_fault() {
        let mut source = connected(SyntheticConfig {
            fail_after: Some(2),
            ..small_config()
        });
        for _ in 0..2 {
            let frame = source.acquire().unwrap();
            source.release(frame);
        }
        assert!(matches!(
            source.acquire().unwrap_err(),
            CamError::CameraUnavailable(_)
        ));
        assert!(!source.is_healthy());
    }

    #[test]
    fn acquire_before_connect_fails() {
        let mut source = SyntheticSource::new(small_config()).unwrap();
        assert!(source.acquire().is_err());
    }

    #[test]
    fn parses_fail_after_from_url() {
        let settings = SourceSettings {
            url: "stub://porch?fail_after=5".to_string(),
            ..SourceSettings::default()
        };
        let config = SyntheticConfig::from_settings(&settings).unwrap();
        assert_eq!(config.name, "porch");
        assert_eq!(config.fail_after, Some(5));
    }
}
