//! V4L2 camera source.
//!
//! Opens a local device node, negotiates MJPEG at the configured size and
//! rate, and streams through an mmap buffer queue of `buffer_count`
//! buffers. The driver's buffer is only valid until the next dequeue, so each
//! acquisition copies the JPEG out; `release` returns the copy's bookkeeping.

use ouroboros::self_referencing;
use std::time::Instant;

use super::health_grace;
use crate::camera::FrameSource;
use crate::error::{CamError, Result};
use crate::frame::FrameBuffer;

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    /// Number of mmap buffers queued with the driver.
    pub buffer_count: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 10,
            width: 800,
            height: 600,
            buffer_count: 2,
        }
    }
}

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    frame_count: u64,
    outstanding: bool,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            frame_count: 0,
            outstanding: false,
            last_frame_at: None,
            last_error: None,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mjpg = v4l::FourCC::new(b"MJPG");
        let mut device = v4l::Device::with_path(&self.config.device).map_err(|err| {
            CamError::config(format!("open v4l2 device {}: {}", self.config.device, err))
        })?;
        let mut format = device
            .format()
            .map_err(|err| CamError::config(format!("read v4l2 format: {}", err)))?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = mjpg;

        let format = device
            .set_format(&format)
            .map_err(|err| CamError::config(format!("set v4l2 format: {}", err)))?;
        if format.fourcc != mjpg {
            return Err(CamError::config(format!(
                "{} does not support MJPEG capture",
                self.config.device
            )));
        }

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;

        let buffer_count = self.config.buffer_count.max(1);
        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, buffer_count)
                    .map_err(|err| CamError::config(format!("create v4l2 buffer stream: {}", err)))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{} MJPEG, {} buffers)",
            self.config.device,
            self.active_width,
            self.active_height,
            buffer_count
        );
        Ok(())
    }
}

impl FrameSource for V4l2Source {
    fn acquire(&mut self) -> Result<FrameBuffer> {
        use v4l::io::traits::CaptureStream;

        if self.outstanding {
            return Err(CamError::unavailable("frame buffer pool exhausted"));
        }
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CamError::unavailable("v4l2 device not connected"))?;
        let data = state
            .with_stream_mut(|stream| {
                stream.next().map(|(buf, meta)| {
                    let used = (meta.bytesused as usize).min(buf.len());
                    buf[..used].to_vec()
                })
            })
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                CamError::unavailable(format!("capture v4l2 frame: {}", err))
            })?;

        let frame = FrameBuffer::new_jpeg(
            data,
            self.active_width,
            self.active_height,
            self.frame_count + 1,
        )?;
        self.frame_count += 1;
        self.outstanding = true;
        self.last_frame_at = Some(Instant::now());
        self.last_error = None;
        Ok(frame)
    }

    fn release(&mut self, _frame: FrameBuffer) {
        self.outstanding = false;
    }

    fn describe(&self) -> String {
        format!(
            "{} {}x{} MJPEG",
            self.config.device, self.active_width, self.active_height
        )
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        match self.last_frame_at {
            Some(at) => at.elapsed() <= health_grace(self.config.target_fps),
            None => true,
        }
    }
}
