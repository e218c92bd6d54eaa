//! JPEG directory replay source (`file://<dir>`).
//!
//! Loads every `.jpg`/`.jpeg` file in a local directory at connect time and
//! hands them out in name order, looping forever. Useful for demos and for
//! exercising clients against known images.

use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{frame_interval, health_grace, pace};
use crate::camera::FrameSource;
use crate::error::{CamError, Result};
use crate::frame::FrameBuffer;

#[derive(Clone, Debug)]
pub struct FileConfig {
    pub dir: PathBuf,
    /// Replay rate. Zero replays as fast as clients pull.
    pub target_fps: u32,
}

struct StillImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

pub struct FileSource {
    config: FileConfig,
    images: Vec<StillImage>,
    cursor: usize,
    outstanding: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl FileSource {
    pub fn new(config: FileConfig) -> Self {
        Self {
            config,
            images: Vec::new(),
            cursor: 0,
            outstanding: false,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        let mut paths = list_jpegs(&self.config.dir)?;
        paths.sort();

        let mut images = Vec::with_capacity(paths.len());
        for path in &paths {
            let data = std::fs::read(path).map_err(|err| {
                CamError::config(format!("read {}: {}", path.display(), err))
            })?;
            let (width, height) = image::image_dimensions(path).map_err(|err| {
                CamError::config(format!("{} is not a readable jpeg: {}", path.display(), err))
            })?;
            images.push(StillImage {
                data,
                width,
                height,
            });
        }
        if images.is_empty() {
            return Err(CamError::config(format!(
                "no .jpg files found in {}",
                self.config.dir.display()
            )));
        }

        log::info!(
            "FileSource: loaded {} image(s) from {}",
            images.len(),
            self.config.dir.display()
        );
        self.images = images;
        self.cursor = 0;
        Ok(())
    }
}

impl FrameSource for FileSource {
    fn acquire(&mut self) -> Result<FrameBuffer> {
        if self.images.is_empty() {
            return Err(CamError::unavailable(
                "file source not connected; call connect() first",
            ));
        }
        if self.outstanding {
            return Err(CamError::unavailable("frame buffer pool exhausted"));
        }

        pace(self.last_frame_at, frame_interval(self.config.target_fps));

        let still = &self.images[self.cursor];
        let frame = FrameBuffer::new_jpeg(
            still.data.clone(),
            still.width,
            still.height,
            self.frame_count + 1,
        )?;
        self.cursor = (self.cursor + 1) % self.images.len();
        self.frame_count += 1;
        self.outstanding = true;
        self.last_frame_at = Some(Instant::now());
        Ok(frame)
    }

    fn release(&mut self, _frame: FrameBuffer) {
        self.outstanding = false;
    }

    fn describe(&self) -> String {
        format!(
            "file://{} ({} images)",
            self.config.dir.display(),
            self.images.len()
        )
    }

    fn is_healthy(&self) -> bool {
        if self.images.is_empty() {
            return false;
        }
        match self.last_frame_at {
            Some(at) => at.elapsed() <= health_grace(self.config.target_fps),
            None => true,
        }
    }
}

fn list_jpegs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|err| CamError::config(format!("read directory {}: {}", dir.display(), err)))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| CamError::config(format!("read directory {}: {}", dir.display(), err)))?
            .path();
        let is_jpeg = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            .unwrap_or(false);
        if is_jpeg && path.is_file() {
            paths.push(path);
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn write_jpeg(dir: &Path, name: &str, width: u32, height: u32) {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 10, 10]));
        image.save(dir.join(name)).unwrap();
    }

    #[test]
    fn replays_images_in_name_order() {
        let dir = tempdir().unwrap();
        write_jpeg(dir.path(), "b.jpg", 16, 8);
        write_jpeg(dir.path(), "a.jpg", 8, 4);
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = FileSource::new(FileConfig {
            dir: dir.path().to_path_buf(),
            target_fps: 0,
        });
        source.connect().unwrap();

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let frame = source.acquire().unwrap();
            sizes.push((frame.width, frame.height, frame.sequence));
            source.release(frame);
        }
        assert_eq!(sizes, vec![(8, 4, 1), (16, 8, 2), (8, 4, 3)]);
    }

    #[test]
    fn empty_directory_is_a_config_error() {
        let dir = tempdir().unwrap();
        let mut source = FileSource::new(FileConfig {
            dir: dir.path().to_path_buf(),
            target_fps: 0,
        });
        assert!(matches!(source.connect(), Err(CamError::Config(_))));
    }

    #[test]
    fn second_buffer_unavailable_until_release() {
        let dir = tempdir().unwrap();
        write_jpeg(dir.path(), "only.jpg", 4, 4);
        let mut source = FileSource::new(FileConfig {
            dir: dir.path().to_path_buf(),
            target_fps: 0,
        });
        source.connect().unwrap();

        let held = source.acquire().unwrap();
        assert!(source.acquire().is_err());
        source.release(held);
        assert!(source.acquire().is_ok());
    }
}
