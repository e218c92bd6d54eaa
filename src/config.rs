use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_SOURCE_URL: &str = "stub://camera";
// SVGA with a single frame buffer: the profile of a camera board without
// external PSRAM.
const DEFAULT_WIDTH: u32 = 800;
const DEFAULT_HEIGHT: u32 = 600;
const DEFAULT_FPS: u32 = 10;
// Encoder scale, 1-100 with higher meaning better.
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_FB_COUNT: u32 = 1;
const DEFAULT_MAX_STREAMS: usize = 1;
const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
struct CamdConfigFile {
    bind_addr: Option<String>,
    advertise_ip: Option<String>,
    max_streams: Option<usize>,
    capture_timeout_ms: Option<u64>,
    source: Option<SourceConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    jpeg_quality: Option<u8>,
    fb_count: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    write_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CamdConfig {
    pub bind_addr: String,
    /// Address reported by `/status`; defaults to the accepting socket's address.
    pub advertise_ip: Option<IpAddr>,
    pub max_streams: usize,
    /// How long `/capture` waits for a camera another handler is using.
    pub capture_timeout: Duration,
    pub source: SourceSettings,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub jpeg_quality: u8,
    pub fb_count: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_SOURCE_URL.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            target_fps: DEFAULT_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            fb_count: DEFAULT_FB_COUNT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamSettings {
    /// Per-write socket timeout. `None` blocks for as long as the client does.
    pub write_timeout: Option<Duration>,
}

impl Default for CamdConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            advertise_ip: None,
            max_streams: DEFAULT_MAX_STREAMS,
            capture_timeout: Duration::from_millis(DEFAULT_CAPTURE_TIMEOUT_MS),
            source: SourceSettings::default(),
            stream: StreamSettings::default(),
        }
    }
}

impl CamdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamdConfigFile) -> Result<Self> {
        let defaults = SourceSettings::default();
        let source = file.source.unwrap_or_default();
        let advertise_ip = match file.advertise_ip {
            Some(ip) => Some(parse_ip(&ip)?),
            None => None,
        };
        Ok(Self {
            bind_addr: file
                .bind_addr
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            advertise_ip,
            max_streams: file.max_streams.unwrap_or(DEFAULT_MAX_STREAMS),
            capture_timeout: Duration::from_millis(
                file.capture_timeout_ms.unwrap_or(DEFAULT_CAPTURE_TIMEOUT_MS),
            ),
            source: SourceSettings {
                url: source.url.unwrap_or(defaults.url),
                width: source.width.unwrap_or(defaults.width),
                height: source.height.unwrap_or(defaults.height),
                target_fps: source.target_fps.unwrap_or(defaults.target_fps),
                jpeg_quality: source.jpeg_quality.unwrap_or(defaults.jpeg_quality),
                fb_count: source.fb_count.unwrap_or(defaults.fb_count),
            },
            stream: StreamSettings {
                write_timeout: file
                    .stream
                    .and_then(|stream| stream.write_timeout_ms)
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CAMD_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }
        if let Ok(ip) = std::env::var("CAMD_ADVERTISE_IP") {
            if !ip.trim().is_empty() {
                self.advertise_ip = Some(parse_ip(&ip)?);
            }
        }
        if let Ok(url) = std::env::var("CAMD_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(max) = std::env::var("CAMD_MAX_STREAMS") {
            self.max_streams = max
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMD_MAX_STREAMS must be a positive integer"))?;
        }
        if let Ok(timeout) = std::env::var("CAMD_CAPTURE_TIMEOUT_MS") {
            let ms: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("CAMD_CAPTURE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.capture_timeout = Duration::from_millis(ms);
        }
        if let Ok(timeout) = std::env::var("CAMD_WRITE_TIMEOUT_MS") {
            let ms: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("CAMD_WRITE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.stream.write_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid bind address '{}': {}", self.bind_addr, e))?;
        if self.max_streams == 0 {
            return Err(anyhow!("max_streams must be at least 1"));
        }
        if self.capture_timeout.is_zero() {
            return Err(anyhow!("capture_timeout_ms must be greater than zero"));
        }
        let source = &self.source;
        if source.url.trim().is_empty() {
            return Err(anyhow!("source url must not be empty"));
        }
        if source.width == 0 || source.height == 0 {
            return Err(anyhow!("source width and height must be greater than zero"));
        }
        if !(1..=100).contains(&source.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }
        if source.fb_count == 0 {
            return Err(anyhow!("fb_count must be at least 1"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CamdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_ip(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid advertise ip '{}'", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CamdConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.source.url, "stub://camera");
        assert_eq!(cfg.max_streams, 1);
        assert!(cfg.stream.write_timeout.is_none());
    }

    #[test]
    fn rejects_out_of_range_quality() {
        let mut cfg = CamdConfig::default();
        cfg.source.jpeg_quality = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_write_timeout_means_disabled() {
        let file: CamdConfigFile =
            serde_json::from_str(r#"{"stream": {"write_timeout_ms": 0}}"#).unwrap();
        let cfg = CamdConfig::from_file(file).unwrap();
        assert!(cfg.stream.write_timeout.is_none());
    }

    #[test]
    fn capture_timeout_defaults_and_rejects_zero() {
        let mut cfg = CamdConfig::default();
        assert_eq!(cfg.capture_timeout, Duration::from_secs(2));
        assert_eq!(cfg.source.jpeg_quality, 80);
        cfg.capture_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
