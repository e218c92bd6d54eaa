//! DoorGuard camera server.
//!
//! Exposes a camera over HTTP: a still capture, a multipart MJPEG stream, a
//! status document and a landing page.
//!
//! # Frame ownership
//!
//! Frame buffers come from a `FrameSource` (the camera driver) and must go
//! back to it exactly once. Handlers never see a bare buffer; they get a
//! `FrameGuard` from `Camera::acquire`, and dropping the guard releases the
//! buffer on every exit path. The guard also holds the camera's ownership
//! token, so only one buffer is outstanding process-wide.
//!
//! # Module Structure
//!
//! - `frame`: `FrameBuffer`, `FrameGuard`
//! - `camera`: `FrameSource` seam and the shared `Camera` context
//! - `ingest`: source backends (synthetic, JPEG directory, V4L2)
//! - `api`: dispatcher, `Connection` seam, capture and stream handlers
//! - `config`: daemon configuration

pub mod api;
pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;

pub use api::{CameraServer, ServerConfig, ServerHandle};
pub use camera::{Camera, CameraStats, FrameSource};
pub use config::{CamdConfig, SourceSettings, StreamSettings};
pub use error::{CamError, Result};
pub use frame::{FrameBuffer, FrameFormat, FrameGuard};
pub use ingest::open_source;
