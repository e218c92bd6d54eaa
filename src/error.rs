//! Error taxonomy for the camera core.
//!
//! Nothing in here is fatal to the process. Each variant is scoped to the
//! request or stream that produced it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CamError {
    /// Frame acquisition failed (driver fault, pool exhaustion, source gone).
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    /// Another handler kept the camera for longer than the caller would wait.
    #[error("camera busy after waiting {0:?}")]
    Busy(std::time::Duration),

    /// Writing to a client connection failed or the peer reset it.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Invalid source or server configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CamError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        CamError::CameraUnavailable(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        CamError::Config(reason.into())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, CamError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, CamError>;
