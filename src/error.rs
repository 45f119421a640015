//! Error types for the camera core

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = CameraError> = std::result::Result<T, E>;

/// Top-level error surfaced by [`crate::Camera`] operations
#[derive(Debug, Error)]
pub enum CameraError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("camera has no open connection")]
    NotConnected,

    #[error("camera already has an open connection")]
    AlreadyConnected,

    #[error("no frame has been received yet")]
    NoFrameYet,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled by stop()")]
    Cancelled,

    #[error("invalid camera url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Transport-level failures of the upstream HTTP stream
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("camera responded with {0}")]
    Status(reqwest::StatusCode),

    #[error("camera rejected the supplied credentials")]
    Unauthorized,

    #[error("unsupported authentication challenge: {0}")]
    UnsupportedChallenge(String),

    #[error("could not answer digest challenge: {0}")]
    Digest(String),

    #[error("upstream closed the stream")]
    Closed,
}

/// Malformed upstream data; fatal for the pipeline instance that hit it
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("unexpected {len} bytes before multipart boundary")]
    UnexpectedData { len: usize },

    #[error("malformed part headers: {0}")]
    MalformedHeaders(String),

    #[error("jpeg decode failed: {0}")]
    Jpeg(String),
}

impl CameraError {
    /// Whether the failure came from the transport rather than the data
    pub fn is_connection(&self) -> bool {
        matches!(self, CameraError::Connection(_))
    }
}
