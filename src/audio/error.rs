//! Error types for the audio layer

use thiserror::Error;

use super::catalog::Direction;

pub type Result<T> = std::result::Result<T, AudioError>;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio driver initialization failed: {0}")]
    DriverInit(String),

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("No {direction} device matches '{label}'")]
    DeviceNotFound { label: String, direction: Direction },

    #[error("Failed to open stream on '{device}': {reason}")]
    StreamOpen { device: String, reason: String },

    #[error("Stream on '{device}' did not shut down cleanly: {reason}")]
    StreamClose { device: String, reason: String },

    #[error("Recorder already running")]
    AlreadyRunning,

    #[error("Recorder is closed")]
    RecorderClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AudioError {
    pub fn driver_init<S: Into<String>>(msg: S) -> Self {
        Self::DriverInit(msg.into())
    }

    pub fn enumeration<S: Into<String>>(msg: S) -> Self {
        Self::Enumeration(msg.into())
    }

    pub fn not_found<S: Into<String>>(label: S, direction: Direction) -> Self {
        Self::DeviceNotFound {
            label: label.into(),
            direction,
        }
    }

    pub fn stream_open<D: Into<String>, R: std::fmt::Display>(device: D, reason: R) -> Self {
        Self::StreamOpen {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}
