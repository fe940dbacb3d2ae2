use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::register::{Model, SensorValue};

/// Frame-level decode failures. A frame that trips any of these is
/// discarded whole; no partially-decoded frame ever reaches a caller.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("device id mismatch: expected {expected}, got {actual}")]
    DeviceIdMismatch { expected: u8, actual: u8 },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no inverter replied within {0:?}")]
    NoResponse(Duration),

    #[error("invalid discovery reply: {0}")]
    InvalidReply(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind command port: {0}")]
    Bind(#[source] std::io::Error),

    #[error("no inverter session connected")]
    NotConnected,

    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Reset(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl SessionError {
    /// True for errors that invalidate the underlying transport. The
    /// session must be discarded and re-established after any of these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Timeout(_) | SessionError::Reset(_) | SessionError::NotConnected
        )
    }
}

/// One sensor that could not be read or decoded during a poll.
#[derive(Debug, Clone)]
pub struct FailedSensor {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("no inverter session connected")]
    NotConnected,

    /// Some sub-requests failed. `partial` still carries every sensor
    /// that decoded, so callers can update what they have rather than
    /// throwing the whole cycle away.
    #[error("poll failed for {} sensor(s)", failed.len())]
    Partial {
        partial: HashMap<String, SensorValue>,
        failed: Vec<FailedSensor>,
    },
}

#[derive(Debug, Error)]
#[error("sensor {sensor} is not supported by model {model}")]
pub struct UnsupportedSensor {
    pub sensor: String,
    pub model: Model,
}
