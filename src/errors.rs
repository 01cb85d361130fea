use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("could not open serial port {port}: {reason}")]
    ChannelUnavailable { port: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Why a single device transaction produced no value.
///
/// None of these are fatal; the scheduler logs them and waits for the next tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// Another transaction held the device permit; the request was never sent.
    #[error("device busy, measurement skipped")]
    Skipped,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<DriverError> for FailureReason {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Protocol(detail) | DriverError::Timeout(detail) => {
                FailureReason::Malformed(detail)
            }
            other => FailureReason::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
