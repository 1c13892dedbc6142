use std::time::Duration;

use pulsecompiler_backend::error::{ErrorKind, SequencerError};

/// Failures of the link to the pulser.
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No reply from the device within {0:?}")]
    Timeout(Duration),
    #[error("The device worker has shut down")]
    WorkerClosed,
    #[error("The device rejected '{command}' with code {code}: {message}")]
    Rejected {
        command: String,
        code: i32,
        message: String,
    },
    #[error("Unexpected reply '{reply}' to '{command}'")]
    UnexpectedReply { command: String, reply: String },
}

pub type Result<T, E = DeviceError> = std::result::Result<T, E>;

impl From<DeviceError> for SequencerError {
    fn from(err: DeviceError) -> Self {
        ErrorKind::Device(err.to_string()).into()
    }
}
