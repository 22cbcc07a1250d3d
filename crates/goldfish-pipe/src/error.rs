use thiserror::Error;

use crate::layout::status;

/// Errors surfaced to pipe callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipeError {
    #[error("invalid argument")]
    InvalidArgument,

    /// The host asked to try again and the caller opted out of blocking.
    #[error("resource temporarily unavailable")]
    WouldBlock,

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error")]
    Io,

    /// A user buffer could not be pinned.
    #[error("bad address")]
    Fault,

    /// The caller was cancelled while blocked; the call may be restarted.
    #[error("interrupted while waiting")]
    Interrupted,

    #[error("inappropriate control request for this pipe")]
    NotSupported,
}

pub type Result<T, E = PipeError> = std::result::Result<T, E>;

impl PipeError {
    /// Translates a negative host status into the caller's error vocabulary.
    ///
    /// Unknown values are reported as [`PipeError::InvalidArgument`].
    pub fn from_host_status(status: i32) -> Self {
        match status {
            status::ERROR_AGAIN => PipeError::WouldBlock,
            status::ERROR_NOMEM => PipeError::OutOfMemory,
            status::ERROR_IO => PipeError::Io,
            _ => PipeError::InvalidArgument,
        }
    }

    /// Negative errno value for embedders exposing a syscall surface.
    pub fn errno(self) -> i32 {
        match self {
            PipeError::InvalidArgument => -22,
            PipeError::WouldBlock => -11,
            PipeError::OutOfMemory => -12,
            PipeError::Io => -5,
            PipeError::Fault => -14,
            PipeError::Interrupted => -512,
            PipeError::NotSupported => -25,
        }
    }
}

/// Errors raised while attaching to a pipe device.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("host pipe device version {host} is older than the supported version {required}")]
    UnsupportedDeviceVersion { host: u32, required: u32 },

    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("could not allocate the shared device page")]
    OutOfMemory,

    #[error("failed to spawn the interrupt bottom-half worker")]
    SpawnBottomHalf(#[source] std::io::Error),
}
