//! Error types for the session core, the frame decoder, and the reading parser.

use thiserror::Error;

use crate::types::{FailReason, SensorKind, SessionState};

/// Failure to turn notification bytes into a text line.
///
/// Non-fatal: the session keeps receiving, but the decoder drops its
/// unterminated remainder when one of these is produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("line of {len} bytes is not valid UTF-8")]
    InvalidUtf8 { len: usize },

    #[error("{len} bytes buffered without a line terminator (cap {cap})")]
    Overflow { len: usize, cap: usize },
}

/// Failure to read the numeric part of a tagged line.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingError {
    #[error("bad {0} number")]
    BadNumber(SensorKind),
}

/// Everything that can end or reject a session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("missing Bluetooth permission")]
    PermissionDenied,

    #[error("Bluetooth radio is disabled")]
    RadioDisabled,

    #[error("target device not found before the scan timed out")]
    ScanTimedOut,

    #[error("connection failed with status {0}")]
    ConnectError(i32),

    #[error("service not found")]
    ServiceNotFound,

    #[error("characteristic not found")]
    CharacteristicNotFound,

    #[error("service discovery failed with status {0}")]
    DiscoveryError(i32),

    #[error("enabling notifications failed with status {0}")]
    SubscribeError(i32),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Parse(#[from] ReadingError),

    #[error("a session is already active ({0:?})")]
    Busy(SessionState),

    #[error("a scan is already running")]
    ScanInProgress,
}

impl From<FailReason> for SessionError {
    fn from(reason: FailReason) -> Self {
        match reason {
            FailReason::PermissionDenied => SessionError::PermissionDenied,
            FailReason::RadioDisabled => SessionError::RadioDisabled,
            FailReason::ScanTimedOut => SessionError::ScanTimedOut,
            FailReason::ConnectError(code) => SessionError::ConnectError(code),
            FailReason::ServiceNotFound => SessionError::ServiceNotFound,
            FailReason::CharacteristicNotFound => SessionError::CharacteristicNotFound,
            FailReason::DiscoveryError(code) => SessionError::DiscoveryError(code),
            FailReason::SubscribeError(code) => SessionError::SubscribeError(code),
        }
    }
}
