//! Error types for the ranging driver.
//!
//! Every operation in this crate reports failures through [`SonarError`]. The
//! variants fall into a small set of kinds ([`ErrorKind`]) that callers can
//! match on without caring about the detail carried by each variant:
//!
//! - **`NoDevice`**: the identity does not resolve to an attached sensor, or
//!   the slot was detached underneath an open handle.
//! - **`InvalidArgument`**: the read buffer is absent or not exactly 2 bytes.
//! - **`IoFailure`**: subscribing to echo edges or writing the trigger line
//!   failed. Wraps the backend's [`PinError`].
//! - **`Timeout`**: the echo did not complete before the deadline, or the wait
//!   was interrupted.
//! - **`CaptureIncomplete`**: completion was signaled but a timestamp is unset.
//! - **`OutOfRange`**: the computed distance is outside the sensor envelope.
//! - **`PoolExhausted`**: attach with every slot already bound.
//!
//! None of these are fatal. A failed measurement leaves its slot reset and
//! ready for the next attempt.
//!
//! [`SonarError::errno`] gives the POSIX code a character-device read would
//! surface for the same failure, for callers that bridge into a file API.

use std::time::Duration;

use thiserror::Error;

use crate::hardware::PinError;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, SonarError>;

/// Errors produced by the registry, the measurement engine and configuration.
#[derive(Error, Debug)]
pub enum SonarError {
    /// Identity does not resolve to an occupied slot.
    #[error("No such device: {0}")]
    NoDevice(String),

    /// Caller supplied a malformed request.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A pin operation failed.
    #[error("I/O failure during {operation}: {source}")]
    Io {
        /// Operation that was being performed (e.g. "trigger high").
        operation: &'static str,
        /// Backend error.
        #[source]
        source: PinError,
    },

    /// No completed echo within the deadline.
    #[error("Timed out after {waited:?} waiting for echo (interrupted: {interrupted})")]
    Timeout {
        /// Configured deadline.
        waited: Duration,
        /// True when the wait was cut short by an interrupt.
        interrupted: bool,
    },

    /// Completion was signaled but a timestamp was never recorded.
    #[error("Echo capture incomplete (start recorded: {start_recorded}, end recorded: {end_recorded})")]
    CaptureIncomplete {
        /// Rising edge timestamp present.
        start_recorded: bool,
        /// Falling edge timestamp present.
        end_recorded: bool,
    },

    /// Distance outside the sensor's operating envelope.
    #[error("Measured distance {distance_mm} mm is outside the valid range")]
    OutOfRange {
        /// Computed distance before validation.
        distance_mm: i64,
    },

    /// Every slot in the registry is bound.
    #[error("Device pool exhausted: all {capacity} slots are in use")]
    PoolExhausted {
        /// Registry capacity.
        capacity: usize,
    },

    /// Attach request lacked a required property.
    #[error("Missing device property '{0}'")]
    MissingProperty(&'static str),

    /// Attach request for a physical device that is already bound.
    #[error("Device '{0}' is already attached")]
    AlreadyAttached(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

/// Coarse classification of [`SonarError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`SonarError::NoDevice`].
    NoDevice,
    /// See [`SonarError::InvalidArgument`].
    InvalidArgument,
    /// See [`SonarError::Io`].
    IoFailure,
    /// See [`SonarError::Timeout`].
    Timeout,
    /// See [`SonarError::CaptureIncomplete`].
    CaptureIncomplete,
    /// See [`SonarError::OutOfRange`].
    OutOfRange,
    /// See [`SonarError::PoolExhausted`].
    PoolExhausted,
    /// Attach-time property problems.
    MissingProperty,
    /// Duplicate attach.
    AlreadyAttached,
    /// Load or validation failure.
    Config,
}

impl SonarError {
    /// Wrap a pin error with the operation that produced it.
    pub fn io(operation: &'static str, source: PinError) -> Self {
        Self::Io { operation, source }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoDevice(_) => ErrorKind::NoDevice,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Io { .. } => ErrorKind::IoFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CaptureIncomplete { .. } => ErrorKind::CaptureIncomplete,
            Self::OutOfRange { .. } => ErrorKind::OutOfRange,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::MissingProperty(_) => ErrorKind::MissingProperty,
            Self::AlreadyAttached(_) => ErrorKind::AlreadyAttached,
            Self::Config(_) | Self::Configuration(_) => ErrorKind::Config,
        }
    }

    /// POSIX error number matching this failure.
    pub fn errno(&self) -> i32 {
        match self.kind() {
            ErrorKind::NoDevice => libc::ENODEV,
            ErrorKind::InvalidArgument | ErrorKind::Config => libc::EINVAL,
            ErrorKind::IoFailure => libc::EIO,
            ErrorKind::Timeout => libc::ETIMEDOUT,
            ErrorKind::CaptureIncomplete | ErrorKind::OutOfRange => libc::ENOMSG,
            ErrorKind::PoolExhausted => libc::EBUSY,
            ErrorKind::MissingProperty => libc::ENOENT,
            ErrorKind::AlreadyAttached => libc::EEXIST,
        }
    }

    /// Check if this is a deadline/interrupt failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<figment::Error> for SonarError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
