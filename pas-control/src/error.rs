//! Controller error taxonomy and the status codes it maps onto.
//!
//! Every controller verb returns a [`ControlResult`]; nothing panics across
//! the controller boundary. The protocol layer turns errors into a
//! [`StatusCode`] with [`ControlError::status`].

use hardware::HardwareError;
use pas_math::{KinematicsError, LstsqError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status reported to the protocol layer for every device access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Good,
    /// The request was valid but there was nothing to do (e.g. reading a
    /// sensor that is switched off).
    NothingToDo,
    BadInvalidArgument,
    BadNotWritable,
    BadNotImplemented,
    BadInvalidState,
    /// The device is busy; the same request may succeed later.
    BadRetryLater,
    BadHardware,
    BadCalibrationMissing,
}

impl StatusCode {
    pub fn is_good(&self) -> bool {
        matches!(self, StatusCode::Good | StatusCode::NothingToDo)
    }
}

/// Errors returned by controllers.
///
/// Argument and state checks happen before any hardware access, so the
/// first five variants never leave a partial state change behind.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Out-of-range offset or wrong argument count/value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Offset {0} is not writable")]
    NotWritable(u32),

    #[error("Offset {0} is not implemented")]
    NotImplemented(u32),

    /// The operation is not allowed in the current device state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The device is busy moving; only Stop is accepted.
    #[error("Device busy, retry later")]
    Busy,

    /// A move would push an edge sensor's spot out of its safe area.
    #[error("Move refused: {0}")]
    SensorOutOfRange(String),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// Response matrix or nominal readings have not been established.
    #[error("Calibration missing: {0}")]
    CalibrationMissing(String),

    #[error("Kinematics error: {0}")]
    Kinematics(#[from] KinematicsError),

    #[error("Alignment solve failed: {0}")]
    Solve(#[from] LstsqError),

    /// A referenced device has been dropped by its owner.
    #[error("Device no longer exists: {0}")]
    DeviceGone(String),

    #[error("Controller lock poisoned: {0}")]
    LockPoisoned(String),

    /// Saving or loading stored calibration failed.
    #[error("Calibration storage: {0}")]
    Storage(#[from] std::io::Error),
}

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::InvalidArgument(_) | ControlError::SensorOutOfRange(_) => {
                StatusCode::BadInvalidArgument
            }
            ControlError::NotWritable(_) => StatusCode::BadNotWritable,
            ControlError::NotImplemented(_) => StatusCode::BadNotImplemented,
            ControlError::InvalidState(_)
            | ControlError::Kinematics(_)
            | ControlError::Solve(_)
            | ControlError::DeviceGone(_) => StatusCode::BadInvalidState,
            ControlError::Busy => StatusCode::BadRetryLater,
            ControlError::Hardware(_)
            | ControlError::LockPoisoned(_)
            | ControlError::Storage(_) => StatusCode::BadHardware,
            ControlError::CalibrationMissing(_) => StatusCode::BadCalibrationMissing,
        }
    }

    /// Whether repeating the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlError::Hardware(_) | ControlError::Busy)
    }
}

/// Result type for controller operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Status of a finished controller call.
pub fn status_of<T>(result: &ControlResult<T>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::Good,
        Err(e) => e.status(),
    }
}
