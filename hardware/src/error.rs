use thiserror::Error;

/// Errors reported by physical devices or their simulators.
#[derive(Error, Debug)]
pub enum HardwareError {
    /// Low-level I/O error (serial read/write failure).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to open or configure a serial port.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No response within the timeout period.
    #[error("Timeout waiting for device")]
    Timeout,

    /// Device answered with something we could not parse.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Device reported a fault of its own.
    #[error("Device fault: {0}")]
    Fault(String),

    /// Device is powered down or was never connected.
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// Shared device state was poisoned by a panicking thread.
    #[error("Device state lock poisoned")]
    LockPoisoned,
}

/// Result type for hardware operations.
pub type HardwareResult<T> = Result<T, HardwareError>;
