/*!
 * Error types for the TestFleet engine crate.
 */
use thiserror::Error;

/// Error type for TestFleet engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// The manager was used before `init`
    #[error("Device manager not initialized")]
    NotInitialized,

    /// The manager was used after `terminate`
    #[error("Device manager terminated")]
    Terminated,

    /// No device with this serial is known
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The device is allocated and cannot be removed
    #[error("Device allocated: {0}")]
    Allocated(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] testfleet_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] testfleet_core::error::Error),
}

/// Result type for TestFleet engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(serial: S) -> Self {
        Error::NotFound(serial.as_ref().to_string())
    }

    /// Create a new allocated error
    pub fn allocated<S: AsRef<str>>(serial: S) -> Self {
        Error::Allocated(serial.as_ref().to_string())
    }
}
