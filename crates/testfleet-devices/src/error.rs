/*!
 * Error types for device communication and recovery.
 */
use thiserror::Error;

/// Fault raised by the transport while talking to a device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The command did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The connection to the device broke
    #[error("I/O error: {0}")]
    Io(String),

    /// The device refused the command
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// The device is not known to the transport
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Short name of the failure, used in logs and watch output
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Io(_) => "io",
            TransportError::CommandRejected(_) => "command-rejected",
            TransportError::NotFound(_) => "not-found",
            TransportError::Other(_) => "other",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Error type for device operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device could not be brought online and responsive
    #[error("Device {serial} not available: {message}")]
    DeviceUnavailable {
        /// The device serial
        serial: String,
        /// What failed
        message: String,
    },

    /// The device is reachable but failed a higher-order readiness check
    #[error("Device {serial} unresponsive: {message}")]
    DeviceUnresponsive {
        /// The device serial
        serial: String,
        /// What failed
        message: String,
    },

    /// A transport fault that recovery did not absorb
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new device unavailable error
    pub fn unavailable<S: AsRef<str>, M: AsRef<str>>(serial: S, message: M) -> Self {
        DeviceError::DeviceUnavailable {
            serial: serial.as_ref().to_string(),
            message: message.as_ref().to_string(),
        }
    }

    /// Create a new device unresponsive error
    pub fn unresponsive<S: AsRef<str>, M: AsRef<str>>(serial: S, message: M) -> Self {
        DeviceError::DeviceUnresponsive {
            serial: serial.as_ref().to_string(),
            message: message.as_ref().to_string(),
        }
    }

    /// The serial of the device involved, if known
    pub fn serial(&self) -> Option<&str> {
        match self {
            DeviceError::DeviceUnavailable { serial, .. }
            | DeviceError::DeviceUnresponsive { serial, .. } => Some(serial),
            DeviceError::Transport(_) => None,
        }
    }

    /// Whether this is the softer unresponsive failure
    pub fn is_unresponsive(&self) -> bool {
        matches!(self, DeviceError::DeviceUnresponsive { .. })
    }
}
