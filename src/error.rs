use thiserror::Error;

/// Application level error type used throughout the crate.
#[derive(Error, Debug)]
pub enum PlcError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while rendering JSON reports
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Device I/O failure
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Alarm store failure
    #[error("Alarm store error: {0}")]
    Store(#[from] StoreError),

    /// Requested item was not found
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Outcome taxonomy for [`crate::device::DeviceIoManager`] operations.
///
/// `ConnectionUnavailable` and `Protocol` mean "no data this cycle" and are
/// expected while a PLC is offline. `InvalidArgument` is a caller bug and is
/// never retried. `VerificationMismatch` means a control output did not reach
/// the requested state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Device '{device}' unavailable: {reason}")]
    ConnectionUnavailable { device: String, reason: String },

    #[error("Device '{device}' protocol error: {reason}")]
    Protocol { device: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "Verification mismatch on '{device}' register {address} bit {bit}: expected {expected}, read back {actual}"
    )]
    VerificationMismatch {
        device: String,
        address: u16,
        bit: u8,
        expected: u8,
        actual: u8,
    },
}

impl DeviceError {
    /// True for failures the caller should simply retry on its next cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DeviceError::ConnectionUnavailable { .. } | DeviceError::Protocol { .. }
        )
    }
}

/// Errors raised by an [`crate::alarm_manager::AlarmStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another writer changed the occurrence for this key first.
    /// `origin` is the alarm source.
    #[error("Concurrent update on alarm ({origin}, {key})")]
    Conflict { origin: String, key: String },

    #[error("Alarm occurrence {0} not found")]
    NotFound(u64),

    #[error("Alarm store backend failure: {0}")]
    Backend(String),
}

/// Convenient alias over [`Result`] using [`PlcError`]
pub type Result<T> = std::result::Result<T, PlcError>;
