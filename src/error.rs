//! Error types for the lamp-rust-ble crate.

use thiserror::Error;

use crate::ble::transport::RadioState;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The radio is not powered on (or access to it was refused).
    #[error("Bluetooth radio unavailable (state: {state})")]
    RadioUnavailable {
        /// The last radio state that was observed.
        state: RadioState,
    },

    /// The adapter does not know a peripheral with this identifier.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was looked up.
        identifier: String,
    },

    /// A scan pass is already running on this scanner.
    #[error("A scan is already in progress")]
    ScanInProgress,

    /// Failed to establish a connection to the peripheral.
    #[error("Connection to {peripheral} failed: {reason}")]
    ConnectFailed {
        /// Identifier of the peripheral that was targeted.
        peripheral: String,
        /// Description of why the connection failed.
        reason: String,
    },

    /// Operation requires a connection but the peripheral is not connected.
    #[error("Peripheral not connected")]
    NotConnected,

    /// Connected, but no control characteristic has been selected.
    #[error("No control characteristic selected")]
    NoCharacteristicSelected,

    /// Characteristic not found among the discovered characteristics.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID (or legacy handle) that was not found.
        uuid: String,
    },

    /// Writing the control characteristic failed.
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// Description of the failure.
        reason: String,
    },

    /// Reading the control characteristic failed.
    #[error("Read failed: {reason}")]
    ReadFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The adapter never answered within the allotted time.
    #[error("{operation} timed out")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether reconnection or a bounded retry can clear this error.
    ///
    /// `RadioUnavailable` needs the caller to retry `await_ready`, and
    /// parameter errors need a different call, so both report `false`.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. }
            | Self::NotConnected
            | Self::NoCharacteristicSelected
            | Self::CharacteristicNotFound { .. }
            | Self::WriteFailed { .. }
            | Self::ReadFailed { .. }
            | Self::Timeout { .. }
            | Self::Bluetooth(_) => true,
            Self::RadioUnavailable { .. }
            | Self::DeviceNotFound { .. }
            | Self::ScanInProgress
            | Self::InvalidParameter { .. }
            | Self::Internal(_) => false,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
