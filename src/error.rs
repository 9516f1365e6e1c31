use thiserror::Error;

use crate::state::ConnectionState;

/// Errors that can occur when working with Mi Band devices
#[derive(Error, Debug)]
pub enum BandError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No compatible device found during scanning
    #[error("Mi Band device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed {
        /// Address of the device that failed to connect
        address: String,
        /// Underlying failure description
        reason: String,
    },

    /// Device disconnected unexpectedly
    #[error("Device {address} disconnected")]
    Disconnected {
        /// Address of the disconnected device
        address: String,
    },

    /// Authentication handshake failed
    #[error("Authentication failed for {address}: {reason}")]
    AuthenticationFailed {
        /// Address of the device that rejected authentication
        address: String,
        /// Failure reason recorded by the handshake
        reason: String,
    },

    /// Pre-shared auth key is not 32 hex characters
    #[error("Invalid auth key: {0}")]
    InvalidAuthKey(String),

    /// A required GATT characteristic is missing
    #[error("Characteristic {uuid} not found on {address}")]
    CharacteristicNotFound {
        /// Address of the device
        address: String,
        /// UUID of the missing characteristic
        uuid: String,
    },

    /// Characteristic write failed
    #[error("Write to {uuid} failed on {address}: {reason}")]
    WriteFailed {
        /// Address of the device
        address: String,
        /// UUID of the target characteristic
        uuid: String,
        /// Underlying failure description
        reason: String,
    },

    /// Characteristic read failed
    #[error("Read from {uuid} failed on {address}: {reason}")]
    ReadFailed {
        /// Address of the device
        address: String,
        /// UUID of the source characteristic
        uuid: String,
        /// Underlying failure description
        reason: String,
    },

    /// Notification subscription failed
    #[error("Notification setup for {uuid} failed on {address}: {reason}")]
    NotificationFailed {
        /// Address of the device
        address: String,
        /// UUID of the characteristic
        uuid: String,
        /// Underlying failure description
        reason: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Device classified as a type this crate cannot drive
    #[error("Device {address} is not supported")]
    DeviceNotSupported {
        /// Address of the unsupported device
        address: String,
    },

    /// Bluetooth permissions denied by the platform
    #[error("Bluetooth permissions denied: {0}")]
    PermissionsDenied(String),

    /// A scan is already in progress
    #[error("Scan already in progress")]
    ScanInProgress,

    /// State machine rejected a transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// State before the rejected transition
        from: ConnectionState,
        /// Requested target state
        to: ConnectionState,
    },

    /// Packet or value parsing failed
    #[error("Failed to parse: {0}")]
    Parse(String),
}

/// Result type for Mi Band operations
pub type Result<T> = std::result::Result<T, BandError>;

impl BandError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed { .. }
                | Self::Disconnected { .. }
                | Self::DeviceNotFound
        )
    }

    /// Check if this error is terminal for an authentication attempt
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. } | Self::InvalidAuthKey(_)
        )
    }

    /// Address of the device this error originated from, when known
    #[must_use]
    pub fn device_address(&self) -> Option<&str> {
        match self {
            Self::ConnectionFailed { address, .. }
            | Self::Disconnected { address }
            | Self::AuthenticationFailed { address, .. }
            | Self::CharacteristicNotFound { address, .. }
            | Self::WriteFailed { address, .. }
            | Self::ReadFailed { address, .. }
            | Self::NotificationFailed { address, .. }
            | Self::DeviceNotSupported { address } => Some(address),
            _ => None,
        }
    }
}
