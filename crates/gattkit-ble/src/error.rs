//! Error types for GATT backends

use gattkit_core::att::AttError;
use gattkit_core::{ControllerError, GattError, ServiceError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors reported by a backend or the controller plumbing
#[derive(Error, Debug)]
pub enum BleError {
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Device not found: {address}")]
    DeviceNotFound { address: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Link closed by the remote device")]
    LinkClosed,

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("No attribute at handle 0x{handle:04X}")]
    AttributeNotFound { handle: u16 },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to get BLE events: {0}")]
    EventStreamFailed(String),

    #[error("Packet too large: {size} bytes (max: {max_size})")]
    PacketTooLarge { size: usize, max_size: usize },

    #[error("Advertising failed: {0}")]
    AdvertisingFailed(String),

    #[error("Not supported by this backend: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("ATT error: {0}")]
    Att(#[from] AttError),

    #[error(transparent)]
    Gatt(#[from] GattError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Platform error: {0}")]
    Platform(String),
}

pub type Result<T> = std::result::Result<T, BleError>;

impl BleError {
    /// Controller-level classification of this error
    pub fn controller_error(&self) -> ControllerError {
        match self {
            BleError::AdapterNotAvailable => ControllerError::InvalidBluetoothAdapterError,
            BleError::DeviceNotFound { .. } => ControllerError::UnknownRemoteDeviceError,
            BleError::ConnectionFailed(_) | BleError::ConnectionTimeout | BleError::NotConnected => {
                ControllerError::ConnectionError
            }
            BleError::LinkClosed => ControllerError::RemoteHostClosedError,
            BleError::AdvertisingFailed(_) => ControllerError::AdvertisingError,
            BleError::Att(AttError::Response { code, .. }) if code.is_security_error() => {
                ControllerError::AuthorizationError
            }
            BleError::Att(_)
            | BleError::Io(_)
            | BleError::ServiceDiscoveryFailed(_)
            | BleError::PacketTooLarge { .. }
            | BleError::SubscriptionFailed(_) => ControllerError::NetworkError,
            _ => ControllerError::UnknownError,
        }
    }

    /// Service-level classification of this error for a failed operation whose
    /// generic failure is `operation_error`
    pub fn service_error(&self, operation_error: ServiceError) -> ServiceError {
        match self {
            BleError::Unsupported(_) | BleError::NotConnected => ServiceError::OperationError,
            _ => operation_error,
        }
    }
}

impl From<btleplug::Error> for BleError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => BleError::DeviceNotFound {
                address: "unknown".to_string(),
            },
            btleplug::Error::NotConnected => BleError::NotConnected,
            btleplug::Error::TimedOut(_) => BleError::ConnectionTimeout,
            btleplug::Error::NotSupported(what) => BleError::Unsupported(what),
            btleplug::Error::PermissionDenied => BleError::AdapterNotAvailable,
            other => BleError::Platform(other.to_string()),
        }
    }
}

#[cfg(target_os = "linux")]
impl From<bluer::Error> for BleError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::NotFound => BleError::AdapterNotAvailable,
            bluer::ErrorKind::NotReady => BleError::AdapterNotAvailable,
            _ => BleError::Platform(err.to_string()),
        }
    }
}
