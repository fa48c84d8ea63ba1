//! Error types for the GATT controller
//!
//! [`ControllerError`] and [`ServiceError`] are the values a controller or service
//! reports to its users; they are plain enums with fixed descriptions. [`GattError`]
//! covers failures of the data model itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AttributeHandle, ControllerState, Role};

// ----------------------------------------------------------------------------
// Controller Errors
// ----------------------------------------------------------------------------

/// Last error a controller reported
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControllerError {
    #[default]
    #[error("No error")]
    NoError,

    #[error("Unknown error")]
    UnknownError,

    #[error("Remote device cannot be found")]
    UnknownRemoteDeviceError,

    #[error("Error occurred trying to read from or write to the remote device")]
    NetworkError,

    #[error("Cannot find local adapter")]
    InvalidBluetoothAdapterError,

    #[error("Error occurred trying to connect to remote device")]
    ConnectionError,

    #[error("Error occurred trying to start advertising")]
    AdvertisingError,

    #[error("Remote device closed the connection")]
    RemoteHostClosedError,

    #[error("Failed to authorize on the remote device")]
    AuthorizationError,
}

impl ControllerError {
    /// Human-readable description, empty for [`ControllerError::NoError`]
    pub fn error_string(&self) -> String {
        match self {
            ControllerError::NoError => String::new(),
            other => other.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Service Errors
// ----------------------------------------------------------------------------

/// Last error a service reported
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServiceError {
    #[default]
    #[error("No error")]
    NoError,

    /// The request is not allowed in the current state or targets a foreign attribute
    #[error("Operation not permitted in the current service state")]
    OperationError,

    #[error("Characteristic write failed")]
    CharacteristicWriteError,

    #[error("Descriptor write failed")]
    DescriptorWriteError,

    #[error("Unknown service error")]
    UnknownError,

    #[error("Characteristic read failed")]
    CharacteristicReadError,

    #[error("Descriptor read failed")]
    DescriptorReadError,
}

// ----------------------------------------------------------------------------
// Data Model Errors
// ----------------------------------------------------------------------------

/// Failures of the GATT data model and local service registration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Attribute handle space exhausted: {required} handles needed after 0x{last:04X}")]
    HandleSpaceExhausted { last: AttributeHandle, required: usize },

    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("Invalid local service definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("Included service {uuid} is not registered")]
    UnknownIncludedService { uuid: uuid::Uuid },

    #[error("Operation requires the {expected:?} role")]
    WrongRole { expected: Role },

    #[error("Operation not allowed in state {state}")]
    WrongState { state: ControllerState },

    #[error("Unknown attribute handle 0x{0:04X}")]
    UnknownHandle(AttributeHandle),
}

pub type Result<T> = core::result::Result<T, GattError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
