//! Error handling for the gattkit CLI

use gattkit_ble::BleError;
use gattkit_core::{ControllerError, GattError, ServiceError};
use thiserror::Error;

use crate::config::ConfigError;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("BLE error: {0}")]
    Ble(#[from] BleError),

    #[error("GATT error: {0}")]
    Gatt(#[from] GattError),

    #[error("Controller error: {0}")]
    Controller(ControllerError),

    #[error("Service error: {0}")]
    Service(ServiceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Feature not available: {0}")]
    FeatureNotAvailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
