//! ATT error codes and codec errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AttributeHandle;

/// Error codes carried in an ATT Error Response (Core Vol 3 Part F §3.4.1.1)
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttErrorCode {
    #[error("Invalid handle")]
    InvalidHandle,
    #[error("Read not permitted")]
    ReadNotPermitted,
    #[error("Write not permitted")]
    WriteNotPermitted,
    #[error("Invalid PDU")]
    InvalidPdu,
    #[error("Insufficient authentication")]
    InsufficientAuthentication,
    #[error("Request not supported")]
    RequestNotSupported,
    #[error("Invalid offset")]
    InvalidOffset,
    #[error("Insufficient authorization")]
    InsufficientAuthorization,
    #[error("Prepare queue full")]
    PrepareQueueFull,
    #[error("Attribute not found")]
    AttributeNotFound,
    #[error("Attribute not long")]
    AttributeNotLong,
    #[error("Insufficient encryption key size")]
    InsufficientEncryptionKeySize,
    #[error("Invalid attribute value length")]
    InvalidAttributeValueLength,
    #[error("Unlikely error")]
    UnlikelyError,
    #[error("Insufficient encryption")]
    InsufficientEncryption,
    #[error("Unsupported group type")]
    UnsupportedGroupType,
    #[error("Insufficient resources")]
    InsufficientResources,
    #[error("Application error 0x{0:02X}")]
    Other(u8),
}

impl AttErrorCode {
    pub fn code(&self) -> u8 {
        match self {
            AttErrorCode::InvalidHandle => 0x01,
            AttErrorCode::ReadNotPermitted => 0x02,
            AttErrorCode::WriteNotPermitted => 0x03,
            AttErrorCode::InvalidPdu => 0x04,
            AttErrorCode::InsufficientAuthentication => 0x05,
            AttErrorCode::RequestNotSupported => 0x06,
            AttErrorCode::InvalidOffset => 0x07,
            AttErrorCode::InsufficientAuthorization => 0x08,
            AttErrorCode::PrepareQueueFull => 0x09,
            AttErrorCode::AttributeNotFound => 0x0A,
            AttErrorCode::AttributeNotLong => 0x0B,
            AttErrorCode::InsufficientEncryptionKeySize => 0x0C,
            AttErrorCode::InvalidAttributeValueLength => 0x0D,
            AttErrorCode::UnlikelyError => 0x0E,
            AttErrorCode::InsufficientEncryption => 0x0F,
            AttErrorCode::UnsupportedGroupType => 0x10,
            AttErrorCode::InsufficientResources => 0x11,
            AttErrorCode::Other(code) => *code,
        }
    }

    /// Security related failures; the link needs pairing before a retry
    pub fn is_security_error(&self) -> bool {
        matches!(
            self,
            AttErrorCode::InsufficientAuthentication
                | AttErrorCode::InsufficientAuthorization
                | AttErrorCode::InsufficientEncryption
                | AttErrorCode::InsufficientEncryptionKeySize
        )
    }
}

impl From<u8> for AttErrorCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => AttErrorCode::InvalidHandle,
            0x02 => AttErrorCode::ReadNotPermitted,
            0x03 => AttErrorCode::WriteNotPermitted,
            0x04 => AttErrorCode::InvalidPdu,
            0x05 => AttErrorCode::InsufficientAuthentication,
            0x06 => AttErrorCode::RequestNotSupported,
            0x07 => AttErrorCode::InvalidOffset,
            0x08 => AttErrorCode::InsufficientAuthorization,
            0x09 => AttErrorCode::PrepareQueueFull,
            0x0A => AttErrorCode::AttributeNotFound,
            0x0B => AttErrorCode::AttributeNotLong,
            0x0C => AttErrorCode::InsufficientEncryptionKeySize,
            0x0D => AttErrorCode::InvalidAttributeValueLength,
            0x0E => AttErrorCode::UnlikelyError,
            0x0F => AttErrorCode::InsufficientEncryption,
            0x10 => AttErrorCode::UnsupportedGroupType,
            0x11 => AttErrorCode::InsufficientResources,
            other => AttErrorCode::Other(other),
        }
    }
}

/// Failures while encoding, decoding or exchanging ATT PDUs
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttError {
    #[error("Empty ATT PDU")]
    Empty,

    #[error("Unknown ATT opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("Malformed ATT PDU 0x{opcode:02X}: {reason}")]
    Malformed { opcode: u8, reason: &'static str },

    #[error("Request 0x{request_opcode:02X} failed at handle 0x{handle:04X}: {code}")]
    Response {
        request_opcode: u8,
        handle: AttributeHandle,
        code: AttErrorCode,
    },

    #[error("Unexpected ATT PDU 0x{0:02X}")]
    UnexpectedPdu(u8),
}

impl AttError {
    /// Error code of an error response, if this is one
    pub fn code(&self) -> Option<AttErrorCode> {
        match self {
            AttError::Response { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        for code in 0x01..=0x11u8 {
            assert_eq!(AttErrorCode::from(code).code(), code);
        }
        assert_eq!(AttErrorCode::from(0x80), AttErrorCode::Other(0x80));
        assert!(AttErrorCode::InsufficientEncryption.is_security_error());
        assert!(!AttErrorCode::InvalidHandle.is_security_error());
    }
}
