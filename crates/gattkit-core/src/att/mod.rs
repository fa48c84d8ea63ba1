//! Attribute protocol: PDU codec and the server side used by local services

pub mod error;
pub mod pdu;
pub mod server;

pub use error::{AttError, AttErrorCode};
pub use pdu::{opcodes, AttPdu};
pub use server::{AttServer, ServerOutcome, PREPARE_QUEUE_CAPACITY};

/// MTU every LE link starts with
pub const DEFAULT_MTU: u16 = 23;

/// Largest MTU that can carry a full 512 byte attribute value
pub const MAX_MTU: u16 = 517;
