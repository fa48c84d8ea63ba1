//! ATT protocol data units
//!
//! Encoding and decoding of the PDUs a GATT client and server exchange. All
//! multi-byte fields are little endian. UUIDs use the short 2-byte form whenever the
//! value is a SIG alias.

use uuid::Uuid;

use super::error::{AttError, AttErrorCode};
use crate::types::AttributeHandle;
use crate::uuids;

/// ATT opcodes
pub mod opcodes {
    pub const ERROR_RESPONSE: u8 = 0x01;
    pub const EXCHANGE_MTU_REQUEST: u8 = 0x02;
    pub const EXCHANGE_MTU_RESPONSE: u8 = 0x03;
    pub const FIND_INFORMATION_REQUEST: u8 = 0x04;
    pub const FIND_INFORMATION_RESPONSE: u8 = 0x05;
    pub const FIND_BY_TYPE_VALUE_REQUEST: u8 = 0x06;
    pub const FIND_BY_TYPE_VALUE_RESPONSE: u8 = 0x07;
    pub const READ_BY_TYPE_REQUEST: u8 = 0x08;
    pub const READ_BY_TYPE_RESPONSE: u8 = 0x09;
    pub const READ_REQUEST: u8 = 0x0A;
    pub const READ_RESPONSE: u8 = 0x0B;
    pub const READ_BLOB_REQUEST: u8 = 0x0C;
    pub const READ_BLOB_RESPONSE: u8 = 0x0D;
    pub const READ_BY_GROUP_TYPE_REQUEST: u8 = 0x10;
    pub const READ_BY_GROUP_TYPE_RESPONSE: u8 = 0x11;
    pub const WRITE_REQUEST: u8 = 0x12;
    pub const WRITE_RESPONSE: u8 = 0x13;
    pub const PREPARE_WRITE_REQUEST: u8 = 0x16;
    pub const PREPARE_WRITE_RESPONSE: u8 = 0x17;
    pub const EXECUTE_WRITE_REQUEST: u8 = 0x18;
    pub const EXECUTE_WRITE_RESPONSE: u8 = 0x19;
    pub const HANDLE_VALUE_NOTIFICATION: u8 = 0x1B;
    pub const HANDLE_VALUE_INDICATION: u8 = 0x1D;
    pub const HANDLE_VALUE_CONFIRMATION: u8 = 0x1E;
    pub const WRITE_COMMAND: u8 = 0x52;
    pub const SIGNED_WRITE_COMMAND: u8 = 0xD2;

    /// Bit 6 marks commands, which never get a response
    pub const COMMAND_FLAG: u8 = 0x40;
}

use opcodes::*;

/// Length of the authentication signature of a signed write
pub const SIGNATURE_LENGTH: usize = 12;

/// One decoded ATT PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttPdu {
    ErrorResponse {
        request_opcode: u8,
        handle: AttributeHandle,
        code: AttErrorCode,
    },
    ExchangeMtuRequest {
        mtu: u16,
    },
    ExchangeMtuResponse {
        mtu: u16,
    },
    FindInformationRequest {
        start: AttributeHandle,
        end: AttributeHandle,
    },
    FindInformationResponse {
        entries: Vec<(AttributeHandle, Uuid)>,
    },
    FindByTypeValueRequest {
        start: AttributeHandle,
        end: AttributeHandle,
        attribute_type: u16,
        value: Vec<u8>,
    },
    FindByTypeValueResponse {
        /// Found attribute handle and group end handle
        ranges: Vec<(AttributeHandle, AttributeHandle)>,
    },
    ReadByTypeRequest {
        start: AttributeHandle,
        end: AttributeHandle,
        attribute_type: Uuid,
    },
    ReadByTypeResponse {
        /// Every value has the same length
        entries: Vec<(AttributeHandle, Vec<u8>)>,
    },
    ReadRequest {
        handle: AttributeHandle,
    },
    ReadResponse {
        value: Vec<u8>,
    },
    ReadBlobRequest {
        handle: AttributeHandle,
        offset: u16,
    },
    ReadBlobResponse {
        value: Vec<u8>,
    },
    ReadByGroupTypeRequest {
        start: AttributeHandle,
        end: AttributeHandle,
        group_type: Uuid,
    },
    ReadByGroupTypeResponse {
        /// Group start, group end and value; every value has the same length
        entries: Vec<(AttributeHandle, AttributeHandle, Vec<u8>)>,
    },
    WriteRequest {
        handle: AttributeHandle,
        value: Vec<u8>,
    },
    WriteResponse,
    WriteCommand {
        handle: AttributeHandle,
        value: Vec<u8>,
    },
    SignedWriteCommand {
        handle: AttributeHandle,
        value: Vec<u8>,
        signature: [u8; SIGNATURE_LENGTH],
    },
    PrepareWriteRequest {
        handle: AttributeHandle,
        offset: u16,
        value: Vec<u8>,
    },
    PrepareWriteResponse {
        handle: AttributeHandle,
        offset: u16,
        value: Vec<u8>,
    },
    ExecuteWriteRequest {
        /// `false` cancels all prepared writes
        commit: bool,
    },
    ExecuteWriteResponse,
    HandleValueNotification {
        handle: AttributeHandle,
        value: Vec<u8>,
    },
    HandleValueIndication {
        handle: AttributeHandle,
        value: Vec<u8>,
    },
    HandleValueConfirmation,
}

impl AttPdu {
    pub fn opcode(&self) -> u8 {
        match self {
            AttPdu::ErrorResponse { .. } => ERROR_RESPONSE,
            AttPdu::ExchangeMtuRequest { .. } => EXCHANGE_MTU_REQUEST,
            AttPdu::ExchangeMtuResponse { .. } => EXCHANGE_MTU_RESPONSE,
            AttPdu::FindInformationRequest { .. } => FIND_INFORMATION_REQUEST,
            AttPdu::FindInformationResponse { .. } => FIND_INFORMATION_RESPONSE,
            AttPdu::FindByTypeValueRequest { .. } => FIND_BY_TYPE_VALUE_REQUEST,
            AttPdu::FindByTypeValueResponse { .. } => FIND_BY_TYPE_VALUE_RESPONSE,
            AttPdu::ReadByTypeRequest { .. } => READ_BY_TYPE_REQUEST,
            AttPdu::ReadByTypeResponse { .. } => READ_BY_TYPE_RESPONSE,
            AttPdu::ReadRequest { .. } => READ_REQUEST,
            AttPdu::ReadResponse { .. } => READ_RESPONSE,
            AttPdu::ReadBlobRequest { .. } => READ_BLOB_REQUEST,
            AttPdu::ReadBlobResponse { .. } => READ_BLOB_RESPONSE,
            AttPdu::ReadByGroupTypeRequest { .. } => READ_BY_GROUP_TYPE_REQUEST,
            AttPdu::ReadByGroupTypeResponse { .. } => READ_BY_GROUP_TYPE_RESPONSE,
            AttPdu::WriteRequest { .. } => WRITE_REQUEST,
            AttPdu::WriteResponse => WRITE_RESPONSE,
            AttPdu::WriteCommand { .. } => WRITE_COMMAND,
            AttPdu::SignedWriteCommand { .. } => SIGNED_WRITE_COMMAND,
            AttPdu::PrepareWriteRequest { .. } => PREPARE_WRITE_REQUEST,
            AttPdu::PrepareWriteResponse { .. } => PREPARE_WRITE_RESPONSE,
            AttPdu::ExecuteWriteRequest { .. } => EXECUTE_WRITE_REQUEST,
            AttPdu::ExecuteWriteResponse => EXECUTE_WRITE_RESPONSE,
            AttPdu::HandleValueNotification { .. } => HANDLE_VALUE_NOTIFICATION,
            AttPdu::HandleValueIndication { .. } => HANDLE_VALUE_INDICATION,
            AttPdu::HandleValueConfirmation => HANDLE_VALUE_CONFIRMATION,
        }
    }

    /// Responses a client waits for after sending a request
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            AttPdu::ErrorResponse { .. }
                | AttPdu::ExchangeMtuResponse { .. }
                | AttPdu::FindInformationResponse { .. }
                | AttPdu::FindByTypeValueResponse { .. }
                | AttPdu::ReadByTypeResponse { .. }
                | AttPdu::ReadResponse { .. }
                | AttPdu::ReadBlobResponse { .. }
                | AttPdu::ReadByGroupTypeResponse { .. }
                | AttPdu::WriteResponse
                | AttPdu::PrepareWriteResponse { .. }
                | AttPdu::ExecuteWriteResponse
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        match self {
            AttPdu::ErrorResponse {
                request_opcode,
                handle,
                code,
            } => {
                out.push(*request_opcode);
                put_u16(&mut out, *handle);
                out.push(code.code());
            }
            AttPdu::ExchangeMtuRequest { mtu } | AttPdu::ExchangeMtuResponse { mtu } => put_u16(&mut out, *mtu),
            AttPdu::FindInformationRequest { start, end } => {
                put_u16(&mut out, *start);
                put_u16(&mut out, *end);
            }
            AttPdu::FindInformationResponse { entries } => {
                let short = entries.iter().all(|(_, uuid)| uuids::as_u16(uuid).is_some());
                out.push(if short { 0x01 } else { 0x02 });
                for (handle, uuid) in entries {
                    put_u16(&mut out, *handle);
                    if short {
                        out.extend_from_slice(&uuids::to_att_bytes(uuid));
                    } else {
                        out.extend_from_slice(&uuid.as_u128().to_le_bytes());
                    }
                }
            }
            AttPdu::FindByTypeValueRequest {
                start,
                end,
                attribute_type,
                value,
            } => {
                put_u16(&mut out, *start);
                put_u16(&mut out, *end);
                put_u16(&mut out, *attribute_type);
                out.extend_from_slice(value);
            }
            AttPdu::FindByTypeValueResponse { ranges } => {
                for (found, group_end) in ranges {
                    put_u16(&mut out, *found);
                    put_u16(&mut out, *group_end);
                }
            }
            AttPdu::ReadByTypeRequest {
                start,
                end,
                attribute_type: uuid,
            }
            | AttPdu::ReadByGroupTypeRequest {
                start,
                end,
                group_type: uuid,
            } => {
                put_u16(&mut out, *start);
                put_u16(&mut out, *end);
                out.extend_from_slice(&uuids::to_att_bytes(uuid));
            }
            AttPdu::ReadByTypeResponse { entries } => {
                let length = entries.first().map(|(_, v)| v.len() + 2).unwrap_or(2);
                out.push(length as u8);
                for (handle, value) in entries {
                    put_u16(&mut out, *handle);
                    out.extend_from_slice(value);
                }
            }
            AttPdu::ReadByGroupTypeResponse { entries } => {
                let length = entries.first().map(|(_, _, v)| v.len() + 4).unwrap_or(4);
                out.push(length as u8);
                for (start, end, value) in entries {
                    put_u16(&mut out, *start);
                    put_u16(&mut out, *end);
                    out.extend_from_slice(value);
                }
            }
            AttPdu::ReadRequest { handle } => put_u16(&mut out, *handle),
            AttPdu::ReadResponse { value } | AttPdu::ReadBlobResponse { value } => out.extend_from_slice(value),
            AttPdu::ReadBlobRequest { handle, offset } => {
                put_u16(&mut out, *handle);
                put_u16(&mut out, *offset);
            }
            AttPdu::WriteRequest { handle, value }
            | AttPdu::WriteCommand { handle, value }
            | AttPdu::HandleValueNotification { handle, value }
            | AttPdu::HandleValueIndication { handle, value } => {
                put_u16(&mut out, *handle);
                out.extend_from_slice(value);
            }
            AttPdu::SignedWriteCommand {
                handle,
                value,
                signature,
            } => {
                put_u16(&mut out, *handle);
                out.extend_from_slice(value);
                out.extend_from_slice(signature);
            }
            AttPdu::PrepareWriteRequest { handle, offset, value }
            | AttPdu::PrepareWriteResponse { handle, offset, value } => {
                put_u16(&mut out, *handle);
                put_u16(&mut out, *offset);
                out.extend_from_slice(value);
            }
            AttPdu::ExecuteWriteRequest { commit } => out.push(u8::from(*commit)),
            AttPdu::WriteResponse | AttPdu::ExecuteWriteResponse | AttPdu::HandleValueConfirmation => {}
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<AttPdu, AttError> {
        let (&opcode, body) = bytes.split_first().ok_or(AttError::Empty)?;
        let mut r = Reader { opcode, body };

        let pdu = match opcode {
            ERROR_RESPONSE => AttPdu::ErrorResponse {
                request_opcode: r.u8()?,
                handle: r.u16()?,
                code: AttErrorCode::from(r.u8()?),
            },
            EXCHANGE_MTU_REQUEST => AttPdu::ExchangeMtuRequest { mtu: r.u16()? },
            EXCHANGE_MTU_RESPONSE => AttPdu::ExchangeMtuResponse { mtu: r.u16()? },
            FIND_INFORMATION_REQUEST => AttPdu::FindInformationRequest {
                start: r.u16()?,
                end: r.u16()?,
            },
            FIND_INFORMATION_RESPONSE => {
                let uuid_length = match r.u8()? {
                    0x01 => 2,
                    0x02 => 16,
                    _ => return Err(r.malformed("unknown information format")),
                };
                let mut entries = Vec::new();
                while !r.is_empty() {
                    let handle = r.u16()?;
                    let uuid = r.uuid(uuid_length)?;
                    entries.push((handle, uuid));
                }
                if entries.is_empty() {
                    return Err(r.malformed("no information entries"));
                }
                AttPdu::FindInformationResponse { entries }
            }
            FIND_BY_TYPE_VALUE_REQUEST => AttPdu::FindByTypeValueRequest {
                start: r.u16()?,
                end: r.u16()?,
                attribute_type: r.u16()?,
                value: r.rest(),
            },
            FIND_BY_TYPE_VALUE_RESPONSE => {
                let mut ranges = Vec::new();
                while !r.is_empty() {
                    ranges.push((r.u16()?, r.u16()?));
                }
                if ranges.is_empty() {
                    return Err(r.malformed("no handle ranges"));
                }
                AttPdu::FindByTypeValueResponse { ranges }
            }
            READ_BY_TYPE_REQUEST => {
                let start = r.u16()?;
                let end = r.u16()?;
                let length = r.remaining();
                AttPdu::ReadByTypeRequest {
                    start,
                    end,
                    attribute_type: r.uuid(length)?,
                }
            }
            READ_BY_TYPE_RESPONSE => {
                let length = usize::from(r.u8()?);
                if length < 2 {
                    return Err(r.malformed("entry length below 2"));
                }
                let mut entries = Vec::new();
                while !r.is_empty() {
                    let handle = r.u16()?;
                    entries.push((handle, r.bytes(length - 2)?));
                }
                AttPdu::ReadByTypeResponse { entries }
            }
            READ_REQUEST => AttPdu::ReadRequest { handle: r.u16()? },
            READ_RESPONSE => AttPdu::ReadResponse { value: r.rest() },
            READ_BLOB_REQUEST => AttPdu::ReadBlobRequest {
                handle: r.u16()?,
                offset: r.u16()?,
            },
            READ_BLOB_RESPONSE => AttPdu::ReadBlobResponse { value: r.rest() },
            READ_BY_GROUP_TYPE_REQUEST => {
                let start = r.u16()?;
                let end = r.u16()?;
                let length = r.remaining();
                AttPdu::ReadByGroupTypeRequest {
                    start,
                    end,
                    group_type: r.uuid(length)?,
                }
            }
            READ_BY_GROUP_TYPE_RESPONSE => {
                let length = usize::from(r.u8()?);
                if length < 4 {
                    return Err(r.malformed("entry length below 4"));
                }
                let mut entries = Vec::new();
                while !r.is_empty() {
                    let start = r.u16()?;
                    let end = r.u16()?;
                    entries.push((start, end, r.bytes(length - 4)?));
                }
                AttPdu::ReadByGroupTypeResponse { entries }
            }
            WRITE_REQUEST => AttPdu::WriteRequest {
                handle: r.u16()?,
                value: r.rest(),
            },
            WRITE_RESPONSE => AttPdu::WriteResponse,
            WRITE_COMMAND => AttPdu::WriteCommand {
                handle: r.u16()?,
                value: r.rest(),
            },
            SIGNED_WRITE_COMMAND => {
                let handle = r.u16()?;
                let value_length = r
                    .remaining()
                    .checked_sub(SIGNATURE_LENGTH)
                    .ok_or_else(|| r.malformed("missing signature"))?;
                let value = r.bytes(value_length)?;
                let mut signature = [0u8; SIGNATURE_LENGTH];
                signature.copy_from_slice(&r.bytes(SIGNATURE_LENGTH)?);
                AttPdu::SignedWriteCommand {
                    handle,
                    value,
                    signature,
                }
            }
            PREPARE_WRITE_REQUEST => AttPdu::PrepareWriteRequest {
                handle: r.u16()?,
                offset: r.u16()?,
                value: r.rest(),
            },
            PREPARE_WRITE_RESPONSE => AttPdu::PrepareWriteResponse {
                handle: r.u16()?,
                offset: r.u16()?,
                value: r.rest(),
            },
            EXECUTE_WRITE_REQUEST => AttPdu::ExecuteWriteRequest {
                commit: match r.u8()? {
                    0x00 => false,
                    0x01 => true,
                    _ => return Err(r.malformed("invalid execute flags")),
                },
            },
            EXECUTE_WRITE_RESPONSE => AttPdu::ExecuteWriteResponse,
            HANDLE_VALUE_NOTIFICATION => AttPdu::HandleValueNotification {
                handle: r.u16()?,
                value: r.rest(),
            },
            HANDLE_VALUE_INDICATION => AttPdu::HandleValueIndication {
                handle: r.u16()?,
                value: r.rest(),
            },
            HANDLE_VALUE_CONFIRMATION => AttPdu::HandleValueConfirmation,
            other => return Err(AttError::UnknownOpcode(other)),
        };

        if !r.is_empty() {
            return Err(r.malformed("trailing bytes"));
        }
        Ok(pdu)
    }
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

struct Reader<'a> {
    opcode: u8,
    body: &'a [u8],
}

impl Reader<'_> {
    fn malformed(&self, reason: &'static str) -> AttError {
        AttError::Malformed {
            opcode: self.opcode,
            reason,
        }
    }

    fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    fn remaining(&self) -> usize {
        self.body.len()
    }

    fn bytes(&mut self, count: usize) -> Result<Vec<u8>, AttError> {
        if self.body.len() < count {
            return Err(self.malformed("truncated"));
        }
        let (head, tail) = self.body.split_at(count);
        self.body = tail;
        Ok(head.to_vec())
    }

    fn u8(&mut self) -> Result<u8, AttError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, AttError> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn uuid(&mut self, length: usize) -> Result<Uuid, AttError> {
        if length != 2 && length != 16 {
            return Err(self.malformed("invalid uuid length"));
        }
        let bytes = self.bytes(length)?;
        uuids::from_att_bytes(&bytes).ok_or_else(|| self.malformed("invalid uuid"))
    }

    fn rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_by_group_type_wire_format() {
        let request = AttPdu::ReadByGroupTypeRequest {
            start: 0x0001,
            end: 0xFFFF,
            group_type: uuids::PRIMARY_SERVICE,
        };
        assert_eq!(request.encode(), vec![0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]);

        let response = [0x11, 0x06, 0x01, 0x00, 0x05, 0x00, 0x0F, 0x18, 0x06, 0x00, 0x09, 0x00, 0x0D, 0x18];
        assert_eq!(
            AttPdu::decode(&response).unwrap(),
            AttPdu::ReadByGroupTypeResponse {
                entries: vec![(1, 5, vec![0x0F, 0x18]), (6, 9, vec![0x0D, 0x18])],
            }
        );
    }

    #[test]
    fn test_error_response_decoding() {
        let pdu = AttPdu::decode(&[0x01, 0x08, 0x20, 0x00, 0x0A]).unwrap();
        assert_eq!(
            pdu,
            AttPdu::ErrorResponse {
                request_opcode: READ_BY_TYPE_REQUEST,
                handle: 0x0020,
                code: AttErrorCode::AttributeNotFound,
            }
        );
        assert!(pdu.is_response());
    }

    #[test]
    fn test_find_information_formats() {
        let short = AttPdu::FindInformationResponse {
            entries: vec![(0x0014, uuids::CLIENT_CHARACTERISTIC_CONFIGURATION)],
        };
        assert_eq!(short.encode(), vec![0x05, 0x01, 0x14, 0x00, 0x02, 0x29]);

        let custom = Uuid::from_u128(0x4edb2f47_2c08_4c0f_9f63_6a8f2f2d2f5a);
        let long = AttPdu::FindInformationResponse {
            entries: vec![(0x0015, custom)],
        };
        let encoded = long.encode();
        assert_eq!(encoded[1], 0x02);
        assert_eq!(encoded.len(), 2 + 2 + 16);
        assert_eq!(AttPdu::decode(&encoded).unwrap(), long);
    }

    #[test]
    fn test_signed_write_splits_signature() {
        let mut bytes = vec![SIGNED_WRITE_COMMAND, 0x03, 0x00, 0xAA, 0xBB];
        bytes.extend_from_slice(&[0x11; SIGNATURE_LENGTH]);
        match AttPdu::decode(&bytes).unwrap() {
            AttPdu::SignedWriteCommand { handle, value, signature } => {
                assert_eq!(handle, 3);
                assert_eq!(value, vec![0xAA, 0xBB]);
                assert_eq!(signature, [0x11; SIGNATURE_LENGTH]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_input() {
        assert_eq!(AttPdu::decode(&[]), Err(AttError::Empty));
        assert_eq!(AttPdu::decode(&[0x7F]), Err(AttError::UnknownOpcode(0x7F)));
        assert!(matches!(AttPdu::decode(&[READ_REQUEST, 0x01]), Err(AttError::Malformed { .. })));
        assert!(matches!(
            AttPdu::decode(&[READ_BY_TYPE_REQUEST, 1, 0, 0xFF, 0xFF, 0x03, 0x28, 0x00]),
            Err(AttError::Malformed { .. })
        ));
        assert!(matches!(
            AttPdu::decode(&[EXECUTE_WRITE_REQUEST, 0x02]),
            Err(AttError::Malformed { .. })
        ));
    }

    #[test]
    fn test_commands_are_flagged() {
        assert_ne!(WRITE_COMMAND & COMMAND_FLAG, 0);
        assert_ne!(SIGNED_WRITE_COMMAND & COMMAND_FLAG, 0);
        assert_eq!(WRITE_REQUEST & COMMAND_FLAG, 0);
    }
}
