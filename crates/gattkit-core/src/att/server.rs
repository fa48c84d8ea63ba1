//! ATT server for locally hosted services
//!
//! Answers client requests against the services a peripheral registered. The
//! server works on raw PDUs and shared service data only; the transport and the
//! controller events live in `gattkit-ble`.

use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{AttError, AttErrorCode};
use super::pdu::{opcodes, AttPdu};
use super::{DEFAULT_MTU, MAX_MTU};
use crate::gatt::{read_service, write_service, ClientConfiguration, SharedService};
use crate::local::MAX_ATTRIBUTE_VALUE_LENGTH;
use crate::types::{AttributeHandle, CharacteristicProperties, ServiceTypes};
use crate::uuids;

/// Prepared writes the server queues before an execute
pub const PREPARE_QUEUE_CAPACITY: usize = 64;

// ----------------------------------------------------------------------------
// Request Outcome
// ----------------------------------------------------------------------------

/// What handling one incoming PDU produced
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServerOutcome {
    /// PDU to send back, if the input was a request
    pub response: Option<AttPdu>,
    /// Attributes whose value a client changed, with the new value
    pub written: Vec<(AttributeHandle, Vec<u8>)>,
    /// Newly negotiated MTU
    pub mtu_changed: Option<u16>,
    /// The client confirmed an indication
    pub confirmed: bool,
}

impl ServerOutcome {
    fn respond(pdu: AttPdu) -> Self {
        Self {
            response: Some(pdu),
            ..Self::default()
        }
    }

    fn error(request_opcode: u8, handle: AttributeHandle, code: AttErrorCode) -> Self {
        debug!(
            "ATT request 0x{:02X} at 0x{:04X} rejected: {}",
            request_opcode, handle, code
        );
        Self::respond(AttPdu::ErrorResponse {
            request_opcode,
            handle,
            code,
        })
    }
}

// ----------------------------------------------------------------------------
// Attribute Database View
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Access {
    Declaration,
    Value {
        service: usize,
        characteristic: AttributeHandle,
        properties: CharacteristicProperties,
    },
    Descriptor {
        service: usize,
        characteristic: AttributeHandle,
        client_configuration: bool,
    },
}

#[derive(Debug, Clone)]
struct Attribute {
    handle: AttributeHandle,
    attribute_type: Uuid,
    value: Vec<u8>,
    /// Last handle of the group a service declaration opens
    group_end: Option<AttributeHandle>,
    access: Access,
}

impl Attribute {
    fn readable(&self) -> bool {
        match self.access {
            Access::Value { properties, .. } => properties.contains(CharacteristicProperties::READ),
            Access::Declaration | Access::Descriptor { .. } => true,
        }
    }

    fn writable(&self, with_response: bool) -> bool {
        match self.access {
            Access::Value { properties, .. } if with_response => properties.contains(CharacteristicProperties::WRITE),
            Access::Value { properties, .. } => properties.contains(CharacteristicProperties::WRITE_NO_RESPONSE),
            Access::Descriptor {
                client_configuration, ..
            } => client_configuration,
            Access::Declaration => false,
        }
    }

    /// Checks the length rules for a complete new value
    fn validate_value(&self, value: &[u8]) -> Result<(), AttErrorCode> {
        let cccd = matches!(
            self.access,
            Access::Descriptor {
                client_configuration: true,
                ..
            }
        );
        if (cccd && value.len() != 2) || value.len() > MAX_ATTRIBUTE_VALUE_LENGTH {
            return Err(AttErrorCode::InvalidAttributeValueLength);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct PreparedWrite {
    handle: AttributeHandle,
    offset: u16,
    value: Vec<u8>,
}

// ----------------------------------------------------------------------------
// ATT Server
// ----------------------------------------------------------------------------

/// Serves local services to one connected client
#[derive(Debug)]
pub struct AttServer {
    services: Vec<SharedService>,
    server_mtu: u16,
    mtu: u16,
    prepare_queue: Vec<PreparedWrite>,
    awaiting_confirmation: bool,
}

impl Default for AttServer {
    fn default() -> Self {
        Self::new(MAX_MTU)
    }
}

impl AttServer {
    /// Creates a server that offers `server_mtu` during MTU exchange
    pub fn new(server_mtu: u16) -> Self {
        Self {
            services: Vec::new(),
            server_mtu: server_mtu.clamp(DEFAULT_MTU, MAX_MTU),
            mtu: DEFAULT_MTU,
            prepare_queue: Vec::new(),
            awaiting_confirmation: false,
        }
    }

    /// Publishes a service; services are kept in handle order
    pub fn add_service(&mut self, service: SharedService) {
        let start = read_service(&service).start_handle;
        let position = self
            .services
            .iter()
            .position(|s| read_service(s).start_handle > start)
            .unwrap_or(self.services.len());
        self.services.insert(position, service);
    }

    pub fn services(&self) -> &[SharedService] {
        &self.services
    }

    /// MTU currently in effect on the link
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Forgets everything tied to the current client: MTU, prepared writes, pending
    /// indications and client characteristic configurations.
    pub fn reset(&mut self) {
        self.mtu = DEFAULT_MTU;
        self.prepare_queue.clear();
        self.awaiting_confirmation = false;
        for service in &self.services {
            let mut data = write_service(service);
            for characteristic in data.characteristic_list.values_mut() {
                for descriptor in characteristic.descriptor_list.values_mut() {
                    if descriptor.is_client_configuration() {
                        descriptor.value = ClientConfiguration::empty().to_value();
                    }
                }
            }
        }
    }

    fn service_range(&self, uuid: &Uuid) -> Option<(AttributeHandle, AttributeHandle)> {
        self.services.iter().find_map(|service| {
            let data = read_service(service);
            (data.uuid == *uuid).then_some((data.start_handle, data.end_handle))
        })
    }

    fn attributes(&self) -> Vec<Attribute> {
        let mut attributes = Vec::new();
        for (index, service) in self.services.iter().enumerate() {
            let data = read_service(service);
            attributes.push(Attribute {
                handle: data.start_handle,
                attribute_type: if data.service_type.contains(ServiceTypes::PRIMARY_SERVICE) {
                    uuids::PRIMARY_SERVICE
                } else {
                    uuids::SECONDARY_SERVICE
                },
                value: uuids::to_att_bytes(&data.uuid),
                group_end: Some(data.end_handle),
                access: Access::Declaration,
            });

            for (offset, included) in data.included_services.iter().enumerate() {
                let Some((start, end)) = self.service_range(included) else {
                    continue;
                };
                let mut value = Vec::with_capacity(6);
                value.extend_from_slice(&start.to_le_bytes());
                value.extend_from_slice(&end.to_le_bytes());
                if let Some(short) = uuids::as_u16(included) {
                    value.extend_from_slice(&short.to_le_bytes());
                }
                attributes.push(Attribute {
                    handle: data.start_handle + 1 + offset as AttributeHandle,
                    attribute_type: uuids::INCLUDE,
                    value,
                    group_end: None,
                    access: Access::Declaration,
                });
            }

            for (&declaration, characteristic) in &data.characteristic_list {
                let mut value = vec![characteristic.properties.bits()];
                value.extend_from_slice(&characteristic.value_handle.to_le_bytes());
                value.extend_from_slice(&uuids::to_att_bytes(&characteristic.uuid));
                attributes.push(Attribute {
                    handle: declaration,
                    attribute_type: uuids::CHARACTERISTIC,
                    value,
                    group_end: None,
                    access: Access::Declaration,
                });
                attributes.push(Attribute {
                    handle: characteristic.value_handle,
                    attribute_type: characteristic.uuid,
                    value: characteristic.value.clone(),
                    group_end: None,
                    access: Access::Value {
                        service: index,
                        characteristic: declaration,
                        properties: characteristic.properties,
                    },
                });
                for (&handle, descriptor) in &characteristic.descriptor_list {
                    attributes.push(Attribute {
                        handle,
                        attribute_type: descriptor.uuid,
                        value: descriptor.value.clone(),
                        group_end: None,
                        access: Access::Descriptor {
                            service: index,
                            characteristic: declaration,
                            client_configuration: descriptor.is_client_configuration(),
                        },
                    });
                }
            }
        }
        attributes
    }

    fn attribute(&self, handle: AttributeHandle) -> Option<Attribute> {
        self.attributes().into_iter().find(|a| a.handle == handle)
    }

    fn store(&self, attribute: &Attribute, value: &[u8]) {
        match attribute.access {
            Access::Value {
                service, characteristic, ..
            } => {
                if let Some(service) = self.services.get(service) {
                    crate::registry::update_characteristic_value(service, characteristic, value, false);
                }
            }
            Access::Descriptor {
                service, characteristic, ..
            } => {
                if let Some(service) = self.services.get(service) {
                    crate::registry::update_descriptor_value(service, characteristic, attribute.handle, value, false);
                }
            }
            Access::Declaration => {}
        }
    }

    // ------------------------------------------------------------------------
    // Request Dispatch
    // ------------------------------------------------------------------------

    /// Handles one PDU received from the client
    pub fn handle_pdu(&mut self, bytes: &[u8]) -> ServerOutcome {
        let pdu = match AttPdu::decode(bytes) {
            Ok(pdu) => pdu,
            Err(AttError::UnknownOpcode(opcode)) if opcode & opcodes::COMMAND_FLAG == 0 => {
                return ServerOutcome::error(opcode, 0x0000, AttErrorCode::RequestNotSupported);
            }
            Err(AttError::Malformed { opcode, reason }) if opcode & opcodes::COMMAND_FLAG == 0 => {
                warn!("Malformed ATT request 0x{:02X}: {}", opcode, reason);
                return ServerOutcome::error(opcode, 0x0000, AttErrorCode::InvalidPdu);
            }
            Err(e) => {
                debug!("Dropping ATT PDU: {}", e);
                return ServerOutcome::default();
            }
        };

        match pdu {
            AttPdu::ExchangeMtuRequest { mtu } => {
                self.mtu = mtu.clamp(DEFAULT_MTU, self.server_mtu);
                debug!("ATT MTU negotiated to {}", self.mtu);
                ServerOutcome {
                    response: Some(AttPdu::ExchangeMtuResponse { mtu: self.server_mtu }),
                    mtu_changed: Some(self.mtu),
                    ..ServerOutcome::default()
                }
            }
            AttPdu::ReadByGroupTypeRequest { start, end, group_type } => self.read_by_group_type(start, end, group_type),
            AttPdu::FindByTypeValueRequest {
                start,
                end,
                attribute_type,
                value,
            } => self.find_by_type_value(start, end, attribute_type, &value),
            AttPdu::ReadByTypeRequest {
                start,
                end,
                attribute_type,
            } => self.read_by_type(start, end, attribute_type),
            AttPdu::FindInformationRequest { start, end } => self.find_information(start, end),
            AttPdu::ReadRequest { handle } => self.read(opcodes::READ_REQUEST, handle, 0),
            AttPdu::ReadBlobRequest { handle, offset } => self.read(opcodes::READ_BLOB_REQUEST, handle, offset),
            AttPdu::WriteRequest { handle, value } => self.write(handle, value, true),
            AttPdu::WriteCommand { handle, value } => self.write(handle, value, false),
            AttPdu::SignedWriteCommand { handle, .. } => {
                warn!("Ignoring signed write to 0x{:04X}, signing is not supported", handle);
                ServerOutcome::default()
            }
            AttPdu::PrepareWriteRequest { handle, offset, value } => self.prepare_write(handle, offset, value),
            AttPdu::ExecuteWriteRequest { commit } => self.execute_write(commit),
            AttPdu::HandleValueConfirmation => {
                self.awaiting_confirmation = false;
                ServerOutcome {
                    confirmed: true,
                    ..ServerOutcome::default()
                }
            }
            other => {
                debug!("Ignoring unexpected PDU 0x{:02X} from client", other.opcode());
                ServerOutcome::default()
            }
        }
    }

    fn check_range(request_opcode: u8, start: AttributeHandle, end: AttributeHandle) -> Option<ServerOutcome> {
        (start == 0 || start > end).then(|| ServerOutcome::error(request_opcode, start, AttErrorCode::InvalidHandle))
    }

    fn read_by_group_type(&self, start: AttributeHandle, end: AttributeHandle, group_type: Uuid) -> ServerOutcome {
        let opcode = opcodes::READ_BY_GROUP_TYPE_REQUEST;
        if let Some(outcome) = Self::check_range(opcode, start, end) {
            return outcome;
        }
        if group_type != uuids::PRIMARY_SERVICE && group_type != uuids::SECONDARY_SERVICE {
            return ServerOutcome::error(opcode, start, AttErrorCode::UnsupportedGroupType);
        }

        let max_value = usize::from(self.mtu - 6).min(251);
        let mut entries: Vec<(AttributeHandle, AttributeHandle, Vec<u8>)> = Vec::new();
        let mut used = 2;
        for attribute in self.attributes() {
            if attribute.handle < start || attribute.handle > end || attribute.attribute_type != group_type {
                continue;
            }
            let mut value = attribute.value;
            value.truncate(max_value);
            if let Some((_, _, first)) = entries.first() {
                if first.len() != value.len() {
                    break;
                }
            }
            if used + 4 + value.len() > usize::from(self.mtu) {
                break;
            }
            used += 4 + value.len();
            let group_end = attribute.group_end.unwrap_or(attribute.handle);
            entries.push((attribute.handle, group_end, value));
        }

        if entries.is_empty() {
            return ServerOutcome::error(opcode, start, AttErrorCode::AttributeNotFound);
        }
        ServerOutcome::respond(AttPdu::ReadByGroupTypeResponse { entries })
    }

    fn find_by_type_value(
        &self,
        start: AttributeHandle,
        end: AttributeHandle,
        attribute_type: u16,
        value: &[u8],
    ) -> ServerOutcome {
        let opcode = opcodes::FIND_BY_TYPE_VALUE_REQUEST;
        if let Some(outcome) = Self::check_range(opcode, start, end) {
            return outcome;
        }

        let attribute_type = uuids::from_u16(attribute_type);
        let capacity = (usize::from(self.mtu) - 1) / 4;
        let ranges: Vec<_> = self
            .attributes()
            .into_iter()
            .filter(|a| a.handle >= start && a.handle <= end)
            .filter(|a| a.attribute_type == attribute_type && a.value == value)
            .map(|a| (a.handle, a.group_end.unwrap_or(a.handle)))
            .take(capacity)
            .collect();

        if ranges.is_empty() {
            return ServerOutcome::error(opcode, start, AttErrorCode::AttributeNotFound);
        }
        ServerOutcome::respond(AttPdu::FindByTypeValueResponse { ranges })
    }

    fn read_by_type(&self, start: AttributeHandle, end: AttributeHandle, attribute_type: Uuid) -> ServerOutcome {
        let opcode = opcodes::READ_BY_TYPE_REQUEST;
        if let Some(outcome) = Self::check_range(opcode, start, end) {
            return outcome;
        }

        let max_value = usize::from(self.mtu - 4).min(253);
        let mut entries: Vec<(AttributeHandle, Vec<u8>)> = Vec::new();
        let mut used = 2;
        for attribute in self.attributes() {
            if attribute.handle < start || attribute.handle > end || attribute.attribute_type != attribute_type {
                continue;
            }
            if !attribute.readable() {
                if entries.is_empty() {
                    return ServerOutcome::error(opcode, attribute.handle, AttErrorCode::ReadNotPermitted);
                }
                break;
            }
            let mut value = attribute.value;
            value.truncate(max_value);
            if let Some((_, first)) = entries.first() {
                if first.len() != value.len() {
                    break;
                }
            }
            if used + 2 + value.len() > usize::from(self.mtu) {
                break;
            }
            used += 2 + value.len();
            entries.push((attribute.handle, value));
        }

        if entries.is_empty() {
            return ServerOutcome::error(opcode, start, AttErrorCode::AttributeNotFound);
        }
        ServerOutcome::respond(AttPdu::ReadByTypeResponse { entries })
    }

    fn find_information(&self, start: AttributeHandle, end: AttributeHandle) -> ServerOutcome {
        let opcode = opcodes::FIND_INFORMATION_REQUEST;
        if let Some(outcome) = Self::check_range(opcode, start, end) {
            return outcome;
        }

        let mut entries: Vec<(AttributeHandle, Uuid)> = Vec::new();
        let mut short_format = None;
        let mut used = 2;
        for attribute in self.attributes() {
            if attribute.handle < start || attribute.handle > end {
                continue;
            }
            let short = uuids::as_u16(&attribute.attribute_type).is_some();
            if *short_format.get_or_insert(short) != short {
                break;
            }
            let size = 2 + if short { 2 } else { 16 };
            if used + size > usize::from(self.mtu) {
                break;
            }
            used += size;
            entries.push((attribute.handle, attribute.attribute_type));
        }

        if entries.is_empty() {
            return ServerOutcome::error(opcode, start, AttErrorCode::AttributeNotFound);
        }
        ServerOutcome::respond(AttPdu::FindInformationResponse { entries })
    }

    fn read(&self, opcode: u8, handle: AttributeHandle, offset: u16) -> ServerOutcome {
        let Some(attribute) = self.attribute(handle) else {
            return ServerOutcome::error(opcode, handle, AttErrorCode::InvalidHandle);
        };
        if !attribute.readable() {
            return ServerOutcome::error(opcode, handle, AttErrorCode::ReadNotPermitted);
        }
        let offset = usize::from(offset);
        if offset > attribute.value.len() {
            return ServerOutcome::error(opcode, handle, AttErrorCode::InvalidOffset);
        }

        let mut value = attribute.value[offset..].to_vec();
        value.truncate(usize::from(self.mtu) - 1);
        if opcode == opcodes::READ_REQUEST {
            ServerOutcome::respond(AttPdu::ReadResponse { value })
        } else {
            ServerOutcome::respond(AttPdu::ReadBlobResponse { value })
        }
    }

    fn write(&mut self, handle: AttributeHandle, value: Vec<u8>, with_response: bool) -> ServerOutcome {
        let opcode = opcodes::WRITE_REQUEST;
        let rejected = |code: AttErrorCode| {
            if with_response {
                ServerOutcome::error(opcode, handle, code)
            } else {
                debug!("Dropping write command to 0x{:04X}: {}", handle, code);
                ServerOutcome::default()
            }
        };

        let Some(attribute) = self.attribute(handle) else {
            return rejected(AttErrorCode::InvalidHandle);
        };
        if !attribute.writable(with_response) {
            return rejected(AttErrorCode::WriteNotPermitted);
        }
        if let Err(code) = attribute.validate_value(&value) {
            return rejected(code);
        }

        self.store(&attribute, &value);
        debug!("Client wrote 0x{:04X} = {}", handle, hex::encode(&value));
        ServerOutcome {
            response: with_response.then_some(AttPdu::WriteResponse),
            written: vec![(handle, value)],
            ..ServerOutcome::default()
        }
    }

    fn prepare_write(&mut self, handle: AttributeHandle, offset: u16, value: Vec<u8>) -> ServerOutcome {
        let opcode = opcodes::PREPARE_WRITE_REQUEST;
        let Some(attribute) = self.attribute(handle) else {
            return ServerOutcome::error(opcode, handle, AttErrorCode::InvalidHandle);
        };
        if !attribute.writable(true) {
            return ServerOutcome::error(opcode, handle, AttErrorCode::WriteNotPermitted);
        }
        if self.prepare_queue.len() >= PREPARE_QUEUE_CAPACITY {
            return ServerOutcome::error(opcode, handle, AttErrorCode::PrepareQueueFull);
        }

        self.prepare_queue.push(PreparedWrite {
            handle,
            offset,
            value: value.clone(),
        });
        ServerOutcome::respond(AttPdu::PrepareWriteResponse { handle, offset, value })
    }

    /// Applies the queued writes. Chunks for one handle are applied in order, each one
    /// replacing everything from its offset on, so a sequence of chunks starting at
    /// offset 0 yields exactly their concatenation.
    fn execute_write(&mut self, commit: bool) -> ServerOutcome {
        let opcode = opcodes::EXECUTE_WRITE_REQUEST;
        let queue = std::mem::take(&mut self.prepare_queue);
        if !commit {
            return ServerOutcome::respond(AttPdu::ExecuteWriteResponse);
        }

        let mut pending: Vec<(Attribute, Vec<u8>)> = Vec::new();
        for write in queue {
            let index = match pending.iter().position(|(a, _)| a.handle == write.handle) {
                Some(index) => index,
                None => match self.attribute(write.handle) {
                    Some(attribute) => {
                        let current = attribute.value.clone();
                        pending.push((attribute, current));
                        pending.len() - 1
                    }
                    None => return ServerOutcome::error(opcode, write.handle, AttErrorCode::InvalidHandle),
                },
            };
            let buffer = &mut pending[index].1;
            let offset = usize::from(write.offset);
            if offset > buffer.len() {
                return ServerOutcome::error(opcode, write.handle, AttErrorCode::InvalidOffset);
            }
            buffer.truncate(offset);
            buffer.extend_from_slice(&write.value);
        }

        for (attribute, value) in &pending {
            if let Err(code) = attribute.validate_value(value) {
                return ServerOutcome::error(opcode, attribute.handle, code);
            }
        }

        let mut written = Vec::with_capacity(pending.len());
        for (attribute, value) in pending {
            self.store(&attribute, &value);
            written.push((attribute.handle, value));
        }
        ServerOutcome {
            response: Some(AttPdu::ExecuteWriteResponse),
            written,
            ..ServerOutcome::default()
        }
    }

    // ------------------------------------------------------------------------
    // Server Initiated Updates
    // ------------------------------------------------------------------------

    /// Builds the notification or indication for the current value of the
    /// characteristic declared at `characteristic_handle`, honouring the client's
    /// configuration. Indications wait for the confirmation of the previous one.
    pub fn value_update(&mut self, characteristic_handle: AttributeHandle) -> Option<AttPdu> {
        let (value_handle, mut value, configuration, properties) = self.services.iter().find_map(|service| {
            let data = read_service(service);
            data.characteristic_list.get(&characteristic_handle).map(|c| {
                (c.value_handle, c.value.clone(), c.client_configuration(), c.properties)
            })
        })?;
        value.truncate(usize::from(self.mtu) - 3);

        if configuration.contains(ClientConfiguration::NOTIFICATION) && properties.contains(CharacteristicProperties::NOTIFY)
        {
            return Some(AttPdu::HandleValueNotification {
                handle: value_handle,
                value,
            });
        }
        if configuration.contains(ClientConfiguration::INDICATION) && properties.contains(CharacteristicProperties::INDICATE)
        {
            if self.awaiting_confirmation {
                debug!("Indication for 0x{:04X} dropped, previous one unconfirmed", value_handle);
                return None;
            }
            self.awaiting_confirmation = true;
            return Some(AttPdu::HandleValueIndication {
                handle: value_handle,
                value,
            });
        }
        None
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
