//! GATT client over a raw ATT bearer
//!
//! [`AttClient`] runs the GATT procedures (MTU exchange, discovery, long reads and
//! writes) on top of an [`AttLink`]; [`AttBackend`] turns it into a central
//! [`GattBackend`] for any [`AttConnector`].

use std::collections::BTreeMap;
use std::time::Duration;

use gattkit_core::att::{opcodes, AttError, AttErrorCode, AttPdu, DEFAULT_MTU};
use gattkit_core::{
    uuids, AddressType, AttributeHandle, BluetoothAddress, CharacteristicData, CharacteristicProperties,
    ConnectionParameters, ControllerError, DescriptorData, DiscoveryMode, Role, WriteMode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::link::{AttConnector, AttLink, LinkGuard};
use super::{BackendEvent, ConnectionInfo, DiscoveredService, GattBackend, ServiceDetails};
use crate::config::ControllerConfig;
use crate::error::{BleError, Result};

// ----------------------------------------------------------------------------
// ATT Client
// ----------------------------------------------------------------------------

/// One characteristic declaration as found by characteristic discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Declaration {
    handle: AttributeHandle,
    properties: CharacteristicProperties,
    value_handle: AttributeHandle,
    uuid: Uuid,
}

fn is_error_code(error: &BleError, expected: AttErrorCode) -> bool {
    matches!(error, BleError::Att(AttError::Response { code, .. }) if *code == expected)
}

fn unexpected(pdu: &AttPdu) -> BleError {
    BleError::Att(AttError::UnexpectedPdu(pdu.opcode()))
}

/// Client side of one ATT bearer, one outstanding request at a time
///
/// A transaction that times out retires the bearer: later requests fail with
/// [`BleError::NotConnected`] and the link is reported lost.
pub struct AttClient {
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    responses: mpsc::Receiver<AttPdu>,
    mtu: u16,
    request_timeout: Duration,
    events: mpsc::UnboundedSender<BackendEvent>,
    reader: JoinHandle<()>,
    guard: Option<LinkGuard>,
}

impl AttClient {
    /// Take over `link`; server initiated PDUs are reported on `events`
    pub fn new(link: AttLink, request_timeout: Duration, events: mpsc::UnboundedSender<BackendEvent>) -> Self {
        let (responses_tx, responses) = mpsc::channel(8);
        let reader = tokio::spawn(read_loop(link.incoming, responses_tx, link.outgoing.clone(), events.clone()));
        Self {
            outgoing: Some(link.outgoing),
            responses,
            mtu: DEFAULT_MTU,
            request_timeout,
            events,
            reader,
            guard: Some(link.guard),
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Send a request and wait for its response. Error responses become
    /// [`AttError::Response`].
    pub async fn request(&mut self, pdu: AttPdu) -> Result<AttPdu> {
        self.send(&pdu).await?;

        let response = match timeout(self.request_timeout, self.responses.recv()).await {
            Ok(response) => response.ok_or(BleError::LinkClosed)?,
            Err(_) => {
                self.expire(pdu.opcode());
                return Err(BleError::ConnectionTimeout);
            }
        };

        match response {
            AttPdu::ErrorResponse {
                request_opcode,
                handle,
                code,
            } => Err(AttError::Response {
                request_opcode,
                handle,
                code,
            }
            .into()),
            other => Ok(other),
        }
    }

    /// Send a command; no response follows
    pub async fn command(&mut self, pdu: AttPdu) -> Result<()> {
        self.send(&pdu).await
    }

    /// False once a transaction timed out
    pub fn is_open(&self) -> bool {
        self.outgoing.is_some()
    }

    async fn send(&mut self, pdu: &AttPdu) -> Result<()> {
        let outgoing = self.outgoing.as_ref().ok_or(BleError::NotConnected)?;
        let bytes = pdu.encode();
        trace!("ATT -> {}", hex::encode(&bytes));
        outgoing.send(bytes).await.map_err(|_| BleError::NotConnected)
    }

    /// Close the bearer after a transaction timeout; a late response must never
    /// be matched to a later request
    fn expire(&mut self, opcode: u8) {
        warn!("ATT request 0x{:02X} timed out, closing bearer", opcode);
        self.reader.abort();
        self.outgoing = None;
        self.guard = None;
        self.responses.close();
        let _ = self.events.send(BackendEvent::LinkLost(ControllerError::ConnectionError));
    }

    /// Negotiate the MTU, starting from `preferred`
    pub async fn exchange_mtu(&mut self, preferred: u16) -> Result<u16> {
        match self.request(AttPdu::ExchangeMtuRequest { mtu: preferred }).await {
            Ok(AttPdu::ExchangeMtuResponse { mtu }) => {
                self.mtu = preferred.min(mtu).max(DEFAULT_MTU);
            }
            Ok(other) => return Err(unexpected(&other)),
            Err(e) if is_error_code(&e, AttErrorCode::RequestNotSupported) => {
                self.mtu = DEFAULT_MTU;
            }
            Err(e) => return Err(e),
        }
        debug!("ATT MTU is {}", self.mtu);
        Ok(self.mtu)
    }

    // ------------------------------------------------------------------------
    // Discovery Procedures
    // ------------------------------------------------------------------------

    /// Discover all primary services
    pub async fn discover_primary_services(&mut self) -> Result<Vec<DiscoveredService>> {
        let mut services = Vec::new();
        let mut start: AttributeHandle = 0x0001;

        loop {
            let request = AttPdu::ReadByGroupTypeRequest {
                start,
                end: 0xFFFF,
                group_type: uuids::PRIMARY_SERVICE,
            };
            let entries = match self.request(request).await {
                Ok(AttPdu::ReadByGroupTypeResponse { entries }) => entries,
                Ok(other) => return Err(unexpected(&other)),
                Err(e) if is_error_code(&e, AttErrorCode::AttributeNotFound) => break,
                Err(e) => return Err(e),
            };

            let Some(last_end) = entries.last().map(|(_, end, _)| *end) else {
                break;
            };
            for (start_handle, end_handle, value) in entries {
                match uuids::from_att_bytes(&value) {
                    Some(uuid) => services.push(DiscoveredService {
                        uuid,
                        start_handle,
                        end_handle,
                    }),
                    None => debug!("Skipping service at 0x{:04X} with malformed UUID", start_handle),
                }
            }
            if last_end == 0xFFFF || last_end < start {
                break;
            }
            start = last_end + 1;
        }

        Ok(services)
    }

    async fn read_by_type(
        &mut self,
        start: AttributeHandle,
        end: AttributeHandle,
        attribute_type: Uuid,
    ) -> Result<Vec<(AttributeHandle, Vec<u8>)>> {
        let mut found = Vec::new();
        let mut cursor = start;

        while cursor <= end {
            let request = AttPdu::ReadByTypeRequest {
                start: cursor,
                end,
                attribute_type,
            };
            let entries = match self.request(request).await {
                Ok(AttPdu::ReadByTypeResponse { entries }) => entries,
                Ok(other) => return Err(unexpected(&other)),
                Err(e) if is_error_code(&e, AttErrorCode::AttributeNotFound) => break,
                Err(e) => return Err(e),
            };
            let Some(last) = entries.last().map(|(handle, _)| *handle) else {
                break;
            };
            found.extend(entries);
            if last >= end || last < cursor {
                break;
            }
            cursor = last + 1;
        }

        Ok(found)
    }

    /// Find the services `service` includes
    pub async fn discover_included_services(&mut self, service: &DiscoveredService) -> Result<Vec<DiscoveredService>> {
        let mut included = Vec::new();

        for (handle, value) in self
            .read_by_type(service.start_handle, service.end_handle, uuids::INCLUDE)
            .await?
        {
            if value.len() < 4 {
                debug!("Skipping malformed include at 0x{:04X}", handle);
                continue;
            }
            let start_handle = u16::from_le_bytes([value[0], value[1]]);
            let end_handle = u16::from_le_bytes([value[2], value[3]]);
            // 128-bit UUIDs are not carried in the declaration
            let uuid = if value.len() > 4 {
                uuids::from_att_bytes(&value[4..])
            } else {
                let declaration = self.read_long(start_handle).await?;
                uuids::from_att_bytes(&declaration)
            };
            match uuid {
                Some(uuid) => included.push(DiscoveredService {
                    uuid,
                    start_handle,
                    end_handle,
                }),
                None => debug!("Skipping include at 0x{:04X} with malformed UUID", handle),
            }
        }

        Ok(included)
    }

    async fn discover_characteristics(&mut self, service: &DiscoveredService) -> Result<Vec<Declaration>> {
        let mut declarations = Vec::new();

        for (handle, value) in self
            .read_by_type(service.start_handle, service.end_handle, uuids::CHARACTERISTIC)
            .await?
        {
            if value.len() < 5 {
                debug!("Skipping malformed characteristic declaration at 0x{:04X}", handle);
                continue;
            }
            let Some(uuid) = uuids::from_att_bytes(&value[3..]) else {
                debug!("Skipping characteristic at 0x{:04X} with malformed UUID", handle);
                continue;
            };
            declarations.push(Declaration {
                handle,
                properties: CharacteristicProperties::from_bits_truncate(value[0]),
                value_handle: u16::from_le_bytes([value[1], value[2]]),
                uuid,
            });
        }

        Ok(declarations)
    }

    async fn discover_descriptors(
        &mut self,
        value_handle: AttributeHandle,
        end: AttributeHandle,
    ) -> Result<Vec<(AttributeHandle, Uuid)>> {
        let mut descriptors = Vec::new();
        if value_handle >= end {
            return Ok(descriptors);
        }
        let mut cursor = value_handle + 1;

        loop {
            let entries = match self.request(AttPdu::FindInformationRequest { start: cursor, end }).await {
                Ok(AttPdu::FindInformationResponse { entries }) => entries,
                Ok(other) => return Err(unexpected(&other)),
                Err(e) if is_error_code(&e, AttErrorCode::AttributeNotFound) => break,
                Err(e) => return Err(e),
            };
            let Some(last) = entries.last().map(|(handle, _)| *handle) else {
                break;
            };
            descriptors.extend(entries);
            if last >= end || last < cursor {
                break;
            }
            cursor = last + 1;
        }

        Ok(descriptors)
    }

    // ------------------------------------------------------------------------
    // Value Procedures
    // ------------------------------------------------------------------------

    /// Read a value of any length with Read followed by Read Blob requests
    pub async fn read_long(&mut self, handle: AttributeHandle) -> Result<Vec<u8>> {
        let mut value = match self.request(AttPdu::ReadRequest { handle }).await? {
            AttPdu::ReadResponse { value } => value,
            other => return Err(unexpected(&other)),
        };
        let chunk = usize::from(self.mtu) - 1;
        if value.len() < chunk {
            return Ok(value);
        }

        loop {
            let Ok(offset) = u16::try_from(value.len()) else {
                break;
            };
            match self.request(AttPdu::ReadBlobRequest { handle, offset }).await {
                Ok(AttPdu::ReadBlobResponse { value: part }) => {
                    let received = part.len();
                    value.extend(part);
                    if received < chunk {
                        break;
                    }
                }
                Ok(other) => return Err(unexpected(&other)),
                Err(e)
                    if is_error_code(&e, AttErrorCode::AttributeNotLong)
                        || is_error_code(&e, AttErrorCode::InvalidOffset) =>
                {
                    break
                }
                Err(e) => return Err(e),
            }
        }

        Ok(value)
    }

    /// Write with response; values that do not fit one PDU use prepared writes
    pub async fn write(&mut self, handle: AttributeHandle, value: &[u8]) -> Result<()> {
        let single = usize::from(self.mtu) - 3;
        if value.len() <= single {
            return match self
                .request(AttPdu::WriteRequest {
                    handle,
                    value: value.to_vec(),
                })
                .await?
            {
                AttPdu::WriteResponse => Ok(()),
                other => Err(unexpected(&other)),
            };
        }

        let chunk = usize::from(self.mtu) - 5;
        for (index, part) in value.chunks(chunk).enumerate() {
            let offset = u16::try_from(index * chunk).map_err(|_| BleError::PacketTooLarge {
                size: value.len(),
                max_size: usize::from(u16::MAX),
            })?;
            let request = AttPdu::PrepareWriteRequest {
                handle,
                offset,
                value: part.to_vec(),
            };
            match self.request(request).await {
                Ok(AttPdu::PrepareWriteResponse {
                    handle: echoed_handle,
                    offset: echoed_offset,
                    value: echoed,
                }) if echoed_handle == handle && echoed_offset == offset && echoed == part => {}
                Ok(_) => {
                    self.cancel_prepared_writes().await;
                    return Err(BleError::Att(AttError::Malformed {
                        opcode: opcodes::PREPARE_WRITE_RESPONSE,
                        reason: "prepared value not echoed",
                    }));
                }
                Err(e) => {
                    self.cancel_prepared_writes().await;
                    return Err(e);
                }
            }
        }

        match self.request(AttPdu::ExecuteWriteRequest { commit: true }).await? {
            AttPdu::ExecuteWriteResponse => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn cancel_prepared_writes(&mut self) {
        if let Err(e) = self.request(AttPdu::ExecuteWriteRequest { commit: false }).await {
            debug!("Cancelling prepared writes failed: {}", e);
        }
    }

    /// Write without response; must fit one PDU
    pub async fn write_command(&mut self, handle: AttributeHandle, value: &[u8]) -> Result<()> {
        let max_size = usize::from(self.mtu) - 3;
        if value.len() > max_size {
            return Err(BleError::PacketTooLarge {
                size: value.len(),
                max_size,
            });
        }
        self.command(AttPdu::WriteCommand {
            handle,
            value: value.to_vec(),
        })
        .await
    }
}

impl Drop for AttClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Routes everything the server sends: responses to the pending request,
/// notifications and indications to the event stream
async fn read_loop(
    mut incoming: mpsc::Receiver<Vec<u8>>,
    responses: mpsc::Sender<AttPdu>,
    outgoing: mpsc::Sender<Vec<u8>>,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    while let Some(bytes) = incoming.recv().await {
        trace!("ATT <- {}", hex::encode(&bytes));
        let pdu = match AttPdu::decode(&bytes) {
            Ok(pdu) => pdu,
            Err(e) => {
                debug!("Dropping PDU from server: {}", e);
                continue;
            }
        };

        match pdu {
            pdu if pdu.is_response() => {
                if responses.send(pdu).await.is_err() {
                    return;
                }
            }
            AttPdu::HandleValueNotification { handle, value } => {
                let _ = events.send(BackendEvent::ValueChanged {
                    handle,
                    value,
                    indication: false,
                });
            }
            AttPdu::HandleValueIndication { handle, value } => {
                let _ = outgoing.send(AttPdu::HandleValueConfirmation.encode()).await;
                let _ = events.send(BackendEvent::ValueChanged {
                    handle,
                    value,
                    indication: true,
                });
            }
            other if other.opcode() & opcodes::COMMAND_FLAG == 0 => {
                // No local attribute database on the client side
                let reply = AttPdu::ErrorResponse {
                    request_opcode: other.opcode(),
                    handle: 0x0000,
                    code: AttErrorCode::RequestNotSupported,
                };
                let _ = outgoing.send(reply.encode()).await;
            }
            other => debug!("Ignoring PDU 0x{:02X} from server", other.opcode()),
        }
    }

    debug!("ATT link closed by remote");
    let _ = events.send(BackendEvent::LinkLost(ControllerError::RemoteHostClosedError));
}

// ----------------------------------------------------------------------------
// Central Backend
// ----------------------------------------------------------------------------

/// Central backend that runs GATT itself over links from an [`AttConnector`]
pub struct AttBackend<C> {
    connector: C,
    config: ControllerConfig,
    client: Option<AttClient>,
    remote: Option<BluetoothAddress>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<BackendEvent>>,
}

impl<C: AttConnector> AttBackend<C> {
    pub fn new(connector: C, config: ControllerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            config,
            client: None,
            remote: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    fn client_mut(&mut self) -> Result<&mut AttClient> {
        self.client.as_mut().ok_or(BleError::NotConnected)
    }
}

#[async_trait::async_trait]
impl<C: AttConnector> GattBackend for AttBackend<C> {
    fn role(&self) -> Role {
        Role::Central
    }

    async fn connect(&mut self, remote: BluetoothAddress, address_type: AddressType) -> Result<ConnectionInfo> {
        let link = self.connector.connect(remote, address_type).await?;
        let local_address = link.local_address;
        let mut client = AttClient::new(link, self.config.request_timeout, self.events_tx.clone());
        let mtu = client.exchange_mtu(self.config.preferred_mtu).await?;

        info!("ATT link to {} up, MTU {}", remote, mtu);
        self.client = Some(client);
        self.remote = Some(remote);
        Ok(ConnectionInfo { local_address, mtu })
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            drop(client);
            debug!("ATT link to {:?} closed", self.remote);
        }
        self.remote = None;
        Ok(())
    }

    async fn discover_services(&mut self) -> Result<Vec<DiscoveredService>> {
        self.client_mut()?.discover_primary_services().await
    }

    async fn discover_service_details(
        &mut self,
        service: &DiscoveredService,
        mode: DiscoveryMode,
    ) -> Result<ServiceDetails> {
        let client = self.client_mut()?;
        let included_services = client.discover_included_services(service).await?;
        let declarations = client.discover_characteristics(service).await?;

        let mut characteristics = BTreeMap::new();
        for (index, declaration) in declarations.iter().enumerate() {
            let end = declarations
                .get(index + 1)
                .map(|next| next.handle.saturating_sub(1))
                .unwrap_or(service.end_handle);

            let mut data = CharacteristicData::new(declaration.uuid, declaration.properties, declaration.value_handle);
            for (handle, uuid) in client.discover_descriptors(declaration.value_handle, end).await? {
                data.descriptor_list.insert(handle, DescriptorData::new(uuid, Vec::new()));
            }

            if mode == DiscoveryMode::FullDiscovery {
                if data.properties.contains(CharacteristicProperties::READ) {
                    match client.read_long(data.value_handle).await {
                        Ok(value) => data.value = value,
                        Err(e) => debug!("Reading characteristic 0x{:04X} failed: {}", data.value_handle, e),
                    }
                }
                for (handle, descriptor) in data.descriptor_list.iter_mut() {
                    match client.read_long(*handle).await {
                        Ok(value) => descriptor.value = value,
                        Err(e) => debug!("Reading descriptor 0x{:04X} failed: {}", handle, e),
                    }
                }
            }

            characteristics.insert(declaration.handle, data);
        }

        Ok(ServiceDetails {
            included_services,
            characteristics,
        })
    }

    async fn read_characteristic(&mut self, value_handle: AttributeHandle) -> Result<Vec<u8>> {
        self.client_mut()?.read_long(value_handle).await
    }

    async fn write_characteristic(&mut self, value_handle: AttributeHandle, value: &[u8], mode: WriteMode) -> Result<()> {
        let client = self.client_mut()?;
        match mode {
            WriteMode::WithResponse => client.write(value_handle, value).await,
            WriteMode::WithoutResponse => client.write_command(value_handle, value).await,
            WriteMode::Signed => Err(BleError::Unsupported("signed writes".to_string())),
        }
    }

    async fn read_descriptor(&mut self, handle: AttributeHandle) -> Result<Vec<u8>> {
        self.client_mut()?.read_long(handle).await
    }

    async fn write_descriptor(&mut self, handle: AttributeHandle, value: &[u8]) -> Result<()> {
        self.client_mut()?.write(handle, value).await
    }

    async fn request_connection_update(&mut self, params: &ConnectionParameters) -> Result<()> {
        let remote = self.remote.ok_or(BleError::NotConnected)?;
        self.connector.update_connection(remote, params).await?;
        let _ = self.events_tx.send(BackendEvent::ConnectionUpdated(*params));
        Ok(())
    }

    fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<BackendEvent>> {
        self.events_rx.take()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::loopback::{loopback_link, LoopbackConnector, LOOPBACK_PERIPHERAL_ADDRESS};
    use crate::backend::AttListener;
    use gattkit_core::att::{AttServer, MAX_MTU};
    use gattkit_core::{
        HandleAllocator, LocalCharacteristicDefinition, LocalServiceDefinition, ServiceRegistry,
    };
    use tokio_test::{assert_err, assert_ok};

    /// Battery service at 0x0001-0x0004 (level value 0x0003, CCCD 0x0004) and device
    /// information at 0x0005-0x0007 with a 100 byte writable manufacturer name at 0x0007
    fn start_server() -> LoopbackConnector {
        let (connector, mut listener) = loopback_link();
        let mut allocator = HandleAllocator::new();
        let mut registry = ServiceRegistry::new();
        let mut server = AttServer::new(MAX_MTU);

        let definitions = [
            LocalServiceDefinition::primary(uuids::BATTERY_SERVICE).with_characteristic(
                LocalCharacteristicDefinition::new(
                    uuids::BATTERY_LEVEL,
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                )
                .with_value(vec![80]),
            ),
            LocalServiceDefinition::primary(uuids::DEVICE_INFORMATION).with_characteristic(
                LocalCharacteristicDefinition::new(
                    uuids::MANUFACTURER_NAME_STRING,
                    CharacteristicProperties::READ | CharacteristicProperties::WRITE,
                )
                .with_value(vec![b'x'; 100]),
            ),
        ];
        for definition in &definitions {
            let data = allocator.allocate(definition, &registry).unwrap();
            server.add_service(registry.insert(data));
        }

        tokio::spawn(async move {
            let mut link = listener.accept().await.unwrap();
            while let Some(bytes) = link.incoming.recv().await {
                if let Some(response) = server.handle_pdu(&bytes).response {
                    if link.outgoing.send(response.encode()).await.is_err() {
                        break;
                    }
                }
            }
        });
        connector
    }

    async fn connected_backend(preferred_mtu: u16) -> AttBackend<LoopbackConnector> {
        let config = ControllerConfig::default().with_preferred_mtu(preferred_mtu);
        let mut backend = AttBackend::new(start_server(), config);
        let info = backend
            .connect(LOOPBACK_PERIPHERAL_ADDRESS, AddressType::Public)
            .await
            .unwrap();
        assert_eq!(info.mtu, preferred_mtu);
        backend
    }

    #[tokio::test]
    async fn test_discovers_services_and_details() {
        let mut backend = connected_backend(185).await;

        let services = backend.discover_services().await.unwrap();
        assert_eq!(
            services,
            vec![
                DiscoveredService {
                    uuid: uuids::BATTERY_SERVICE,
                    start_handle: 1,
                    end_handle: 4
                },
                DiscoveredService {
                    uuid: uuids::DEVICE_INFORMATION,
                    start_handle: 5,
                    end_handle: 7
                },
            ]
        );

        let details = backend
            .discover_service_details(&services[0], DiscoveryMode::FullDiscovery)
            .await
            .unwrap();
        assert!(details.included_services.is_empty());
        let level = &details.characteristics[&2];
        assert_eq!(level.uuid, uuids::BATTERY_LEVEL);
        assert_eq!(level.value_handle, 3);
        assert_eq!(level.value, vec![80]);
        assert_eq!(
            level.descriptor_list.get(&4),
            Some(&DescriptorData::new(uuids::CLIENT_CHARACTERISTIC_CONFIGURATION, vec![0, 0]))
        );

        let skipped = backend
            .discover_service_details(&services[0], DiscoveryMode::SkipValueDiscovery)
            .await
            .unwrap();
        assert!(skipped.characteristics[&2].value.is_empty());
    }

    #[tokio::test]
    async fn test_long_read_and_write_at_minimum_mtu() {
        let mut backend = connected_backend(DEFAULT_MTU).await;

        let value = assert_ok!(backend.read_characteristic(7).await);
        assert_eq!(value, vec![b'x'; 100]);

        let replacement: Vec<u8> = (0..60).collect();
        assert_ok!(backend.write_characteristic(7, &replacement, WriteMode::WithResponse).await);
        assert_eq!(assert_ok!(backend.read_characteristic(7).await), replacement);
    }

    #[tokio::test]
    async fn test_write_errors() {
        let mut backend = connected_backend(DEFAULT_MTU).await;

        let result = backend
            .write_characteristic(7, &[0u8; 40], WriteMode::WithoutResponse)
            .await;
        assert!(matches!(result, Err(BleError::PacketTooLarge { size: 40, max_size: 20 })));

        let result = backend.write_characteristic(7, &[1], WriteMode::Signed).await;
        assert!(matches!(result, Err(BleError::Unsupported(_))));

        // battery level has no write property
        let result = backend.write_characteristic(3, &[1], WriteMode::WithResponse).await;
        match result {
            Err(BleError::Att(AttError::Response { code, .. })) => assert_eq!(code, AttErrorCode::WriteNotPermitted),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    /// Answers the first read only after `delay`, every later read at once
    fn start_slow_server(delay: Duration) -> LoopbackConnector {
        let (connector, mut listener) = loopback_link();
        tokio::spawn(async move {
            let mut link = listener.accept().await.unwrap();
            let mut reads = 0;
            while let Some(bytes) = link.incoming.recv().await {
                let reply = match AttPdu::decode(&bytes).unwrap() {
                    AttPdu::ExchangeMtuRequest { .. } => AttPdu::ExchangeMtuResponse { mtu: DEFAULT_MTU },
                    AttPdu::ReadRequest { .. } => {
                        reads += 1;
                        if reads == 1 {
                            tokio::time::sleep(delay).await;
                            AttPdu::ReadResponse { value: vec![0xAA] }
                        } else {
                            AttPdu::ReadResponse { value: vec![0xBB] }
                        }
                    }
                    other => AttPdu::ErrorResponse {
                        request_opcode: other.opcode(),
                        handle: 0x0000,
                        code: AttErrorCode::RequestNotSupported,
                    },
                };
                if link.outgoing.send(reply.encode()).await.is_err() {
                    break;
                }
            }
        });
        connector
    }

    #[tokio::test]
    async fn test_timed_out_bearer_is_retired() {
        let config = ControllerConfig::default()
            .with_preferred_mtu(DEFAULT_MTU)
            .with_request_timeout(Duration::from_millis(100));
        let mut backend = AttBackend::new(start_slow_server(Duration::from_millis(300)), config);
        let mut events = backend.take_event_receiver().unwrap();
        backend
            .connect(LOOPBACK_PERIPHERAL_ADDRESS, AddressType::Public)
            .await
            .unwrap();

        let error = assert_err!(backend.read_characteristic(3).await);
        assert!(matches!(error, BleError::ConnectionTimeout));
        assert!(matches!(
            events.recv().await,
            Some(BackendEvent::LinkLost(ControllerError::ConnectionError))
        ));
        assert!(!backend.client.as_ref().unwrap().is_open());

        // the late 0xAA answer must not be taken as the value of another handle
        tokio::time::sleep(Duration::from_millis(300)).await;
        let error = assert_err!(backend.read_characteristic(7).await);
        assert!(matches!(error, BleError::NotConnected));

        assert_ok!(backend.disconnect().await);
        assert!(backend.client.is_none());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut backend = AttBackend::new(start_server(), ControllerConfig::default());
        assert!(matches!(backend.discover_services().await, Err(BleError::NotConnected)));
        assert!(backend.take_event_receiver().is_some());
        assert!(backend.take_event_receiver().is_none());
    }
}
