//! End-to-end controller tests over the in-process loopback link
//!
//! A peripheral controller hosts a battery service and a device information
//! service, a central controller connects to it and drives the client side.

use std::time::Duration;

use gattkit_ble::advertising::FallbackAdvertiser;
use gattkit_ble::backend::loopback::{LOOPBACK_CENTRAL_ADDRESS, LOOPBACK_PERIPHERAL_ADDRESS};
use gattkit_ble::backend::{loopback_link, AttBackend, AttPeripheralBackend};
use gattkit_ble::{
    AdvertisingData, AdvertisingParameters, ControllerConfig, ControllerEvent, GattService, LowEnergyController,
    ServiceEvent,
};
use gattkit_core::att::{AttErrorCode, AttPdu};
use gattkit_core::{
    uuids, BluetoothAddress, CharacteristicProperties, ControllerError, ControllerState, DiscoveryMode,
    LocalCharacteristicDefinition, LocalServiceDefinition, ServiceError, ServiceState, ServiceTypes, WriteMode,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn wait_for<T, F>(events: &mut broadcast::Receiver<T>, matches: F) -> T
where
    T: Clone + std::fmt::Debug,
    F: Fn(&T) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn manufacturer_name() -> Vec<u8> {
    (0..100u8).collect()
}

fn battery_definition() -> LocalServiceDefinition {
    LocalServiceDefinition::primary(uuids::BATTERY_SERVICE).with_characteristic(
        LocalCharacteristicDefinition::new(
            uuids::BATTERY_LEVEL,
            CharacteristicProperties::READ | CharacteristicProperties::WRITE | CharacteristicProperties::NOTIFY,
        )
        .with_value(vec![42]),
    )
}

fn device_information_definition() -> LocalServiceDefinition {
    LocalServiceDefinition::primary(uuids::DEVICE_INFORMATION)
        .with_included_service(uuids::BATTERY_SERVICE)
        .with_characteristic(
            LocalCharacteristicDefinition::new(
                uuids::MANUFACTURER_NAME_STRING,
                CharacteristicProperties::READ | CharacteristicProperties::WRITE,
            )
            .with_value(manufacturer_name()),
        )
        .with_characteristic(
            LocalCharacteristicDefinition::new(uuids::APPEARANCE, CharacteristicProperties::WRITE)
                .with_value(vec![0, 0]),
        )
}

struct Fixture {
    central: LowEnergyController,
    central_events: broadcast::Receiver<ControllerEvent>,
    peripheral: LowEnergyController,
    peripheral_events: broadcast::Receiver<ControllerEvent>,
    local_battery: GattService,
}

fn advertise(peripheral: &LowEnergyController) {
    peripheral.start_advertising(
        AdvertisingParameters::default(),
        AdvertisingData::new()
            .with_local_name("gattkit-test")
            .with_service(uuids::BATTERY_SERVICE),
        AdvertisingData::new(),
    );
}

/// Connects a central to a freshly advertising peripheral. The central uses
/// the default MTU so long values need blob reads and prepared writes.
async fn connected_pair() -> Fixture {
    connected_pair_with(ControllerConfig::default().with_preferred_mtu(23)).await
}

async fn connected_pair_with(config: ControllerConfig) -> Fixture {
    let (connector, listener) = loopback_link();

    let peripheral = LowEnergyController::with_backend(
        BluetoothAddress::ANY,
        Box::new(AttPeripheralBackend::new(listener, FallbackAdvertiser::new())),
        ControllerConfig::default(),
    )
    .unwrap();
    let local_battery = peripheral.add_service(&battery_definition()).unwrap();
    peripheral.add_service(&device_information_definition()).unwrap();
    let mut peripheral_events = peripheral.subscribe();
    advertise(&peripheral);

    let central = LowEnergyController::with_backend(
        LOOPBACK_PERIPHERAL_ADDRESS,
        Box::new(AttBackend::new(connector, config.clone())),
        config,
    )
    .unwrap();
    let mut central_events = central.subscribe();
    central.connect_to_device();

    wait_for(&mut central_events, |e| *e == ControllerEvent::Connected).await;
    wait_for(&mut peripheral_events, |e| *e == ControllerEvent::Connected).await;

    Fixture {
        central,
        central_events,
        peripheral,
        peripheral_events,
        local_battery,
    }
}

async fn discover(fixture: &mut Fixture) {
    fixture.central.discover_services();
    wait_for(&mut fixture.central_events, |e| *e == ControllerEvent::DiscoveryFinished).await;
}

async fn discovered_service(fixture: &mut Fixture, uuid: uuid::Uuid) -> GattService {
    let service = fixture.central.create_service_object(&uuid).unwrap();
    let mut events = service.subscribe();
    service.discover_details(DiscoveryMode::FullDiscovery);
    wait_for(&mut events, |e| {
        *e == ServiceEvent::StateChanged(ServiceState::RemoteServiceDiscovered)
    })
    .await;
    service
}

#[tokio::test]
async fn test_connect_and_discover_services() {
    let mut fixture = connected_pair().await;
    assert_eq!(fixture.central.state(), ControllerState::Connected);
    assert_eq!(fixture.central.local_address(), LOOPBACK_CENTRAL_ADDRESS);
    assert_eq!(fixture.peripheral.state(), ControllerState::Connected);
    assert_eq!(fixture.peripheral.remote_address(), LOOPBACK_CENTRAL_ADDRESS);
    assert_eq!(fixture.central.mtu(), 23);

    discover(&mut fixture).await;
    assert_eq!(fixture.central.state(), ControllerState::Discovered);
    assert_eq!(
        fixture.central.services(),
        vec![uuids::BATTERY_SERVICE, uuids::DEVICE_INFORMATION]
    );

    let audit: Vec<_> = fixture.central.audit_log().iter().map(|entry| entry.to_state).collect();
    assert_eq!(
        audit,
        vec![
            ControllerState::Connecting,
            ControllerState::Connected,
            ControllerState::Discovering,
            ControllerState::Discovered,
        ]
    );
}

#[tokio::test]
async fn test_detail_discovery_reads_values() {
    let mut fixture = connected_pair().await;
    discover(&mut fixture).await;

    let battery = discovered_service(&mut fixture, uuids::BATTERY_SERVICE).await;
    assert_eq!(battery.handle_range(), (1, 4));
    let level = battery.characteristic(&uuids::BATTERY_LEVEL).unwrap();
    assert_eq!(level.handle(), 2);
    assert_eq!(level.value_handle(), Some(3));
    assert_eq!(level.value(), vec![42]);
    let cccd = level.client_configuration().unwrap();
    assert_eq!(cccd.handle(), 4);
    assert_eq!(cccd.value(), vec![0, 0]);

    let info = discovered_service(&mut fixture, uuids::DEVICE_INFORMATION).await;
    assert_eq!(info.included_services(), vec![uuids::BATTERY_SERVICE]);
    assert!(battery.service_type().contains(ServiceTypes::INCLUDED_SERVICE));
    // read past the first blob
    let name = info.characteristic(&uuids::MANUFACTURER_NAME_STRING).unwrap();
    assert_eq!(name.value(), manufacturer_name());
    // not readable, so discovery leaves it empty
    let appearance = info.characteristic(&uuids::APPEARANCE).unwrap();
    assert!(appearance.value().is_empty());
}

#[tokio::test]
async fn test_read_and_read_error() {
    let mut fixture = connected_pair().await;
    discover(&mut fixture).await;
    let info = discovered_service(&mut fixture, uuids::DEVICE_INFORMATION).await;
    let mut events = info.subscribe();

    let name = info.characteristic(&uuids::MANUFACTURER_NAME_STRING).unwrap();
    info.read_characteristic(&name);
    let read = wait_for(&mut events, |e| matches!(e, ServiceEvent::CharacteristicRead(..))).await;
    assert_eq!(read, ServiceEvent::CharacteristicRead(name.clone(), manufacturer_name()));

    let appearance = info.characteristic(&uuids::APPEARANCE).unwrap();
    info.read_characteristic(&appearance);
    wait_for(&mut events, |e| *e == ServiceEvent::Error(ServiceError::CharacteristicReadError)).await;
    assert_eq!(info.error(), ServiceError::CharacteristicReadError);
    // the controller itself stays healthy
    assert_eq!(fixture.central.error(), ControllerError::NoError);
}

#[tokio::test]
async fn test_central_writes_reach_peripheral() {
    let mut fixture = connected_pair().await;
    discover(&mut fixture).await;
    let battery = discovered_service(&mut fixture, uuids::BATTERY_SERVICE).await;
    let mut central_service_events = battery.subscribe();
    let mut local_events = fixture.local_battery.subscribe();

    let level = battery.characteristic(&uuids::BATTERY_LEVEL).unwrap();
    battery.write_characteristic(&level, vec![7], WriteMode::WithResponse);
    wait_for(&mut central_service_events, |e| {
        *e == ServiceEvent::CharacteristicWritten(level.clone(), vec![7])
    })
    .await;
    assert_eq!(level.value(), vec![7]);

    let changed = wait_for(&mut local_events, |e| matches!(e, ServiceEvent::CharacteristicChanged(..))).await;
    let local_level = fixture.local_battery.characteristic(&uuids::BATTERY_LEVEL).unwrap();
    assert_eq!(changed, ServiceEvent::CharacteristicChanged(local_level.clone(), vec![7]));
    assert_eq!(local_level.value(), vec![7]);
}

#[tokio::test]
async fn test_back_to_back_writes_are_not_coalesced() {
    let mut fixture = connected_pair().await;
    discover(&mut fixture).await;
    let battery = discovered_service(&mut fixture, uuids::BATTERY_SERVICE).await;
    let mut central_service_events = battery.subscribe();
    let mut local_events = fixture.local_battery.subscribe();

    let level = battery.characteristic(&uuids::BATTERY_LEVEL).unwrap();
    battery.write_characteristic(&level, vec![1], WriteMode::WithResponse);
    battery.write_characteristic(&level, vec![2], WriteMode::WithResponse);

    let is_written = |e: &ServiceEvent| matches!(e, ServiceEvent::CharacteristicWritten(..));
    assert_eq!(
        wait_for(&mut central_service_events, is_written).await,
        ServiceEvent::CharacteristicWritten(level.clone(), vec![1])
    );
    assert_eq!(
        wait_for(&mut central_service_events, is_written).await,
        ServiceEvent::CharacteristicWritten(level.clone(), vec![2])
    );

    let local_level = fixture.local_battery.characteristic(&uuids::BATTERY_LEVEL).unwrap();
    let is_changed = |e: &ServiceEvent| matches!(e, ServiceEvent::CharacteristicChanged(..));
    assert_eq!(
        wait_for(&mut local_events, is_changed).await,
        ServiceEvent::CharacteristicChanged(local_level.clone(), vec![1])
    );
    assert_eq!(
        wait_for(&mut local_events, is_changed).await,
        ServiceEvent::CharacteristicChanged(local_level.clone(), vec![2])
    );
    assert_eq!(local_level.value(), vec![2]);
    assert_eq!(level.value(), vec![2]);
}

#[tokio::test]
async fn test_default_discovery_mode_comes_from_config() {
    let config = ControllerConfig::default()
        .with_preferred_mtu(23)
        .with_discovery_mode(DiscoveryMode::SkipValueDiscovery);
    let mut fixture = connected_pair_with(config).await;
    discover(&mut fixture).await;

    let battery = fixture.central.create_service_object(&uuids::BATTERY_SERVICE).unwrap();
    let mut events = battery.subscribe();
    battery.discover_details_default();
    wait_for(&mut events, |e| {
        *e == ServiceEvent::StateChanged(ServiceState::RemoteServiceDiscovered)
    })
    .await;

    let level = battery.characteristic(&uuids::BATTERY_LEVEL).unwrap();
    assert_eq!(level.value_handle(), Some(3));
    assert!(level.value().is_empty());
}

/// Peripheral that completes MTU exchange and then fails primary service
/// discovery with an authentication error
fn start_refusing_peripheral() -> gattkit_ble::backend::LoopbackConnector {
    let (connector, mut listener) = loopback_link();
    tokio::spawn(async move {
        use gattkit_ble::backend::AttListener;

        let mut link = listener.accept().await.unwrap();
        while let Some(bytes) = link.incoming.recv().await {
            let reply = match AttPdu::decode(&bytes).unwrap() {
                AttPdu::ExchangeMtuRequest { .. } => AttPdu::ExchangeMtuResponse { mtu: 23 },
                AttPdu::ReadByGroupTypeRequest { start, .. } => AttPdu::ErrorResponse {
                    request_opcode: gattkit_core::att::opcodes::READ_BY_GROUP_TYPE_REQUEST,
                    handle: start,
                    code: AttErrorCode::InsufficientAuthentication,
                },
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
async fn test_failed_discovery_returns_to_connected() {
    let config = ControllerConfig::default().with_preferred_mtu(23);
    let central = LowEnergyController::with_backend(
        LOOPBACK_PERIPHERAL_ADDRESS,
        Box::new(AttBackend::new(start_refusing_peripheral(), config.clone())),
        config,
    )
    .unwrap();
    let mut events = central.subscribe();
    central.connect_to_device();
    wait_for(&mut events, |e| *e == ControllerEvent::Connected).await;

    central.discover_services();
    assert_eq!(central.state(), ControllerState::Discovering);
    let error = wait_for(&mut events, |e| matches!(e, ControllerEvent::ErrorOccurred(_))).await;
    assert_eq!(error, ControllerEvent::ErrorOccurred(ControllerError::AuthorizationError));
    assert_eq!(central.state(), ControllerState::Connected);
    assert!(central.services().is_empty());

    let audit: Vec<_> = central.audit_log().iter().map(|entry| entry.to_state).collect();
    assert_eq!(
        audit,
        vec![
            ControllerState::Connecting,
            ControllerState::Connected,
            ControllerState::Discovering,
            ControllerState::Connected,
        ]
    );
}

#[tokio::test]
async fn test_long_write_uses_prepared_writes() {
    let mut fixture = connected_pair().await;
    discover(&mut fixture).await;
    let info = discovered_service(&mut fixture, uuids::DEVICE_INFORMATION).await;
    let mut events = info.subscribe();

    let name = info.characteristic(&uuids::MANUFACTURER_NAME_STRING).unwrap();
    let long_value: Vec<u8> = (0..80u8).rev().collect();
    info.write_characteristic(&name, long_value.clone(), WriteMode::WithResponse);
    wait_for(&mut events, |e| matches!(e, ServiceEvent::CharacteristicWritten(..))).await;

    info.read_characteristic(&name);
    let read = wait_for(&mut events, |e| matches!(e, ServiceEvent::CharacteristicRead(..))).await;
    assert_eq!(read, ServiceEvent::CharacteristicRead(name, long_value));
}

#[tokio::test]
async fn test_notifications_after_enabling() {
    let mut fixture = connected_pair().await;
    discover(&mut fixture).await;
    let battery = discovered_service(&mut fixture, uuids::BATTERY_SERVICE).await;
    let mut central_service_events = battery.subscribe();
    let mut local_events = fixture.local_battery.subscribe();

    let level = battery.characteristic(&uuids::BATTERY_LEVEL).unwrap();
    battery.enable_notifications(&level, false);
    wait_for(&mut central_service_events, |e| matches!(e, ServiceEvent::DescriptorWritten(..))).await;
    let configured = wait_for(&mut local_events, |e| matches!(e, ServiceEvent::DescriptorWritten(..))).await;
    let ServiceEvent::DescriptorWritten(_, value) = configured else {
        unreachable!()
    };
    assert_eq!(value, vec![0x01, 0x00]);

    let local_level = fixture.local_battery.characteristic(&uuids::BATTERY_LEVEL).unwrap();
    fixture
        .local_battery
        .write_characteristic(&local_level, vec![99], WriteMode::WithResponse);

    let changed = wait_for(&mut central_service_events, |e| {
        matches!(e, ServiceEvent::CharacteristicChanged(..))
    })
    .await;
    assert_eq!(changed, ServiceEvent::CharacteristicChanged(level.clone(), vec![99]));
    assert_eq!(level.value(), vec![99]);
}

#[tokio::test]
async fn test_disconnect_invalidates_services() {
    let mut fixture = connected_pair().await;
    discover(&mut fixture).await;
    let battery = discovered_service(&mut fixture, uuids::BATTERY_SERVICE).await;
    let mut battery_events = battery.subscribe();
    let level = battery.characteristic(&uuids::BATTERY_LEVEL).unwrap();

    fixture.central.disconnect_from_device();
    wait_for(&mut fixture.central_events, |e| *e == ControllerEvent::Disconnected).await;
    assert_eq!(fixture.central.state(), ControllerState::Unconnected);
    assert_eq!(fixture.central.mtu(), 23);
    assert!(fixture.central.services().is_empty());
    assert_eq!(
        battery_events.recv().await.unwrap(),
        ServiceEvent::StateChanged(ServiceState::InvalidService)
    );

    // the peripheral sees the central leave
    wait_for(&mut fixture.peripheral_events, |e| *e == ControllerEvent::Disconnected).await;
    assert_eq!(fixture.peripheral.state(), ControllerState::Unconnected);
    assert_eq!(fixture.peripheral.error(), ControllerError::RemoteHostClosedError);

    battery.read_characteristic(&level);
    assert_eq!(battery.error(), ServiceError::OperationError);

    // a new connection yields new service objects, the old one stays invalid
    advertise(&fixture.peripheral);
    fixture.central.connect_to_device();
    wait_for(&mut fixture.central_events, |e| *e == ControllerEvent::Connected).await;
    discover(&mut fixture).await;
    let fresh = fixture.central.create_service_object(&uuids::BATTERY_SERVICE).unwrap();
    assert_eq!(fresh.state(), ServiceState::RemoteService);
    assert_eq!(battery.state(), ServiceState::InvalidService);
    battery.discover_details(DiscoveryMode::SkipValueDiscovery);
    assert_eq!(battery.state(), ServiceState::InvalidService);
}

#[tokio::test]
async fn test_peripheral_disconnect_is_link_loss_for_central() {
    let mut fixture = connected_pair().await;
    discover(&mut fixture).await;

    fixture.peripheral.disconnect_from_device();
    wait_for(&mut fixture.peripheral_events, |e| *e == ControllerEvent::Disconnected).await;

    let error = wait_for(&mut fixture.central_events, |e| {
        matches!(e, ControllerEvent::ErrorOccurred(_))
    })
    .await;
    assert_eq!(
        error,
        ControllerEvent::ErrorOccurred(ControllerError::RemoteHostClosedError)
    );
    wait_for(&mut fixture.central_events, |e| *e == ControllerEvent::Disconnected).await;
    assert_eq!(fixture.central.state(), ControllerState::Unconnected);
    assert!(fixture.central.services().is_empty());
}

#[tokio::test]
async fn test_operations_outside_valid_states() {
    let (connector, _listener) = loopback_link();
    let config = ControllerConfig::default();
    let central = LowEnergyController::with_backend(
        BluetoothAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
        Box::new(AttBackend::new(connector, config.clone())),
        config,
    )
    .unwrap();
    let mut events = central.subscribe();

    // nothing to discover without a link
    central.discover_services();
    central.disconnect_from_device();
    assert_eq!(central.state(), ControllerState::Unconnected);
    assert!(central.audit_log().is_empty());

    // the loopback only knows its own peripheral
    central.connect_to_device();
    assert_eq!(central.state(), ControllerState::Connecting);
    let error = wait_for(&mut events, |e| matches!(e, ControllerEvent::ErrorOccurred(_))).await;
    assert_eq!(
        error,
        ControllerEvent::ErrorOccurred(ControllerError::UnknownRemoteDeviceError)
    );
    assert_eq!(central.state(), ControllerState::Unconnected);
    assert_eq!(central.error_string(), "Remote device cannot be found");
}
