//! Command handlers for the gattkit CLI

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gattkit_ble::{
    AdvertisingData, AdvertisingParameters, ControllerEvent, DeviceScanner, GattService, LowEnergyController,
    ServiceEvent,
};
use gattkit_core::{
    uuids, AddressType, AttributeHandle, BluetoothAddress, CharacteristicProperties, CharacteristicRef,
    ControllerError, DescriptorRef, DiscoveryMode, LocalCharacteristicDefinition, LocalDescriptorDefinition,
    LocalServiceDefinition, ServiceState, ServiceTypes, WriteMode,
};

use crate::cli::Commands;
use crate::config::{BackendKind, CliAppConfig};
use crate::error::{CliError, Result};

/// Settle time for a write without response before the link is closed
const UNACKNOWLEDGED_WRITE_GRACE: Duration = Duration::from_millis(250);

// ----------------------------------------------------------------------------
// Command Dispatcher
// ----------------------------------------------------------------------------

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(command: Commands, config: CliAppConfig) -> Result<()> {
        match command {
            Commands::Scan { timeout, service } => Self::handle_scan_command(&config, timeout, service).await,
            Commands::Explore {
                address,
                skip_values,
                random,
            } => Self::handle_explore_command(&config, &address, skip_values, random).await,
            Commands::Read { address, handle } => Self::handle_read_command(&config, &address, &handle).await,
            Commands::Write {
                address,
                handle,
                value,
                without_response,
            } => Self::handle_write_command(&config, &address, &handle, &value, without_response).await,
            Commands::Watch {
                address,
                handle,
                indicate,
            } => Self::handle_watch_command(&config, &address, &handle, indicate).await,
            Commands::Serve { name } => Self::handle_serve_command(&config, name).await,
            Commands::Config => {
                println!("{}", CliAppConfig::example_config());
                Ok(())
            }
        }
    }

    /// Handle the scan command
    async fn handle_scan_command(config: &CliAppConfig, seconds: Option<u64>, services: Vec<String>) -> Result<()> {
        let services = services
            .iter()
            .map(|s| parse_uuid(s))
            .collect::<Result<Vec<_>>>()?;
        let duration = Duration::from_secs(seconds.unwrap_or(config.cli.scan_timeout_secs));

        info!("Scanning for {:?}...", duration);
        let mut scanner = DeviceScanner::new(config.controller.clone());
        let devices = scanner.scan(duration, services).await?;

        if config.cli.json_output {
            println!("{}", serde_json::to_string_pretty(&devices)?);
            return Ok(());
        }

        if devices.is_empty() {
            println!("No devices found");
        }
        for device in devices {
            println!(
                "{}  {:>4} dBm  {}",
                device.address,
                device.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".to_string()),
                device.name.as_deref().unwrap_or("(unnamed)")
            );
            for uuid in device.services {
                println!("    service {}", uuid);
            }
        }
        Ok(())
    }

    /// Handle the explore command
    async fn handle_explore_command(config: &CliAppConfig, address: &str, skip_values: bool, random: bool) -> Result<()> {
        let controller = build_central(config, parse_address(address)?)?;
        if random {
            controller.set_remote_address_type(AddressType::Random);
        }
        let limit = operation_limit(config);
        let mode = if skip_values {
            DiscoveryMode::SkipValueDiscovery
        } else {
            config.controller.discovery_mode
        };

        connect_and_discover(&controller, limit).await?;
        let services = discover_all(&controller, mode, limit).await?;
        let reports: Vec<ServiceReport> = services.iter().map(ServiceReport::from_service).collect();

        if config.cli.json_output {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        } else {
            println!("{} (MTU {})", controller.remote_address(), controller.mtu());
            for report in &reports {
                report.print();
            }
        }

        controller.disconnect_from_device();
        Ok(())
    }

    /// Handle the read command
    async fn handle_read_command(config: &CliAppConfig, address: &str, handle: &str) -> Result<()> {
        let handle = parse_handle(handle)?;
        let controller = build_central(config, parse_address(address)?)?;
        let limit = operation_limit(config);

        connect_and_discover(&controller, limit).await?;
        let services = discover_all(&controller, DiscoveryMode::SkipValueDiscovery, limit).await?;
        let value = read_attribute(&services, handle, limit).await?;
        println!("0x{:04X}: {}", handle, hex::encode(&value));

        controller.disconnect_from_device();
        Ok(())
    }

    /// Handle the write command
    async fn handle_write_command(
        config: &CliAppConfig,
        address: &str,
        handle: &str,
        value: &str,
        without_response: bool,
    ) -> Result<()> {
        let handle = parse_handle(handle)?;
        let value = hex::decode(value.trim_start_matches("0x"))?;
        let controller = build_central(config, parse_address(address)?)?;
        let limit = operation_limit(config);
        let mode = if without_response {
            WriteMode::WithoutResponse
        } else {
            WriteMode::WithResponse
        };

        connect_and_discover(&controller, limit).await?;
        let services = discover_all(&controller, DiscoveryMode::SkipValueDiscovery, limit).await?;
        write_attribute(&services, handle, value, mode, limit).await?;
        println!("0x{:04X} written", handle);

        controller.disconnect_from_device();
        Ok(())
    }

    /// Handle the watch command
    async fn handle_watch_command(config: &CliAppConfig, address: &str, handle: &str, indicate: bool) -> Result<()> {
        let handle = parse_handle(handle)?;
        let controller = build_central(config, parse_address(address)?)?;
        let limit = operation_limit(config);

        connect_and_discover(&controller, limit).await?;
        let services = discover_all(&controller, DiscoveryMode::SkipValueDiscovery, limit).await?;
        let Some(Attribute::Characteristic(service, characteristic)) = locate(&services, handle) else {
            return Err(CliError::NotFound(format!("characteristic 0x{:04X}", handle)));
        };

        let mut service_events = service.subscribe();
        let mut controller_events = controller.subscribe();
        service.enable_notifications(&characteristic, indicate);
        wait_for_service(&mut service_events, limit, |e| matches!(e, ServiceEvent::DescriptorWritten(..))).await?;
        info!("Watching 0x{:04X}, press Ctrl+C to stop", handle);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = service_events.recv() => match event {
                    Ok(ServiceEvent::CharacteristicChanged(changed, value)) if changed == characteristic => {
                        println!("0x{:04X}: {}", handle, hex::encode(&value));
                    }
                    Ok(ServiceEvent::Error(error)) => warn!("Service error: {}", error),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => warn!("Missed {} updates", missed),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = controller_events.recv() => {
                    if let Ok(ControllerEvent::Disconnected) = event {
                        return Err(CliError::Controller(controller.error()));
                    }
                }
            }
        }

        service.disable_notifications(&characteristic);
        controller.disconnect_from_device();
        Ok(())
    }

    /// Handle the serve command
    async fn handle_serve_command(config: &CliAppConfig, name: String) -> Result<()> {
        let controller = LowEnergyController::peripheral(config.controller.clone())?;
        let battery = controller.add_service(&demo_battery_service())?;
        let level_characteristic = battery
            .characteristic(&uuids::BATTERY_LEVEL)
            .ok_or_else(|| CliError::NotFound("battery level characteristic".to_string()))?;
        let mut events = controller.subscribe();

        let data = AdvertisingData::new()
            .with_local_name(name.clone())
            .with_service(uuids::BATTERY_SERVICE);
        controller.start_advertising(AdvertisingParameters::default(), data.clone(), AdvertisingData::new());
        info!("Advertising as {:?}, press Ctrl+C to stop", name);

        let mut level: u8 = 100;
        let mut ticker = tokio::time::interval(Duration::from_secs(config.cli.serve_update_interval_secs));
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    level = if level == 0 { 100 } else { level - 1 };
                    debug!("Battery level {}", level);
                    battery.write_characteristic(&level_characteristic, vec![level], WriteMode::WithResponse);
                }
                event = events.recv() => match event {
                    Ok(ControllerEvent::Connected) => info!("Central {} connected", controller.remote_address()),
                    Ok(ControllerEvent::Disconnected) => {
                        info!("Central disconnected, advertising again");
                        controller.start_advertising(AdvertisingParameters::default(), data.clone(), AdvertisingData::new());
                    }
                    Ok(ControllerEvent::ErrorOccurred(ControllerError::AdvertisingError)) => {
                        return Err(CliError::Controller(ControllerError::AdvertisingError));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        controller.disconnect_from_device();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Controller Helpers
// ----------------------------------------------------------------------------

fn operation_limit(config: &CliAppConfig) -> Duration {
    config.controller.connection_timeout + config.controller.request_timeout
}

/// Central controller on the configured backend
fn build_central(config: &CliAppConfig, address: BluetoothAddress) -> Result<LowEnergyController> {
    match config.cli.backend {
        BackendKind::Native => Ok(LowEnergyController::central(address, config.controller.clone())?),
        #[cfg(target_os = "linux")]
        BackendKind::Att => Ok(LowEnergyController::with_backend(
            address,
            gattkit_ble::backend::att_central_backend(&config.controller),
            config.controller.clone(),
        )?),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Att => Err(CliError::FeatureNotAvailable(
            "the ATT backend requires Linux".to_string(),
        )),
    }
}

async fn wait_for_controller(
    events: &mut broadcast::Receiver<ControllerEvent>,
    limit: Duration,
    wanted: ControllerEvent,
) -> Result<()> {
    let waited = timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if event == wanted => return Ok(()),
                Ok(ControllerEvent::ErrorOccurred(error)) => return Err(CliError::Controller(error)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CliError::Controller(ControllerError::UnknownError))
                }
            }
        }
    })
    .await;
    waited.map_err(|_| CliError::Timeout(format!("{:?}", wanted)))?
}

async fn wait_for_service<F>(
    events: &mut broadcast::Receiver<ServiceEvent>,
    limit: Duration,
    matches: F,
) -> Result<ServiceEvent>
where
    F: Fn(&ServiceEvent) -> bool,
{
    let waited = timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Ok(event),
                Ok(ServiceEvent::Error(error)) => return Err(CliError::Service(error)),
                Ok(ServiceEvent::StateChanged(ServiceState::InvalidService)) => {
                    return Err(CliError::Controller(ControllerError::RemoteHostClosedError))
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CliError::Controller(ControllerError::UnknownError))
                }
            }
        }
    })
    .await;
    waited.map_err(|_| CliError::Timeout("service operation".to_string()))?
}

/// Connect and run primary service discovery
pub async fn connect_and_discover(controller: &LowEnergyController, limit: Duration) -> Result<()> {
    let mut events = controller.subscribe();
    controller.connect_to_device();
    wait_for_controller(&mut events, limit, ControllerEvent::Connected).await?;
    info!("Connected to {}", controller.remote_address());

    controller.discover_services();
    wait_for_controller(&mut events, limit, ControllerEvent::DiscoveryFinished).await?;
    info!("Found {} services", controller.services().len());
    Ok(())
}

/// Discover the details of every known service, in discovery order
pub async fn discover_all(
    controller: &LowEnergyController,
    mode: DiscoveryMode,
    limit: Duration,
) -> Result<Vec<GattService>> {
    let mut services = Vec::new();
    for uuid in controller.services() {
        let Some(service) = controller.create_service_object(&uuid) else {
            continue;
        };
        let mut events = service.subscribe();
        service.discover_details(mode);
        wait_for_service(&mut events, limit, |e| {
            *e == ServiceEvent::StateChanged(ServiceState::RemoteServiceDiscovered)
        })
        .await?;
        services.push(service);
    }
    Ok(services)
}

/// An attribute found by handle
pub enum Attribute {
    Characteristic(GattService, CharacteristicRef),
    Descriptor(GattService, DescriptorRef),
}

/// Find the characteristic (declaration or value handle) or descriptor at `handle`
pub fn locate(services: &[GattService], handle: AttributeHandle) -> Option<Attribute> {
    for service in services {
        for characteristic in service.characteristics() {
            if characteristic.handle() == handle || characteristic.value_handle() == Some(handle) {
                return Some(Attribute::Characteristic(service.clone(), characteristic));
            }
            if let Some(descriptor) = characteristic.descriptors().into_iter().find(|d| d.handle() == handle) {
                return Some(Attribute::Descriptor(service.clone(), descriptor));
            }
        }
    }
    None
}

/// Read the attribute at `handle`
pub async fn read_attribute(services: &[GattService], handle: AttributeHandle, limit: Duration) -> Result<Vec<u8>> {
    match locate(services, handle) {
        Some(Attribute::Characteristic(service, characteristic)) => {
            let mut events = service.subscribe();
            service.read_characteristic(&characteristic);
            let event = wait_for_service(&mut events, limit, |e| {
                matches!(e, ServiceEvent::CharacteristicRead(c, _) if *c == characteristic)
            })
            .await?;
            match event {
                ServiceEvent::CharacteristicRead(_, value) => Ok(value),
                _ => Ok(characteristic.value()),
            }
        }
        Some(Attribute::Descriptor(service, descriptor)) => {
            let mut events = service.subscribe();
            service.read_descriptor(&descriptor);
            let event = wait_for_service(&mut events, limit, |e| {
                matches!(e, ServiceEvent::DescriptorRead(d, _) if *d == descriptor)
            })
            .await?;
            match event {
                ServiceEvent::DescriptorRead(_, value) => Ok(value),
                _ => Ok(descriptor.value()),
            }
        }
        None => Err(CliError::NotFound(format!("attribute 0x{:04X}", handle))),
    }
}

/// Write the attribute at `handle`; descriptors always use a write request
pub async fn write_attribute(
    services: &[GattService],
    handle: AttributeHandle,
    value: Vec<u8>,
    mode: WriteMode,
    limit: Duration,
) -> Result<()> {
    match locate(services, handle) {
        Some(Attribute::Characteristic(service, characteristic)) => {
            let mut events = service.subscribe();
            service.write_characteristic(&characteristic, value, mode);
            if mode == WriteMode::WithoutResponse {
                tokio::time::sleep(UNACKNOWLEDGED_WRITE_GRACE).await;
                return Ok(());
            }
            wait_for_service(&mut events, limit, |e| {
                matches!(e, ServiceEvent::CharacteristicWritten(c, _) if *c == characteristic)
            })
            .await?;
            Ok(())
        }
        Some(Attribute::Descriptor(service, descriptor)) => {
            let mut events = service.subscribe();
            service.write_descriptor(&descriptor, value);
            wait_for_service(&mut events, limit, |e| {
                matches!(e, ServiceEvent::DescriptorWritten(d, _) if *d == descriptor)
            })
            .await?;
            Ok(())
        }
        None => Err(CliError::NotFound(format!("attribute 0x{:04X}", handle))),
    }
}

fn demo_battery_service() -> LocalServiceDefinition {
    LocalServiceDefinition::primary(uuids::BATTERY_SERVICE).with_characteristic(
        LocalCharacteristicDefinition::new(
            uuids::BATTERY_LEVEL,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
        )
        .with_value(vec![100])
        .with_descriptor(LocalDescriptorDefinition::user_description("Battery level")),
    )
}

// ----------------------------------------------------------------------------
// Argument Parsing
// ----------------------------------------------------------------------------

pub fn parse_address(address: &str) -> Result<BluetoothAddress> {
    Ok(BluetoothAddress::from_str(address)?)
}

/// Decimal or `0x`-prefixed hexadecimal attribute handle
pub fn parse_handle(handle: &str) -> Result<AttributeHandle> {
    let parsed = match handle.strip_prefix("0x").or_else(|| handle.strip_prefix("0X")) {
        Some(hex_digits) => AttributeHandle::from_str_radix(hex_digits, 16),
        None => handle.parse(),
    };
    match parsed {
        Ok(0) | Err(_) => Err(CliError::InvalidArgument(format!("invalid attribute handle {:?}", handle))),
        Ok(handle) => Ok(handle),
    }
}

/// Full UUID or 16-bit short form (`180f`, `0x180F`)
pub fn parse_uuid(uuid: &str) -> Result<Uuid> {
    if let Ok(parsed) = Uuid::parse_str(uuid) {
        return Ok(parsed);
    }
    let short = uuid.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(short, 16)
        .map(uuids::from_u16)
        .map_err(|_| CliError::InvalidArgument(format!("invalid UUID {:?}", uuid)))
}

// ----------------------------------------------------------------------------
// Reports
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorReport {
    pub handle: AttributeHandle,
    pub uuid: Uuid,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicReport {
    pub handle: AttributeHandle,
    pub value_handle: Option<AttributeHandle>,
    pub uuid: Option<Uuid>,
    pub properties: CharacteristicProperties,
    pub value: String,
    pub descriptors: Vec<DescriptorReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceReport {
    pub uuid: Uuid,
    pub start_handle: AttributeHandle,
    pub end_handle: AttributeHandle,
    pub primary: bool,
    pub included_services: Vec<Uuid>,
    pub characteristics: Vec<CharacteristicReport>,
}

impl ServiceReport {
    pub fn from_service(service: &GattService) -> Self {
        let (start_handle, end_handle) = service.handle_range();
        let characteristics = service
            .characteristics()
            .into_iter()
            .map(|characteristic| CharacteristicReport {
                handle: characteristic.handle(),
                value_handle: characteristic.value_handle(),
                uuid: characteristic.uuid(),
                properties: characteristic.properties(),
                value: hex::encode(characteristic.value()),
                descriptors: characteristic
                    .descriptors()
                    .into_iter()
                    .filter_map(|descriptor| {
                        Some(DescriptorReport {
                            handle: descriptor.handle(),
                            uuid: descriptor.uuid()?,
                            value: hex::encode(descriptor.value()),
                        })
                    })
                    .collect(),
            })
            .collect();

        Self {
            uuid: service.uuid(),
            start_handle,
            end_handle,
            primary: service.service_type().contains(ServiceTypes::PRIMARY_SERVICE),
            included_services: service.included_services(),
            characteristics,
        }
    }

    fn print(&self) {
        println!(
            "service {} [0x{:04X}..0x{:04X}]{}",
            self.uuid,
            self.start_handle,
            self.end_handle,
            if self.primary { "" } else { " (secondary)" }
        );
        for included in &self.included_services {
            println!("  includes {}", included);
        }
        for characteristic in &self.characteristics {
            println!(
                "  0x{:04X} characteristic {} {:?} = {}",
                characteristic.value_handle.unwrap_or(characteristic.handle),
                characteristic.uuid.map(|u| u.to_string()).unwrap_or_default(),
                characteristic.properties,
                characteristic.value
            );
            for descriptor in &characteristic.descriptors {
                println!(
                    "    0x{:04X} descriptor {} = {}",
                    descriptor.handle, descriptor.uuid, descriptor.value
                );
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use gattkit_ble::advertising::FallbackAdvertiser;
    use gattkit_ble::backend::loopback::LOOPBACK_PERIPHERAL_ADDRESS;
    use gattkit_ble::backend::{loopback_link, AttBackend, AttPeripheralBackend};
    use gattkit_ble::ControllerConfig;

    const LIMIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_parse_handle() {
        assert_eq!(parse_handle("3").unwrap(), 3);
        assert_eq!(parse_handle("0x002A").unwrap(), 42);
        assert!(parse_handle("0").is_err());
        assert!(parse_handle("0x10000").is_err());
        assert!(parse_handle("abc").is_err());
    }

    #[test]
    fn test_parse_uuid_and_address() {
        assert_eq!(parse_uuid("180f").unwrap(), uuids::BATTERY_SERVICE);
        assert_eq!(
            parse_uuid("0000180f-0000-1000-8000-00805f9b34fb").unwrap(),
            uuids::BATTERY_SERVICE
        );
        assert!(parse_uuid("not-a-uuid").is_err());
        assert_eq!(
            parse_address("00:11:22:33:44:55").unwrap(),
            BluetoothAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
        );
        assert!(parse_address("00:11:22").is_err());
    }

    #[tokio::test]
    async fn test_explore_read_and_write_over_loopback() {
        let (connector, listener) = loopback_link();
        let peripheral = LowEnergyController::with_backend(
            BluetoothAddress::ANY,
            Box::new(AttPeripheralBackend::new(listener, FallbackAdvertiser::new())),
            ControllerConfig::default(),
        )
        .unwrap();
        peripheral.add_service(&demo_battery_service()).unwrap();
        peripheral.start_advertising(
            AdvertisingParameters::default(),
            AdvertisingData::new().with_local_name("demo"),
            AdvertisingData::new(),
        );

        let config = ControllerConfig::default();
        let central = LowEnergyController::with_backend(
            LOOPBACK_PERIPHERAL_ADDRESS,
            Box::new(AttBackend::new(connector, config.clone())),
            config,
        )
        .unwrap();

        connect_and_discover(&central, LIMIT).await.unwrap();
        let services = discover_all(&central, DiscoveryMode::FullDiscovery, LIMIT).await.unwrap();
        let reports: Vec<_> = services.iter().map(ServiceReport::from_service).collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].uuid, uuids::BATTERY_SERVICE);
        assert_eq!((reports[0].start_handle, reports[0].end_handle), (1, 5));
        let level = &reports[0].characteristics[0];
        assert_eq!(level.value_handle, Some(3));
        assert_eq!(level.value, "64");
        let descriptor_uuids: Vec<_> = level.descriptors.iter().map(|d| d.uuid).collect();
        assert!(descriptor_uuids.contains(&uuids::CLIENT_CHARACTERISTIC_CONFIGURATION));
        assert!(descriptor_uuids.contains(&uuids::CHARACTERISTIC_USER_DESCRIPTION));

        assert_eq!(read_attribute(&services, 3, LIMIT).await.unwrap(), vec![100]);
        assert!(matches!(
            read_attribute(&services, 0x0100, LIMIT).await,
            Err(CliError::NotFound(_))
        ));

        // battery level is not writable
        let result = write_attribute(&services, 3, vec![1], WriteMode::WithResponse, LIMIT).await;
        assert!(matches!(result, Err(CliError::Service(_))));

        let cccd = level
            .descriptors
            .iter()
            .find(|d| d.uuid == uuids::CLIENT_CHARACTERISTIC_CONFIGURATION)
            .unwrap()
            .handle;
        write_attribute(&services, cccd, vec![1, 0], WriteMode::WithResponse, LIMIT)
            .await
            .unwrap();
        assert_eq!(read_attribute(&services, cccd, LIMIT).await.unwrap(), vec![1, 0]);
    }
}
