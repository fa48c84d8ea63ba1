//! Central backend on top of the host Bluetooth stack (btleplug)
//!
//! The host stack hides ATT handles, so handles are assigned here in GATT order
//! after service discovery: service, then for each characteristic its declaration,
//! value and descriptors. A client characteristic configuration descriptor is
//! synthesized for notifying characteristics when the host does not list one;
//! writes to it map to subscribe and unsubscribe.

use std::collections::{BTreeMap, HashMap, HashSet};

use btleplug::api::{Central as _, CentralEvent, Characteristic, Descriptor, Peripheral as _, Service, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use gattkit_core::att::DEFAULT_MTU;
use gattkit_core::{
    uuids, AddressType, AttributeHandle, BluetoothAddress, CharacteristicData, CharacteristicProperties,
    ClientConfiguration, ControllerError, DescriptorData, DiscoveryMode, Role, WriteMode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BackendEvent, ConnectionInfo, DiscoveredService, GattBackend, ServiceDetails};
use crate::config::ControllerConfig;
use crate::discovery::DeviceScanner;
use crate::error::{BleError, Result};

// ----------------------------------------------------------------------------
// Handle Layout
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Attribute {
    Value(Characteristic),
    Descriptor(Descriptor),
    /// Client configuration of the characteristic, whether listed by the host or not
    ClientConfiguration(Characteristic),
}

#[derive(Debug, Default)]
struct Layout {
    services: Vec<(DiscoveredService, ServiceDetails)>,
    attributes: HashMap<AttributeHandle, Attribute>,
    /// Value handle by characteristic UUID, for routing notifications
    value_handles: HashMap<Uuid, AttributeHandle>,
}

fn assign_handles(services: &[Service]) -> Layout {
    let mut layout = Layout::default();
    let mut cursor: AttributeHandle = 1;

    for service in services {
        let start_handle = cursor;
        let mut characteristics = BTreeMap::new();

        for characteristic in &service.characteristics {
            let declaration = cursor.saturating_add(1);
            let value_handle = declaration.saturating_add(1);
            cursor = value_handle;

            let properties = CharacteristicProperties::from_bits_truncate(characteristic.properties.bits());
            let mut data = CharacteristicData::new(characteristic.uuid, properties, value_handle);
            layout
                .attributes
                .insert(value_handle, Attribute::Value(characteristic.clone()));
            layout.value_handles.entry(characteristic.uuid).or_insert(value_handle);

            let mut has_client_configuration = false;
            for descriptor in &characteristic.descriptors {
                cursor = cursor.saturating_add(1);
                let attribute = if descriptor.uuid == uuids::CLIENT_CHARACTERISTIC_CONFIGURATION {
                    has_client_configuration = true;
                    Attribute::ClientConfiguration(characteristic.clone())
                } else {
                    Attribute::Descriptor(descriptor.clone())
                };
                layout.attributes.insert(cursor, attribute);
                data.descriptor_list
                    .insert(cursor, DescriptorData::new(descriptor.uuid, Vec::new()));
            }
            if properties.needs_client_configuration() && !has_client_configuration {
                cursor = cursor.saturating_add(1);
                layout
                    .attributes
                    .insert(cursor, Attribute::ClientConfiguration(characteristic.clone()));
                data.descriptor_list.insert(
                    cursor,
                    DescriptorData::new(uuids::CLIENT_CHARACTERISTIC_CONFIGURATION, Vec::new()),
                );
            }

            characteristics.insert(declaration, data);
        }

        let summary = DiscoveredService {
            uuid: service.uuid,
            start_handle,
            end_handle: cursor,
        };
        layout.services.push((
            summary,
            ServiceDetails {
                included_services: Vec::new(),
                characteristics,
            },
        ));
        cursor = cursor.saturating_add(1);
    }

    layout
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

pub struct BtleplugBackend {
    config: ControllerConfig,
    scanner: DeviceScanner,
    peripheral: Option<Peripheral>,
    layout: Layout,
    /// Client configuration handles currently subscribed
    subscribed: HashSet<AttributeHandle>,
    tasks: Vec<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<BackendEvent>>,
}

impl BtleplugBackend {
    pub fn new(config: ControllerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            scanner: DeviceScanner::new(config.clone()),
            config,
            peripheral: None,
            layout: Layout::default(),
            subscribed: HashSet::new(),
            tasks: Vec::new(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    fn peripheral(&self) -> Result<&Peripheral> {
        self.peripheral.as_ref().ok_or(BleError::NotConnected)
    }

    fn attribute(&self, handle: AttributeHandle) -> Result<Attribute> {
        self.layout
            .attributes
            .get(&handle)
            .cloned()
            .ok_or(BleError::AttributeNotFound { handle })
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Forward notifications of the connected peripheral as value changes
    async fn start_notification_pump(&mut self) -> Result<()> {
        let mut notifications = self
            .peripheral()?
            .notifications()
            .await
            .map_err(|e| BleError::SubscriptionFailed(e.to_string()))?;
        let value_handles = self.layout.value_handles.clone();
        let events = self.events_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                match value_handles.get(&notification.uuid) {
                    Some(handle) => {
                        let _ = events.send(BackendEvent::ValueChanged {
                            handle: *handle,
                            value: notification.value,
                            indication: false,
                        });
                    }
                    None => debug!("Notification for unknown characteristic {}", notification.uuid),
                }
            }
        }));
        Ok(())
    }

    fn read_client_configuration(&self, handle: AttributeHandle) -> Vec<u8> {
        if self.subscribed.contains(&handle) {
            ClientConfiguration::NOTIFICATION.to_value()
        } else {
            ClientConfiguration::empty().to_value()
        }
    }
}

impl Drop for BtleplugBackend {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[async_trait::async_trait]
impl GattBackend for BtleplugBackend {
    fn role(&self) -> Role {
        Role::Central
    }

    async fn connect(&mut self, remote: BluetoothAddress, _address_type: AddressType) -> Result<ConnectionInfo> {
        self.stop_tasks();
        let connection_timeout = self.config.connection_timeout;
        let peripheral = self.scanner.find_peripheral(remote, connection_timeout).await?;

        timeout(connection_timeout, peripheral.connect())
            .await
            .map_err(|_| BleError::ConnectionTimeout)?
            .map_err(|e| BleError::ConnectionFailed(e.to_string()))?;
        info!("Connected to {}", remote);

        // Watch for the link going down
        let adapter = self.scanner.initialize_adapter().await?;
        let mut adapter_events = adapter
            .events()
            .await
            .map_err(|e| BleError::EventStreamFailed(e.to_string()))?;
        let id = peripheral.id();
        let events = self.events_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let CentralEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        let _ = events.send(BackendEvent::LinkLost(ControllerError::RemoteHostClosedError));
                        break;
                    }
                }
            }
        }));

        self.peripheral = Some(peripheral);
        Ok(ConnectionInfo {
            local_address: BluetoothAddress::ANY,
            mtu: DEFAULT_MTU,
        })
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop_tasks();
        self.layout = Layout::default();
        self.subscribed.clear();
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_services(&mut self) -> Result<Vec<DiscoveredService>> {
        let peripheral = self.peripheral()?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| BleError::ServiceDiscoveryFailed(e.to_string()))?;
        let services: Vec<Service> = peripheral
            .services()
            .into_iter()
            .filter(|service| service.primary)
            .collect();

        self.layout = assign_handles(&services);
        self.start_notification_pump().await?;
        Ok(self.layout.services.iter().map(|(summary, _)| *summary).collect())
    }

    async fn discover_service_details(
        &mut self,
        service: &DiscoveredService,
        mode: DiscoveryMode,
    ) -> Result<ServiceDetails> {
        let mut details = self
            .layout
            .services
            .iter()
            .find(|(summary, _)| summary == service)
            .map(|(_, details)| details.clone())
            .ok_or(BleError::AttributeNotFound {
                handle: service.start_handle,
            })?;

        if mode == DiscoveryMode::FullDiscovery {
            for characteristic in details.characteristics.values_mut() {
                if characteristic.properties.contains(CharacteristicProperties::READ) {
                    match self.read_characteristic(characteristic.value_handle).await {
                        Ok(value) => characteristic.value = value,
                        Err(e) => debug!("Reading characteristic {} failed: {}", characteristic.uuid, e),
                    }
                }
                for (handle, descriptor) in characteristic.descriptor_list.iter_mut() {
                    match self.read_descriptor(*handle).await {
                        Ok(value) => descriptor.value = value,
                        Err(e) => debug!("Reading descriptor 0x{:04X} failed: {}", handle, e),
                    }
                }
            }
        }
        Ok(details)
    }

    async fn read_characteristic(&mut self, value_handle: AttributeHandle) -> Result<Vec<u8>> {
        match self.attribute(value_handle)? {
            Attribute::Value(characteristic) => Ok(self.peripheral()?.read(&characteristic).await?),
            _ => Err(BleError::AttributeNotFound { handle: value_handle }),
        }
    }

    async fn write_characteristic(&mut self, value_handle: AttributeHandle, value: &[u8], mode: WriteMode) -> Result<()> {
        let Attribute::Value(characteristic) = self.attribute(value_handle)? else {
            return Err(BleError::AttributeNotFound { handle: value_handle });
        };
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
            WriteMode::Signed => return Err(BleError::Unsupported("signed writes".to_string())),
        };
        self.peripheral()?.write(&characteristic, value, write_type).await?;
        Ok(())
    }

    async fn read_descriptor(&mut self, handle: AttributeHandle) -> Result<Vec<u8>> {
        match self.attribute(handle)? {
            Attribute::Descriptor(descriptor) => Ok(self.peripheral()?.read_descriptor(&descriptor).await?),
            Attribute::ClientConfiguration(_) => Ok(self.read_client_configuration(handle)),
            Attribute::Value(_) => Err(BleError::AttributeNotFound { handle }),
        }
    }

    async fn write_descriptor(&mut self, handle: AttributeHandle, value: &[u8]) -> Result<()> {
        match self.attribute(handle)? {
            Attribute::Descriptor(descriptor) => {
                self.peripheral()?.write_descriptor(&descriptor, value).await?;
            }
            Attribute::ClientConfiguration(characteristic) => {
                let configuration = ClientConfiguration::from_value(value);
                let peripheral = self.peripheral()?;
                if configuration.is_empty() {
                    peripheral
                        .unsubscribe(&characteristic)
                        .await
                        .map_err(|e| BleError::SubscriptionFailed(e.to_string()))?;
                    self.subscribed.remove(&handle);
                } else {
                    if configuration.contains(ClientConfiguration::INDICATION) {
                        warn!("Host stack decides between notifications and indications for {}", characteristic.uuid);
                    }
                    peripheral
                        .subscribe(&characteristic)
                        .await
                        .map_err(|e| BleError::SubscriptionFailed(e.to_string()))?;
                    self.subscribed.insert(handle);
                }
            }
            Attribute::Value(_) => return Err(BleError::AttributeNotFound { handle }),
        }
        Ok(())
    }

    fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<BackendEvent>> {
        self.events_rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::CharPropFlags;
    use std::collections::BTreeSet;

    fn characteristic(uuid: Uuid, service_uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    #[test]
    fn test_handles_follow_gatt_order() {
        let mut level = characteristic(
            uuids::BATTERY_LEVEL,
            uuids::BATTERY_SERVICE,
            CharPropFlags::READ | CharPropFlags::NOTIFY,
        );
        level.descriptors.insert(Descriptor {
            uuid: uuids::CHARACTERISTIC_USER_DESCRIPTION,
            service_uuid: uuids::BATTERY_SERVICE,
            characteristic_uuid: uuids::BATTERY_LEVEL,
        });
        let battery = Service {
            uuid: uuids::BATTERY_SERVICE,
            primary: true,
            characteristics: BTreeSet::from([level]),
        };
        let name = characteristic(uuids::DEVICE_NAME, uuids::GENERIC_ACCESS, CharPropFlags::READ);
        let access = Service {
            uuid: uuids::GENERIC_ACCESS,
            primary: true,
            characteristics: BTreeSet::from([name]),
        };

        let layout = assign_handles(&[battery, access]);
        let (battery_summary, battery_details) = &layout.services[0];
        assert_eq!((battery_summary.start_handle, battery_summary.end_handle), (1, 5));
        let level = &battery_details.characteristics[&2];
        assert_eq!(level.value_handle, 3);
        // user description at 4, synthesized client configuration at 5
        assert_eq!(level.descriptor_list.keys().copied().collect::<Vec<_>>(), vec![4, 5]);
        assert!(matches!(layout.attributes[&5], Attribute::ClientConfiguration(_)));

        let (access_summary, access_details) = &layout.services[1];
        assert_eq!((access_summary.start_handle, access_summary.end_handle), (6, 8));
        assert_eq!(access_details.characteristics[&7].value_handle, 8);
        assert_eq!(layout.value_handles[&uuids::DEVICE_NAME], 8);
    }
}
