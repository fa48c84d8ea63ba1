//! GATT service objects
//!
//! A [`GattService`] is a handle onto service data owned by its controller. Every
//! object created for the same UUID shares that data and its event channel, and
//! a service stays usable only while the controller that created it is alive.

use std::fmt;
use std::sync::{Arc, Weak};

use gattkit_core::local::MAX_ATTRIBUTE_VALUE_LENGTH;
use gattkit_core::{
    read_service, write_service, CharacteristicProperties, CharacteristicRef, ClientConfiguration, DescriptorRef,
    DiscoveryMode, ServiceError, ServiceState, ServiceTypes, SharedService, WriteMode,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::controller::{ControllerShared, Request};
use crate::events::ServiceEvent;

#[derive(Clone)]
pub struct GattService {
    controller: Weak<ControllerShared>,
    service: SharedService,
    events: broadcast::Sender<ServiceEvent>,
}

impl GattService {
    pub(crate) fn new(
        controller: Weak<ControllerShared>,
        service: SharedService,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Self {
        Self {
            controller,
            service,
            events,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn uuid(&self) -> Uuid {
        read_service(&self.service).uuid
    }

    pub fn state(&self) -> ServiceState {
        read_service(&self.service).state
    }

    /// Last error of this service
    pub fn error(&self) -> ServiceError {
        read_service(&self.service).last_error
    }

    pub fn service_type(&self) -> ServiceTypes {
        read_service(&self.service).service_type
    }

    pub fn included_services(&self) -> Vec<Uuid> {
        read_service(&self.service).included_services.clone()
    }

    /// Handle range covered by the service
    pub fn handle_range(&self) -> (u16, u16) {
        let data = read_service(&self.service);
        (data.start_handle, data.end_handle)
    }

    /// Characteristics in handle order; empty until details are discovered
    pub fn characteristics(&self) -> Vec<CharacteristicRef> {
        read_service(&self.service)
            .characteristic_list
            .keys()
            .map(|handle| CharacteristicRef::new(self.service.clone(), *handle))
            .collect()
    }

    /// First characteristic with `uuid`
    pub fn characteristic(&self, uuid: &Uuid) -> Option<CharacteristicRef> {
        let handle = read_service(&self.service).characteristic_handle(uuid)?;
        Some(CharacteristicRef::new(self.service.clone(), handle))
    }

    pub fn contains_characteristic(&self, characteristic: &CharacteristicRef) -> bool {
        characteristic.belongs_to(&self.service) && characteristic.is_valid()
    }

    pub fn contains_descriptor(&self, descriptor: &DescriptorRef) -> bool {
        descriptor.belongs_to(&self.service) && descriptor.is_valid()
    }

    /// Receive events of this service from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    fn set_error(&self, error: ServiceError) {
        write_service(&self.service).last_error = error;
        warn!("Service {}: {}", self.uuid(), error);
        let _ = self.events.send(ServiceEvent::Error(error));
    }

    /// The live controller when the service is in `expected` state
    fn controller_in(&self, expected: ServiceState) -> Option<Arc<ControllerShared>> {
        let controller = self.controller.upgrade()?;
        (self.state() == expected).then_some(controller)
    }

    /// Discover characteristics, descriptors and included services.
    /// Only a service in [`ServiceState::RemoteService`] starts discovery.
    pub fn discover_details(&self, mode: DiscoveryMode) {
        let Some(controller) = self.controller.upgrade() else {
            self.set_error(ServiceError::OperationError);
            return;
        };

        {
            let mut data = write_service(&self.service);
            match data.state {
                ServiceState::InvalidService => {
                    drop(data);
                    self.set_error(ServiceError::OperationError);
                    return;
                }
                ServiceState::RemoteService => data.state = ServiceState::RemoteServiceDiscovering,
                other => {
                    debug!("Detail discovery not started in state {:?}", other);
                    return;
                }
            }
        }

        let _ = self
            .events
            .send(ServiceEvent::StateChanged(ServiceState::RemoteServiceDiscovering));
        controller.enqueue(Request::DiscoverDetails {
            service: self.service.clone(),
            mode,
        });
    }

    /// Detail discovery in the controller's configured
    /// [`discovery_mode`](crate::ControllerConfig::discovery_mode)
    pub fn discover_details_default(&self) {
        let mode = self
            .controller
            .upgrade()
            .map(|controller| controller.config().discovery_mode)
            .unwrap_or_default();
        self.discover_details(mode);
    }

    /// Read a remote characteristic; the value arrives as [`ServiceEvent::CharacteristicRead`]
    pub fn read_characteristic(&self, characteristic: &CharacteristicRef) {
        let controller = self.controller_in(ServiceState::RemoteServiceDiscovered);
        match controller {
            Some(controller) if self.contains_characteristic(characteristic) => {
                controller.enqueue(Request::ReadCharacteristic(characteristic.clone()));
            }
            _ => self.set_error(ServiceError::OperationError),
        }
    }

    /// Write a characteristic. For remote services completion is reported as
    /// [`ServiceEvent::CharacteristicWritten`] unless `mode` is write without
    /// response. For local services the value is stored and pushed to a
    /// subscribed central.
    pub fn write_characteristic(&self, characteristic: &CharacteristicRef, value: Vec<u8>, mode: WriteMode) {
        let Some(controller) = self.controller.upgrade() else {
            self.set_error(ServiceError::OperationError);
            return;
        };
        if !self.contains_characteristic(characteristic) {
            self.set_error(ServiceError::OperationError);
            return;
        }

        match self.state() {
            ServiceState::LocalService => {
                if value.len() > MAX_ATTRIBUTE_VALUE_LENGTH {
                    self.set_error(ServiceError::CharacteristicWriteError);
                    return;
                }
                controller.characteristic_written(characteristic, value);
                let pushes = characteristic
                    .properties()
                    .intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE);
                if pushes && controller.state().is_linked() {
                    controller.enqueue(Request::Notify(characteristic.handle()));
                }
            }
            ServiceState::RemoteServiceDiscovered => controller.enqueue(Request::WriteCharacteristic {
                characteristic: characteristic.clone(),
                value,
                mode,
            }),
            _ => self.set_error(ServiceError::OperationError),
        }
    }

    /// Read a remote descriptor; the value arrives as [`ServiceEvent::DescriptorRead`]
    pub fn read_descriptor(&self, descriptor: &DescriptorRef) {
        let controller = self.controller_in(ServiceState::RemoteServiceDiscovered);
        match controller {
            Some(controller) if self.contains_descriptor(descriptor) => {
                controller.enqueue(Request::ReadDescriptor(descriptor.clone()));
            }
            _ => self.set_error(ServiceError::OperationError),
        }
    }

    /// Write a descriptor, remote or local
    pub fn write_descriptor(&self, descriptor: &DescriptorRef, value: Vec<u8>) {
        let Some(controller) = self.controller.upgrade() else {
            self.set_error(ServiceError::OperationError);
            return;
        };
        if !self.contains_descriptor(descriptor) {
            self.set_error(ServiceError::OperationError);
            return;
        }

        match self.state() {
            ServiceState::LocalService => {
                if value.len() > MAX_ATTRIBUTE_VALUE_LENGTH {
                    self.set_error(ServiceError::DescriptorWriteError);
                    return;
                }
                controller.descriptor_written(descriptor, value);
            }
            ServiceState::RemoteServiceDiscovered => controller.enqueue(Request::WriteDescriptor {
                descriptor: descriptor.clone(),
                value,
            }),
            _ => self.set_error(ServiceError::OperationError),
        }
    }

    /// Subscribe to notifications (or indications) of a remote characteristic
    /// by writing its client characteristic configuration descriptor
    pub fn enable_notifications(&self, characteristic: &CharacteristicRef, indications: bool) {
        let configuration = if indications {
            ClientConfiguration::INDICATION
        } else {
            ClientConfiguration::NOTIFICATION
        };
        self.configure_client(characteristic, configuration);
    }

    /// Stop notifications and indications of a remote characteristic
    pub fn disable_notifications(&self, characteristic: &CharacteristicRef) {
        self.configure_client(characteristic, ClientConfiguration::empty());
    }

    fn configure_client(&self, characteristic: &CharacteristicRef, configuration: ClientConfiguration) {
        match characteristic.client_configuration() {
            Some(descriptor) => self.write_descriptor(&descriptor, configuration.to_value()),
            None => self.set_error(ServiceError::OperationError),
        }
    }
}

impl fmt::Debug for GattService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = read_service(&self.service);
        f.debug_struct("GattService")
            .field("uuid", &data.uuid)
            .field("state", &data.state)
            .field("start_handle", &data.start_handle)
            .field("end_handle", &data.end_handle)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
