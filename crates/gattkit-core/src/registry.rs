//! Service registry and attribute handle resolver
//!
//! Maps raw attribute handles back to the service, characteristic or descriptor that
//! owns them and applies incoming values. Services are few, so lookups scan linearly;
//! characteristics are kept sorted by declaration handle, which lets a value or
//! descriptor handle resolve to the closest declaration at or below it.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::gatt::{read_service, write_service, CharacteristicData, DescriptorData, ServiceData, SharedService};
use crate::types::{AttributeHandle, CharacteristicProperties, ServiceState};
use crate::uuids;

// ----------------------------------------------------------------------------
// Attribute References
// ----------------------------------------------------------------------------

/// A characteristic identified by its service and declaration handle
#[derive(Debug, Clone)]
pub struct CharacteristicRef {
    service: SharedService,
    handle: AttributeHandle,
}

impl CharacteristicRef {
    pub fn new(service: SharedService, handle: AttributeHandle) -> Self {
        Self { service, handle }
    }

    pub fn service(&self) -> &SharedService {
        &self.service
    }

    /// Declaration handle
    pub fn handle(&self) -> AttributeHandle {
        self.handle
    }

    fn with<R>(&self, f: impl FnOnce(&CharacteristicData) -> R) -> Option<R> {
        let service = read_service(&self.service);
        if service.state == ServiceState::InvalidService {
            return None;
        }
        service.characteristic_list.get(&self.handle).map(f)
    }

    /// False once the owning service was invalidated or never had this characteristic
    pub fn is_valid(&self) -> bool {
        self.with(|_| ()).is_some()
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.with(|c| c.uuid)
    }

    pub fn value(&self) -> Vec<u8> {
        self.with(|c| c.value.clone()).unwrap_or_default()
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.with(|c| c.properties).unwrap_or_default()
    }

    pub fn value_handle(&self) -> Option<AttributeHandle> {
        self.with(|c| c.value_handle)
    }

    pub fn descriptors(&self) -> Vec<DescriptorRef> {
        self.with(|c| c.descriptor_list.keys().copied().collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .map(|handle| DescriptorRef::new(self.service.clone(), self.handle, handle))
            .collect()
    }

    pub fn descriptor(&self, uuid: &Uuid) -> Option<DescriptorRef> {
        let handle = self.with(|c| {
            c.descriptor_list
                .iter()
                .find(|(_, d)| d.uuid == *uuid)
                .map(|(handle, _)| *handle)
        })??;
        Some(DescriptorRef::new(self.service.clone(), self.handle, handle))
    }

    pub fn client_configuration(&self) -> Option<DescriptorRef> {
        self.descriptor(&uuids::CLIENT_CHARACTERISTIC_CONFIGURATION)
    }

    /// Whether this characteristic lives in `service`
    pub fn belongs_to(&self, service: &SharedService) -> bool {
        Arc::ptr_eq(&self.service, service)
    }
}

impl PartialEq for CharacteristicRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.service, &other.service) && self.handle == other.handle
    }
}

impl Eq for CharacteristicRef {}

/// A descriptor identified by its service, owning characteristic and handle
#[derive(Debug, Clone)]
pub struct DescriptorRef {
    service: SharedService,
    characteristic_handle: AttributeHandle,
    handle: AttributeHandle,
}

impl DescriptorRef {
    pub fn new(service: SharedService, characteristic_handle: AttributeHandle, handle: AttributeHandle) -> Self {
        Self {
            service,
            characteristic_handle,
            handle,
        }
    }

    pub fn service(&self) -> &SharedService {
        &self.service
    }

    pub fn handle(&self) -> AttributeHandle {
        self.handle
    }

    pub fn characteristic_handle(&self) -> AttributeHandle {
        self.characteristic_handle
    }

    pub fn characteristic(&self) -> CharacteristicRef {
        CharacteristicRef::new(self.service.clone(), self.characteristic_handle)
    }

    fn with<R>(&self, f: impl FnOnce(&DescriptorData) -> R) -> Option<R> {
        let service = read_service(&self.service);
        if service.state == ServiceState::InvalidService {
            return None;
        }
        service
            .characteristic_list
            .get(&self.characteristic_handle)?
            .descriptor_list
            .get(&self.handle)
            .map(f)
    }

    pub fn is_valid(&self) -> bool {
        self.with(|_| ()).is_some()
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.with(|d| d.uuid)
    }

    pub fn value(&self) -> Vec<u8> {
        self.with(|d| d.value.clone()).unwrap_or_default()
    }

    pub fn belongs_to(&self, service: &SharedService) -> bool {
        Arc::ptr_eq(&self.service, service)
    }
}

impl PartialEq for DescriptorRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.service, &other.service)
            && self.characteristic_handle == other.characteristic_handle
            && self.handle == other.handle
    }
}

impl Eq for DescriptorRef {}

// ----------------------------------------------------------------------------
// Value Updates
// ----------------------------------------------------------------------------

fn apply(target: &mut Vec<u8>, value: &[u8], append: bool) -> usize {
    if append {
        target.extend_from_slice(value);
    } else {
        target.clear();
        target.extend_from_slice(value);
    }
    target.len()
}

/// Replaces or extends the cached value of a characteristic of `service`.
/// Returns the resulting length, or 0 if the characteristic is unknown.
pub fn update_characteristic_value(
    service: &SharedService,
    char_handle: AttributeHandle,
    value: &[u8],
    append: bool,
) -> usize {
    let mut service = write_service(service);
    match service.characteristic_list.get_mut(&char_handle) {
        Some(characteristic) => apply(&mut characteristic.value, value, append),
        None => 0,
    }
}

/// Replaces or extends the cached value of a descriptor of `service`.
/// Returns the resulting length, or 0 if the descriptor is unknown.
pub fn update_descriptor_value(
    service: &SharedService,
    char_handle: AttributeHandle,
    desc_handle: AttributeHandle,
    value: &[u8],
    append: bool,
) -> usize {
    let mut service = write_service(service);
    let descriptor = service
        .characteristic_list
        .get_mut(&char_handle)
        .and_then(|c| c.descriptor_list.get_mut(&desc_handle));
    match descriptor {
        Some(descriptor) => apply(&mut descriptor.value, value, append),
        None => 0,
    }
}

// ----------------------------------------------------------------------------
// Service Registry
// ----------------------------------------------------------------------------

/// Ordered set of services known to a controller
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<SharedService>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service. A second service with an already known UUID is ignored and
    /// the existing one is returned.
    pub fn insert(&mut self, data: ServiceData) -> SharedService {
        if let Some(existing) = self.get(&data.uuid) {
            debug!("Service {} already registered, keeping the first instance", data.uuid);
            return existing;
        }
        let service = crate::gatt::share(data);
        self.services.push(service.clone());
        service
    }

    pub fn get(&self, uuid: &Uuid) -> Option<SharedService> {
        self.services
            .iter()
            .find(|service| read_service(service).uuid == *uuid)
            .cloned()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.get(uuid).is_some()
    }

    pub fn uuids(&self) -> Vec<Uuid> {
        self.services.iter().map(|s| read_service(s).uuid).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedService> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Highest end handle of all services, 0 when empty
    pub fn last_handle(&self) -> AttributeHandle {
        self.services
            .iter()
            .map(|s| read_service(s).end_handle)
            .max()
            .unwrap_or(0)
    }

    /// Service whose handle range contains `handle`
    pub fn service_for_handle(&self, handle: AttributeHandle) -> Option<SharedService> {
        self.services
            .iter()
            .find(|service| read_service(service).contains_handle(handle))
            .cloned()
    }

    /// Characteristic owning `handle`: an exact declaration match, or the closest
    /// declaration below it (value and descriptor handles).
    pub fn characteristic_for_handle(&self, handle: AttributeHandle) -> Option<CharacteristicRef> {
        let service = self.service_for_handle(handle)?;
        let char_handle = {
            let data = read_service(&service);
            if data.characteristic_list.contains_key(&handle) {
                handle
            } else {
                *data.characteristic_list.range(..=handle).next_back()?.0
            }
        };
        Some(CharacteristicRef::new(service, char_handle))
    }

    /// Descriptor registered at exactly `handle`
    pub fn descriptor_for_handle(&self, handle: AttributeHandle) -> Option<DescriptorRef> {
        let characteristic = self.characteristic_for_handle(handle)?;
        let known = {
            let data = read_service(characteristic.service());
            data.characteristic_list
                .get(&characteristic.handle())
                .map(|c| c.descriptor_list.contains_key(&handle))
                .unwrap_or(false)
        };
        known.then(|| DescriptorRef::new(characteristic.service().clone(), characteristic.handle(), handle))
    }

    pub fn update_value_of_characteristic(
        &self,
        char_handle: AttributeHandle,
        value: &[u8],
        append: bool,
    ) -> usize {
        match self.service_for_handle(char_handle) {
            Some(service) => update_characteristic_value(&service, char_handle, value, append),
            None => 0,
        }
    }

    pub fn update_value_of_descriptor(
        &self,
        char_handle: AttributeHandle,
        desc_handle: AttributeHandle,
        value: &[u8],
        append: bool,
    ) -> usize {
        match self.service_for_handle(desc_handle) {
            Some(service) => update_descriptor_value(&service, char_handle, desc_handle, value, append),
            None => 0,
        }
    }

    /// Marks every service invalid and forgets them. The invalidated services are
    /// returned so callers can notify their observers.
    pub fn invalidate_services(&mut self) -> Vec<SharedService> {
        let services = std::mem::take(&mut self.services);
        for service in &services {
            write_service(service).state = ServiceState::InvalidService;
        }
        services
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
