//! GATT data model
//!
//! One [`ServiceData`] per service, holding its characteristics keyed by declaration
//! handle, each of which holds its descriptors keyed by handle. Services are shared
//! between every façade that refers to them, see [`SharedService`].

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::types::{
    AttributeHandle, CharacteristicProperties, DiscoveryMode, ServiceState, ServiceTypes,
};
use crate::uuids;

// ----------------------------------------------------------------------------
// Client Characteristic Configuration
// ----------------------------------------------------------------------------

bitflags::bitflags! {
    /// Value of a client characteristic configuration descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ClientConfiguration: u16 {
        const NOTIFICATION = 0x0001;
        const INDICATION = 0x0002;
    }
}

impl ClientConfiguration {
    /// Decodes a descriptor value; anything but exactly two bytes is disabled
    pub fn from_value(value: &[u8]) -> Self {
        match value {
            [lo, hi] => Self::from_bits_truncate(u16::from_le_bytes([*lo, *hi])),
            _ => Self::empty(),
        }
    }

    pub fn to_value(self) -> Vec<u8> {
        self.bits().to_le_bytes().to_vec()
    }
}

// ----------------------------------------------------------------------------
// Attribute Data
// ----------------------------------------------------------------------------

/// Cached state of one descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorData {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

impl DescriptorData {
    pub fn new(uuid: Uuid, value: Vec<u8>) -> Self {
        Self { uuid, value }
    }

    pub fn is_client_configuration(&self) -> bool {
        self.uuid == uuids::CLIENT_CHARACTERISTIC_CONFIGURATION
    }
}

/// Cached state of one characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicData {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// Always declaration handle + 1
    pub value_handle: AttributeHandle,
    pub value: Vec<u8>,
    pub descriptor_list: BTreeMap<AttributeHandle, DescriptorData>,
}

impl CharacteristicData {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties, value_handle: AttributeHandle) -> Self {
        Self {
            uuid,
            properties,
            value_handle,
            value: Vec::new(),
            descriptor_list: BTreeMap::new(),
        }
    }

    /// Handle of the client characteristic configuration descriptor, if present
    pub fn client_configuration_handle(&self) -> Option<AttributeHandle> {
        self.descriptor_list
            .iter()
            .find(|(_, descriptor)| descriptor.is_client_configuration())
            .map(|(handle, _)| *handle)
    }

    pub fn client_configuration(&self) -> ClientConfiguration {
        self.client_configuration_handle()
            .and_then(|handle| self.descriptor_list.get(&handle))
            .map(|descriptor| ClientConfiguration::from_value(&descriptor.value))
            .unwrap_or_default()
    }

    /// Last handle that belongs to this characteristic
    pub fn last_handle(&self) -> AttributeHandle {
        self.descriptor_list
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.value_handle)
    }
}

/// Shared state of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceData {
    pub uuid: Uuid,
    pub start_handle: AttributeHandle,
    pub end_handle: AttributeHandle,
    pub service_type: ServiceTypes,
    /// Included services in declaration order
    pub included_services: Vec<Uuid>,
    pub state: ServiceState,
    pub last_error: ServiceError,
    pub mode: DiscoveryMode,
    pub characteristic_list: BTreeMap<AttributeHandle, CharacteristicData>,
}

impl ServiceData {
    /// A service found by primary service discovery
    pub fn remote(uuid: Uuid, start_handle: AttributeHandle, end_handle: AttributeHandle) -> Self {
        Self {
            uuid,
            start_handle,
            end_handle,
            service_type: ServiceTypes::PRIMARY_SERVICE,
            included_services: Vec::new(),
            state: ServiceState::RemoteService,
            last_error: ServiceError::NoError,
            mode: DiscoveryMode::default(),
            characteristic_list: BTreeMap::new(),
        }
    }

    pub fn contains_handle(&self, handle: AttributeHandle) -> bool {
        self.start_handle <= handle && handle <= self.end_handle
    }

    /// Declaration handle of the first characteristic with `uuid`
    pub fn characteristic_handle(&self, uuid: &Uuid) -> Option<AttributeHandle> {
        self.characteristic_list
            .iter()
            .find(|(_, characteristic)| characteristic.uuid == *uuid)
            .map(|(handle, _)| *handle)
    }

    /// Declaration handle of the characteristic whose value lives at `value_handle`
    pub fn characteristic_by_value_handle(&self, value_handle: AttributeHandle) -> Option<AttributeHandle> {
        self.characteristic_list
            .iter()
            .find(|(_, characteristic)| characteristic.value_handle == value_handle)
            .map(|(handle, _)| *handle)
    }
}

// ----------------------------------------------------------------------------
// Shared Ownership
// ----------------------------------------------------------------------------

/// Service data shared by the controller and all façades of one service
pub type SharedService = Arc<RwLock<ServiceData>>;

/// Wraps service data for sharing
pub fn share(data: ServiceData) -> SharedService {
    Arc::new(RwLock::new(data))
}

/// Read access that survives a poisoned lock
pub fn read_service(service: &SharedService) -> RwLockReadGuard<'_, ServiceData> {
    service.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write access that survives a poisoned lock
pub fn write_service(service: &SharedService) -> RwLockWriteGuard<'_, ServiceData> {
    service.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_configuration_decoding() {
        assert_eq!(
            ClientConfiguration::from_value(&[0x01, 0x00]),
            ClientConfiguration::NOTIFICATION
        );
        assert_eq!(
            ClientConfiguration::from_value(&[0x03, 0x00]),
            ClientConfiguration::NOTIFICATION | ClientConfiguration::INDICATION
        );
        assert!(ClientConfiguration::from_value(&[0x01]).is_empty());
        assert_eq!(ClientConfiguration::INDICATION.to_value(), vec![0x02, 0x00]);
    }

    #[test]
    fn test_characteristic_last_handle() {
        let mut characteristic =
            CharacteristicData::new(uuids::BATTERY_LEVEL, CharacteristicProperties::READ, 13);
        assert_eq!(characteristic.last_handle(), 13);

        characteristic.descriptor_list.insert(
            14,
            DescriptorData::new(uuids::CLIENT_CHARACTERISTIC_CONFIGURATION, vec![1, 0]),
        );
        assert_eq!(characteristic.last_handle(), 14);
        assert_eq!(characteristic.client_configuration_handle(), Some(14));
        assert_eq!(
            characteristic.client_configuration(),
            ClientConfiguration::NOTIFICATION
        );
    }
}
