//! Sequential attribute handle allocation for local services

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::{GattError, Result, ServiceError};
use crate::gatt::{CharacteristicData, DescriptorData, ServiceData};
use crate::local::LocalServiceDefinition;
use crate::registry::ServiceRegistry;
use crate::types::{AttributeHandle, DiscoveryMode, ServiceState, ServiceTypes, FIRST_ATTRIBUTE_HANDLE};

/// Hands out attribute handles in GATT order, starting at 0x0001
#[derive(Debug, Clone)]
pub struct HandleAllocator {
    /// Next free handle; 0x10000 once the space is used up
    next: u32,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self {
            next: u32::from(FIRST_ATTRIBUTE_HANDLE),
        }
    }
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next handle that would be assigned
    pub fn next_handle(&self) -> Option<AttributeHandle> {
        AttributeHandle::try_from(self.next).ok()
    }

    /// Handles still available
    pub fn remaining(&self) -> usize {
        (0x1_0000 - self.next) as usize
    }

    /// Lays out `definition` in the handle space. Included services must already be
    /// registered in `registered`. On failure no handle is consumed.
    pub fn allocate(&mut self, definition: &LocalServiceDefinition, registered: &ServiceRegistry) -> Result<ServiceData> {
        definition.validate()?;
        for included in &definition.included_services {
            if !registered.contains(included) {
                return Err(GattError::UnknownIncludedService { uuid: *included });
            }
        }

        let required = definition.handle_count();
        if required > self.remaining() {
            return Err(GattError::HandleSpaceExhausted {
                last: self.next.saturating_sub(1) as AttributeHandle,
                required,
            });
        }

        // Fits, so every handle below stays within u16
        let mut handle = self.next as AttributeHandle;
        let start_handle = handle;
        handle += definition.included_services.len() as AttributeHandle;

        let mut characteristic_list = BTreeMap::new();
        for characteristic in &definition.characteristics {
            let declaration = handle + 1;
            let mut data = CharacteristicData::new(characteristic.uuid, characteristic.properties, declaration + 1);
            data.value = characteristic.value.clone();
            handle = declaration + 1;
            for descriptor in characteristic.effective_descriptors() {
                handle += 1;
                data.descriptor_list
                    .insert(handle, DescriptorData::new(descriptor.uuid, descriptor.value));
            }
            characteristic_list.insert(declaration, data);
        }

        let end_handle = handle;
        self.next = u32::from(end_handle) + 1;
        debug!(
            "Allocated handles 0x{:04X}-0x{:04X} for service {}",
            start_handle, end_handle, definition.uuid
        );

        Ok(ServiceData {
            uuid: definition.uuid,
            start_handle,
            end_handle,
            service_type: if definition.primary {
                ServiceTypes::PRIMARY_SERVICE
            } else {
                ServiceTypes::empty()
            },
            included_services: definition.included_services.clone(),
            state: ServiceState::LocalService,
            last_error: ServiceError::NoError,
            mode: DiscoveryMode::FullDiscovery,
            characteristic_list,
        })
    }
}
