//! Definitions of services hosted by this device in the peripheral role

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{GattError, Result};
use crate::gatt::ClientConfiguration;
use crate::types::CharacteristicProperties;
use crate::uuids;

/// Largest value an attribute may hold
pub const MAX_ATTRIBUTE_VALUE_LENGTH: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDescriptorDefinition {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

impl LocalDescriptorDefinition {
    pub fn new(uuid: Uuid, value: Vec<u8>) -> Self {
        Self { uuid, value }
    }

    /// A client characteristic configuration descriptor with everything disabled
    pub fn client_configuration() -> Self {
        Self::new(
            uuids::CLIENT_CHARACTERISTIC_CONFIGURATION,
            ClientConfiguration::empty().to_value(),
        )
    }

    pub fn user_description(text: &str) -> Self {
        Self::new(uuids::CHARACTERISTIC_USER_DESCRIPTION, text.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value: Vec<u8>,
    pub descriptors: Vec<LocalDescriptorDefinition>,
}

impl LocalCharacteristicDefinition {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            value: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_descriptor(mut self, descriptor: LocalDescriptorDefinition) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Descriptors as they will be registered. Notifying or indicating
    /// characteristics always get a client characteristic configuration descriptor.
    pub fn effective_descriptors(&self) -> Vec<LocalDescriptorDefinition> {
        let mut descriptors = self.descriptors.clone();
        let has_cccd = descriptors
            .iter()
            .any(|d| d.uuid == uuids::CLIENT_CHARACTERISTIC_CONFIGURATION);
        if self.properties.needs_client_configuration() && !has_cccd {
            descriptors.push(LocalDescriptorDefinition::client_configuration());
        }
        descriptors
    }

    /// Declaration + value + descriptors
    pub fn handle_count(&self) -> usize {
        2 + self.effective_descriptors().len()
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(GattError::InvalidDefinition { reason });

        if uuids::is_declaration(&self.uuid) {
            return invalid(format!("characteristic uses declaration type {}", self.uuid));
        }
        if self.properties.contains(CharacteristicProperties::WRITE_SIGNED) {
            return invalid(format!("characteristic {} requests signed writes", self.uuid));
        }
        if self.value.len() > MAX_ATTRIBUTE_VALUE_LENGTH {
            return invalid(format!("value of {} exceeds {} bytes", self.uuid, MAX_ATTRIBUTE_VALUE_LENGTH));
        }

        let mut cccd_count = 0;
        for descriptor in &self.descriptors {
            if uuids::is_declaration(&descriptor.uuid) {
                return invalid(format!("descriptor uses declaration type {}", descriptor.uuid));
            }
            if descriptor.uuid == uuids::CLIENT_CHARACTERISTIC_CONFIGURATION {
                cccd_count += 1;
                if descriptor.value.len() != 2 {
                    return invalid(format!("client configuration of {} must be 2 bytes", self.uuid));
                }
            }
            if descriptor.value.len() > MAX_ATTRIBUTE_VALUE_LENGTH {
                return invalid(format!("descriptor {} value too long", descriptor.uuid));
            }
        }
        if cccd_count > 1 {
            return invalid(format!("characteristic {} has {} client configurations", self.uuid, cccd_count));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalServiceDefinition {
    pub uuid: Uuid,
    pub primary: bool,
    /// Already registered local services this one includes
    pub included_services: Vec<Uuid>,
    pub characteristics: Vec<LocalCharacteristicDefinition>,
}

impl LocalServiceDefinition {
    pub fn primary(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            included_services: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(uuid: Uuid) -> Self {
        Self {
            primary: false,
            ..Self::primary(uuid)
        }
    }

    pub fn with_included_service(mut self, uuid: Uuid) -> Self {
        self.included_services.push(uuid);
        self
    }

    pub fn with_characteristic(mut self, characteristic: LocalCharacteristicDefinition) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Number of attribute handles the service occupies
    pub fn handle_count(&self) -> usize {
        1 + self.included_services.len()
            + self
                .characteristics
                .iter()
                .map(LocalCharacteristicDefinition::handle_count)
                .sum::<usize>()
    }

    pub fn validate(&self) -> Result<()> {
        if uuids::is_declaration(&self.uuid) {
            return Err(GattError::InvalidDefinition {
                reason: format!("service uses declaration type {}", self.uuid),
            });
        }
        if self.included_services.contains(&self.uuid) {
            return Err(GattError::InvalidDefinition {
                reason: format!("service {} includes itself", self.uuid),
            });
        }
        self.characteristics
            .iter()
            .try_for_each(LocalCharacteristicDefinition::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_adds_client_configuration() {
        let characteristic = LocalCharacteristicDefinition::new(
            uuids::BATTERY_LEVEL,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
        );
        let descriptors = characteristic.effective_descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].uuid, uuids::CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert_eq!(descriptors[0].value, vec![0, 0]);
        assert_eq!(characteristic.handle_count(), 3);
    }

    #[test]
    fn test_explicit_client_configuration_is_kept() {
        let characteristic = LocalCharacteristicDefinition::new(uuids::BATTERY_LEVEL, CharacteristicProperties::INDICATE)
            .with_descriptor(LocalDescriptorDefinition::new(
                uuids::CLIENT_CHARACTERISTIC_CONFIGURATION,
                vec![2, 0],
            ));
        assert_eq!(characteristic.effective_descriptors().len(), 1);
        assert_eq!(characteristic.effective_descriptors()[0].value, vec![2, 0]);
    }

    #[test]
    fn test_service_handle_count() {
        let service = LocalServiceDefinition::primary(uuids::BATTERY_SERVICE)
            .with_included_service(uuids::DEVICE_INFORMATION)
            .with_characteristic(LocalCharacteristicDefinition::new(
                uuids::BATTERY_LEVEL,
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            ))
            .with_characteristic(LocalCharacteristicDefinition::new(
                uuids::DEVICE_NAME,
                CharacteristicProperties::READ,
            ));
        // declaration + include + (3) + (2)
        assert_eq!(service.handle_count(), 7);
        assert!(service.validate().is_ok());
    }

    #[test]
    fn test_invalid_definitions() {
        let declaration_typed = LocalServiceDefinition::primary(uuids::BATTERY_SERVICE)
            .with_characteristic(LocalCharacteristicDefinition::new(uuids::CHARACTERISTIC, CharacteristicProperties::READ));
        assert!(matches!(declaration_typed.validate(), Err(GattError::InvalidDefinition { .. })));

        let bad_cccd = LocalServiceDefinition::primary(uuids::BATTERY_SERVICE).with_characteristic(
            LocalCharacteristicDefinition::new(uuids::BATTERY_LEVEL, CharacteristicProperties::NOTIFY)
                .with_descriptor(LocalDescriptorDefinition::new(
                    uuids::CLIENT_CHARACTERISTIC_CONFIGURATION,
                    vec![1],
                )),
        );
        assert!(bad_cccd.validate().is_err());

        let self_include = LocalServiceDefinition::primary(uuids::BATTERY_SERVICE).with_included_service(uuids::BATTERY_SERVICE);
        assert!(self_include.validate().is_err());
    }
}
