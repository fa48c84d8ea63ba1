//! Advertising parameters and payloads

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of advertising PDU to send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdvertisingMode {
    /// Connectable and scannable
    #[default]
    ConnectableUndirected,
    ScannableUndirected,
    NonConnectableUndirected,
}

impl AdvertisingMode {
    pub fn is_connectable(&self) -> bool {
        matches!(self, AdvertisingMode::ConnectableUndirected)
    }
}

/// How the advertisement sets the discoverable flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Discoverability {
    None,
    Limited,
    #[default]
    General,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingParameters {
    pub mode: AdvertisingMode,
    /// Advertising interval range in milliseconds
    pub min_interval_ms: u16,
    pub max_interval_ms: u16,
}

impl Default for AdvertisingParameters {
    fn default() -> Self {
        Self {
            mode: AdvertisingMode::ConnectableUndirected,
            min_interval_ms: 100,
            max_interval_ms: 150,
        }
    }
}

impl AdvertisingParameters {
    pub fn with_mode(mut self, mode: AdvertisingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_interval(mut self, min_ms: u16, max_ms: u16) -> Self {
        self.min_interval_ms = min_ms;
        self.max_interval_ms = max_ms.max(min_ms);
        self
    }
}

/// Advertising or scan response payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdvertisingData {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub include_tx_power: bool,
    pub discoverability: Discoverability,
}

impl AdvertisingData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        if !self.service_uuids.contains(&uuid) {
            self.service_uuids.push(uuid);
        }
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, data);
        self
    }

    pub fn with_tx_power(mut self, include: bool) -> Self {
        self.include_tx_power = include;
        self
    }

    pub fn with_discoverability(mut self, discoverability: Discoverability) -> Self {
        self.discoverability = discoverability;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.local_name.is_none()
            && self.service_uuids.is_empty()
            && self.manufacturer_data.is_empty()
            && !self.include_tx_power
    }

    /// Merges the scan response into the advertisement for stacks that build both
    /// payloads themselves. Fields already set here win.
    pub fn merged_with(&self, scan_response: &AdvertisingData) -> AdvertisingData {
        let mut merged = self.clone();
        if merged.local_name.is_none() {
            merged.local_name = scan_response.local_name.clone();
        }
        for uuid in &scan_response.service_uuids {
            if !merged.service_uuids.contains(uuid) {
                merged.service_uuids.push(*uuid);
            }
        }
        for (company, data) in &scan_response.manufacturer_data {
            merged.manufacturer_data.entry(*company).or_insert_with(|| data.clone());
        }
        merged.include_tx_power |= scan_response.include_tx_power;
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattkit_core::uuids;

    #[test]
    fn test_merge_prefers_advertisement() {
        let advertisement = AdvertisingData::new()
            .with_service(uuids::BATTERY_SERVICE)
            .with_manufacturer_data(0xFFFF, vec![1]);
        let scan_response = AdvertisingData::new()
            .with_local_name("gattkit")
            .with_service(uuids::BATTERY_SERVICE)
            .with_manufacturer_data(0xFFFF, vec![2]);

        let merged = advertisement.merged_with(&scan_response);
        assert_eq!(merged.local_name.as_deref(), Some("gattkit"));
        assert_eq!(merged.service_uuids, vec![uuids::BATTERY_SERVICE]);
        assert_eq!(merged.manufacturer_data[&0xFFFF], vec![1]);
    }

    #[test]
    fn test_interval_is_ordered() {
        let params = AdvertisingParameters::default().with_interval(200, 100);
        assert_eq!((params.min_interval_ms, params.max_interval_ms), (200, 200));
        assert!(params.mode.is_connectable());
        assert!(AdvertisingData::new().is_empty());
    }
}
