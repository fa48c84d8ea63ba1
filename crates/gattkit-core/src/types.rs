//! Basic types shared by every gattkit crate
//!
//! Attribute handles, device addresses, roles, controller/service states and the
//! flag sets used by the GATT data model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::GattError;

// ----------------------------------------------------------------------------
// Attribute Handles
// ----------------------------------------------------------------------------

/// 16-bit attribute handle. `0x0000` is reserved and never assigned.
pub type AttributeHandle = u16;

/// Lowest handle a GATT server may assign
pub const FIRST_ATTRIBUTE_HANDLE: AttributeHandle = 0x0001;

/// Highest handle a GATT server may assign
pub const LAST_ATTRIBUTE_HANDLE: AttributeHandle = 0xFFFF;

// ----------------------------------------------------------------------------
// Device Addresses
// ----------------------------------------------------------------------------

/// Bluetooth device address, most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BluetoothAddress(pub [u8; 6]);

impl BluetoothAddress {
    pub const ANY: BluetoothAddress = BluetoothAddress([0; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for BluetoothAddress {
    type Err = GattError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GattError::InvalidAddress(s.to_string());
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for BluetoothAddress {
    type Error = GattError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BluetoothAddress> for String {
    fn from(address: BluetoothAddress) -> Self {
        address.to_string()
    }
}

/// Kind of LE address the remote device uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

/// Role the local device plays on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Central,
    Peripheral,
}

// ----------------------------------------------------------------------------
// Controller and Service States
// ----------------------------------------------------------------------------

/// Connection lifecycle of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControllerState {
    #[default]
    Unconnected,
    Connecting,
    Connected,
    Discovering,
    Discovered,
    Closing,
    Advertising,
}

impl ControllerState {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerState::Unconnected => "Unconnected",
            ControllerState::Connecting => "Connecting",
            ControllerState::Connected => "Connected",
            ControllerState::Discovering => "Discovering",
            ControllerState::Discovered => "Discovered",
            ControllerState::Closing => "Closing",
            ControllerState::Advertising => "Advertising",
        }
    }

    /// True while a link to the remote device exists
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            ControllerState::Connected | ControllerState::Discovering | ControllerState::Discovered
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a single service object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServiceState {
    /// The service was invalidated by a disconnect and can never be used again
    #[default]
    InvalidService,
    /// Found during service discovery; details not yet known
    RemoteService,
    RemoteServiceDiscovering,
    RemoteServiceDiscovered,
    /// Hosted by this device in the peripheral role
    LocalService,
}

/// How much work detail discovery does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiscoveryMode {
    /// Read every readable characteristic value and every descriptor value
    #[default]
    FullDiscovery,
    /// Only discover the attribute layout
    SkipValueDiscovery,
}

/// Write procedure used for a characteristic write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteMode {
    #[default]
    WithResponse,
    WithoutResponse,
    Signed,
}

// ----------------------------------------------------------------------------
// Flag Sets
// ----------------------------------------------------------------------------

bitflags::bitflags! {
    /// How a service was found
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ServiceTypes: u8 {
        const PRIMARY_SERVICE = 0x01;
        const INCLUDED_SERVICE = 0x02;
    }
}

bitflags::bitflags! {
    /// Characteristic properties as carried in the characteristic declaration
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CharacteristicProperties: u8 {
        const BROADCASTING = 0x01;
        const READ = 0x02;
        const WRITE_NO_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const WRITE_SIGNED = 0x40;
        const EXTENDED_PROPERTY = 0x80;
    }
}

impl CharacteristicProperties {
    /// Whether the characteristic needs a client characteristic configuration descriptor
    pub fn needs_client_configuration(&self) -> bool {
        self.intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE)
    }
}

// ----------------------------------------------------------------------------
// Connection Parameters
// ----------------------------------------------------------------------------

/// LE connection parameters in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    pub min_interval_ms: f64,
    pub max_interval_ms: f64,
    pub latency: u16,
    pub supervision_timeout_ms: u32,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            min_interval_ms: 7.5,
            max_interval_ms: 4000.0,
            latency: 0,
            supervision_timeout_ms: 32000,
        }
    }
}

impl ConnectionParameters {
    pub fn new(min_interval_ms: f64, max_interval_ms: f64, latency: u16, supervision_timeout_ms: u32) -> Self {
        Self {
            min_interval_ms,
            max_interval_ms,
            latency,
            supervision_timeout_ms,
        }
    }

    /// Checks the ranges from Core Vol 6 Part B §4.5.1
    pub fn is_valid(&self) -> bool {
        let interval_ok = |ms: f64| (7.5..=4000.0).contains(&ms);
        if !interval_ok(self.min_interval_ms) || !interval_ok(self.max_interval_ms) {
            return false;
        }
        if self.min_interval_ms > self.max_interval_ms || self.latency > 499 {
            return false;
        }
        if !(100..=32000).contains(&self.supervision_timeout_ms) {
            return false;
        }
        // Supervision timeout must outlast (1 + latency) * max_interval * 2
        let minimum_timeout = (1.0 + f64::from(self.latency)) * self.max_interval_ms * 2.0;
        f64::from(self.supervision_timeout_ms) > minimum_timeout
    }

    /// Interval range in controller units of 1.25 ms
    pub fn interval_units(&self) -> (u16, u16) {
        (
            (self.min_interval_ms / 1.25).round() as u16,
            (self.max_interval_ms / 1.25).round() as u16,
        )
    }

    /// Supervision timeout in controller units of 10 ms
    pub fn supervision_timeout_units(&self) -> u16 {
        (self.supervision_timeout_ms / 10) as u16
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parsing_and_display() {
        let address: BluetoothAddress = "00:1A:7D:DA:71:13".parse().unwrap();
        assert_eq!(address.0, [0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
        assert_eq!(address.to_string(), "00:1A:7D:DA:71:13");
        assert!(!address.is_null());
        assert!(BluetoothAddress::ANY.is_null());
    }

    #[test]
    fn test_address_rejects_malformed_input() {
        assert!("00:1A:7D:DA:71".parse::<BluetoothAddress>().is_err());
        assert!("00:1A:7D:DA:71:13:44".parse::<BluetoothAddress>().is_err());
        assert!("001A:7D:DA:71:13:44".parse::<BluetoothAddress>().is_err());
        assert!("ZZ:1A:7D:DA:71:13".parse::<BluetoothAddress>().is_err());
    }

    #[test]
    fn test_connection_parameter_validation() {
        let params = ConnectionParameters::new(7.5, 30.0, 0, 2000);
        assert!(params.is_valid());
        assert_eq!(params.interval_units(), (6, 24));
        assert_eq!(params.supervision_timeout_units(), 200);

        // max interval below min interval
        assert!(!ConnectionParameters::new(50.0, 30.0, 0, 2000).is_valid());
        // supervision timeout too short for the latency
        assert!(!ConnectionParameters::new(7.5, 100.0, 10, 1000).is_valid());
    }

    #[test]
    fn test_linked_states() {
        assert!(ControllerState::Discovered.is_linked());
        assert!(!ControllerState::Closing.is_linked());
        assert!(!ControllerState::Advertising.is_linked());
    }
}
