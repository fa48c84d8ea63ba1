//! Backends that carry GATT operations to a remote device
//!
//! The controller drives exactly one [`GattBackend`]. Central backends talk to a
//! remote GATT server, peripheral backends host the local services. Everything the
//! remote side initiates arrives as a [`BackendEvent`].

pub mod att;
#[cfg(target_os = "linux")]
pub mod bluez;
pub mod central;
pub mod link;
pub mod loopback;
pub mod server;

use std::collections::BTreeMap;

use gattkit_core::{
    AddressType, AttributeHandle, BluetoothAddress, CharacteristicData, ConnectionParameters, ControllerError,
    DiscoveryMode, Role, SharedService, WriteMode,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::advertising::{AdvertisingData, AdvertisingParameters};
use crate::config::ControllerConfig;
use crate::error::{BleError, Result};

pub use att::AttBackend;
pub use central::BtleplugBackend;
pub use link::{AttConnector, AttLink, AttListener};
pub use loopback::{loopback_link, LoopbackConnector, LoopbackListener};
pub use server::AttPeripheralBackend;

// ----------------------------------------------------------------------------
// Backend Data Types
// ----------------------------------------------------------------------------

/// Link details reported once a connection is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub local_address: BluetoothAddress,
    pub mtu: u16,
}

/// A service found by primary service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub start_handle: AttributeHandle,
    pub end_handle: AttributeHandle,
}

/// Result of detail discovery for one service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDetails {
    /// Services this one includes, in declaration order
    pub included_services: Vec<DiscoveredService>,
    /// Characteristics keyed by declaration handle
    pub characteristics: BTreeMap<AttributeHandle, CharacteristicData>,
}

/// Something the remote side or the link did on its own
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// The link went away without a local disconnect request
    LinkLost(ControllerError),
    /// A central connected to the local peripheral
    CentralConnected { remote: BluetoothAddress, mtu: u16 },
    /// Notification or indication received for a remote characteristic value
    ValueChanged {
        handle: AttributeHandle,
        value: Vec<u8>,
        indication: bool,
    },
    /// A remote client wrote a local attribute
    AttributeWritten { handle: AttributeHandle, value: Vec<u8> },
    MtuChanged(u16),
    ConnectionUpdated(ConnectionParameters),
}

// ----------------------------------------------------------------------------
// Backend Trait
// ----------------------------------------------------------------------------

/// Transport for the GATT operations of one controller
///
/// Handles are ATT handles of the remote server (central role) or of the local
/// attribute database (peripheral role). Role specific operations default to
/// [`BleError::Unsupported`].
#[async_trait::async_trait]
pub trait GattBackend: Send {
    fn role(&self) -> Role;

    async fn connect(&mut self, _remote: BluetoothAddress, _address_type: AddressType) -> Result<ConnectionInfo> {
        Err(BleError::Unsupported("connect".to_string()))
    }

    async fn disconnect(&mut self) -> Result<()>;

    async fn discover_services(&mut self) -> Result<Vec<DiscoveredService>> {
        Err(BleError::Unsupported("service discovery".to_string()))
    }

    async fn discover_service_details(
        &mut self,
        _service: &DiscoveredService,
        _mode: DiscoveryMode,
    ) -> Result<ServiceDetails> {
        Err(BleError::Unsupported("service detail discovery".to_string()))
    }

    async fn read_characteristic(&mut self, _value_handle: AttributeHandle) -> Result<Vec<u8>> {
        Err(BleError::Unsupported("characteristic read".to_string()))
    }

    async fn write_characteristic(
        &mut self,
        _value_handle: AttributeHandle,
        _value: &[u8],
        _mode: WriteMode,
    ) -> Result<()> {
        Err(BleError::Unsupported("characteristic write".to_string()))
    }

    async fn read_descriptor(&mut self, _handle: AttributeHandle) -> Result<Vec<u8>> {
        Err(BleError::Unsupported("descriptor read".to_string()))
    }

    async fn write_descriptor(&mut self, _handle: AttributeHandle, _value: &[u8]) -> Result<()> {
        Err(BleError::Unsupported("descriptor write".to_string()))
    }

    async fn start_advertising(
        &mut self,
        _params: &AdvertisingParameters,
        _data: &AdvertisingData,
        _scan_response: &AdvertisingData,
    ) -> Result<()> {
        Err(BleError::Unsupported("advertising".to_string()))
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        Err(BleError::Unsupported("advertising".to_string()))
    }

    async fn request_connection_update(&mut self, _params: &ConnectionParameters) -> Result<()> {
        Err(BleError::Unsupported("connection parameter update".to_string()))
    }

    /// Publish a local service in the attribute database
    async fn add_service(&mut self, _service: SharedService) -> Result<()> {
        Err(BleError::Unsupported("local services".to_string()))
    }

    /// Push the current value of a local characteristic to the subscribed client
    async fn notify(&mut self, _characteristic_handle: AttributeHandle) -> Result<()> {
        Err(BleError::Unsupported("notifications".to_string()))
    }

    /// Event stream of this backend; yields `Some` once
    fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<BackendEvent>>;
}

// ----------------------------------------------------------------------------
// Platform Defaults
// ----------------------------------------------------------------------------

/// Central backend built on the host Bluetooth stack
pub fn default_central_backend(config: &ControllerConfig) -> Box<dyn GattBackend> {
    Box::new(BtleplugBackend::new(config.clone()))
}

/// Central backend speaking ATT directly over an L2CAP socket
#[cfg(target_os = "linux")]
pub fn att_central_backend(config: &ControllerConfig) -> Box<dyn GattBackend> {
    Box::new(AttBackend::new(
        bluez::L2capConnector::new(config.adapter.clone()),
        config.clone(),
    ))
}

/// Peripheral backend for the current platform
pub fn default_peripheral_backend(config: &ControllerConfig) -> Result<Box<dyn GattBackend>> {
    #[cfg(target_os = "linux")]
    {
        let listener = bluez::L2capListener::new(config.adapter.clone());
        let advertiser = crate::advertising::PlatformAdvertiser::new(config.adapter.clone());
        Ok(Box::new(AttPeripheralBackend::new(listener, advertiser)))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(BleError::Unsupported("peripheral role on this platform".to_string()))
    }
}
