//! BLE device scanning using btleplug

use std::time::Duration;

use btleplug::api::{BDAddr, Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use gattkit_core::BluetoothAddress;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::error::{BleError, Result};

// ----------------------------------------------------------------------------
// Scan Results
// ----------------------------------------------------------------------------

/// A device seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub address: BluetoothAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
}

pub(crate) fn to_bd_addr(address: BluetoothAddress) -> BDAddr {
    BDAddr::from(address.0)
}

pub(crate) fn from_bd_addr(address: BDAddr) -> BluetoothAddress {
    BluetoothAddress(address.into_inner())
}

// ----------------------------------------------------------------------------
// Scanner
// ----------------------------------------------------------------------------

/// Finds remote devices through the host Bluetooth stack
pub struct DeviceScanner {
    config: ControllerConfig,
    adapter: Option<Adapter>,
}

impl DeviceScanner {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config, adapter: None }
    }

    /// Initialize BLE adapter, the configured one or the first available
    pub async fn initialize_adapter(&mut self) -> Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;

        let adapter = match &self.config.adapter {
            Some(name) => {
                let mut selected = None;
                for adapter in adapters {
                    if adapter.adapter_info().await.map(|info| info.contains(name.as_str())).unwrap_or(false) {
                        selected = Some(adapter);
                        break;
                    }
                }
                selected
            }
            None => adapters.into_iter().next(),
        }
        .ok_or(BleError::AdapterNotAvailable)?;

        info!("BLE adapter initialized: {}", adapter.adapter_info().await.unwrap_or_default());
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    /// Scan for `duration` and report every device seen. An empty `services` list
    /// disables filtering.
    pub async fn scan(&mut self, duration: Duration, services: Vec<Uuid>) -> Result<Vec<DiscoveredDevice>> {
        let adapter = self.initialize_adapter().await?;
        adapter.start_scan(ScanFilter { services }).await?;
        sleep(duration).await;
        adapter.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in adapter.peripherals().await? {
            let properties = peripheral.properties().await?.unwrap_or_default();
            devices.push(DiscoveredDevice {
                address: from_bd_addr(peripheral.address()),
                name: properties.local_name,
                rssi: properties.rssi,
                services: properties.services,
            });
        }
        debug!("Scan found {} devices", devices.len());
        Ok(devices)
    }

    /// Scan until the device with `address` shows up or `timeout` expires
    pub async fn find_peripheral(&mut self, address: BluetoothAddress, timeout: Duration) -> Result<Peripheral> {
        let adapter = self.initialize_adapter().await?;
        let wanted = to_bd_addr(address);
        let deadline = Instant::now() + timeout;

        adapter.start_scan(ScanFilter::default()).await?;
        let found = loop {
            let peripherals = adapter.peripherals().await?;
            if let Some(peripheral) = peripherals.into_iter().find(|p| p.address() == wanted) {
                break Some(peripheral);
            }
            if Instant::now() >= deadline {
                break None;
            }
            sleep(self.config.scan_interval).await;
        };
        if let Err(e) = adapter.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }

        found.ok_or(BleError::DeviceNotFound {
            address: address.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_conversion_keeps_byte_order() {
        let address: BluetoothAddress = "00:1A:7D:DA:71:13".parse().unwrap();
        let bd = to_bd_addr(address);
        assert_eq!(bd.into_inner(), [0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
        assert_eq!(from_bd_addr(bd), address);
    }
}
