//! Linux BLE advertising implementation using bluer (BlueZ)

use std::time::Duration;

use tracing::info;

use crate::error::{BleError, Result};

use super::{AdvertisingData, AdvertisingParameters, Advertiser, Discoverability};

// ----------------------------------------------------------------------------
// Linux Implementation
// ----------------------------------------------------------------------------

pub struct LinuxAdvertiser {
    adapter_name: Option<String>,
    session: Option<bluer::Session>,
    adapter: Option<bluer::Adapter>,
    advertisement_handle: Option<bluer::adv::AdvertisementHandle>,
}

impl LinuxAdvertiser {
    pub fn new(adapter_name: Option<String>) -> Self {
        Self {
            adapter_name,
            session: None,
            adapter: None,
            advertisement_handle: None,
        }
    }

    async fn initialize(&mut self) -> Result<bluer::Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let session = bluer::Session::new().await?;
        let adapter = match &self.adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };

        // Enable adapter if needed
        if !adapter.is_powered().await.unwrap_or(false) {
            adapter
                .set_powered(true)
                .await
                .map_err(|e| BleError::AdvertisingFailed(format!("Failed to power on adapter: {}", e)))?;
        }

        info!("Linux BLE adapter {} initialized for advertising", adapter.name());
        self.session = Some(session);
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }
}

#[async_trait::async_trait]
impl Advertiser for LinuxAdvertiser {
    async fn start_advertising(
        &mut self,
        params: &AdvertisingParameters,
        data: &AdvertisingData,
        scan_response: &AdvertisingData,
    ) -> Result<()> {
        let adapter = self.initialize().await?;
        // BlueZ assembles advertising and scan response payloads itself
        let data = data.merged_with(scan_response);

        let mut system_includes = std::collections::BTreeSet::new();
        if data.include_tx_power {
            system_includes.insert(bluer::adv::Feature::TxPower);
        }

        let advertisement = bluer::adv::Advertisement {
            advertisement_type: if params.mode.is_connectable() {
                bluer::adv::Type::Peripheral
            } else {
                bluer::adv::Type::Broadcast
            },
            local_name: data.local_name.clone(),
            service_uuids: data.service_uuids.iter().copied().collect(),
            manufacturer_data: data.manufacturer_data.clone(),
            discoverable: Some(data.discoverability != Discoverability::None),
            system_includes,
            min_interval: Some(Duration::from_millis(u64::from(params.min_interval_ms))),
            max_interval: Some(Duration::from_millis(u64::from(params.max_interval_ms))),
            ..Default::default()
        };

        let handle = adapter
            .advertise(advertisement)
            .await
            .map_err(|e| BleError::AdvertisingFailed(e.to_string()))?;
        self.advertisement_handle = Some(handle);

        info!(
            "Started BLE advertising as '{}'",
            data.local_name.as_deref().unwrap_or("<unnamed>")
        );
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        if let Some(handle) = self.advertisement_handle.take() {
            drop(handle); // Dropping the handle stops advertising
            info!("Stopped BLE advertising");
        }
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.advertisement_handle.is_some()
    }
}
