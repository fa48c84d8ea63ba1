//! Advertiser for hosts without an advertising API
//!
//! Keeps track of the requested state so the peripheral backend behaves the same
//! everywhere; nothing goes on air.

use tracing::warn;

use crate::error::Result;

use super::{AdvertisingData, AdvertisingParameters, Advertiser};

// ----------------------------------------------------------------------------
// Fallback Implementation
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FallbackAdvertiser {
    is_advertising: bool,
    last_data: Option<AdvertisingData>,
}

impl FallbackAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload of the last start request
    pub fn last_data(&self) -> Option<&AdvertisingData> {
        self.last_data.as_ref()
    }
}

#[async_trait::async_trait]
impl Advertiser for FallbackAdvertiser {
    async fn start_advertising(
        &mut self,
        _params: &AdvertisingParameters,
        data: &AdvertisingData,
        scan_response: &AdvertisingData,
    ) -> Result<()> {
        let merged = data.merged_with(scan_response);
        warn!(
            "BLE advertising not supported on this platform. Device '{}' will not be discoverable.",
            merged.local_name.as_deref().unwrap_or("<unnamed>")
        );
        self.last_data = Some(merged);
        self.is_advertising = true;
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        self.is_advertising = false;
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.is_advertising
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fallback_tracks_state() {
        let mut advertiser = FallbackAdvertiser::new();
        let data = AdvertisingData::new().with_local_name("sensor");

        advertiser
            .start_advertising(&AdvertisingParameters::default(), &data, &AdvertisingData::new())
            .await
            .unwrap();
        assert!(advertiser.is_advertising());
        assert_eq!(advertiser.last_data().and_then(|d| d.local_name.as_deref()), Some("sensor"));

        advertiser.stop_advertising().await.unwrap();
        assert!(!advertiser.is_advertising());
    }
}
