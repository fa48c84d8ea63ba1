//! Cross-platform advertising trait and platform detection

pub mod data;
pub mod fallback;
#[cfg(target_os = "linux")]
pub mod linux;

pub use data::{AdvertisingData, AdvertisingMode, AdvertisingParameters, Discoverability};
pub use fallback::FallbackAdvertiser;
#[cfg(target_os = "linux")]
pub use linux::LinuxAdvertiser;

use crate::error::Result;

// ----------------------------------------------------------------------------
// Cross-platform Advertising Trait
// ----------------------------------------------------------------------------

/// BLE advertising across platforms
#[async_trait::async_trait]
pub trait Advertiser: Send + Sync {
    /// Start advertising `data`, answering scan requests with `scan_response`
    async fn start_advertising(
        &mut self,
        params: &AdvertisingParameters,
        data: &AdvertisingData,
        scan_response: &AdvertisingData,
    ) -> Result<()>;

    /// Stop advertising
    async fn stop_advertising(&mut self) -> Result<()>;

    /// Check if currently advertising
    fn is_advertising(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Platform Detection and Factory
// ----------------------------------------------------------------------------

/// Platform-specific advertiser
pub enum PlatformAdvertiser {
    #[cfg(target_os = "linux")]
    Linux(linux::LinuxAdvertiser),
    #[allow(dead_code)]
    Fallback(fallback::FallbackAdvertiser),
}

impl PlatformAdvertiser {
    /// Create the appropriate advertiser for the current platform
    pub fn new(adapter: Option<String>) -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Linux(linux::LinuxAdvertiser::new(adapter))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = adapter;
            Self::Fallback(fallback::FallbackAdvertiser::new())
        }
    }
}

impl Default for PlatformAdvertiser {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait::async_trait]
impl Advertiser for PlatformAdvertiser {
    async fn start_advertising(
        &mut self,
        params: &AdvertisingParameters,
        data: &AdvertisingData,
        scan_response: &AdvertisingData,
    ) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref mut advertiser) => advertiser.start_advertising(params, data, scan_response).await,
            Self::Fallback(ref mut advertiser) => advertiser.start_advertising(params, data, scan_response).await,
        }
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref mut advertiser) => advertiser.stop_advertising().await,
            Self::Fallback(ref mut advertiser) => advertiser.stop_advertising().await,
        }
    }

    fn is_advertising(&self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref advertiser) => advertiser.is_advertising(),
            Self::Fallback(ref advertiser) => advertiser.is_advertising(),
        }
    }
}
