//! Controller configuration

use std::time::Duration;

use gattkit_core::att::{DEFAULT_MTU, MAX_MTU};
use gattkit_core::{AddressType, DiscoveryMode};

use crate::error::{BleError, Result};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for a [`LowEnergyController`](crate::LowEnergyController)
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ControllerConfig {
    /// Maximum time to wait for the link to come up
    pub connection_timeout: Duration,
    /// ATT transaction timeout
    pub request_timeout: Duration,
    /// MTU offered during MTU exchange
    pub preferred_mtu: u16,
    /// Default mode for service detail discovery
    pub discovery_mode: DiscoveryMode,
    /// Capacity of the controller and service event channels
    pub event_buffer_size: usize,
    /// Local adapter to use, the default adapter when unset
    pub adapter: Option<String>,
    /// Address type of the remote device
    pub remote_address_type: AddressType,
    /// How often scan results are polled while looking for a device
    pub scan_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            preferred_mtu: MAX_MTU,
            discovery_mode: DiscoveryMode::FullDiscovery,
            event_buffer_size: 256,
            adapter: None,
            remote_address_type: AddressType::Public,
            scan_interval: Duration::from_millis(500),
        }
    }
}

impl ControllerConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set ATT request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the MTU offered to the remote device
    pub fn with_preferred_mtu(mut self, mtu: u16) -> Self {
        self.preferred_mtu = mtu;
        self
    }

    /// Set default discovery mode
    pub fn with_discovery_mode(mut self, mode: DiscoveryMode) -> Self {
        self.discovery_mode = mode;
        self
    }

    /// Set event channel capacity
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Select a local adapter by name
    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    /// Set the remote address type
    pub fn with_remote_address_type(mut self, address_type: AddressType) -> Self {
        self.remote_address_type = address_type;
        self
    }

    /// Set scan polling interval
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !(DEFAULT_MTU..=MAX_MTU).contains(&self.preferred_mtu) {
            return Err(BleError::InvalidConfiguration(format!(
                "preferred_mtu {} outside {}..={}",
                self.preferred_mtu, DEFAULT_MTU, MAX_MTU
            )));
        }
        if self.event_buffer_size == 0 {
            return Err(BleError::InvalidConfiguration(
                "event_buffer_size must be positive".to_string(),
            ));
        }
        if self.request_timeout.is_zero() || self.connection_timeout.is_zero() {
            return Err(BleError::InvalidConfiguration("timeouts must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.preferred_mtu, 517);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_and_validation() {
        let config = ControllerConfig::new()
            .with_preferred_mtu(185)
            .with_adapter("hci1")
            .with_remote_address_type(AddressType::Random)
            .with_discovery_mode(DiscoveryMode::SkipValueDiscovery);
        assert!(config.validate().is_ok());
        assert_eq!(config.adapter.as_deref(), Some("hci1"));

        assert!(ControllerConfig::new().with_preferred_mtu(22).validate().is_err());
        assert!(ControllerConfig::new().with_preferred_mtu(518).validate().is_err());
        assert!(ControllerConfig::new().with_event_buffer_size(0).validate().is_err());
    }
}
