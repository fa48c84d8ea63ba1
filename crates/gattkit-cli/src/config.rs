//! gattkit CLI configuration
//!
//! Configuration is layered with figment, lowest priority first:
//! - Default values
//! - Configuration file (`gattkit.toml` in the working directory, or `--config`)
//! - Environment variables (`GATTKIT_*`, nested keys separated by `__`,
//!   e.g. `GATTKIT_CONTROLLER__PREFERRED_MTU=185`)
//! - Command line arguments

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use gattkit_ble::ControllerConfig;

/// File read when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "gattkit.toml";

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "GATTKIT_";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Central backend used for client commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The host Bluetooth stack through btleplug
    #[default]
    Native,
    /// ATT spoken directly over the L2CAP fixed channel (Linux)
    Att,
}

/// Complete configuration for the gattkit CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliAppConfig {
    /// Controller settings shared by every command
    pub controller: ControllerConfig,

    /// CLI-specific settings
    pub cli: CliConfig,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Enable verbose logging output
    pub verbose: bool,

    /// Backend for central commands
    pub backend: BackendKind,

    /// Default scan duration in seconds
    pub scan_timeout_secs: u64,

    /// Print results as JSON instead of text
    pub json_output: bool,

    /// Seconds between simulated battery updates in `serve`
    pub serve_update_interval_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            backend: BackendKind::Native,
            scan_timeout_secs: 5,
            json_output: false,
            serve_update_interval_secs: 5,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliAppConfig {
    fn base_figment(config_file: Option<&Path>) -> Figment {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from defaults, the configuration file and the environment
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::extract(Self::base_figment(config_file))
    }

    /// Load configuration with command line overrides on top
    pub fn load_with_overrides(
        config_file: Option<&Path>,
        verbose: Option<bool>,
        backend: Option<BackendKind>,
        adapter: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut figment = Self::base_figment(config_file);

        if let Some(v) = verbose {
            figment = figment.merge(("cli.verbose", v));
        }
        if let Some(b) = backend {
            figment = figment.merge(("cli.backend", b));
        }
        if let Some(a) = adapter {
            figment = figment.merge(("controller.adapter", a));
        }

        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: CliAppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.cli.scan_timeout_secs == 0 {
            return Err(ConfigError::Validation("Scan timeout must be greater than 0".to_string()));
        }
        if self.cli.serve_update_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "Serve update interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::FileSystem(format!("Failed to create config directory: {}", e)))?;
            }
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), toml_string)
            .map_err(|e| ConfigError::FileSystem(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&CliAppConfig::default())
            .unwrap_or_else(|_| "# Failed to generate example config".to_string())
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config_creation() {
        let config = CliAppConfig::default();
        assert!(!config.cli.verbose);
        assert_eq!(config.cli.backend, BackendKind::Native);
        assert_eq!(config.controller, ControllerConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CliAppConfig::default();
        config.controller.preferred_mtu = 10;
        assert!(config.validate().is_err());

        let mut config = CliAppConfig::default();
        config.cli.scan_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_env_and_override_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [controller]
                preferred_mtu = 185

                [cli]
                backend = "att"
                scan_timeout_secs = 9
                "#,
            )?;
            jail.set_env("GATTKIT_CLI__SCAN_TIMEOUT_SECS", "3");

            let config = CliAppConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.controller.preferred_mtu, 185);
            assert_eq!(config.cli.backend, BackendKind::Att);
            assert_eq!(config.cli.scan_timeout_secs, 3);

            let config =
                CliAppConfig::load_with_overrides(None, Some(true), Some(BackendKind::Native), Some("hci1".into()))
                    .map_err(|e| e.to_string())?;
            assert!(config.cli.verbose);
            assert_eq!(config.cli.backend, BackendKind::Native);
            assert_eq!(config.controller.adapter.as_deref(), Some("hci1"));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[controller]\npreferred_mtu = 1000\n")?;
            assert!(CliAppConfig::load(Some(Path::new("custom.toml"))).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_example_config_generation() {
        let example = CliAppConfig::example_config();
        assert!(example.contains("[controller]"));
        assert!(example.contains("[cli]"));
        assert!(example.contains("backend = \"native\""));
    }
}
