//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

use crate::config::BackendKind;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Backend for central commands
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Local adapter name (e.g. hci0)
    #[arg(long)]
    pub adapter: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Scan for advertising devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Only report devices advertising this service UUID
        #[arg(short, long)]
        service: Vec<String>,
    },
    /// Connect and print the complete attribute table
    Explore {
        /// Remote device address
        address: String,
        /// Do not read characteristic and descriptor values
        #[arg(long)]
        skip_values: bool,
        /// The remote uses a random address
        #[arg(long)]
        random: bool,
    },
    /// Read a characteristic or descriptor
    Read {
        /// Remote device address
        address: String,
        /// Attribute handle (decimal or 0x-prefixed hex)
        handle: String,
    },
    /// Write a characteristic or descriptor
    Write {
        /// Remote device address
        address: String,
        /// Attribute handle (decimal or 0x-prefixed hex)
        handle: String,
        /// Value as hex bytes
        value: String,
        /// Use write without response
        #[arg(long)]
        without_response: bool,
    },
    /// Subscribe to a characteristic and print every update
    Watch {
        /// Remote device address
        address: String,
        /// Characteristic handle (decimal or 0x-prefixed hex)
        handle: String,
        /// Subscribe to indications instead of notifications
        #[arg(long)]
        indicate: bool,
    },
    /// Advertise a demo battery service (Linux)
    Serve {
        /// Advertised local name
        #[arg(short, long, default_value = "gattkit")]
        name: String,
    },
    /// Print an example configuration file
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_write_command() {
        let cli = Cli::try_parse_from([
            "gattkit",
            "--backend",
            "att",
            "write",
            "00:11:22:33:44:55",
            "0x0003",
            "0a0b",
            "--without-response",
        ])
        .unwrap();
        assert_eq!(cli.backend, Some(BackendKind::Att));
        assert_eq!(
            cli.command,
            Commands::Write {
                address: "00:11:22:33:44:55".to_string(),
                handle: "0x0003".to_string(),
                value: "0a0b".to_string(),
                without_response: true,
            }
        );
    }

    #[test]
    fn test_parse_scan_defaults() {
        let cli = Cli::try_parse_from(["gattkit", "-v", "scan"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(
            cli.command,
            Commands::Scan {
                timeout: None,
                service: vec![]
            }
        );
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Cli::try_parse_from(["gattkit", "--backend", "usb", "scan"]).is_err());
    }
}
