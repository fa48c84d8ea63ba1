//! gattkit CLI library
//!
//! Command-line front end for the gattkit controller: scanning, exploring and
//! driving remote GATT servers, and serving a demo peripheral.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::{BackendKind, CliAppConfig};
pub use error::{CliError, Result};
