//! Asynchronous Bluetooth Low Energy GATT controller
//!
//! This crate drives the GATT model of `gattkit-core` over real links. A
//! [`LowEnergyController`] connects to one remote device and discovers its
//! services (central role), or hosts local services and advertises them
//! (peripheral role). Services are manipulated through [`GattService`] objects,
//! and everything that happens is published as [`ControllerEvent`]s and
//! [`ServiceEvent`]s.
//!
//! ## Architecture
//!
//! - [`config`] - Controller configuration and timeouts
//! - [`error`] - Error types of the BLE layer
//! - [`events`] - Controller and service events
//! - [`discovery`] - Device scanning through btleplug
//! - [`advertising`] - Advertising data and platform advertisers
//! - [`backend`] - Transports carrying GATT operations (btleplug, ATT over L2CAP, loopback)
//! - [`controller`] - The controller state machine and its worker task
//! - [`service`] - Service objects
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gattkit_ble::{ControllerConfig, ControllerEvent, LowEnergyController};
//! use gattkit_core::BluetoothAddress;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let remote: BluetoothAddress = "00:11:22:33:44:55".parse()?;
//! let controller = LowEnergyController::central(remote, ControllerConfig::default())?;
//! let mut events = controller.subscribe();
//!
//! controller.connect_to_device();
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         ControllerEvent::Connected => controller.discover_services(),
//!         ControllerEvent::DiscoveryFinished => break,
//!         _ => {}
//!     }
//! }
//!
//! for uuid in controller.services() {
//!     println!("service {}", uuid);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Central**: every platform btleplug supports; on Linux ATT can also run
//!   directly over the L2CAP fixed channel
//! - **Peripheral**: Linux (BlueZ advertising plus an L2CAP ATT server)

pub mod advertising;
pub mod backend;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod events;
pub mod service;

pub use advertising::{AdvertisingData, AdvertisingMode, AdvertisingParameters, Discoverability};
pub use backend::{BackendEvent, GattBackend};
pub use config::ControllerConfig;
pub use controller::LowEnergyController;
pub use discovery::{DeviceScanner, DiscoveredDevice};
pub use error::{BleError, Result};
pub use events::{ControllerEvent, ServiceEvent};
pub use service::GattService;
