//! gattkit core
//!
//! I/O-free building blocks of a Bluetooth Low Energy GATT controller: the GATT
//! data model, the attribute handle resolver, the controller state machine, local
//! handle allocation and the ATT codec and server.

pub mod allocator;
pub mod att;
pub mod errors;
pub mod gatt;
pub mod local;
pub mod registry;
pub mod state;
pub mod types;
pub mod uuids;

pub use allocator::HandleAllocator;
pub use errors::{ControllerError, GattError, Result, ServiceError};
pub use gatt::{
    read_service, share, write_service, CharacteristicData, ClientConfiguration, DescriptorData, ServiceData,
    SharedService,
};
pub use local::{LocalCharacteristicDefinition, LocalDescriptorDefinition, LocalServiceDefinition};
pub use registry::{CharacteristicRef, DescriptorRef, ServiceRegistry};
pub use state::{AuditEntry, LifecycleEvent, StateTransition, StateTransitionError};
pub use types::{
    AddressType, AttributeHandle, BluetoothAddress, CharacteristicProperties, ConnectionParameters,
    ControllerState, DiscoveryMode, Role, ServiceState, ServiceTypes, WriteMode,
};
