//! Events published by controllers and services

use gattkit_core::{
    CharacteristicRef, ConnectionParameters, ControllerError, ControllerState, DescriptorRef, ServiceError,
    ServiceState,
};
use uuid::Uuid;

/// Controller notifications, delivered through [`LowEnergyController::subscribe`](crate::LowEnergyController::subscribe)
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    StateChanged(ControllerState),
    Connected,
    Disconnected,
    ErrorOccurred(ControllerError),
    /// One per service found by primary or include discovery
    ServiceDiscovered(Uuid),
    DiscoveryFinished,
    ConnectionUpdated(ConnectionParameters),
    MtuChanged(u16),
}

/// Service notifications, delivered through [`GattService::subscribe`](crate::GattService::subscribe)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    StateChanged(ServiceState),
    CharacteristicRead(CharacteristicRef, Vec<u8>),
    CharacteristicWritten(CharacteristicRef, Vec<u8>),
    /// Value changed by the remote side: a notification or indication for remote
    /// services, a client write for local services
    CharacteristicChanged(CharacteristicRef, Vec<u8>),
    DescriptorRead(DescriptorRef, Vec<u8>),
    DescriptorWritten(DescriptorRef, Vec<u8>),
    Error(ServiceError),
}
