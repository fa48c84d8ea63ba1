//! Low energy controller
//!
//! A [`LowEnergyController`] owns the connection to one remote device (central role)
//! or the local attribute database (peripheral role). Public operations never
//! block: they check the state machine, update shared state and queue a request.
//! A single worker task per controller owns the [`GattBackend`], drains the queue
//! in FIFO order and turns backend results and events into state changes and
//! [`ControllerEvent`]s / [`ServiceEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use gattkit_core::att::DEFAULT_MTU;
use gattkit_core::{
    read_service, registry, write_service, AddressType, AttributeHandle, AuditEntry, BluetoothAddress,
    CharacteristicRef, ConnectionParameters, ControllerError, ControllerState, DescriptorRef, DiscoveryMode,
    GattError, HandleAllocator, LifecycleEvent, LocalServiceDefinition, Role, ServiceData, ServiceError,
    ServiceRegistry, ServiceState, ServiceTypes, SharedService, WriteMode,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advertising::{AdvertisingData, AdvertisingParameters};
use crate::backend::{self, BackendEvent, DiscoveredService, GattBackend};
use crate::config::ControllerConfig;
use crate::error::{BleError, Result};
use crate::events::{ControllerEvent, ServiceEvent};
use crate::service::GattService;

/// Transitions kept in the audit log
const AUDIT_LOG_CAPACITY: usize = 64;

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

/// Work queued for the controller's worker task
#[derive(Debug)]
pub(crate) enum Request {
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverDetails {
        service: SharedService,
        mode: DiscoveryMode,
    },
    ReadCharacteristic(CharacteristicRef),
    WriteCharacteristic {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        mode: WriteMode,
    },
    ReadDescriptor(DescriptorRef),
    WriteDescriptor {
        descriptor: DescriptorRef,
        value: Vec<u8>,
    },
    StartAdvertising {
        params: AdvertisingParameters,
        data: AdvertisingData,
        scan_response: AdvertisingData,
    },
    StopAdvertising,
    ConnectionUpdate(ConnectionParameters),
    AddService(SharedService),
    Notify(AttributeHandle),
}

// ----------------------------------------------------------------------------
// Shared Controller State
// ----------------------------------------------------------------------------

struct ControllerInner {
    state: ControllerState,
    error: ControllerError,
    remote_address: BluetoothAddress,
    address_type: AddressType,
    local_address: BluetoothAddress,
    mtu: u16,
    connection_parameters: ConnectionParameters,
    /// Services of the remote device, invalidated on every disconnect
    remote_services: ServiceRegistry,
    /// Services hosted in the peripheral role; survive disconnects
    local_services: ServiceRegistry,
    allocator: HandleAllocator,
    /// Event channel per service object, keyed by the address of its shared data
    service_channels: HashMap<usize, broadcast::Sender<ServiceEvent>>,
    audit: VecDeque<AuditEntry>,
}

fn service_key(service: &SharedService) -> usize {
    Arc::as_ptr(service) as usize
}

/// State shared between the controller handle, its services and the worker
pub(crate) struct ControllerShared {
    inner: Mutex<ControllerInner>,
    events: broadcast::Sender<ControllerEvent>,
    requests: mpsc::UnboundedSender<Request>,
    config: ControllerConfig,
    role: Role,
}

impl ControllerShared {
    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn state(&self) -> ControllerState {
        self.lock().state
    }

    pub(crate) fn enqueue(&self, request: Request) {
        if self.requests.send(request).is_err() {
            warn!("Controller worker has stopped, request dropped");
        }
    }

    fn emit(&self, event: ControllerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Feeds `event` into the state machine. Rejected events are logged and leave
    /// the state untouched.
    fn apply(&self, event: LifecycleEvent) -> bool {
        let changed = {
            let mut inner = self.lock();
            match inner.state.transition(event, self.role) {
                Ok(transition) => {
                    inner.state = transition.new_state;
                    let changed = transition.changed().then_some(transition.new_state);
                    if inner.audit.len() == AUDIT_LOG_CAPACITY {
                        inner.audit.pop_front();
                    }
                    inner.audit.push_back(transition.audit_entry);
                    changed
                }
                Err(e) => {
                    warn!("Ignoring {:?}: {}", event, e);
                    return false;
                }
            }
        };

        if let Some(state) = changed {
            info!("Controller state changed to {}", state);
            self.emit(ControllerEvent::StateChanged(state));
        }
        true
    }

    fn set_error(&self, error: ControllerError) {
        self.lock().error = error;
        warn!("Controller error: {}", error);
        self.emit(ControllerEvent::ErrorOccurred(error));
    }

    /// Event channel of `service`, created on first use
    pub(crate) fn service_channel(&self, service: &SharedService) -> broadcast::Sender<ServiceEvent> {
        let capacity = self.config.event_buffer_size;
        self.lock()
            .service_channels
            .entry(service_key(service))
            .or_insert_with(|| broadcast::channel(capacity).0)
            .clone()
    }

    fn emit_service(&self, service: &SharedService, event: ServiceEvent) {
        let channel = self.lock().service_channels.get(&service_key(service)).cloned();
        if let Some(channel) = channel {
            let _ = channel.send(event);
        }
    }

    fn invalidate_remote_services(&self) {
        let channels: Vec<_> = {
            let mut inner = self.lock();
            let invalidated = inner.remote_services.invalidate_services();
            invalidated
                .iter()
                .filter_map(|service| inner.service_channels.remove(&service_key(service)))
                .collect()
        };
        for channel in channels {
            let _ = channel.send(ServiceEvent::StateChanged(ServiceState::InvalidService));
        }
    }

    // ------------------------------------------------------------------------
    // Result Entry Points
    // ------------------------------------------------------------------------

    pub(crate) fn characteristic_read(&self, characteristic: &CharacteristicRef, value: Vec<u8>) {
        registry::update_characteristic_value(characteristic.service(), characteristic.handle(), &value, false);
        self.emit_service(
            characteristic.service(),
            ServiceEvent::CharacteristicRead(characteristic.clone(), value),
        );
    }

    pub(crate) fn characteristic_written(&self, characteristic: &CharacteristicRef, value: Vec<u8>) {
        registry::update_characteristic_value(characteristic.service(), characteristic.handle(), &value, false);
        self.emit_service(
            characteristic.service(),
            ServiceEvent::CharacteristicWritten(characteristic.clone(), value),
        );
    }

    pub(crate) fn characteristic_changed(&self, characteristic: &CharacteristicRef, value: Vec<u8>) {
        registry::update_characteristic_value(characteristic.service(), characteristic.handle(), &value, false);
        self.emit_service(
            characteristic.service(),
            ServiceEvent::CharacteristicChanged(characteristic.clone(), value),
        );
    }

    pub(crate) fn descriptor_read(&self, descriptor: &DescriptorRef, value: Vec<u8>) {
        registry::update_descriptor_value(
            descriptor.service(),
            descriptor.characteristic_handle(),
            descriptor.handle(),
            &value,
            false,
        );
        self.emit_service(descriptor.service(), ServiceEvent::DescriptorRead(descriptor.clone(), value));
    }

    pub(crate) fn descriptor_written(&self, descriptor: &DescriptorRef, value: Vec<u8>) {
        registry::update_descriptor_value(
            descriptor.service(),
            descriptor.characteristic_handle(),
            descriptor.handle(),
            &value,
            false,
        );
        self.emit_service(
            descriptor.service(),
            ServiceEvent::DescriptorWritten(descriptor.clone(), value),
        );
    }

    pub(crate) fn service_error(&self, service: &SharedService, error: ServiceError) {
        write_service(service).last_error = error;
        warn!("Service error: {}", error);
        self.emit_service(service, ServiceEvent::Error(error));
    }

    // ------------------------------------------------------------------------
    // Request Processing
    // ------------------------------------------------------------------------

    /// Whether a queued request against `service` may still run
    fn remote_request_allowed(&self, service: &SharedService) -> bool {
        let linked = self.state().is_linked();
        let discovered = read_service(service).state == ServiceState::RemoteServiceDiscovered;
        if !(linked && discovered) {
            debug!("Dropping request for a service that is no longer usable");
        }
        linked && discovered
    }

    async fn process(&self, backend: &mut dyn GattBackend, request: Request) {
        match request {
            Request::Connect => self.connect(backend).await,
            Request::Disconnect => {
                if let Err(e) = backend.disconnect().await {
                    warn!("Closing the link failed: {}", e);
                }
                self.lock().mtu = DEFAULT_MTU;
                if self.apply(LifecycleEvent::LinkClosed) {
                    self.emit(ControllerEvent::Disconnected);
                }
            }
            Request::DiscoverServices => self.discover_services(backend).await,
            Request::DiscoverDetails { service, mode } => self.discover_details(backend, service, mode).await,
            Request::ReadCharacteristic(characteristic) => {
                if !self.remote_request_allowed(characteristic.service()) {
                    return;
                }
                let Some(value_handle) = characteristic.value_handle() else {
                    return;
                };
                match backend.read_characteristic(value_handle).await {
                    Ok(value) => self.characteristic_read(&characteristic, value),
                    Err(e) => {
                        warn!("Reading characteristic 0x{:04X} failed: {}", value_handle, e);
                        self.service_error(
                            characteristic.service(),
                            e.service_error(ServiceError::CharacteristicReadError),
                        );
                    }
                }
            }
            Request::WriteCharacteristic {
                characteristic,
                value,
                mode,
            } => {
                if !self.remote_request_allowed(characteristic.service()) {
                    return;
                }
                let Some(value_handle) = characteristic.value_handle() else {
                    return;
                };
                match backend.write_characteristic(value_handle, &value, mode).await {
                    Ok(()) if mode == WriteMode::WithoutResponse => {
                        registry::update_characteristic_value(
                            characteristic.service(),
                            characteristic.handle(),
                            &value,
                            false,
                        );
                    }
                    Ok(()) => self.characteristic_written(&characteristic, value),
                    Err(e) => {
                        warn!("Writing characteristic 0x{:04X} failed: {}", value_handle, e);
                        self.service_error(
                            characteristic.service(),
                            e.service_error(ServiceError::CharacteristicWriteError),
                        );
                    }
                }
            }
            Request::ReadDescriptor(descriptor) => {
                if !self.remote_request_allowed(descriptor.service()) {
                    return;
                }
                match backend.read_descriptor(descriptor.handle()).await {
                    Ok(value) => self.descriptor_read(&descriptor, value),
                    Err(e) => {
                        warn!("Reading descriptor 0x{:04X} failed: {}", descriptor.handle(), e);
                        self.service_error(descriptor.service(), e.service_error(ServiceError::DescriptorReadError));
                    }
                }
            }
            Request::WriteDescriptor { descriptor, value } => {
                if !self.remote_request_allowed(descriptor.service()) {
                    return;
                }
                match backend.write_descriptor(descriptor.handle(), &value).await {
                    Ok(()) => self.descriptor_written(&descriptor, value),
                    Err(e) => {
                        warn!("Writing descriptor 0x{:04X} failed: {}", descriptor.handle(), e);
                        self.service_error(
                            descriptor.service(),
                            e.service_error(ServiceError::DescriptorWriteError),
                        );
                    }
                }
            }
            Request::StartAdvertising {
                params,
                data,
                scan_response,
            } => {
                if let Err(e) = backend.start_advertising(&params, &data, &scan_response).await {
                    warn!("Starting advertising failed: {}", e);
                    self.apply(LifecycleEvent::AdvertisingFailed);
                    self.set_error(ControllerError::AdvertisingError);
                }
            }
            Request::StopAdvertising => {
                if let Err(e) = backend.stop_advertising().await {
                    warn!("Stopping advertising failed: {}", e);
                }
            }
            Request::ConnectionUpdate(params) => {
                if let Err(e) = backend.request_connection_update(&params).await {
                    warn!("Connection parameter update failed: {}", e);
                }
            }
            Request::AddService(service) => {
                if let Err(e) = backend.add_service(service).await {
                    warn!("Publishing local service failed: {}", e);
                }
            }
            Request::Notify(handle) => {
                if let Err(e) = backend.notify(handle).await {
                    warn!("Value update for 0x{:04X} failed: {}", handle, e);
                }
            }
        }
    }

    async fn connect(&self, backend: &mut dyn GattBackend) {
        let (remote, address_type) = {
            let inner = self.lock();
            (inner.remote_address, inner.address_type)
        };

        let result = timeout(self.config.connection_timeout, backend.connect(remote, address_type))
            .await
            .unwrap_or(Err(BleError::ConnectionTimeout));

        match result {
            Ok(info) => {
                {
                    let mut inner = self.lock();
                    inner.local_address = info.local_address;
                    inner.mtu = info.mtu;
                }
                if self.apply(LifecycleEvent::LinkEstablished) {
                    self.emit(ControllerEvent::Connected);
                    if info.mtu != DEFAULT_MTU {
                        self.emit(ControllerEvent::MtuChanged(info.mtu));
                    }
                }
            }
            Err(e) => {
                warn!("Connecting to {} failed: {}", remote, e);
                self.apply(LifecycleEvent::LinkFailed);
                self.set_error(e.controller_error());
            }
        }
    }

    async fn discover_services(&self, backend: &mut dyn GattBackend) {
        match backend.discover_services().await {
            Ok(found) => {
                for service in found {
                    let added = {
                        let mut inner = self.lock();
                        if inner.state != ControllerState::Discovering || inner.remote_services.contains(&service.uuid)
                        {
                            false
                        } else {
                            inner.remote_services.insert(ServiceData::remote(
                                service.uuid,
                                service.start_handle,
                                service.end_handle,
                            ));
                            true
                        }
                    };
                    if added {
                        debug!("Discovered service {}", service.uuid);
                        self.emit(ControllerEvent::ServiceDiscovered(service.uuid));
                    }
                }
                if self.apply(LifecycleEvent::DiscoveryFinished) {
                    self.emit(ControllerEvent::DiscoveryFinished);
                }
            }
            Err(e) => {
                warn!("Service discovery failed: {}", e);
                if self.apply(LifecycleEvent::DiscoveryFailed) {
                    self.set_error(e.controller_error());
                }
            }
        }
    }

    async fn discover_details(&self, backend: &mut dyn GattBackend, service: SharedService, mode: DiscoveryMode) {
        let summary = {
            let data = read_service(&service);
            if data.state != ServiceState::RemoteServiceDiscovering {
                return;
            }
            DiscoveredService {
                uuid: data.uuid,
                start_handle: data.start_handle,
                end_handle: data.end_handle,
            }
        };

        match backend.discover_service_details(&summary, mode).await {
            Ok(details) => {
                let mut included_services = Vec::with_capacity(details.included_services.len());
                for included in details.included_services {
                    included_services.push(included.uuid);
                    let added = {
                        let mut inner = self.lock();
                        if !inner.state.is_linked() {
                            false
                        } else if let Some(existing) = inner.remote_services.get(&included.uuid) {
                            write_service(&existing).service_type |= ServiceTypes::INCLUDED_SERVICE;
                            false
                        } else {
                            let mut data =
                                ServiceData::remote(included.uuid, included.start_handle, included.end_handle);
                            data.service_type = ServiceTypes::INCLUDED_SERVICE;
                            inner.remote_services.insert(data);
                            true
                        }
                    };
                    if added {
                        self.emit(ControllerEvent::ServiceDiscovered(included.uuid));
                    }
                }

                {
                    let mut data = write_service(&service);
                    // Invalidated by a disconnect in the meantime
                    if data.state != ServiceState::RemoteServiceDiscovering {
                        return;
                    }
                    data.included_services = included_services;
                    data.characteristic_list = details.characteristics;
                    data.mode = mode;
                    data.state = ServiceState::RemoteServiceDiscovered;
                }
                info!("Service {} discovered", summary.uuid);
                self.emit_service(&service, ServiceEvent::StateChanged(ServiceState::RemoteServiceDiscovered));
            }
            Err(e) => {
                warn!("Detail discovery of {} failed: {}", summary.uuid, e);
                {
                    let mut data = write_service(&service);
                    if data.state != ServiceState::RemoteServiceDiscovering {
                        return;
                    }
                    data.state = ServiceState::RemoteService;
                }
                self.emit_service(&service, ServiceEvent::StateChanged(ServiceState::RemoteService));
                self.service_error(&service, ServiceError::UnknownError);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Backend Events
    // ------------------------------------------------------------------------

    async fn handle_backend_event(&self, backend: &mut dyn GattBackend, event: BackendEvent) {
        match event {
            BackendEvent::LinkLost(error) => {
                if !self.state().accepts(LifecycleEvent::LinkLost, self.role) {
                    debug!("Ignoring link loss in state {}", self.state());
                    return;
                }
                info!("Link lost: {}", error);
                self.invalidate_remote_services();
                self.lock().mtu = DEFAULT_MTU;
                self.apply(LifecycleEvent::LinkLost);
                self.set_error(error);
                // Releases whatever the backend still holds for the dead link
                if let Err(e) = backend.disconnect().await {
                    debug!("Releasing lost link failed: {}", e);
                }
                self.emit(ControllerEvent::Disconnected);
            }
            BackendEvent::CentralConnected { remote, mtu } => {
                if !self.apply(LifecycleEvent::CentralConnected) {
                    return;
                }
                {
                    let mut inner = self.lock();
                    inner.remote_address = remote;
                    inner.mtu = mtu;
                }
                self.emit(ControllerEvent::Connected);
                if let Err(e) = backend.stop_advertising().await {
                    warn!("Stopping advertising after connect failed: {}", e);
                }
            }
            BackendEvent::ValueChanged { handle, value, .. } => {
                let characteristic = self.lock().remote_services.characteristic_for_handle(handle);
                match characteristic {
                    Some(characteristic) if characteristic.value_handle() == Some(handle) => {
                        self.characteristic_changed(&characteristic, value);
                    }
                    _ => debug!("Value update for unknown handle 0x{:04X}", handle),
                }
            }
            BackendEvent::AttributeWritten { handle, value } => {
                let (descriptor, characteristic) = {
                    let inner = self.lock();
                    (
                        inner.local_services.descriptor_for_handle(handle),
                        inner.local_services.characteristic_for_handle(handle),
                    )
                };
                if let Some(descriptor) = descriptor {
                    self.descriptor_written(&descriptor, value);
                } else if let Some(characteristic) =
                    characteristic.filter(|characteristic| characteristic.value_handle() == Some(handle))
                {
                    self.characteristic_changed(&characteristic, value);
                }
            }
            BackendEvent::MtuChanged(mtu) => {
                self.lock().mtu = mtu;
                self.emit(ControllerEvent::MtuChanged(mtu));
            }
            BackendEvent::ConnectionUpdated(params) => {
                self.lock().connection_parameters = params;
                self.emit(ControllerEvent::ConnectionUpdated(params));
            }
        }
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<BackendEvent>>) -> Option<BackendEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Owns the backend until the controller is dropped
async fn run_worker(
    shared: Weak<ControllerShared>,
    mut backend: Box<dyn GattBackend>,
    mut requests: mpsc::UnboundedReceiver<Request>,
) {
    let mut backend_events = backend.take_event_receiver();

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else { break };
                let Some(shared) = shared.upgrade() else { break };
                shared.process(backend.as_mut(), request).await;
            }
            event = next_event(&mut backend_events) => {
                let Some(event) = event else {
                    backend_events = None;
                    continue;
                };
                let Some(shared) = shared.upgrade() else { break };
                shared.handle_backend_event(backend.as_mut(), event).await;
            }
        }
    }

    debug!("Controller worker stopping");
    if let Err(e) = backend.disconnect().await {
        debug!("Closing backend on shutdown failed: {}", e);
    }
}

// ----------------------------------------------------------------------------
// Public Controller
// ----------------------------------------------------------------------------

/// Controller for one BLE link; cheap to clone, clones share the same link
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct LowEnergyController {
    shared: Arc<ControllerShared>,
}

impl LowEnergyController {
    /// Central controller for `remote` on the platform's default backend
    pub fn central(remote: BluetoothAddress, config: ControllerConfig) -> Result<Self> {
        let backend = backend::default_central_backend(&config);
        Self::with_backend(remote, backend, config)
    }

    /// Peripheral controller on the platform's default backend
    pub fn peripheral(config: ControllerConfig) -> Result<Self> {
        let backend = backend::default_peripheral_backend(&config)?;
        Self::with_backend(BluetoothAddress::ANY, backend, config)
    }

    /// Controller driving `backend`; the role is the backend's role
    pub fn with_backend(remote: BluetoothAddress, backend: Box<dyn GattBackend>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let role = backend.role();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_buffer_size);

        let shared = Arc::new(ControllerShared {
            inner: Mutex::new(ControllerInner {
                state: ControllerState::Unconnected,
                error: ControllerError::NoError,
                remote_address: remote,
                address_type: config.remote_address_type,
                local_address: BluetoothAddress::ANY,
                mtu: DEFAULT_MTU,
                connection_parameters: ConnectionParameters::default(),
                remote_services: ServiceRegistry::new(),
                local_services: ServiceRegistry::new(),
                allocator: HandleAllocator::new(),
                service_channels: HashMap::new(),
                audit: VecDeque::with_capacity(AUDIT_LOG_CAPACITY),
            }),
            events,
            requests: requests_tx,
            config,
            role,
        });

        tokio::spawn(run_worker(Arc::downgrade(&shared), backend, requests_rx));
        info!("Created {:?} controller for {}", role, remote);
        Ok(Self { shared })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> ControllerState {
        self.shared.state()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Last error
    pub fn error(&self) -> ControllerError {
        self.shared.lock().error
    }

    /// Description of the last error, empty when there is none
    pub fn error_string(&self) -> String {
        self.error().error_string()
    }

    pub fn remote_address(&self) -> BluetoothAddress {
        self.shared.lock().remote_address
    }

    pub fn remote_address_type(&self) -> AddressType {
        self.shared.lock().address_type
    }

    /// Takes effect on the next connect
    pub fn set_remote_address_type(&self, address_type: AddressType) {
        self.shared.lock().address_type = address_type;
    }

    /// Address of the local adapter, [`BluetoothAddress::ANY`] until known
    pub fn local_address(&self) -> BluetoothAddress {
        self.shared.lock().local_address
    }

    /// ATT MTU of the current link
    pub fn mtu(&self) -> u16 {
        self.shared.lock().mtu
    }

    pub fn connection_parameters(&self) -> ConnectionParameters {
        self.shared.lock().connection_parameters
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Recent state transitions, oldest first
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.shared.lock().audit.iter().cloned().collect()
    }

    /// Receive controller events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.shared.events.subscribe()
    }

    // ------------------------------------------------------------------------
    // Central Operations
    // ------------------------------------------------------------------------

    /// Open the link to the remote device
    pub fn connect_to_device(&self) {
        if self.shared.role == Role::Central && self.remote_address().is_null() {
            warn!("Cannot connect without a remote address");
            self.shared.set_error(ControllerError::UnknownRemoteDeviceError);
            return;
        }
        if self.shared.apply(LifecycleEvent::ConnectRequested) {
            self.shared.enqueue(Request::Connect);
        }
    }

    /// Close the link, or stop advertising when no central is connected.
    /// Every remote service object becomes permanently invalid.
    pub fn disconnect_from_device(&self) {
        let state = self.state();
        if state == ControllerState::Advertising {
            if self.shared.apply(LifecycleEvent::DisconnectRequested) {
                self.shared.enqueue(Request::StopAdvertising);
            }
            return;
        }
        if !state.accepts(LifecycleEvent::DisconnectRequested, self.shared.role) {
            warn!("Ignoring disconnect in state {}", state);
            return;
        }

        self.shared.invalidate_remote_services();
        if self.shared.apply(LifecycleEvent::DisconnectRequested) {
            self.shared.enqueue(Request::Disconnect);
        }
    }

    /// Run primary service discovery
    pub fn discover_services(&self) {
        if self.shared.apply(LifecycleEvent::DiscoveryRequested) {
            self.shared.enqueue(Request::DiscoverServices);
        }
    }

    /// Ask the link layer for new connection parameters; the outcome arrives as
    /// [`ControllerEvent::ConnectionUpdated`]
    pub fn request_connection_update(&self, params: ConnectionParameters) {
        if !params.is_valid() {
            warn!("Ignoring invalid connection parameters {:?}", params);
            return;
        }
        let state = self.state();
        if !state.is_linked() {
            warn!("Ignoring connection update in state {}", state);
            return;
        }
        self.shared.enqueue(Request::ConnectionUpdate(params));
    }

    // ------------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------------

    /// UUIDs of the remote services (central) or local services (peripheral)
    pub fn services(&self) -> Vec<Uuid> {
        let inner = self.shared.lock();
        match self.shared.role {
            Role::Central => inner.remote_services.uuids(),
            Role::Peripheral => inner.local_services.uuids(),
        }
    }

    /// Service object for `uuid`; every object for one UUID shares the same state
    pub fn create_service_object(&self, uuid: &Uuid) -> Option<GattService> {
        let service = {
            let inner = self.shared.lock();
            match self.shared.role {
                Role::Central => inner.remote_services.get(uuid),
                Role::Peripheral => inner.local_services.get(uuid),
            }
        }?;
        let channel = self.shared.service_channel(&service);
        Some(GattService::new(Arc::downgrade(&self.shared), service, channel))
    }

    // ------------------------------------------------------------------------
    // Peripheral Operations
    // ------------------------------------------------------------------------

    /// Register a local service and publish it in the attribute database
    pub fn add_service(&self, definition: &LocalServiceDefinition) -> std::result::Result<GattService, GattError> {
        if self.shared.role != Role::Peripheral {
            return Err(GattError::WrongRole {
                expected: Role::Peripheral,
            });
        }

        let service = {
            let mut inner = self.shared.lock();
            if !matches!(inner.state, ControllerState::Unconnected | ControllerState::Advertising) {
                return Err(GattError::WrongState { state: inner.state });
            }
            if inner.local_services.contains(&definition.uuid) {
                return Err(GattError::InvalidDefinition {
                    reason: format!("service {} is already registered", definition.uuid),
                });
            }
            let ControllerInner {
                allocator,
                local_services,
                ..
            } = &mut *inner;
            let data = allocator.allocate(definition, local_services)?;
            local_services.insert(data)
        };

        info!("Added local service {}", definition.uuid);
        self.shared.enqueue(Request::AddService(service.clone()));
        let channel = self.shared.service_channel(&service);
        Ok(GattService::new(Arc::downgrade(&self.shared), service, channel))
    }

    /// Start advertising; only from Unconnected in the peripheral role
    pub fn start_advertising(&self, params: AdvertisingParameters, data: AdvertisingData, scan_response: AdvertisingData) {
        if self.shared.apply(LifecycleEvent::AdvertisingRequested) {
            self.shared.enqueue(Request::StartAdvertising {
                params,
                data,
                scan_response,
            });
        }
    }

    pub fn stop_advertising(&self) {
        if self.shared.apply(LifecycleEvent::AdvertisingStopped) {
            self.shared.enqueue(Request::StopAdvertising);
        }
    }
}

impl std::fmt::Debug for LowEnergyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowEnergyController")
            .field("role", &self.role())
            .field("state", &self.state())
            .field("remote_address", &self.remote_address())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertising::FallbackAdvertiser;
    use crate::backend::{loopback_link, AttBackend, AttConnector, AttLink, AttPeripheralBackend, ConnectionInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use gattkit_core::{uuids, CharacteristicProperties, LocalCharacteristicDefinition};

    fn peripheral() -> LowEnergyController {
        let (_connector, listener) = loopback_link();
        let backend = AttPeripheralBackend::new(listener, FallbackAdvertiser::new());
        LowEnergyController::with_backend(BluetoothAddress::ANY, Box::new(backend), ControllerConfig::default())
            .unwrap()
    }

    fn central(remote: BluetoothAddress) -> LowEnergyController {
        let (connector, _listener) = loopback_link();
        let backend = AttBackend::new(connector, ControllerConfig::default());
        LowEnergyController::with_backend(remote, Box::new(backend), ControllerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_role_gating() {
        let central = central(BluetoothAddress([1, 2, 3, 4, 5, 6]));
        assert_eq!(central.role(), Role::Central);

        central.start_advertising(
            AdvertisingParameters::default(),
            AdvertisingData::default(),
            AdvertisingData::default(),
        );
        assert_eq!(central.state(), ControllerState::Unconnected);
        assert_eq!(
            central.add_service(&LocalServiceDefinition::primary(uuids::BATTERY_SERVICE)).unwrap_err(),
            GattError::WrongRole {
                expected: Role::Peripheral
            }
        );

        let peripheral = peripheral();
        peripheral.connect_to_device();
        peripheral.discover_services();
        assert_eq!(peripheral.state(), ControllerState::Unconnected);
        assert!(peripheral.audit_log().is_empty());
    }

    #[tokio::test]
    async fn test_connect_without_address_reports_unknown_device() {
        let central = central(BluetoothAddress::ANY);
        let mut events = central.subscribe();
        central.connect_to_device();

        assert_eq!(central.state(), ControllerState::Unconnected);
        assert_eq!(central.error(), ControllerError::UnknownRemoteDeviceError);
        assert_eq!(
            events.recv().await.unwrap(),
            ControllerEvent::ErrorOccurred(ControllerError::UnknownRemoteDeviceError)
        );
        assert_eq!(central.error_string(), "Remote device cannot be found");
    }

    #[tokio::test]
    async fn test_local_services_and_advertising_states() {
        let peripheral = peripheral();
        let battery = LocalServiceDefinition::primary(uuids::BATTERY_SERVICE).with_characteristic(
            LocalCharacteristicDefinition::new(uuids::BATTERY_LEVEL, CharacteristicProperties::READ).with_value(vec![9]),
        );
        let service = peripheral.add_service(&battery).unwrap();
        assert_eq!(service.state(), ServiceState::LocalService);
        assert_eq!(peripheral.services(), vec![uuids::BATTERY_SERVICE]);
        assert!(matches!(
            peripheral.add_service(&battery),
            Err(GattError::InvalidDefinition { .. })
        ));

        peripheral.start_advertising(
            AdvertisingParameters::default(),
            AdvertisingData::new().with_local_name("gattkit"),
            AdvertisingData::default(),
        );
        assert_eq!(peripheral.state(), ControllerState::Advertising);
        // still allowed while advertising
        assert!(peripheral
            .add_service(&LocalServiceDefinition::primary(uuids::DEVICE_INFORMATION))
            .is_ok());

        peripheral.disconnect_from_device();
        assert_eq!(peripheral.state(), ControllerState::Unconnected);

        let transitions: Vec<_> = peripheral
            .audit_log()
            .iter()
            .map(|entry| (entry.from_state, entry.to_state))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (ControllerState::Unconnected, ControllerState::Advertising),
                (ControllerState::Advertising, ControllerState::Unconnected),
            ]
        );
    }

    async fn next_matching<F>(events: &mut broadcast::Receiver<ControllerEvent>, matches: F) -> ControllerEvent
    where
        F: Fn(&ControllerEvent) -> bool,
    {
        timeout(std::time::Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel failed: {}", e),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Central backend that connects at once, counts disconnects and lets the
    /// test inject backend events
    struct ScriptedBackend {
        disconnects: Arc<AtomicUsize>,
        events_rx: Option<mpsc::UnboundedReceiver<BackendEvent>>,
    }

    #[async_trait::async_trait]
    impl GattBackend for ScriptedBackend {
        fn role(&self) -> Role {
            Role::Central
        }

        async fn connect(&mut self, _remote: BluetoothAddress, _address_type: AddressType) -> Result<ConnectionInfo> {
            Ok(ConnectionInfo {
                local_address: BluetoothAddress([9, 9, 9, 9, 9, 9]),
                mtu: DEFAULT_MTU,
            })
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<BackendEvent>> {
            self.events_rx.take()
        }
    }

    #[tokio::test]
    async fn test_link_loss_releases_backend() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (backend_events, events_rx) = mpsc::unbounded_channel();
        let backend = ScriptedBackend {
            disconnects: disconnects.clone(),
            events_rx: Some(events_rx),
        };
        let central = LowEnergyController::with_backend(
            BluetoothAddress([1, 2, 3, 4, 5, 6]),
            Box::new(backend),
            ControllerConfig::default(),
        )
        .unwrap();
        let mut events = central.subscribe();

        central.connect_to_device();
        next_matching(&mut events, |e| *e == ControllerEvent::Connected).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);

        backend_events
            .send(BackendEvent::LinkLost(ControllerError::ConnectionError))
            .unwrap();
        next_matching(&mut events, |e| *e == ControllerEvent::Disconnected).await;
        assert_eq!(central.state(), ControllerState::Unconnected);
        assert_eq!(central.error(), ControllerError::ConnectionError);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        // reconnecting works on the released backend
        central.connect_to_device();
        next_matching(&mut events, |e| *e == ControllerEvent::Connected).await;
        assert_eq!(central.local_address(), BluetoothAddress([9, 9, 9, 9, 9, 9]));
    }

    struct MissingAdapter;

    #[async_trait::async_trait]
    impl AttConnector for MissingAdapter {
        async fn connect(&self, _remote: BluetoothAddress, _address_type: AddressType) -> Result<AttLink> {
            Err(BleError::AdapterNotAvailable)
        }
    }

    #[tokio::test]
    async fn test_missing_adapter_fails_connect() {
        let config = ControllerConfig::default();
        let central = LowEnergyController::with_backend(
            BluetoothAddress([1, 2, 3, 4, 5, 6]),
            Box::new(AttBackend::new(MissingAdapter, config.clone())),
            config,
        )
        .unwrap();
        let mut events = central.subscribe();

        central.connect_to_device();
        let error = next_matching(&mut events, |e| matches!(e, ControllerEvent::ErrorOccurred(_))).await;
        assert_eq!(
            error,
            ControllerEvent::ErrorOccurred(ControllerError::InvalidBluetoothAdapterError)
        );
        assert_eq!(central.state(), ControllerState::Unconnected);
    }

    #[tokio::test]
    async fn test_invalid_connection_parameters_are_ignored() {
        let central = central(BluetoothAddress([1, 2, 3, 4, 5, 6]));
        central.request_connection_update(ConnectionParameters::new(5.0, 4.0, 0, 10));
        central.request_connection_update(ConnectionParameters::new(30.0, 50.0, 0, 4000));
        assert_eq!(central.connection_parameters(), ConnectionParameters::default());
    }
}
