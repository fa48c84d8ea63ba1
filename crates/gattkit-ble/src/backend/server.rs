//! Peripheral backend serving local services over ATT
//!
//! Advertising runs through an [`Advertiser`], incoming links come from an
//! [`AttListener`], and every request is answered by the shared [`AttServer`].

use std::sync::{Arc, Mutex, MutexGuard};

use gattkit_core::att::{AttServer, DEFAULT_MTU, MAX_MTU};
use gattkit_core::{AttributeHandle, ControllerError, Role, SharedService};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::link::{AttLink, AttListener};
use super::{BackendEvent, GattBackend};
use crate::advertising::{AdvertisingData, AdvertisingParameters, Advertiser};
use crate::error::{BleError, Result};

type OutgoingSlot = Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Peripheral Backend
// ----------------------------------------------------------------------------

pub struct AttPeripheralBackend<L, A> {
    listener: Arc<tokio::sync::Mutex<L>>,
    advertiser: A,
    server: Arc<Mutex<AttServer>>,
    /// Sender towards the connected central, `None` while unconnected
    outgoing: OutgoingSlot,
    link_task: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<BackendEvent>>,
}

impl<L, A> AttPeripheralBackend<L, A>
where
    L: AttListener + 'static,
    A: Advertiser,
{
    pub fn new(listener: L, advertiser: A) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            listener: Arc::new(tokio::sync::Mutex::new(listener)),
            advertiser,
            server: Arc::new(Mutex::new(AttServer::new(MAX_MTU))),
            outgoing: Arc::new(Mutex::new(None)),
            link_task: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    fn is_linked(&self) -> bool {
        lock(&self.outgoing).is_some()
    }

    fn link_task_running(&self) -> bool {
        self.link_task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Accepts one central and serves it until the link goes down
async fn accept_and_serve<L: AttListener>(
    listener: Arc<tokio::sync::Mutex<L>>,
    server: Arc<Mutex<AttServer>>,
    slot: OutgoingSlot,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    let link = match listener.lock().await.accept().await {
        Ok(link) => link,
        Err(e) => {
            warn!("Accepting ATT link failed: {}", e);
            return;
        }
    };
    serve(link, server, slot, events).await;
}

async fn serve(
    link: AttLink,
    server: Arc<Mutex<AttServer>>,
    slot: OutgoingSlot,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    let AttLink {
        outgoing,
        mut incoming,
        remote_address,
        guard,
        ..
    } = link;

    info!("Central {} connected", remote_address);
    *lock(&slot) = Some(outgoing.clone());
    let _ = events.send(BackendEvent::CentralConnected {
        remote: remote_address,
        mtu: DEFAULT_MTU,
    });

    while let Some(bytes) = incoming.recv().await {
        let outcome = lock(&server).handle_pdu(&bytes);

        if let Some(response) = outcome.response {
            if outgoing.send(response.encode()).await.is_err() {
                break;
            }
        }
        if let Some(mtu) = outcome.mtu_changed {
            let _ = events.send(BackendEvent::MtuChanged(mtu));
        }
        for (handle, value) in outcome.written {
            let _ = events.send(BackendEvent::AttributeWritten { handle, value });
        }
    }

    info!("Central {} disconnected", remote_address);
    lock(&server).reset();
    lock(&slot).take();
    drop(guard);
    let _ = events.send(BackendEvent::LinkLost(ControllerError::RemoteHostClosedError));
}

#[async_trait::async_trait]
impl<L, A> GattBackend for AttPeripheralBackend<L, A>
where
    L: AttListener + 'static,
    A: Advertiser,
{
    fn role(&self) -> Role {
        Role::Peripheral
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        lock(&self.outgoing).take();
        lock(&self.server).reset();
        if self.advertiser.is_advertising() {
            self.advertiser.stop_advertising().await?;
        }
        Ok(())
    }

    async fn start_advertising(
        &mut self,
        params: &AdvertisingParameters,
        data: &AdvertisingData,
        scan_response: &AdvertisingData,
    ) -> Result<()> {
        if self.is_linked() {
            return Err(BleError::AdvertisingFailed("a central is already connected".to_string()));
        }
        self.advertiser.start_advertising(params, data, scan_response).await?;

        if !self.link_task_running() {
            self.link_task = Some(tokio::spawn(accept_and_serve(
                self.listener.clone(),
                self.server.clone(),
                self.outgoing.clone(),
                self.events_tx.clone(),
            )));
        }
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<()> {
        self.advertiser.stop_advertising().await?;
        // Keep serving a central that already connected
        if !self.is_linked() {
            if let Some(task) = self.link_task.take() {
                task.abort();
            }
        }
        Ok(())
    }

    async fn add_service(&mut self, service: SharedService) -> Result<()> {
        lock(&self.server).add_service(service);
        Ok(())
    }

    async fn notify(&mut self, characteristic_handle: AttributeHandle) -> Result<()> {
        let Some(outgoing) = lock(&self.outgoing).clone() else {
            return Ok(());
        };
        let update = lock(&self.server).value_update(characteristic_handle);
        if let Some(pdu) = update {
            debug!("Sending value update for 0x{:04X}", characteristic_handle);
            outgoing
                .send(pdu.encode())
                .await
                .map_err(|_| BleError::NotConnected)?;
        }
        Ok(())
    }

    fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<BackendEvent>> {
        self.events_rx.take()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
