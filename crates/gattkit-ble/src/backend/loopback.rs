//! In-process ATT link
//!
//! Connects a central and a peripheral controller inside one process without any
//! radio. Used by the integration tests and handy for exercising GATT logic on
//! machines without an adapter.

use gattkit_core::{AddressType, BluetoothAddress};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::link::{AttConnector, AttLink, AttListener, LinkGuard};
use crate::error::{BleError, Result};

/// Address the central end of a loopback link reports
pub const LOOPBACK_CENTRAL_ADDRESS: BluetoothAddress = BluetoothAddress([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01]);

/// Address the peripheral end of a loopback link listens on
pub const LOOPBACK_PERIPHERAL_ADDRESS: BluetoothAddress = BluetoothAddress([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x02]);

const LINK_BUFFER: usize = 64;

type PendingLink = (AttLink, oneshot::Sender<()>);

/// Central side of a loopback link
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    pending: mpsc::Sender<PendingLink>,
}

/// Peripheral side of a loopback link
#[derive(Debug)]
pub struct LoopbackListener {
    pending: mpsc::Receiver<PendingLink>,
}

/// Creates a connected connector/listener pair
pub fn loopback_link() -> (LoopbackConnector, LoopbackListener) {
    let (tx, rx) = mpsc::channel(1);
    (LoopbackConnector { pending: tx }, LoopbackListener { pending: rx })
}

#[async_trait::async_trait]
impl AttConnector for LoopbackConnector {
    async fn connect(&self, remote: BluetoothAddress, _address_type: AddressType) -> Result<AttLink> {
        if remote != LOOPBACK_PERIPHERAL_ADDRESS {
            return Err(BleError::DeviceNotFound {
                address: remote.to_string(),
            });
        }

        let (to_peripheral, from_central) = mpsc::channel(LINK_BUFFER);
        let (to_central, from_peripheral) = mpsc::channel(LINK_BUFFER);
        let peripheral_end = AttLink {
            outgoing: to_central,
            incoming: from_central,
            local_address: LOOPBACK_PERIPHERAL_ADDRESS,
            remote_address: LOOPBACK_CENTRAL_ADDRESS,
            guard: LinkGuard::default(),
        };

        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.pending
            .send((peripheral_end, accepted_tx))
            .await
            .map_err(|_| BleError::ConnectionFailed("loopback listener closed".to_string()))?;
        accepted_rx
            .await
            .map_err(|_| BleError::ConnectionFailed("loopback link not accepted".to_string()))?;

        debug!("Loopback link established to {}", remote);
        Ok(AttLink {
            outgoing: to_peripheral,
            incoming: from_peripheral,
            local_address: LOOPBACK_CENTRAL_ADDRESS,
            remote_address: remote,
            guard: LinkGuard::default(),
        })
    }
}

#[async_trait::async_trait]
impl AttListener for LoopbackListener {
    async fn accept(&mut self) -> Result<AttLink> {
        let (link, accepted) = self.pending.recv().await.ok_or(BleError::LinkClosed)?;
        let _ = accepted.send(());
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_carries_pdus_both_ways() {
        let (connector, mut listener) = loopback_link();
        let accept = tokio::spawn(async move { listener.accept().await });

        let mut central = connector
            .connect(LOOPBACK_PERIPHERAL_ADDRESS, AddressType::Public)
            .await
            .unwrap();
        let mut peripheral = accept.await.unwrap().unwrap();
        assert_eq!(peripheral.remote_address, LOOPBACK_CENTRAL_ADDRESS);

        central.outgoing.send(vec![0x02, 0x17, 0x00]).await.unwrap();
        assert_eq!(peripheral.incoming.recv().await, Some(vec![0x02, 0x17, 0x00]));

        peripheral.outgoing.send(vec![0x03, 0x17, 0x00]).await.unwrap();
        assert_eq!(central.incoming.recv().await, Some(vec![0x03, 0x17, 0x00]));

        drop(peripheral);
        assert_eq!(central.incoming.recv().await, None);
    }

    #[tokio::test]
    async fn test_loopback_rejects_unknown_address() {
        let (connector, _listener) = loopback_link();
        let result = connector
            .connect(BluetoothAddress([1, 2, 3, 4, 5, 6]), AddressType::Public)
            .await;
        assert!(matches!(result, Err(BleError::DeviceNotFound { .. })));
    }
}
