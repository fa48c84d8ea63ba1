//! Raw ATT bearer between two devices
//!
//! An [`AttLink`] carries whole ATT PDUs in both directions. Connectors open links
//! as a central, listeners accept them as a peripheral.

use gattkit_core::{AddressType, BluetoothAddress, ConnectionParameters};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BleError, Result};

// ----------------------------------------------------------------------------
// Link
// ----------------------------------------------------------------------------

/// Aborts the transport tasks of a link when dropped
#[derive(Debug, Default)]
pub struct LinkGuard(Vec<JoinHandle<()>>);

impl LinkGuard {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self(tasks)
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// One established ATT bearer
#[derive(Debug)]
pub struct AttLink {
    /// PDUs to the remote device
    pub outgoing: mpsc::Sender<Vec<u8>>,
    /// PDUs from the remote device; closes when the link goes down
    pub incoming: mpsc::Receiver<Vec<u8>>,
    pub local_address: BluetoothAddress,
    pub remote_address: BluetoothAddress,
    pub guard: LinkGuard,
}

// ----------------------------------------------------------------------------
// Connector / Listener
// ----------------------------------------------------------------------------

/// Opens ATT links in the central role
#[async_trait::async_trait]
pub trait AttConnector: Send + Sync {
    async fn connect(&self, remote: BluetoothAddress, address_type: AddressType) -> Result<AttLink>;

    /// Ask the link layer for new connection parameters
    async fn update_connection(&self, _remote: BluetoothAddress, _params: &ConnectionParameters) -> Result<()> {
        Err(BleError::Unsupported("connection parameter update".to_string()))
    }
}

/// Accepts ATT links in the peripheral role
#[async_trait::async_trait]
pub trait AttListener: Send {
    async fn accept(&mut self) -> Result<AttLink>;
}
