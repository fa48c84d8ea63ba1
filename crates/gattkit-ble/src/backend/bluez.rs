//! ATT bearer over a BlueZ L2CAP socket
//!
//! Uses the fixed LE attribute channel (CID 4) directly, so the host's own GATT
//! client is bypassed and the controller runs the ATT procedures itself.

use std::sync::Arc;

use bluer::l2cap::{SeqPacket, SeqPacketListener, Socket, SocketAddr};
use gattkit_core::att::MAX_MTU;
use gattkit_core::{AddressType, BluetoothAddress};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::link::{AttConnector, AttLink, AttListener, LinkGuard};
use crate::error::{BleError, Result};

/// Fixed L2CAP channel of the attribute protocol on LE links
const ATT_CID: u16 = 0x0004;

const LINK_BUFFER: usize = 64;

fn socket_addr(address: BluetoothAddress, address_type: AddressType) -> SocketAddr {
    SocketAddr {
        addr: bluer::Address::new(address.0),
        addr_type: match address_type {
            AddressType::Public => bluer::AddressType::LePublic,
            AddressType::Random => bluer::AddressType::LeRandom,
        },
        psm: 0,
        cid: ATT_CID,
    }
}

/// Address of the selected adapter, the default adapter when `name` is unset.
/// Every failure means the adapter cannot be used.
async fn resolve_adapter(name: Option<&str>) -> Result<(BluetoothAddress, AddressType)> {
    let unavailable = |e: bluer::Error| {
        warn!("Bluetooth adapter {} not usable: {}", name.unwrap_or("(default)"), e);
        BleError::AdapterNotAvailable
    };

    let session = bluer::Session::new().await.map_err(unavailable)?;
    let adapter = match name {
        Some(name) => session.adapter(name).map_err(unavailable)?,
        None => session.default_adapter().await.map_err(unavailable)?,
    };
    let address = adapter.address().await.map_err(unavailable)?;
    let address_type = match adapter.address_type().await.map_err(unavailable)? {
        bluer::AddressType::LeRandom => AddressType::Random,
        _ => AddressType::Public,
    };
    Ok((BluetoothAddress(address.0), address_type))
}

/// Pumps PDUs between the socket and the link channels
fn spawn_link(stream: SeqPacket, local_address: BluetoothAddress, remote_address: BluetoothAddress) -> AttLink {
    let socket = Arc::new(stream);
    let (outgoing, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(LINK_BUFFER);
    let (incoming_tx, incoming) = mpsc::channel(LINK_BUFFER);

    let writer = {
        let socket = socket.clone();
        tokio::spawn(async move {
            while let Some(pdu) = outgoing_rx.recv().await {
                if let Err(e) = socket.send(&pdu).await {
                    debug!("L2CAP send failed: {}", e);
                    break;
                }
            }
        })
    };

    let reader = tokio::spawn(async move {
        let mut buffer = vec![0u8; usize::from(MAX_MTU)];
        loop {
            match socket.recv(&mut buffer).await {
                Ok(0) => break,
                Ok(length) => {
                    if incoming_tx.send(buffer[..length].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("L2CAP receive failed: {}", e);
                    break;
                }
            }
        }
    });

    AttLink {
        outgoing,
        incoming,
        local_address,
        remote_address,
        guard: LinkGuard::new(vec![writer, reader]),
    }
}

// ----------------------------------------------------------------------------
// Central Side
// ----------------------------------------------------------------------------

/// Opens ATT links to remote devices from the configured adapter
#[derive(Debug, Clone, Default)]
pub struct L2capConnector {
    adapter: Option<String>,
}

impl L2capConnector {
    pub fn new(adapter: Option<String>) -> Self {
        Self { adapter }
    }
}

#[async_trait::async_trait]
impl AttConnector for L2capConnector {
    async fn connect(&self, remote: BluetoothAddress, address_type: AddressType) -> Result<AttLink> {
        let (local_address, local_address_type) = resolve_adapter(self.adapter.as_deref()).await?;

        let socket = Socket::<SeqPacket>::new_seq_packet()?;
        socket.bind(socket_addr(local_address, local_address_type))?;
        let stream = socket
            .connect(socket_addr(remote, address_type))
            .await
            .map_err(|e| BleError::ConnectionFailed(e.to_string()))?;

        info!("L2CAP ATT channel open from {} to {}", local_address, remote);
        Ok(spawn_link(stream, local_address, remote))
    }
}

// ----------------------------------------------------------------------------
// Peripheral Side
// ----------------------------------------------------------------------------

/// Accepts ATT links on the local adapter
pub struct L2capListener {
    adapter: Option<String>,
    listener: Option<SeqPacketListener>,
    local_address: BluetoothAddress,
}

impl L2capListener {
    pub fn new(adapter: Option<String>) -> Self {
        Self {
            adapter,
            listener: None,
            local_address: BluetoothAddress::ANY,
        }
    }

    async fn bind(&mut self) -> Result<SeqPacketListener> {
        let (address, address_type) = resolve_adapter(self.adapter.as_deref()).await?;
        self.local_address = address;

        let socket = Socket::<SeqPacket>::new_seq_packet()?;
        socket.bind(socket_addr(self.local_address, address_type))?;
        let listener = socket.listen(1)?;
        info!("Listening for ATT links on {}", self.local_address);
        Ok(listener)
    }
}

#[async_trait::async_trait]
impl AttListener for L2capListener {
    async fn accept(&mut self) -> Result<AttLink> {
        if self.listener.is_none() {
            let listener = self.bind().await?;
            self.listener = Some(listener);
        }
        let Some(listener) = self.listener.as_ref() else {
            return Err(BleError::AdapterNotAvailable);
        };

        let (stream, peer) = listener.accept().await?;
        Ok(spawn_link(stream, self.local_address, BluetoothAddress(peer.addr.0)))
    }
}
