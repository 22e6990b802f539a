//! Message transport used by the membership core.
//!
//! The core only needs to send an envelope to an address, receive inbound
//! envelopes, and hear about lost connections. Socket lifecycle and framing
//! belong to the implementations:
//! - `MemoryNetwork` (in-process hub for tests and simulations)
//! - `UdpTransport` (JSON datagrams)

mod memory;
mod udp;

use async_trait::async_trait;
use tokio::sync::mpsc;

use concord_common::{Address, ClusterError, ClusterResult, Envelope};

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

/// Inbound event delivered by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message from a peer
    Message(Envelope),
    /// The transport lost its connection to a peer
    ConnectionLost(Address),
}

/// Receiving side of a transport's event stream
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// Capacity of the inbound event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address peers use to reach this node
    fn local_address(&self) -> Address;

    /// Deliver an envelope to a single peer
    async fn send(&self, to: Address, envelope: Envelope) -> ClusterResult<()>;

    /// Deliver an envelope to every node on the broadcast channel
    async fn broadcast(&self, _envelope: Envelope) -> ClusterResult<()> {
        Err(ClusterError::Transport(
            "broadcast not supported by this transport".to_string(),
        ))
    }
}
