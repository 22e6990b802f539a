//! In-process network.
//!
//! Every bound node gets an mpsc inbox. Links between two nodes can be
//! severed (both sides are told about the lost connection), blackholed
//! (messages silently vanish), or healed again.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

use concord_common::{Address, ClusterError, ClusterResult, Envelope};

use super::{EVENT_CHANNEL_CAPACITY, EventReceiver, Transport, TransportEvent};

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<Address, mpsc::Sender<TransportEvent>>,
    /// Unordered node pairs that cannot exchange messages
    cut: HashSet<(Address, Address)>,
}

fn link(a: Address, b: Address) -> (Address, Address) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Shared in-memory network hub
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node to the network
    pub async fn bind(&self, address: Address) -> (Arc<MemoryTransport>, EventReceiver) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.state.write().await.inboxes.insert(address, tx);

        let transport = Arc::new(MemoryTransport {
            address,
            network: self.clone(),
        });
        (transport, rx)
    }

    /// Remove a node, as if its process died; peers see lost connections
    pub async fn unbind(&self, address: Address) {
        let peers: Vec<mpsc::Sender<TransportEvent>> = {
            let mut state = self.state.write().await;
            state.inboxes.remove(&address);
            state.inboxes.values().cloned().collect()
        };

        for peer in peers {
            let _ = peer.send(TransportEvent::ConnectionLost(address)).await;
        }
    }

    /// Cut the link between two nodes and notify both ends
    pub async fn sever(&self, a: Address, b: Address) {
        let (inbox_a, inbox_b) = {
            let mut state = self.state.write().await;
            state.cut.insert(link(a, b));
            (state.inboxes.get(&a).cloned(), state.inboxes.get(&b).cloned())
        };

        tracing::debug!(%a, %b, "link severed");

        if let Some(inbox) = inbox_a {
            let _ = inbox.send(TransportEvent::ConnectionLost(b)).await;
        }
        if let Some(inbox) = inbox_b {
            let _ = inbox.send(TransportEvent::ConnectionLost(a)).await;
        }
    }

    /// Cut the link between two nodes without telling anyone
    pub async fn blackhole(&self, a: Address, b: Address) {
        self.state.write().await.cut.insert(link(a, b));
        tracing::debug!(%a, %b, "link blackholed");
    }

    /// Silently cut every link between the two groups
    pub async fn partition(&self, left: &[Address], right: &[Address]) {
        let mut state = self.state.write().await;
        for &a in left {
            for &b in right {
                state.cut.insert(link(a, b));
            }
        }
    }

    /// Restore the link between two nodes
    pub async fn heal(&self, a: Address, b: Address) {
        self.state.write().await.cut.remove(&link(a, b));
        tracing::debug!(%a, %b, "link healed");
    }

    /// Restore every link
    pub async fn heal_all(&self) {
        self.state.write().await.cut.clear();
    }

    async fn deliver(&self, from: Address, to: Address, envelope: Envelope) -> ClusterResult<()> {
        let inbox = {
            let state = self.state.read().await;
            if state.cut.contains(&link(from, to)) {
                return Err(ClusterError::Transport(format!("no route from {from} to {to}")));
            }
            state.inboxes.get(&to).cloned()
        };

        let inbox =
            inbox.ok_or_else(|| ClusterError::Transport(format!("{to} is not reachable")))?;
        inbox
            .send(TransportEvent::Message(envelope))
            .await
            .map_err(|_| ClusterError::Transport(format!("{to} stopped receiving")))
    }

    async fn reachable_from(&self, from: Address) -> Vec<Address> {
        let state = self.state.read().await;
        state
            .inboxes
            .keys()
            .copied()
            .filter(|&to| to != from && !state.cut.contains(&link(from, to)))
            .collect()
    }
}

/// A node's handle on the in-memory network
pub struct MemoryTransport {
    address: Address,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> Address {
        self.address
    }

    async fn send(&self, to: Address, envelope: Envelope) -> ClusterResult<()> {
        self.network.deliver(self.address, to, envelope).await
    }

    async fn broadcast(&self, envelope: Envelope) -> ClusterResult<()> {
        for to in self.network.reachable_from(self.address).await {
            if let Err(e) = self.network.deliver(self.address, to, envelope.clone()).await {
                tracing::trace!(%to, error = %e, "broadcast delivery failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_common::ClusterMessage;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_and_sever() {
        let network = MemoryNetwork::new();
        let (a, mut inbox_a) = network.bind(addr(5701)).await;
        let (_b, mut inbox_b) = network.bind(addr(5702)).await;

        let envelope = Envelope::new(a.local_address(), ClusterMessage::Heartbeat { version: 1 });
        a.send(addr(5702), envelope.clone()).await.unwrap();
        match inbox_b.recv().await.unwrap() {
            TransportEvent::Message(received) => assert_eq!(received, envelope),
            other => panic!("unexpected event: {other:?}"),
        }

        network.sever(addr(5701), addr(5702)).await;
        assert!(a.send(addr(5702), envelope.clone()).await.is_err());
        assert!(matches!(
            inbox_a.recv().await.unwrap(),
            TransportEvent::ConnectionLost(lost) if lost == addr(5702)
        ));

        network.heal(addr(5701), addr(5702)).await;
        assert!(a.send(addr(5702), envelope).await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_skips_cut_links() {
        let network = MemoryNetwork::new();
        let (a, _inbox_a) = network.bind(addr(5701)).await;
        let (_b, mut inbox_b) = network.bind(addr(5702)).await;
        let (_c, mut inbox_c) = network.bind(addr(5703)).await;

        network.partition(&[addr(5701)], &[addr(5703)]).await;
        a.broadcast(Envelope::new(addr(5701), ClusterMessage::DiscoveryProbe { round: 1 }))
            .await
            .unwrap();

        assert!(matches!(inbox_b.try_recv(), Ok(TransportEvent::Message(_))));
        assert!(inbox_c.try_recv().is_err());
    }
}
