//! Peer discovery.
//!
//! Both strategies answer one question, "who could I join?", so the join
//! and merge coordinators never care which one is configured.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use concord_common::{Address, ClusterMessage, Envelope};

use crate::transport::Transport;

/// Configured discovery strategy
pub enum DiscoveryProvider {
    Static(StaticDiscovery),
    Broadcast(BroadcastDiscovery),
}

impl DiscoveryProvider {
    /// Candidate peer addresses, never including the local node
    pub async fn discover(&self) -> Vec<Address> {
        match self {
            Self::Static(discovery) => discovery.discover(),
            Self::Broadcast(discovery) => discovery.discover().await,
        }
    }

    /// Route a broadcast discovery answer to the collecting round
    pub async fn on_reply(&self, from: Address, round: u64) {
        if let Self::Broadcast(discovery) = self {
            discovery.on_reply(from, round).await;
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Static(_) => "static",
            Self::Broadcast(_) => "broadcast",
        }
    }
}

/// Fixed seed list, tried in configured order
pub struct StaticDiscovery {
    members: Vec<Address>,
}

impl StaticDiscovery {
    pub fn new(local: Address, configured: &[Address]) -> Self {
        let mut seen = BTreeSet::new();
        let members = configured
            .iter()
            .copied()
            .filter(|&addr| addr != local && seen.insert(addr))
            .collect();
        Self { members }
    }

    pub fn discover(&self) -> Vec<Address> {
        self.members.clone()
    }
}

struct Collector {
    round: u64,
    replies: mpsc::UnboundedSender<Address>,
}

/// Probe the broadcast channel and collect whoever answers within the window
pub struct BroadcastDiscovery {
    transport: Arc<dyn Transport>,
    window: Duration,
    next_round: AtomicU64,
    collector: Mutex<Option<Collector>>,
}

impl BroadcastDiscovery {
    pub fn new(transport: Arc<dyn Transport>, window: Duration) -> Self {
        Self {
            transport,
            window,
            next_round: AtomicU64::new(rand::random::<u32>() as u64),
            collector: Mutex::new(None),
        }
    }

    pub async fn discover(&self) -> Vec<Address> {
        let local = self.transport.local_address();
        let round = self.next_round.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.collector.lock().await = Some(Collector { round, replies: tx });

        let probe = Envelope::new(local, ClusterMessage::DiscoveryProbe { round });
        if let Err(e) = self.transport.broadcast(probe).await {
            tracing::warn!(round, error = %e, "Discovery probe failed");
            self.collector.lock().await.take();
            return Vec::new();
        }

        tokio::time::sleep(self.window).await;

        // Close the window; replies for this round are dropped from now on
        self.collector.lock().await.take();

        let mut found = BTreeSet::new();
        while let Ok(addr) = rx.try_recv() {
            if addr != local {
                found.insert(addr);
            }
        }

        tracing::debug!(round, found = found.len(), "Discovery round closed");
        found.into_iter().collect()
    }

    pub async fn on_reply(&self, from: Address, round: u64) {
        let collector = self.collector.lock().await;
        match collector.as_ref() {
            Some(open) if open.round == round => {
                let _ = open.replies.send(from);
            }
            _ => {
                tracing::trace!(%from, round, "Discarding late discovery reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, TransportEvent};

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_static_list_keeps_order_without_self() {
        let discovery = StaticDiscovery::new(
            addr(5702),
            &[addr(5703), addr(5701), addr(5702), addr(5703)],
        );
        assert_eq!(discovery.discover(), vec![addr(5703), addr(5701)]);
    }

    #[tokio::test]
    async fn test_broadcast_collects_replies_within_window() {
        let network = MemoryNetwork::new();
        let (transport, _inbox) = network.bind(addr(5701)).await;
        let (peer, mut peer_inbox) = network.bind(addr(5702)).await;

        let discovery = Arc::new(BroadcastDiscovery::new(
            transport,
            Duration::from_millis(200),
        ));

        let round_task = tokio::spawn({
            let discovery = discovery.clone();
            async move { discovery.discover().await }
        });

        let round = match peer_inbox.recv().await.unwrap() {
            TransportEvent::Message(Envelope {
                message: ClusterMessage::DiscoveryProbe { round },
                ..
            }) => round,
            other => panic!("unexpected event: {other:?}"),
        };
        discovery.on_reply(peer.local_address(), round).await;
        discovery.on_reply(addr(5709), round + 100).await;

        assert_eq!(round_task.await.unwrap(), vec![addr(5702)]);

        // Late answer for the closed round is ignored
        discovery.on_reply(addr(5703), round).await;
        assert!(discovery.collector.lock().await.is_none());
    }
}
