//! Heartbeat failure detector.
//!
//! Every joined node probes every other member of its view once per
//! interval. A member that misses `max_missed` probes in a row is lost:
//! the master removes it; a member that loses the master elects the next
//! one from its own view; a member that loses any other peer reports it to
//! the master, which checks for itself before removing anyone.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::MissedTickBehavior;

use concord_common::{Address, ClusterMessage, Envelope, MemberId, MembershipView};

use super::context::NodeContext;
use super::join::{JoinCoordinator, JoinTarget};

/// Consecutive missed heartbeats per member
#[derive(Debug, Default)]
pub struct FailureDetector {
    max_missed: u32,
    missed: HashMap<Address, u32>,
}

impl FailureDetector {
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed,
            missed: HashMap::new(),
        }
    }

    pub fn record_success(&mut self, address: Address) {
        self.missed.remove(&address);
    }

    /// Count a miss; true once the member crosses the threshold
    pub fn record_failure(&mut self, address: Address) -> bool {
        let missed = self.missed.entry(address).or_insert(0);
        *missed += 1;
        *missed >= self.max_missed
    }

    pub fn forget(&mut self, address: Address) {
        self.missed.remove(&address);
    }

    /// Drop counters for members no longer in the view
    pub fn retain(&mut self, mut keep: impl FnMut(Address) -> bool) {
        self.missed.retain(|&addr, _| keep(addr));
    }

    pub fn missed(&self, address: Address) -> u32 {
        self.missed.get(&address).copied().unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct HeartbeatMonitor {
    ctx: Arc<NodeContext>,
    join: JoinCoordinator,
    detector: Arc<Mutex<FailureDetector>>,
}

impl HeartbeatMonitor {
    pub(crate) fn new(ctx: Arc<NodeContext>, join: JoinCoordinator) -> Self {
        let detector = FailureDetector::new(ctx.config.heartbeat.max_missed);
        Self {
            ctx,
            join,
            detector: Arc::new(Mutex::new(detector)),
        }
    }

    /// Probe loop; runs until shutdown
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.ctx.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.ctx.config.heartbeat.interval_ms,
            max_missed = self.ctx.config.heartbeat.max_missed,
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.ctx.state().is_joined() {
                        self.probe_all().await;
                    }
                }
                _ = self.ctx.stopped() => {
                    tracing::info!("Heartbeat monitor stopping");
                    break;
                }
            }
        }
    }

    async fn probe_all(&self) {
        let ctx = &self.ctx;
        let view = ctx.registry.current_view();
        let local = ctx.local_address();
        let peers: Vec<Address> = view.addresses().filter(|&a| a != local).collect();
        self.detector().retain(|addr| view.member_at(addr).is_some());

        if peers.is_empty() {
            return;
        }

        let version = view.version();
        let timeout = ctx.config.heartbeat_timeout();
        let results = join_all(peers.iter().map(|&peer| async move {
            let probe = ClusterMessage::Heartbeat { version };
            (peer, ctx.call(peer, probe, timeout).await)
        }))
        .await;

        let is_master = view.master_address() == Some(local);
        for (peer, result) in results {
            match result {
                Ok(reply) => {
                    self.detector().record_success(peer);
                    if let ClusterMessage::HeartbeatAck { version: behind } = reply.message {
                        if is_master && behind < version {
                            self.sync_member(peer, behind);
                        }
                    }
                }
                Err(e) => {
                    let lost = self.detector().record_failure(peer);
                    if lost {
                        tracing::warn!(member = %peer, error = %e, "Member stopped answering heartbeats");
                        self.member_lost(peer);
                    } else {
                        tracing::debug!(
                            member = %peer,
                            missed = self.detector().missed(peer),
                            "Heartbeat missed"
                        );
                    }
                }
            }
        }
    }

    /// Ack a probe, but only from a member of our view
    pub async fn handle_heartbeat(&self, envelope: &Envelope) {
        let view = self.ctx.registry.current_view();
        if view.member_at(envelope.from).is_none() {
            tracing::trace!(from = %envelope.from, "Heartbeat from non-member ignored");
            return;
        }
        self.detector().record_success(envelope.from);
        self.ctx
            .reply(
                envelope,
                ClusterMessage::HeartbeatAck {
                    version: view.version(),
                },
            )
            .await;
    }

    /// The transport dropped its connection to a peer
    pub fn connection_lost(&self, address: Address) {
        if self.ctx.registry.current_view().member_at(address).is_some() {
            tracing::info!(member = %address, "Connection to member lost");
            self.member_lost(address);
        }
    }

    /// A member announced that it is leaving
    pub fn handle_leave(&self, from: Address, id: MemberId) {
        if self.join.is_known_instance(from, id) {
            tracing::info!(member = %from, "Member is leaving");
            self.member_lost(from);
        }
    }

    /// Another member could not reach `suspect`; verify before removing
    pub fn handle_suspicion(&self, reporter: Address, suspect: Address) {
        let ctx = &self.ctx;
        if !ctx.is_master() || suspect == ctx.local_address() {
            return;
        }
        if ctx.registry.current_view().member_at(suspect).is_none() {
            return;
        }

        tracing::debug!(%suspect, %reporter, "Verifying suspected member");
        let monitor = self.clone();
        tokio::spawn(async move {
            let version = monitor.ctx.registry.current_view().version();
            let timeout = monitor.ctx.config.heartbeat_timeout();
            match monitor
                .ctx
                .call(suspect, ClusterMessage::Heartbeat { version }, timeout)
                .await
            {
                Ok(_) => {
                    tracing::debug!(%suspect, "Suspected member still answers");
                    monitor.detector().record_success(suspect);
                }
                Err(e) => {
                    tracing::warn!(%suspect, %reporter, error = %e, "Suspected member confirmed lost");
                    monitor.member_lost(suspect);
                }
            }
        });
    }

    /// React to a member declared lost
    pub fn member_lost(&self, address: Address) {
        let ctx = &self.ctx;
        self.detector().forget(address);

        if !ctx.state().is_joined() {
            return;
        }
        let before = ctx.registry.current_view();
        if before.member_at(address).is_none() {
            return;
        }

        let local = ctx.local_address();
        let master = before.master_address();

        if master == Some(local) {
            let version = ctx.registry.remove(address);
            let after = ctx.registry.current_view();
            tracing::info!(member = %address, version, members = after.len(), "Member removed");
            ctx.broadcast_view(&after, None);
            self.notify_removed(address, &after);
            ctx.announce(&before, &after);
            return;
        }

        if master == Some(address) {
            ctx.registry.remove(address);
            let after = ctx.registry.current_view();
            ctx.announce(&before, &after);

            match after.master_address() {
                Some(next) if after.len() > 1 && next == local => {
                    tracing::info!(previous = %address, "Master lost, taking over");
                    ctx.broadcast_view(&after, None);
                }
                Some(next) if after.len() > 1 => {
                    tracing::info!(previous = %address, master = %next, "Master lost, following successor");
                }
                _ => {
                    tracing::warn!(previous = %address, "Master lost with no successor, re-joining");
                    self.join.spawn_rejoin(JoinTarget::Discovery);
                }
            }
            return;
        }

        if let Some(master) = master {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let report = ClusterMessage::MemberSuspected { address };
                if let Err(e) = ctx.send(master, report).await {
                    tracing::debug!(%master, suspect = %address, error = %e, "Suspicion not delivered");
                }
            });
        }
    }

    /// Send the current view to a member that missed an update
    fn sync_member(&self, peer: Address, behind: u64) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let view = ctx.registry.current_view();
            if view.member_at(peer).is_none() {
                return;
            }
            tracing::debug!(member = %peer, behind, current = view.version(), "Member is behind, sending view");
            let sync = ClusterMessage::ViewSync { view: (*view).clone() };
            if let Err(e) = ctx.send(peer, sync).await {
                tracing::debug!(member = %peer, error = %e, "View sync not delivered");
            }
        });
    }

    /// Tell a removed member it is out, in case it is alive but unheard
    fn notify_removed(&self, address: Address, view: &MembershipView) {
        let ctx = self.ctx.clone();
        let update = ClusterMessage::ViewUpdate { view: view.clone() };
        tokio::spawn(async move {
            let _ = ctx.send(address, update).await;
        });
    }

    fn detector(&self) -> MutexGuard<'_, FailureDetector> {
        self.detector.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::node_context;
    use crate::transport::MemoryNetwork;
    use concord_common::{JoinState, Member};

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_threshold_counts_consecutive_misses() {
        let mut detector = FailureDetector::new(3);
        let peer = addr(5702);

        assert!(!detector.record_failure(peer));
        assert!(!detector.record_failure(peer));
        detector.record_success(peer);
        assert_eq!(detector.missed(peer), 0);

        assert!(!detector.record_failure(peer));
        assert!(!detector.record_failure(peer));
        assert!(detector.record_failure(peer));
    }

    #[test]
    fn test_retain_drops_departed_members() {
        let mut detector = FailureDetector::new(2);
        detector.record_failure(addr(5702));
        detector.record_failure(addr(5703));

        detector.retain(|a| a == addr(5702));
        assert_eq!(detector.missed(addr(5702)), 1);
        assert_eq!(detector.missed(addr(5703)), 0);
    }

    async fn joined_member(
        network: &MemoryNetwork,
        port: u16,
        view_of: impl FnOnce(Member) -> MembershipView,
    ) -> (HeartbeatMonitor, Arc<NodeContext>, crate::transport::EventReceiver) {
        let (ctx, inbox) = node_context(network, addr(port)).await;
        let local = ctx.registry.local_member();
        assert!(ctx.registry.install(view_of(local)));
        ctx.set_state(JoinState::Joined);

        let join = JoinCoordinator::new(ctx.clone());
        (HeartbeatMonitor::new(ctx.clone(), join), ctx, inbox)
    }

    #[tokio::test]
    async fn test_master_removes_lost_member() {
        let network = MemoryNetwork::new();
        let other = Member::new(addr(5702), MemberId::new(), false).admitted_at(2);
        let (monitor, ctx, _inbox) = joined_member(&network, 5701, |local| {
            MembershipView::new(2, vec![local.admitted_at(1), other.clone()])
        })
        .await;

        monitor.member_lost(addr(5702));
        let view = ctx.registry.current_view();
        assert_eq!(view.version(), 3);
        assert_eq!(view.len(), 1);
        assert!(ctx.is_master());
    }

    #[tokio::test]
    async fn test_master_sends_view_to_member_acking_old_version() {
        use crate::transport::{Transport, TransportEvent};

        let network = MemoryNetwork::new();
        let (peer, mut peer_inbox) = network.bind(addr(5702)).await;
        let other = Member::new(addr(5702), MemberId::new(), false).admitted_at(2);
        let (monitor, ctx, mut master_inbox) = joined_member(&network, 5701, |local| {
            MembershipView::new(2, vec![local.admitted_at(1), other.clone()])
        })
        .await;

        let probing = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.probe_all().await }
        });

        let request = match peer_inbox.recv().await {
            Some(TransportEvent::Message(envelope)) => envelope,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(request.message, ClusterMessage::Heartbeat { version: 2 });
        peer.send(
            addr(5701),
            request.reply(addr(5702), ClusterMessage::HeartbeatAck { version: 1 }),
        )
        .await
        .unwrap();

        match master_inbox.recv().await {
            Some(TransportEvent::Message(ack)) => assert!(ctx.calls.resolve(ack)),
            other => panic!("unexpected event: {other:?}"),
        }
        probing.await.unwrap();
        assert_eq!(monitor.detector().missed(addr(5702)), 0);

        let sync = tokio::time::timeout(std::time::Duration::from_secs(1), peer_inbox.recv())
            .await
            .unwrap();
        match sync {
            Some(TransportEvent::Message(envelope)) => assert_eq!(
                envelope.message,
                ClusterMessage::ViewSync {
                    view: (*ctx.registry.current_view()).clone()
                }
            ),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_next_in_line_takes_over_from_lost_master() {
        let network = MemoryNetwork::new();
        let master = Member::new(addr(5701), MemberId::new(), false).admitted_at(1);
        let third = Member::new(addr(5703), MemberId::new(), false).admitted_at(3);
        let (monitor, ctx, _inbox) = joined_member(&network, 5702, |local| {
            MembershipView::new(3, vec![master.clone(), local.admitted_at(2), third.clone()])
        })
        .await;

        monitor.member_lost(addr(5701));
        assert!(ctx.is_master());
        assert_eq!(ctx.registry.current_view().len(), 2);
    }

    #[tokio::test]
    async fn test_member_reports_peer_to_master_instead_of_removing() {
        let network = MemoryNetwork::new();
        let (_master, mut master_inbox) = network.bind(addr(5701)).await;
        let master = Member::new(addr(5701), MemberId::new(), false).admitted_at(1);
        let third = Member::new(addr(5703), MemberId::new(), false).admitted_at(3);
        let (monitor, ctx, _inbox) = joined_member(&network, 5702, |local| {
            MembershipView::new(3, vec![master.clone(), local.admitted_at(2), third.clone()])
        })
        .await;

        monitor.member_lost(addr(5703));
        assert_eq!(ctx.registry.current_view().len(), 3);

        match master_inbox.recv().await {
            Some(crate::transport::TransportEvent::Message(envelope)) => {
                assert_eq!(
                    envelope.message,
                    ClusterMessage::MemberSuspected { address: addr(5703) }
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
