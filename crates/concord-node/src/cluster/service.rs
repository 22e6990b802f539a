//! Cluster service - one node's membership core.
//!
//! Owns the shared context and the three protocol components, routes
//! inbound transport events to them, and exposes the read-only queries the
//! rest of a node uses (`current_view`, `local_member`, `is_master`).

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};

use concord_common::constants::attributes::VERSION;
use concord_common::{
    Address, ClusterError, ClusterMessage, ClusterResult, ClusterSnapshot, Envelope, JoinState,
    Member, MemberId, MembershipView,
};

use super::context::{MembershipEvent, NodeContext};
use super::discovery::{BroadcastDiscovery, DiscoveryProvider, StaticDiscovery};
use super::heartbeat::HeartbeatMonitor;
use super::join::{JoinCoordinator, JoinTarget};
use super::merge::MergeCoordinator;
use crate::config::{ClusterConfig, DiscoveryMode};
use crate::transport::{EventReceiver, Transport, TransportEvent};

pub struct ClusterService {
    ctx: Arc<NodeContext>,
    join: JoinCoordinator,
    heartbeat: HeartbeatMonitor,
    merge: MergeCoordinator,
    inbound: Mutex<Option<EventReceiver>>,
}

impl ClusterService {
    /// Build a node on top of a bound transport. Nothing runs until `start`.
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        inbound: EventReceiver,
    ) -> ClusterResult<Arc<Self>> {
        config.validate()?;

        let address = transport.local_address();
        let mut attributes = config.attributes.clone();
        attributes
            .entry(VERSION.to_string())
            .or_insert_with(|| env!("CARGO_PKG_VERSION").to_string());
        let local =
            Member::new(address, MemberId::new(), config.lite_member).with_attributes(attributes);

        let discovery = match config.discovery.mode {
            DiscoveryMode::Static => DiscoveryProvider::Static(StaticDiscovery::new(
                address,
                &config.discovery.members,
            )),
            DiscoveryMode::Broadcast => DiscoveryProvider::Broadcast(BroadcastDiscovery::new(
                transport.clone(),
                config.broadcast_window(),
            )),
        };

        tracing::info!(
            %address,
            id = %local.id(),
            lite = local.is_lite(),
            discovery = discovery.name(),
            "Cluster service created"
        );

        let ctx = Arc::new(NodeContext::new(config, local, transport, discovery));
        let join = JoinCoordinator::new(ctx.clone());
        let heartbeat = HeartbeatMonitor::new(ctx.clone(), join.clone());
        let merge = MergeCoordinator::new(ctx.clone(), join.clone());

        Ok(Arc::new(Self {
            ctx,
            join,
            heartbeat,
            merge,
            inbound: Mutex::new(Some(inbound)),
        }))
    }

    /// Start handling messages, run the initial join, then start the
    /// heartbeat and merge loops.
    ///
    /// Only a `JoinFailure` of the initial join is returned as an error;
    /// every later fault is absorbed by the protocol.
    pub async fn start(self: &Arc<Self>) -> ClusterResult<JoinState> {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(inbound) = inbound else {
            return Err(ClusterError::Protocol(
                "cluster service already started".to_string(),
            ));
        };

        tokio::spawn(self.clone().dispatch(inbound));

        let state = match self.join.join(JoinTarget::Discovery).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "Initial join failed, stopping");
                self.ctx.shutdown.send_replace(true);
                self.ctx.set_state(JoinState::NotJoined);
                return Err(e);
            }
        };
        tracing::info!(?state, "Initial join complete");

        tokio::spawn(self.heartbeat.clone().run());
        tokio::spawn(self.merge.clone().run());
        Ok(state)
    }

    /// Inbound event loop; runs until shutdown or the transport closes
    async fn dispatch(self: Arc<Self>, mut inbound: EventReceiver) {
        loop {
            let event = tokio::select! {
                event = inbound.recv() => event,
                _ = self.ctx.stopped() => break,
            };

            match event {
                Some(TransportEvent::Message(envelope)) => self.handle_message(envelope).await,
                Some(TransportEvent::ConnectionLost(address)) => {
                    self.heartbeat.connection_lost(address)
                }
                None => {
                    tracing::warn!("Transport closed, stopping message dispatch");
                    break;
                }
            }
        }
    }

    /// Route one message. Handlers never wait on a peer's reply here;
    /// anything that needs one runs in its own task.
    async fn handle_message(&self, envelope: Envelope) {
        let from = envelope.from;
        if envelope.message.is_reply() {
            let kind = envelope.message.kind();
            if !self.ctx.calls.resolve(envelope) {
                tracing::debug!(%from, kind, "Discarding reply nobody is waiting for");
            }
            return;
        }

        match &envelope.message {
            ClusterMessage::JoinRequest(request) => {
                self.join
                    .handle_join_request(&envelope, request.clone())
                    .await;
            }
            ClusterMessage::ViewUpdate { view } => {
                self.join.handle_view_update(from, view.clone());
            }
            ClusterMessage::ViewSync { view } => {
                self.join.handle_view_sync(from, view.clone());
            }
            ClusterMessage::Heartbeat { .. } => {
                self.heartbeat.handle_heartbeat(&envelope).await;
            }
            ClusterMessage::MemberSuspected { address } => {
                self.heartbeat.handle_suspicion(from, *address);
            }
            ClusterMessage::Leave { id } => {
                self.heartbeat.handle_leave(from, *id);
            }
            ClusterMessage::DiscoveryProbe { round } => {
                if from != self.ctx.local_address() {
                    let _ = self
                        .ctx
                        .send(from, ClusterMessage::DiscoveryReply { round: *round })
                        .await;
                }
            }
            ClusterMessage::DiscoveryReply { round } => {
                self.ctx.discovery.on_reply(from, *round).await;
            }
            ClusterMessage::SplitBrainProbe => {
                let view = self.ctx.registry.current_view();
                let summary = view.summary(self.ctx.state().is_joined());
                self.ctx
                    .reply(&envelope, ClusterMessage::SplitBrainInfo(summary))
                    .await;
            }
            ClusterMessage::MergeProposal { view } => {
                self.merge.handle_proposal(&envelope, view.clone()).await;
            }
            ClusterMessage::MergeInstruction { master } => {
                self.merge.handle_instruction(from, *master);
            }
            ClusterMessage::JoinResponse(_)
            | ClusterMessage::HeartbeatAck { .. }
            | ClusterMessage::SplitBrainInfo(_)
            | ClusterMessage::MergeReply(_) => {}
        }
    }

    pub fn current_view(&self) -> Arc<MembershipView> {
        self.ctx.registry.current_view()
    }

    pub fn local_member(&self) -> Member {
        self.ctx.registry.local_member()
    }

    pub fn local_address(&self) -> Address {
        self.ctx.local_address()
    }

    pub fn is_master(&self) -> bool {
        self.ctx.is_master()
    }

    pub fn master(&self) -> Option<Member> {
        self.current_view().master().cloned()
    }

    pub fn join_state(&self) -> JoinState {
        self.ctx.state()
    }

    /// Membership change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.ctx.events.subscribe()
    }

    /// Every committed view, as it is published
    pub fn watch_view(&self) -> watch::Receiver<Arc<MembershipView>> {
        self.ctx.registry.watch()
    }

    pub fn watch_state(&self) -> watch::Receiver<JoinState> {
        self.ctx.state.subscribe()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let view = self.current_view();
        ClusterSnapshot {
            local: self.local_member(),
            master: view.master().cloned(),
            is_master: self.is_master(),
            state: self.join_state(),
            view: (*view).clone(),
            taken_at: chrono::Utc::now(),
        }
    }

    /// Leave the cluster: tell the other members, then stop every task
    pub async fn shutdown(&self) {
        if self.ctx.is_stopped() {
            return;
        }

        let view = self.current_view();
        let local = self.local_member();
        if self.ctx.state().is_joined() && view.len() > 1 {
            let peers = view.addresses().filter(|&a| a != local.address());
            futures::future::join_all(peers.map(|peer| {
                let ctx = &self.ctx;
                let id = local.id();
                async move {
                    if let Err(e) = ctx.send(peer, ClusterMessage::Leave { id }).await {
                        tracing::debug!(%peer, error = %e, "Leave notice not delivered");
                    }
                }
            }))
            .await;
        }

        self.ctx.shutdown.send_replace(true);
        self.ctx.set_state(JoinState::NotJoined);
        tracing::info!(address = %local.address(), "Cluster service stopped");
    }
}
