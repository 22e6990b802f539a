//! State shared by the protocol components of one node.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};

use concord_common::{
    Address, ClusterError, ClusterMessage, ClusterResult, Envelope, JoinState, Member,
    MembershipView,
};

use super::calls::PendingCalls;
use super::discovery::DiscoveryProvider;
use super::registry::MemberRegistry;
use crate::config::ClusterConfig;
use crate::transport::Transport;

/// Events kept for slow subscribers before they start lagging
const EVENT_BUFFER: usize = 256;

/// Membership change notification for embedders
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    MemberAdded(Member),
    MemberRemoved(Member),
    MasterChanged {
        previous: Option<Address>,
        current: Option<Address>,
    },
    StateChanged(JoinState),
    MergeStarted {
        survivor: Address,
    },
}

/// Waiter for the committed view while in `WAITING_APPROVAL`
pub(crate) struct Approval {
    pub master: Address,
    pub view: oneshot::Sender<MembershipView>,
}

pub(crate) struct NodeContext {
    pub config: ClusterConfig,
    pub registry: MemberRegistry,
    pub transport: Arc<dyn Transport>,
    pub discovery: DiscoveryProvider,
    pub calls: PendingCalls,
    pub state: watch::Sender<JoinState>,
    pub events: broadcast::Sender<MembershipEvent>,
    /// Flips to true once; every task watches it
    pub shutdown: watch::Sender<bool>,
    pub approval: Mutex<Option<Approval>>,
    /// Set while a join sequence is running
    pub joining: AtomicBool,
    /// Set while this node is leaving for a merge survivor
    pub merging: AtomicBool,
}

impl NodeContext {
    pub fn new(
        config: ClusterConfig,
        local: Member,
        transport: Arc<dyn Transport>,
        discovery: DiscoveryProvider,
    ) -> Self {
        let (state, _) = watch::channel(JoinState::NotJoined);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry: MemberRegistry::new(local),
            transport,
            discovery,
            calls: PendingCalls::new(),
            state,
            events,
            shutdown,
            approval: Mutex::new(None),
            joining: AtomicBool::new(false),
            merging: AtomicBool::new(false),
        }
    }

    pub fn local_address(&self) -> Address {
        self.registry.local_address()
    }

    pub fn state(&self) -> JoinState {
        *self.state.borrow()
    }

    pub fn set_state(&self, next: JoinState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            tracing::debug!(from = ?*state, to = ?next, "Join state changed");
            *state = next;
            true
        });

        if changed {
            let _ = self.events.send(MembershipEvent::StateChanged(next));
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the node starts shutting down
    pub async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Joined and first in line by the ordering rule
    pub fn is_master(&self) -> bool {
        self.state().is_joined()
            && self.registry.current_view().master_address() == Some(self.local_address())
    }

    /// Fire-and-forget message
    pub async fn send(&self, to: Address, message: ClusterMessage) -> ClusterResult<()> {
        let envelope = Envelope::new(self.local_address(), message);
        self.transport.send(to, envelope).await
    }

    /// Answer a request, echoing its call id
    pub async fn reply(&self, request: &Envelope, message: ClusterMessage) {
        let kind = message.kind();
        let envelope = request.reply(self.local_address(), message);
        if let Err(e) = self.transport.send(request.from, envelope).await {
            tracing::debug!(to = %request.from, kind, error = %e, "Reply not delivered");
        }
    }

    /// Send a request and wait for the matching reply.
    ///
    /// A timeout surfaces as `MemberUnreachable`. Dropping the returned
    /// future abandons the call.
    pub async fn call(
        &self,
        to: Address,
        message: ClusterMessage,
        timeout: Duration,
    ) -> ClusterResult<Envelope> {
        let mut slot = self.calls.register();
        let envelope = Envelope::request(self.local_address(), slot.id, message);
        self.transport.send(to, envelope).await?;

        match tokio::time::timeout(timeout, &mut slot.reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClusterError::Cancelled),
            Err(_) => Err(ClusterError::MemberUnreachable(to)),
        }
    }

    /// Push a committed view to every member except the local node and
    /// `skip`. Deliveries run in the background; a slow member never holds
    /// up the caller.
    pub fn broadcast_view(self: &Arc<Self>, view: &MembershipView, skip: Option<Address>) {
        let local = self.local_address();
        let targets: Vec<Address> = view
            .addresses()
            .filter(|&addr| addr != local && Some(addr) != skip)
            .collect();

        for to in targets {
            let ctx = self.clone();
            let message = ClusterMessage::ViewUpdate { view: view.clone() };
            tokio::spawn(async move {
                if let Err(e) = ctx.send(to, message).await {
                    tracing::debug!(%to, error = %e, "View update not delivered");
                }
            });
        }
    }

    /// Publish the difference between two views as events
    pub fn announce(&self, before: &MembershipView, after: &MembershipView) {
        for member in after.members().iter().filter(|m| !before.contains(m)) {
            let _ = self.events.send(MembershipEvent::MemberAdded(member.clone()));
        }
        for member in before.members().iter().filter(|m| !after.contains(m)) {
            let _ = self.events.send(MembershipEvent::MemberRemoved(member.clone()));
        }

        let previous = before.master_address();
        let current = after.master_address();
        if previous != current {
            tracing::info!(
                previous = ?previous,
                current = ?current,
                "Master changed"
            );
            let _ = self
                .events
                .send(MembershipEvent::MasterChanged { previous, current });
        }
    }

    pub fn approval(&self) -> MutexGuard<'_, Option<Approval>> {
        self.approval.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
