//! Join coordinator - the handshake a node performs to enter a cluster.
//!
//! ```text
//! NOT_JOINED ──► CONNECTING ──► WAITING_APPROVAL ──► JOINED
//!    ▲   │           │  ▲ redirect
//!    │   │           └──┘
//!    │   └──► STANDALONE_MASTER   (full member, no master after N rounds)
//!    └─────── approval timeout    (bounded restarts)
//! ```
//!
//! Candidates are contacted concurrently and the first authoritative answer
//! (accept or redirect) wins; the remaining calls are dropped with the round.
//! A full member only promotes itself when no reachable full member with a
//! smaller address is also looking for a master, so nodes started together
//! settle on one master instead of several.

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

use concord_common::{
    Address, ClusterError, ClusterMessage, ClusterResult, Envelope, JoinRequest, JoinResponse,
    JoinState, MemberId, MembershipView,
};

use super::context::{Approval, NodeContext};
use super::registry::ViewApply;

/// Where a join sequence looks for its master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinTarget {
    /// Ask the configured discovery provider each round
    Discovery,
    /// Contact this master only (merge hand-off); never promotes
    Master(Address),
}

enum RoundOutcome {
    Accepted {
        master: Address,
        view: MembershipView,
    },
    Redirect(Address),
    NoMaster {
        /// Smallest-address full member that answered "not joined"
        senior: Option<Address>,
    },
}

/// Clears the `joining` flag however the sequence ends
struct JoinGuard<'a>(&'a AtomicBool);

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct JoinCoordinator {
    ctx: Arc<NodeContext>,
}

impl JoinCoordinator {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Run a complete join sequence.
    ///
    /// Leaves whatever cluster the node was in, then retries up to
    /// `join.max_attempts` times when approval times out. Any other failure
    /// ends the sequence with `JoinFailure`. Shutdown cancels it.
    pub async fn join(&self, target: JoinTarget) -> ClusterResult<JoinState> {
        if self.ctx.joining.swap(true, Ordering::AcqRel) {
            return Err(ClusterError::Protocol("join already in progress".to_string()));
        }
        let _guard = JoinGuard(&self.ctx.joining);

        if self.ctx.is_stopped() {
            return Err(ClusterError::Cancelled);
        }

        let believed_master = match target {
            JoinTarget::Master(master) => Some(master),
            JoinTarget::Discovery => self
                .ctx
                .registry
                .current_view()
                .master_address()
                .filter(|&m| m != self.ctx.local_address()),
        };

        tokio::select! {
            result = self.join_sequence(target, believed_master) => result,
            _ = self.ctx.stopped() => {
                self.ctx.approval().take();
                self.ctx.set_state(JoinState::NotJoined);
                Err(ClusterError::Cancelled)
            }
        }
    }

    async fn join_sequence(
        &self,
        target: JoinTarget,
        believed_master: Option<Address>,
    ) -> ClusterResult<JoinState> {
        let max_attempts = self.ctx.config.join.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(target, believed_master).await {
                Ok(state) => return Ok(state),
                Err(err @ ClusterError::JoinTimeout { .. }) if attempt < max_attempts => {
                    tracing::warn!(attempt, error = %err, "Join approval timed out, starting over");
                }
                Err(err) => {
                    tracing::error!(attempt, error = %err, "Join failed");
                    self.ctx.set_state(JoinState::NotJoined);
                    return Err(ClusterError::join_failure(attempt, err));
                }
            }
        }
    }

    async fn attempt(
        &self,
        target: JoinTarget,
        believed_master: Option<Address>,
    ) -> ClusterResult<JoinState> {
        let ctx = &self.ctx;
        let config = &ctx.config.join;
        let lite = ctx.registry.is_local_lite();
        let may_promote = !lite && target == JoinTarget::Discovery;

        let before = ctx.registry.current_view();
        ctx.registry.reset_to_local();
        ctx.announce(&before, &ctx.registry.current_view());
        ctx.set_state(JoinState::NotJoined);

        let mut rounds = 0u32;
        let mut hops = 0u32;
        let mut redirect: Option<Address> = None;

        loop {
            let candidates = match (redirect.take(), target) {
                (Some(master), _) => vec![master],
                (None, JoinTarget::Master(master)) => vec![master],
                (None, JoinTarget::Discovery) => ctx.discovery.discover().await,
            };

            let outcome = if candidates.is_empty() {
                RoundOutcome::NoMaster { senior: None }
            } else {
                ctx.set_state(JoinState::Connecting);
                self.connect(&candidates, believed_master).await
            };

            match outcome {
                RoundOutcome::Accepted { master, view } => {
                    return self.await_approval(master, view).await;
                }
                RoundOutcome::Redirect(master) => {
                    hops += 1;
                    if hops > config.max_redirects {
                        return Err(ClusterError::RedirectLoopExceeded { hops });
                    }
                    tracing::debug!(%master, hops, "Following redirect to master");
                    redirect = Some(master);
                }
                RoundOutcome::NoMaster { senior } => {
                    hops = 0;
                    rounds += 1;

                    if rounds >= config.max_discovery_rounds {
                        if may_promote && senior.is_none() {
                            return Ok(self.become_standalone());
                        }
                        if rounds == config.max_discovery_rounds {
                            let exhausted = ClusterError::DiscoveryExhausted { rounds };
                            match senior {
                                Some(senior) => tracing::info!(
                                    %senior,
                                    "Deferring mastership to a lower-address member"
                                ),
                                None => tracing::warn!(
                                    error = %exhausted,
                                    lite,
                                    "No master reachable, still searching"
                                ),
                            }
                        }
                    }

                    ctx.set_state(JoinState::NotJoined);
                    tokio::time::sleep(self.retry_delay()).await;
                }
            }
        }
    }

    /// Ask every candidate concurrently; the first accept or redirect wins
    async fn connect(&self, candidates: &[Address], believed_master: Option<Address>) -> RoundOutcome {
        let ctx = &self.ctx;
        let local = ctx.registry.local_member();
        let request = JoinRequest::for_member(&local, believed_master);
        let timeout = ctx.config.join_timeout();

        let mut inflight: FuturesUnordered<_> = candidates
            .iter()
            .map(|&candidate| {
                let message = ClusterMessage::JoinRequest(request.clone());
                async move { (candidate, ctx.call(candidate, message, timeout).await) }
            })
            .collect();

        let mut senior: Option<Address> = None;
        while let Some((candidate, result)) = inflight.next().await {
            let response = match result {
                Ok(Envelope {
                    message: ClusterMessage::JoinResponse(response),
                    ..
                }) => response,
                Ok(other) => {
                    tracing::debug!(%candidate, kind = other.message.kind(), "Unexpected join reply");
                    continue;
                }
                Err(e) => {
                    tracing::debug!(%candidate, error = %e, "Join request unanswered");
                    continue;
                }
            };

            match response {
                JoinResponse::Accepted { view } => {
                    return RoundOutcome::Accepted {
                        master: candidate,
                        view,
                    };
                }
                JoinResponse::Redirect { master } if master != local.address() => {
                    return RoundOutcome::Redirect(master);
                }
                JoinResponse::Redirect { .. } => {
                    tracing::debug!(%candidate, "Candidate points back at us, ignoring");
                }
                JoinResponse::NotJoined { lite } => {
                    if !lite && candidate < local.address() {
                        senior = Some(senior.map_or(candidate, |s| s.min(candidate)));
                    }
                }
                JoinResponse::Rejected { reason } => {
                    tracing::warn!(%candidate, %reason, "Join request rejected");
                }
            }
        }

        RoundOutcome::NoMaster { senior }
    }

    /// Wait for the master's commit that includes us, then install it
    async fn await_approval(&self, master: Address, view: MembershipView) -> ClusterResult<JoinState> {
        let ctx = &self.ctx;
        ctx.set_state(JoinState::WaitingApproval);
        let local = ctx.registry.local_member();

        let committed = if view.contains(&local) && view.master_address() == Some(master) {
            view
        } else {
            let (tx, rx) = oneshot::channel();
            *ctx.approval() = Some(Approval { master, view: tx });

            match tokio::time::timeout(ctx.config.join_timeout(), rx).await {
                Ok(Ok(view)) => view,
                _ => {
                    ctx.approval().take();
                    return Err(ClusterError::JoinTimeout {
                        master,
                        timeout_ms: ctx.config.join.timeout_ms,
                    });
                }
            }
        };

        let before = ctx.registry.current_view();
        if !ctx.registry.install(committed) {
            return Err(ClusterError::Protocol(format!(
                "{master} committed a view without the local member"
            )));
        }
        let after = ctx.registry.current_view();

        ctx.set_state(JoinState::Joined);
        ctx.announce(&before, &after);
        tracing::info!(
            %master,
            members = after.len(),
            version = after.version(),
            lite = local.is_lite(),
            "Joined cluster"
        );
        Ok(JoinState::Joined)
    }

    fn become_standalone(&self) -> JoinState {
        let ctx = &self.ctx;
        let before = ctx.registry.current_view();
        let version = ctx.registry.reset_to_local();
        ctx.set_state(JoinState::StandaloneMaster);
        ctx.announce(&before, &ctx.registry.current_view());
        tracing::info!(version, "No master found, acting as standalone master");
        JoinState::StandaloneMaster
    }

    fn retry_delay(&self) -> Duration {
        let base = self.ctx.config.discovery_interval();
        let spread = (base.as_millis() as u64 / 4).max(1);
        base + Duration::from_millis(rand::rng().random_range(0..spread))
    }

    /// Join again in the background until it succeeds or the node stops.
    ///
    /// Does nothing if a join sequence is already running; that sequence
    /// ends in a fresh view either way.
    pub fn spawn_rejoin(&self, target: JoinTarget) {
        if self.ctx.joining.load(Ordering::Acquire) || self.ctx.is_stopped() {
            return;
        }

        let join = self.clone();
        tokio::spawn(async move {
            loop {
                if join.ctx.joining.load(Ordering::Acquire) {
                    tracing::debug!("Join already running, not starting another");
                    return;
                }
                match join.join(target).await {
                    Ok(state) => {
                        tracing::debug!(?state, "Re-join finished");
                        return;
                    }
                    Err(ClusterError::Cancelled) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "Re-join failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(join.retry_delay()) => {}
                            _ = join.ctx.stopped() => return,
                        }
                    }
                }
            }
        });
    }

    /// Answer a join request (master side)
    pub async fn handle_join_request(&self, envelope: &Envelope, request: JoinRequest) {
        let response = self.admit(request);
        self.ctx
            .reply(envelope, ClusterMessage::JoinResponse(response))
            .await;
    }

    fn admit(&self, request: JoinRequest) -> JoinResponse {
        let ctx = &self.ctx;
        let local = ctx.local_address();
        let state = ctx.state();

        if request.address == local {
            return JoinResponse::Rejected {
                reason: format!("{local} is this node's own address"),
            };
        }
        if !state.is_joined() || ctx.merging.load(Ordering::Acquire) {
            return JoinResponse::NotJoined {
                lite: ctx.registry.is_local_lite(),
            };
        }

        let before = ctx.registry.current_view();
        match before.master_address() {
            Some(master) if master == local => {}
            Some(master) => return JoinResponse::Redirect { master },
            None => {
                return JoinResponse::NotJoined {
                    lite: ctx.registry.is_local_lite(),
                };
            }
        }

        let version = ctx.registry.add(request.member());
        let after = ctx.registry.current_view();

        if version == before.version() {
            tracing::debug!(member = %request.address, "Member already admitted, resending view");
        } else {
            tracing::info!(
                member = %request.address,
                lite = request.lite,
                version,
                members = after.len(),
                "Member admitted"
            );
            if state == JoinState::StandaloneMaster {
                ctx.set_state(JoinState::Joined);
            }
            ctx.broadcast_view(&after, Some(request.address));
            ctx.announce(&before, &after);
        }

        JoinResponse::Accepted {
            view: (*after).clone(),
        }
    }

    /// Apply a view pushed by a master
    pub fn handle_view_update(&self, from: Address, view: MembershipView) {
        self.receive_view(from, view, false);
    }

    /// Apply a complete view our master sent because we fell behind
    pub fn handle_view_sync(&self, from: Address, view: MembershipView) {
        self.receive_view(from, view, true);
    }

    fn receive_view(&self, from: Address, view: MembershipView, sync: bool) {
        let ctx = &self.ctx;
        let local = ctx.registry.local_member();
        let from_its_master = view.master_address() == Some(from);

        match ctx.state() {
            JoinState::WaitingApproval => {
                let mut approval = ctx.approval();
                let awaited = approval.as_ref().is_some_and(|a| a.master == from);
                if awaited && from_its_master && view.contains(&local) {
                    if let Some(waiter) = approval.take() {
                        let _ = waiter.view.send(view);
                    }
                } else if from_its_master && view.contains(&local) {
                    ctx.registry.buffer(view);
                }
            }
            JoinState::NotJoined | JoinState::Connecting => {
                if from_its_master && view.contains(&local) {
                    ctx.registry.buffer(view);
                }
            }
            JoinState::Joined | JoinState::StandaloneMaster => {
                let current = ctx.registry.current_view();
                if from_its_master && view.contains(&local) && is_successor(&current, from, &view) {
                    tracing::info!(master = %from, "Successor took over before we noticed the master loss");
                    ctx.registry.install(view);
                    ctx.announce(&current, &ctx.registry.current_view());
                    return;
                }
                if !from_its_master || current.master_address() != Some(from) {
                    tracing::debug!(%from, "Ignoring view from a node that is not our master");
                    return;
                }

                if !view.contains(&local) {
                    if view.version() > current.version() {
                        tracing::warn!(master = %from, "Master dropped us from the cluster, re-joining");
                        self.spawn_rejoin(JoinTarget::Discovery);
                    }
                    return;
                }

                let outcome = if sync {
                    ctx.registry.catch_up(view)
                } else {
                    ctx.registry.apply_update(view)
                };
                match outcome {
                    ViewApply::Applied(version) => {
                        let after = ctx.registry.current_view();
                        tracing::debug!(version, members = after.len(), "Applied view update");
                        ctx.announce(&current, &after);
                    }
                    ViewApply::Buffered => {
                        tracing::debug!(%from, applied = current.version(), "View update ahead of gap, buffered");
                    }
                    ViewApply::Stale => {
                        tracing::trace!(%from, "Stale view update dropped");
                    }
                }
            }
        }
    }

    /// Whether a leave notice names the member we know at that address
    pub fn is_known_instance(&self, from: Address, id: MemberId) -> bool {
        self.ctx
            .registry
            .current_view()
            .member_at(from)
            .is_some_and(|m| m.id() == id)
    }
}

/// `from` is who our own view elects once the current master is gone, and
/// its newer view no longer lists that master
fn is_successor(current: &MembershipView, from: Address, update: &MembershipView) -> bool {
    let Some(master) = current.master_address() else {
        return false;
    };
    if master == from || update.member_at(master).is_some() || update.version() <= current.version() {
        return false;
    }

    let remaining = current
        .members()
        .iter()
        .filter(|m| m.address() != master)
        .cloned()
        .collect();
    MembershipView::new(current.version(), remaining).master_address() == Some(from)
}
