//! Split-brain detection and merge.
//!
//! Only the master looks for split brain. Each cycle it runs discovery,
//! probes every candidate outside its own view, and if exactly one foreign
//! master answers it proposes a merge. Both masters evaluate the same
//! `MergeIntent`, so they agree on the survivor without a further round
//! trip. The losing master tells its members to re-join through the winner
//! and then re-joins itself.

use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::{Instant, MissedTickBehavior};

use concord_common::{
    Address, ClusterError, ClusterMessage, ClusterResult, Envelope, MergeReply, MembershipView,
};

use super::context::{MembershipEvent, NodeContext};
use super::join::{JoinCoordinator, JoinTarget};

/// One side of a split brain, as seen when the merge was proposed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSide {
    pub master: Address,
    pub version: u64,
    pub member_count: usize,
}

impl ClusterSide {
    fn of(view: &MembershipView) -> ClusterResult<Self> {
        let master = view.master_address().ok_or_else(|| {
            ClusterError::MergeAmbiguous(format!("view v{} has no master", view.version()))
        })?;
        Ok(Self {
            master,
            version: view.version(),
            member_count: view.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Survivor {
    Local,
    Remote,
}

/// Pending decision between two clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeIntent {
    pub local: ClusterSide,
    pub remote: ClusterSide,
}

impl MergeIntent {
    pub fn new(local: &MembershipView, remote: &MembershipView) -> ClusterResult<Self> {
        let intent = Self {
            local: ClusterSide::of(local)?,
            remote: ClusterSide::of(remote)?,
        };

        if intent.local.master == intent.remote.master {
            return Err(ClusterError::MergeAmbiguous(format!(
                "both sides report master {}",
                intent.local.master
            )));
        }
        if local.overlaps(remote) {
            return Err(ClusterError::MergeAmbiguous(
                "member sets overlap".to_string(),
            ));
        }
        Ok(intent)
    }

    /// Larger cluster survives; ties go to the smaller master address
    pub fn survivor(&self) -> Survivor {
        let local = (std::cmp::Reverse(self.local.member_count), self.local.master);
        let remote = (std::cmp::Reverse(self.remote.member_count), self.remote.master);
        if local < remote {
            Survivor::Local
        } else {
            Survivor::Remote
        }
    }

    pub fn survivor_master(&self) -> Address {
        match self.survivor() {
            Survivor::Local => self.local.master,
            Survivor::Remote => self.remote.master,
        }
    }
}

#[derive(Clone)]
pub struct MergeCoordinator {
    ctx: Arc<NodeContext>,
    join: JoinCoordinator,
}

impl MergeCoordinator {
    pub(crate) fn new(ctx: Arc<NodeContext>, join: JoinCoordinator) -> Self {
        Self { ctx, join }
    }

    /// Background detection loop; runs until shutdown
    pub async fn run(self) {
        let period = self.ctx.config.merge_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.ctx.stopped() => break,
            }

            tokio::select! {
                result = self.detect() => match result {
                    Ok(()) => {}
                    Err(e @ ClusterError::MergeAmbiguous(_)) => {
                        tracing::warn!(error = %e, "Merge abandoned until next cycle");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Split-brain check failed");
                    }
                },
                _ = self.ctx.stopped() => break,
            }
        }

        tracing::info!("Merge coordinator stopping");
    }

    /// One detection cycle
    pub async fn detect(&self) -> ClusterResult<()> {
        let ctx = &self.ctx;
        if !ctx.is_master()
            || ctx.merging.load(Ordering::Acquire)
            || ctx.joining.load(Ordering::Acquire)
        {
            return Ok(());
        }

        let view = ctx.registry.current_view();
        let local = ctx.local_address();
        let candidates: Vec<Address> = ctx
            .discovery
            .discover()
            .await
            .into_iter()
            .filter(|&addr| view.member_at(addr).is_none())
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let timeout = ctx.config.join_timeout();
        let answers = join_all(candidates.iter().map(|&candidate| async move {
            (
                candidate,
                ctx.call(candidate, ClusterMessage::SplitBrainProbe, timeout).await,
            )
        }))
        .await;

        let mut masters = BTreeSet::new();
        for (candidate, answer) in answers {
            match answer {
                Ok(Envelope {
                    message: ClusterMessage::SplitBrainInfo(summary),
                    ..
                }) => {
                    if let (true, Some(master)) = (summary.joined, summary.master) {
                        if master != local && view.member_at(master).is_none() {
                            masters.insert(master);
                        }
                    }
                }
                Ok(other) => {
                    tracing::debug!(%candidate, kind = other.message.kind(), "Unexpected split-brain answer");
                }
                Err(e) => {
                    tracing::trace!(%candidate, error = %e, "Split-brain probe unanswered");
                }
            }
        }

        if masters.len() > 1 {
            return Err(ClusterError::MergeAmbiguous(format!(
                "{} foreign masters answered in one cycle",
                masters.len()
            )));
        }
        let Some(foreign) = masters.pop_first() else {
            return Ok(());
        };

        tracing::info!(%foreign, members = view.len(), "Split brain detected, proposing merge");
        let proposal = ClusterMessage::MergeProposal {
            view: (*view).clone(),
        };
        let reply = ctx
            .call(foreign, proposal, ctx.config.merge_timeout())
            .await?;

        match reply.message {
            ClusterMessage::MergeReply(MergeReply::Accepted { view: remote }) => {
                if !ctx.is_master() {
                    return Ok(());
                }
                let intent = settled_intent(&view, &ctx.registry.current_view(), &remote)?;
                match intent.survivor() {
                    Survivor::Local => {
                        tracing::info!(
                            absorbing = %foreign,
                            remote_members = intent.remote.member_count,
                            "Merge decided in our favour"
                        );
                    }
                    Survivor::Remote => self.leave_for(foreign, true).await,
                }
                Ok(())
            }
            ClusterMessage::MergeReply(MergeReply::Refused { reason }) => Err(
                ClusterError::MergeAmbiguous(format!("{foreign} refused the merge: {reason}")),
            ),
            other => Err(ClusterError::Protocol(format!(
                "unexpected reply to merge proposal: {}",
                other.kind()
            ))),
        }
    }

    /// Answer a foreign master's merge proposal
    pub async fn handle_proposal(&self, envelope: &Envelope, remote: MembershipView) {
        let (reply, losing_to) = self.evaluate(envelope.from, &remote);
        self.ctx
            .reply(envelope, ClusterMessage::MergeReply(reply))
            .await;

        if let Some(winner) = losing_to {
            let merge = self.clone();
            tokio::spawn(async move { merge.leave_for(winner, true).await });
        }
    }

    fn evaluate(&self, from: Address, remote: &MembershipView) -> (MergeReply, Option<Address>) {
        let ctx = &self.ctx;
        let refuse = |reason: &str| {
            (
                MergeReply::Refused {
                    reason: reason.to_string(),
                },
                None,
            )
        };

        if !ctx.is_master() {
            return refuse("not the master");
        }
        if ctx.merging.load(Ordering::Acquire) {
            return refuse("merge already in progress");
        }
        if remote.master_address() != Some(from) {
            return refuse("proposal must come from its cluster's master");
        }

        let local = ctx.registry.current_view();
        match MergeIntent::new(&local, remote) {
            Ok(intent) => {
                let losing_to = (intent.survivor() == Survivor::Remote).then_some(from);
                tracing::info!(
                    %from,
                    survivor = %intent.survivor_master(),
                    "Merge proposal accepted"
                );
                (
                    MergeReply::Accepted {
                        view: (*local).clone(),
                    },
                    losing_to,
                )
            }
            Err(e) => refuse(&e.to_string()),
        }
    }

    /// Our master lost a merge and tells us where to go
    pub fn handle_instruction(&self, from: Address, winner: Address) {
        let ctx = &self.ctx;
        let current = ctx.registry.current_view();
        if from == ctx.local_address() || current.master_address() != Some(from) {
            tracing::debug!(%from, "Ignoring merge instruction from a node that is not our master");
            return;
        }
        if ctx.merging.load(Ordering::Acquire) {
            return;
        }

        let merge = self.clone();
        tokio::spawn(async move { merge.leave_for(winner, false).await });
    }

    /// Abandon the current cluster and re-join through `winner`
    async fn leave_for(&self, winner: Address, instruct_members: bool) {
        let ctx = &self.ctx;
        if ctx.merging.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = ctx.events.send(MembershipEvent::MergeStarted { survivor: winner });

        if instruct_members {
            let view = ctx.registry.current_view();
            let local = ctx.local_address();
            tracing::info!(%winner, members = view.len(), "Merge lost, moving cluster to survivor");

            join_all(view.addresses().filter(|&a| a != local).map(|member| async move {
                let instruction = ClusterMessage::MergeInstruction { master: winner };
                if let Err(e) = ctx.send(member, instruction).await {
                    tracing::debug!(%member, error = %e, "Merge instruction not delivered");
                }
            }))
            .await;
        } else {
            tracing::info!(%winner, "Re-joining merge survivor");
        }

        let rejoin = tokio::time::timeout(
            ctx.config.merge_timeout(),
            self.join.join(JoinTarget::Master(winner)),
        )
        .await;

        ctx.merging.store(false, Ordering::Release);
        match rejoin {
            Ok(Ok(state)) => tracing::info!(%winner, ?state, "Merged into surviving cluster"),
            Ok(Err(ClusterError::Cancelled)) => {}
            Ok(Err(e)) => {
                tracing::warn!(%winner, error = %e, "Merge re-join failed, falling back to discovery");
                self.join.spawn_rejoin(JoinTarget::Discovery);
            }
            Err(_) => {
                tracing::warn!(
                    %winner,
                    timeout_ms = ctx.config.merge.timeout_ms,
                    "Merge re-join timed out, falling back to discovery"
                );
                self.join.spawn_rejoin(JoinTarget::Discovery);
            }
        }
    }
}

/// Intent for a proposal answered with `remote`.
///
/// The responder decided on the view we sent, so we decide on it too. If our
/// view moved on while the proposal was in flight the two sides no longer
/// share inputs and the attempt is dropped.
fn settled_intent(
    sent: &MembershipView,
    current: &MembershipView,
    remote: &MembershipView,
) -> ClusterResult<MergeIntent> {
    if current.version() != sent.version() {
        return Err(ClusterError::MergeAmbiguous(format!(
            "view changed from v{} to v{} during the proposal",
            sent.version(),
            current.version()
        )));
    }
    MergeIntent::new(sent, remote)
}
