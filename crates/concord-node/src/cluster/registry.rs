//! Member registry - the node's authoritative membership view.
//!
//! Every mutation runs inside `watch::Sender::send_if_modified`, which holds
//! the channel's write lock for the duration of the closure. That makes the
//! registry a single writer: a join commit and a heartbeat removal can never
//! both read version `v` and both publish `v + 1`. Readers get an
//! `Arc<MembershipView>` snapshot and never see a half-applied change.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use concord_common::constants::MAX_PENDING_VIEWS;
use concord_common::{Address, Member, MembershipView};

/// Outcome of applying a master's view update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewApply {
    /// Applied; carries the resulting version (after draining buffered updates)
    Applied(u64),
    /// Version already applied or superseded; dropped
    Stale,
    /// Arrived ahead of a gap; held until the gap closes
    Buffered,
}

pub struct MemberRegistry {
    local: Member,
    view: watch::Sender<Arc<MembershipView>>,
    /// Out-of-order updates keyed by version
    pending: Mutex<BTreeMap<u64, MembershipView>>,
}

impl MemberRegistry {
    /// Registry holding only the local member, at version 0
    pub fn new(local: Member) -> Self {
        let initial = MembershipView::singleton(local.clone(), 0);
        let (view, _) = watch::channel(Arc::new(initial));
        Self {
            local,
            view,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of the current view
    pub fn current_view(&self) -> Arc<MembershipView> {
        self.view.borrow().clone()
    }

    /// Receiver that observes every published view
    pub fn watch(&self) -> watch::Receiver<Arc<MembershipView>> {
        self.view.subscribe()
    }

    /// The local member as it appears in the current view
    pub fn local_member(&self) -> Member {
        let view = self.current_view();
        view.members()
            .iter()
            .find(|m| m.is_same(&self.local))
            .cloned()
            .unwrap_or_else(|| self.local.clone())
    }

    pub fn local_address(&self) -> Address {
        self.local.address()
    }

    pub fn is_local_lite(&self) -> bool {
        self.local.is_lite()
    }

    /// Add a member, stamping it with the new version.
    ///
    /// Adding an instance that is already present is a no-op returning the
    /// current version. A different instance at the same address (a restarted
    /// process) is replaced in the same mutation.
    pub fn add(&self, member: Member) -> u64 {
        let mut version = 0;
        self.view.send_if_modified(|view| {
            if view.contains(&member) {
                version = view.version();
                return false;
            }

            let next = view.version() + 1;
            let mut members: Vec<Member> = view
                .members()
                .iter()
                .filter(|m| m.address() != member.address() && m.id() != member.id())
                .cloned()
                .collect();
            members.push(member.admitted_at(next));

            *view = Arc::new(MembershipView::new(next, members));
            version = next;
            true
        });
        version
    }

    /// Remove the member at `address`.
    ///
    /// Removing an absent member, or the local member, is a no-op returning
    /// the current version.
    pub fn remove(&self, address: Address) -> u64 {
        let mut version = 0;
        self.view.send_if_modified(|view| {
            version = view.version();
            if address == self.local.address() || view.member_at(address).is_none() {
                return false;
            }

            let next = view.version() + 1;
            let members = view
                .members()
                .iter()
                .filter(|m| m.address() != address)
                .cloned()
                .collect();

            *view = Arc::new(MembershipView::new(next, members));
            version = next;
            true
        });
        version
    }

    /// Adopt a master's committed view wholesale (join and re-join).
    ///
    /// Buffered updates newer than the installed view are drained in order;
    /// older ones are dropped. Returns false if the view does not contain the
    /// local member.
    pub fn install(&self, installed: MembershipView) -> bool {
        if !installed.contains(&self.local) {
            return false;
        }

        let mut pending = self.pending();
        self.view.send_modify(|view| {
            *view = Arc::new(installed);
            drain_pending(view, &mut pending);
        });
        true
    }

    /// Apply a master broadcast in version order.
    ///
    /// Versions at or below the applied one are dropped. A version ahead of
    /// the next expected one is buffered; if the buffer overflows the registry
    /// fast-forwards to the newest buffered view, since every update is a
    /// complete view.
    pub fn apply_update(&self, update: MembershipView) -> ViewApply {
        let mut pending = self.pending();
        let mut outcome = ViewApply::Stale;

        self.view.send_if_modified(|view| {
            let current = view.version();
            if update.version() <= current {
                return false;
            }

            if update.version() > current + 1 {
                pending.insert(update.version(), update.clone());
                if pending.len() <= MAX_PENDING_VIEWS {
                    outcome = ViewApply::Buffered;
                    return false;
                }

                tracing::warn!(
                    from = current,
                    buffered = pending.len(),
                    "view update gap did not close, fast-forwarding"
                );
                if let Some((_, newest)) = pending.pop_last() {
                    *view = Arc::new(newest);
                }
                pending.clear();
                outcome = ViewApply::Applied(view.version());
                return true;
            }

            *view = Arc::new(update.clone());
            drain_pending(view, &mut pending);
            outcome = ViewApply::Applied(view.version());
            true
        });

        outcome
    }

    /// Jump straight to a newer complete view from the current master,
    /// skipping whatever versions were lost in between.
    pub fn catch_up(&self, update: MembershipView) -> ViewApply {
        if !update.contains(&self.local) {
            return ViewApply::Stale;
        }

        let mut pending = self.pending();
        let mut outcome = ViewApply::Stale;
        self.view.send_if_modified(|view| {
            if update.version() <= view.version()
                || update.master_address() != view.master_address()
            {
                return false;
            }

            tracing::debug!(from = view.version(), to = update.version(), "catching up on missed views");
            *view = Arc::new(update.clone());
            drain_pending(view, &mut pending);
            outcome = ViewApply::Applied(view.version());
            true
        });
        outcome
    }

    /// Hold an update that arrived before the join completed
    pub fn buffer(&self, update: MembershipView) {
        self.pending().insert(update.version(), update);
    }

    /// Drop every member but the local one (leaving the current cluster).
    ///
    /// The version still moves forward; buffered updates are discarded.
    pub fn reset_to_local(&self) -> u64 {
        self.pending().clear();

        let mut version = 0;
        self.view.send_modify(|view| {
            let next = view.version() + 1;
            *view = Arc::new(MembershipView::singleton(self.local.admitted_at(next), next));
            version = next;
        });
        version
    }

    fn pending(&self) -> MutexGuard<'_, BTreeMap<u64, MembershipView>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Apply contiguous buffered updates from the same master and discard
/// superseded ones
fn drain_pending(view: &mut Arc<MembershipView>, pending: &mut BTreeMap<u64, MembershipView>) {
    let current = view.version();
    pending.retain(|&version, _| version > current);

    while let Some(next) = pending.remove(&(view.version() + 1)) {
        if next.master_address() != view.master_address() {
            pending.clear();
            break;
        }
        *view = Arc::new(next);
    }
}
