//! Request/response correlation over a one-way transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use concord_common::{CallId, Envelope};

/// Calls waiting for a reply, keyed by call id
#[derive(Default)]
pub struct PendingCalls {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<CallId, oneshot::Sender<Envelope>>>,
}

/// Registration of one in-flight call; unregisters itself when dropped so
/// abandoned calls (timeouts, first-response-wins) leave nothing behind.
pub struct CallSlot<'a> {
    calls: &'a PendingCalls,
    pub id: CallId,
    pub reply: oneshot::Receiver<Envelope>,
}

impl Drop for CallSlot<'_> {
    fn drop(&mut self) {
        self.calls.waiting().remove(&self.id);
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> CallSlot<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiting().insert(id, tx);
        CallSlot {
            calls: self,
            id,
            reply: rx,
        }
    }

    /// Hand a reply to its caller. Returns false for replies nobody waits
    /// for any more (late, duplicated, or never requested).
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let Some(id) = envelope.call_id else {
            return false;
        };
        match self.waiting().remove(&id) {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.waiting().len()
    }

    fn waiting(&self) -> MutexGuard<'_, HashMap<CallId, oneshot::Sender<Envelope>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
