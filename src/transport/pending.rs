//! Outstanding RPC calls keyed by correlation id.
//!
//! Every entry is resolved at most once: resolution and cancellation both
//! start by removing the entry, so whichever removes first wins and the other
//! becomes a no-op.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::bus::TransportError;

/// Reply payload, or the transport failure that ended the call.
pub type CallOutcome = std::result::Result<Vec<u8>, TransportError>;

/// Concurrent map of pending calls.
#[derive(Clone, Default)]
pub struct PendingCalls {
    calls: Arc<DashMap<String, oneshot::Sender<CallOutcome>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call under a fresh correlation id.
    pub fn register(&self) -> (String, oneshot::Receiver<CallOutcome>) {
        let id = Uuid::new_v4().to_string();
        let receiver = self.register_id(id.clone());
        (id, receiver)
    }

    /// Register a call under a caller-chosen correlation id.
    fn register_id(&self, id: String) -> oneshot::Receiver<CallOutcome> {
        let (sender, receiver) = oneshot::channel();
        self.calls.insert(id, sender);
        receiver
    }

    /// Complete a call. Returns `false` if it was already resolved or
    /// cancelled.
    pub fn resolve(&self, id: &str, outcome: CallOutcome) -> bool {
        match self.calls.remove(id) {
            Some((_, sender)) => {
                // The caller may have dropped its receiver; nothing to do then.
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop a call without completing it. Returns `false` if it was already
    /// resolved.
    pub fn cancel(&self, id: &str) -> bool {
        self.calls.remove(id).is_some()
    }

    /// Fail every outstanding call. Returns how many were failed.
    pub fn fail_all(&self, error: TransportError) -> usize {
        let ids: Vec<String> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        ids.into_iter()
            .filter(|id| self.resolve(id, Err(error.clone())))
            .count()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Removes a pending call when the dispatching future goes away, so an
/// abandoned call never leaves an entry behind.
pub(crate) struct PendingGuard {
    pending: PendingCalls,
    id: String,
}

impl PendingGuard {
    pub(crate) fn new(pending: &PendingCalls, id: &str) -> Self {
        Self {
            pending: pending.clone(),
            id: id.to_string(),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.cancel(&self.id);
    }
}
