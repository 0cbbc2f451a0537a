//! A sync operation: the unit of work spanning one or more upload rounds.

use crate::api::DEFAULT_LIMIT;
use coffer_model::Payload;

/// Whether the operation talks to the server or only to local storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Account,
    Offline,
}

/// Owns the queue of encrypted payloads awaiting upload and the
/// between-round cancellation latch. One HTTP round runs inside a
/// `lock_cancelation` / `unlock_cancelation` bracket; a cancel request that
/// lands mid-flight is deferred to the round boundary.
pub struct SyncOperation {
    kind: OperationKind,
    pending: Vec<Payload>,
    up_limit: usize,
    cancel_locked: bool,
    cancel_requested: bool,
    cancelled: bool,
}

impl SyncOperation {
    pub fn account(pending: Vec<Payload>) -> Self {
        Self::new(OperationKind::Account, pending)
    }

    pub fn offline(pending: Vec<Payload>) -> Self {
        Self::new(OperationKind::Offline, pending)
    }

    fn new(kind: OperationKind, pending: Vec<Payload>) -> Self {
        Self {
            kind,
            pending,
            up_limit: DEFAULT_LIMIT,
            cancel_locked: false,
            cancel_requested: false,
            cancelled: false,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn pending_upload_count(&self) -> usize {
        self.pending.len()
    }

    /// Drains up to `up_limit` payloads for the next round.
    pub fn pop_payloads(&mut self) -> Vec<Payload> {
        let take = self.up_limit.min(self.pending.len());
        self.pending.drain(..take).collect()
    }

    // -----------------------------------------------------------------------
    // Cancellation latch
    // -----------------------------------------------------------------------

    pub fn lock_cancelation(&mut self) {
        self.cancel_locked = true;
    }

    /// Unlocks and applies any cancel request that arrived mid-round.
    pub fn unlock_cancelation(&mut self) {
        self.cancel_locked = false;
        if self.cancel_requested {
            self.cancelled = true;
        }
    }

    /// Requests cancellation. Returns whether it took effect immediately;
    /// a locked operation defers the cancel to the round boundary.
    pub fn try_cancel(&mut self) -> bool {
        if self.cancel_locked {
            self.cancel_requested = true;
            false
        } else {
            self.cancelled = true;
            true
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}
