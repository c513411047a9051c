use std::{
    collections::VecDeque,
    mem,
};

use crate::record::{
    AgentAddr,
    AgentId,
    CredentialRecord,
};

/// Immutable snapshot of a record captured when a side effect is queued.
/// `group` is only meaningful for insertions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingKey {
    pub id: AgentId,
    pub name: String,
    pub addr: AgentAddr,
    pub group: Option<String>,
}

impl PendingKey {
    pub fn of(record: &CredentialRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            addr: record.addr.clone(),
            group: record.group.clone(),
        }
    }
}

/// The three deferred side-effect queues drained by the durable writer.
/// They live next to the [`KeyStore`](crate::KeyStore) under the same lock
/// so a store mutation and its queue append are one atomic step as seen by
/// the writer.
#[derive(Debug, Default)]
pub struct PendingQueues {
    pub insert: VecDeque<PendingKey>,
    pub backup: VecDeque<PendingKey>,
    pub remove: VecDeque<PendingKey>,
}

impl PendingQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.backup.is_empty() && self.remove.is_empty()
    }

    /// Swaps every queue with an empty one, handing the detached entries to
    /// the caller. The caller walks them with the lock released.
    pub fn detach(&mut self) -> PendingQueues {
        PendingQueues {
            insert: mem::take(&mut self.insert),
            backup: mem::take(&mut self.backup),
            remove: mem::take(&mut self.remove),
        }
    }

    /// Splices a previously detached batch back in front of the live
    /// queues, preserving FIFO order. Used when a flush fails before any
    /// side effect was applied.
    pub fn reattach_front(&mut self, mut detached: PendingQueues) {
        detached.insert.append(&mut self.insert);
        self.insert = detached.insert;
        detached.backup.append(&mut self.backup);
        self.backup = detached.backup;
        detached.remove.append(&mut self.remove);
        self.remove = detached.remove;
    }
}
