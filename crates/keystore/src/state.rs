use std::time::Duration;

use parking_lot::{
    Condvar,
    Mutex,
    MutexGuard,
};

use crate::{
    queues::PendingQueues,
    record::CredentialRecord,
    store::KeyStore,
};

/// The store, the pending queues and the `write_pending` flag under one
/// mutex, paired with one condvar for the durable writer.
///
/// Keeping them under a single lock is deliberate: the writer must observe
/// `(store mutation, queue append, flag set)` as one atomic step, and every
/// commit path relies on that. Do not split this lock without re-deriving
/// that argument.
pub struct KeyState {
    inner: Mutex<KeyStateInner>,
    pending: Condvar,
}

pub struct KeyStateInner {
    pub store: KeyStore,
    pub queues: PendingQueues,
    pub write_pending: bool,
    pub running: bool,
}

/// Everything one writer wakeup works on: a deep copy of the store plus the
/// detached queues. Built under the lock, consumed without it.
pub struct WriterBatch {
    pub records: Vec<CredentialRecord>,
    pub queues: PendingQueues,
}

impl KeyState {
    pub fn new(store: KeyStore) -> Self {
        Self {
            inner: Mutex::new(KeyStateInner {
                store,
                queues: PendingQueues::new(),
                write_pending: false,
                running: true,
            }),
            pending: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, KeyStateInner> {
        self.inner.lock()
    }

    /// Marks pending work and wakes the writer. Call after mutating the
    /// store and queues under `guard`.
    pub fn signal_write_pending(&self, guard: &mut MutexGuard<'_, KeyStateInner>) {
        guard.write_pending = true;
        self.pending.notify_all();
    }

    /// Parks the writer until there is pending work or the state shuts
    /// down. Returns `None` once shutting down with nothing left to flush;
    /// a final batch is still handed out when work was pending at shutdown.
    pub fn wait_for_batch(&self) -> Option<WriterBatch> {
        let mut inner = self.inner.lock();
        while !inner.write_pending && inner.running {
            self.pending.wait(&mut inner);
        }
        if !inner.write_pending {
            return None;
        }
        inner.write_pending = false;
        Some(WriterBatch {
            records: inner.store.snapshot(),
            queues: inner.queues.detach(),
        })
    }

    /// Returns a failed batch's queues to the front of the live queues and
    /// flags them for another flush. The writer pauses in
    /// [`wait_before_retry`](Self::wait_before_retry) before picking the
    /// batch up again, so a broken filesystem is retried on a backoff
    /// instead of spinning.
    pub fn reattach(&self, queues: PendingQueues) {
        let mut inner = self.inner.lock();
        inner.queues.reattach_front(queues);
        inner.write_pending = true;
    }

    /// Timed pause between flush retries. A new commit signaling the
    /// condvar or shutdown ends the pause early.
    pub fn wait_before_retry(&self, delay: Duration) {
        let mut inner = self.inner.lock();
        if !inner.running {
            return;
        }
        let _ = self.pending.wait_for(&mut inner, delay);
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.running = false;
        self.pending.notify_all();
    }
}
