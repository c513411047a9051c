use std::{
    sync::Arc,
    time::SystemTime,
};

use common::{
    backoff::Backoff,
    knobs::{
        MAX_WRITE_RETRY_DELAY_SECONDS,
        WRITE_RETRY_DELAY_MILLIS,
    },
};

use crate::{
    disk::AgentDirs,
    state::{
        KeyState,
        WriterBatch,
    },
    statedb::StateDbClient,
};

/// The durable writer thread. Parks on the pending condvar, and on each
/// wakeup rewrites `client.keys` from a snapshot and applies the queued
/// side effects, all without holding the store lock.
pub struct DurableWriter {
    state: Arc<KeyState>,
    dirs: AgentDirs,
    statedb: StateDbClient,
}

impl DurableWriter {
    pub fn new(state: Arc<KeyState>, dirs: AgentDirs, statedb: StateDbClient) -> Self {
        Self {
            state,
            dirs,
            statedb,
        }
    }

    pub fn run(&self) {
        tracing::debug!("Writer thread ready");
        let mut retry = Backoff::new(*WRITE_RETRY_DELAY_MILLIS, *MAX_WRITE_RETRY_DELAY_SECONDS);
        while let Some(batch) = self.state.wait_for_batch() {
            if self.flush(batch) {
                retry.reset();
            } else {
                // The batch is back in the queues; give the filesystem a
                // moment before picking it up again.
                self.state.wait_before_retry(retry.current());
                retry.fail();
            }
        }
        tracing::debug!("Writer thread finished");
    }

    /// One flush attempt. Returns whether the keys file reached disk; on
    /// failure the detached side effects are re-attached for a later try.
    pub fn flush(&self, batch: WriterBatch) -> bool {
        if let Err(e) = self.dirs.write_keys(&batch.records) {
            tracing::error!("Couldn't write the agent key file: {e:#}");
            self.state.reattach(batch.queues);
            return false;
        }

        let now = SystemTime::now();
        let stamp = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        for key in &batch.queues.insert {
            if let Err(e) = self.dirs.write_timestamp(key, now) {
                tracing::error!("Couldn't record registration time for agent {}: {e:#}", key.id);
            }
            if let Err(e) = self.dirs.assign_group(key) {
                tracing::error!(
                    "Unable to set centralized group for agent {}: {e:#}",
                    key.id
                );
            }
        }

        for key in &batch.queues.backup {
            match self.dirs.backup_agent(key, stamp) {
                Ok(target) => {
                    tracing::info!("Agent {} backed up at {}", key.id, target.display())
                },
                Err(e) => tracing::error!("Couldn't back up agent {}: {e:#}", key.id),
            }
            self.statedb.remove_agent(&key.id);
        }

        for key in &batch.queues.remove {
            if let Err(e) = self.dirs.remove_timestamp(&key.id) {
                tracing::error!("Couldn't remove timestamp for agent {}: {e:#}", key.id);
            }
            if let Err(e) = self.dirs.remove_group(&key.id) {
                tracing::error!("Couldn't remove group binding for agent {}: {e:#}", key.id);
            }
            self.statedb.remove_agent(&key.id);
        }
        true
    }
}
