//! In-memory credential store for enrolled agents, the pending side-effect
//! queues drained by the durable writer, and the on-disk layout both are
//! persisted to.

mod disk;
mod queues;
mod record;
mod state;
mod statedb;
mod store;
mod writer;


pub use self::{
    disk::AgentDirs,
    queues::{
        PendingKey,
        PendingQueues,
    },
    record::{
        AgentAddr,
        AgentId,
        AgentKey,
        CredentialRecord,
        InvalidAddr,
    },
    state::{
        KeyState,
        KeyStateInner,
        WriterBatch,
    },
    statedb::StateDbClient,
    store::KeyStore,
    writer::DurableWriter,
};
