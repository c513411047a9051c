//! Anti-entropy synchronization of the local file-integrity table:
//! periodically publish a digest of the whole table, answer peer responses
//! that ask for a sub-range bisection or a full dump, and back off when a
//! round fails to converge.

mod message;
mod sync;
mod table;

#[cfg(test)]
mod tests;

pub use self::{
    message::{
        SyncMessage,
        SyncResponse,
    },
    sync::{
        DatagramBus,
        IntegritySynchronizer,
        SyncBus,
    },
    table::{
        EntityRecord,
        EntityTable,
    },
};
