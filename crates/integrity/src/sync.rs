use std::{
    io,
    os::unix::net::UnixDatagram,
    path::PathBuf,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::{
        Instant,
        SystemTime,
    },
};

use common::{
    backoff::Backoff,
    knobs::{
        MAX_SYNC_INTERVAL_SECONDS,
        SYNC_INTERVAL_SECONDS,
        SYNC_QUEUE_SIZE,
        SYNC_RESPONSE_TIMEOUT_SECONDS,
    },
    queue::BoundedQueue,
    shutdown::ShutdownFlag,
};
use parking_lot::Mutex;

use crate::{
    message::{
        SyncMessage,
        SyncResponse,
    },
    table::EntityTable,
};

/// One-sided message bus the synchronizer publishes through. Responses
/// travel the other way and are fed in via
/// [`IntegritySynchronizer::push_response`].
pub trait SyncBus: Send + Sync {
    fn publish(&self, msg: &SyncMessage) -> anyhow::Result<()>;
}

/// Bus transport publishing each message as a JSON datagram on a unix
/// socket.
pub struct DatagramBus {
    path: PathBuf,
    sock: Mutex<Option<UnixDatagram>>,
}

impl DatagramBus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sock: Mutex::new(None),
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.sock.lock();
        if guard.is_none() {
            let sock = UnixDatagram::unbound()?;
            sock.connect(&self.path)?;
            *guard = Some(sock);
        }
        let result = match &*guard {
            Some(sock) => sock.send(buf).map(|_| ()),
            None => Ok(()),
        };
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

impl SyncBus for DatagramBus {
    fn publish(&self, msg: &SyncMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_string(msg)?;
        self.send(payload.as_bytes())?;
        Ok(())
    }
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The anti-entropy loop. Each round publishes a digest of the whole
/// table, then services peer responses until the round settles; any
/// response at all means the peers were not in sync, so the next round is
/// scheduled with exponential back-off.
pub struct IntegritySynchronizer {
    table: Arc<Mutex<EntityTable>>,
    bus: Arc<dyn SyncBus>,
    responses: BoundedQueue<String>,
    shutdown: ShutdownFlag,
    started: AtomicBool,
}

impl IntegritySynchronizer {
    pub fn new(
        table: Arc<Mutex<EntityTable>>,
        bus: Arc<dyn SyncBus>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            table,
            bus,
            responses: BoundedQueue::new(*SYNC_QUEUE_SIZE),
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    /// Queues a peer response for the current collection window. Called
    /// from whatever thread drains the bus.
    pub fn push_response(&self, payload: &str) {
        if !self.started.load(Ordering::Acquire) {
            tracing::warn!(
                "A synchronization response was received before the first digest was sent."
            );
            return;
        }
        if self.responses.try_push(payload.to_owned()).is_err() {
            tracing::debug!("Cannot queue a synchronization response: queue is full.");
        }
    }

    /// Wakes the loop out of its collection window so shutdown is prompt.
    pub fn close(&self) {
        self.responses.close();
    }

    pub fn run(&self) {
        let mut backoff = Backoff::new(*SYNC_INTERVAL_SECONDS, *MAX_SYNC_INTERVAL_SECONDS);
        while self.shutdown.is_running() {
            let sync_interval = backoff.current();
            tracing::debug!(
                "Initializing integrity synchronization round. Interval is {:?}.",
                sync_interval
            );

            let round_id = now_seconds();
            let mut current_id = round_id;
            if let Err(e) = self.publish_digest(round_id) {
                tracing::warn!("Couldn't publish the integrity digest: {e:#}");
            }
            self.started.store(true, Ordering::Release);

            let mut successful = true;
            let mut deadline = Instant::now() + sync_interval;
            while let Some(payload) = self.responses.pop_until(deadline) {
                if !self.shutdown.is_running() {
                    break;
                }
                // Keep listening for a response-timeout margin past the
                // last message, or until the round deadline, whichever is
                // later.
                let margin = Instant::now() + *SYNC_RESPONSE_TIMEOUT_SECONDS;
                self.dispatch(&payload, &mut current_id);
                deadline = deadline.max(margin);
                successful = false;
            }

            if successful {
                backoff.reset();
            } else {
                tracing::debug!(
                    "Integrity synchronization did not converge. Adjusting interval for the next \
                     round."
                );
                backoff.fail();
            }
        }
        tracing::debug!("Integrity synchronization thread finished");
    }

    pub(crate) fn publish_digest(&self, id: i64) -> anyhow::Result<()> {
        let msg = {
            let table = self.table.lock();
            match table.global_checksum() {
                Some((begin, end, checksum)) => SyncMessage::IntegrityCheckGlobal {
                    id,
                    begin,
                    end,
                    checksum,
                },
                None => SyncMessage::IntegrityClear { id },
            }
        };
        self.bus.publish(&msg)
    }

    /// Applies one peer response. Ids order rounds: responses from a round
    /// we have not started yet are dropped, responses from an older round
    /// lower our own id so the rest of that round's replies are accepted.
    pub(crate) fn dispatch(&self, payload: &str, current_id: &mut i64) {
        let Some(response) = SyncResponse::parse(payload) else {
            return;
        };
        if response.id > *current_id {
            tracing::debug!(
                "Dropping response with future id {} (current {})",
                response.id,
                current_id
            );
            return;
        }
        if response.id < *current_id {
            *current_id = response.id;
            tracing::debug!("Lowering synchronization id to {current_id}");
        }
        let (Some(begin), Some(end)) = (response.begin, response.end) else {
            tracing::debug!("Synchronization response missing its range: {payload}");
            return;
        };
        match response.command.as_str() {
            "checksum_fail" => self.checksum_split(&begin, &end, *current_id),
            "no_data" => self.send_range(&begin, &end),
            other => tracing::debug!("Unknown synchronization command: {other}"),
        }
    }

    /// Bisects a range whose digest the peer rejected: each half is
    /// re-announced with its own digest, and a half holding a single record
    /// is sent outright as a state message.
    pub(crate) fn checksum_split(&self, begin: &str, end: &str, id: i64) {
        let messages = {
            let table = self.table.lock();
            let keys = table.keys_in_range(begin, end);
            match keys.len() {
                0 => Vec::new(),
                1 => table
                    .get(&keys[0])
                    .map(|record| {
                        vec![SyncMessage::State {
                            item: record.clone(),
                        }]
                    })
                    .unwrap_or_default(),
                n => {
                    let mid = n / 2;
                    let mut messages = Vec::with_capacity(2);
                    messages.push(Self::half_message(
                        &table,
                        &keys[..mid],
                        id,
                        /* left= */ true,
                    ));
                    messages.push(Self::half_message(
                        &table,
                        &keys[mid..],
                        id,
                        /* left= */ false,
                    ));
                    messages
                },
            }
        };
        self.publish_all(messages);
    }

    fn half_message(table: &EntityTable, keys: &[String], id: i64, left: bool) -> SyncMessage {
        if keys.len() == 1 {
            if let Some(record) = table.get(&keys[0]) {
                return SyncMessage::State {
                    item: record.clone(),
                };
            }
        }
        let begin = keys[0].clone();
        let end = keys[keys.len() - 1].clone();
        let checksum = table.range_checksum(&begin, &end);
        if left {
            SyncMessage::IntegrityCheckLeft {
                id,
                begin,
                end,
                checksum,
            }
        } else {
            SyncMessage::IntegrityCheckRight {
                id,
                begin,
                end,
                checksum,
            }
        }
    }

    /// Full dump of a range the peer has no data for.
    pub(crate) fn send_range(&self, begin: &str, end: &str) {
        let messages: Vec<SyncMessage> = {
            let table = self.table.lock();
            table
                .range(begin, end)
                .map(|record| SyncMessage::State {
                    item: record.clone(),
                })
                .collect()
        };
        self.publish_all(messages);
    }

    fn publish_all(&self, messages: Vec<SyncMessage>) {
        for msg in messages {
            if let Err(e) = self.bus.publish(&msg) {
                tracing::warn!("Couldn't publish a synchronization message: {e:#}");
            }
        }
    }
}
