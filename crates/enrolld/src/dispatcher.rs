use std::{
    io::{
        self,
        Read,
        Write,
    },
    net::IpAddr,
    sync::Arc,
};

use common::{
    knobs::{
        LEGACY_DOUBLE_ERROR_REPLY,
        MAX_AGENTS,
        MAX_TAG_COUNTER,
        REQUEST_BUFFER_SIZE,
        SSL_RETRY_DELAY_MILLIS,
    },
    queue::BoundedQueue,
    shutdown::ShutdownFlag,
};
use keystore::{
    AgentDirs,
    AgentId,
    CredentialRecord,
    KeyState,
    KeyStateInner,
    PendingKey,
};
use rustls::{
    ServerConnection,
    StreamOwned,
};

use crate::{
    cluster::ClusterClient,
    listener::ClientConnection,
    parse::{
        parse_request,
        EnrollmentError,
        EnrollmentIntent,
    },
    tls::peer_matches_certificate,
};

/// Everything the dispatcher needs to decide whether an enrollment is
/// admitted, separated from the transport so policy is testable on its
/// own.
#[derive(Clone)]
pub struct EnrollmentPolicy {
    pub password: Option<String>,
    pub force_insert: bool,
    /// Minimum antiquity, in seconds, before force-insert may supersede an
    /// existing record. Unknown antiquity counts as arbitrarily old.
    pub force_time: u64,
    pub use_source_ip: bool,
    pub register_limit: bool,
    pub max_agents: usize,
    pub manager_name: String,
}

impl Default for EnrollmentPolicy {
    fn default() -> Self {
        Self {
            password: None,
            force_insert: false,
            force_time: 0,
            use_source_ip: false,
            register_limit: true,
            max_agents: *MAX_AGENTS,
            manager_name: "manager".to_owned(),
        }
    }
}

/// Where committed enrollments go: the local store on a primary node, the
/// cluster RPC on a follower.
pub enum Role {
    Primary(Arc<KeyState>),
    Follower(Arc<dyn ClusterClient>),
}

/// The worker draining the client queue: TLS handshake, one request, one
/// reply.
pub struct Dispatcher {
    queue: Arc<BoundedQueue<ClientConnection>>,
    tls: Arc<rustls::ServerConfig>,
    role: Role,
    policy: EnrollmentPolicy,
    dirs: AgentDirs,
    verify_host: bool,
    shutdown: ShutdownFlag,
}

type TlsStream = StreamOwned<ServerConnection, std::net::TcpStream>;

impl Dispatcher {
    pub fn new(
        queue: Arc<BoundedQueue<ClientConnection>>,
        tls: Arc<rustls::ServerConfig>,
        role: Role,
        policy: EnrollmentPolicy,
        dirs: AgentDirs,
        verify_host: bool,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            queue,
            tls,
            role,
            policy,
            dirs,
            verify_host,
            shutdown,
        }
    }

    pub fn run(&self) {
        tracing::debug!("Dispatch thread ready");
        while self.shutdown.is_running() {
            let Some(client) = self.queue.pop() else {
                break;
            };
            if !self.shutdown.is_running() {
                break;
            }
            let peer = client.peer;
            if let Err(e) = self.handle(client) {
                tracing::debug!("Connection from {peer} aborted: {e:#}");
            }
        }
        tracing::debug!("Dispatch thread finished");
    }

    fn handle(&self, client: ClientConnection) -> anyhow::Result<()> {
        let peer_ip = client.peer.ip();
        let conn = ServerConnection::new(self.tls.clone())?;
        let mut stream = StreamOwned::new(conn, client.stream);

        if let Err(e) = complete_handshake(&mut stream) {
            tracing::debug!("TLS error from {peer_ip}: {e}");
            return Ok(());
        }
        tracing::info!("New connection from {peer_ip}");

        if self.verify_host && !peer_matches_certificate(&stream.conn, peer_ip) {
            tracing::error!("Unable to verify client certificate from {peer_ip}.");
            return Ok(());
        }

        let mut buf = vec![0u8; *REQUEST_BUFFER_SIZE];
        let read = match read_request(&mut stream, &mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if is_timeout(&e) => {
                tracing::info!("Client timeout from {peer_ip}");
                return Ok(());
            },
            Err(e) => {
                tracing::debug!("TLS read error from {peer_ip}: {e}");
                return Ok(());
            },
        };
        let request = String::from_utf8_lossy(&buf[..read]);
        tracing::debug!("Request received: <{request}>");

        let intent = match parse_request(
            &request,
            self.policy.password.as_deref(),
            peer_ip,
            self.policy.use_source_ip,
        ) {
            Ok(intent) => intent,
            Err(e) => {
                if e.is_protocol_error() {
                    tracing::warn!("Invalid request for new agent from {peer_ip}");
                } else {
                    tracing::info!("Rejected enrollment from {peer_ip}: {e}");
                }
                self.reply_error(&mut stream, &e);
                return Ok(());
            },
        };

        match &self.role {
            Role::Primary(state) => self.enroll_local(state, &mut stream, &intent, peer_ip),
            Role::Follower(cluster) => {
                self.enroll_forwarded(cluster.as_ref(), &mut stream, &intent, peer_ip)
            },
        }
        Ok(())
    }

    fn enroll_local(
        &self,
        state: &KeyState,
        stream: &mut TlsStream,
        intent: &EnrollmentIntent,
        peer_ip: IpAddr,
    ) {
        let committed = {
            let mut inner = state.lock();
            validate_and_commit(&mut inner, intent, &self.policy, &self.dirs)
        };
        let record = match committed {
            Ok(record) => record,
            Err(e) => {
                tracing::info!("Rejected enrollment from {peer_ip}: {e}");
                self.reply_error(stream, &e);
                return;
            },
        };

        let reply = format!(
            "OSSEC K:'{} {} {} {}'\n\n",
            record.id, record.name, record.addr, record.key
        );
        match stream.write_all(reply.as_bytes()) {
            Ok(()) => {
                tracing::info!(
                    "Agent key generated for '{}' (requested by {peer_ip})",
                    record.name
                );
                let mut inner = state.lock();
                inner.queues.insert.push_back(PendingKey::of(&record));
                state.signal_write_pending(&mut inner);
            },
            Err(e) => {
                // The agent never got its key; keeping the record would
                // strand an id nobody holds credentials for.
                tracing::error!("TLS write error ({e})");
                tracing::error!("Agent key not saved for '{}'", record.name);
                let mut inner = state.lock();
                inner.store.remove(&record.id);
            },
        }
    }

    fn enroll_forwarded(
        &self,
        cluster: &dyn ClusterClient,
        stream: &mut TlsStream,
        intent: &EnrollmentIntent,
        peer_ip: IpAddr,
    ) {
        let force_time = self.policy.force_insert.then_some(self.policy.force_time);
        let group = intent.groups.as_ref().map(|groups| groups.join(","));
        let (id, key) = match cluster.add_agent(&intent.name, &intent.addr, group.as_deref(), force_time)
        {
            Ok(assigned) => assigned,
            Err(e) => {
                tracing::error!("Couldn't enroll '{}' through the primary node: {e:#}", intent.name);
                self.reply_error(stream, &EnrollmentError::Internal(intent.name.clone()));
                return;
            },
        };

        let reply = format!("OSSEC K:'{id} {} {} {key}'\n\n", intent.name, intent.addr);
        match stream.write_all(reply.as_bytes()) {
            Ok(()) => {
                tracing::info!(
                    "Agent key generated for '{}' (requested by {peer_ip})",
                    intent.name
                );
            },
            Err(e) => {
                tracing::error!("TLS write error ({e})");
                // Compensate on the primary so the cluster doesn't keep a
                // key the agent never received.
                match cluster.remove_agent(&id) {
                    Ok(()) => tracing::error!("Agent key not saved for '{}'", intent.name),
                    Err(remove_err) => tracing::error!(
                        "Agent key for '{}' undeliverable and not removed from the primary: \
                         {remove_err:#}",
                        intent.name
                    ),
                }
            },
        }
    }

    fn reply_error(&self, stream: &mut TlsStream, error: &EnrollmentError) {
        let _ = stream.write_all(format!("{error}\n\n").as_bytes());
        if *LEGACY_DOUBLE_ERROR_REPLY {
            let _ = stream.write_all(b"ERROR: Unable to add agent.\n\n");
        }
    }
}

/// Policy validation plus commit, under the store lock. On success the new
/// record is in the store; the pending insert is enqueued by the caller
/// only after the reply reaches the agent.
pub(crate) fn validate_and_commit(
    inner: &mut KeyStateInner,
    intent: &EnrollmentIntent,
    policy: &EnrollmentPolicy,
    dirs: &AgentDirs,
) -> Result<CredentialRecord, EnrollmentError> {
    if let Some(groups) = &intent.groups {
        for group in groups {
            if !dirs.group_exists(group) {
                return Err(EnrollmentError::UnknownGroup(group.clone()));
            }
        }
    }

    if !intent.addr.is_any() {
        if let Some(existing) = inner.store.find_by_addr(&intent.addr) {
            let existing_id = existing.id;
            if policy.force_insert && antiquity_allows(inner, &existing_id, policy) {
                tracing::info!(
                    "Duplicated IP '{}' ({existing_id}). Saving backup.",
                    intent.addr
                );
                supersede(inner, &existing_id, dirs);
            } else {
                return Err(EnrollmentError::DuplicatedIp(intent.addr.to_string()));
            }
        }
    }

    if intent.name == policy.manager_name || intent.name == "manager" {
        tracing::info!("Invalid agent name {} (same as manager)", intent.name);
        return Err(EnrollmentError::InvalidAgentName(intent.name.clone()));
    }

    let mut final_name = intent.name.clone();
    if let Some(existing) = inner.store.find_by_name(&final_name) {
        let existing_id = existing.id;
        if policy.force_insert && antiquity_allows(inner, &existing_id, policy) {
            tracing::info!("Duplicated name '{final_name}' ({existing_id}). Saving backup.");
            supersede(inner, &existing_id, dirs);
        } else {
            let mut deduplicated = None;
            for count in 2..=*MAX_TAG_COUNTER {
                let candidate = format!("{}{count}", intent.name);
                if inner.store.find_by_name(&candidate).is_none() {
                    deduplicated = Some(candidate);
                    break;
                }
            }
            match deduplicated {
                Some(candidate) => final_name = candidate,
                None => {
                    tracing::info!("Invalid agent name {} (duplicated)", intent.name);
                    return Err(EnrollmentError::InvalidAgentName(intent.name.clone()));
                },
            }
        }
    }

    if policy.register_limit && inner.store.len() >= policy.max_agents.saturating_sub(2) {
        tracing::error!(
            "Couldn't add agent '{final_name}': maximum of {} reached",
            policy.max_agents.saturating_sub(2)
        );
        return Err(EnrollmentError::AgentLimitReached);
    }

    let group = intent.groups.as_ref().map(|groups| groups.join(","));
    Ok(inner.store.add(&final_name, intent.addr.clone(), group, None))
}

fn antiquity_allows(inner: &KeyStateInner, id: &AgentId, policy: &EnrollmentPolicy) -> bool {
    let antiquity = inner.store.antiquity(id);
    antiquity < 0 || antiquity >= policy.force_time as i64
}

/// Removes a superseded record and queues its backup. The record leaves
/// the store before the backup is enqueued, so the writer always sees the
/// supersession already applied.
fn supersede(inner: &mut KeyStateInner, id: &AgentId, dirs: &AgentDirs) {
    if let Some(old) = inner.store.remove(id) {
        if let Err(e) = dirs.remove_group(id) {
            tracing::debug!("Couldn't drop group binding for {id}: {e:#}");
        }
        inner.queues.backup.push_back(PendingKey::of(&old));
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Drives the TLS handshake. A timeout-class failure is retried once after
/// a short sleep; anything else drops the connection silently.
fn complete_handshake(stream: &mut TlsStream) -> io::Result<()> {
    let mut retried = false;
    while stream.conn.is_handshaking() {
        match stream.conn.complete_io(&mut stream.sock) {
            Ok(_) => {},
            Err(e) if is_timeout(&e) && !retried => {
                retried = true;
                std::thread::sleep(*SSL_RETRY_DELAY_MILLIS);
            },
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// One read is the whole request; a timeout is retried once like the
/// handshake.
fn read_request(stream: &mut TlsStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut retried = false;
    loop {
        match stream.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if is_timeout(&e) && !retried => {
                retried = true;
                std::thread::sleep(*SSL_RETRY_DELAY_MILLIS);
            },
            Err(e) => return Err(e),
        }
    }
}
