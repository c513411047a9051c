use std::{
    io::{
        Read,
        Write,
    },
    net::{
        SocketAddr,
        TcpStream,
    },
    path::Path,
    sync::Arc,
    thread,
    time::Duration,
};

use common::queue::BoundedQueue;
use common::shutdown::ShutdownFlag;
use keystore::{
    AgentAddr,
    AgentDirs,
    AgentId,
    AgentKey,
    DurableWriter,
    KeyState,
    KeyStore,
    StateDbClient,
};
use parking_lot::Mutex;
use rustls::client::danger::{
    HandshakeSignatureValid,
    ServerCertVerified,
    ServerCertVerifier,
};
use rustls_pki_types::{
    CertificateDer,
    PrivateKeyDer,
    PrivatePkcs8KeyDer,
    ServerName,
    UnixTime,
};

use crate::{
    admin::AdminServer,
    cluster::ClusterClient,
    dispatcher::{
        validate_and_commit,
        Dispatcher,
        EnrollmentPolicy,
        Role,
    },
    listener::Listener,
    parse::{
        parse_request,
        EnrollmentError,
        EnrollmentIntent,
    },
    tls,
};

// ---------------------------------------------------------------------------
// Harness

struct TestServer {
    _dir: tempfile::TempDir,
    dirs: AgentDirs,
    state: Option<Arc<KeyState>>,
    queue: Arc<BoundedQueue<crate::listener::ClientConnection>>,
    shutdown: ShutdownFlag,
    addr: SocketAddr,
    threads: Vec<thread::JoinHandle<()>>,
}

impl TestServer {
    fn state(&self) -> &Arc<KeyState> {
        self.state.as_ref().expect("primary-mode server")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        self.queue.close();
        if let Some(state) = &self.state {
            state.shutdown();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn self_signed_tls(dir: &Path) -> Arc<rustls::ServerConfig> {
    let cert = dir.join("server.cert");
    let key = dir.join("server.key");
    tls::ensure_server_identity(&cert, &key, "localhost").unwrap();
    tls::build_server_config(&cert, &key, None).unwrap()
}

fn spawn_server(
    policy: EnrollmentPolicy,
    role: Option<Role>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    verify_host: bool,
) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let dirs = AgentDirs::new(dir.path());
    dirs.ensure_layout().unwrap();

    let tls_config = tls_config.unwrap_or_else(|| self_signed_tls(dir.path()));
    let (role, state) = match role {
        Some(role) => (role, None),
        None => {
            let state = Arc::new(KeyState::new(KeyStore::new()));
            (Role::Primary(state.clone()), Some(state))
        },
    };

    let shutdown = ShutdownFlag::new();
    let queue = Arc::new(BoundedQueue::new(16));
    let listener = Listener::bind(
        "127.0.0.1:0".parse().unwrap(),
        queue.clone(),
        shutdown.clone(),
        Some(Duration::from_secs(2)),
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let dispatcher = Dispatcher::new(
        queue.clone(),
        tls_config,
        role,
        policy,
        dirs.clone(),
        verify_host,
        shutdown.clone(),
    );

    let threads = vec![
        thread::spawn(move || listener.run()),
        thread::spawn(move || dispatcher.run()),
    ];

    TestServer {
        _dir: dir,
        dirs,
        state,
        queue,
        shutdown,
        addr,
        threads,
    }
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth()
}

/// Sends one request and reads everything until the server hangs up.
fn request_with(addr: SocketAddr, payload: &str, config: rustls::ClientConfig) -> String {
    let server_name = ServerName::try_from("localhost").unwrap();
    let conn = rustls::ClientConnection::new(Arc::new(config), server_name).unwrap();
    let sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut stream = rustls::StreamOwned::new(conn, sock);
    if stream.write_all(payload.as_bytes()).is_err() {
        return String::new();
    }
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            // Servers hang up without close_notify, and rejected
            // handshakes surface as alerts; either way the conversation
            // is over and the bytes gathered so far are the reply.
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn request(addr: SocketAddr, payload: &str) -> String {
    request_with(addr, payload, client_config())
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Wire scenarios

#[test]
fn test_happy_path_enrollment() {
    let server = spawn_server(EnrollmentPolicy::default(), None, None, false);
    let reply = request(server.addr, "OSSEC A:'alpha'");

    let pattern = regex::Regex::new(r"^OSSEC K:'\d+ alpha any \S+'\n\n$").unwrap();
    assert!(pattern.is_match(&reply), "unexpected reply: {reply:?}");

    wait_until(|| !server.state().lock().queues.insert.is_empty());
    let inner = server.state().lock();
    assert_eq!(inner.store.len(), 1);
    let pending = &inner.queues.insert[0];
    assert_eq!(pending.name, "alpha");
    assert_eq!(pending.group, None);
    assert!(inner.write_pending);
}

#[test]
fn test_group_enrollment_collapses_duplicates() {
    let server = spawn_server(EnrollmentPolicy::default(), None, None, false);
    std::fs::create_dir_all(server.dirs.shared_dir().join("web")).unwrap();

    let reply = request(server.addr, "OSSEC A:'beta' G:'web,web,web'");
    assert!(reply.starts_with("OSSEC K:'"), "unexpected reply: {reply:?}");
    assert!(reply.contains(" beta any "));

    wait_until(|| !server.state().lock().queues.insert.is_empty());
    let inner = server.state().lock();
    let record = inner.store.find_by_name("beta").unwrap();
    assert_eq!(record.group.as_deref(), Some("web"));
    assert_eq!(inner.queues.insert[0].group.as_deref(), Some("web"));
}

#[test]
fn test_unknown_group_is_rejected() {
    let server = spawn_server(EnrollmentPolicy::default(), None, None, false);
    let reply = request(server.addr, "OSSEC A:'beta' G:'nosuchgroup'");
    assert!(
        reply.starts_with("ERROR: Invalid group: nosuchgroup\n\n"),
        "unexpected reply: {reply:?}"
    );
    assert_eq!(server.state().lock().store.len(), 0);
}

#[test]
fn test_duplicate_ip_is_rejected_without_force() {
    let server = spawn_server(EnrollmentPolicy::default(), None, None, false);
    server
        .state()
        .lock()
        .store
        .add("a", "10.0.0.1".parse().unwrap(), None, None);

    let reply = request(server.addr, "OSSEC A:'b' IP:'10.0.0.1'");
    assert!(
        reply.starts_with("ERROR: Duplicated IP: 10.0.0.1\n\n"),
        "unexpected reply: {reply:?}"
    );
    // Legacy wire behavior: a second generic error line follows.
    assert!(reply.contains("ERROR: Unable to add agent.\n\n"));

    let inner = server.state().lock();
    assert_eq!(inner.store.len(), 1);
    assert!(inner.store.find_by_name("a").is_some());
}

#[test]
fn test_force_insert_supersedes_old_record() {
    let policy = EnrollmentPolicy {
        force_insert: true,
        force_time: 0,
        ..EnrollmentPolicy::default()
    };
    let server = spawn_server(policy, None, None, false);
    let old = server
        .state()
        .lock()
        .store
        .add("a", "10.0.0.1".parse().unwrap(), None, None);

    let reply = request(server.addr, "OSSEC A:'b' IP:'10.0.0.1'");
    assert!(reply.starts_with("OSSEC K:'"), "unexpected reply: {reply:?}");

    wait_until(|| !server.state().lock().queues.insert.is_empty());
    {
        let inner = server.state().lock();
        assert!(inner.store.find_by_name("a").is_none());
        assert!(inner.store.find_by_name("b").is_some());
        // The backup was enqueued before the insert, for a record already
        // removed from the store.
        assert_eq!(inner.queues.backup.len(), 1);
        assert_eq!(inner.queues.backup[0].id, old.id);
        assert_eq!(inner.queues.insert.len(), 1);
        assert_eq!(inner.queues.insert[0].name, "b");
    }

    // Flush the batch; the superseded record must land in the backup tree.
    let writer = DurableWriter::new(
        server.state().clone(),
        server.dirs.clone(),
        StateDbClient::new(server.dirs.keys_file().with_file_name("statedb.sock")),
    );
    assert!(writer.flush(server.state().wait_for_batch().unwrap()));
    assert!(server.dirs.has_backup(&old.id));
    let keys = std::fs::read_to_string(server.dirs.keys_file()).unwrap();
    assert!(keys.contains(" b "));
    assert!(!keys.contains(" a "));
}

#[test]
fn test_agent_limit_is_enforced() {
    let policy = EnrollmentPolicy {
        max_agents: 3,
        ..EnrollmentPolicy::default()
    };
    let server = spawn_server(policy, None, None, false);
    server
        .state()
        .lock()
        .store
        .add("seed", AgentAddr::Any, None, None);

    let reply = request(server.addr, "OSSEC A:'overflow'");
    assert!(
        reply.starts_with("ERROR: The maximum number of agents has been reached\n\n"),
        "unexpected reply: {reply:?}"
    );
    assert_eq!(server.state().lock().store.len(), 1);
}

#[test]
fn test_password_authentication() {
    let policy = EnrollmentPolicy {
        password: Some("topsecret".to_owned()),
        ..EnrollmentPolicy::default()
    };
    let server = spawn_server(policy, None, None, false);

    let reply = request(server.addr, "OSSEC A:'nopass'");
    assert!(
        reply.starts_with("ERROR: Invalid password\n\n"),
        "unexpected reply: {reply:?}"
    );

    let reply = request(server.addr, "OSSEC PASS: topsecret OSSEC A:'withpass'");
    assert!(reply.starts_with("OSSEC K:'"), "unexpected reply: {reply:?}");
    assert!(server.state().lock().store.find_by_name("withpass").is_some());
}

#[test]
fn test_source_ip_request() {
    let server = spawn_server(EnrollmentPolicy::default(), None, None, false);
    let reply = request(server.addr, "OSSEC A:'srcy' IP:'src'");
    assert!(
        reply.starts_with("OSSEC K:'") && reply.contains(" srcy 127.0.0.1 "),
        "unexpected reply: {reply:?}"
    );
}

// ---------------------------------------------------------------------------
// Follower mode

#[derive(Default)]
struct FakeCluster {
    adds: Mutex<Vec<(String, String, Option<String>, Option<u64>)>>,
    removes: Mutex<Vec<AgentId>>,
}

impl ClusterClient for FakeCluster {
    fn add_agent(
        &self,
        name: &str,
        addr: &AgentAddr,
        group: Option<&str>,
        force_time: Option<u64>,
    ) -> anyhow::Result<(AgentId, AgentKey)> {
        self.adds.lock().push((
            name.to_owned(),
            addr.to_string(),
            group.map(str::to_owned),
            force_time,
        ));
        Ok((AgentId::new(7), AgentKey::from("feedbeef".to_owned())))
    }

    fn remove_agent(&self, id: &AgentId) -> anyhow::Result<()> {
        self.removes.lock().push(*id);
        Ok(())
    }
}

#[test]
fn test_follower_forwards_to_primary() {
    let cluster = Arc::new(FakeCluster::default());
    let server = spawn_server(
        EnrollmentPolicy::default(),
        Some(Role::Follower(cluster.clone())),
        None,
        false,
    );

    let reply = request(server.addr, "OSSEC A:'worker-agent'");
    // The id and key assigned by the primary are plumbed through verbatim.
    assert_eq!(reply, "OSSEC K:'007 worker-agent any feedbeef'\n\n");

    let adds = cluster.adds.lock();
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].0, "worker-agent");
    assert_eq!(adds[0].1, "any");
    assert_eq!(adds[0].3, None);
    assert!(cluster.removes.lock().is_empty());
}

// ---------------------------------------------------------------------------
// Client certificate verification

#[test]
fn test_verify_host_matches_peer_address() {
    let dir = tempfile::tempdir().unwrap();

    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();
    let ca_path = dir.path().join("ca.pem");
    std::fs::write(&ca_path, ca_cert.pem()).unwrap();

    let server_cert = dir.path().join("server.cert");
    let server_key = dir.path().join("server.key");
    tls::ensure_server_identity(&server_cert, &server_key, "localhost").unwrap();
    let tls_config =
        tls::build_server_config(&server_cert, &server_key, Some(&ca_path)).unwrap();

    let server = spawn_server(
        EnrollmentPolicy::default(),
        None,
        Some(tls_config),
        /* verify_host= */ true,
    );

    let issue_client = |sans: Vec<String>| {
        let params = rcgen::CertificateParams::new(sans).unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();
        let chain = vec![cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_client_auth_cert(chain, key)
            .unwrap()
    };

    // Certificate naming the loopback peer address is admitted.
    let good = issue_client(vec!["127.0.0.1".to_owned()]);
    let reply = request_with(server.addr, "OSSEC A:'certified'", good);
    assert!(reply.starts_with("OSSEC K:'"), "unexpected reply: {reply:?}");

    // Certificate naming some other address is dropped without a reply.
    let bad = issue_client(vec!["10.9.9.9".to_owned()]);
    let reply = request_with(server.addr, "OSSEC A:'impostor'", bad);
    assert_eq!(reply, "");

    // No client certificate at all fails the handshake.
    let reply = request_with(server.addr, "OSSEC A:'anonymous'", client_config());
    assert_eq!(reply, "");

    let inner = server.state().lock();
    assert!(inner.store.find_by_name("certified").is_some());
    assert!(inner.store.find_by_name("impostor").is_none());
    assert!(inner.store.find_by_name("anonymous").is_none());
}

// ---------------------------------------------------------------------------
// Policy unit coverage

fn policy_fixture() -> (tempfile::TempDir, AgentDirs, Arc<KeyState>) {
    let dir = tempfile::tempdir().unwrap();
    let dirs = AgentDirs::new(dir.path());
    dirs.ensure_layout().unwrap();
    (dir, dirs, Arc::new(KeyState::new(KeyStore::new())))
}

fn intent(name: &str) -> EnrollmentIntent {
    EnrollmentIntent {
        name: name.to_owned(),
        groups: None,
        addr: AgentAddr::Any,
    }
}

#[test]
fn test_duplicate_names_get_numeric_suffixes() {
    let (_dir, dirs, state) = policy_fixture();
    let policy = EnrollmentPolicy::default();
    let mut inner = state.lock();

    let first = validate_and_commit(&mut inner, &intent("dup"), &policy, &dirs).unwrap();
    let second = validate_and_commit(&mut inner, &intent("dup"), &policy, &dirs).unwrap();
    let third = validate_and_commit(&mut inner, &intent("dup"), &policy, &dirs).unwrap();
    assert_eq!(first.name, "dup");
    assert_eq!(second.name, "dup2");
    assert_eq!(third.name, "dup3");
    // Ids stay unique across the rewrites.
    assert_ne!(first.id, second.id);
    assert_ne!(second.id, third.id);
}

#[test]
fn test_manager_name_is_reserved() {
    let (_dir, dirs, state) = policy_fixture();
    let policy = EnrollmentPolicy {
        manager_name: "mgr01".to_owned(),
        ..EnrollmentPolicy::default()
    };
    let mut inner = state.lock();

    for name in ["manager", "mgr01"] {
        assert_eq!(
            validate_and_commit(&mut inner, &intent(name), &policy, &dirs),
            Err(EnrollmentError::InvalidAgentName(name.to_owned()))
        );
    }
}

#[test]
fn test_force_time_respects_antiquity() {
    let (_dir, dirs, state) = policy_fixture();
    let policy = EnrollmentPolicy {
        force_insert: true,
        force_time: 3600,
        ..EnrollmentPolicy::default()
    };
    let mut inner = state.lock();

    // A freshly registered record is too young to supersede; the request
    // falls back to a numeric suffix.
    inner.store.add("young", AgentAddr::Any, None, None);
    let renamed = validate_and_commit(&mut inner, &intent("young"), &policy, &dirs).unwrap();
    assert_eq!(renamed.name, "young2");

    // Unknown antiquity counts as arbitrarily old.
    let unknown = inner.store.add("elder", AgentAddr::Any, None, None);
    inner
        .store
        .set_registered_at(&unknown.id, std::time::SystemTime::UNIX_EPOCH);
    let superseding = validate_and_commit(&mut inner, &intent("elder"), &policy, &dirs).unwrap();
    assert_eq!(superseding.name, "elder");
    assert_eq!(inner.queues.backup.len(), 1);
    assert_eq!(inner.queues.backup[0].id, unknown.id);
}

// ---------------------------------------------------------------------------
// Admin server

#[test]
fn test_admin_remove_command() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(KeyState::new(KeyStore::new()));
    let removed_id = state
        .lock()
        .store
        .add("doomed", AgentAddr::Any, None, None)
        .id;

    let socket_path = dir.path().join("enrolld.sock");
    let shutdown = ShutdownFlag::new();
    let admin = AdminServer::bind(&socket_path, state.clone(), shutdown.clone()).unwrap();
    let handle = thread::spawn(move || admin.run());

    let admin_request = |line: &str| {
        let mut stream = std::os::unix::net::UnixStream::connect(&socket_path).unwrap();
        stream.write_all(line.as_bytes()).unwrap();
        stream.write_all(b"\n").unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        reply.trim().to_owned()
    };

    assert_eq!(admin_request(&format!("remove {removed_id}")), format!("ok {removed_id}"));
    assert_eq!(admin_request("remove 999"), "err agent 999 not found");
    assert_eq!(admin_request("bogus"), "err unknown command");

    {
        let inner = state.lock();
        assert!(inner.store.is_empty());
        assert_eq!(inner.queues.remove.len(), 1);
        assert_eq!(inner.queues.remove[0].id, removed_id);
        assert!(inner.write_pending);
    }

    shutdown.shutdown();
    let _ = handle.join();
}

// ---------------------------------------------------------------------------
// Parser determinism across transports (the parser itself is covered in
// parse.rs; this pins the dispatcher's framing assumptions)

#[test]
fn test_request_with_trailing_newline_parses() {
    let intent = parse_request(
        "OSSEC A:'trailing'\n",
        None,
        "127.0.0.1".parse().unwrap(),
        false,
    )
    .unwrap();
    assert_eq!(intent.name, "trailing");
}
