use std::{
    os::unix::net::UnixDatagram,
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use cmd_util::env::config_service;
use common::{
    errors::MainError,
    knobs::AUTH_POOL,
    queue::BoundedQueue,
    shutdown::ShutdownFlag,
};
use enrolld::{
    admin::AdminServer,
    config::EnrolldConfig,
    dispatcher::{
        Dispatcher,
        Role,
    },
    listener::Listener,
    tls,
    UnixClusterClient,
};
use integrity::{
    DatagramBus,
    EntityTable,
    IntegritySynchronizer,
};
use keystore::{
    DurableWriter,
    KeyState,
    StateDbClient,
};
use parking_lot::Mutex;
use signal_hook::{
    consts::{
        SIGHUP,
        SIGINT,
        SIGTERM,
    },
    iterator::Signals,
};

fn main() -> Result<(), MainError> {
    let _guard = config_service();
    let config = EnrolldConfig::parse();
    tracing::info!("Starting enrolld with config {config:?}");
    run(config)?;
    Ok(())
}

fn run(config: EnrolldConfig) -> anyhow::Result<()> {
    let dirs = config.dirs();
    dirs.ensure_layout()?;

    let manager_name = config.manager_name();
    let cert = config.server_cert();
    let key = config.server_key();
    tls::ensure_server_identity(&cert, &key, &manager_name)?;
    let tls_config = tls::build_server_config(&cert, &key, config.ca_cert.as_deref())?;

    if config.test_config {
        tracing::info!("Configuration OK.");
        return Ok(());
    }

    let password = config.load_password()?;
    let policy = config.policy(password);

    let shutdown = ShutdownFlag::new();
    let client_queue = Arc::new(BoundedQueue::new(*AUTH_POOL));
    let listener = Listener::bind(
        config.bind_address(),
        client_queue.clone(),
        shutdown.clone(),
        config.network_timeout(),
    )?;

    let mut handles = Vec::new();
    let mut state_handle: Option<Arc<KeyState>> = None;

    let role = if config.follower {
        let socket = config
            .cluster_socket
            .clone()
            .context("--follower requires --cluster-socket")?;
        Role::Follower(Arc::new(UnixClusterClient::new(socket)))
    } else {
        let store = dirs.load_store()?;
        tracing::info!("Loaded {} enrolled agents", store.len());
        let state = Arc::new(KeyState::new(store));
        state_handle = Some(state.clone());

        let writer = DurableWriter::new(
            state.clone(),
            dirs.clone(),
            StateDbClient::new(config.statedb_socket()),
        );
        handles.push(
            thread::Builder::new()
                .name("writer".to_owned())
                .spawn(move || writer.run())?,
        );

        let admin = AdminServer::bind(&config.admin_socket(), state.clone(), shutdown.clone())?;
        handles.push(
            thread::Builder::new()
                .name("admin".to_owned())
                .spawn(move || admin.run())?,
        );

        Role::Primary(state)
    };

    let dispatcher = Dispatcher::new(
        client_queue.clone(),
        tls_config,
        role,
        policy,
        dirs.clone(),
        config.verify_host,
        shutdown.clone(),
    );
    handles.push(
        thread::Builder::new()
            .name("dispatcher".to_owned())
            .spawn(move || dispatcher.run())?,
    );

    let mut sync_handle: Option<Arc<IntegritySynchronizer>> = None;
    if let Some(db) = &config.integrity_db {
        let table = Arc::new(Mutex::new(EntityTable::load(db)?));
        let bus = Arc::new(DatagramBus::new(config.sync_socket()));
        let synchronizer = Arc::new(IntegritySynchronizer::new(table, bus, shutdown.clone()));
        sync_handle = Some(synchronizer.clone());

        let response_socket = config.sync_response_socket();
        match std::fs::remove_file(&response_socket) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e).context("clearing stale sync response socket"),
        }
        let responses = UnixDatagram::bind(&response_socket)
            .with_context(|| format!("binding {}", response_socket.display()))?;
        responses.set_read_timeout(Some(Duration::from_secs(1)))?;
        {
            let synchronizer = synchronizer.clone();
            let shutdown = shutdown.clone();
            handles.push(
                thread::Builder::new()
                    .name("sync-responses".to_owned())
                    .spawn(move || drain_sync_responses(responses, &synchronizer, &shutdown))?,
            );
        }
        handles.push(
            thread::Builder::new()
                .name("integrity".to_owned())
                .spawn(move || synchronizer.run())?,
        );
    }

    // Signals clear the running flag and wake every parked thread.
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
    let signals_handle = signals.handle();
    let signal_thread = {
        let shutdown = shutdown.clone();
        let client_queue = client_queue.clone();
        let state = state_handle.clone();
        let synchronizer = sync_handle.clone();
        thread::Builder::new()
            .name("signals".to_owned())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    tracing::info!("Received signal {signal}. Shutting down.");
                    shutdown.shutdown();
                    client_queue.close();
                    if let Some(state) = &state {
                        state.shutdown();
                    }
                    if let Some(synchronizer) = &synchronizer {
                        synchronizer.close();
                    }
                }
            })?
    };

    listener.run();

    // The listener only returns once the flag is cleared; make sure every
    // other thread is woken even if shutdown started elsewhere.
    client_queue.close();
    if let Some(state) = &state_handle {
        state.shutdown();
    }
    if let Some(synchronizer) = &sync_handle {
        synchronizer.close();
    }
    for handle in handles {
        let _ = handle.join();
    }
    signals_handle.close();
    let _ = signal_thread.join();

    tracing::info!("Exiting...");
    Ok(())
}

fn drain_sync_responses(
    socket: UnixDatagram,
    synchronizer: &IntegritySynchronizer,
    shutdown: &ShutdownFlag,
) {
    let mut buf = vec![0u8; 65536];
    while shutdown.is_running() {
        match socket.recv(&mut buf) {
            Ok(n) => {
                let payload = String::from_utf8_lossy(&buf[..n]);
                synchronizer.push_response(&payload);
            },
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {},
            Err(e) => tracing::debug!("Sync response socket error: {e}"),
        }
    }
}
