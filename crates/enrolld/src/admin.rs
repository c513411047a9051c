use std::{
    fs,
    io::{
        BufRead,
        BufReader,
        Write,
    },
    os::unix::net::UnixStream,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use common::shutdown::ShutdownFlag;
use keystore::{
    AgentId,
    KeyState,
    PendingKey,
};
use socket2::{
    Domain,
    SockAddr,
    Socket,
    Type,
};

/// Local administrative endpoint, primary only. Speaks single-line text
/// commands over a unix socket; `remove <id>` detaches an agent from the
/// store and queues its removal side effects for the writer, under the
/// same lock discipline as enrollments.
pub struct AdminServer {
    socket: Socket,
    state: Arc<KeyState>,
    shutdown: ShutdownFlag,
}

impl AdminServer {
    pub fn bind(path: &Path, state: Arc<KeyState>, shutdown: ShutdownFlag) -> anyhow::Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => {
                return Err(e).with_context(|| format!("clearing stale socket {}", path.display()))
            },
        }
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket
            .bind(&SockAddr::unix(path)?)
            .with_context(|| format!("binding admin socket {}", path.display()))?;
        socket.listen(16)?;
        // Same 1 s shutdown tick as the TLS listener.
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        Ok(Self {
            socket,
            state,
            shutdown,
        })
    }

    pub fn run(&self) {
        tracing::debug!("Local admin server ready");
        while self.shutdown.is_running() {
            let (sock, _) = match self.socket.accept() {
                Ok(accepted) => accepted,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                },
                Err(e) => {
                    if self.shutdown.is_running() {
                        tracing::error!("Admin accept(): {e}");
                    }
                    continue;
                },
            };
            let stream: UnixStream = std::os::fd::OwnedFd::from(sock).into();
            if let Err(e) = self.serve(stream) {
                tracing::debug!("Admin connection failed: {e:#}");
            }
        }
        tracing::debug!("Local admin server finished");
    }

    fn serve(&self, stream: UnixStream) -> anyhow::Result<()> {
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let reply = self.handle_command(line.trim());
        let mut stream = reader.into_inner();
        stream.write_all(reply.as_bytes())?;
        stream.write_all(b"\n")?;
        Ok(())
    }

    fn handle_command(&self, line: &str) -> String {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("remove"), Some(raw_id)) => {
                let Ok(id) = raw_id.parse::<AgentId>() else {
                    return format!("err invalid id '{raw_id}'");
                };
                let mut inner = self.state.lock();
                match inner.store.remove(&id) {
                    Some(old) => {
                        inner.queues.remove.push_back(PendingKey::of(&old));
                        self.state.signal_write_pending(&mut inner);
                        tracing::info!("Agent {id} removed by the local admin server");
                        format!("ok {id}")
                    },
                    None => format!("err agent {id} not found"),
                }
            },
            _ => "err unknown command".to_owned(),
        }
    }
}
