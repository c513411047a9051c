use std::{
    net::{
        SocketAddr,
        TcpStream,
    },
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use common::{
    queue::BoundedQueue,
    shutdown::ShutdownFlag,
};
use socket2::{
    Domain,
    Protocol,
    Socket,
    Type,
};

/// An accepted socket on its way to the dispatcher. Owned by the listener
/// until the queue hand-off, then exclusively by one dispatcher worker.
pub struct ClientConnection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// The accept loop. Wakes once a second to observe the shutdown flag, and
/// pushes accepted sockets onto the bounded client queue; when the queue
/// is full the newest connection is dropped with a warning.
pub struct Listener {
    socket: Socket,
    queue: Arc<BoundedQueue<ClientConnection>>,
    shutdown: ShutdownFlag,
    recv_timeout: Option<Duration>,
}

impl Listener {
    pub fn bind(
        addr: SocketAddr,
        queue: Arc<BoundedQueue<ClientConnection>>,
        shutdown: ShutdownFlag,
        recv_timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .context("creating the listening socket")?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("binding {addr}"))?;
        socket.listen(128)?;
        // The 1 s accept tick: without it a quiet listener would never
        // notice the shutdown flag.
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        Ok(Self {
            socket,
            queue,
            shutdown,
            recv_timeout,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .context("listener has no inet address")
    }

    pub fn run(&self) {
        while self.shutdown.is_running() {
            let (sock, addr) = match self.socket.accept() {
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
                        tracing::error!("accept(): {e}");
                    }
                    continue;
                },
            };
            let Some(peer) = addr.as_socket() else {
                continue;
            };
            if self.recv_timeout.is_some() {
                if let Err(e) = sock.set_read_timeout(self.recv_timeout) {
                    tracing::error!("Could not set timeout on client socket: {e}");
                }
            }
            let connection = ClientConnection {
                stream: sock.into(),
                peer,
            };
            if self.queue.try_push(connection).is_err() {
                tracing::warn!("Too many connections. Rejecting {peer}.");
            }
        }
        tracing::debug!("Listener finished");
    }
}
