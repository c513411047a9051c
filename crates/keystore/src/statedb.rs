use std::{
    io,
    os::unix::net::UnixDatagram,
    path::PathBuf,
};

use parking_lot::Mutex;

use crate::record::AgentId;

/// Client for the external agent-state database. Removals are propagated
/// as plain-text `agent <id> remove` datagrams over its unix socket; the
/// database being down is not an error worth more than a debug line, the
/// next removal will try again.
pub struct StateDbClient {
    path: PathBuf,
    sock: Mutex<Option<UnixDatagram>>,
}

impl StateDbClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sock: Mutex::new(None),
        }
    }

    pub fn remove_agent(&self, id: &AgentId) {
        let query = format!("agent {id} remove");
        if let Err(e) = self.send(query.as_bytes()) {
            tracing::debug!(
                "State database unreachable at {}: {e}",
                self.path.display()
            );
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
            // Reconnect on the next call.
            *guard = None;
        }
        result
    }
}
