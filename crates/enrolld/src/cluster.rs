use std::{
    io::{
        BufRead,
        BufReader,
        Write,
    },
    os::unix::net::UnixStream,
    path::PathBuf,
};

use anyhow::{
    bail,
    Context,
};
use keystore::{
    AgentAddr,
    AgentId,
    AgentKey,
};
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};

/// Boundary to the cluster primary. Followers forward every mutation here
/// and treat the primary as the source of truth for id and key
/// assignment; they never write the credential file themselves.
pub trait ClusterClient: Send + Sync {
    fn add_agent(
        &self,
        name: &str,
        addr: &AgentAddr,
        group: Option<&str>,
        force_time: Option<u64>,
    ) -> anyhow::Result<(AgentId, AgentKey)>;

    fn remove_agent(&self, id: &AgentId) -> anyhow::Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClusterRequest {
    Add {
        name: String,
        ip: String,
        group: Option<String>,
        force_time: Option<u64>,
    },
    Remove {
        id: String,
    },
}

#[derive(Deserialize)]
struct ClusterReply {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

/// JSON-lines RPC over the cluster's unix socket. Calls are serialized per
/// connection; a transport error drops the connection so the next call
/// reconnects.
pub struct UnixClusterClient {
    path: PathBuf,
    conn: Mutex<Option<BufReader<UnixStream>>>,
}

impl UnixClusterClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Mutex::new(None),
        }
    }

    fn call(&self, request: &ClusterRequest) -> anyhow::Result<ClusterReply> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            let stream = UnixStream::connect(&self.path)
                .with_context(|| format!("connecting to cluster socket {}", self.path.display()))?;
            *guard = Some(BufReader::new(stream));
        }
        let conn = guard.as_mut().context("cluster connection unavailable")?;
        let outcome = Self::exchange(conn, request);
        if outcome.is_err() {
            *guard = None;
        }
        outcome
    }

    fn exchange(
        conn: &mut BufReader<UnixStream>,
        request: &ClusterRequest,
    ) -> anyhow::Result<ClusterReply> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        let mut writer = conn.get_ref();
        writer.write_all(line.as_bytes())?;

        let mut response = String::new();
        conn.read_line(&mut response)?;
        if response.is_empty() {
            bail!("cluster connection closed");
        }
        serde_json::from_str(&response).context("malformed reply from the primary node")
    }
}

impl ClusterClient for UnixClusterClient {
    fn add_agent(
        &self,
        name: &str,
        addr: &AgentAddr,
        group: Option<&str>,
        force_time: Option<u64>,
    ) -> anyhow::Result<(AgentId, AgentKey)> {
        let reply = self.call(&ClusterRequest::Add {
            name: name.to_owned(),
            ip: addr.to_string(),
            group: group.map(str::to_owned),
            force_time,
        })?;
        if let Some(error) = reply.error {
            bail!("primary node rejected the enrollment: {error}");
        }
        let id: AgentId = reply
            .id
            .context("primary reply carried no id")?
            .parse()
            .context("unparseable id from the primary node")?;
        let key = AgentKey::from(reply.key.context("primary reply carried no key")?);
        Ok((id, key))
    }

    fn remove_agent(&self, id: &AgentId) -> anyhow::Result<()> {
        let reply = self.call(&ClusterRequest::Remove { id: id.to_string() })?;
        if let Some(error) = reply.error {
            bail!("primary node rejected the removal: {error}");
        }
        Ok(())
    }
}
