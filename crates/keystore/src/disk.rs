use std::{
    fs,
    path::PathBuf,
    time::SystemTime,
};

use anyhow::Context;
use sha2::{
    Digest,
    Sha256,
};

use crate::{
    queues::PendingKey,
    record::{
        AgentAddr,
        AgentId,
        CredentialRecord,
    },
    store::KeyStore,
};

const KEYS_FILE: &str = "client.keys";
const AGENT_INFO_DIR: &str = "agent-info";
const GROUPS_DIR: &str = "groups";
const MULTIGROUPS_DIR: &str = "multigroups";
const BACKUP_DIR: &str = "backup";
const SHARED_DIR: &str = "shared";

/// The daemon's on-disk layout, rooted at its data directory:
///
/// ```text
/// client.keys                 one `id name ip key` record per line
/// agent-info/<id>-<name>-<ip> registration timestamp, one per agent
/// groups/<id>                 comma-delimited group assignment
/// multigroups/<hash>/         marker for each multigroup combination
/// backup/<timestamp>/<id>/    copies preserved on force-insert supersession
/// shared/<group>/             group configuration trees (externally managed)
/// ```
#[derive(Clone)]
pub struct AgentDirs {
    base: PathBuf,
}

impl AgentDirs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [
            self.agent_info_dir(),
            self.groups_dir(),
            self.multigroups_dir(),
            self.backup_dir(),
            self.shared_dir(),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn keys_file(&self) -> PathBuf {
        self.base.join(KEYS_FILE)
    }

    pub fn agent_info_dir(&self) -> PathBuf {
        self.base.join(AGENT_INFO_DIR)
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.base.join(GROUPS_DIR)
    }

    pub fn multigroups_dir(&self) -> PathBuf {
        self.base.join(MULTIGROUPS_DIR)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.base.join(BACKUP_DIR)
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.base.join(SHARED_DIR)
    }

    /// A group is valid only if its configuration tree already exists.
    pub fn group_exists(&self, group: &str) -> bool {
        self.shared_dir().join(group).is_dir()
    }

    fn agent_info_file(&self, id: &AgentId, name: &str, addr: &AgentAddr) -> PathBuf {
        // CIDR addresses render with a slash, which can't appear in a file
        // name.
        let addr = addr.to_string().replace('/', "-");
        self.agent_info_dir().join(format!("{id}-{name}-{addr}"))
    }

    fn group_file(&self, id: &AgentId) -> PathBuf {
        self.groups_dir().join(id.to_string())
    }

    /// Loads `client.keys` plus the per-agent metadata scattered next to
    /// it. A missing keys file is an empty store.
    pub fn load_store(&self) -> anyhow::Result<KeyStore> {
        let path = self.keys_file();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(KeyStore::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let mut records = parse_keys(&contents);
        for record in &mut records {
            if let Ok(group) = fs::read_to_string(self.group_file(&record.id)) {
                let group = group.trim();
                if !group.is_empty() {
                    record.group = Some(group.to_owned());
                }
            }
            let info = self.agent_info_file(&record.id, &record.name, &record.addr);
            if let Ok(meta) = fs::metadata(&info) {
                record.registered_at = meta.modified().ok();
            }
        }
        Ok(KeyStore::from_records(records))
    }

    /// Rewrites the whole keys file. Write-to-temp plus rename, so a crash
    /// mid-flush never leaves a truncated file behind.
    pub fn write_keys(&self, records: &[CredentialRecord]) -> anyhow::Result<()> {
        common::fs::write_atomic(&self.keys_file(), render_keys(records).as_bytes())
    }

    pub fn write_timestamp(&self, key: &PendingKey, when: SystemTime) -> anyhow::Result<()> {
        let secs = when
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = self.agent_info_file(&key.id, &key.name, &key.addr);
        fs::write(&path, format!("{secs}\n"))
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn remove_timestamp(&self, id: &AgentId) -> anyhow::Result<()> {
        let prefix = format!("{id}-");
        for entry in fs::read_dir(self.agent_info_dir())? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Records the group assignment and, for multigroups, the marker
    /// directory the configuration distributor watches.
    pub fn assign_group(&self, key: &PendingKey) -> anyhow::Result<()> {
        let Some(group) = &key.group else {
            return Ok(());
        };
        let path = self.group_file(&key.id);
        fs::write(&path, format!("{group}\n"))
            .with_context(|| format!("writing {}", path.display()))?;
        if group.contains(',') {
            let digest = Sha256::digest(group.as_bytes());
            let marker = self.multigroups_dir().join(&hex::encode(digest)[..8]);
            fs::create_dir_all(&marker)
                .with_context(|| format!("creating {}", marker.display()))?;
        }
        Ok(())
    }

    pub fn remove_group(&self, id: &AgentId) -> anyhow::Result<()> {
        let path = self.group_file(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    /// Copies everything known about a superseded agent into
    /// `backup/<stamp>/<id>/` before its files are reused by the
    /// replacement enrollment.
    pub fn backup_agent(&self, key: &PendingKey, stamp: u64) -> anyhow::Result<PathBuf> {
        let target = self.backup_dir().join(stamp.to_string()).join(key.id.to_string());
        fs::create_dir_all(&target).with_context(|| format!("creating {}", target.display()))?;
        fs::write(
            target.join("record"),
            format!("{} {} {}\n", key.id, key.name, key.addr),
        )?;
        let info = self.agent_info_file(&key.id, &key.name, &key.addr);
        if info.is_file() {
            fs::copy(&info, target.join("agent-info"))?;
        }
        let group = self.group_file(&key.id);
        if group.is_file() {
            fs::copy(&group, target.join("group"))?;
        }
        Ok(target)
    }

    /// Whether any backup of this agent exists, regardless of timestamp.
    pub fn has_backup(&self, id: &AgentId) -> bool {
        let Ok(entries) = fs::read_dir(self.backup_dir()) else {
            return false;
        };
        for entry in entries.flatten() {
            if entry.path().join(id.to_string()).is_dir() {
                return true;
            }
        }
        false
    }
}

/// Parses `client.keys` contents. Unparseable lines are skipped with a
/// warning rather than failing the whole load, and removed-agent markers
/// (names starting with `!`) are dropped.
pub fn parse_keys(contents: &str) -> Vec<CredentialRecord> {
    let mut records = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parsed = (|| {
            let id: AgentId = fields.next()?.parse().ok()?;
            let name = fields.next()?.to_owned();
            let addr: AgentAddr = fields.next()?.parse().ok()?;
            let key = fields.next()?.to_owned();
            Some((id, name, addr, key))
        })();
        let Some((id, name, addr, key)) = parsed else {
            tracing::warn!("Skipping corrupt entry at line {}", lineno + 1);
            continue;
        };
        if name.starts_with('!') {
            continue;
        }
        records.push(CredentialRecord {
            id,
            name,
            addr,
            key: key.into(),
            group: None,
            registered_at: None,
        });
    }
    records
}

pub fn render_keys(records: &[CredentialRecord]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&format!(
            "{} {} {} {}\n",
            record.id, record.name, record.addr, record.key
        ));
    }
    out
}
