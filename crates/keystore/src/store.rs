use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    time::SystemTime,
};

use crate::record::{
    AgentAddr,
    AgentId,
    AgentKey,
    CredentialRecord,
};

/// The in-memory credential store: records by id plus secondary indices by
/// name and by concrete address.
///
/// The store itself is not synchronized; it lives inside
/// [`KeyState`](crate::KeyState) and every reader and writer goes through
/// that single lock.
pub struct KeyStore {
    records: BTreeMap<AgentId, CredentialRecord>,
    by_name: HashMap<String, AgentId>,
    by_addr: HashMap<AgentAddr, AgentId>,
    next_id: u32,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            by_name: HashMap::new(),
            by_addr: HashMap::new(),
            next_id: 1,
        }
    }

    /// Rebuilds a store from loaded records. The id counter resumes at the
    /// highest id seen plus one; ids are never reused within a process
    /// lifetime.
    pub fn from_records(records: Vec<CredentialRecord>) -> Self {
        let mut store = Self::new();
        for record in records {
            store.next_id = store.next_id.max(record.id.value() + 1);
            store.insert(record);
        }
        store
    }

    fn insert(&mut self, record: CredentialRecord) {
        self.by_name.insert(record.name.clone(), record.id);
        if !record.addr.is_any() {
            self.by_addr.insert(record.addr.clone(), record.id);
        }
        self.records.insert(record.id, record);
    }

    /// Commits a new enrollment and returns the stored record. The id comes
    /// off the monotonic counter; a key is generated unless the caller
    /// brought one.
    pub fn add(
        &mut self,
        name: &str,
        addr: AgentAddr,
        group: Option<String>,
        key: Option<AgentKey>,
    ) -> CredentialRecord {
        let id = AgentId::new(self.next_id);
        self.next_id += 1;
        let record = CredentialRecord {
            id,
            name: name.to_owned(),
            addr,
            key: key.unwrap_or_else(AgentKey::random),
            group,
            registered_at: Some(SystemTime::now()),
        };
        self.insert(record.clone());
        record
    }

    pub fn remove(&mut self, id: &AgentId) -> Option<CredentialRecord> {
        let record = self.records.remove(id)?;
        if self.by_name.get(&record.name) == Some(id) {
            self.by_name.remove(&record.name);
        }
        if self.by_addr.get(&record.addr) == Some(id) {
            self.by_addr.remove(&record.addr);
        }
        Some(record)
    }

    pub fn get(&self, id: &AgentId) -> Option<&CredentialRecord> {
        self.records.get(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&CredentialRecord> {
        self.by_name.get(name).and_then(|id| self.records.get(id))
    }

    /// Lookup by concrete address. `any` never matches anything.
    pub fn find_by_addr(&self, addr: &AgentAddr) -> Option<&CredentialRecord> {
        if addr.is_any() {
            return None;
        }
        self.by_addr.get(addr).and_then(|id| self.records.get(id))
    }

    /// Seconds since the agent registered, or a negative sentinel when the
    /// registration time is unknown (treated as arbitrarily old by the
    /// force-insert policy).
    pub fn antiquity(&self, id: &AgentId) -> i64 {
        let Some(registered_at) = self.records.get(id).and_then(|r| r.registered_at) else {
            return -1;
        };
        match SystemTime::now().duration_since(registered_at) {
            Ok(age) => age.as_secs() as i64,
            Err(_) => 0,
        }
    }

    pub fn set_registered_at(&mut self, id: &AgentId, when: SystemTime) {
        if let Some(record) = self.records.get_mut(id) {
            record.registered_at = Some(when);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CredentialRecord> {
        self.records.values()
    }

    /// Independently-owned deep copy, ordered by id, so the writer can
    /// persist it after releasing the store lock.
    pub fn snapshot(&self) -> Vec<CredentialRecord> {
        self.records.values().cloned().collect()
    }
}
