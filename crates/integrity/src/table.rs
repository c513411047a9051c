use std::{
    collections::BTreeMap,
    ops::Bound,
    path::Path,
};

use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};
use sha1::{
    Digest,
    Sha1,
};

/// One file-integrity entity as synchronized with peers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityRecord {
    pub key: String,
    pub checksum: String,
    pub size: u64,
    pub modified: i64,
}

impl EntityRecord {
    /// The canonical byte stream fed to range digests. Both sides of a sync
    /// conversation must agree on this byte-for-byte.
    fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}\n",
            self.key, self.checksum, self.size, self.modified
        )
        .into_bytes()
    }
}

/// The local entity table, ordered by key so ranges and bounds are cheap.
/// The synchronizer holds it behind a mutex; whoever maintains the table
/// (the scan side) mutates it through the same handle.
#[derive(Default)]
pub struct EntityTable {
    entries: BTreeMap<String, EntityRecord>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<EntityRecord>) -> Self {
        let mut table = Self::new();
        for record in records {
            table.insert(record);
        }
        table
    }

    /// Loads a table from a JSON array of records.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<EntityRecord> = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_records(records))
    }

    pub fn insert(&mut self, record: EntityRecord) {
        self.entries.insert(record.key.clone(), record);
    }

    pub fn remove(&mut self, key: &str) -> Option<EntityRecord> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&EntityRecord> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Smallest and largest keys, when the table is nonempty.
    pub fn bounds(&self) -> Option<(String, String)> {
        let first = self.entries.keys().next()?;
        let last = self.entries.keys().next_back()?;
        Some((first.clone(), last.clone()))
    }

    pub fn range<'a>(
        &'a self,
        begin: &str,
        end: &str,
    ) -> impl Iterator<Item = &'a EntityRecord> + 'a {
        self.entries
            .range::<str, _>((Bound::Included(begin), Bound::Included(end)))
            .map(|(_, record)| record)
    }

    pub fn count_range(&self, begin: &str, end: &str) -> usize {
        self.range(begin, end).count()
    }

    pub fn keys_in_range(&self, begin: &str, end: &str) -> Vec<String> {
        self.range(begin, end).map(|r| r.key.clone()).collect()
    }

    /// SHA-1 over the canonical byte stream of every record in the
    /// inclusive range.
    pub fn range_checksum(&self, begin: &str, end: &str) -> String {
        let mut hasher = Sha1::new();
        for record in self.range(begin, end) {
            hasher.update(record.canonical_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Digest of the whole table between its smallest and largest keys.
    /// `None` when the table is empty.
    pub fn global_checksum(&self) -> Option<(String, String, String)> {
        let (begin, end) = self.bounds()?;
        let checksum = self.range_checksum(&begin, &end);
        Some((begin, end, checksum))
    }
}
