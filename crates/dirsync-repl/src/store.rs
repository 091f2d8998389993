//! The entry store collaborator interface and its in-memory implementation.
//!
//! The real backend lives outside this core; the trait captures exactly
//! what conflict resolution and catch-up need from it. `MemoryEntryStore`
//! backs the tests and small embeddings.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::entry::{is_under, Entry};

/// What the replication core needs from the entry backend.
pub trait EntryStore: Send + Sync {
    /// Fetch an entry by its current DN.
    fn get_by_dn(&self, dn: &str) -> Option<Entry>;

    /// Fetch an entry by its unique identifier.
    fn get_by_uuid(&self, uuid: &str) -> Option<Entry>;

    /// Insert or replace an entry, keyed by its uuid.
    fn put(&self, entry: Entry);

    /// Remove an entry by uuid, returning it.
    fn remove(&self, uuid: &str) -> Option<Entry>;

    /// Change the DN of an entry. Returns false when the uuid is unknown.
    fn rename(&self, uuid: &str, new_dn: &str) -> bool;

    /// Entries directly under `dn`.
    fn children_of(&self, dn: &str) -> Vec<Entry>;

    /// All entries strictly under `dn`, any depth.
    fn subtree_of(&self, dn: &str) -> Vec<Entry>;

    /// Every entry in the store, for catch-up scans.
    fn all_entries(&self) -> Vec<Entry>;
}

/// In-memory entry store keyed by uuid with a DN index.
#[derive(Debug, Default)]
pub struct MemoryEntryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    by_uuid: HashMap<String, Entry>,
    dn_index: HashMap<String, String>,
}

impl MemoryEntryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_uuid.len()
    }

    /// True when the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntryStore for MemoryEntryStore {
    fn get_by_dn(&self, dn: &str) -> Option<Entry> {
        let inner = self.inner.lock().unwrap();
        let uuid = inner.dn_index.get(&dn.to_ascii_lowercase())?;
        inner.by_uuid.get(uuid).cloned()
    }

    fn get_by_uuid(&self, uuid: &str) -> Option<Entry> {
        self.inner.lock().unwrap().by_uuid.get(uuid).cloned()
    }

    fn put(&self, entry: Entry) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.by_uuid.get(&entry.uuid) {
            let old_dn = old.dn.to_ascii_lowercase();
            inner.dn_index.remove(&old_dn);
        }
        inner.dn_index.insert(entry.dn.to_ascii_lowercase(), entry.uuid.clone());
        inner.by_uuid.insert(entry.uuid.clone(), entry);
    }

    fn remove(&self, uuid: &str) -> Option<Entry> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.by_uuid.remove(uuid)?;
        inner.dn_index.remove(&entry.dn.to_ascii_lowercase());
        Some(entry)
    }

    fn rename(&self, uuid: &str, new_dn: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.by_uuid.get(uuid).cloned() else {
            return false;
        };
        let old_dn = entry.dn.to_ascii_lowercase();
        inner.dn_index.remove(&old_dn);
        inner.dn_index.insert(new_dn.to_ascii_lowercase(), uuid.to_string());
        if let Some(e) = inner.by_uuid.get_mut(uuid) {
            e.dn = new_dn.to_string();
        }
        true
    }

    fn children_of(&self, dn: &str) -> Vec<Entry> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_uuid
            .values()
            .filter(|e| crate::entry::parent_dn(&e.dn).is_some_and(|p| p.eq_ignore_ascii_case(dn)))
            .cloned()
            .collect()
    }

    fn subtree_of(&self, dn: &str) -> Vec<Entry> {
        let inner = self.inner.lock().unwrap();
        inner.by_uuid.values().filter(|e| is_under(&e.dn, dn)).cloned().collect()
    }

    fn all_entries(&self) -> Vec<Entry> {
        self.inner.lock().unwrap().by_uuid.values().cloned().collect()
    }
}
