// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use cairn_db_exports::{
    Key, StateStoreConfig, StateStoreError, Value, VersionedStoreController, STATE_FILE_NAME,
};
use cairn_hash::{Hash, HASH_SIZE_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound::{Included, Unbounded};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UndoState {
    revision: i64,
    /// value of each touched key before the first write of this undo state
    old_values: BTreeMap<Key, Option<Value>>,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    revision: i64,
    data: BTreeMap<Key, Value>,
    undo_stack: Vec<UndoState>,
}

/// In-memory versioned key/value store
pub struct CairnStateStore {
    config: StateStoreConfig,
    /// revision of the state when the undo stack is empty
    committed_revision: i64,
    data: BTreeMap<Key, Value>,
    undo_stack: Vec<UndoState>,
    hash_acc: [u8; HASH_SIZE_BYTES],
    used_bytes: u64,
}

impl std::fmt::Debug for CairnStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CairnStateStore")
            .field("config", &self.config)
            .field("revision", &self.revision())
            .field("entries", &self.data.len())
            .field("undo_depth", &self.undo_stack.len())
            .finish()
    }
}

fn entry_hash(key: &[u8], value: &[u8]) -> Hash {
    Hash::compute_from_tuple(&[&(key.len() as u64).to_le_bytes(), key, value])
}

fn entry_size(key: &[u8], value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

impl CairnStateStore {
    /// Open the store, resuming from the state file if a previous run flushed one
    pub fn open(config: StateStoreConfig) -> Result<Self, StateStoreError> {
        std::fs::create_dir_all(&config.path)?;
        let mut store = CairnStateStore {
            config,
            committed_revision: 0,
            data: BTreeMap::new(),
            undo_stack: Vec::new(),
            hash_acc: [0u8; HASH_SIZE_BYTES],
            used_bytes: 0,
        };
        let path = store.state_file();
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let persisted: PersistedState = bincode::deserialize(&bytes)
                .map_err(|err| StateStoreError::Corrupted(err.to_string()))?;
            store.committed_revision = persisted.revision;
            store.undo_stack = persisted.undo_stack;
            for (key, value) in persisted.data {
                store.account_insert(&key, &value);
                store.data.insert(key, value);
            }
            std::fs::remove_file(&path)?;
            info!(
                "loaded state at revision {} with {} entries",
                store.revision(),
                store.data.len()
            );
        }
        Ok(store)
    }

    fn state_file(&self) -> PathBuf {
        self.config.path.join(STATE_FILE_NAME)
    }

    fn xor_into_hash(&mut self, hash: Hash) {
        for (acc, byte) in self.hash_acc.iter_mut().zip(hash.to_bytes().iter()) {
            *acc ^= byte;
        }
    }

    fn account_insert(&mut self, key: &[u8], value: &[u8]) {
        self.xor_into_hash(entry_hash(key, value));
        self.used_bytes += entry_size(key, value);
    }

    fn account_remove(&mut self, key: &[u8], value: &[u8]) {
        self.xor_into_hash(entry_hash(key, value));
        self.used_bytes = self.used_bytes.saturating_sub(entry_size(key, value));
    }

    fn record_old_value(&mut self, key: &[u8]) {
        let current = self.data.get(key).cloned();
        if let Some(top) = self.undo_stack.last_mut() {
            top.old_values.entry(key.to_vec()).or_insert(current);
        }
    }

    /// Write without recording undo information
    fn raw_set(&mut self, key: Key, value: Option<Value>) {
        if let Some(old) = self.data.remove(&key) {
            self.account_remove(&key, &old);
        }
        if let Some(value) = value {
            self.account_insert(&key, &value);
            self.data.insert(key, value);
        }
    }
}

impl VersionedStoreController for CairnStateStore {
    fn revision(&self) -> i64 {
        self.undo_stack
            .last()
            .map(|state| state.revision)
            .unwrap_or(self.committed_revision)
    }

    fn set_revision(&mut self, revision: i64) -> Result<(), StateStoreError> {
        if !self.undo_stack.is_empty() {
            return Err(StateStoreError::InvalidRevision(
                "cannot set the revision while undo states exist".to_string(),
            ));
        }
        self.committed_revision = revision;
        Ok(())
    }

    fn push_undo_level(&mut self) -> i64 {
        let revision = self.revision() + 1;
        self.undo_stack.push(UndoState {
            revision,
            old_values: BTreeMap::new(),
        });
        revision
    }

    fn squash(&mut self) -> Result<(), StateStoreError> {
        let top = self.undo_stack.pop().ok_or(StateStoreError::NoUndoSession)?;
        match self.undo_stack.last_mut() {
            Some(below) => {
                for (key, old) in top.old_values {
                    below.old_values.entry(key).or_insert(old);
                }
            }
            None => self.committed_revision = top.revision - 1,
        }
        Ok(())
    }

    fn undo(&mut self) -> Result<(), StateStoreError> {
        let top = self.undo_stack.pop().ok_or(StateStoreError::NoUndoSession)?;
        for (key, old) in top.old_values {
            self.raw_set(key, old);
        }
        if self.undo_stack.is_empty() {
            self.committed_revision = top.revision - 1;
        }
        Ok(())
    }

    fn commit(&mut self, revision: i64) {
        let count = self
            .undo_stack
            .iter()
            .take_while(|state| state.revision <= revision)
            .count();
        if count > 0 {
            let last_committed = self.undo_stack[count - 1].revision;
            self.undo_stack.drain(..count);
            if self.undo_stack.is_empty() {
                self.committed_revision = last_committed;
            }
            debug!("committed state up to revision {}", last_committed);
        }
    }

    fn undo_all(&mut self) -> Result<(), StateStoreError> {
        while !self.undo_stack.is_empty() {
            self.undo()?;
        }
        Ok(())
    }

    fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    fn first_undo_revision(&self) -> Option<i64> {
        self.undo_stack.first().map(|state| state.revision)
    }

    fn get(&self, key: &[u8]) -> Option<Value> {
        self.data.get(key).cloned()
    }

    fn put(&mut self, key: Key, value: Value) -> Result<(), StateStoreError> {
        let old_size = self
            .data
            .get(&key)
            .map(|old| entry_size(&key, old))
            .unwrap_or(0);
        let new_size = entry_size(&key, &value);
        if new_size > old_size {
            let requested = new_size - old_size;
            if self.used_bytes + requested > self.config.size {
                return Err(StateStoreError::OutOfSpace {
                    used: self.used_bytes,
                    requested,
                    size: self.config.size,
                });
            }
        }
        self.record_old_value(&key);
        self.raw_set(key, Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateStoreError> {
        if self.data.contains_key(key) {
            self.record_old_value(key);
            self.raw_set(key.to_vec(), None);
        }
        Ok(())
    }

    fn prefix_iter(&self, prefix: &[u8]) -> Box<dyn Iterator<Item = (Key, Value)> + '_> {
        let owned_prefix = prefix.to_vec();
        Box::new(
            self.data
                .range::<Vec<u8>, _>((Included(prefix.to_vec()), Unbounded))
                .take_while(move |(key, _)| key.starts_with(&owned_prefix))
                .map(|(key, value)| (key.clone(), value.clone())),
        )
    }

    fn entries(&self) -> Box<dyn Iterator<Item = (Key, Value)> + '_> {
        Box::new(
            self.data
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        )
    }

    fn clear(&mut self) {
        self.data.clear();
        self.undo_stack.clear();
        self.hash_acc = [0u8; HASH_SIZE_BYTES];
        self.used_bytes = 0;
    }

    fn state_hash(&self) -> Hash {
        Hash::from_bytes(&self.hash_acc)
    }

    fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    fn size(&self) -> u64 {
        self.config.size
    }

    fn flush(&self) -> Result<(), StateStoreError> {
        let persisted = PersistedState {
            revision: self.committed_revision,
            data: self.data.clone(),
            undo_stack: self.undo_stack.clone(),
        };
        let bytes = bincode::serialize(&persisted)
            .map_err(|err| StateStoreError::SerializationError(err.to_string()))?;
        let tmp = self.config.path.join(format!("{}.tmp", STATE_FILE_NAME));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, self.state_file())?;
        info!(
            "flushed state at revision {} ({} entries)",
            self.revision(),
            self.data.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cairn_db_exports::{ShareableStateStore, UndoSession};
    use parking_lot::RwLock;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &TempDir, size: u64) -> CairnStateStore {
        CairnStateStore::open(StateStoreConfig {
            path: dir.path().to_path_buf(),
            size,
        })
        .unwrap()
    }

    fn shared(store: CairnStateStore) -> ShareableStateStore {
        Arc::new(RwLock::new(Box::new(store) as Box<dyn VersionedStoreController>))
    }

    #[test]
    fn undo_restores_previous_values_and_hash() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 1 << 20);
        store.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        let hash_before = store.state_hash();

        assert_eq!(store.push_undo_level(), 1);
        store.put(b"a".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"b".to_vec(), b"3".to_vec()).unwrap();
        store.delete(b"a").unwrap();
        store.undo().unwrap();

        assert_eq!(store.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b"), None);
        assert_eq!(store.state_hash(), hash_before);
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn squash_keeps_oldest_recorded_value() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 1 << 20);
        store.put(b"k".to_vec(), b"0".to_vec()).unwrap();
        store.push_undo_level();
        store.put(b"k".to_vec(), b"1".to_vec()).unwrap();
        store.push_undo_level();
        store.put(b"k".to_vec(), b"2".to_vec()).unwrap();
        store.squash().unwrap();
        assert_eq!(store.revision(), 1);
        assert_eq!(store.get(b"k"), Some(b"2".to_vec()));
        store.undo().unwrap();
        assert_eq!(store.get(b"k"), Some(b"0".to_vec()));
    }

    #[test]
    fn commit_makes_writes_permanent() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 1 << 20);
        store.push_undo_level();
        store.put(b"x".to_vec(), b"1".to_vec()).unwrap();
        store.push_undo_level();
        store.put(b"y".to_vec(), b"2".to_vec()).unwrap();
        store.commit(1);
        assert_eq!(store.undo_depth(), 1);
        store.undo_all().unwrap();
        assert_eq!(store.get(b"x"), Some(b"1".to_vec()));
        assert_eq!(store.get(b"y"), None);
        assert_eq!(store.revision(), 1);
        assert_matches!(store.undo(), Err(StateStoreError::NoUndoSession));
    }

    #[test]
    fn capacity_is_enforced() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 8);
        store.put(b"ab".to_vec(), b"cdef".to_vec()).unwrap();
        assert_matches!(
            store.put(b"gh".to_vec(), b"ij".to_vec()),
            Err(StateStoreError::OutOfSpace { .. })
        );
        assert_eq!(store.free_bytes(), 2);
    }

    #[test]
    fn prefix_iteration_is_bounded() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 1 << 20);
        for key in ["acc/1", "acc/2", "acd/1", "ab"] {
            store.put(key.as_bytes().to_vec(), vec![1]).unwrap();
        }
        let keys: Vec<Key> = store.prefix_iter(b"acc/").map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"acc/1".to_vec(), b"acc/2".to_vec()]);
    }

    #[test]
    fn dropped_session_is_undone() {
        let dir = TempDir::new().unwrap();
        let store = shared(open(&dir, 1 << 20));
        {
            let _session = UndoSession::new(&store, true);
            store.write().put(b"tmp".to_vec(), b"v".to_vec()).unwrap();
        }
        assert_eq!(store.read().get(b"tmp"), None);

        let session = UndoSession::new(&store, true);
        store.write().put(b"kept".to_vec(), b"v".to_vec()).unwrap();
        session.push();
        assert_eq!(store.read().undo_depth(), 1);
        assert_eq!(store.read().get(b"kept"), Some(b"v".to_vec()));
    }

    #[test]
    fn flush_and_reopen_resumes_state() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 1 << 20);
        store.set_revision(5).unwrap();
        store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        store.push_undo_level();
        store.put(b"k".to_vec(), b"w".to_vec()).unwrap();
        let hash = store.state_hash();
        store.flush().unwrap();

        let mut reopened = open(&dir, 1 << 20);
        assert_eq!(reopened.revision(), 6);
        assert_eq!(reopened.state_hash(), hash);
        reopened.undo().unwrap();
        assert_eq!(reopened.get(b"k"), Some(b"v".to_vec()));
        assert!(!dir.path().join(STATE_FILE_NAME).exists());
    }
}
