// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::{StateStoreError, OBJECT_DESER_ERROR, OBJECT_SER_ERROR};
use cairn_hash::Hash;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// The state store behind a shared handle, as seen by code holding its lock
pub type StateDb = dyn VersionedStoreController;

/// Shared handle on the state store
pub type ShareableStateStore = Arc<RwLock<Box<dyn VersionedStoreController>>>;

pub trait VersionedStoreController: Send + Sync + Debug {
    /// Revision of the current state: the revision of the top undo state, or the last
    /// committed revision when the undo stack is empty
    fn revision(&self) -> i64;

    /// Force the revision. Only valid while no undo state exists.
    fn set_revision(&mut self, revision: i64) -> Result<(), StateStoreError>;

    /// Open a new undo state on top of the stack and return its revision
    fn push_undo_level(&mut self) -> i64;

    /// Merge the top undo state into the one below it
    fn squash(&mut self) -> Result<(), StateStoreError>;

    /// Discard every write recorded by the top undo state
    fn undo(&mut self) -> Result<(), StateStoreError>;

    /// Forget the undo states up to and including `revision`, making them permanent
    fn commit(&mut self, revision: i64);

    /// Undo every undo state
    fn undo_all(&mut self) -> Result<(), StateStoreError>;

    /// Number of undo states on the stack
    fn undo_depth(&self) -> usize;

    /// Revision of the oldest undo state, if any
    fn first_undo_revision(&self) -> Option<i64>;

    fn get(&self, key: &[u8]) -> Option<Value>;

    fn put(&mut self, key: Key, value: Value) -> Result<(), StateStoreError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), StateStoreError>;

    /// All entries whose key starts with `prefix`, in key order
    fn prefix_iter(&self, prefix: &[u8]) -> Box<dyn Iterator<Item = (Key, Value)> + '_>;

    /// All entries in key order
    fn entries(&self) -> Box<dyn Iterator<Item = (Key, Value)> + '_>;

    /// Remove every entry and undo state, keeping the revision
    fn clear(&mut self);

    /// XOR of the digests of every entry
    fn state_hash(&self) -> Hash;

    /// Bytes used by keys and values
    fn used_bytes(&self) -> u64;

    /// Capacity in bytes
    fn size(&self) -> u64;

    /// Persist the store so that the next open resumes from it
    fn flush(&self) -> Result<(), StateStoreError>;

    fn free_bytes(&self) -> u64 {
        self.size().saturating_sub(self.used_bytes())
    }
}

impl dyn VersionedStoreController {
    /// Read and decode a state object
    pub fn get_object<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StateStoreError> {
        match self.get(key) {
            Some(bytes) => bincode::deserialize(&bytes).map(Some).map_err(|err| {
                StateStoreError::SerializationError(format!("{}: {}", OBJECT_DESER_ERROR, err))
            }),
            None => Ok(None),
        }
    }

    /// Encode and write a state object
    pub fn put_object<T: Serialize>(&mut self, key: Key, value: &T) -> Result<(), StateStoreError> {
        let bytes = bincode::serialize(value).map_err(|err| {
            StateStoreError::SerializationError(format!("{}: {}", OBJECT_SER_ERROR, err))
        })?;
        self.put(key, bytes)
    }

    /// Decode every object under a prefix, in key order
    pub fn prefix_objects<T: DeserializeOwned>(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<(Key, T)>, StateStoreError> {
        self.prefix_iter(prefix)
            .map(|(key, bytes)| {
                bincode::deserialize(&bytes)
                    .map(|value| (key, value))
                    .map_err(|err| {
                        StateStoreError::SerializationError(format!(
                            "{}: {}",
                            OBJECT_DESER_ERROR, err
                        ))
                    })
            })
            .collect()
    }
}
