// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::{ShareableStateStore, StateStoreError};
use tracing::warn;

/// Scoped checkpoint over the state store.
///
/// Writes made while the session is alive are recorded in its undo state. The session must be
/// closed with [`UndoSession::push`] (keep the undo state on the stack), [`UndoSession::squash`]
/// (merge it into the enclosing session) or [`UndoSession::undo`]. Dropping it without closing it
/// undoes it, including while unwinding.
///
/// The store lock must not be held by the dropping thread.
#[must_use = "an undo session is discarded when dropped"]
pub struct UndoSession {
    store: Option<ShareableStateStore>,
    revision: i64,
}

impl UndoSession {
    /// Open a session. A disabled session records nothing and closes as a no-op.
    pub fn new(store: &ShareableStateStore, enabled: bool) -> Self {
        if enabled {
            let revision = store.write().push_undo_level();
            UndoSession {
                store: Some(store.clone()),
                revision,
            }
        } else {
            UndoSession::disabled(store.read().revision())
        }
    }

    /// Session that records nothing
    pub fn disabled(revision: i64) -> Self {
        UndoSession {
            store: None,
            revision,
        }
    }

    /// Whether writes are being recorded
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Revision of the undo state
    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// Keep the writes and leave the undo state on the stack
    pub fn push(mut self) {
        self.store = None;
    }

    /// Merge the writes into the enclosing undo state
    pub fn squash(mut self) -> Result<(), StateStoreError> {
        match self.store.take() {
            Some(store) => store.write().squash(),
            None => Ok(()),
        }
    }

    /// Discard the writes
    pub fn undo(mut self) -> Result<(), StateStoreError> {
        match self.store.take() {
            Some(store) => store.write().undo(),
            None => Ok(()),
        }
    }
}

impl Drop for UndoSession {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(err) = store.write().undo() {
                warn!("could not undo abandoned session {}: {}", self.revision, err);
            }
        }
    }
}

impl std::fmt::Debug for UndoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoSession")
            .field("revision", &self.revision)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
