// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use displaydoc::Display;
use thiserror::Error;

/// State store error
#[non_exhaustive]
#[derive(Display, Error, Debug, Clone, PartialEq, Eq)]
pub enum StateStoreError {
    /// state store is full: {used} bytes used, writing {requested} more would exceed {size}
    OutOfSpace {
        /// bytes in use
        used: u64,
        /// bytes the write needs
        requested: u64,
        /// capacity
        size: u64,
    },
    /// no undo session is open
    NoUndoSession,
    /// invalid revision: {0}
    InvalidRevision(String),
    /// serialization error: {0}
    SerializationError(String),
    /// io error: {0}
    IoError(String),
    /// persisted state is corrupted: {0}
    Corrupted(String),
}

impl From<std::io::Error> for StateStoreError {
    fn from(err: std::io::Error) -> Self {
        StateStoreError::IoError(err.to_string())
    }
}
