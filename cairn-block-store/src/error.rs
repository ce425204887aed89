// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use cairn_models::error::ModelsError;
use displaydoc::Display;
use thiserror::Error;

/// Block storage error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum BlockStoreError {
    /// io error: {0}
    IoError(#[from] std::io::Error),
    /// models error: {0}
    ModelsError(#[from] ModelsError),
    /// rocksdb error: {0}
    RocksDbError(String),
    /// block log is corrupted: {0}
    Corrupted(String),
    /// block log has no header, it must be reset first
    NotInitialized,
    /// unexpected block number: expected {expected}, got {got}
    UnexpectedBlockNum {
        /// next number the store accepts
        expected: u32,
        /// number of the offered block
        got: u32,
    },
}

impl From<rocksdb::Error> for BlockStoreError {
    fn from(err: rocksdb::Error) -> Self {
        BlockStoreError::RocksDbError(err.to_string())
    }
}
