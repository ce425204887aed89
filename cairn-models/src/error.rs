// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use displaydoc::Display;
use thiserror::Error;

/// models error
#[non_exhaustive]
#[derive(Display, Error, Debug, Clone)]
pub enum ModelsError {
    /// hashing error: {0}
    HashError(#[from] cairn_hash::HashError),
    /// signature error: {0}
    SignatureError(String),
    /// invalid name: {0}
    InvalidName(String),
    /// serialization error: {0}
    SerializeError(String),
    /// deserialization error: {0}
    DeserializeError(String),
    /// json error: {0}
    JsonError(String),
    /// invalid transaction: {0}
    InvalidTransaction(String),
    /// invalid authority: {0}
    InvalidAuthority(String),
}

impl From<cairn_signature::SignatureError> for ModelsError {
    fn from(err: cairn_signature::SignatureError) -> Self {
        ModelsError::SignatureError(err.to_string())
    }
}

impl From<cairn_serialization::SerializeError> for ModelsError {
    fn from(err: cairn_serialization::SerializeError) -> Self {
        ModelsError::SerializeError(err.to_string())
    }
}

impl From<serde_json::Error> for ModelsError {
    fn from(err: serde_json::Error) -> Self {
        ModelsError::JsonError(err.to_string())
    }
}
