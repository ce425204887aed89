// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

#![warn(missing_docs)]
//! SHA-256 digests used for block ids, transaction ids, Merkle roots and state integrity.
pub use error::HashError;
pub use hash::{merkle_root, Hash, HashDeserializer, HashSerializer};
pub use settings::HASH_SIZE_BYTES;

mod error;
mod hash;
mod settings;
