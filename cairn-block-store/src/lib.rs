// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>
//! Durable block storage.
//!
//! * [`BlockLog`]: append-only file of irreversible blocks with a fixed-width offset index,
//!   so any block is one seek away from its number.
//! * [`ReversibleBlockStore`]: RocksDB instance holding applied blocks that are not yet
//!   irreversible, keyed by big-endian block number and pruned as irreversibility advances.

mod block_log;
mod error;
mod reversible;

pub use block_log::*;
pub use error::*;
pub use reversible::*;
