// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

//! # General description
//!
//! `CairnStateStore` is the in-memory implementation of `VersionedStoreController`:
//! * an ordered map holding every state object
//! * a stack of undo states, one per open session
//! * a config (directory and capacity)
//!
//! # Undo states
//!
//! The first write to a key inside an undo state records the previous value of the key
//! (`None` if absent). Undoing restores those values; squashing merges them into the undo
//! state below, where the older recorded value wins; committing a revision drops the undo
//! states up to it, which makes their writes permanent.
//!
//! # State hash
//!
//! Every entry contributes `H(key || value)` to an XOR accumulator updated on each write,
//! so the hash is independent of write order and cheap to maintain.
//!
//! # Persistence
//!
//! `flush` writes the whole store (data, revision and undo stack) to `state.bin` with
//! `bincode`. `open` loads that file and removes it, so a process that stops without
//! flushing restarts from an empty store and rebuilds its state by replaying blocks.

mod state_store;

pub use crate::state_store::*;
