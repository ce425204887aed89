// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>
//! # General description
//!
//! The chain controller: it owns the versioned state store, the block log, the reversible
//! block store and the fork database, and keeps the four consistent while blocks are produced,
//! received, switched between and made irreversible.
//!
//! ## Producing a block
//!
//! `start_block` opens an undo session and a pending block on top of the head, activates the
//! protocol features the block carries and runs the implicit `onblock` transaction. Input and
//! deferred transactions are then pushed one by one, each in a nested session squashed into the
//! block on success and undone on failure. `finalize_block` computes the Merkle roots and the
//! header, `sign_block` signs it and `commit_block` adds it to the fork database as the new head.
//!
//! ## Receiving a block
//!
//! `create_block_state_future` derives the header state and checks the producer signature on the
//! verification pool. `push_block` adds the result to the fork database and, when the best branch
//! changed, applies it: either directly on top of the head, or by popping blocks down to the
//! common ancestor and applying the new branch. A block that fails to apply is removed from the
//! fork database and the previous branch is restored.
//!
//! ## Irreversibility
//!
//! Each head change may raise the DPoS irreversible height. Blocks at or below it are appended to
//! the block log, removed from the reversible store, their undo states committed, and the fork
//! database root advances.
//!
//! ## Startup
//!
//! `startup` resumes from a snapshot, from the state left by a clean shutdown, or from genesis,
//! then replays the block log and the reversible store beyond the head.

#![warn(unused_crate_dependencies)]
#[macro_use]
extern crate cairn_logging;

mod apply_context;
mod authorization;
mod controller;
mod fork_database;
mod native_handlers;
mod pending;
mod resource_limits;
mod snapshot;
mod transaction_context;
mod verification;

pub use authorization::{permission_billable_size, AuthorizationManager};
pub use controller::Controller;
pub use fork_database::{Branch, ForkDatabase, FORK_DB_FILE_NAME};
pub use native_handlers::{
    decode_payload, encode_payload, transaction_id_to_sender_id, CancelDelay, DeleteAuth,
    LinkAuth, NewAccount, SetAbi, SetCode, UnlinkAuth, UpdateAuth, CANCELDELAY, DELETEAUTH,
    LINKAUTH, NEWACCOUNT, SETABI, SETCODE, UNLINKAUTH, UPDATEAUTH,
};
pub use resource_limits::ResourceLimitsManager;
pub use snapshot::{
    FileSnapshotReader, FileSnapshotWriter, VariantSnapshot, VariantSnapshotReader,
    VariantSnapshotWriter, SNAPSHOT_FILE_MAGIC,
};
pub use verification::{check_protocol_features, BlockStateFuture};

#[cfg(test)]
mod tests;
