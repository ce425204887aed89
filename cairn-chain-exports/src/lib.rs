// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>
//! # General description
//!
//! Types, traits and configuration shared by the chain controller and the code embedding it.
//!
//! ## Block states
//!
//! A [`BlockHeaderState`] is everything derived from a chain of headers: the active and pending
//! producer schedules, the DPoS confirmation bookkeeping and the resulting irreversible height,
//! and the set of activated protocol features. A [`BlockState`] adds the block itself and the
//! metadata of its transactions; it is shared through `Arc` between the fork database and the
//! controller.
//!
//! ## Collaborators
//!
//! * [`ActionExecutor`] runs contract code. It receives an [`ActionContext`] through which every
//!   read and write of the state goes.
//! * [`ChainListener`]s are notified of blocks and transactions through [`ChainSignals`].
//! * [`SnapshotWriter`] / [`SnapshotReader`] move the whole state in and out of the node.
//!
//! ## Configuration
//!
//! [`ChainSettings`] is what the operator writes, [`ChainConfig`] what the controller runs with.
//!
//! ## Test exports
//!
//! With the `test-exports` feature, `test_exports` provides a mock listener and a scripted
//! action executor.

#![warn(missing_docs)]

mod block_state;
mod error;
mod executor;
mod settings;
mod signals;
mod snapshot;
mod trace;
mod types;
mod unapplied;

pub mod state_objects;

pub use block_state::*;
pub use error::*;
pub use executor::*;
pub use settings::*;
pub use signals::*;
pub use snapshot::*;
pub use trace::*;
pub use types::*;
pub use unapplied::*;

/// Exports related to tests as mocks and scripted collaborators
#[cfg(feature = "test-exports")]
pub mod test_exports;
