// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>
//! Interface of the versioned state store.
//!
//! The store is a flat ordered key/value map whose writes are recorded in a stack of undo
//! states. Each undo state is a checkpoint ("session") that can be discarded (`undo`),
//! merged into the checkpoint below (`squash`) or kept until the revision it belongs to
//! becomes irreversible (`commit`). [`UndoSession`] is the scoped guard over one checkpoint:
//! dropping it without calling `push` or `squash` discards its writes.
//!
//! Values are typed state objects encoded with `bincode`, keys are built from the prefixes in
//! [`constants`] followed by the fixed-width big-endian encoding of the object index so that
//! prefix iteration returns objects in index order.

mod constants;
mod controller;
mod error;
mod session;
mod settings;

pub use constants::*;
pub use controller::*;
pub use error::*;
pub use session::*;
pub use settings::*;
