// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>
//! # General description
//!
//! Protocol features are optional behavior changes identified by a digest. A node recognizes a
//! set of features ([`ProtocolFeatureSet`]), each with dependencies on other features and
//! subjective restrictions (enabled or not, earliest activation time, whether it must be
//! pre-activated before a block may activate it).
//!
//! A feature is pre-activated by an on-chain action, then activated by listing its digest in
//! the header of the next block produced. [`ProtocolFeatureManager`] tracks the activation
//! history (digest and activation height) and answers whether a builtin feature is active at a
//! given height. The history itself is part of the versioned state; the manager mirrors it and
//! is rewound with [`ProtocolFeatureManager::popped_blocks_to`] when blocks are undone.
//!
//! Builtin features ([`BuiltinProtocolFeature`]) are the features this node implements; each
//! one has a deterministic digest derived from its codename, description and dependencies.

mod error;
mod feature;
mod manager;

pub use error::*;
pub use feature::*;
pub use manager::*;
