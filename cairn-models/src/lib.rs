// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>
//! All the structures that are used everywhere
//!
//! Please keep it light
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

/// actions and action receipts
pub mod action;
/// permission authorities
pub mod authority;
/// block headers and signed blocks
pub mod block;
/// block id with its embedded height
pub mod block_id;
/// chain wide constants
pub mod constants;
/// models error
pub mod error;
/// genesis state and chain parameters
pub mod genesis;
/// 64 bit account / action names
pub mod name;
/// producer schedules
pub mod producer;
/// transaction receipts
pub mod receipt;
/// block timestamps
pub mod timestamp;
/// transactions and their metadata
pub mod transaction;
