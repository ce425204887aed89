// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

//! Structured trace events for the chain core.
//!
//! `chain_trace!("apply_block", { "block_id": id, "block_num": num })` emits a
//! `tracing::trace!` record whose message is `chain_trace:<event>:<json params>`.

#[macro_export]
macro_rules! chain_trace {
    ($evt:expr, $params:tt) => {
        tracing::trace!("chain_trace:{}:{}", $evt, serde_json::json!($params));
    };
}
