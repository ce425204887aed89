// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::ChainError;
use cairn_models::action::{Action, ActionReceipt};
use cairn_models::block_id::BlockId;
use cairn_models::name::Name;
use cairn_models::receipt::TransactionReceiptHeader;
use cairn_models::timestamp::BlockTimestamp;
use cairn_models::transaction::TransactionId;

/// Execution record of one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTrace {
    /// position in the transaction, starting at 1
    pub action_ordinal: u32,
    /// ordinal of the action that created this one, 0 for top level actions
    pub creator_action_ordinal: u32,
    /// account whose code ran
    pub receiver: Name,
    /// the action
    pub act: Action,
    /// filled when the action ran to completion
    pub receipt: Option<ActionReceipt>,
    /// cpu time reported by the executor
    pub elapsed_us: u64,
    /// console output
    pub console: String,
    /// whether the action was sent inline by a contract
    pub inline: bool,
    /// error message if the action failed
    pub except: Option<String>,
}

/// Execution record of a transaction.
///
/// A failed transaction is reported through `except` rather than as an error of the push
/// call, unless the failure must abort the whole block.
#[derive(Debug)]
pub struct TransactionTrace {
    /// transaction id
    pub id: TransactionId,
    /// height of the block it was applied in
    pub block_num: u32,
    /// time of that block
    pub block_time: BlockTimestamp,
    /// id of that block, once known
    pub producer_block_id: Option<BlockId>,
    /// receipt header, set on success
    pub receipt: Option<TransactionReceiptHeader>,
    /// wall time spent
    pub elapsed_us: u64,
    /// billed net usage in bytes
    pub net_usage: u64,
    /// executed from the deferred queue
    pub scheduled: bool,
    /// actions, in execution order
    pub action_traces: Vec<ActionTrace>,
    /// error that made the transaction fail
    pub except: Option<ChainError>,
    /// numeric code of `except`
    pub error_code: Option<u64>,
}

impl TransactionTrace {
    /// Empty trace for a transaction about to run
    pub fn new(id: TransactionId, block_num: u32, block_time: BlockTimestamp) -> Self {
        TransactionTrace {
            id,
            block_num,
            block_time,
            producer_block_id: None,
            receipt: None,
            elapsed_us: 0,
            net_usage: 0,
            scheduled: false,
            action_traces: Vec::new(),
            except: None,
            error_code: None,
        }
    }

    /// Record the failure of the transaction
    pub fn set_except(&mut self, err: ChainError) {
        self.error_code = Some(err.error_code());
        self.except = Some(err);
    }

    /// Whether the transaction succeeded
    pub fn succeeded(&self) -> bool {
        self.except.is_none()
    }
}
