// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::ChainResult;
use cairn_hash::Hash;
use cairn_models::action::Action;
use cairn_models::name::Name;
use cairn_models::producer::ProducerKey;
use cairn_models::timestamp::BlockTimestamp;
use cairn_models::transaction::{Transaction, TransactionId};
use cairn_protocol_features::BuiltinProtocolFeature;

/// What a contract sees of the chain while one of its actions runs.
///
/// Every write goes through the state session of the running transaction, so a failing
/// transaction leaves no trace.
pub trait ActionContext {
    /// account whose code runs
    fn receiver(&self) -> Name;
    /// the action
    fn action(&self) -> &Action;
    /// running transaction
    fn trx_id(&self) -> TransactionId;
    /// height of the pending block
    fn block_num(&self) -> u32;
    /// time of the pending block
    fn block_time(&self) -> BlockTimestamp;
    /// inline call depth, 0 for top level actions
    fn recurse_depth(&self) -> u32;
    /// whether the receiver is privileged
    fn is_privileged(&self) -> bool;
    /// account that sent the running inline action, if any
    fn get_sender(&self) -> Option<Name>;
    /// whether `account` authorized the action
    fn has_authorization(&self, account: Name) -> bool;
    /// fail unless `account` authorized the action
    fn require_authorization(&self, account: Name) -> ChainResult<()>;
    /// notify `account` of the action once the receiver is done
    fn require_recipient(&mut self, account: Name) -> ChainResult<()>;
    /// queue an inline action
    fn send_inline(&mut self, action: Action) -> ChainResult<()>;
    /// row of a table of the receiver
    fn get_row(&self, table: Name, primary_key: u64) -> ChainResult<Option<Vec<u8>>>;
    /// write a row of a table of the receiver, billed to `payer`
    fn set_row(&mut self, payer: Name, table: Name, primary_key: u64, value: Vec<u8>)
        -> ChainResult<()>;
    /// remove a row of a table of the receiver
    fn remove_row(&mut self, table: Name, primary_key: u64) -> ChainResult<bool>;
    /// schedule a deferred transaction
    fn schedule_deferred(
        &mut self,
        sender_id: u128,
        payer: Name,
        trx: Transaction,
        replace_existing: bool,
    ) -> ChainResult<()>;
    /// cancel a deferred transaction sent by the receiver
    fn cancel_deferred(&mut self, sender_id: u128) -> ChainResult<bool>;
    /// propose a producer schedule (privileged only), returns its version or -1
    fn set_proposed_producers(&mut self, producers: Vec<ProducerKey>) -> ChainResult<i64>;
    /// whether a builtin feature is active in the pending block
    fn is_builtin_activated(&self, feature: BuiltinProtocolFeature) -> bool;
    /// append to the console output
    fn console_append(&mut self, text: &str);
}

/// Outcome of running contract code
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// ran to completion
    Success,
    /// the contract rejected the action; only the transaction fails
    SoftFail(String),
    /// the executor itself failed; the block must be aborted
    HardFail(String),
}

/// Outcome and cost of running an action
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    /// outcome
    pub status: ExecutionStatus,
    /// cpu time billed to the transaction
    pub cpu_usage_us: u32,
}

impl ExecutionResult {
    /// Successful run costing `cpu_usage_us`
    pub fn success(cpu_usage_us: u32) -> Self {
        ExecutionResult {
            status: ExecutionStatus::Success,
            cpu_usage_us,
        }
    }
}

/// Runs contract code. Invoked once per action and receiver, in execution order, for every
/// action that is not a native action of the system account.
///
/// Errors returned by the context must be propagated as they are.
pub trait ActionExecutor: Send + Sync {
    /// Run the code `code_hash` deployed on the receiver of `context`
    fn execute(&self, code_hash: &Hash, context: &mut dyn ActionContext)
        -> ChainResult<ExecutionResult>;
}
