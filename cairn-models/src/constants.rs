// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::name::Name;

/// account owning the native actions and the chain wide permissions
pub const SYSTEM_ACCOUNT_NAME: Name = Name::from_static("cairn");
/// account that can never be authorized
pub const NULL_ACCOUNT_NAME: Name = Name::from_static("cairn.null");
/// account whose permissions track the active producer schedule
pub const PRODUCERS_ACCOUNT_NAME: Name = Name::from_static("cairn.prods");

/// root permission of every account
pub const OWNER_NAME: Name = Name::from_static("owner");
/// default permission of every account
pub const ACTIVE_NAME: Name = Name::from_static("active");
/// pseudo permission satisfied by any permission of the account
pub const ANY_NAME: Name = Name::from_static("cairn.any");
/// permission of the producers account requiring a 1/2+1 majority
pub const MAJORITY_PRODUCERS_PERMISSION_NAME: Name = Name::from_static("prod.major");
/// permission of the producers account requiring a 1/3+1 minority
pub const MINORITY_PRODUCERS_PERMISSION_NAME: Name = Name::from_static("prod.minor");

/// implicit action pushed by the system account at the start of every block
pub const ONBLOCK_ACTION_NAME: Name = Name::from_static("onblock");

/// duration of a block slot
pub const BLOCK_INTERVAL_MS: u64 = 500;
/// 2000-01-01T00:00:00 UTC, origin of block timestamps
pub const BLOCK_TIMESTAMP_EPOCH_MS: u64 = 946_684_800_000;
/// consecutive blocks produced by one producer before the schedule moves on
pub const PRODUCER_REPETITIONS: u32 = 12;
/// maximum number of producers in a schedule
pub const MAX_PRODUCERS: u32 = 125;
/// length of the confirmation ring kept by block header states
pub const MAXIMUM_TRACKED_DPOS_CONFIRMATIONS: usize = 1024;
/// number of block summaries kept for TaPoS, indexed by `block_num & 0xffff`
pub const BLOCK_SUMMARY_SLOTS: u32 = 0x10000;
/// maximum recursion depth when resolving account permissions
pub const MAX_AUTHORITY_DEPTH: u16 = 6;

/// maximum number of transaction receipts a block may carry
pub const MAX_BLOCK_TRANSACTIONS: u32 = 100_000;
/// maximum number of actions a transaction may carry
pub const MAX_TRANSACTION_ACTIONS: u32 = 10_000;
/// maximum number of authorizations an action may declare
pub const MAX_ACTION_AUTHORIZATIONS: u32 = 64;
/// maximum payload size of an action
pub const MAX_ACTION_DATA_SIZE: u64 = 1_048_576;
/// maximum number of signatures a transaction may carry
pub const MAX_TRANSACTION_SIGNATURES: u32 = 64;
/// maximum number of protocol features a block may activate
pub const MAX_BLOCK_FEATURE_ACTIVATIONS: u32 = 1_024;
