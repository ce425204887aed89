// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

//! Objects stored in the versioned state and the keys they live under.
//!
//! Keys are a prefix from `cairn_db_exports` followed by big-endian fields, so that prefix
//! iteration visits objects in field order.

use cairn_db_exports::{
    make_key, Key, ACCOUNT_METADATA_PREFIX, ACCOUNT_PREFIX, BLOCK_SUMMARY_PREFIX,
    CONTRACT_ROW_PREFIX, GENERATED_TRANSACTION_PREFIX, PERMISSION_LINK_PREFIX, PERMISSION_PREFIX,
    TRANSACTION_PREFIX,
};
use cairn_hash::Hash;
use cairn_models::authority::Authority;
use cairn_models::block_id::BlockId;
use cairn_models::constants::BLOCK_SUMMARY_SLOTS;
use cairn_models::genesis::ChainParameters;
use cairn_models::name::Name;
use cairn_models::producer::ProducerSchedule;
use cairn_models::timestamp::{BlockTimestamp, TimePointSec};
use cairn_models::transaction::{Transaction, TransactionId};
use cairn_protocol_features::ActivatedProtocolFeature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Chain wide configuration and the proposed producer schedule
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPropertyObject {
    /// chain the state belongs to
    pub chain_id: Hash,
    /// block that proposed `proposed_schedule`
    pub proposed_schedule_block_num: Option<u32>,
    /// schedule proposed by a privileged contract, waiting for its block to be irreversible
    pub proposed_schedule: ProducerSchedule,
    /// chain parameters
    pub configuration: ChainParameters,
}

/// Counters updated by every block
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicGlobalPropertyObject {
    /// sequence number of the last action receipt
    pub global_action_sequence: u64,
}

/// Protocol feature activation state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStateObject {
    /// activation history
    pub activated_protocol_features: Vec<ActivatedProtocolFeature>,
    /// features queued for activation by the next block
    pub preactivated_protocol_features: Vec<Hash>,
    /// intrinsics contracts may import
    pub whitelisted_intrinsics: BTreeSet<String>,
}

/// An account
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountObject {
    /// account name
    pub name: Name,
    /// creation time
    pub creation_date: BlockTimestamp,
    /// contract interface description
    pub abi: Vec<u8>,
}

/// Sequence numbers and code of an account
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMetadataObject {
    /// account name
    pub name: Name,
    /// actions received
    pub recv_sequence: u64,
    /// actions authorized
    pub auth_sequence: u64,
    /// code updates
    pub code_sequence: u32,
    /// abi updates
    pub abi_sequence: u32,
    /// digest of the deployed code, zero when none
    pub code_hash: Hash,
    /// time of the last code update
    pub last_code_update: BlockTimestamp,
    /// privileged accounts may bypass resource limits and set the producer schedule
    pub privileged: bool,
    /// deployed code
    pub code: Vec<u8>,
}

/// A named permission of an account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionObject {
    /// owning account
    pub owner: Name,
    /// permission name
    pub name: Name,
    /// parent permission, empty for `owner`
    pub parent: Name,
    /// last change
    pub last_updated: BlockTimestamp,
    /// keys and accounts satisfying the permission
    pub auth: Authority,
}

/// Link from `(account, code, message_type)` to the minimum permission it requires.
/// An empty `message_type` links every action of `code`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionLinkObject {
    /// account declaring the link
    pub account: Name,
    /// contract
    pub code: Name,
    /// action, or empty
    pub message_type: Name,
    /// required permission
    pub required_permission: Name,
}

/// Id of one of the last `BLOCK_SUMMARY_SLOTS` blocks, for TaPoS checks
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummaryObject {
    /// block id
    pub block_id: BlockId,
}

/// Applied, unexpired input transaction, kept for duplicate detection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionObject {
    /// id
    pub trx_id: TransactionId,
    /// expiration
    pub expiration: TimePointSec,
}

/// Deferred transaction waiting for execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTransactionObject {
    /// id of the deferred transaction
    pub trx_id: TransactionId,
    /// account that scheduled it
    pub sender: Name,
    /// identifier chosen by the sender
    pub sender_id: u128,
    /// account billed for the storage
    pub payer: Name,
    /// earliest execution time
    pub delay_until: TimePointSec,
    /// retired as expired after this time
    pub expiration: TimePointSec,
    /// time it was scheduled
    pub published: TimePointSec,
    /// the transaction
    pub trx: Transaction,
}

impl GeneratedTransactionObject {
    /// Bytes billed to the payer
    pub fn billable_size(&self) -> u64 {
        bincode_size(&self.trx) + 96
    }
}

/// Row of a contract table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRowObject {
    /// account billed for the row
    pub payer: Name,
    /// value
    pub value: Vec<u8>,
}

/// Fixed overhead billed for each contract row
pub const CONTRACT_ROW_OVERHEAD: u64 = 112;
/// Fixed overhead billed for each permission
pub const PERMISSION_OVERHEAD: u64 = 160;
/// Fixed overhead billed for each permission link
pub const PERMISSION_LINK_OVERHEAD: u64 = 72;
/// Fixed overhead billed for a new account
pub const NEW_ACCOUNT_OVERHEAD: u64 = 2 * 1024;
/// Multiplier applied to the size of deployed code
pub const SETCODE_RAM_BYTES_MULTIPLIER: u64 = 10;

fn bincode_size<T: Serialize>(value: &T) -> u64 {
    bincode::serialized_size(value).unwrap_or(0)
}

/// Key of an account
pub fn account_key(name: Name) -> Key {
    make_key(ACCOUNT_PREFIX, &[&name.as_u64().to_be_bytes()])
}

/// Key of the metadata of an account
pub fn account_metadata_key(name: Name) -> Key {
    make_key(ACCOUNT_METADATA_PREFIX, &[&name.as_u64().to_be_bytes()])
}

/// Key of a permission
pub fn permission_key(owner: Name, name: Name) -> Key {
    make_key(
        PERMISSION_PREFIX,
        &[&owner.as_u64().to_be_bytes(), &name.as_u64().to_be_bytes()],
    )
}

/// Prefix of every permission of an account
pub fn permission_prefix(owner: Name) -> Key {
    make_key(PERMISSION_PREFIX, &[&owner.as_u64().to_be_bytes()])
}

/// Key of a permission link
pub fn permission_link_key(account: Name, code: Name, message_type: Name) -> Key {
    make_key(
        PERMISSION_LINK_PREFIX,
        &[
            &account.as_u64().to_be_bytes(),
            &code.as_u64().to_be_bytes(),
            &message_type.as_u64().to_be_bytes(),
        ],
    )
}

/// Prefix of every link of an account
pub fn permission_link_prefix(account: Name) -> Key {
    make_key(PERMISSION_LINK_PREFIX, &[&account.as_u64().to_be_bytes()])
}

/// Key of the summary slot of a block
pub fn block_summary_key(block_num: u32) -> Key {
    let slot = block_num % BLOCK_SUMMARY_SLOTS;
    make_key(BLOCK_SUMMARY_PREFIX, &[&slot.to_be_bytes()])
}

/// Key of an applied transaction
pub fn transaction_key(trx_id: &TransactionId) -> Key {
    make_key(TRANSACTION_PREFIX, &[trx_id.to_bytes()])
}

/// Key of a deferred transaction
pub fn generated_transaction_key(sender: Name, sender_id: u128) -> Key {
    make_key(
        GENERATED_TRANSACTION_PREFIX,
        &[&sender.as_u64().to_be_bytes(), &sender_id.to_be_bytes()],
    )
}

/// Key of a contract row
pub fn contract_row_key(code: Name, table: Name, primary_key: u64) -> Key {
    make_key(
        CONTRACT_ROW_PREFIX,
        &[
            &code.as_u64().to_be_bytes(),
            &table.as_u64().to_be_bytes(),
            &primary_key.to_be_bytes(),
        ],
    )
}

/// Prefix of the rows of a contract table
pub fn contract_table_prefix(code: Name, table: Name) -> Key {
    make_key(
        CONTRACT_ROW_PREFIX,
        &[&code.as_u64().to_be_bytes(), &table.as_u64().to_be_bytes()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_by_fields() {
        let alice = Name::from_static("alice");
        let bob = Name::from_static("bob");
        assert!(permission_key(alice, Name::from_static("zz")) < permission_key(bob, Name::from_static("a")));
        assert!(permission_key(alice, bob).starts_with(&permission_prefix(alice)));
        assert!(contract_row_key(alice, bob, 1) < contract_row_key(alice, bob, 256));
        assert_eq!(block_summary_key(5), block_summary_key(5 + BLOCK_SUMMARY_SLOTS));
    }
}
