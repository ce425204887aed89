// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use cairn_block_store::BlockStoreError;
use cairn_db_exports::StateStoreError;
use cairn_hash::HashError;
use cairn_models::error::ModelsError;
use cairn_protocol_features::ProtocolFeatureError;
use cairn_signature::SignatureError;
use displaydoc::Display;
use thiserror::Error;

/// Chain result
pub type ChainResult<T, E = ChainError> = core::result::Result<T, E>;

/// Chain error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum ChainError {
    /// models error: {0}
    ModelsError(#[from] ModelsError),
    /// hash error: {0}
    HashError(#[from] HashError),
    /// signature error: {0}
    SignatureError(#[from] SignatureError),
    /// state store error: {0}
    StateStoreError(#[from] StateStoreError),
    /// block store error: {0}
    BlockStoreError(#[from] BlockStoreError),
    /// io error: {0}
    IoError(#[from] std::io::Error),
    /// configuration error: {0}
    ConfigError(String),
    /// snapshot error: {0}
    SnapshotError(String),

    /// invalid block: {0}
    BlockValidation(String),
    /// unlinkable block: {0}
    UnlinkableBlock(String),
    /// receipt of transaction {index} does not match: {details}
    ReceiptMismatch {
        /// position of the transaction in the block
        index: usize,
        /// what differs
        details: String,
    },
    /// block id mismatch: declared {declared}, computed {computed}
    BlockIdMismatch {
        /// id of the received block
        declared: String,
        /// id obtained by applying it
        computed: String,
    },
    /// invalid block signature: {0}
    InvalidSignature(String),
    /// block {0} is already known
    BlockAlreadyKnown(String),

    /// fork database inconsistency: {0}
    ForkDatabase(String),
    /// state store guard: {0}
    DatabaseGuard(String),
    /// reversible block store guard: {0}
    ReversibleGuard(String),

    /// block production refused: {0}
    SubjectiveBlockProduction(String),
    /// deadline exceeded: {0}
    DeadlineExceeded(String),
    /// protocol feature error: {0}
    ProtocolFeature(String),
    /// block activates protocol features incorrectly: {0}
    ProtocolFeatureBadBlock(String),
    /// protocol feature manager error: {0}
    ProtocolFeatureManager(#[from] ProtocolFeatureError),
    /// invalid producer schedule: {0}
    ProducerSchedule(String),

    /// transaction error: {0}
    Transaction(String),
    /// expired transaction: {0}
    ExpiredTransaction(String),
    /// duplicate transaction {0}
    DuplicateTransaction(String),
    /// transaction references an unknown or wrong block: {0}
    InvalidRefBlock(String),
    /// missing authorization: {0}
    Authorization(String),
    /// authorizing actor {0} is not on the whitelist
    ActorWhitelist(String),
    /// authorizing actor {0} is on the blacklist
    ActorBlacklist(String),
    /// contract {0} is not on the whitelist
    ContractWhitelist(String),
    /// contract {0} is on the blacklist
    ContractBlacklist(String),
    /// action {0} is on the blacklist
    ActionBlacklist(String),
    /// public key {0} is on the blacklist
    KeyBlacklist(String),
    /// resource exhausted: {0}
    ResourceExhausted(String),
    /// pending block has no room left: {0}
    BlockResourceExhausted(String),
    /// action failed: {0}
    ActionFailed(String),
    /// action executor failure: {0}
    ExecutorFatal(String),
    /// deferred transaction error: {0}
    DeferredTransaction(String),
    /// native action error: {0}
    NativeAction(String),

    /// a listener failed with a non recoverable error: {0}
    EmitSignal(String),
    /// pending block error: {0}
    PendingBlock(String),
    /// {0}
    Misc(String),
}

impl ChainError {
    /// Stable numeric code reported in transaction traces
    pub fn error_code(&self) -> u64 {
        match self {
            ChainError::ModelsError(_)
            | ChainError::HashError(_)
            | ChainError::SignatureError(_) => 3_010_000,
            ChainError::StateStoreError(_) => 3_060_000,
            ChainError::BlockStoreError(_) | ChainError::IoError(_) => 3_190_000,
            ChainError::ConfigError(_) => 3_170_000,
            ChainError::SnapshotError(_) => 3_140_000,
            ChainError::BlockValidation(_) => 3_030_000,
            ChainError::UnlinkableBlock(_) => 3_030_001,
            ChainError::ReceiptMismatch { .. } => 3_030_002,
            ChainError::BlockIdMismatch { .. } => 3_030_003,
            ChainError::InvalidSignature(_) => 3_030_004,
            ChainError::BlockAlreadyKnown(_) => 3_030_005,
            ChainError::ForkDatabase(_) => 3_020_000,
            ChainError::DatabaseGuard(_) => 3_060_101,
            ChainError::ReversibleGuard(_) => 3_060_102,
            ChainError::SubjectiveBlockProduction(_) => 3_080_000,
            ChainError::DeadlineExceeded(_) => 3_080_004,
            ChainError::ProtocolFeature(_) | ChainError::ProtocolFeatureManager(_) => 3_250_000,
            ChainError::ProtocolFeatureBadBlock(_) => 3_250_001,
            ChainError::ProducerSchedule(_) => 3_200_000,
            ChainError::Transaction(_) => 3_040_000,
            ChainError::ExpiredTransaction(_) => 3_040_005,
            ChainError::DuplicateTransaction(_) => 3_040_008,
            ChainError::InvalidRefBlock(_) => 3_040_007,
            ChainError::Authorization(_) => 3_090_000,
            ChainError::ActorWhitelist(_) => 3_130_001,
            ChainError::ActorBlacklist(_) => 3_130_002,
            ChainError::ContractWhitelist(_) => 3_130_003,
            ChainError::ContractBlacklist(_) => 3_130_004,
            ChainError::ActionBlacklist(_) => 3_130_005,
            ChainError::KeyBlacklist(_) => 3_130_006,
            ChainError::ResourceExhausted(_) => 3_080_001,
            ChainError::BlockResourceExhausted(_) => 3_080_002,
            ChainError::ActionFailed(_) => 3_050_003,
            ChainError::ExecutorFatal(_) => 3_070_000,
            ChainError::DeferredTransaction(_) => 3_040_010,
            ChainError::NativeAction(_) => 3_050_000,
            ChainError::EmitSignal(_) => 3_160_000,
            ChainError::PendingBlock(_) => 3_100_000,
            ChainError::Misc(_) => 3_100_001,
        }
    }

    /// Errors that abort the enclosing block even when raised by a single transaction
    pub fn is_hard_fail(&self) -> bool {
        matches!(
            self,
            ChainError::DatabaseGuard(_)
                | ChainError::ReversibleGuard(_)
                | ChainError::ExecutorFatal(_)
                | ChainError::ForkDatabase(_)
                | ChainError::EmitSignal(_)
        ) || self.is_out_of_space()
    }

    /// Errors a notification listener may not swallow
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            ChainError::DatabaseGuard(_) | ChainError::ReversibleGuard(_) | ChainError::EmitSignal(_)
        ) || self.is_out_of_space()
    }

    /// Failures caused by local policy rather than by the transaction or block itself
    pub fn is_subjective(&self) -> bool {
        matches!(
            self,
            ChainError::SubjectiveBlockProduction(_)
                | ChainError::DeadlineExceeded(_)
                | ChainError::BlockResourceExhausted(_)
                | ChainError::ProtocolFeature(_)
                | ChainError::ActorWhitelist(_)
                | ChainError::ActorBlacklist(_)
                | ChainError::ContractWhitelist(_)
                | ChainError::ContractBlacklist(_)
                | ChainError::ActionBlacklist(_)
                | ChainError::KeyBlacklist(_)
        )
    }

    fn is_out_of_space(&self) -> bool {
        matches!(
            self,
            ChainError::StateStoreError(StateStoreError::OutOfSpace { .. })
        )
    }
}

impl From<config::ConfigError> for ChainError {
    fn from(err: config::ConfigError) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_fail_classes() {
        assert!(ChainError::DatabaseGuard("low".into()).is_hard_fail());
        assert!(ChainError::StateStoreError(StateStoreError::OutOfSpace {
            used: 1,
            requested: 2,
            size: 2
        })
        .is_hard_fail());
        assert!(!ChainError::ActionFailed("assert".into()).is_hard_fail());
        assert!(ChainError::ActorBlacklist("bob".into()).is_subjective());
        assert_ne!(
            ChainError::ActorBlacklist("a".into()).error_code(),
            ChainError::ActorWhitelist("a".into()).error_code()
        );
    }
}
