// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use cairn_chain_exports::{BlockHeaderState, BlockState, ChainError, ChainResult};
use cairn_hash::Hash;
use cairn_models::block::SignedBlock;
use cairn_models::block_id::BlockId;
use cairn_models::timestamp::BlockTimestamp;
use cairn_protocol_features::{ProtocolFeatureSet, RecognizedStatus};
use crossbeam_channel::{bounded, Receiver};
use rayon::ThreadPool;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Check the protocol features a block activates against the features recognized by the node
/// and those already active.
///
/// Failures are reported as `ProtocolFeatureBadBlock`; callers producing a block turn them into
/// subjective errors.
pub fn check_protocol_features(
    set: &ProtocolFeatureSet,
    timestamp: BlockTimestamp,
    currently_activated: &BTreeSet<Hash>,
    new_features: &[Hash],
) -> ChainResult<()> {
    for (index, digest) in new_features.iter().enumerate() {
        match set.is_recognized(digest, timestamp) {
            RecognizedStatus::Unrecognized => {
                return Err(ChainError::ProtocolFeatureBadBlock(format!(
                    "protocol feature with digest {} is unrecognized",
                    digest
                )))
            }
            RecognizedStatus::Disabled => {
                return Err(ChainError::ProtocolFeatureBadBlock(format!(
                    "protocol feature with digest {} is disabled",
                    digest
                )))
            }
            RecognizedStatus::TooEarly => {
                return Err(ChainError::ProtocolFeatureBadBlock(format!(
                    "block time {} is too early to activate protocol feature {}",
                    timestamp, digest
                )))
            }
            RecognizedStatus::Ready => {}
        }
        if currently_activated.contains(digest) {
            return Err(ChainError::ProtocolFeatureBadBlock(format!(
                "protocol feature {} has already been activated",
                digest
            )));
        }
        let earlier = &new_features[..index];
        if earlier.contains(digest) {
            return Err(ChainError::ProtocolFeatureBadBlock(format!(
                "protocol feature {} was activated twice in the same block",
                digest
            )));
        }
        let dependencies_met = set.validate_dependencies(digest, |dependency| {
            currently_activated.contains(dependency) || earlier.contains(dependency)
        });
        if !dependencies_met {
            return Err(ChainError::ProtocolFeatureBadBlock(format!(
                "not all dependencies of protocol feature {} have been activated",
                digest
            )));
        }
    }
    Ok(())
}

/// Block state being computed on the verification pool
#[derive(Debug)]
pub struct BlockStateFuture {
    block_id: BlockId,
    receiver: Receiver<ChainResult<Arc<BlockState>>>,
}

impl BlockStateFuture {
    /// Id of the block being verified
    pub fn id(&self) -> BlockId {
        self.block_id
    }

    /// Wait for the verification to finish
    pub fn get(self) -> ChainResult<Arc<BlockState>> {
        self.receiver.recv().map_err(|_| {
            ChainError::Misc(format!(
                "verification of block {} was abandoned",
                self.block_id
            ))
        })?
    }
}

/// Derive the header state of `block` on top of `prev` and check its signature on `pool`
pub(crate) fn spawn_block_state(
    pool: &ThreadPool,
    prev: BlockHeaderState,
    block: Arc<SignedBlock>,
    block_id: BlockId,
    features: Arc<ProtocolFeatureSet>,
) -> BlockStateFuture {
    let (sender, receiver) = bounded(1);
    pool.spawn(move || {
        let validator = |timestamp: BlockTimestamp, current: &BTreeSet<Hash>, new: &[Hash]| {
            check_protocol_features(&features, timestamp, current, new)
        };
        let result =
            BlockState::from_signed_block(&prev, block, &validator, false).map(Arc::new);
        // the receiving side may have been dropped
        let _ = sender.send(result);
    });
    BlockStateFuture { block_id, receiver }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cairn_protocol_features::BuiltinProtocolFeature;

    #[test]
    fn dependencies_and_duplicates_are_rejected() {
        let set = ProtocolFeatureSet::with_default_builtins().unwrap();
        let replace = set
            .get_builtin_digest(BuiltinProtocolFeature::ReplaceDeferred)
            .unwrap();
        let no_dup = set
            .get_builtin_digest(BuiltinProtocolFeature::NoDuplicateDeferredId)
            .unwrap();
        let now = BlockTimestamp::new(10);
        let none = BTreeSet::new();

        assert_matches!(
            check_protocol_features(&set, now, &none, &[no_dup]),
            Err(ChainError::ProtocolFeatureBadBlock(_))
        );
        check_protocol_features(&set, now, &none, &[replace, no_dup]).unwrap();
        assert_matches!(
            check_protocol_features(&set, now, &none, &[replace, replace]),
            Err(ChainError::ProtocolFeatureBadBlock(_))
        );
        let active: BTreeSet<Hash> = [replace].into_iter().collect();
        assert_matches!(
            check_protocol_features(&set, now, &active, &[replace]),
            Err(ChainError::ProtocolFeatureBadBlock(_))
        );
        check_protocol_features(&set, now, &active, &[no_dup]).unwrap();
        assert_matches!(
            check_protocol_features(&set, now, &none, &[Hash::compute_from(b"unknown")]),
            Err(ChainError::ProtocolFeatureBadBlock(_))
        );
    }
}
