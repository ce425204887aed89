// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::{BuiltinProtocolFeature, ProtocolFeature, ProtocolFeatureError, ProtocolFeatureSet};
use cairn_hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// A feature digest and the height of the first block where it is active
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatedProtocolFeature {
    /// feature
    pub feature_digest: Hash,
    /// first block where the feature is active
    pub activation_block_num: u32,
}

/// Activation history of the recognized features
#[derive(Debug)]
pub struct ProtocolFeatureManager {
    set: ProtocolFeatureSet,
    activated: Vec<ActivatedProtocolFeature>,
    builtin_activation: BTreeMap<BuiltinProtocolFeature, u32>,
}

impl ProtocolFeatureManager {
    /// Manager over a recognized set, with an empty history
    pub fn new(set: ProtocolFeatureSet) -> Self {
        ProtocolFeatureManager {
            set,
            activated: Vec::new(),
            builtin_activation: BTreeMap::new(),
        }
    }

    /// Replace the history with the one stored in the state
    pub fn init(&mut self, history: &[ActivatedProtocolFeature]) -> Result<(), ProtocolFeatureError> {
        self.activated.clear();
        self.builtin_activation.clear();
        for entry in history {
            self.activate_feature(entry.feature_digest, entry.activation_block_num)?;
        }
        Ok(())
    }

    /// Record the activation of a feature at a height
    pub fn activate_feature(
        &mut self,
        feature_digest: Hash,
        block_num: u32,
    ) -> Result<(), ProtocolFeatureError> {
        let feature = self
            .set
            .get_protocol_feature(&feature_digest)
            .ok_or(ProtocolFeatureError::Unrecognized(feature_digest))?;
        if self.is_feature_activated(&feature_digest) {
            return Err(ProtocolFeatureError::AlreadyActivated(feature_digest));
        }
        if let Some(last) = self.activated.last() {
            if last.activation_block_num > block_num {
                return Err(ProtocolFeatureError::InvalidActivationOrder(
                    block_num,
                    last.activation_block_num,
                ));
            }
        }
        if let Some(builtin) = feature.builtin_feature {
            self.builtin_activation.insert(builtin, block_num);
        }
        self.activated.push(ActivatedProtocolFeature {
            feature_digest,
            activation_block_num: block_num,
        });
        debug!("protocol feature {} active from block {}", feature_digest, block_num);
        Ok(())
    }

    /// Forget activations of blocks above `block_num`
    pub fn popped_blocks_to(&mut self, block_num: u32) {
        while let Some(last) = self.activated.last() {
            if last.activation_block_num <= block_num {
                break;
            }
            let digest = last.feature_digest;
            self.activated.pop();
            if let Some(builtin) = self
                .set
                .get_protocol_feature(&digest)
                .and_then(|f| f.builtin_feature)
            {
                self.builtin_activation.remove(&builtin);
            }
        }
    }

    /// Whether a builtin is active in the block at `current_block_num`
    pub fn is_builtin_activated(&self, builtin: BuiltinProtocolFeature, current_block_num: u32) -> bool {
        self.builtin_activation
            .get(&builtin)
            .map(|activation| *activation <= current_block_num)
            .unwrap_or(false)
    }

    /// Whether a feature is in the history
    pub fn is_feature_activated(&self, feature_digest: &Hash) -> bool {
        self.activated
            .iter()
            .any(|entry| entry.feature_digest == *feature_digest)
    }

    /// Activation history in height order
    pub fn activated_features(&self) -> &[ActivatedProtocolFeature] {
        &self.activated
    }

    /// Recognized set
    pub fn get_protocol_feature_set(&self) -> &ProtocolFeatureSet {
        &self.set
    }

    /// Feature by digest
    pub fn get_protocol_feature(&self, digest: &Hash) -> Option<&ProtocolFeature> {
        self.set.get_protocol_feature(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn manager() -> ProtocolFeatureManager {
        ProtocolFeatureManager::new(ProtocolFeatureSet::with_default_builtins().unwrap())
    }

    #[test]
    fn activation_and_rewind() {
        let mut pfm = manager();
        let preactivate = pfm
            .get_protocol_feature_set()
            .get_builtin_digest(BuiltinProtocolFeature::PreactivateFeature)
            .unwrap();
        let get_sender = pfm
            .get_protocol_feature_set()
            .get_builtin_digest(BuiltinProtocolFeature::GetSender)
            .unwrap();
        pfm.activate_feature(preactivate, 5).unwrap();
        pfm.activate_feature(get_sender, 8).unwrap();
        assert_matches!(
            pfm.activate_feature(get_sender, 9),
            Err(ProtocolFeatureError::AlreadyActivated(_))
        );
        assert!(!pfm.is_builtin_activated(BuiltinProtocolFeature::GetSender, 7));
        assert!(pfm.is_builtin_activated(BuiltinProtocolFeature::GetSender, 8));

        pfm.popped_blocks_to(7);
        assert!(!pfm.is_feature_activated(&get_sender));
        assert!(pfm.is_builtin_activated(BuiltinProtocolFeature::PreactivateFeature, 7));
        assert_eq!(pfm.activated_features().len(), 1);
    }

    #[test]
    fn unknown_and_out_of_order_activations_fail() {
        let mut pfm = manager();
        assert_matches!(
            pfm.activate_feature(Hash::compute_from(b"unknown"), 1),
            Err(ProtocolFeatureError::Unrecognized(_))
        );
        let set = pfm.get_protocol_feature_set().clone();
        let a = set
            .get_builtin_digest(BuiltinProtocolFeature::PreactivateFeature)
            .unwrap();
        let b = set
            .get_builtin_digest(BuiltinProtocolFeature::ReplaceDeferred)
            .unwrap();
        pfm.activate_feature(a, 10).unwrap();
        assert_matches!(
            pfm.activate_feature(b, 9),
            Err(ProtocolFeatureError::InvalidActivationOrder(9, 10))
        );
        pfm.init(&[]).unwrap();
        assert!(pfm.activated_features().is_empty());
    }
}
