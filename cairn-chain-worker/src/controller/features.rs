// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::Controller;
use crate::verification::check_protocol_features;
use cairn_chain_exports::state_objects::ProtocolStateObject;
use cairn_chain_exports::{ChainError, ChainResult};
use cairn_db_exports::PROTOCOL_STATE_KEY;
use cairn_hash::Hash;
use cairn_protocol_features::{BuiltinProtocolFeature, RecognizedStatus};
use tracing::info;

impl Controller {
    /// Queue a feature for activation by the next block produced on top of the pending one.
    ///
    /// Failures are subjective while producing and fail the block otherwise.
    pub fn preactivate_feature(&self, feature_digest: Hash) -> ChainResult<()> {
        let producing = self.is_producing_block();
        let reject = |message: String| {
            if producing {
                ChainError::ProtocolFeature(message)
            } else {
                ChainError::ProtocolFeatureBadBlock(message)
            }
        };
        let now = self.pending_block_time()?;
        match self.features_set.is_recognized(&feature_digest, now) {
            RecognizedStatus::Unrecognized => {
                return Err(reject(format!(
                    "protocol feature with digest {} is unrecognized",
                    feature_digest
                )))
            }
            RecognizedStatus::Disabled => {
                return Err(reject(format!(
                    "protocol feature with digest {} is disabled",
                    feature_digest
                )))
            }
            RecognizedStatus::TooEarly => {
                return Err(reject(format!(
                    "block time {} is too early to activate protocol feature with digest {}",
                    now, feature_digest
                )))
            }
            RecognizedStatus::Ready => {}
        }
        if self.is_protocol_feature_activated(&feature_digest)? {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature with digest {} is already activated",
                feature_digest
            )));
        }
        let mut protocol_state = self.get_protocol_state()?;
        if protocol_state
            .preactivated_protocol_features
            .contains(&feature_digest)
        {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature with digest {} is already pre-activated",
                feature_digest
            )));
        }
        let preactivated = &protocol_state.preactivated_protocol_features;
        let dependencies_met = self
            .features_set
            .validate_dependencies(&feature_digest, |dependency| {
                preactivated.contains(dependency)
                    || self.is_protocol_feature_activated(dependency).unwrap_or(false)
            });
        if !dependencies_met {
            return Err(ChainError::ProtocolFeature(format!(
                "not all dependencies of protocol feature with digest {} have been activated or pre-activated",
                feature_digest
            )));
        }
        protocol_state
            .preactivated_protocol_features
            .push(feature_digest);
        self.with_db(|db| {
            db.put_object(PROTOCOL_STATE_KEY.to_vec(), &protocol_state)?;
            Ok(())
        })
    }

    /// Features waiting for the next block
    pub fn get_preactivated_protocol_features(&self) -> ChainResult<Vec<Hash>> {
        Ok(self.get_protocol_state()?.preactivated_protocol_features)
    }

    /// Check a list of activations against the head block
    pub fn validate_protocol_features(&self, features_to_activate: &[Hash]) -> ChainResult<()> {
        check_protocol_features(
            &self.features_set,
            self.head.timestamp(),
            &self.head.header_state.activated_protocol_features,
            features_to_activate,
        )
    }

    /// Whether a feature is active in the pending block, or in the head block when nothing is
    /// pending
    pub fn is_protocol_feature_activated(&self, feature_digest: &Hash) -> ChainResult<bool> {
        match &self.pending {
            Some(pending) => pending.is_protocol_feature_activated(feature_digest),
            None => Ok(self
                .head
                .header_state
                .activated_protocol_features
                .contains(feature_digest)),
        }
    }

    /// Whether a builtin feature is active at the current height
    pub fn is_builtin_activated(&self, feature: BuiltinProtocolFeature) -> bool {
        self.protocol_features
            .is_builtin_activated(feature, self.current_block_num())
    }

    /// One-time side effects of a builtin feature, run in the block activating it
    pub(crate) fn trigger_activation_handler(&self, feature: BuiltinProtocolFeature) -> ChainResult<()> {
        match feature {
            BuiltinProtocolFeature::PreactivateFeature => {
                self.add_intrinsics(&["preactivate_feature", "is_feature_activated"])
            }
            BuiltinProtocolFeature::GetSender => self.add_intrinsics(&["get_sender"]),
            BuiltinProtocolFeature::ReplaceDeferred => {
                info!("applying ram corrections");
                self.with_db(|db| self.resource_limits.apply_ram_corrections(db))
            }
            _ => Ok(()),
        }
    }

    fn add_intrinsics(&self, names: &[&str]) -> ChainResult<()> {
        self.with_db(|db| {
            let mut protocol_state: ProtocolStateObject = db
                .get_object(PROTOCOL_STATE_KEY)?
                .ok_or_else(|| ChainError::Misc("protocol state is not initialized".to_string()))?;
            protocol_state
                .whitelisted_intrinsics
                .extend(names.iter().map(|name| name.to_string()));
            db.put_object(PROTOCOL_STATE_KEY.to_vec(), &protocol_state)?;
            Ok(())
        })
    }
}
