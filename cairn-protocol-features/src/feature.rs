// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::ProtocolFeatureError;
use cairn_hash::Hash;
use cairn_models::timestamp::BlockTimestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Features implemented by this node
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BuiltinProtocolFeature {
    PreactivateFeature,
    OnlyLinkToExistingPermission,
    ReplaceDeferred,
    NoDuplicateDeferredId,
    DisallowEmptyProducerSchedule,
    GetSender,
}

impl BuiltinProtocolFeature {
    /// Every builtin, dependencies first
    pub const ALL: [BuiltinProtocolFeature; 6] = [
        BuiltinProtocolFeature::PreactivateFeature,
        BuiltinProtocolFeature::OnlyLinkToExistingPermission,
        BuiltinProtocolFeature::ReplaceDeferred,
        BuiltinProtocolFeature::NoDuplicateDeferredId,
        BuiltinProtocolFeature::DisallowEmptyProducerSchedule,
        BuiltinProtocolFeature::GetSender,
    ];

    /// Stable name
    pub fn codename(&self) -> &'static str {
        match self {
            BuiltinProtocolFeature::PreactivateFeature => "PREACTIVATE_FEATURE",
            BuiltinProtocolFeature::OnlyLinkToExistingPermission => {
                "ONLY_LINK_TO_EXISTING_PERMISSION"
            }
            BuiltinProtocolFeature::ReplaceDeferred => "REPLACE_DEFERRED",
            BuiltinProtocolFeature::NoDuplicateDeferredId => "NO_DUPLICATE_DEFERRED_ID",
            BuiltinProtocolFeature::DisallowEmptyProducerSchedule => {
                "DISALLOW_EMPTY_PRODUCER_SCHEDULE"
            }
            BuiltinProtocolFeature::GetSender => "GET_SENDER",
        }
    }

    /// Human readable description, hashed into the feature digest
    pub fn description(&self) -> &'static str {
        match self {
            BuiltinProtocolFeature::PreactivateFeature => {
                "Allows privileged contracts to pre-activate protocol features for the next block."
            }
            BuiltinProtocolFeature::OnlyLinkToExistingPermission => {
                "Disallows linking an action to a non-existing permission."
            }
            BuiltinProtocolFeature::ReplaceDeferred => {
                "Fixes the accounting of RAM when a deferred transaction is replaced."
            }
            BuiltinProtocolFeature::NoDuplicateDeferredId => {
                "Makes generated transaction ids unique by adding extensions to them."
            }
            BuiltinProtocolFeature::DisallowEmptyProducerSchedule => {
                "Rejects proposals of an empty producer schedule."
            }
            BuiltinProtocolFeature::GetSender => {
                "Exposes the account that sent the current inline action."
            }
        }
    }

    /// Builtins that must be active before this one
    pub fn dependencies(&self) -> &'static [BuiltinProtocolFeature] {
        match self {
            BuiltinProtocolFeature::NoDuplicateDeferredId => {
                &[BuiltinProtocolFeature::ReplaceDeferred]
            }
            _ => &[],
        }
    }

    /// Look a builtin up by codename
    pub fn from_codename(codename: &str) -> Option<Self> {
        BuiltinProtocolFeature::ALL
            .iter()
            .copied()
            .find(|b| b.codename() == codename)
    }
}

impl std::fmt::Display for BuiltinProtocolFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.codename())
    }
}

/// Local policy for activating a feature
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectiveRestrictions {
    /// blocks before this time may not activate the feature
    pub earliest_allowed_activation_time: BlockTimestamp,
    /// the feature must be pre-activated before a block may activate it
    pub preactivation_required: bool,
    /// the node accepts activating the feature at all
    pub enabled: bool,
}

impl Default for SubjectiveRestrictions {
    fn default() -> Self {
        SubjectiveRestrictions {
            earliest_allowed_activation_time: BlockTimestamp::default(),
            preactivation_required: true,
            enabled: true,
        }
    }
}

/// A recognized protocol feature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolFeature {
    /// identifier
    pub feature_digest: Hash,
    /// digest of the description
    pub description_digest: Hash,
    /// features that must be active first
    pub dependencies: BTreeSet<Hash>,
    /// local activation policy
    pub subjective_restrictions: SubjectiveRestrictions,
    /// builtin implemented by this feature, if any
    pub builtin_feature: Option<BuiltinProtocolFeature>,
}

/// Whether and when a digest may be activated
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecognizedStatus {
    /// unknown digest
    Unrecognized,
    /// known but disabled locally
    Disabled,
    /// known but its earliest activation time is after the block time
    TooEarly,
    /// may be activated
    Ready,
}

/// Features recognized by this node
#[derive(Clone, Debug, Default)]
pub struct ProtocolFeatureSet {
    recognized: BTreeMap<Hash, ProtocolFeature>,
    builtins: BTreeMap<BuiltinProtocolFeature, Hash>,
}

impl ProtocolFeatureSet {
    /// Empty set
    pub fn new() -> Self {
        ProtocolFeatureSet::default()
    }

    /// Set holding every builtin. Only `PREACTIVATE_FEATURE` may be activated without
    /// pre-activation, so that the chain can bootstrap the pre-activation mechanism.
    pub fn with_default_builtins() -> Result<Self, ProtocolFeatureError> {
        let mut set = ProtocolFeatureSet::new();
        for builtin in BuiltinProtocolFeature::ALL {
            let restrictions = SubjectiveRestrictions {
                preactivation_required: builtin != BuiltinProtocolFeature::PreactivateFeature,
                ..Default::default()
            };
            let feature = set.make_builtin_feature(builtin, restrictions)?;
            set.add_feature(feature)?;
        }
        Ok(set)
    }

    /// Build the feature for a builtin. Its dependencies must already be in the set.
    pub fn make_builtin_feature(
        &self,
        builtin: BuiltinProtocolFeature,
        subjective_restrictions: SubjectiveRestrictions,
    ) -> Result<ProtocolFeature, ProtocolFeatureError> {
        let mut dependencies = BTreeSet::new();
        for dependency in builtin.dependencies() {
            let digest = self
                .get_builtin_digest(*dependency)
                .ok_or_else(|| ProtocolFeatureError::MissingBuiltin(dependency.to_string()))?;
            dependencies.insert(digest);
        }
        let description_digest = Hash::compute_from(builtin.description().as_bytes());
        let mut parts: Vec<&[u8]> = vec![builtin.codename().as_bytes(), description_digest.to_bytes()];
        for dependency in &dependencies {
            parts.push(dependency.to_bytes());
        }
        Ok(ProtocolFeature {
            feature_digest: Hash::compute_from_tuple(&parts),
            description_digest,
            dependencies,
            subjective_restrictions,
            builtin_feature: Some(builtin),
        })
    }

    /// Add a feature whose dependencies are all recognized
    pub fn add_feature(&mut self, feature: ProtocolFeature) -> Result<(), ProtocolFeatureError> {
        if self.recognized.contains_key(&feature.feature_digest) {
            return Err(ProtocolFeatureError::DuplicateFeature(feature.feature_digest));
        }
        if let Some(builtin) = feature.builtin_feature {
            if self.builtins.contains_key(&builtin) {
                return Err(ProtocolFeatureError::DuplicateBuiltin(builtin.to_string()));
            }
        }
        for dependency in &feature.dependencies {
            if !self.recognized.contains_key(dependency) {
                return Err(ProtocolFeatureError::MissingDependency(
                    feature.feature_digest,
                    *dependency,
                ));
            }
        }
        if let Some(builtin) = feature.builtin_feature {
            self.builtins.insert(builtin, feature.feature_digest);
        }
        self.recognized.insert(feature.feature_digest, feature);
        Ok(())
    }

    /// Recognition status of a digest for a block at `now`
    pub fn is_recognized(&self, digest: &Hash, now: BlockTimestamp) -> RecognizedStatus {
        match self.recognized.get(digest) {
            None => RecognizedStatus::Unrecognized,
            Some(feature) if !feature.subjective_restrictions.enabled => {
                RecognizedStatus::Disabled
            }
            Some(feature)
                if feature.subjective_restrictions.earliest_allowed_activation_time > now =>
            {
                RecognizedStatus::TooEarly
            }
            Some(_) => RecognizedStatus::Ready,
        }
    }

    /// Digest of a builtin, if recognized
    pub fn get_builtin_digest(&self, builtin: BuiltinProtocolFeature) -> Option<Hash> {
        self.builtins.get(&builtin).copied()
    }

    /// Feature by digest
    pub fn get_protocol_feature(&self, digest: &Hash) -> Option<&ProtocolFeature> {
        self.recognized.get(digest)
    }

    /// Whether every dependency of `digest` satisfies `validator`
    pub fn validate_dependencies<F>(&self, digest: &Hash, mut validator: F) -> bool
    where
        F: FnMut(&Hash) -> bool,
    {
        match self.recognized.get(digest) {
            Some(feature) => feature.dependencies.iter().all(|dep| validator(dep)),
            None => false,
        }
    }

    /// Recognized features in digest order
    pub fn iter(&self) -> impl Iterator<Item = &ProtocolFeature> {
        self.recognized.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn builtin_digests_are_deterministic() {
        let a = ProtocolFeatureSet::with_default_builtins().unwrap();
        let b = ProtocolFeatureSet::with_default_builtins().unwrap();
        for builtin in BuiltinProtocolFeature::ALL {
            assert_eq!(a.get_builtin_digest(builtin), b.get_builtin_digest(builtin));
        }
        let no_dup = a
            .get_builtin_digest(BuiltinProtocolFeature::NoDuplicateDeferredId)
            .unwrap();
        let replace = a
            .get_builtin_digest(BuiltinProtocolFeature::ReplaceDeferred)
            .unwrap();
        assert!(a
            .get_protocol_feature(&no_dup)
            .unwrap()
            .dependencies
            .contains(&replace));
        assert!(!a.validate_dependencies(&no_dup, |_| false));
        assert!(a.validate_dependencies(&no_dup, |d| *d == replace));
    }

    #[test]
    fn recognition_follows_restrictions() {
        let mut set = ProtocolFeatureSet::new();
        let restrictions = SubjectiveRestrictions {
            earliest_allowed_activation_time: BlockTimestamp::new(10),
            ..Default::default()
        };
        let feature = set
            .make_builtin_feature(BuiltinProtocolFeature::GetSender, restrictions)
            .unwrap();
        let digest = feature.feature_digest;
        set.add_feature(feature.clone()).unwrap();
        assert_matches!(
            set.add_feature(feature),
            Err(ProtocolFeatureError::DuplicateFeature(_))
        );
        assert_eq!(
            set.is_recognized(&digest, BlockTimestamp::new(9)),
            RecognizedStatus::TooEarly
        );
        assert_eq!(
            set.is_recognized(&digest, BlockTimestamp::new(10)),
            RecognizedStatus::Ready
        );
        assert_eq!(
            set.is_recognized(&Hash::compute_from(b"nope"), BlockTimestamp::new(10)),
            RecognizedStatus::Unrecognized
        );
    }

    #[test]
    fn builtin_needs_its_dependencies_first() {
        let set = ProtocolFeatureSet::new();
        assert_matches!(
            set.make_builtin_feature(
                BuiltinProtocolFeature::NoDuplicateDeferredId,
                SubjectiveRestrictions::default()
            ),
            Err(ProtocolFeatureError::MissingBuiltin(_))
        );
    }
}
