// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::tools::{receive_block, TestChain};
use assert_matches::assert_matches;
use cairn_chain_exports::ChainError;
use cairn_hash::Hash;
use cairn_protocol_features::{BuiltinProtocolFeature, ProtocolFeatureSet};
use serial_test::serial;

fn builtin_digest(feature: BuiltinProtocolFeature) -> Hash {
    ProtocolFeatureSet::with_default_builtins()
        .unwrap()
        .get_builtin_digest(feature)
        .unwrap()
}

/// Activate PREACTIVATE_FEATURE in the next block, the only builtin not needing pre-activation
fn activate_preactivate_feature(chain: &mut TestChain) {
    let digest = builtin_digest(BuiltinProtocolFeature::PreactivateFeature);
    let when = chain.control.head_block_time().next();
    chain
        .control
        .start_block_with_features(when, 0, vec![digest])
        .unwrap();
    chain.finish_block();
}

#[test]
#[serial]
fn test_activate_feature_without_preactivation() {
    let mut chain = TestChain::new();
    let digest = builtin_digest(BuiltinProtocolFeature::PreactivateFeature);
    assert!(!chain.control.is_protocol_feature_activated(&digest).unwrap());
    assert!(!chain
        .control
        .is_builtin_activated(BuiltinProtocolFeature::PreactivateFeature));

    activate_preactivate_feature(&mut chain);
    let head = chain.control.head_block_state();
    assert_eq!(head.block.header.new_protocol_feature_activations, vec![digest]);
    assert!(chain.control.is_protocol_feature_activated(&digest).unwrap());
    assert!(chain
        .control
        .is_builtin_activated(BuiltinProtocolFeature::PreactivateFeature));
}

#[test]
#[serial]
fn test_feature_requiring_preactivation_is_refused() {
    let mut chain = TestChain::new();
    activate_preactivate_feature(&mut chain);
    let head_id = chain.control.head_block_id();

    let digest = builtin_digest(BuiltinProtocolFeature::ReplaceDeferred);
    let when = chain.control.head_block_time().next();
    assert!(chain
        .control
        .start_block_with_features(when, 0, vec![digest])
        .is_err());
    assert!(!chain.control.is_building_block());
    assert_eq!(chain.control.head_block_id(), head_id);
}

#[test]
#[serial]
fn test_preactivated_feature_activates_in_next_block() {
    let mut chain = TestChain::new();
    activate_preactivate_feature(&mut chain);
    let digest = builtin_digest(BuiltinProtocolFeature::ReplaceDeferred);

    chain.start_next_block();
    chain.control.preactivate_feature(digest).unwrap();
    assert_eq!(
        chain.control.get_preactivated_protocol_features().unwrap(),
        vec![digest]
    );
    assert_matches!(
        chain.control.preactivate_feature(digest),
        Err(ChainError::ProtocolFeature(_))
    );
    chain.finish_block();
    assert!(!chain
        .control
        .is_builtin_activated(BuiltinProtocolFeature::ReplaceDeferred));

    let activating = chain.produce_block();
    assert_eq!(
        activating.block.header.new_protocol_feature_activations,
        vec![digest]
    );
    assert!(chain
        .control
        .is_builtin_activated(BuiltinProtocolFeature::ReplaceDeferred));
    assert!(chain
        .control
        .get_preactivated_protocol_features()
        .unwrap()
        .is_empty());

    // already active
    chain.start_next_block();
    assert_matches!(
        chain.control.preactivate_feature(digest),
        Err(ChainError::ProtocolFeature(_))
    );
}

#[test]
#[serial]
fn test_unknown_feature_is_refused() {
    let mut chain = TestChain::new();
    chain.start_next_block();
    assert_matches!(
        chain
            .control
            .preactivate_feature(Hash::compute_from(b"no such feature")),
        Err(ChainError::ProtocolFeature(_))
    );
}

#[test]
#[serial]
fn test_popping_activation_block_deactivates_feature() {
    let mut chain = TestChain::new();
    chain.produce_block();
    activate_preactivate_feature(&mut chain);
    assert!(chain
        .control
        .is_builtin_activated(BuiltinProtocolFeature::PreactivateFeature));
    chain.control.pop_block().unwrap();
    assert!(!chain
        .control
        .is_builtin_activated(BuiltinProtocolFeature::PreactivateFeature));
}

#[test]
#[serial]
fn test_validator_applies_feature_activation() {
    let mut producer = TestChain::new();
    let mut validator = TestChain::new();
    activate_preactivate_feature(&mut producer);
    let block = producer.control.head_block_state().block.clone();

    receive_block(&mut validator.control, block).unwrap();
    assert!(validator
        .control
        .is_builtin_activated(BuiltinProtocolFeature::PreactivateFeature));
}
