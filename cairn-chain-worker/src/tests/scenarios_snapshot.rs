// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::tools::{init_logging, new_controller, newaccount_action, receive_block, TestChain};
use crate::{FileSnapshotReader, FileSnapshotWriter, VariantSnapshotReader, VariantSnapshotWriter};
use assert_matches::assert_matches;
use cairn_chain_exports::test_exports::ScriptedActionExecutor;
use cairn_chain_exports::{ChainError, DbReadMode, SnapshotReader};
use cairn_models::genesis::GenesisState;
use cairn_models::name::Name;
use cairn_models::timestamp::BlockTimestamp;
use cairn_protocol_features::ProtocolFeatureSet;
use serial_test::serial;
use std::sync::Arc;
use tempfile::TempDir;

fn chain_with_history() -> TestChain {
    let mut chain = TestChain::new();
    chain.start_next_block();
    chain.push_ok(vec![newaccount_action(Name::from_static("alice"))]);
    chain.finish_block();
    chain.produce_blocks(2);
    chain
}

#[test]
#[serial]
fn test_snapshot_restores_state_in_memory() {
    let mut source = chain_with_history();
    let mut writer = VariantSnapshotWriter::new();
    source.control.write_snapshot(&mut writer).unwrap();
    let snapshot = writer.into_snapshot();

    init_logging();
    let dir = TempDir::new().unwrap();
    let mut restored = new_controller(
        dir.path(),
        DbReadMode::Speculative,
        Arc::new(ScriptedActionExecutor::new()),
    )
    .unwrap();
    let mut reader = VariantSnapshotReader::new(snapshot);
    restored.startup(Some(&mut reader)).unwrap();

    assert_eq!(restored.head_block_id(), source.control.head_block_id());
    assert_eq!(restored.last_irreversible_block_num(), source.control.head_block_num());
    assert_eq!(
        restored.calculate_integrity_hash(),
        source.control.calculate_integrity_hash()
    );
    assert!(restored.get_account(Name::from_static("alice")).is_ok());

    // the restored node follows the chain from the snapshot head
    let next = source.produce_block();
    receive_block(&mut restored, next.block.clone()).unwrap();
    assert_eq!(restored.head_block_id(), next.id());
}

#[test]
#[serial]
fn test_snapshot_file_round_trip() {
    let source = chain_with_history();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("head.snapshot");
    let mut writer = FileSnapshotWriter::create(&path).unwrap();
    source.control.write_snapshot(&mut writer).unwrap();

    let mut reader = FileSnapshotReader::open(&path).unwrap();
    reader.validate().unwrap();
    let state_dir = TempDir::new().unwrap();
    let mut restored = new_controller(
        state_dir.path(),
        DbReadMode::Speculative,
        Arc::new(ScriptedActionExecutor::new()),
    )
    .unwrap();
    restored.startup(Some(&mut reader)).unwrap();
    assert_eq!(restored.head_block_id(), source.control.head_block_id());
    assert_eq!(
        restored.calculate_integrity_hash(),
        source.control.calculate_integrity_hash()
    );
}

#[test]
#[serial]
fn test_snapshot_of_other_chain_is_refused() {
    let source = chain_with_history();
    let mut writer = VariantSnapshotWriter::new();
    source.control.write_snapshot(&mut writer).unwrap();

    let dir = TempDir::new().unwrap();
    let other_genesis = GenesisState::new(
        BlockTimestamp::new(42),
        cairn_signature::KeyPair::generate().get_public_key(),
    );
    let config = cairn_chain_exports::ChainConfig::default_for_path(dir.path(), other_genesis);
    let mut restored = crate::Controller::new(
        config,
        ProtocolFeatureSet::with_default_builtins().unwrap(),
        Arc::new(ScriptedActionExecutor::new()),
    )
    .unwrap();
    let mut reader = VariantSnapshotReader::new(writer.into_snapshot());
    assert_matches!(
        restored.startup(Some(&mut reader)),
        Err(ChainError::SnapshotError(_))
    );
}

#[test]
#[serial]
fn test_snapshot_requires_no_pending_block() {
    let mut source = chain_with_history();
    source.start_next_block();
    let mut writer = VariantSnapshotWriter::new();
    assert!(source.control.write_snapshot(&mut writer).is_err());
}
