// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::tools::{receive_block, TestChain};
use assert_matches::assert_matches;
use cairn_block_store::BLOCK_LOG_FILE_NAME;
use cairn_chain_exports::ChainError;
use cairn_models::block::SignedBlock;
use cairn_models::constants::SYSTEM_ACCOUNT_NAME;
use cairn_models::timestamp::BlockTimestamp;
use serial_test::serial;
use std::sync::Arc;

#[test]
#[serial]
fn test_genesis_head() {
    let chain = TestChain::new();
    assert_eq!(chain.control.head_block_num(), 1);
    assert_eq!(chain.control.last_irreversible_block_num(), 1);
    assert_eq!(chain.control.fork_db_head_block_num(), 1);
    let system = chain.control.get_account(SYSTEM_ACCOUNT_NAME).unwrap();
    assert_eq!(system.name, SYSTEM_ACCOUNT_NAME);
    assert!(
        chain
            .control
            .get_account_metadata(SYSTEM_ACCOUNT_NAME)
            .unwrap()
            .privileged
    );
}

#[test]
#[serial]
fn test_produced_blocks_become_irreversible() {
    let mut chain = TestChain::new();
    let blocks = chain.produce_blocks(3);

    assert_eq!(chain.control.head_block_num(), 4);
    assert_eq!(chain.control.head_block_id(), blocks[2].id());
    // a single producer makes every block but the head irreversible
    assert_eq!(chain.control.last_irreversible_block_num(), 3);
    assert_eq!(
        chain.control.last_irreversible_block_id().unwrap(),
        blocks[1].id()
    );

    // irreversible blocks come from the block log, the head from the fork database
    let from_log = chain.control.fetch_block_by_number(3).unwrap().unwrap();
    assert_eq!(from_log.calculate_id().unwrap(), blocks[1].id());
    let head = chain.control.fetch_block_by_number(4).unwrap().unwrap();
    assert_eq!(head.calculate_id().unwrap(), blocks[2].id());
    assert!(chain.control.fetch_block_by_number(5).unwrap().is_none());
    assert_eq!(chain.control.get_block_id_for_num(2).unwrap(), blocks[0].id());
}

#[test]
#[serial]
fn test_validating_node_follows_producer() {
    let mut producer = TestChain::new();
    let mut validator = TestChain::new();
    let blocks = producer.produce_blocks(3);

    for bsp in &blocks {
        receive_block(&mut validator.control, bsp.block.clone()).unwrap();
    }
    assert_eq!(validator.control.head_block_id(), producer.control.head_block_id());
    assert_eq!(validator.control.last_irreversible_block_num(), 3);
    assert_eq!(
        validator.control.calculate_integrity_hash(),
        producer.control.calculate_integrity_hash()
    );
}

#[test]
#[serial]
fn test_unlinkable_and_known_blocks() {
    let mut producer = TestChain::new();
    let mut validator = TestChain::new();
    let blocks = producer.produce_blocks(2);

    assert_matches!(
        validator
            .control
            .create_block_state_future(blocks[1].block.clone()),
        Err(ChainError::UnlinkableBlock(_))
    );
    receive_block(&mut validator.control, blocks[0].block.clone()).unwrap();
    receive_block(&mut validator.control, blocks[1].block.clone()).unwrap();
    assert_matches!(
        validator
            .control
            .create_block_state_future(blocks[1].block.clone()),
        Err(ChainError::BlockAlreadyKnown(_))
    );
}

#[test]
#[serial]
fn test_push_block_with_pending_block_fails() {
    let mut producer = TestChain::new();
    let mut validator = TestChain::new();
    let block = producer.produce_block().block.clone();

    validator.start_next_block();
    assert_matches!(
        receive_block(&mut validator.control, block.clone()),
        Err(ChainError::PendingBlock(_))
    );
    validator.control.abort_block();
    receive_block(&mut validator.control, block).unwrap();
    assert_eq!(validator.control.head_block_num(), 2);
}

#[test]
#[serial]
fn test_tampered_block_is_rejected() {
    let mut producer = TestChain::new();
    let mut validator = TestChain::new();
    let block = producer.produce_block().block.clone();

    let mut tampered: SignedBlock = (*block).clone();
    tampered.header.timestamp = tampered.header.timestamp.next();
    let result = receive_block(&mut validator.control, Arc::new(tampered));
    assert!(result.is_err());
    assert_eq!(validator.control.head_block_num(), 1);
    assert_eq!(validator.control.fork_db_pending_head_block_num(), 1);

    receive_block(&mut validator.control, block).unwrap();
    assert_eq!(validator.control.head_block_num(), 2);
}

#[test]
#[serial]
fn test_sign_block_with_wrong_key() {
    let mut chain = TestChain::new();
    chain.start_next_block();
    assert_matches!(
        chain.control.sign_block(&cairn_signature::KeyPair::generate()),
        Err(ChainError::PendingBlock(_))
    );
    chain.control.finalize_block().unwrap();
    assert_matches!(
        chain.control.sign_block(&cairn_signature::KeyPair::generate()),
        Err(ChainError::InvalidSignature(_))
    );
    let key = chain.signing_key();
    chain.control.sign_block(&key).unwrap();
    chain.control.commit_block().unwrap();
    assert_eq!(chain.control.head_block_num(), 2);
}

#[test]
#[serial]
fn test_start_block_at_head_time_is_refused() {
    let mut chain = TestChain::new();
    chain.produce_block();
    let head_time = chain.control.head_block_time();
    assert_matches!(
        chain.control.start_block(head_time, 0),
        Err(ChainError::BlockValidation(_))
    );
    assert!(!chain.control.is_building_block());

    // the default timestamp picks the next slot
    chain
        .control
        .start_block(BlockTimestamp::default(), 0)
        .unwrap();
    assert_eq!(chain.control.pending_block_time().unwrap(), head_time.next());
    chain.finish_block();
    assert_eq!(chain.control.head_block_num(), 3);
}

#[test]
#[serial]
fn test_irreversible_state_is_committed_before_logging() {
    let mut chain = TestChain::new();
    chain.produce_blocks(2);
    assert_eq!(chain.control.last_irreversible_block_num(), 2);

    // block 4 makes block 3 irreversible, but the log cannot take it
    chain.start_next_block();
    chain.control.finalize_block().unwrap();
    let key = chain.signing_key();
    chain.control.sign_block(&key).unwrap();
    std::fs::remove_file(chain.control.config.blocks_dir.join(BLOCK_LOG_FILE_NAME)).unwrap();
    assert!(chain.control.commit_block().is_err());

    // block 3 was committed to the state store before the append failed
    assert_eq!(chain.control.store.read().undo_depth(), 0);
    assert_eq!(chain.control.store.read().revision(), 3);
    assert_eq!(chain.control.last_irreversible_block_num(), 2);
    assert!(!chain.control.is_building_block());
}
