// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::tools::{genesis_keypair, receive_block, TestChain};
use assert_matches::assert_matches;
use cairn_chain_exports::ChainError;
use cairn_models::constants::SYSTEM_ACCOUNT_NAME;
use cairn_models::producer::ProducerKey;
use cairn_signature::KeyPair;
use serial_test::serial;

#[test]
#[serial]
fn test_genesis_schedule() {
    let chain = TestChain::new();
    let active = chain.control.active_producers();
    assert_eq!(active.version, 0);
    assert_eq!(
        active.producers,
        vec![ProducerKey {
            producer_name: SYSTEM_ACCOUNT_NAME,
            block_signing_key: genesis_keypair().get_public_key(),
        }]
    );
    assert!(chain.control.pending_producers().producers.is_empty());
    assert!(chain.control.proposed_producers().unwrap().is_none());
}

#[test]
#[serial]
fn test_signing_key_rotation() {
    let mut chain = TestChain::new();
    let mut validator = TestChain::new();
    let new_key = KeyPair::from_seed(&[9u8; cairn_signature::SECRET_KEY_SIZE_BYTES]);
    chain.keys.push(new_key.clone());
    let schedule = vec![ProducerKey {
        producer_name: SYSTEM_ACCOUNT_NAME,
        block_signing_key: new_key.get_public_key(),
    }];

    // proposed in block 2
    chain.start_next_block();
    assert_eq!(chain.control.set_proposed_producers(schedule.clone()).unwrap(), 1);
    assert_eq!(chain.control.set_proposed_producers(schedule.clone()).unwrap(), -1);
    chain.finish_block();
    let proposed = chain.control.proposed_producers().unwrap().unwrap();
    assert_eq!(proposed.version, 1);
    assert_eq!(proposed.producers, schedule);

    // pending from block 3, once block 2 is irreversible
    chain.produce_block();
    assert!(chain.control.proposed_producers().unwrap().is_none());
    assert_eq!(chain.control.pending_producers().version, 1);
    assert_eq!(chain.control.active_producers().version, 0);
    assert!(chain.control.head_block_state().block.header.new_producers.is_some());

    // active from block 4, once block 3 is irreversible
    chain.produce_block();
    assert_eq!(chain.control.active_producers().version, 1);

    // the old key can no longer sign
    chain.start_next_block();
    assert_eq!(
        chain.control.pending_block_signing_key().unwrap(),
        new_key.get_public_key()
    );
    chain.control.finalize_block().unwrap();
    assert_matches!(
        chain.control.sign_block(&genesis_keypair()),
        Err(ChainError::InvalidSignature(_))
    );
    chain.control.sign_block(&new_key).unwrap();
    chain.control.commit_block().unwrap();
    assert_eq!(chain.control.head_block_num(), 5);

    for num in 2..=5 {
        let block = chain.control.fetch_block_by_number(num).unwrap().unwrap();
        receive_block(&mut validator.control, block).unwrap();
    }
    assert_eq!(validator.control.head_block_id(), chain.control.head_block_id());
    assert_eq!(validator.control.active_producers().version, 1);
}

#[test]
#[serial]
fn test_unchanged_schedule_is_ignored() {
    let mut chain = TestChain::new();
    chain.start_next_block();
    let current = chain.control.active_producers().producers;
    assert_eq!(chain.control.set_proposed_producers(current).unwrap(), -1);
    assert!(chain.control.proposed_producers().unwrap().is_none());
}
