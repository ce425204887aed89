// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::tools::{new_controller, TestChain};
use cairn_chain_exports::DbReadMode;
use cairn_models::name::Name;
use serial_test::serial;
use std::sync::atomic::Ordering;

#[test]
#[serial]
fn test_clean_restart_keeps_state() {
    let mut chain = TestChain::new();
    let alice = Name::from_static("alice");
    chain.create_account(alice);
    chain.produce_blocks(2);
    let head_id = chain.control.head_block_id();
    let hash = chain.control.calculate_integrity_hash();

    let mut chain = chain.close_and_reopen();
    assert_eq!(chain.control.head_block_id(), head_id);
    assert_eq!(chain.control.last_irreversible_block_num(), 3);
    assert_eq!(chain.control.calculate_integrity_hash(), hash);
    assert!(chain.control.get_account(alice).is_ok());

    chain.produce_block();
    assert_eq!(chain.control.head_block_num(), 5);
}

#[test]
#[serial]
fn test_unclean_restart_replays_block_log_and_reversible_blocks() {
    let mut chain = TestChain::new();
    let alice = Name::from_static("alice");
    chain.create_account(alice);
    chain.produce_blocks(2);
    let head_id = chain.control.head_block_id();
    let lib_id = chain.control.last_irreversible_block_id().unwrap();

    // dropped without close: the state is rebuilt from genesis
    let mut chain = chain.reopen();
    assert_eq!(chain.control.head_block_id(), head_id);
    assert_eq!(chain.control.last_irreversible_block_id().unwrap(), lib_id);
    assert!(chain.control.get_account(alice).is_ok());
    assert!(!chain.control.is_replaying());

    let next = chain.produce_block();
    assert_eq!(next.previous(), head_id);
}

#[test]
#[serial]
fn test_replayed_state_matches_live_state() {
    let mut chain = TestChain::new();
    chain.create_account(Name::from_static("bob"));
    chain.produce_blocks(3);
    let hash = chain.control.calculate_integrity_hash();

    let chain = chain.reopen();
    assert_eq!(chain.control.calculate_integrity_hash(), hash);
}

#[test]
#[serial]
fn test_replay_stops_on_shutdown_request() {
    let mut chain = TestChain::new();
    chain.produce_blocks(4);
    let TestChain {
        control,
        executor,
        dir,
        ..
    } = chain;
    drop(control);

    let mut control = new_controller(dir.path(), DbReadMode::Speculative, executor).unwrap();
    control.shutdown_handle().store(true, Ordering::SeqCst);
    control.startup(None).unwrap();
    assert!(control.head_block_num() < 5);
}
