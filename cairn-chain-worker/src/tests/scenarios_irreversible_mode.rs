// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::tools::{newaccount_action, receive_block, TestChain};
use cairn_chain_exports::DbReadMode;
use cairn_models::name::Name;
use serial_test::serial;

#[test]
#[serial]
fn test_irreversible_mode_applies_only_irreversible_blocks() {
    let mut producer = TestChain::new();
    let mut follower = TestChain::with_read_mode(DbReadMode::Irreversible);
    assert_eq!(follower.control.get_read_mode(), DbReadMode::Irreversible);

    let bob = Name::from_static("bob");
    producer.start_next_block();
    producer.push_ok(vec![newaccount_action(bob)]);
    let first = producer.finish_block();
    let others = producer.produce_blocks(2);

    receive_block(&mut follower.control, first.block.clone()).unwrap();
    // block 2 is not irreversible yet
    assert_eq!(follower.control.head_block_num(), 1);
    assert_eq!(follower.control.fork_db_pending_head_block_num(), 2);
    assert!(follower.control.get_account(bob).is_err());

    for bsp in &others {
        receive_block(&mut follower.control, bsp.block.clone()).unwrap();
    }
    assert_eq!(follower.control.head_block_num(), 3);
    assert_eq!(follower.control.last_irreversible_block_num(), 3);
    assert_eq!(follower.control.fork_db_pending_head_block_id(), others[1].id());
    assert!(follower.control.get_account(bob).is_ok());
}

#[test]
#[serial]
fn test_irreversible_mode_restart() {
    let mut producer = TestChain::new();
    let mut follower = TestChain::with_read_mode(DbReadMode::Irreversible);
    let blocks = producer.produce_blocks(4);
    for bsp in &blocks {
        receive_block(&mut follower.control, bsp.block.clone()).unwrap();
    }
    assert_eq!(follower.control.head_block_num(), 4);

    let follower = follower.close_and_reopen();
    assert_eq!(follower.control.head_block_num(), 4);
    assert_eq!(follower.control.head_block_id(), blocks[2].id());
}
