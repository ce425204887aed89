// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::tools::{contract_action, newaccount_action, receive_block, sync_chain, TestChain};
use assert_matches::assert_matches;
use cairn_chain_exports::{ChainError, UnappliedOrigin};
use cairn_models::name::Name;
use serial_test::serial;

#[test]
#[serial]
fn test_switch_to_longer_fork() {
    let mut node_a = TestChain::new();
    let mut node_b = TestChain::new();
    node_a.produce_blocks(2);
    sync_chain(&node_a.control, &mut node_b.control);
    assert_eq!(node_b.control.head_block_num(), 3);

    // node a puts a transaction in block 4
    let carol = Name::from_static("carol");
    node_a.start_next_block();
    let trx = node_a.make_transaction(vec![newaccount_action(carol)]);
    let trace = node_a.push(trx.clone());
    assert!(trace.except.is_none());
    let a4 = node_a.finish_block();
    assert!(node_a.control.get_account(carol).is_ok());

    // node b skips a slot and builds a longer branch
    let b4 = node_b.produce_block_after(1);
    let b5 = node_b.produce_block();

    receive_block(&mut node_a.control, b4.block.clone()).unwrap();
    assert_eq!(node_a.control.head_block_id(), a4.id());
    assert_eq!(node_a.control.fork_db_pending_head_block_id(), a4.id());

    receive_block(&mut node_a.control, b5.block.clone()).unwrap();
    assert_eq!(node_a.control.head_block_id(), b5.id());
    assert_eq!(node_a.control.last_irreversible_block_num(), 4);
    assert_eq!(node_a.control.last_irreversible_block_id().unwrap(), b4.id());
    assert_eq!(
        node_a
            .control
            .fetch_block_by_number(4)
            .unwrap()
            .unwrap()
            .calculate_id()
            .unwrap(),
        b4.id()
    );

    // the transaction of the abandoned block waits for a retry
    assert!(node_a.control.get_account(carol).is_err());
    let unapplied = node_a.control.get_unapplied_transactions();
    assert!(unapplied.contains(&trx.signed_id));
    assert!(unapplied
        .iter()
        .any(|(meta, origin)| meta.id == trx.id && origin == UnappliedOrigin::ForkedBlock));
    assert_eq!(
        node_a.control.calculate_integrity_hash(),
        node_b.control.calculate_integrity_hash()
    );
}

#[test]
#[serial]
fn test_failed_fork_switch_restores_previous_branch() {
    let mut node_a = TestChain::new();
    let mut node_b = TestChain::new();
    let alice = Name::from_static("alice");
    let ping = Name::from_static("ping");
    node_a.create_contract(alice);
    node_a.produce_block();
    sync_chain(&node_a.control, &mut node_b.control);

    // node a refuses what node b accepts
    node_a.executor.on(alice, ping, |_ctx| {
        Err(ChainError::ActionFailed("ping refused".to_string()))
    });

    let a_head = node_a.produce_block();
    let lib_before = node_a.control.last_irreversible_block_num();
    let hash_before = node_a.control.calculate_integrity_hash();

    let when = node_b.control.head_block_time().plus_slots(2);
    node_b.control.start_block(when, 0).unwrap();
    node_b.push_ok(vec![contract_action(alice, ping, vec![1])]);
    let b_first = node_b.finish_block();
    let b_second = node_b.produce_block();

    receive_block(&mut node_a.control, b_first.block.clone()).unwrap();
    assert_eq!(node_a.control.head_block_id(), a_head.id());

    let result = receive_block(&mut node_a.control, b_second.block.clone());
    assert_matches!(result, Err(ChainError::ActionFailed(_)));
    assert_eq!(node_a.control.head_block_id(), a_head.id());
    assert_eq!(node_a.control.last_irreversible_block_num(), lib_before);
    assert_eq!(node_a.control.calculate_integrity_hash(), hash_before);
    assert!(node_a
        .control
        .fetch_block_state_by_id(&b_first.id())
        .is_none());

    // the restored branch keeps growing
    let next = node_a.produce_block();
    assert_eq!(next.previous(), a_head.id());
    assert_eq!(node_a.control.head_block_num(), a_head.block_num() + 1);
}

#[test]
#[serial]
fn test_fork_switch_failing_mid_branch_restores_previous_branch() {
    let mut node_a = TestChain::new();
    let mut node_b = TestChain::new();
    let alice = Name::from_static("alice");
    let ping = Name::from_static("ping");
    node_a.create_contract(alice);
    node_a.produce_block();
    sync_chain(&node_a.control, &mut node_b.control);

    node_a.executor.on(alice, ping, |_ctx| {
        Err(ChainError::ActionFailed("ping refused".to_string()))
    });

    let a_head = node_a.produce_block();
    let lib_before = node_a.control.last_irreversible_block_num();
    let hash_before = node_a.control.calculate_integrity_hash();

    // b1 competes with a_head, b2 carries the transaction node a refuses
    let b1 = node_b.produce_block_after(1);
    assert_eq!(b1.block_num(), a_head.block_num());
    node_b.start_next_block();
    node_b.push_ok(vec![contract_action(alice, ping, vec![2])]);
    let b2 = node_b.finish_block();
    node_b.produce_block();

    receive_block(&mut node_a.control, b1.block.clone()).unwrap();
    assert_eq!(node_a.control.head_block_id(), a_head.id());

    // b1 is applied before b2 fails
    let result = receive_block(&mut node_a.control, b2.block.clone());
    assert_matches!(result, Err(ChainError::ActionFailed(_)));
    assert_eq!(node_a.control.head_block_id(), a_head.id());
    assert_eq!(node_a.control.last_irreversible_block_num(), lib_before);
    assert_eq!(node_a.control.calculate_integrity_hash(), hash_before);
    assert!(node_a.control.fetch_block_state_by_id(&b2.id()).is_none());
    assert!(node_a
        .control
        .fetch_block_state_by_id(&b1.id())
        .unwrap()
        .is_valid());

    let next = node_a.produce_block();
    assert_eq!(next.previous(), a_head.id());
    assert_eq!(node_a.control.head_block_num(), a_head.block_num() + 1);
}

#[test]
#[serial]
fn test_pop_block_undoes_state() {
    let mut chain = TestChain::new();
    chain.produce_blocks(2);
    let head_before = chain.control.head_block_id();
    let hash_before = chain.control.calculate_integrity_hash();

    let dave = Name::from_static("dave");
    chain.start_next_block();
    let trx = chain.make_transaction(vec![newaccount_action(dave)]);
    chain.push(trx.clone());
    chain.finish_block();
    assert!(chain.control.get_account(dave).is_ok());
    assert_ne!(chain.control.calculate_integrity_hash(), hash_before);

    chain.control.pop_block().unwrap();
    assert_eq!(chain.control.head_block_id(), head_before);
    assert_eq!(chain.control.calculate_integrity_hash(), hash_before);
    assert!(chain.control.get_account(dave).is_err());
    assert!(chain
        .control
        .get_unapplied_transactions()
        .contains(&trx.signed_id));

    // the new head is the last irreversible block
    assert_matches!(
        chain.control.pop_block(),
        Err(ChainError::BlockValidation(_))
    );
    assert_eq!(chain.control.head_block_id(), head_before);
}
