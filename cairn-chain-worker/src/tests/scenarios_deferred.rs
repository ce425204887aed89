// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::tools::{contract_action, genesis_keypair, sync_chain, TestChain};
use crate::native_handlers::{encode_payload, CancelDelay, CANCELDELAY};
use assert_matches::assert_matches;
use cairn_chain_exports::{ActionContext, ChainError, ChainResult, ExecutionResult};
use cairn_models::action::{Action, PermissionLevel};
use cairn_models::constants::{ACTIVE_NAME, SYSTEM_ACCOUNT_NAME};
use cairn_models::name::Name;
use cairn_models::receipt::{ReceiptTransaction, TransactionStatus};
use cairn_models::transaction::TransactionId;
use serial_test::serial;

const ALICE: Name = Name::from_static("alice");
const PING: Name = Name::from_static("ping");

/// Push a ping of alice delayed by `delay_sec` into a block of its own
fn schedule_ping(chain: &mut TestChain, delay_sec: u32) -> TransactionId {
    chain.start_next_block();
    let trx = chain.make_transaction_with(
        vec![contract_action(ALICE, PING, vec![])],
        delay_sec,
        &genesis_keypair(),
    );
    let trace = chain.push(trx.clone());
    assert!(trace.except.is_none());
    assert_eq!(
        trace.receipt.expect("no receipt").status,
        TransactionStatus::Delayed
    );
    chain.finish_block();
    trx.id
}

#[test]
#[serial]
fn test_delayed_transaction_executes_later() {
    let mut chain = TestChain::new();
    chain.create_contract(ALICE);
    chain.executor.clear_calls();

    let trx_id = schedule_ping(&mut chain, 1);
    assert!(chain.executor.calls().is_empty());
    let scheduled = chain.control.get_scheduled_transactions().unwrap();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].trx_id, trx_id);
    assert!(scheduled[0].sender.is_empty());

    let when = chain.control.head_block_time().plus_slots(4);
    chain.control.start_block(when, 0).unwrap();
    let trace = chain
        .control
        .push_scheduled_transaction(&trx_id, None, 0, false)
        .unwrap();
    assert!(trace.except.is_none());
    assert!(trace.scheduled);
    assert_eq!(trace.receipt.unwrap().status, TransactionStatus::Executed);
    assert_eq!(chain.executor.calls(), vec![(ALICE, PING)]);
    assert!(chain.control.get_scheduled_transactions().unwrap().is_empty());

    let block = chain.finish_block();
    assert_matches!(
        block.block.transactions[0].trx,
        ReceiptTransaction::Id(id) if id == trx_id
    );

    // a validator replays the deferred execution from the receipt
    let mut validator = TestChain::new();
    sync_chain(&chain.control, &mut validator.control);
    assert_eq!(validator.control.head_block_id(), chain.control.head_block_id());
    assert_eq!(
        validator.control.calculate_integrity_hash(),
        chain.control.calculate_integrity_hash()
    );
}

#[test]
#[serial]
fn test_delayed_transaction_not_ready() {
    let mut chain = TestChain::new();
    chain.create_contract(ALICE);
    let trx_id = schedule_ping(&mut chain, 10);

    chain.start_next_block();
    assert_matches!(
        chain
            .control
            .push_scheduled_transaction(&trx_id, None, 0, false),
        Err(ChainError::Transaction(_))
    );
    assert_eq!(chain.control.get_scheduled_transactions().unwrap().len(), 1);
}

#[test]
#[serial]
fn test_failed_deferred_transaction_is_hard_failed() {
    let mut chain = TestChain::new();
    let mut validator = TestChain::new();
    let refuse = |_ctx: &mut dyn ActionContext| -> ChainResult<ExecutionResult> {
        Err(ChainError::ActionFailed("ping refused".to_string()))
    };
    chain.executor.on(ALICE, PING, refuse);
    validator.executor.on(ALICE, PING, refuse);

    chain.create_contract(ALICE);
    let trx_id = schedule_ping(&mut chain, 1);

    let when = chain.control.head_block_time().plus_slots(4);
    chain.control.start_block(when, 0).unwrap();
    let trace = chain
        .control
        .push_scheduled_transaction(&trx_id, None, 0, false)
        .unwrap();
    assert_matches!(trace.except, Some(ChainError::ActionFailed(_)));
    assert_eq!(trace.receipt.unwrap().status, TransactionStatus::HardFail);
    assert!(chain.control.get_scheduled_transactions().unwrap().is_empty());
    let block = chain.finish_block();
    assert_eq!(block.block.transactions.len(), 1);
    assert_eq!(
        block.block.transactions[0].header.status,
        TransactionStatus::HardFail
    );

    sync_chain(&chain.control, &mut validator.control);
    assert_eq!(validator.control.head_block_id(), chain.control.head_block_id());
}

#[test]
#[serial]
fn test_cancel_delayed_transaction() {
    let mut chain = TestChain::new();
    chain.create_contract(ALICE);
    let trx_id = schedule_ping(&mut chain, 10);

    chain.start_next_block();
    let cancel = Action::new(
        SYSTEM_ACCOUNT_NAME,
        CANCELDELAY,
        vec![PermissionLevel::new(ALICE, ACTIVE_NAME)],
        encode_payload(&CancelDelay {
            canceling_auth: PermissionLevel::new(ALICE, ACTIVE_NAME),
            trx_id,
        })
        .unwrap(),
    );
    chain.push_ok(vec![cancel]);
    assert!(chain.control.get_scheduled_transactions().unwrap().is_empty());
    chain.finish_block();
    assert!(chain
        .control
        .find_generated_transaction(&trx_id)
        .unwrap()
        .is_none());
}
