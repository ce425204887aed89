// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::tools::{contract_action, genesis_keypair, newaccount_action, TestChain};
use assert_matches::assert_matches;
use cairn_chain_exports::test_exports::DEFAULT_SCRIPTED_CPU_US;
use cairn_chain_exports::{ChainError, ExecutionResult};
use cairn_models::name::Name;
use cairn_models::receipt::TransactionStatus;
use cairn_models::timestamp::TimePointSec;
use cairn_models::transaction::{SignedTransaction, TransactionMetadata};
use cairn_signature::KeyPair;
use serial_test::serial;
use std::sync::Arc;

const ALICE: Name = Name::from_static("alice");
const PING: Name = Name::from_static("ping");

fn chain_with_contract() -> TestChain {
    let mut chain = TestChain::new();
    chain.create_contract(ALICE);
    chain
}

#[test]
#[serial]
fn test_contract_action_runs_executor() {
    let mut chain = chain_with_contract();
    chain.executor.clear_calls();
    chain.executor.on(ALICE, PING, |ctx| {
        ctx.require_authorization(ALICE)?;
        ctx.set_row(ALICE, Name::from_static("pings"), 1, vec![42])?;
        ctx.console_append("pong");
        Ok(ExecutionResult::success(120))
    });

    chain.start_next_block();
    let trace = chain.push_ok(vec![contract_action(ALICE, PING, vec![])]);
    assert_eq!(chain.executor.calls(), vec![(ALICE, PING)]);
    let receipt = trace.receipt.expect("no receipt");
    assert_eq!(receipt.status, TransactionStatus::Executed);
    assert!(receipt.cpu_usage_us >= 120);
    assert_eq!(trace.action_traces.len(), 1);
    assert_eq!(trace.action_traces[0].receiver, ALICE);
    assert!(trace.action_traces[0].receipt.is_some());
    assert_eq!(chain.control.get_pending_trx_receipts().len(), 1);

    let block = chain.finish_block();
    assert_eq!(block.block.transactions.len(), 1);
    assert_eq!(block.trxs().len(), 1);
}

#[test]
#[serial]
fn test_failed_transaction_leaves_no_trace() {
    let mut chain = chain_with_contract();
    chain.executor.on(ALICE, PING, |ctx| {
        ctx.set_row(ALICE, Name::from_static("pings"), 1, vec![1])?;
        Err(ChainError::ActionFailed("assertion failure".to_string()))
    });

    chain.start_next_block();
    let hash_before = chain.control.calculate_integrity_hash();
    let trx = chain.make_transaction(vec![contract_action(ALICE, PING, vec![])]);
    let trace = chain.push(trx.clone());
    assert_matches!(trace.except, Some(ChainError::ActionFailed(_)));
    assert!(trace.receipt.is_none());
    assert!(trace.error_code.is_some());
    assert!(chain.control.get_pending_trx_receipts().is_empty());
    assert_eq!(chain.control.calculate_integrity_hash(), hash_before);
    assert!(!chain.control.is_known_unexpired_transaction(&trx.id).unwrap());

    let block = chain.finish_block();
    assert!(block.block.transactions.is_empty());
}

#[test]
#[serial]
fn test_soft_fail_status_fails_transaction() {
    let mut chain = chain_with_contract();
    chain.executor.on(ALICE, PING, |_ctx| {
        Ok(ExecutionResult {
            status: cairn_chain_exports::ExecutionStatus::SoftFail("rejected".to_string()),
            cpu_usage_us: DEFAULT_SCRIPTED_CPU_US,
        })
    });
    chain.start_next_block();
    let trx = chain.make_transaction(vec![contract_action(ALICE, PING, vec![])]);
    let trace = chain.push(trx);
    assert_matches!(trace.except, Some(ChainError::ActionFailed(_)));
}

#[test]
#[serial]
fn test_executor_fatal_error_aborts_push() {
    let mut chain = chain_with_contract();
    chain.executor.on(ALICE, PING, |_ctx| {
        Ok(ExecutionResult {
            status: cairn_chain_exports::ExecutionStatus::HardFail("vm crashed".to_string()),
            cpu_usage_us: 0,
        })
    });
    chain.start_next_block();
    let trx = chain.make_transaction(vec![contract_action(ALICE, PING, vec![])]);
    let result = chain.control.push_transaction(trx, None, 0, false);
    assert_matches!(result, Err(ChainError::ExecutorFatal(_)));
}

#[test]
#[serial]
fn test_duplicate_transaction() {
    let mut chain = TestChain::new();
    chain.start_next_block();
    let trx = chain.make_transaction(vec![newaccount_action(Name::from_static("bob"))]);
    assert!(chain.push(trx.clone()).except.is_none());
    assert!(chain.control.is_known_unexpired_transaction(&trx.id).unwrap());

    let trace = chain.push(trx.clone());
    assert_matches!(trace.except, Some(ChainError::DuplicateTransaction(_)));
    chain.finish_block();

    // still known in later blocks
    chain.start_next_block();
    let trace = chain.push(trx);
    assert_matches!(trace.except, Some(ChainError::DuplicateTransaction(_)));
}

#[test]
#[serial]
fn test_expired_transaction() {
    let mut chain = TestChain::new();
    chain.produce_blocks(4);
    chain.start_next_block();
    let head_secs = chain.control.head_block_time().to_time_point_sec().secs();

    let fresh = chain.make_transaction(vec![newaccount_action(Name::from_static("bob"))]);
    let mut trx = fresh.trx().clone();
    trx.expiration = TimePointSec(head_secs - 1);
    let mut signed = SignedTransaction::new(trx);
    signed
        .sign(&genesis_keypair(), &chain.control.get_chain_id())
        .unwrap();
    let expired = Arc::new(TransactionMetadata::new(signed).unwrap());
    let trace = chain.push(expired);
    assert_matches!(trace.except, Some(ChainError::ExpiredTransaction(_)));

    let mut trx = fresh.trx().clone();
    trx.expiration = TimePointSec(head_secs + 10 * 3600);
    let mut signed = SignedTransaction::new(trx);
    signed
        .sign(&genesis_keypair(), &chain.control.get_chain_id())
        .unwrap();
    let too_late = Arc::new(TransactionMetadata::new(signed).unwrap());
    let trace = chain.push(too_late);
    assert_matches!(trace.except, Some(ChainError::Transaction(_)));
}

#[test]
#[serial]
fn test_reference_block_from_other_fork() {
    let mut chain = TestChain::new();
    chain.produce_blocks(2);
    chain.start_next_block();
    let fresh = chain.make_transaction(vec![newaccount_action(Name::from_static("bob"))]);
    let mut trx = fresh.trx().clone();
    trx.ref_block_prefix = trx.ref_block_prefix.wrapping_add(1);
    let mut signed = SignedTransaction::new(trx);
    signed
        .sign(&genesis_keypair(), &chain.control.get_chain_id())
        .unwrap();
    let trace = chain.push(Arc::new(TransactionMetadata::new(signed).unwrap()));
    assert_matches!(trace.except, Some(ChainError::InvalidRefBlock(_)));
}

#[test]
#[serial]
fn test_missing_signature() {
    let mut chain = TestChain::new();
    chain.start_next_block();
    let trx = chain.make_transaction_with(
        vec![newaccount_action(Name::from_static("bob"))],
        0,
        &KeyPair::generate(),
    );
    let trace = chain.push(trx);
    assert_matches!(trace.except, Some(ChainError::Authorization(_)));
    assert!(chain.control.get_account(Name::from_static("bob")).is_err());
}

#[test]
#[serial]
fn test_push_transaction_requires_pending_block() {
    let mut chain = TestChain::new();
    let trx = chain.make_transaction(vec![newaccount_action(Name::from_static("bob"))]);
    assert!(chain.control.push_transaction(trx, None, 0, false).is_err());
}

#[test]
#[serial]
fn test_aborted_block_keeps_transactions() {
    let mut chain = TestChain::new();
    chain.start_next_block();
    let trx = chain.make_transaction(vec![newaccount_action(Name::from_static("bob"))]);
    chain.push(trx.clone());
    chain.control.abort_block();

    assert!(!chain.control.is_building_block());
    assert!(chain.control.get_account(Name::from_static("bob")).is_err());
    assert!(chain
        .control
        .get_unapplied_transactions()
        .contains(&trx.signed_id));

    // the retry succeeds in the next block and leaves the queue
    chain.start_next_block();
    assert!(chain.push(trx.clone()).except.is_none());
    assert!(!chain
        .control
        .get_unapplied_transactions()
        .contains(&trx.signed_id));
    chain.finish_block();
    assert!(chain.control.get_account(Name::from_static("bob")).is_ok());
}
