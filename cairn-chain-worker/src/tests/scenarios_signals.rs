// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::tools::{newaccount_action, receive_block, TestChain};
use cairn_chain_exports::test_exports::MockChainListener;
use cairn_chain_exports::ChainError;
use cairn_models::name::Name;
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;

#[test]
#[serial]
fn test_producer_signals() {
    let mut chain = TestChain::new();
    let mut listener = MockChainListener::new();
    listener.expect_pre_accepted_block().times(0);
    listener
        .expect_accepted_block_header()
        .times(3)
        .returning(|_| Ok(()));
    listener
        .expect_accepted_block()
        .times(3)
        .returning(|_| Ok(()));
    listener
        .expect_irreversible_block()
        .times(2)
        .returning(|_| Ok(()));
    // onblock of every block, plus one input transaction
    listener
        .expect_accepted_transaction()
        .times(4)
        .returning(|_| Ok(()));
    listener
        .expect_applied_transaction()
        .times(4)
        .returning(|_| Ok(()));
    chain.control.subscribe(Arc::new(listener));

    chain.start_next_block();
    chain.push_ok(vec![newaccount_action(Name::from_static("bob"))]);
    chain.finish_block();
    chain.produce_blocks(2);
    // expectations are checked when the listener is dropped
    drop(chain);
}

#[test]
#[serial]
fn test_validator_signals_in_order() {
    let mut producer = TestChain::new();
    let mut validator = TestChain::new();
    let blocks = producer.produce_blocks(2);

    let events = Arc::new(Mutex::new(Vec::new()));
    let signals = validator.control.signals_mut();
    let log = events.clone();
    signals.pre_accepted_block.connect(move |block| {
        log.lock().push(format!("pre_accepted {}", block.block_num()));
        Ok(())
    });
    let log = events.clone();
    signals.accepted_block_header.connect(move |bsp| {
        log.lock().push(format!("header {}", bsp.block_num()));
        Ok(())
    });
    let log = events.clone();
    signals.accepted_block.connect(move |bsp| {
        log.lock().push(format!("accepted {}", bsp.block_num()));
        Ok(())
    });
    let log = events.clone();
    signals.irreversible_block.connect(move |bsp| {
        log.lock().push(format!("irreversible {}", bsp.block_num()));
        Ok(())
    });

    for bsp in &blocks {
        receive_block(&mut validator.control, bsp.block.clone()).unwrap();
    }
    assert_eq!(
        *events.lock(),
        vec![
            "pre_accepted 2",
            "header 2",
            "accepted 2",
            "pre_accepted 3",
            "header 3",
            "accepted 3",
            "irreversible 2",
        ]
    );
}

#[test]
#[serial]
fn test_failing_listener_does_not_stop_the_chain() {
    let mut chain = TestChain::new();
    chain
        .control
        .signals_mut()
        .accepted_block
        .connect(|_| Err(ChainError::Misc("listener bug".to_string())));
    chain
        .control
        .signals_mut()
        .irreversible_block
        .connect(|_| panic!("listener panic"));
    chain.produce_blocks(3);
    assert_eq!(chain.control.head_block_num(), 4);
    assert_eq!(chain.control.last_irreversible_block_num(), 3);
}
