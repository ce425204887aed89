// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::{BlockState, ChainError, ChainResult, TransactionTrace};
use cairn_models::block::SignedBlock;
use cairn_models::transaction::TransactionMetadata;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Observer of the controller. Every method defaults to doing nothing.
///
/// A listener returning an error other than a resource exhaustion, or panicking, is logged and
/// ignored; the remaining listeners still run.
#[cfg_attr(any(test, feature = "test-exports"), mockall::automock)]
pub trait ChainListener: Send + Sync {
    /// A block passed its header checks and is about to enter the fork database
    fn pre_accepted_block(&self, _block: &SignedBlock) -> ChainResult<()> {
        Ok(())
    }

    /// A block state was added to the fork database
    fn accepted_block_header(&self, _block_state: &BlockState) -> ChainResult<()> {
        Ok(())
    }

    /// A block was applied and became the head
    fn accepted_block(&self, _block_state: &BlockState) -> ChainResult<()> {
        Ok(())
    }

    /// A block became irreversible
    fn irreversible_block(&self, _block_state: &BlockState) -> ChainResult<()> {
        Ok(())
    }

    /// A transaction was applied to the pending block
    fn accepted_transaction(&self, _trx: &TransactionMetadata) -> ChainResult<()> {
        Ok(())
    }

    /// A transaction was executed, successfully or not
    fn applied_transaction(&self, _trace: &TransactionTrace) -> ChainResult<()> {
        Ok(())
    }
}

type Slot<T> = Box<dyn Fn(&T) -> ChainResult<()> + Send + Sync>;

/// Ordered list of callbacks invoked on an event
pub struct Signal<T: ?Sized> {
    name: &'static str,
    slots: Vec<Slot<T>>,
}

impl<T: ?Sized> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl<T: ?Sized> Signal<T> {
    /// Signal without slots
    pub fn new(name: &'static str) -> Self {
        Signal {
            name,
            slots: Vec::new(),
        }
    }

    /// Append a callback
    pub fn connect<F>(&mut self, slot: F)
    where
        F: Fn(&T) -> ChainResult<()> + Send + Sync + 'static,
    {
        self.slots.push(Box::new(slot));
    }

    /// Number of callbacks
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no callback is connected
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Invoke every callback in connection order. Resource exhaustion errors stop the
    /// emission and are returned, other errors and panics are logged.
    pub fn emit(&self, arg: &T) -> ChainResult<()> {
        for slot in &self.slots {
            match catch_unwind(AssertUnwindSafe(|| slot(arg))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_resource_exhaustion() => {
                    return Err(match err {
                        ChainError::EmitSignal(_) => err,
                        other => ChainError::EmitSignal(format!("{}: {}", self.name, other)),
                    });
                }
                Ok(Err(err)) => {
                    warn!("{} listener failed: {}", self.name, err);
                }
                Err(_) => {
                    warn!("{} listener panicked", self.name);
                }
            }
        }
        Ok(())
    }
}

/// Every signal the controller emits
#[derive(Debug)]
pub struct ChainSignals {
    /// see `ChainListener::pre_accepted_block`
    pub pre_accepted_block: Signal<SignedBlock>,
    /// see `ChainListener::accepted_block_header`
    pub accepted_block_header: Signal<Arc<BlockState>>,
    /// see `ChainListener::accepted_block`
    pub accepted_block: Signal<Arc<BlockState>>,
    /// see `ChainListener::irreversible_block`
    pub irreversible_block: Signal<Arc<BlockState>>,
    /// see `ChainListener::accepted_transaction`
    pub accepted_transaction: Signal<Arc<TransactionMetadata>>,
    /// see `ChainListener::applied_transaction`
    pub applied_transaction: Signal<TransactionTrace>,
}

impl Default for ChainSignals {
    fn default() -> Self {
        ChainSignals {
            pre_accepted_block: Signal::new("pre_accepted_block"),
            accepted_block_header: Signal::new("accepted_block_header"),
            accepted_block: Signal::new("accepted_block"),
            irreversible_block: Signal::new("irreversible_block"),
            accepted_transaction: Signal::new("accepted_transaction"),
            applied_transaction: Signal::new("applied_transaction"),
        }
    }
}

impl ChainSignals {
    /// Connect every signal to `listener`
    pub fn subscribe(&mut self, listener: Arc<dyn ChainListener>) {
        let l = listener.clone();
        self.pre_accepted_block
            .connect(move |block| l.pre_accepted_block(block));
        let l = listener.clone();
        self.accepted_block_header
            .connect(move |bsp| l.accepted_block_header(bsp));
        let l = listener.clone();
        self.accepted_block
            .connect(move |bsp| l.accepted_block(bsp));
        let l = listener.clone();
        self.irreversible_block
            .connect(move |bsp| l.irreversible_block(bsp));
        let l = listener.clone();
        self.accepted_transaction
            .connect(move |trx| l.accepted_transaction(trx));
        self.applied_transaction
            .connect(move |trace| listener.applied_transaction(trace));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn failures_are_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut signal: Signal<u32> = Signal::new("test");
        signal.connect(|_| Err(ChainError::Misc("listener bug".to_string())));
        signal.connect(|_| panic!("listener panic"));
        let c = calls.clone();
        signal.connect(move |value| {
            c.fetch_add(*value as usize, Ordering::SeqCst);
            Ok(())
        });
        signal.emit(&3).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        signal.connect(|_| Err(ChainError::DatabaseGuard("full".to_string())));
        assert_matches!(signal.emit(&1), Err(ChainError::EmitSignal(_)));
    }

    #[test]
    fn listener_receives_block_events() {
        let mut listener = MockChainListener::new();
        listener
            .expect_pre_accepted_block()
            .times(1)
            .returning(|_| Ok(()));
        let mut signals = ChainSignals::default();
        signals.subscribe(Arc::new(listener));
        signals
            .pre_accepted_block
            .emit(&SignedBlock::default())
            .unwrap();
    }
}
