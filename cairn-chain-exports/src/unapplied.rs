// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use cairn_hash::Hash;
use cairn_models::timestamp::TimePointSec;
use cairn_models::transaction::TransactionMetadata;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Why a transaction is waiting to be re-applied
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnappliedOrigin {
    /// its block was popped from the head
    ForkedBlock,
    /// the pending block holding it was aborted
    AbortedBlock,
}

/// Transactions taken out of popped or aborted blocks, keyed by signed id, waiting for the
/// producer to reconsider them
#[derive(Debug, Default)]
pub struct UnappliedTransactions {
    queue: BTreeMap<Hash, (Arc<TransactionMetadata>, UnappliedOrigin)>,
}

impl UnappliedTransactions {
    /// Empty queue
    pub fn new() -> Self {
        UnappliedTransactions::default()
    }

    /// Queue a transaction. Implicit and scheduled transactions are never queued.
    pub fn add(&mut self, trx: Arc<TransactionMetadata>, origin: UnappliedOrigin) -> bool {
        if trx.implicit || trx.scheduled {
            return false;
        }
        self.queue.insert(trx.signed_id, (trx, origin)).is_none()
    }

    /// Take a transaction out of the queue
    pub fn remove(&mut self, signed_id: &Hash) -> Option<Arc<TransactionMetadata>> {
        self.queue.remove(signed_id).map(|(trx, _)| trx)
    }

    /// Whether a transaction is queued
    pub fn contains(&self, signed_id: &Hash) -> bool {
        self.queue.contains_key(signed_id)
    }

    /// Queued transaction
    pub fn get(&self, signed_id: &Hash) -> Option<&Arc<TransactionMetadata>> {
        self.queue.get(signed_id).map(|(trx, _)| trx)
    }

    /// Drop transactions that expired before `now` and return how many were dropped
    pub fn clear_expired(&mut self, now: TimePointSec) -> usize {
        let before = self.queue.len();
        self.queue
            .retain(|_, (trx, _)| trx.trx().expiration >= now);
        before - self.queue.len()
    }

    /// Take every queued transaction, in signed id order
    pub fn drain(&mut self) -> Vec<Arc<TransactionMetadata>> {
        std::mem::take(&mut self.queue)
            .into_values()
            .map(|(trx, _)| trx)
            .collect()
    }

    /// Queued transactions with their origin
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<TransactionMetadata>, UnappliedOrigin)> {
        self.queue.values().map(|(trx, origin)| (trx, *origin))
    }

    /// Number of queued transactions
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_models::transaction::{SignedTransaction, Transaction};

    fn meta(expiration: u32) -> Arc<TransactionMetadata> {
        let trx = Transaction {
            expiration: TimePointSec(expiration),
            ..Default::default()
        };
        Arc::new(TransactionMetadata::new(SignedTransaction::new(trx)).unwrap())
    }

    #[test]
    fn queue_and_expire() {
        let mut queue = UnappliedTransactions::new();
        let old = meta(10);
        let fresh = meta(100);
        assert!(queue.add(old.clone(), UnappliedOrigin::ForkedBlock));
        assert!(!queue.add(old.clone(), UnappliedOrigin::AbortedBlock));
        queue.add(fresh.clone(), UnappliedOrigin::AbortedBlock);
        assert_eq!(queue.clear_expired(TimePointSec(50)), 1);
        assert!(!queue.contains(&old.signed_id));
        assert_eq!(queue.remove(&fresh.signed_id).unwrap().id, fresh.id);
        assert!(queue.is_empty());

        let implicit =
            Arc::new(TransactionMetadata::new_implicit(Transaction::default()).unwrap());
        assert!(!queue.add(implicit, UnappliedOrigin::AbortedBlock));
    }
}
