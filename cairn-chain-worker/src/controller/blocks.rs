// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::Controller;
use crate::pending::{BlockStage, CompletedBlock};
use crate::verification::{spawn_block_state, BlockStateFuture};
use cairn_chain_exports::{
    BlockState, BlockStatus, ChainError, ChainResult, DbReadMode, TransactionTrace,
    UnappliedOrigin, ValidationMode,
};
use cairn_models::block::SignedBlock;
use cairn_models::name::Name;
use cairn_models::receipt::{ReceiptTransaction, TransactionStatus};
use cairn_models::transaction::TransactionMetadata;
use std::sync::Arc;
use tracing::{error, info};

impl Controller {
    /// Start verifying a received block on the verification pool.
    ///
    /// The block must link to a block of the fork database and must not be known already.
    pub fn create_block_state_future(&self, block: Arc<SignedBlock>) -> ChainResult<BlockStateFuture> {
        let id = block.calculate_id()?;
        if self.fork_db.get_block(&id).is_some() {
            return Err(ChainError::BlockAlreadyKnown(id.to_string()));
        }
        let prev = self
            .fork_db
            .get_block_header(&block.header.previous)
            .ok_or_else(|| {
                ChainError::UnlinkableBlock(format!(
                    "block {} links to unknown block {}",
                    id, block.header.previous
                ))
            })?;
        Ok(spawn_block_state(
            &self.verification_pool,
            prev.header_state.clone(),
            block,
            id,
            self.features_set.clone(),
        ))
    }

    /// Add a verified block to the fork database and switch to the best branch
    pub fn push_block(&mut self, future: BlockStateFuture) -> ChainResult<()> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlock(
                "it is not valid to push a block when there is a pending block".to_string(),
            ));
        }
        self.validate_db_available_size()?;
        self.validate_reversible_available_size()?;

        let previous = self.trusted_producer_light_validation;
        let result = self.push_block_impl(future);
        self.trusted_producer_light_validation = previous;
        if let Err(err) = &result {
            error!("push_block failed: {}", err);
        }
        result
    }

    fn push_block_impl(&mut self, future: BlockStateFuture) -> ChainResult<()> {
        let bsp = future.get()?;
        self.signals.pre_accepted_block.emit(&bsp.block)?;
        self.fork_db.add(bsp.clone(), false)?;
        if self.is_trusted_producer(bsp.block.header.producer) {
            self.trusted_producer_light_validation = true;
        }
        self.signals.accepted_block_header.emit(&bsp)?;

        if self.config.read_mode != DbReadMode::Irreversible {
            let new_head = self.fork_db_pending_head();
            self.maybe_switch_forks(new_head, BlockStatus::Complete)
        } else {
            self.log_irreversible()
        }
    }

    /// Whether blocks of `producer` may be applied with light validation
    pub fn is_trusted_producer(&self, producer: Name) -> bool {
        self.config.block_validation_mode == ValidationMode::Light
            || self.config.trusted_producers.contains(&producer)
    }

    /// Re-execute a block in a new pending block and check it produces the same receipts and
    /// the same id as its producer declared
    pub(crate) fn apply_block(&mut self, bsp: &Arc<BlockState>, status: BlockStatus) -> ChainResult<()> {
        if let Err(err) = self.apply_block_impl(bsp, status) {
            self.abort_block();
            return Err(err);
        }
        Ok(())
    }

    fn apply_block_impl(&mut self, bsp: &Arc<BlockState>, status: BlockStatus) -> ChainResult<()> {
        let block = bsp.block.clone();
        let producer_block_id = bsp.id();
        self.start_block_impl(
            block.header.timestamp,
            block.header.confirmed,
            block.header.new_protocol_feature_activations.clone(),
            status,
            Some(producer_block_id),
        )?;

        let cached_metas = bsp.trxs();
        let use_cached = !cached_metas.is_empty();
        let mut packed_index = 0;
        for (index, receipt) in block.transactions.iter().enumerate() {
            let receipts_before = self.pending_ref()?.trx_receipts().len();
            let trace: TransactionTrace = match &receipt.trx {
                ReceiptTransaction::Packed(signed) => {
                    let meta = match cached_metas.get(packed_index) {
                        Some(meta) if use_cached => meta.clone(),
                        _ => Arc::new(TransactionMetadata::new(signed.clone())?),
                    };
                    packed_index += 1;
                    self.push_transaction_impl(meta, None, receipt.header.cpu_usage_us, true)?
                }
                ReceiptTransaction::Id(trx_id) => {
                    self.push_scheduled_impl(trx_id, None, receipt.header.cpu_usage_us, true)?
                }
            };

            let can_fail = receipt.header.status == TransactionStatus::HardFail
                && matches!(receipt.trx, ReceiptTransaction::Id(_));
            if let Some(err) = trace.except {
                if !can_fail {
                    return Err(err);
                }
            }

            let receipts = self.pending_ref()?.trx_receipts();
            if receipts.len() != receipts_before + 1 {
                return Err(ChainError::ReceiptMismatch {
                    index,
                    details: "expected receipt was not added".to_string(),
                });
            }
            let produced = receipts[receipts.len() - 1].header;
            if produced != receipt.header {
                return Err(ChainError::ReceiptMismatch {
                    index,
                    details: format!("produced {:?}, block declares {:?}", produced, receipt.header),
                });
            }
        }

        self.finalize_block()?;
        let pending = self.pending_mut()?;
        let assembled = match &pending.stage {
            BlockStage::Assembled(assembled) => assembled,
            _ => {
                return Err(ChainError::PendingBlock(
                    "applied block was not assembled".to_string(),
                ))
            }
        };
        if assembled.id != producer_block_id {
            return Err(ChainError::BlockIdMismatch {
                declared: producer_block_id.to_string(),
                computed: assembled.id.to_string(),
            });
        }
        if !use_cached {
            bsp.set_trxs(assembled.trx_metas.clone());
        }
        pending.stage = BlockStage::Completed(CompletedBlock {
            block_state: bsp.clone(),
        });
        chain_trace!("controller.apply_block", {
            "block_id": producer_block_id,
            "block_num": bsp.block_num(),
            "status": format!("{:?}", status)
        });
        self.commit_block_impl(false)
    }

    /// Make `new_head` the head, applying it directly when it extends the head and switching
    /// branches otherwise. A failed switch restores the previous branch before returning the
    /// error.
    pub(crate) fn maybe_switch_forks(
        &mut self,
        new_head: Arc<BlockState>,
        status: BlockStatus,
    ) -> ChainResult<()> {
        let head_changed = if new_head.previous() == self.head.id() {
            if let Err(err) = self.apply_block(&new_head, status) {
                self.fork_db.remove(&new_head.id())?;
                return Err(err);
            }
            self.fork_db.mark_valid(&new_head)?;
            self.head = new_head;
            true
        } else if new_head.id() != self.head.id() {
            self.switch_forks(&new_head)?;
            true
        } else {
            false
        };

        if head_changed {
            self.log_irreversible()?;
        }
        Ok(())
    }

    fn switch_forks(&mut self, new_head: &Arc<BlockState>) -> ChainResult<()> {
        info!(
            "switching forks from {} (block number {}) to {} (block number {})",
            self.head.id(),
            self.head.block_num(),
            new_head.id(),
            new_head.block_num()
        );
        let (to_apply, to_undo) = self.fork_db.fetch_branch_from(&new_head.id(), &self.head.id())?;
        let common_ancestor = match (to_apply.last(), to_undo.last()) {
            (Some(bsp), _) | (None, Some(bsp)) => bsp.previous(),
            (None, None) => return Ok(()),
        };

        for _ in &to_undo {
            self.pop_block()?;
        }
        if self.head.id() != common_ancestor {
            return Err(ChainError::ForkDatabase(
                "loss of sync between fork_db and the state store during fork switch".to_string(),
            ));
        }

        for (applied, bsp) in to_apply.iter().rev().enumerate() {
            let status = if bsp.is_valid() {
                BlockStatus::Validated
            } else {
                BlockStatus::Complete
            };
            let result = self
                .apply_block(bsp, status)
                .and_then(|_| self.fork_db.mark_valid(bsp));
            match result {
                Ok(()) => self.head = bsp.clone(),
                Err(err) => {
                    error!("exception thrown while switching forks: {}", err);
                    self.fork_db.remove(&bsp.id())?;
                    for _ in 0..applied {
                        self.pop_block()?;
                    }
                    if self.head.id() != common_ancestor {
                        return Err(ChainError::ForkDatabase(
                            "loss of sync between fork_db and the state store during fork switch reversal"
                                .to_string(),
                        ));
                    }
                    for bsp in to_undo.iter().rev() {
                        self.apply_block(bsp, BlockStatus::Validated)?;
                        self.head = bsp.clone();
                    }
                    return Err(err);
                }
            }
        }
        info!("successfully switched fork to new head {}", new_head.id());
        Ok(())
    }

    /// Undo the head block, making its parent the head. In speculative mode its transactions
    /// are kept for a retry.
    pub fn pop_block(&mut self) -> ChainResult<()> {
        let head = self.head.clone();
        let prev = self.fork_db.get_block_header(&head.previous()).ok_or_else(|| {
            ChainError::BlockValidation("attempt to pop beyond last irreversible block".to_string())
        })?;
        self.reversible_blocks.remove(head.block_num())?;
        if self.config.read_mode == DbReadMode::Speculative {
            for trx in head.trxs() {
                self.unapplied_transactions
                    .add(trx, UnappliedOrigin::ForkedBlock);
            }
        }
        self.head = prev;
        self.store.write().undo()?;
        self.protocol_features
            .popped_blocks_to(self.head.block_num());
        Ok(())
    }
}
