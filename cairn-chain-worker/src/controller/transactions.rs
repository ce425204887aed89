// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::Controller;
use crate::transaction_context::{TransactionContext, TransactionOutcome};
use cairn_chain_exports::state_objects::{
    block_summary_key, generated_transaction_key, BlockSummaryObject, GeneratedTransactionObject,
    TransactionObject,
};
use cairn_chain_exports::{BlockStatus, ChainError, ChainResult, DbReadMode, TransactionTrace};
use cairn_db_exports::{UndoSession, TRANSACTION_PREFIX};
use cairn_models::action::ActionReceipt;
use cairn_models::receipt::{
    ReceiptTransaction, TransactionReceipt, TransactionReceiptHeader, TransactionStatus,
};
use cairn_models::name::Name;
use cairn_models::transaction::{Transaction, TransactionId, TransactionMetadata};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Result of a deferred transaction run, its context outcome, the accounts it bills and the
/// minimum cpu charge
type ScheduledRun = (ChainResult<()>, TransactionOutcome, BTreeSet<Name>, u64);

fn time_point_millis(secs: u32) -> u64 {
    secs as u64 * 1000
}

impl Controller {
    /// Apply an input transaction to the pending block.
    ///
    /// Objective failures of the transaction itself are reported in the returned trace. An
    /// error is returned when the failure must abort the whole block.
    pub fn push_transaction(
        &mut self,
        trx: Arc<TransactionMetadata>,
        deadline: Option<Instant>,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
    ) -> ChainResult<TransactionTrace> {
        if self.config.read_mode == DbReadMode::ReadOnly {
            return Err(ChainError::Transaction(
                "push transaction not allowed in read-only mode".to_string(),
            ));
        }
        if trx.implicit || trx.scheduled {
            return Err(ChainError::Transaction(
                "implicit or scheduled transactions cannot be pushed".to_string(),
            ));
        }
        self.pending_ref()?.building()?;
        self.validate_db_available_size()?;
        self.push_transaction_impl(trx, deadline, billed_cpu_time_us, explicit_billed_cpu_time)
    }

    pub(crate) fn push_transaction_impl(
        &mut self,
        trx: Arc<TransactionMetadata>,
        deadline: Option<Instant>,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
    ) -> ChainResult<TransactionTrace> {
        let check_auth = !self.skip_auth_check() && !trx.implicit;
        let producing = self.is_producing_block();

        let outcome = {
            let mut ctx = TransactionContext::new(self, trx.trx().clone(), trx.id, deadline)?;
            if explicit_billed_cpu_time {
                ctx.set_explicit_billed_cpu(billed_cpu_time_us as u64);
            }
            let result = self.run_input_transaction(&mut ctx, &trx, check_auth, producing);
            match result {
                Ok(()) => Ok(ctx.into_outcome()),
                Err(err) => Err((ctx.into_outcome(), err)),
            }
        };

        match outcome {
            Ok(outcome) => {
                let mut trace = outcome.trace;
                if !trx.implicit {
                    let status = if trx.trx().delay_sec == 0 {
                        TransactionStatus::Executed
                    } else {
                        TransactionStatus::Delayed
                    };
                    trace.receipt = Some(self.push_receipt(
                        ReceiptTransaction::Packed(trx.packed_trx.clone()),
                        status,
                        outcome.billed_cpu_time_us,
                        trace.net_usage,
                    )?);
                    self.pending_mut()?
                        .building_mut()?
                        .pending_trx_metas
                        .push(trx.clone());
                } else {
                    trace.receipt = Some(TransactionReceiptHeader::new(
                        TransactionStatus::Executed,
                        outcome.billed_cpu_time_us as u32,
                        (trace.net_usage / 8) as u32,
                    ));
                }
                self.append_actions(outcome.executed)?;

                self.signals.accepted_transaction.emit(&trx)?;
                self.signals.applied_transaction.emit(&trace)?;

                if self.config.read_mode != DbReadMode::Speculative && producing {
                    outcome.session.undo()?;
                } else {
                    outcome.session.squash()?;
                }
                if !trx.implicit {
                    self.unapplied_transactions.remove(&trx.signed_id);
                }
                chain_trace!("controller.push_transaction", {
                    "trx_id": trx.id,
                    "cpu_us": outcome.billed_cpu_time_us,
                    "net": trace.net_usage
                });
                Ok(trace)
            }
            Err((outcome, err)) => {
                outcome.session.undo()?;
                if err.is_hard_fail() || matches!(err, ChainError::ProtocolFeatureBadBlock(_)) {
                    return Err(err);
                }
                let mut trace = outcome.trace;
                trace.set_except(err);
                self.signals.accepted_transaction.emit(&trx)?;
                self.signals.applied_transaction.emit(&trace)?;
                Ok(trace)
            }
        }
    }

    fn run_input_transaction(
        &self,
        ctx: &mut TransactionContext<'_>,
        trx: &TransactionMetadata,
        check_auth: bool,
        producing: bool,
    ) -> ChainResult<()> {
        if trx.implicit {
            ctx.init_for_implicit_trx()?;
        } else {
            let skip_recording = match self.replay_head_time {
                Some(replay_head_time) => {
                    time_point_millis(trx.trx().expiration.secs()) <= replay_head_time.to_millis()
                }
                None => false,
            };
            ctx.init_for_input_trx(trx.packed_size as u64, skip_recording)?;
        }

        if check_auth {
            let keys = trx.packed_trx.recover_keys(&self.chain_id)?;
            if producing {
                for key in &keys {
                    self.check_key_list(key)?;
                }
            }
            let max_depth = ctx.parameters.max_authority_depth;
            self.read_db(|db| {
                self.authorization.check_authorization(
                    db,
                    &trx.trx().actions,
                    &keys,
                    max_depth,
                    false,
                )
            })?;
        }
        ctx.exec()?;
        ctx.finalize()
    }

    /// Execute a deferred transaction whose delay has passed.
    ///
    /// The transaction leaves the queue whatever happens, unless the failure is subjective, and
    /// the block records an executed, expired or hard failed receipt.
    pub fn push_scheduled_transaction(
        &mut self,
        trx_id: &TransactionId,
        deadline: Option<Instant>,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
    ) -> ChainResult<TransactionTrace> {
        if self.config.read_mode == DbReadMode::ReadOnly {
            return Err(ChainError::Transaction(
                "push scheduled transaction not allowed in read-only mode".to_string(),
            ));
        }
        self.pending_ref()?.building()?;
        self.validate_db_available_size()?;
        self.push_scheduled_impl(trx_id, deadline, billed_cpu_time_us, explicit_billed_cpu_time)
    }

    pub(crate) fn push_scheduled_impl(
        &mut self,
        trx_id: &TransactionId,
        deadline: Option<Instant>,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
    ) -> ChainResult<TransactionTrace> {
        let gto = self.find_generated_transaction(trx_id)?.ok_or_else(|| {
            ChainError::Transaction(format!("unknown transaction {}", trx_id))
        })?;
        if !self.is_producing_block() && !explicit_billed_cpu_time {
            return Err(ChainError::Transaction(
                "validating a scheduled transaction requires an explicitly billed cpu time"
                    .to_string(),
            ));
        }

        let undo_session = UndoSession::new(&self.store, !self.skip_db_sessions());
        self.remove_scheduled_transaction(&gto)?;

        let pending_time = self.pending_block_time()?;
        if time_point_millis(gto.delay_until.secs()) > pending_time.to_millis() {
            return Err(ChainError::Transaction(format!(
                "transaction {} isn't ready until {:?}",
                gto.trx_id, gto.delay_until
            )));
        }
        let meta = Arc::new(TransactionMetadata::new_scheduled(gto.trx.clone())?);

        if time_point_millis(gto.expiration.secs()) < pending_time.to_millis() {
            let mut trace =
                TransactionTrace::new(gto.trx_id, self.pending_block_num()?, pending_time);
            trace.producer_block_id = self.pending_producer_block_id();
            trace.scheduled = true;
            trace.receipt = Some(self.push_receipt(
                ReceiptTransaction::Id(gto.trx_id),
                TransactionStatus::Expired,
                billed_cpu_time_us as u64,
                0,
            )?);
            self.signals.accepted_transaction.emit(&meta)?;
            self.signals.applied_transaction.emit(&trace)?;
            undo_session.squash()?;
            debug!("deferred transaction {} expired", gto.trx_id);
            return Ok(trace);
        }

        let previous = self.in_trx_requiring_checks;
        self.in_trx_requiring_checks = true;
        let run = self.run_scheduled_transaction(&gto, deadline, billed_cpu_time_us, explicit_billed_cpu_time);
        self.in_trx_requiring_checks = previous;
        let (result, outcome, bill_to_accounts, min_cpu) = run?;

        match result {
            Ok(()) => {
                let mut trace = outcome.trace;
                trace.receipt = Some(self.push_receipt(
                    ReceiptTransaction::Id(gto.trx_id),
                    TransactionStatus::Executed,
                    outcome.billed_cpu_time_us,
                    trace.net_usage,
                )?);
                self.append_actions(outcome.executed)?;
                self.signals.accepted_transaction.emit(&meta)?;
                self.signals.applied_transaction.emit(&trace)?;
                outcome.session.squash()?;
                undo_session.squash()?;
                Ok(trace)
            }
            Err(err) => {
                outcome.session.undo()?;
                let mut trace = outcome.trace;
                if err.is_hard_fail() || matches!(err, ChainError::ProtocolFeatureBadBlock(_)) {
                    return Err(err);
                }
                let subjective = err.is_subjective();
                trace.set_except(err);
                if subjective {
                    // the queue entry comes back with the outer session
                    drop(undo_session);
                    self.signals.accepted_transaction.emit(&meta)?;
                    self.signals.applied_transaction.emit(&trace)?;
                    return Ok(trace);
                }

                let cpu_time_to_bill_us = if explicit_billed_cpu_time {
                    billed_cpu_time_us as u64
                } else {
                    outcome.billed_cpu_time_us.max(min_cpu)
                };
                let parameters = self.get_global_properties()?.configuration;
                let ordinal = pending_time.slot;
                self.with_db(|db| {
                    self.resource_limits.add_transaction_usage(
                        db,
                        &bill_to_accounts,
                        cpu_time_to_bill_us,
                        0,
                        ordinal,
                        &parameters,
                        &BTreeSet::new(),
                    )
                })?;
                trace.receipt = Some(self.push_receipt(
                    ReceiptTransaction::Id(gto.trx_id),
                    TransactionStatus::HardFail,
                    cpu_time_to_bill_us,
                    0,
                )?);
                self.signals.accepted_transaction.emit(&meta)?;
                self.signals.applied_transaction.emit(&trace)?;
                undo_session.squash()?;
                Ok(trace)
            }
        }
    }

    fn run_scheduled_transaction(
        &self,
        gto: &GeneratedTransactionObject,
        deadline: Option<Instant>,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
    ) -> ChainResult<ScheduledRun> {
        let mut ctx = TransactionContext::new(self, gto.trx.clone(), gto.trx_id, deadline)?;
        if explicit_billed_cpu_time {
            ctx.set_explicit_billed_cpu(billed_cpu_time_us as u64);
        }
        ctx.enforce_whiteblacklist = gto.sender == Name::default()
            || !self.sender_avoids_whitelist_blacklist_enforcement(gto.sender);
        let result = (|| {
            ctx.init_for_deferred_trx(gto.published)?;
            if ctx.enforce_whiteblacklist && self.is_producing_block() {
                let actors: BTreeSet<Name> = ctx
                    .trx
                    .actions
                    .iter()
                    .flat_map(|act| act.authorization.iter().map(|auth| auth.actor))
                    .collect();
                self.check_actor_list(&actors)?;
            }
            ctx.exec()?;
            ctx.finalize()
        })();
        let bill_to_accounts = ctx.bill_to_accounts.clone();
        let min_cpu = ctx.parameters.min_transaction_cpu_usage as u64;
        Ok((result, ctx.into_outcome(), bill_to_accounts, min_cpu))
    }

    /// Remove a deferred transaction from the queue and refund its payer
    pub(crate) fn remove_scheduled_transaction(
        &self,
        gto: &GeneratedTransactionObject,
    ) -> ChainResult<()> {
        self.with_db(|db| {
            db.delete(&generated_transaction_key(gto.sender, gto.sender_id))?;
            self.resource_limits
                .add_pending_ram_usage(db, gto.payer, -(gto.billable_size() as i64))
        })
    }

    fn push_receipt(
        &mut self,
        trx: ReceiptTransaction,
        status: TransactionStatus,
        cpu_usage_us: u64,
        net_usage: u64,
    ) -> ChainResult<TransactionReceiptHeader> {
        let header =
            TransactionReceiptHeader::new(status, cpu_usage_us as u32, (net_usage / 8) as u32);
        self.pending_mut()?
            .building_mut()?
            .pending_trx_receipts
            .push(TransactionReceipt { header, trx });
        Ok(header)
    }

    fn append_actions(&mut self, executed: Vec<ActionReceipt>) -> ChainResult<()> {
        self.pending_mut()?
            .building_mut()?
            .actions
            .extend(executed);
        Ok(())
    }

    /// Fail unless the transaction expires after the pending block, within the maximum lifetime
    pub fn validate_expiration(&self, trx: &Transaction) -> ChainResult<()> {
        let pending_time = self.pending_block_time()?;
        let max_lifetime = self
            .get_global_properties()?
            .configuration
            .max_transaction_lifetime;
        let expiration_ms = time_point_millis(trx.expiration.secs());
        if expiration_ms < pending_time.to_millis() {
            return Err(ChainError::ExpiredTransaction(format!(
                "transaction has expired, expiration is {} and pending block time is {}",
                trx.expiration.secs(),
                pending_time
            )));
        }
        if expiration_ms > pending_time.to_millis() + time_point_millis(max_lifetime) {
            return Err(ChainError::Transaction(format!(
                "transaction expiration {} is too far in the future relative to the pending block time {}",
                trx.expiration.secs(),
                pending_time
            )));
        }
        Ok(())
    }

    /// Fail unless the transaction references a block of the current branch
    pub fn validate_tapos(&self, trx: &Transaction) -> ChainResult<()> {
        let summary: Option<BlockSummaryObject> = self.read_db(|db| {
            Ok(db.get_object(&block_summary_key(trx.ref_block_num as u32))?)
        })?;
        match summary {
            Some(summary) if trx.verify_reference_block(&summary.block_id) => Ok(()),
            _ => Err(ChainError::InvalidRefBlock(format!(
                "transaction's reference block {}/{} did not match, is this transaction from a different fork?",
                trx.ref_block_num, trx.ref_block_prefix
            ))),
        }
    }

    /// Forget the ids of input transactions that expired, which can no longer be replayed
    pub(crate) fn clear_expired_input_transactions(&self) -> ChainResult<()> {
        let now = if self.is_building_block() {
            self.pending_block_time()?
        } else {
            self.head_block_time()
        };
        self.with_db(|db| {
            let expired: Vec<Vec<u8>> = db
                .prefix_objects::<TransactionObject>(TRANSACTION_PREFIX.as_bytes())?
                .into_iter()
                .filter(|(_, record)| now.to_millis() > time_point_millis(record.expiration.secs()))
                .map(|(key, _)| key)
                .collect();
            for key in expired {
                db.delete(&key)?;
            }
            Ok(())
        })
    }

    /// Status of the block being built or applied
    pub fn pending_block_status(&self) -> Option<BlockStatus> {
        self.pending.as_ref().map(|pending| pending.block_status)
    }
}
