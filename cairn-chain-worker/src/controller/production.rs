// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::Controller;
use crate::native_handlers::encode_payload;
use crate::pending::{AssembledBlock, BlockStage, CompletedBlock, PendingState};
use crate::verification::check_protocol_features;
use cairn_chain_exports::state_objects::{block_summary_key, BlockSummaryObject};
use cairn_chain_exports::{
    BlockState, BlockStatus, ChainError, ChainResult, DbReadMode, UnappliedOrigin,
};
use cairn_db_exports::{UndoSession, GLOBAL_PROPERTY_KEY, PROTOCOL_STATE_KEY};
use cairn_hash::{merkle_root, Hash};
use cairn_models::action::{Action, PermissionLevel};
use cairn_models::block::SignedBlock;
use cairn_models::block_id::BlockId;
use cairn_models::constants::{ACTIVE_NAME, ONBLOCK_ACTION_NAME, SYSTEM_ACCOUNT_NAME};
use cairn_models::timestamp::{BlockTimestamp, TimePointSec};
use cairn_models::transaction::{Transaction, TransactionMetadata};
use cairn_protocol_features::{ActivatedProtocolFeature, BuiltinProtocolFeature};
use cairn_signature::KeyPair;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

impl Controller {
    /// Start producing a block at `when` on top of the head, activating every pre-activated
    /// protocol feature
    pub fn start_block(&mut self, when: BlockTimestamp, confirm_block_count: u16) -> ChainResult<()> {
        self.validate_db_available_size()?;
        let new_features = self.get_protocol_state()?.preactivated_protocol_features;
        self.start_block_impl(
            when,
            confirm_block_count,
            new_features,
            BlockStatus::Incomplete,
            None,
        )
    }

    /// Start producing a block activating `new_protocol_feature_activations`
    pub fn start_block_with_features(
        &mut self,
        when: BlockTimestamp,
        confirm_block_count: u16,
        new_protocol_feature_activations: Vec<Hash>,
    ) -> ChainResult<()> {
        self.validate_db_available_size()?;
        self.validate_protocol_features(&new_protocol_feature_activations)
            .map_err(|err| match err {
                ChainError::ProtocolFeatureBadBlock(message) => ChainError::ProtocolFeature(message),
                other => other,
            })?;
        self.start_block_impl(
            when,
            confirm_block_count,
            new_protocol_feature_activations,
            BlockStatus::Incomplete,
            None,
        )
    }

    pub(crate) fn start_block_impl(
        &mut self,
        when: BlockTimestamp,
        confirm_block_count: u16,
        new_protocol_feature_activations: Vec<Hash>,
        status: BlockStatus,
        producer_block_id: Option<BlockId>,
    ) -> ChainResult<()> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlock("pending block already exists".to_string()));
        }
        let skip_sessions = self.skip_db_sessions_for(status);
        if !skip_sessions {
            let revision = self.db_revision();
            if revision != self.head.block_num() as i64 {
                return Err(ChainError::ForkDatabase(format!(
                    "state store revision {} is not at the head block {}",
                    revision,
                    self.head.block_num()
                )));
            }
        }
        let pbhs = self.head.header_state.next(when, confirm_block_count)?;
        let session = UndoSession::new(&self.store, !skip_sessions);
        self.pending = Some(PendingState::new(session, pbhs, status, producer_block_id));

        if let Err(err) = self.open_pending_block(new_protocol_feature_activations) {
            self.pending = None;
            self.protocol_features
                .popped_blocks_to(self.head.block_num());
            return Err(err);
        }
        Ok(())
    }

    /// Activate features, promote the proposed schedule and run `onblock` in the fresh
    /// pending block
    fn open_pending_block(&mut self, new_features: Vec<Hash>) -> ChainResult<()> {
        let producing = self.is_producing_block();
        let block_num = self.pending_block_num()?;

        if !new_features.is_empty() {
            let mut protocol_state = self.get_protocol_state()?;
            let mut triggers = Vec::new();
            let mut preactivated_found = 0;
            for digest in &new_features {
                let (preactivation_required, builtin) =
                    match self.protocol_features.get_protocol_feature(digest) {
                        Some(feature) => (
                            feature.subjective_restrictions.preactivation_required,
                            feature.builtin_feature,
                        ),
                        None => {
                            return Err(ChainError::ProtocolFeatureBadBlock(format!(
                                "protocol feature with digest {} is unrecognized",
                                digest
                            )))
                        }
                    };
                if preactivation_required {
                    if !protocol_state.preactivated_protocol_features.contains(digest) {
                        let message = format!(
                            "attempted to activate protocol feature {} without prior required pre-activation",
                            digest
                        );
                        return Err(if producing {
                            ChainError::ProtocolFeature(message)
                        } else {
                            ChainError::ProtocolFeatureBadBlock(message)
                        });
                    }
                    preactivated_found += 1;
                }
                if let Some(builtin) = builtin {
                    triggers.push(builtin);
                }
                self.protocol_features.activate_feature(*digest, block_num)?;
            }
            let preactivated_count = protocol_state.preactivated_protocol_features.len();
            if preactivated_count > 0 && preactivated_found != preactivated_count {
                return Err(ChainError::BlockValidation(
                    "pre-activated protocol features must be activated in the next block"
                        .to_string(),
                ));
            }
            protocol_state.preactivated_protocol_features.clear();
            protocol_state
                .activated_protocol_features
                .extend(new_features.iter().map(|digest| ActivatedProtocolFeature {
                    feature_digest: *digest,
                    activation_block_num: block_num,
                }));
            self.with_db(|db| {
                db.put_object(PROTOCOL_STATE_KEY.to_vec(), &protocol_state)?;
                Ok(())
            })?;
            self.pending_mut()?
                .building_mut()?
                .new_protocol_feature_activations = new_features;
            for builtin in triggers {
                self.trigger_activation_handler(builtin)?;
            }
        }

        self.promote_proposed_schedule()?;
        self.run_onblock()?;
        self.clear_expired_input_transactions()?;
        self.update_producers_authority()
    }

    /// Make the proposed schedule pending once the block proposing it is irreversible
    fn promote_proposed_schedule(&mut self) -> ChainResult<()> {
        let mut gpo = self.get_global_properties()?;
        let building = self.pending_ref()?.building()?;
        let pbhs = &building.pending_block_header_state;
        let ready = match gpo.proposed_schedule_block_num {
            Some(proposed_num) => {
                proposed_num <= pbhs.dpos_irreversible_blocknum
                    && pbhs.prev_pending_schedule.schedule.producers.is_empty()
            }
            None => false,
        };
        if !ready {
            return Ok(());
        }
        if gpo.proposed_schedule.version != pbhs.active_schedule_version + 1 {
            return Err(ChainError::ProducerSchedule(format!(
                "wrong producer schedule version {}, expected {}",
                gpo.proposed_schedule.version,
                pbhs.active_schedule_version + 1
            )));
        }
        if !self.is_replaying() {
            info!(
                "promoting proposed schedule (set in block {:?}) to pending; current block: {} lib: {} schedule: {:?}",
                gpo.proposed_schedule_block_num,
                pbhs.block_num,
                pbhs.dpos_irreversible_blocknum,
                gpo.proposed_schedule
            );
        }
        let schedule = std::mem::take(&mut gpo.proposed_schedule);
        gpo.proposed_schedule_block_num = None;
        self.pending_mut()?
            .building_mut()?
            .new_pending_producer_schedule = Some(schedule);
        self.with_db(|db| {
            db.put_object(GLOBAL_PROPERTY_KEY.to_vec(), &gpo)?;
            Ok(())
        })
    }

    /// Implicit transaction calling `cairn::onblock` with the head block header
    fn onblock_transaction(&self) -> ChainResult<Transaction> {
        let action = Action::new(
            SYSTEM_ACCOUNT_NAME,
            ONBLOCK_ACTION_NAME,
            vec![PermissionLevel::new(SYSTEM_ACCOUNT_NAME, ACTIVE_NAME)],
            encode_payload(self.head_block_header())?,
        );
        let mut trx = Transaction {
            actions: vec![action],
            ..Default::default()
        };
        if self.is_builtin_activated(BuiltinProtocolFeature::NoDuplicateDeferredId) {
            trx.expiration = TimePointSec::default();
            trx.ref_block_num = 0;
            trx.ref_block_prefix = 0;
        } else {
            // rounded up so that it never looks expired within its own block
            trx.expiration = self.pending_block_time()?.to_time_point_sec().plus_secs(1);
            trx.set_reference_block(&self.head.id());
        }
        Ok(trx)
    }

    fn run_onblock(&mut self) -> ChainResult<()> {
        let meta = Arc::new(TransactionMetadata::new_implicit(self.onblock_transaction()?)?);
        let min_cpu = self
            .get_global_properties()?
            .configuration
            .min_transaction_cpu_usage;
        let previous = self.in_trx_requiring_checks;
        self.in_trx_requiring_checks = true;
        let result = self.push_transaction_impl(meta, None, min_cpu, true);
        self.in_trx_requiring_checks = previous;
        match result {
            Ok(trace) => {
                if let Some(err) = &trace.except {
                    warn!("onblock {} failed: {}", self.pending_block_num()?, err);
                }
                Ok(())
            }
            Err(err) if err.is_hard_fail() => Err(err),
            Err(err) => {
                warn!("onblock {} failed: {}", self.pending_block_num()?, err);
                Ok(())
            }
        }
    }

    /// Compute the Merkle roots and the header of the pending block, leaving it unsigned
    pub fn finalize_block(&mut self) -> ChainResult<()> {
        self.pending_ref()?.building()?;
        self.with_db(|db| self.resource_limits.process_block_usage(db))?;

        let building = self.pending_ref()?.building()?;
        let trx_digests = building
            .pending_trx_receipts
            .iter()
            .map(|receipt| receipt.digest())
            .collect::<Result<Vec<Hash>, _>>()?;
        let action_digests = building.actions.iter().map(|receipt| receipt.digest()).collect();
        let header = building.pending_block_header_state.make_block_header(
            merkle_root(trx_digests),
            merkle_root(action_digests),
            building.new_pending_producer_schedule.clone(),
            building.new_protocol_feature_activations.clone(),
        );

        let features_set = self.features_set.clone();
        let validator = |timestamp: BlockTimestamp, current: &BTreeSet<Hash>, new: &[Hash]| {
            check_protocol_features(&features_set, timestamp, current, new)
        };
        let receipts = building.pending_trx_receipts.clone();
        let trx_metas = building.pending_trx_metas.clone();
        let header_state = building
            .pending_block_header_state
            .clone()
            .finish_next(header, &validator)?;
        let mut unsigned_block = SignedBlock::new(header_state.header.clone());
        unsigned_block.transactions = receipts;
        let id = header_state.id;

        let summary = BlockSummaryObject { block_id: id };
        self.with_db(|db| {
            db.put_object(block_summary_key(id.block_num()), &summary)?;
            Ok(())
        })?;

        self.pending_mut()?.stage = BlockStage::Assembled(AssembledBlock {
            id,
            header_state,
            trx_metas,
            unsigned_block,
        });
        chain_trace!("controller.finalize_block", { "block_id": id });
        Ok(())
    }

    /// Sign the assembled block with the scheduled producer key
    pub fn sign_block(&mut self, keypair: &KeyPair) -> ChainResult<()> {
        let pending = self.pending_mut()?;
        let assembled = match &pending.stage {
            BlockStage::Assembled(assembled) => assembled,
            _ => {
                return Err(ChainError::PendingBlock(
                    "sign_block called on a pending block that is not assembled".to_string(),
                ))
            }
        };
        if keypair.get_public_key() != assembled.header_state.block_signing_key {
            return Err(ChainError::InvalidSignature(format!(
                "key {} does not match the scheduled signing key {}",
                keypair.get_public_key(),
                assembled.header_state.block_signing_key
            )));
        }
        let digest = assembled.header_state.sig_digest()?;
        let mut block = assembled.unsigned_block.clone();
        block.sign(keypair, &digest);
        let block_state = BlockState::new(
            assembled.header_state.clone(),
            Arc::new(block),
            assembled.trx_metas.clone(),
        );
        pending.stage = BlockStage::Completed(CompletedBlock {
            block_state: Arc::new(block_state),
        });
        Ok(())
    }

    /// Make the completed pending block the head
    pub fn commit_block(&mut self) -> ChainResult<()> {
        self.validate_db_available_size()?;
        self.validate_reversible_available_size()?;
        self.commit_block_impl(true)
    }

    pub(crate) fn commit_block_impl(&mut self, add_to_fork_db: bool) -> ChainResult<()> {
        if let Err(err) = self.commit_pending_block(add_to_fork_db) {
            self.abort_block();
            return Err(err);
        }
        if let Some(pending) = self.pending.take() {
            pending.session.push();
        }
        Ok(())
    }

    fn commit_pending_block(&mut self, add_to_fork_db: bool) -> ChainResult<()> {
        let bsp = match &self.pending_ref()?.stage {
            BlockStage::Completed(completed) => completed.block_state.clone(),
            _ => {
                return Err(ChainError::PendingBlock(
                    "cannot commit a pending block that is not completed".to_string(),
                ))
            }
        };
        if add_to_fork_db {
            self.fork_db.add(bsp.clone(), false)?;
            self.fork_db.mark_valid(&bsp)?;
            self.signals.accepted_block_header.emit(&bsp)?;
            self.head = self.fork_db_head();
            if self.head.id() != bsp.id() {
                return Err(ChainError::ForkDatabase(format!(
                    "committed block {} did not become the head block",
                    bsp.id()
                )));
            }
        }
        if !self.is_replaying() && self.config.read_mode != DbReadMode::Irreversible {
            self.reversible_blocks.put(&bsp.block)?;
        }
        self.signals.accepted_block.emit(&bsp)?;
        chain_trace!("controller.commit_block", {
            "block_id": bsp.id(),
            "block_num": bsp.block_num(),
            "trxs": bsp.block.transactions.len()
        });
        if add_to_fork_db {
            self.log_irreversible()?;
        }
        Ok(())
    }

    /// Discard the pending block and its state changes. In speculative mode its transactions
    /// are kept for a retry.
    pub fn abort_block(&mut self) {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return,
        };
        if self.config.read_mode == DbReadMode::Speculative {
            for trx in pending.trx_metas() {
                self.unapplied_transactions
                    .add(trx, UnappliedOrigin::AbortedBlock);
            }
        }
        drop(pending);
        self.protocol_features
            .popped_blocks_to(self.head.block_num());
    }
}
