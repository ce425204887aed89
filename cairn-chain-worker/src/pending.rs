// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use cairn_chain_exports::{
    BlockHeaderState, BlockState, BlockStatus, ChainError, ChainResult, PendingBlockHeaderState,
};
use cairn_db_exports::UndoSession;
use cairn_hash::Hash;
use cairn_models::action::ActionReceipt;
use cairn_models::block::SignedBlock;
use cairn_models::block_id::BlockId;
use cairn_models::name::Name;
use cairn_models::producer::ProducerSchedule;
use cairn_models::receipt::TransactionReceipt;
use cairn_models::timestamp::BlockTimestamp;
use cairn_models::transaction::TransactionMetadata;
use cairn_signature::PublicKey;
use std::sync::Arc;

/// Block being filled with transactions
#[derive(Debug)]
pub struct BuildingBlock {
    pub pending_block_header_state: PendingBlockHeaderState,
    /// proposed schedule promoted to pending by this block
    pub new_pending_producer_schedule: Option<ProducerSchedule>,
    pub new_protocol_feature_activations: Vec<Hash>,
    pub pending_trx_metas: Vec<Arc<TransactionMetadata>>,
    pub pending_trx_receipts: Vec<TransactionReceipt>,
    pub actions: Vec<ActionReceipt>,
}

/// Block whose header is final but not yet signed
#[derive(Debug)]
pub struct AssembledBlock {
    pub id: BlockId,
    pub header_state: BlockHeaderState,
    pub trx_metas: Vec<Arc<TransactionMetadata>>,
    pub unsigned_block: SignedBlock,
}

/// Signed block ready to be committed
#[derive(Debug)]
pub struct CompletedBlock {
    pub block_state: Arc<BlockState>,
}

/// Lifecycle of the pending block: Building, then Assembled, then Completed
#[derive(Debug)]
pub enum BlockStage {
    Building(BuildingBlock),
    Assembled(AssembledBlock),
    Completed(CompletedBlock),
}

/// The block under construction and the state session holding its writes.
///
/// Dropping it discards every write made since it was started.
#[derive(Debug)]
pub struct PendingState {
    pub session: UndoSession,
    pub block_status: BlockStatus,
    /// id of the block being applied, when the block comes from elsewhere
    pub producer_block_id: Option<BlockId>,
    pub stage: BlockStage,
}

impl PendingState {
    pub fn new(
        session: UndoSession,
        pending_block_header_state: PendingBlockHeaderState,
        block_status: BlockStatus,
        producer_block_id: Option<BlockId>,
    ) -> Self {
        PendingState {
            session,
            block_status,
            producer_block_id,
            stage: BlockStage::Building(BuildingBlock {
                pending_block_header_state,
                new_pending_producer_schedule: None,
                new_protocol_feature_activations: Vec::new(),
                pending_trx_metas: Vec::new(),
                pending_trx_receipts: Vec::new(),
                actions: Vec::new(),
            }),
        }
    }

    pub fn building(&self) -> ChainResult<&BuildingBlock> {
        match &self.stage {
            BlockStage::Building(bb) => Ok(bb),
            _ => Err(ChainError::PendingBlock(
                "pending block is not being built".to_string(),
            )),
        }
    }

    pub fn building_mut(&mut self) -> ChainResult<&mut BuildingBlock> {
        match &mut self.stage {
            BlockStage::Building(bb) => Ok(bb),
            _ => Err(ChainError::PendingBlock(
                "pending block is not being built".to_string(),
            )),
        }
    }

    pub fn block_num(&self) -> u32 {
        match &self.stage {
            BlockStage::Building(bb) => bb.pending_block_header_state.block_num,
            BlockStage::Assembled(ab) => ab.header_state.block_num,
            BlockStage::Completed(cb) => cb.block_state.block_num(),
        }
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        match &self.stage {
            BlockStage::Building(bb) => bb.pending_block_header_state.timestamp,
            BlockStage::Assembled(ab) => ab.header_state.timestamp(),
            BlockStage::Completed(cb) => cb.block_state.timestamp(),
        }
    }

    pub fn producer(&self) -> Name {
        match &self.stage {
            BlockStage::Building(bb) => bb.pending_block_header_state.producer,
            BlockStage::Assembled(ab) => ab.header_state.header.producer,
            BlockStage::Completed(cb) => cb.block_state.block.header.producer,
        }
    }

    pub fn block_signing_key(&self) -> PublicKey {
        match &self.stage {
            BlockStage::Building(bb) => bb.pending_block_header_state.block_signing_key,
            BlockStage::Assembled(ab) => ab.header_state.block_signing_key,
            BlockStage::Completed(cb) => cb.block_state.header_state.block_signing_key,
        }
    }

    pub fn active_schedule(&self) -> &ProducerSchedule {
        match &self.stage {
            BlockStage::Building(bb) => &bb.pending_block_header_state.active_schedule,
            BlockStage::Assembled(ab) => &ab.header_state.active_schedule,
            BlockStage::Completed(cb) => &cb.block_state.header_state.active_schedule,
        }
    }

    /// Schedule waiting for promotion once this block is in
    pub fn pending_schedule(&self) -> &ProducerSchedule {
        match &self.stage {
            BlockStage::Building(bb) => match &bb.new_pending_producer_schedule {
                Some(schedule) => schedule,
                None => &bb.pending_block_header_state.prev_pending_schedule.schedule,
            },
            BlockStage::Assembled(ab) => &ab.header_state.pending_schedule.schedule,
            BlockStage::Completed(cb) => &cb.block_state.header_state.pending_schedule.schedule,
        }
    }

    pub fn trx_receipts(&self) -> &[TransactionReceipt] {
        match &self.stage {
            BlockStage::Building(bb) => &bb.pending_trx_receipts,
            BlockStage::Assembled(ab) => &ab.unsigned_block.transactions,
            BlockStage::Completed(cb) => &cb.block_state.block.transactions,
        }
    }

    /// Metadata of the transactions applied so far
    pub fn trx_metas(&self) -> Vec<Arc<TransactionMetadata>> {
        match &self.stage {
            BlockStage::Building(bb) => bb.pending_trx_metas.clone(),
            BlockStage::Assembled(ab) => ab.trx_metas.clone(),
            BlockStage::Completed(cb) => cb.block_state.trxs(),
        }
    }

    pub fn is_protocol_feature_activated(&self, digest: &Hash) -> ChainResult<bool> {
        match &self.stage {
            BlockStage::Building(bb) => Ok(bb
                .pending_block_header_state
                .prev_activated_protocol_features
                .contains(digest)
                || bb.new_protocol_feature_activations.contains(digest)),
            BlockStage::Assembled(_) => Err(ChainError::Misc(
                "protocol feature activation cannot be queried on an assembled block".to_string(),
            )),
            BlockStage::Completed(cb) => Ok(cb
                .block_state
                .header_state
                .activated_protocol_features
                .contains(digest)),
        }
    }
}
