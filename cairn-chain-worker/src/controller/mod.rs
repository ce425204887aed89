// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

//! The chain controller and its state.
//!
//! The implementation is split by concern:
//! * `startup`: opening the stores, genesis, snapshot restore and replay
//! * `production`: the pending block, from `start_block` to `commit_block`
//! * `transactions`: input and deferred transactions
//! * `blocks`: received blocks, fork switching and `pop_block`
//! * `irreversible`: moving blocks from the fork database to the block log
//! * `features`: protocol feature pre-activation and activation
//! * `producers`: producer schedule proposals
//! * `lists`: white, black and grey lists

use crate::authorization::AuthorizationManager;
use crate::fork_database::ForkDatabase;
use crate::pending::{BlockStage, PendingState};
use crate::resource_limits::ResourceLimitsManager;
use crate::verification::check_protocol_features;
use cairn_block_store::{BlockLog, ReversibleBlockStore};
use cairn_chain_exports::state_objects::{
    account_key, account_metadata_key, generated_transaction_key, transaction_key,
    AccountMetadataObject, AccountObject, DynamicGlobalPropertyObject, GeneratedTransactionObject,
    GlobalPropertyObject, ProtocolStateObject,
};
use cairn_chain_exports::{
    ActionExecutor, BlockState, BlockStatus, ChainConfig, ChainError, ChainListener, ChainResult,
    ChainSignals, DbReadMode, UnappliedTransactions, ValidationMode,
};
use cairn_db_exports::{
    ShareableStateStore, StateDb, StateStoreConfig, VersionedStoreController,
    DYNAMIC_GLOBAL_PROPERTY_KEY, GENERATED_TRANSACTION_PREFIX, GLOBAL_PROPERTY_KEY,
    PROTOCOL_STATE_KEY,
};
use cairn_db_worker::CairnStateStore;
use cairn_hash::Hash;
use cairn_models::block::{BlockHeader, SignedBlock};
use cairn_models::block_id::BlockId;
use cairn_models::constants::SYSTEM_ACCOUNT_NAME;
use cairn_models::genesis::GenesisState;
use cairn_models::name::Name;
use cairn_models::producer::{ProducerKey, ProducerSchedule};
use cairn_models::receipt::TransactionReceipt;
use cairn_models::timestamp::BlockTimestamp;
use cairn_models::transaction::TransactionId;
use cairn_protocol_features::{ProtocolFeatureManager, ProtocolFeatureSet};
use cairn_signature::PublicKey;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

mod blocks;
mod features;
mod irreversible;
mod lists;
mod producers;
mod production;
mod startup;
mod transactions;

/// Chain controller: owns the state store, the block log, the reversible block store and the
/// fork database, builds and applies blocks and keeps them consistent with each other.
///
/// All operations run on the caller's thread except block signature verification, which is
/// spread over the verification pool.
pub struct Controller {
    /// configuration
    pub(crate) config: ChainConfig,
    /// id of the chain, derived from the genesis state
    pub(crate) chain_id: Hash,
    /// versioned state store
    pub(crate) store: ShareableStateStore,
    /// irreversible blocks
    pub(crate) blog: BlockLog,
    /// applied blocks that are not yet irreversible
    pub(crate) reversible_blocks: ReversibleBlockStore,
    /// reversible block states
    pub(crate) fork_db: ForkDatabase,
    /// last applied block
    pub(crate) head: Arc<BlockState>,
    /// block being built or applied
    pub(crate) pending: Option<PendingState>,
    /// transactions to retry in a later block
    pub(crate) unapplied_transactions: UnappliedTransactions,
    /// activation history of protocol features
    pub(crate) protocol_features: ProtocolFeatureManager,
    /// recognized protocol features, shared with the verification pool
    pub(crate) features_set: Arc<ProtocolFeatureSet>,
    /// runs contract code
    pub(crate) executor: Arc<dyn ActionExecutor>,
    /// notification signals
    pub(crate) signals: ChainSignals,
    /// block signature verification threads
    pub(crate) verification_pool: rayon::ThreadPool,
    /// per account resource accounting
    pub(crate) resource_limits: ResourceLimitsManager,
    /// permissions and authority checks
    pub(crate) authorization: AuthorizationManager,
    /// time of the block log head while blocks are replayed
    pub(crate) replay_head_time: Option<BlockTimestamp>,
    /// set while an implicit or scheduled transaction runs: every check applies
    pub(crate) in_trx_requiring_checks: bool,
    /// set while a block of a trusted producer is applied
    pub(crate) trusted_producer_light_validation: bool,
    /// extra cpu time granted to input transactions of a locally produced block
    pub(crate) subjective_cpu_leeway: Option<u32>,
    /// stops a replay at the next block boundary
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("chain_id", &self.chain_id)
            .field("head", &self.head.id())
            .field("pending", &self.pending.is_some())
            .field("read_mode", &self.config.read_mode)
            .finish()
    }
}

/// Block state of the genesis block. Its action Merkle root carries the chain id, so that two
/// chains started at the same time with the same key have different genesis blocks.
pub(crate) fn genesis_block_state(genesis: &GenesisState, chain_id: Hash) -> ChainResult<BlockState> {
    let initial_schedule = ProducerSchedule {
        version: 0,
        producers: vec![ProducerKey {
            producer_name: SYSTEM_ACCOUNT_NAME,
            block_signing_key: genesis.initial_key,
        }],
    };
    let mut header_state = cairn_chain_exports::BlockHeaderState::genesis(
        genesis.initial_timestamp,
        initial_schedule,
        genesis.initial_key,
    )?;
    header_state.header.action_mroot = chain_id;
    header_state.id = header_state.header.calculate_id()?;
    let block = Arc::new(SignedBlock::new(header_state.header.clone()));
    Ok(BlockState::new(header_state, block, Vec::new()))
}

impl Controller {
    /// Open the stores described by `config`. Nothing is applied until `startup` is called.
    pub fn new(
        config: ChainConfig,
        protocol_features: ProtocolFeatureSet,
        executor: Arc<dyn ActionExecutor>,
    ) -> ChainResult<Self> {
        let chain_id = config.genesis.compute_chain_id()?;
        let state_store = CairnStateStore::open(StateStoreConfig {
            path: config.state_dir.clone(),
            size: config.state_size,
        })?;
        let store: ShareableStateStore = Arc::new(RwLock::new(
            Box::new(state_store) as Box<dyn VersionedStoreController>
        ));
        let blog = BlockLog::open(&config.blocks_dir)?;
        let reversible_blocks =
            ReversibleBlockStore::open(&config.blocks_dir, config.reversible_cache_size)?;

        let features_set = Arc::new(protocol_features.clone());
        let validator = |timestamp: BlockTimestamp, current: &BTreeSet<Hash>, new: &[Hash]| {
            check_protocol_features(&features_set, timestamp, current, new)
        };
        let fork_db = ForkDatabase::open(&config.state_dir, &validator)?;
        let head = match fork_db.head() {
            Some(head) => head,
            None => Arc::new(genesis_block_state(&config.genesis, chain_id)?),
        };

        let verification_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.thread_pool_size)
            .thread_name(|index| format!("chain-verify-{}", index))
            .build()
            .map_err(|err| {
                ChainError::ConfigError(format!("could not start the verification pool: {}", err))
            })?;

        info!("chain id {}", chain_id);
        Ok(Controller {
            config,
            chain_id,
            store,
            blog,
            reversible_blocks,
            fork_db,
            head,
            pending: None,
            unapplied_transactions: UnappliedTransactions::new(),
            protocol_features: ProtocolFeatureManager::new(protocol_features),
            features_set,
            executor,
            signals: ChainSignals::default(),
            verification_pool,
            resource_limits: ResourceLimitsManager,
            authorization: AuthorizationManager,
            replay_head_time: None,
            in_trx_requiring_checks: false,
            trusted_producer_light_validation: false,
            subjective_cpu_leeway: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Notify `listener` of every block and transaction event
    pub fn subscribe(&mut self, listener: Arc<dyn ChainListener>) {
        self.signals.subscribe(listener);
    }

    /// Signals, to connect individual callbacks
    pub fn signals_mut(&mut self) -> &mut ChainSignals {
        &mut self.signals
    }

    /// Flag stopping a running replay at the next block boundary
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Abort the pending block, persist the fork database and flush the state store.
    /// A node closed this way restarts without replaying.
    pub fn close(mut self) -> ChainResult<()> {
        self.abort_block();
        self.fork_db.close()?;
        self.reversible_blocks.flush()?;
        self.store.read().flush()?;
        info!("controller closed at head {} ({})", self.head.block_num(), self.head.id());
        Ok(())
    }

    // state access

    pub(crate) fn with_db<R>(&self, f: impl FnOnce(&mut StateDb) -> ChainResult<R>) -> ChainResult<R> {
        let mut db = self.store.write();
        f(&mut **db)
    }

    pub(crate) fn read_db<R>(&self, f: impl FnOnce(&StateDb) -> ChainResult<R>) -> ChainResult<R> {
        let db = self.store.read();
        f(&**db)
    }

    /// Chain parameters and proposed producer schedule
    pub fn get_global_properties(&self) -> ChainResult<GlobalPropertyObject> {
        self.read_db(|db| {
            db.get_object(GLOBAL_PROPERTY_KEY)?.ok_or_else(|| {
                ChainError::Misc("global properties are not initialized".to_string())
            })
        })
    }

    /// Counters updated by every block
    pub fn get_dynamic_global_properties(&self) -> ChainResult<DynamicGlobalPropertyObject> {
        self.read_db(|db| {
            db.get_object(DYNAMIC_GLOBAL_PROPERTY_KEY)?.ok_or_else(|| {
                ChainError::Misc("dynamic global properties are not initialized".to_string())
            })
        })
    }

    /// Protocol feature activation state
    pub fn get_protocol_state(&self) -> ChainResult<ProtocolStateObject> {
        self.read_db(|db| {
            db.get_object(PROTOCOL_STATE_KEY)?.ok_or_else(|| {
                ChainError::Misc("protocol state is not initialized".to_string())
            })
        })
    }

    /// Account by name
    pub fn get_account(&self, name: Name) -> ChainResult<AccountObject> {
        self.read_db(|db| {
            db.get_object(&account_key(name))?
                .ok_or_else(|| ChainError::Misc(format!("unknown account {}", name)))
        })
    }

    /// Sequence numbers, code and privilege of an account
    pub fn get_account_metadata(&self, name: Name) -> ChainResult<AccountMetadataObject> {
        self.read_db(|db| {
            db.get_object(&account_metadata_key(name))?
                .ok_or_else(|| ChainError::Misc(format!("unknown account {}", name)))
        })
    }

    /// Deferred transaction scheduled by `sender` under `sender_id`
    pub fn get_generated_transaction(
        &self,
        sender: Name,
        sender_id: u128,
    ) -> ChainResult<Option<GeneratedTransactionObject>> {
        self.read_db(|db| Ok(db.get_object(&generated_transaction_key(sender, sender_id))?))
    }

    /// Deferred transaction by id
    pub fn find_generated_transaction(
        &self,
        trx_id: &TransactionId,
    ) -> ChainResult<Option<GeneratedTransactionObject>> {
        self.read_db(|db| {
            Ok(db
                .prefix_objects::<GeneratedTransactionObject>(GENERATED_TRANSACTION_PREFIX.as_bytes())?
                .into_iter()
                .map(|(_, gto)| gto)
                .find(|gto| gto.trx_id == *trx_id))
        })
    }

    /// Every deferred transaction, ordered by `(delay_until, sender, sender_id)`
    pub fn get_scheduled_transactions(&self) -> ChainResult<Vec<GeneratedTransactionObject>> {
        let mut scheduled: Vec<GeneratedTransactionObject> = self.read_db(|db| {
            Ok(db
                .prefix_objects::<GeneratedTransactionObject>(GENERATED_TRANSACTION_PREFIX.as_bytes())?
                .into_iter()
                .map(|(_, gto)| gto)
                .collect())
        })?;
        scheduled.sort_by_key(|gto| (gto.delay_until, gto.sender, gto.sender_id));
        Ok(scheduled)
    }

    /// Whether an input transaction with this id was applied and has not expired yet
    pub fn is_known_unexpired_transaction(&self, id: &TransactionId) -> ChainResult<bool> {
        self.read_db(|db| Ok(db.get(&transaction_key(id)).is_some()))
    }

    /// Digest of the whole state
    pub fn calculate_integrity_hash(&self) -> Hash {
        self.store.read().state_hash()
    }

    /// Revision of the state store
    pub fn db_revision(&self) -> i64 {
        self.store.read().revision()
    }

    // head

    /// Last applied block
    pub fn head_block_state(&self) -> Arc<BlockState> {
        self.head.clone()
    }

    /// Height of the head block
    pub fn head_block_num(&self) -> u32 {
        self.head.block_num()
    }

    /// Id of the head block
    pub fn head_block_id(&self) -> BlockId {
        self.head.id()
    }

    /// Time of the head block
    pub fn head_block_time(&self) -> BlockTimestamp {
        self.head.timestamp()
    }

    /// Producer of the head block
    pub fn head_block_producer(&self) -> Name {
        self.head.block.header.producer
    }

    /// Header of the head block
    pub fn head_block_header(&self) -> &BlockHeader {
        &self.head.block.header
    }

    pub(crate) fn fork_db_head(&self) -> Arc<BlockState> {
        self.fork_db.head().unwrap_or_else(|| self.head.clone())
    }

    pub(crate) fn fork_db_pending_head(&self) -> Arc<BlockState> {
        self.fork_db.pending_head().unwrap_or_else(|| self.fork_db_head())
    }

    pub(crate) fn fork_db_root(&self) -> ChainResult<Arc<BlockState>> {
        self.fork_db.root().ok_or_else(|| {
            ChainError::ForkDatabase("fork database is not initialized".to_string())
        })
    }

    /// Height of the best validated block of the fork database
    pub fn fork_db_head_block_num(&self) -> u32 {
        self.fork_db_head().block_num()
    }

    /// Id of the best validated block of the fork database
    pub fn fork_db_head_block_id(&self) -> BlockId {
        self.fork_db_head().id()
    }

    /// Height of the best block of the fork database, validated or not
    pub fn fork_db_pending_head_block_num(&self) -> u32 {
        self.fork_db_pending_head().block_num()
    }

    /// Id of the best block of the fork database, validated or not
    pub fn fork_db_pending_head_block_id(&self) -> BlockId {
        self.fork_db_pending_head().id()
    }

    /// Height of the last irreversible block
    pub fn last_irreversible_block_num(&self) -> u32 {
        match self.fork_db.root() {
            Some(root) => root.block_num(),
            None => self.head.dpos_irreversible_blocknum(),
        }
    }

    /// Id of the last irreversible block
    pub fn last_irreversible_block_id(&self) -> ChainResult<BlockId> {
        Ok(self.fork_db_root()?.id())
    }

    // pending block

    pub(crate) fn pending_ref(&self) -> ChainResult<&PendingState> {
        self.pending
            .as_ref()
            .ok_or_else(|| ChainError::PendingBlock("no pending block".to_string()))
    }

    pub(crate) fn pending_mut(&mut self) -> ChainResult<&mut PendingState> {
        self.pending
            .as_mut()
            .ok_or_else(|| ChainError::PendingBlock("no pending block".to_string()))
    }

    /// Time of the pending block
    pub fn pending_block_time(&self) -> ChainResult<BlockTimestamp> {
        Ok(self.pending_ref()?.timestamp())
    }

    /// Height of the pending block
    pub fn pending_block_num(&self) -> ChainResult<u32> {
        Ok(self.pending_ref()?.block_num())
    }

    /// Producer of the pending block
    pub fn pending_block_producer(&self) -> ChainResult<Name> {
        Ok(self.pending_ref()?.producer())
    }

    /// Key expected to sign the pending block
    pub fn pending_block_signing_key(&self) -> ChainResult<PublicKey> {
        Ok(self.pending_ref()?.block_signing_key())
    }

    /// Id of the block being applied, when it was received rather than produced
    pub fn pending_producer_block_id(&self) -> Option<BlockId> {
        self.pending.as_ref().and_then(|p| p.producer_block_id)
    }

    /// Receipts of the transactions applied to the pending block so far
    pub fn get_pending_trx_receipts(&self) -> Vec<TransactionReceipt> {
        self.pending
            .as_ref()
            .map(|p| p.trx_receipts().to_vec())
            .unwrap_or_default()
    }

    /// Whether a block is being built, as opposed to assembled or completed
    pub fn is_building_block(&self) -> bool {
        matches!(
            self.pending.as_ref().map(|p| &p.stage),
            Some(BlockStage::Building(_))
        )
    }

    /// Whether the pending block is produced locally
    pub fn is_producing_block(&self) -> bool {
        self.pending
            .as_ref()
            .map(|p| p.block_status == BlockStatus::Incomplete)
            .unwrap_or(false)
    }

    /// Height used to evaluate feature activations: the pending block, or the block after head
    pub(crate) fn current_block_num(&self) -> u32 {
        match &self.pending {
            Some(pending) => pending.block_num(),
            None => self.head.block_num() + 1,
        }
    }

    // configuration and policy

    /// Id of the chain
    pub fn get_chain_id(&self) -> Hash {
        self.chain_id
    }

    /// Read mode
    pub fn get_read_mode(&self) -> DbReadMode {
        self.config.read_mode
    }

    /// Validation mode
    pub fn get_validation_mode(&self) -> ValidationMode {
        self.config.block_validation_mode
    }

    /// Configuration the controller runs with
    pub fn get_config(&self) -> &ChainConfig {
        &self.config
    }

    /// Whether blocks are being replayed from the block log or the reversible store
    pub fn is_replaying(&self) -> bool {
        self.replay_head_time.is_some()
    }

    /// Whether a contract may bill RAM to another account while handling a notification
    pub fn is_ram_billing_in_notify_allowed(&self) -> bool {
        self.config.disable_all_subjective_mitigations || self.config.allow_ram_billing_in_notify
    }

    /// Whether every subjective mitigation is disabled
    pub fn all_subjective_mitigations_disabled(&self) -> bool {
        self.config.disable_all_subjective_mitigations
    }

    /// Whether checks may be skipped for the pending block
    pub fn light_validation_allowed(&self, replay_opts_disabled_by_policy: bool) -> bool {
        let pending = match &self.pending {
            Some(pending) => pending,
            None => return false,
        };
        if self.in_trx_requiring_checks {
            return false;
        }
        let status = pending.block_status;
        let consider_skipping_on_replay = matches!(
            status,
            BlockStatus::Irreversible | BlockStatus::Validated
        ) && !replay_opts_disabled_by_policy;
        let consider_skipping_on_validation = status == BlockStatus::Complete
            && (self.config.block_validation_mode == ValidationMode::Light
                || self.trusted_producer_light_validation);
        consider_skipping_on_replay || consider_skipping_on_validation
    }

    /// Whether authorization checks are skipped for the pending block
    pub fn skip_auth_check(&self) -> bool {
        self.light_validation_allowed(self.config.force_all_checks)
    }

    /// Whether expiration, TaPoS and referenced account checks are skipped for the pending block
    pub fn skip_trx_checks(&self) -> bool {
        self.light_validation_allowed(self.config.disable_replay_opts)
    }

    /// Whether blocks with status `status` are applied without undo sessions
    pub fn skip_db_sessions_for(&self, status: BlockStatus) -> bool {
        status == BlockStatus::Irreversible
            && !self.config.disable_replay_opts
            && !self.in_trx_requiring_checks
    }

    /// Whether the pending block is applied without undo sessions
    pub fn skip_db_sessions(&self) -> bool {
        self.pending
            .as_ref()
            .map(|p| self.skip_db_sessions_for(p.block_status))
            .unwrap_or(false)
    }

    /// Extra cpu time granted to input transactions of locally produced blocks
    pub fn set_subjective_cpu_leeway(&mut self, leeway_us: Option<u32>) {
        self.subjective_cpu_leeway = leeway_us;
    }

    /// See `set_subjective_cpu_leeway`
    pub fn get_subjective_cpu_leeway(&self) -> Option<u32> {
        self.subjective_cpu_leeway
    }

    /// Transactions waiting to be retried
    pub fn get_unapplied_transactions(&self) -> &UnappliedTransactions {
        &self.unapplied_transactions
    }

    /// See `get_unapplied_transactions`
    pub fn get_unapplied_transactions_mut(&mut self) -> &mut UnappliedTransactions {
        &mut self.unapplied_transactions
    }

    /// Fail when the state store is almost full
    pub fn validate_db_available_size(&self) -> ChainResult<()> {
        let free = self.store.read().free_bytes();
        if free < self.config.state_guard_size {
            warn!("state store has {} free bytes left", free);
            return Err(ChainError::DatabaseGuard(format!(
                "database free space {} is below the guard size {}",
                free, self.config.state_guard_size
            )));
        }
        Ok(())
    }

    /// Fail when the reversible block store is almost full
    pub fn validate_reversible_available_size(&self) -> ChainResult<()> {
        let free = self.reversible_blocks.free_bytes();
        if free < self.config.reversible_guard_size {
            warn!("reversible block store has {} free bytes left", free);
            return Err(ChainError::ReversibleGuard(format!(
                "reversible block store free space {} is below the guard size {}",
                free, self.config.reversible_guard_size
            )));
        }
        Ok(())
    }

    // blocks lookups

    /// Block by id, from the fork database or the block log
    pub fn fetch_block_by_id(&self, id: &BlockId) -> ChainResult<Option<Arc<SignedBlock>>> {
        if let Some(bsp) = self.fork_db.get_block(id) {
            return Ok(Some(bsp.block.clone()));
        }
        match self.blog.read_block_by_num(id.block_num())? {
            Some(block) if block.calculate_id()? == *id => Ok(Some(Arc::new(block))),
            _ => Ok(None),
        }
    }

    /// Block at `block_num` on the current branch
    pub fn fetch_block_by_number(&self, block_num: u32) -> ChainResult<Option<Arc<SignedBlock>>> {
        if let Some(bsp) = self.fetch_block_state_by_number(block_num) {
            return Ok(Some(bsp.block.clone()));
        }
        Ok(self.blog.read_block_by_num(block_num)?.map(Arc::new))
    }

    /// Reversible block state by id
    pub fn fetch_block_state_by_id(&self, id: &BlockId) -> Option<Arc<BlockState>> {
        self.fork_db.get_block(id)
    }

    /// Reversible block state at `block_num` on the current branch
    pub fn fetch_block_state_by_number(&self, block_num: u32) -> Option<Arc<BlockState>> {
        let tip = match self.config.read_mode {
            DbReadMode::Irreversible => self.fork_db_pending_head(),
            _ => self.head.clone(),
        };
        self.fork_db.search_on_branch(&tip.id(), block_num)
    }

    /// Id of the block at `block_num` on the current branch
    pub fn get_block_id_for_num(&self, block_num: u32) -> ChainResult<BlockId> {
        let in_block_log = self
            .blog
            .head_block_num()
            .map(|last| block_num <= last)
            .unwrap_or(false);
        if !in_block_log {
            if let Some(bsp) = self.fetch_block_state_by_number(block_num) {
                return Ok(bsp.id());
            }
            if self.head.block_num() == block_num {
                return Ok(self.head.id());
            }
        }
        self.blog
            .read_block_id_by_num(block_num)?
            .ok_or_else(|| ChainError::Misc(format!("could not find block {}", block_num)))
    }
}
