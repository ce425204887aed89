// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::{genesis_block_state, Controller};
use crate::authorization::AuthorizationManager;
use crate::verification::check_protocol_features;
use cairn_chain_exports::state_objects::{
    account_key, account_metadata_key, block_summary_key, AccountMetadataObject, AccountObject,
    BlockSummaryObject, DynamicGlobalPropertyObject, GlobalPropertyObject, ProtocolStateObject,
    NEW_ACCOUNT_OVERHEAD,
};
use cairn_chain_exports::{
    BlockHeaderState, BlockState, BlockStatus, ChainError, ChainResult, DbReadMode,
    SnapshotReader, SnapshotWriter, SNAPSHOT_BLOCK_STATE_SECTION, SNAPSHOT_HEADER_SECTION,
    SNAPSHOT_STATE_SECTION, SNAPSHOT_VERSION,
};
use cairn_db_exports::{
    StateDb, DYNAMIC_GLOBAL_PROPERTY_KEY, GLOBAL_PROPERTY_KEY, PROTOCOL_STATE_KEY,
};
use cairn_hash::Hash;
use cairn_models::action::PermissionLevel;
use cairn_models::authority::{Authority, PermissionLevelWeight};
use cairn_models::block::SignedBlock;
use cairn_models::constants::{
    ACTIVE_NAME, MAJORITY_PRODUCERS_PERMISSION_NAME, MINORITY_PRODUCERS_PERMISSION_NAME,
    NULL_ACCOUNT_NAME, OWNER_NAME, PRODUCERS_ACCOUNT_NAME, SYSTEM_ACCOUNT_NAME,
};
use cairn_models::name::Name;
use cairn_models::timestamp::BlockTimestamp;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Intrinsics contracts may import from genesis on
const GENESIS_INTRINSICS: &[&str] = &[
    "action_data_size",
    "read_action_data",
    "current_receiver",
    "require_auth",
    "require_auth2",
    "has_auth",
    "require_recipient",
    "is_account",
    "send_inline",
    "send_context_free_inline",
    "send_deferred",
    "cancel_deferred",
    "current_time",
    "publication_time",
    "db_store_i64",
    "db_update_i64",
    "db_remove_i64",
    "db_get_i64",
    "db_find_i64",
    "db_lowerbound_i64",
    "db_upperbound_i64",
    "get_active_producers",
    "set_proposed_producers",
    "is_privileged",
    "set_privileged",
    "set_resource_limits",
    "get_resource_limits",
    "get_blockchain_parameters_packed",
    "set_blockchain_parameters_packed",
    "check_transaction_authorization",
    "check_permission_authorization",
    "sha256",
    "assert_sha256",
    "recover_key",
    "cairn_assert",
    "cairn_exit",
    "printi",
    "prints",
];

/// Blocks replayed between two progress reports
const REPLAY_PROGRESS_INTERVAL: u32 = 500;

impl Controller {
    /// Bring the controller to a consistent head.
    ///
    /// The state comes from `snapshot` when given, from the state store when a previous run
    /// closed cleanly, and from genesis otherwise. Blocks of the block log and of the reversible
    /// store beyond the resulting head are then replayed.
    pub fn startup(&mut self, snapshot: Option<&mut dyn SnapshotReader>) -> ChainResult<()> {
        if let Some(reader) = snapshot {
            info!("starting initialization from snapshot, this may take a significant amount of time");
            reader.validate()?;
            let (blog_start, blog_end) = match self.blog.head_block_num() {
                Some(end) => (self.blog.first_block_num(), end),
                None => (0, u32::MAX),
            };
            self.read_from_snapshot(reader, blog_start, blog_end)?;
            if self.blog.head().is_none() {
                self.blog
                    .reset(&self.config.genesis, None, self.head.block_num() + 1)?;
            }
            info!(
                "snapshot loaded, head block {} ({})",
                self.head.block_num(),
                self.head.id()
            );
            return self.init(true);
        }

        if self.db_revision() < 1 {
            match self.fork_db.head() {
                Some(fork_head) => {
                    if self.config.read_mode == DbReadMode::Irreversible
                        && Some(fork_head.id()) != self.fork_db.root().map(|root| root.id())
                    {
                        self.fork_db.rollback_head_to_root();
                    }
                    warn!("no existing chain state, initializing fresh blockchain state");
                }
                None => warn!(
                    "no existing chain state or fork database, initializing fresh blockchain state and resetting fork database"
                ),
            }
            self.initialize_blockchain_state()?;
            if self.fork_db.head().is_none() {
                self.fork_db.reset(self.head.clone());
            }
            if self.blog.head().is_some() {
                if self.blog.first_block_num() != 1 {
                    return Err(ChainError::BlockValidation(
                        "block log does not start with the genesis block".to_string(),
                    ));
                }
            } else {
                let genesis_block = self.head.block.clone();
                self.blog
                    .reset(&self.config.genesis, Some(genesis_block.as_ref()), 1)?;
            }
            return self.init(false);
        }

        let fork_head = self.fork_db.head().ok_or_else(|| {
            ChainError::ForkDatabase(
                "no existing fork database despite existing chain state, replay required"
                    .to_string(),
            )
        })?;
        let lib_num = self.fork_db_root()?.block_num();
        let first_block_num = self.blog.first_block_num();
        match self.blog.head_block_num() {
            Some(log_head) => {
                if first_block_num > lib_num || lib_num > log_head {
                    return Err(ChainError::BlockValidation(format!(
                        "block log ({} to {}) does not contain the last irreversible block {}",
                        first_block_num, log_head, lib_num
                    )));
                }
            }
            None => {
                if first_block_num != lib_num + 1 {
                    self.blog.reset(&self.config.genesis, None, lib_num + 1)?;
                }
            }
        }
        if self.config.read_mode == DbReadMode::Irreversible
            && fork_head.id() != self.fork_db_root()?.id()
        {
            self.fork_db.rollback_head_to_root();
        }
        self.head = self.fork_db_head();
        self.init(false)
    }

    fn initialize_blockchain_state(&mut self) -> ChainResult<()> {
        self.head = Arc::new(genesis_block_state(&self.config.genesis, self.chain_id)?);
        self.store
            .write()
            .set_revision(self.head.block_num() as i64)?;
        self.initialize_database()
    }

    /// Write the genesis state: chain parameters, protocol state and the native accounts
    fn initialize_database(&mut self) -> ChainResult<()> {
        let genesis = self.config.genesis.clone();
        genesis.initial_configuration.validate()?;
        let head_id = self.head.id();
        let now = self.head.timestamp();
        let chain_id = self.chain_id;

        let system_active = Authority::from_permissions(
            1,
            vec![PermissionLevelWeight {
                permission: PermissionLevel::new(SYSTEM_ACCOUNT_NAME, ACTIVE_NAME),
                weight: 1,
            }],
        );
        self.with_db(|db| {
            db.put_object(block_summary_key(1), &BlockSummaryObject { block_id: head_id })?;
            db.put_object(
                GLOBAL_PROPERTY_KEY.to_vec(),
                &GlobalPropertyObject {
                    chain_id,
                    configuration: genesis.initial_configuration,
                    ..Default::default()
                },
            )?;
            db.put_object(
                PROTOCOL_STATE_KEY.to_vec(),
                &ProtocolStateObject {
                    whitelisted_intrinsics: GENESIS_INTRINSICS
                        .iter()
                        .map(|name| name.to_string())
                        .collect(),
                    ..Default::default()
                },
            )?;
            db.put_object(
                DYNAMIC_GLOBAL_PROPERTY_KEY.to_vec(),
                &DynamicGlobalPropertyObject::default(),
            )?;
            self.resource_limits.initialize_database(db)?;

            let system_auth = Authority::from_key(genesis.initial_key);
            self.create_native_account(
                db,
                SYSTEM_ACCOUNT_NAME,
                system_auth.clone(),
                system_auth,
                true,
                now,
            )?;
            let empty = Authority::from_permissions(1, Vec::new());
            self.create_native_account(db, NULL_ACCOUNT_NAME, empty.clone(), empty.clone(), false, now)?;
            self.create_native_account(
                db,
                PRODUCERS_ACCOUNT_NAME,
                empty,
                system_active.clone(),
                false,
                now,
            )?;

            let auth = AuthorizationManager;
            let (major, _) = auth.create_permission(
                db,
                PRODUCERS_ACCOUNT_NAME,
                MAJORITY_PRODUCERS_PERMISSION_NAME,
                ACTIVE_NAME,
                system_active.clone(),
                now,
            )?;
            auth.create_permission(
                db,
                PRODUCERS_ACCOUNT_NAME,
                MINORITY_PRODUCERS_PERMISSION_NAME,
                major.name,
                system_active,
                now,
            )?;
            Ok(())
        })
    }

    fn create_native_account(
        &self,
        db: &mut StateDb,
        name: Name,
        owner: Authority,
        active: Authority,
        privileged: bool,
        now: BlockTimestamp,
    ) -> ChainResult<()> {
        db.put_object(
            account_key(name),
            &AccountObject {
                name,
                creation_date: now,
                abi: Vec::new(),
            },
        )?;
        db.put_object(
            account_metadata_key(name),
            &AccountMetadataObject {
                name,
                privileged,
                ..Default::default()
            },
        )?;
        let (_, owner_size) =
            self.authorization
                .create_permission(db, name, OWNER_NAME, Name::default(), owner, now)?;
        let (_, active_size) =
            self.authorization
                .create_permission(db, name, ACTIVE_NAME, OWNER_NAME, active, now)?;
        self.resource_limits.initialize_account(db, name)?;
        self.resource_limits.add_pending_ram_usage(
            db,
            name,
            (NEW_ACCOUNT_OVERHEAD + owner_size + active_size) as i64,
        )?;
        self.resource_limits.verify_account_ram_usage(db, name)
    }

    /// Reconcile the state store with the head, check the reversible store against the block
    /// log, then replay what lies beyond the head
    fn init(&mut self, from_snapshot: bool) -> ChainResult<()> {
        let lib_num = match self.blog.head_block_num() {
            Some(num) => num,
            None => self.fork_db_root()?.block_num(),
        };
        let head_num = self.head.block_num() as i64;
        let revision = self.db_revision();
        if revision < head_num {
            return Err(ChainError::ForkDatabase(format!(
                "state store revision {} is less than head block number {}",
                revision, head_num
            )));
        }
        if revision > head_num {
            warn!(
                "state store revision {} is greater than head block number {}, undoing pending changes",
                revision, head_num
            );
            let mut store = self.store.write();
            while store.revision() > head_num {
                store.undo()?;
            }
        }

        let protocol_state = self.get_protocol_state()?;
        self.protocol_features
            .init(&protocol_state.activated_protocol_features)?;

        let mut last_block_num = lib_num;
        if self.config.read_mode == DbReadMode::Irreversible {
            if self.reversible_blocks.first_block_num()?.is_some() {
                warn!("read mode has changed to irreversible: erasing reversible blocks");
                self.reversible_blocks.remove_up_to(u32::MAX)?;
            }
        } else {
            self.reversible_blocks.remove_up_to(lib_num)?;
            if let Some(first) = self.reversible_blocks.first_block_num()? {
                if first != lib_num + 1 {
                    return Err(ChainError::ForkDatabase(format!(
                        "gap exists between last irreversible block {} and first reversible block {}",
                        lib_num, first
                    )));
                }
            }
            let last_reversible = self.reversible_blocks.last_block_num()?;
            if let Some(last) = last_reversible {
                last_block_num = last;
            }
            if self.head.block_num() > last_block_num {
                return Err(ChainError::ForkDatabase(format!(
                    "head block {} is greater than the last locally stored block {}",
                    self.head.block_num(),
                    last_block_num
                )));
            }
            if let Some(last) = last_reversible {
                self.check_reversible_against_fork_db(lib_num, last)?;
            }
        }

        let report_integrity_hash = from_snapshot || lib_num > self.head.block_num();
        if last_block_num > self.head.block_num() {
            self.replay()?;
        }
        if self.shutdown_requested() {
            return Ok(());
        }

        if self.config.read_mode != DbReadMode::Irreversible {
            let fork_head_id = self.fork_db_head().id();
            if self.fork_db_pending_head().id() != fork_head_id
                && Some(fork_head_id) == self.fork_db.root().map(|root| root.id())
            {
                warn!("read mode has changed from irreversible: applying best branch from fork database");
                loop {
                    let pending_head = self.fork_db_pending_head();
                    if pending_head.id() == self.fork_db_head().id() {
                        break;
                    }
                    info!("applying branch from fork database ending with block {}", pending_head.id());
                    self.maybe_switch_forks(pending_head, BlockStatus::Complete)?;
                }
            }
        }

        if report_integrity_hash {
            info!("database initialized with hash: {}", self.calculate_integrity_hash());
        }
        Ok(())
    }

    /// The reversible store and the fork database must agree on the block they both hold
    fn check_reversible_against_fork_db(&self, lib_num: u32, last: u32) -> ChainResult<()> {
        let pending_head = self.fork_db_pending_head();
        let (block_num, expected) = if lib_num < pending_head.block_num()
            && pending_head.block_num() <= last
        {
            (pending_head.block_num(), pending_head.id())
        } else if last < pending_head.block_num() {
            let on_branch = self
                .fork_db
                .search_on_branch(&pending_head.id(), last)
                .ok_or_else(|| {
                    ChainError::ForkDatabase("unexpected violation of invariants".to_string())
                })?;
            (last, on_branch.id())
        } else {
            return Ok(());
        };
        let stored = self.reversible_blocks.get(block_num)?.ok_or_else(|| {
            ChainError::ForkDatabase(format!(
                "block {} of the fork database not found in reversible blocks",
                block_num
            ))
        })?;
        let stored_id = stored.calculate_id()?;
        if stored_id != expected {
            return Err(ChainError::ForkDatabase(format!(
                "mismatch in block id of block {} in reversible blocks database: expected {}, actual {}",
                block_num, expected, stored_id
            )));
        }
        Ok(())
    }

    /// Apply the blocks of the block log beyond the head as irreversible, then the blocks of the
    /// reversible store as validated
    fn replay(&mut self) -> ChainResult<()> {
        let log_head = self.blog.head().map(|block| (block.block_num(), block.header.timestamp));
        self.replay_head_time = Some(log_head.map_or(self.head.timestamp(), |(_, ts)| ts));
        let start_block_num = self.head.block_num() + 1;
        let started = Instant::now();
        let result = self.replay_logs(start_block_num, log_head.map(|(num, _)| num));
        let replayed = self.head.block_num().saturating_sub(start_block_num - 1);
        let elapsed = started.elapsed();
        info!(
            "replayed {} blocks in {:.3} seconds, {:.3} ms/block",
            replayed,
            elapsed.as_secs_f64(),
            elapsed.as_secs_f64() * 1000.0 / f64::from(replayed.max(1))
        );
        self.replay_head_time = None;
        result
    }

    fn replay_logs(&mut self, start_block_num: u32, log_head_num: Option<u32>) -> ChainResult<()> {
        let mut guard_error = None;
        match log_head_num {
            Some(log_head) if start_block_num <= log_head => {
                info!(
                    "existing block log, attempting to replay from {} to {} blocks",
                    start_block_num, log_head
                );
                while let Some(block) = self.blog.read_block_by_num(self.head.block_num() + 1)? {
                    let block_num = block.block_num();
                    match self.replay_push_block(Arc::new(block), BlockStatus::Irreversible) {
                        Ok(()) => {}
                        Err(err @ ChainError::DatabaseGuard(_)) => {
                            guard_error = Some(err);
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                    if self.shutdown_requested() {
                        break;
                    }
                    if block_num % REPLAY_PROGRESS_INTERVAL == 0 {
                        info!("{} of {}", block_num, log_head);
                    }
                }
                info!(
                    "{} irreversible blocks replayed",
                    1 + self.head.block_num() - start_block_num
                );

                let pending_head = self.fork_db_pending_head();
                let root_num = self.fork_db_root()?.block_num();
                if pending_head.block_num() < self.head.block_num()
                    || self.head.block_num() < root_num
                {
                    info!(
                        "resetting fork database with new last irreversible block as the new root: {}",
                        self.head.id()
                    );
                    self.fork_db.reset(self.head.clone());
                } else if self.head.block_num() != root_num {
                    let new_root = self
                        .fork_db
                        .search_on_branch(&pending_head.id(), self.head.block_num())
                        .ok_or_else(|| {
                            ChainError::ForkDatabase(
                                "could not find new LIB in fork database".to_string(),
                            )
                        })?;
                    info!(
                        "advancing fork database root to new last irreversible block within existing fork database: {}",
                        new_root.id()
                    );
                    self.fork_db.mark_valid(&new_root)?;
                    self.fork_db.advance_root(&new_root.id())?;
                }

                if self.skip_db_sessions_for(BlockStatus::Irreversible) {
                    self.store
                        .write()
                        .set_revision(self.head.block_num() as i64)?;
                }
            }
            _ => info!("no irreversible blocks need to be replayed"),
        }

        if guard_error.is_none() && !self.shutdown_requested() {
            let mut replayed = 0;
            while let Some(block) = self.reversible_blocks.get(self.head.block_num() + 1)? {
                self.replay_push_block(Arc::new(block), BlockStatus::Validated)?;
                replayed += 1;
            }
            info!("{} reversible blocks replayed", replayed);
        }

        match guard_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn replay_push_block(&mut self, block: Arc<SignedBlock>, status: BlockStatus) -> ChainResult<()> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlock(
                "it is not valid to push a block when there is a pending block".to_string(),
            ));
        }
        self.signals.pre_accepted_block.emit(&block)?;

        let features_set = self.features_set.clone();
        let validator = |timestamp: BlockTimestamp, current: &BTreeSet<Hash>, new: &[Hash]| {
            check_protocol_features(&features_set, timestamp, current, new)
        };
        let skip_validate_signee = !self.config.force_all_checks;
        let bsp = Arc::new(BlockState::from_signed_block(
            &self.head.header_state,
            block,
            &validator,
            skip_validate_signee,
        )?);
        if status != BlockStatus::Irreversible {
            self.fork_db.add(bsp.clone(), true)?;
        }
        self.signals.accepted_block_header.emit(&bsp)?;

        if status == BlockStatus::Irreversible {
            self.apply_block(&bsp, status)?;
            self.head = bsp.clone();
            // log_irreversible does not run during replay
            self.signals.irreversible_block.emit(&bsp)?;
            if !self.skip_db_sessions_for(status) {
                self.store.write().commit(bsp.block_num() as i64);
            }
            Ok(())
        } else {
            if self.config.read_mode == DbReadMode::Irreversible {
                return Err(ChainError::BlockValidation(
                    "cannot replay reversible blocks while in irreversible mode".to_string(),
                ));
            }
            self.maybe_switch_forks(bsp, status)
        }
    }

    /// Write the head header state and every state row to `writer`
    pub fn write_snapshot(&self, writer: &mut dyn SnapshotWriter) -> ChainResult<()> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlock(
                "cannot take a consistent snapshot with a pending block".to_string(),
            ));
        }
        info!("writing snapshot at head block {} ({})", self.head.block_num(), self.head.id());
        writer.write_section(
            SNAPSHOT_HEADER_SECTION,
            &mut std::iter::once((b"version".to_vec(), SNAPSHOT_VERSION.to_le_bytes().to_vec())),
        )?;
        let header_state = bincode::serialize(&self.head.header_state)
            .map_err(|err| ChainError::SnapshotError(format!("could not encode head: {}", err)))?;
        writer.write_section(
            SNAPSHOT_BLOCK_STATE_SECTION,
            &mut std::iter::once((b"head".to_vec(), header_state)),
        )?;
        {
            let store = self.store.read();
            writer.write_section(SNAPSHOT_STATE_SECTION, &mut store.entries())?;
        }
        writer.finalize()?;
        info!("snapshot written");
        Ok(())
    }

    fn read_from_snapshot(
        &mut self,
        reader: &mut dyn SnapshotReader,
        blog_start: u32,
        blog_end: u32,
    ) -> ChainResult<()> {
        let version = reader
            .read_section(SNAPSHOT_HEADER_SECTION)?
            .into_iter()
            .next()
            .and_then(|(_, value)| <[u8; 4]>::try_from(value.as_slice()).ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| ChainError::SnapshotError("missing snapshot header".to_string()))?;
        if version != SNAPSHOT_VERSION {
            return Err(ChainError::SnapshotError(format!(
                "unsupported snapshot version {}, expected {}",
                version, SNAPSHOT_VERSION
            )));
        }

        let (_, head_bytes) = reader
            .read_section(SNAPSHOT_BLOCK_STATE_SECTION)?
            .into_iter()
            .next()
            .ok_or_else(|| ChainError::SnapshotError("missing head block state".to_string()))?;
        let header_state: BlockHeaderState = bincode::deserialize(&head_bytes)
            .map_err(|err| ChainError::SnapshotError(format!("could not decode head: {}", err)))?;
        let head_num = header_state.block_num;
        if blog_start > head_num + 1 || head_num > blog_end {
            return Err(ChainError::SnapshotError(format!(
                "block log ({} to {}) contains neither the head block {} of the snapshot nor the block right after it",
                blog_start, blog_end, head_num
            )));
        }

        let rows = reader.read_section(SNAPSHOT_STATE_SECTION)?;
        {
            let mut store = self.store.write();
            store.clear();
            for (key, value) in rows {
                store.put(key, value)?;
            }
        }

        let block = Arc::new(SignedBlock::new(header_state.header.clone()));
        self.head = Arc::new(BlockState::new(header_state, block, Vec::new()));
        let gpo = self.get_global_properties()?;
        if gpo.chain_id != self.chain_id {
            return Err(ChainError::SnapshotError(format!(
                "chain id {} of the snapshot does not match the configured chain id {}",
                gpo.chain_id, self.chain_id
            )));
        }
        self.store.write().set_revision(head_num as i64)?;
        self.fork_db.reset(self.head.clone());
        Ok(())
    }
}
