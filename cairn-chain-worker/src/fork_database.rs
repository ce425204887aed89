// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use cairn_chain_exports::{
    BlockHeaderState, BlockState, ChainError, ChainResult, FeatureActivationValidator,
};
use cairn_models::block::SignedBlock;
use cairn_models::block_id::BlockId;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the file the fork database is persisted to, under the state directory
pub const FORK_DB_FILE_NAME: &str = "fork_db.dat";
const FORK_DB_VERSION: u32 = 1;

/// Chain of block states, from tip to root side
pub type Branch = Vec<Arc<BlockState>>;

/// Position of a block state in the preference order: validated blocks first, then the
/// highest irreversible height, the highest block number and the lowest id
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct PreferenceKey {
    unvalidated: bool,
    dpos_irreversible_blocknum: Reverse<u32>,
    block_num: Reverse<u32>,
    id: BlockId,
}

impl PreferenceKey {
    fn of(bsp: &BlockState) -> Self {
        PreferenceKey {
            unvalidated: !bsp.is_valid(),
            dpos_irreversible_blocknum: Reverse(bsp.dpos_irreversible_blocknum()),
            block_num: Reverse(bsp.block_num()),
            id: bsp.id(),
        }
    }
}

/// `lhs` is strictly better than `rhs` as a head
fn first_preferred(lhs: &BlockState, rhs: &BlockState) -> bool {
    (lhs.dpos_irreversible_blocknum(), lhs.block_num())
        > (rhs.dpos_irreversible_blocknum(), rhs.block_num())
}

#[derive(Serialize, Deserialize)]
struct PersistedBlockState {
    header_state: BlockHeaderState,
    block: SignedBlock,
    valid: bool,
}

impl PersistedBlockState {
    fn from_block_state(bsp: &BlockState) -> Self {
        PersistedBlockState {
            header_state: bsp.header_state.clone(),
            block: (*bsp.block).clone(),
            valid: bsp.is_valid(),
        }
    }

    fn into_block_state(self) -> Arc<BlockState> {
        let bsp = Arc::new(BlockState::new(
            self.header_state,
            Arc::new(self.block),
            Vec::new(),
        ));
        bsp.set_valid(self.valid);
        bsp
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedForkDatabase {
    version: u32,
    root: PersistedBlockState,
    head_id: BlockId,
    blocks: Vec<PersistedBlockState>,
}

/// Tree of the reversible block states, rooted at the last irreversible block.
///
/// Nodes live in an index keyed by block id and only point to their parent through
/// `header.previous`, so pruning a branch is removing index entries. The root is kept apart
/// from the index.
#[derive(Debug)]
pub struct ForkDatabase {
    path: PathBuf,
    root: Option<Arc<BlockState>>,
    head: Option<Arc<BlockState>>,
    index: BTreeMap<BlockId, Arc<BlockState>>,
    children: BTreeMap<BlockId, BTreeSet<BlockId>>,
    preference: BTreeSet<PreferenceKey>,
}

impl ForkDatabase {
    /// Open the fork database of `state_dir`, loading the file a clean shutdown left behind.
    /// The file is removed once loaded, so a crash before the next clean close forces a
    /// rebuild from the block logs.
    pub fn open(state_dir: &Path, validator: FeatureActivationValidator<'_>) -> ChainResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let mut fork_db = ForkDatabase {
            path: state_dir.join(FORK_DB_FILE_NAME),
            root: None,
            head: None,
            index: BTreeMap::new(),
            children: BTreeMap::new(),
            preference: BTreeSet::new(),
        };
        if fork_db.path.exists() {
            fork_db.load(validator)?;
            std::fs::remove_file(&fork_db.path)?;
        }
        Ok(fork_db)
    }

    fn load(&mut self, validator: FeatureActivationValidator<'_>) -> ChainResult<()> {
        let bytes = std::fs::read(&self.path)?;
        let persisted: PersistedForkDatabase = bincode::deserialize(&bytes).map_err(|err| {
            ChainError::ForkDatabase(format!("could not decode {}: {}", self.path.display(), err))
        })?;
        if persisted.version != FORK_DB_VERSION {
            return Err(ChainError::ForkDatabase(format!(
                "unsupported fork database version {}",
                persisted.version
            )));
        }
        let root = persisted.root.into_block_state();
        root.set_valid(true);
        self.reset(root);

        let mut blocks = persisted.blocks;
        blocks.sort_by_key(|b| b.header_state.block_num);
        for block in blocks {
            let bsp = block.into_block_state();
            self.add_impl(bsp, false, Some(validator)).map_err(|err| {
                ChainError::ForkDatabase(format!(
                    "persisted fork database is incompatible with the configured protocol features: {}",
                    err
                ))
            })?;
        }

        let root_id = self.root_id()?;
        if persisted.head_id == root_id {
            self.head = self.root.clone();
        } else {
            let head = self.get_block(&persisted.head_id).ok_or_else(|| {
                ChainError::ForkDatabase(format!(
                    "head {} not found in the persisted fork database",
                    persisted.head_id
                ))
            })?;
            let candidate = self.first_candidate();
            if let Some(candidate) = candidate {
                if candidate.is_valid() && first_preferred(&candidate, &head) {
                    warn!(
                        "persisted fork database head {} is not the best validated block {}",
                        head.id(),
                        candidate.id()
                    );
                }
            }
            self.head = Some(head);
        }
        info!(
            "loaded fork database with {} reversible blocks above root {}",
            self.index.len(),
            root_id
        );
        Ok(())
    }

    /// Write the fork database to disk and empty it
    pub fn close(&mut self) -> ChainResult<()> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => {
                warn!("fork database is not initialized, nothing to persist");
                return Ok(());
            }
        };
        let head_id = self.head.as_ref().map(|h| h.id()).unwrap_or_else(|| root.id());
        let persisted = PersistedForkDatabase {
            version: FORK_DB_VERSION,
            root: PersistedBlockState::from_block_state(&root),
            head_id,
            blocks: self
                .index
                .values()
                .map(|bsp| PersistedBlockState::from_block_state(bsp))
                .collect(),
        };
        let bytes = bincode::serialize(&persisted)
            .map_err(|err| ChainError::ForkDatabase(format!("could not encode: {}", err)))?;
        std::fs::write(&self.path, bytes)?;
        self.index.clear();
        self.children.clear();
        self.preference.clear();
        self.head = None;
        self.root = None;
        Ok(())
    }

    /// Drop every block and restart the tree from `root`, which becomes the head
    pub fn reset(&mut self, root: Arc<BlockState>) {
        self.index.clear();
        self.children.clear();
        self.preference.clear();
        root.set_valid(true);
        self.head = Some(root.clone());
        self.root = Some(root);
    }

    /// Last irreversible block
    pub fn root(&self) -> Option<Arc<BlockState>> {
        self.root.clone()
    }

    /// Tip of the best validated branch
    pub fn head(&self) -> Option<Arc<BlockState>> {
        self.head.clone()
    }

    /// Tip of the best branch, validated or not
    pub fn pending_head(&self) -> Option<Arc<BlockState>> {
        let head = self.head.clone()?;
        match self
            .preference
            .range(
                PreferenceKey {
                    unvalidated: true,
                    dpos_irreversible_blocknum: Reverse(u32::MAX),
                    block_num: Reverse(u32::MAX),
                    id: BlockId::zero(),
                }..,
            )
            .next()
            .and_then(|key| self.index.get(&key.id))
        {
            Some(candidate) if first_preferred(candidate, &head) => Some(candidate.clone()),
            _ => Some(head),
        }
    }

    fn root_id(&self) -> ChainResult<BlockId> {
        self.root
            .as_ref()
            .map(|root| root.id())
            .ok_or_else(|| ChainError::ForkDatabase("root not yet set".to_string()))
    }

    fn first_candidate(&self) -> Option<Arc<BlockState>> {
        self.preference
            .iter()
            .next()
            .and_then(|key| self.index.get(&key.id))
            .cloned()
    }

    /// Add a block state whose parent is the root or already in the tree
    pub fn add(&mut self, bsp: Arc<BlockState>, ignore_duplicate: bool) -> ChainResult<()> {
        self.add_impl(bsp, ignore_duplicate, None)
    }

    fn add_impl(
        &mut self,
        bsp: Arc<BlockState>,
        ignore_duplicate: bool,
        validator: Option<FeatureActivationValidator<'_>>,
    ) -> ChainResult<()> {
        self.root_id()?;
        let prev = self.get_block_header(&bsp.previous()).ok_or_else(|| {
            ChainError::UnlinkableBlock(format!(
                "block {} links to unknown block {}",
                bsp.id(),
                bsp.previous()
            ))
        })?;
        if let Some(validator) = validator {
            let new_features = &bsp.header_state.header.new_protocol_feature_activations;
            if !new_features.is_empty() {
                validator(
                    bsp.timestamp(),
                    &prev.header_state.activated_protocol_features,
                    new_features,
                )?;
            }
        }
        let id = bsp.id();
        if self.index.contains_key(&id) {
            if ignore_duplicate {
                return Ok(());
            }
            return Err(ChainError::ForkDatabase(format!("duplicate block {} added", id)));
        }
        self.children.entry(bsp.previous()).or_default().insert(id);
        self.preference.insert(PreferenceKey::of(&bsp));
        self.index.insert(id, bsp);

        if let Some(candidate) = self.first_candidate() {
            if candidate.is_valid() {
                self.head = Some(candidate);
            }
        }
        Ok(())
    }

    /// Block state by id, excluding the root
    pub fn get_block(&self, id: &BlockId) -> Option<Arc<BlockState>> {
        self.index.get(id).cloned()
    }

    /// Block state by id, including the root
    pub fn get_block_header(&self, id: &BlockId) -> Option<Arc<BlockState>> {
        match &self.root {
            Some(root) if root.id() == *id => Some(root.clone()),
            _ => self.get_block(id),
        }
    }

    /// Record that a block was applied successfully, possibly making it the head
    pub fn mark_valid(&mut self, bsp: &Arc<BlockState>) -> ChainResult<()> {
        if bsp.is_valid() {
            return Ok(());
        }
        let id = bsp.id();
        let stored = self.index.get(&id).cloned().ok_or_else(|| {
            ChainError::ForkDatabase(format!(
                "block {} is not in the fork database, it cannot be marked valid",
                id
            ))
        })?;
        self.preference.remove(&PreferenceKey::of(&stored));
        stored.set_valid(true);
        self.preference.insert(PreferenceKey::of(&stored));

        if let (Some(candidate), Some(head)) = (self.first_candidate(), self.head.as_ref()) {
            if first_preferred(&candidate, head) {
                self.head = Some(candidate);
            }
        }
        Ok(())
    }

    /// Remove a block and every block built on it. The head cannot be removed.
    pub fn remove(&mut self, id: &BlockId) -> ChainResult<()> {
        let head_id = self.head.as_ref().map(|h| h.id());
        let mut queue = vec![*id];
        let mut i = 0;
        while i < queue.len() {
            if Some(queue[i]) == head_id {
                return Err(ChainError::ForkDatabase(
                    "removing the block and its descendants would remove the current head block"
                        .to_string(),
                ));
            }
            if let Some(children) = self.children.get(&queue[i]) {
                queue.extend(children.iter().copied());
            }
            i += 1;
        }
        for block_id in queue {
            self.erase(&block_id);
        }
        Ok(())
    }

    fn erase(&mut self, id: &BlockId) {
        if let Some(bsp) = self.index.remove(id) {
            self.preference.remove(&PreferenceKey::of(&bsp));
            if let Some(siblings) = self.children.get_mut(&bsp.previous()) {
                siblings.remove(id);
                if siblings.is_empty() {
                    self.children.remove(&bsp.previous());
                }
            }
        }
    }

    /// Make a validated block the new root, pruning its ancestors and every branch that does
    /// not descend from it
    pub fn advance_root(&mut self, id: &BlockId) -> ChainResult<()> {
        let root_id = self.root_id()?;
        let new_root = self.get_block(id).ok_or_else(|| {
            ChainError::ForkDatabase(
                "cannot advance root to a block that does not exist in the fork database"
                    .to_string(),
            )
        })?;
        if !new_root.is_valid() {
            return Err(ChainError::ForkDatabase(
                "cannot advance root to a block that has not yet been validated".to_string(),
            ));
        }

        let mut blocks_to_remove = Vec::new();
        let mut cursor = new_root.previous();
        loop {
            blocks_to_remove.push(cursor);
            match self.get_block(&cursor) {
                Some(b) => cursor = b.previous(),
                None if cursor == root_id => break,
                None => {
                    return Err(ChainError::ForkDatabase(
                        "invariant violation: orphaned branch was present in the fork database"
                            .to_string(),
                    ))
                }
            }
        }

        // the new root leaves the index alone so that its descendants stay in the tree
        self.erase(id);
        for block_id in &blocks_to_remove {
            self.remove_subtree_except(block_id, id);
        }
        self.root = Some(new_root);
        Ok(())
    }

    /// Remove `id` and its descendants, sparing the subtree of `keep`
    fn remove_subtree_except(&mut self, id: &BlockId, keep: &BlockId) {
        let mut queue = vec![*id];
        let mut i = 0;
        while i < queue.len() {
            if let Some(children) = self.children.get(&queue[i]) {
                queue.extend(children.iter().copied().filter(|child| child != keep));
            }
            i += 1;
        }
        for block_id in queue {
            self.erase(&block_id);
        }
        self.children.remove(id);
    }

    /// Mark every block as not validated and make the root the head
    pub fn rollback_head_to_root(&mut self) {
        let blocks: Vec<Arc<BlockState>> = self.index.values().cloned().collect();
        self.preference.clear();
        for bsp in blocks {
            bsp.set_valid(false);
            self.preference.insert(PreferenceKey::of(&bsp));
        }
        self.head = self.root.clone();
    }

    /// Ancestors of `h` (itself included) down to but excluding the root, keeping only the
    /// blocks at or below `trim_after_block_num`
    pub fn fetch_branch(&self, h: &BlockId, trim_after_block_num: u32) -> Branch {
        let mut result = Vec::new();
        let mut cursor = self.get_block(h);
        while let Some(bsp) = cursor {
            if bsp.block_num() <= trim_after_block_num {
                result.push(bsp.clone());
            }
            cursor = self.get_block(&bsp.previous());
        }
        result
    }

    /// Block of the branch ending at `h` at height `block_num`, excluding the root
    pub fn search_on_branch(&self, h: &BlockId, block_num: u32) -> Option<Arc<BlockState>> {
        let mut cursor = self.get_block(h);
        while let Some(bsp) = cursor {
            if bsp.block_num() == block_num {
                return Some(bsp);
            }
            cursor = self.get_block(&bsp.previous());
        }
        None
    }

    /// Branches from the common ancestor of `first` and `second` to each of them, tip first,
    /// ancestor excluded
    pub fn fetch_branch_from(&self, first: &BlockId, second: &BlockId) -> ChainResult<(Branch, Branch)> {
        let lookup = |id: &BlockId| {
            self.get_block_header(id).ok_or_else(|| {
                ChainError::ForkDatabase(format!("block {} not found in the fork database", id))
            })
        };
        let mut first_branch = lookup(first)?;
        let mut second_branch = lookup(second)?;
        let mut result: (Branch, Branch) = (Vec::new(), Vec::new());

        while first_branch.block_num() > second_branch.block_num() {
            result.0.push(first_branch.clone());
            first_branch = lookup(&first_branch.previous())?;
        }
        while second_branch.block_num() > first_branch.block_num() {
            result.1.push(second_branch.clone());
            second_branch = lookup(&second_branch.previous())?;
        }
        if first_branch.id() == second_branch.id() {
            return Ok(result);
        }
        while first_branch.previous() != second_branch.previous() {
            result.0.push(first_branch.clone());
            result.1.push(second_branch.clone());
            first_branch = lookup(&first_branch.previous())?;
            second_branch = lookup(&second_branch.previous())?;
        }
        result.0.push(first_branch);
        result.1.push(second_branch);
        Ok(result)
    }

    /// Number of blocks above the root
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether only the root is known
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cairn_chain_exports::ChainResult;
    use cairn_hash::Hash;
    use cairn_models::block::BlockHeader;
    use cairn_models::timestamp::BlockTimestamp;
    use std::collections::BTreeSet as Set;
    use tempfile::TempDir;

    fn no_features(_: BlockTimestamp, _: &Set<Hash>, _: &[Hash]) -> ChainResult<()> {
        Ok(())
    }

    /// Block state with a chosen irreversible height, built without schedule checks
    fn block(prev: &BlockState, salt: u8, lib: u32) -> Arc<BlockState> {
        let header = BlockHeader {
            timestamp: prev.timestamp().next(),
            previous: prev.id(),
            transaction_mroot: Hash::compute_from(&[salt]),
            ..Default::default()
        };
        let mut header_state = prev.header_state.clone();
        header_state.id = header.calculate_id().unwrap();
        header_state.block_num = header.block_num();
        header_state.dpos_irreversible_blocknum = lib;
        header_state.header = header.clone();
        Arc::new(BlockState::new(
            header_state,
            Arc::new(SignedBlock::new(header)),
            Vec::new(),
        ))
    }

    fn root() -> Arc<BlockState> {
        let key = cairn_signature::KeyPair::generate().get_public_key();
        let header_state = BlockHeaderState::genesis(
            BlockTimestamp::new(10),
            Default::default(),
            key,
        )
        .unwrap();
        let block = SignedBlock::new(header_state.header.clone());
        Arc::new(BlockState::new(header_state, Arc::new(block), Vec::new()))
    }

    fn new_db(dir: &TempDir) -> ForkDatabase {
        ForkDatabase::open(dir.path(), &no_features).unwrap()
    }

    #[test]
    fn head_follows_validated_blocks() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let genesis = root();
        db.reset(genesis.clone());
        let a = block(&genesis, 1, 0);
        db.add(a.clone(), false).unwrap();
        assert_eq!(db.head().unwrap().id(), genesis.id());
        assert_eq!(db.pending_head().unwrap().id(), a.id());

        db.mark_valid(&a).unwrap();
        assert_eq!(db.head().unwrap().id(), a.id());
        assert_eq!(db.pending_head().unwrap().id(), a.id());

        assert_matches!(db.add(a.clone(), false), Err(ChainError::ForkDatabase(_)));
        db.add(a.clone(), true).unwrap();

        let orphan = block(&block(&a, 9, 0), 2, 0);
        assert_matches!(db.add(orphan, false), Err(ChainError::UnlinkableBlock(_)));
    }

    #[test]
    fn pending_head_prefers_higher_irreversibility() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let genesis = root();
        db.reset(genesis.clone());
        let a1 = block(&genesis, 1, 0);
        let a2 = block(&a1, 1, 0);
        db.add(a1.clone(), false).unwrap();
        db.mark_valid(&a1).unwrap();
        db.add(a2.clone(), false).unwrap();
        db.mark_valid(&a2).unwrap();

        // shorter branch carrying a higher irreversible height wins
        let b1 = block(&genesis, 2, 1);
        db.add(b1.clone(), false).unwrap();
        assert_eq!(db.head().unwrap().id(), a2.id());
        assert_eq!(db.pending_head().unwrap().id(), b1.id());

        let (apply, undo) = db.fetch_branch_from(&b1.id(), &a2.id()).unwrap();
        assert_eq!(apply.iter().map(|b| b.id()).collect::<Vec<_>>(), vec![b1.id()]);
        assert_eq!(
            undo.iter().map(|b| b.id()).collect::<Vec<_>>(),
            vec![a2.id(), a1.id()]
        );
    }

    #[test]
    fn remove_and_advance_root_prune_branches() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let genesis = root();
        db.reset(genesis.clone());
        let a1 = block(&genesis, 1, 0);
        let a2 = block(&a1, 1, 0);
        let b1 = block(&genesis, 2, 0);
        let b2 = block(&b1, 2, 0);
        for bsp in [&a1, &a2, &b1, &b2] {
            db.add((*bsp).clone(), false).unwrap();
        }
        db.mark_valid(&a1).unwrap();
        db.mark_valid(&a2).unwrap();
        assert_matches!(db.remove(&a1.id()), Err(ChainError::ForkDatabase(_)));

        db.remove(&b1.id()).unwrap();
        assert!(db.get_block(&b2.id()).is_none());
        db.add(b1.clone(), false).unwrap();

        assert_matches!(db.advance_root(&b1.id()), Err(ChainError::ForkDatabase(_)));
        db.advance_root(&a1.id()).unwrap();
        assert_eq!(db.root().unwrap().id(), a1.id());
        assert!(db.get_block(&b1.id()).is_none());
        assert!(db.get_block(&a1.id()).is_none());
        assert_eq!(db.len(), 1);
        assert_eq!(db.fetch_branch(&a2.id(), u32::MAX).len(), 1);

        db.rollback_head_to_root();
        assert_eq!(db.head().unwrap().id(), a1.id());
        assert!(!a2.is_valid());
        assert_eq!(db.pending_head().unwrap().id(), a2.id());
    }

    #[test]
    fn close_and_reopen() {
        let dir = TempDir::new().unwrap();
        let genesis = root();
        let a1 = block(&genesis, 1, 0);
        let a2 = block(&a1, 1, 0);
        {
            let mut db = new_db(&dir);
            db.reset(genesis.clone());
            db.add(a1.clone(), false).unwrap();
            db.mark_valid(&a1).unwrap();
            db.add(a2.clone(), false).unwrap();
            db.close().unwrap();
        }
        assert!(dir.path().join(FORK_DB_FILE_NAME).exists());
        let db = new_db(&dir);
        assert!(!dir.path().join(FORK_DB_FILE_NAME).exists());
        assert_eq!(db.root().unwrap().id(), genesis.id());
        assert_eq!(db.head().unwrap().id(), a1.id());
        assert_eq!(db.pending_head().unwrap().id(), a2.id());
        assert!(!db.get_block(&a2.id()).unwrap().is_valid());
    }
}
