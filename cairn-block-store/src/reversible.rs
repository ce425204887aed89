// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::BlockStoreError;
use cairn_models::block::SignedBlock;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use tracing::debug;

/// Name of the RocksDB directory under the blocks directory
pub const REVERSIBLE_DIR_NAME: &str = "reversible";

/// Applied but not yet irreversible blocks, keyed by block number
pub struct ReversibleBlockStore {
    db: DB,
    /// capacity in bytes
    cache_size: u64,
    used_bytes: u64,
}

impl std::fmt::Debug for ReversibleBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReversibleBlockStore")
            .field("cache_size", &self.cache_size)
            .field("used_bytes", &self.used_bytes)
            .finish()
    }
}

fn key_of(block_num: u32) -> [u8; 4] {
    block_num.to_be_bytes()
}

fn num_of(key: &[u8]) -> Result<u32, BlockStoreError> {
    let bytes: [u8; 4] = key
        .try_into()
        .map_err(|_| BlockStoreError::Corrupted(format!("bad reversible key {:?}", key)))?;
    Ok(u32::from_be_bytes(bytes))
}

impl ReversibleBlockStore {
    /// Open (or create) the store under `blocks_dir`
    pub fn open(blocks_dir: &Path, cache_size: u64) -> Result<Self, BlockStoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        let db = DB::open(&db_opts, blocks_dir.join(REVERSIBLE_DIR_NAME))?;
        let mut used_bytes = 0u64;
        for item in db.iterator(IteratorMode::Start) {
            let (key, value) = item?;
            used_bytes += (key.len() + value.len()) as u64;
        }
        Ok(ReversibleBlockStore {
            db,
            cache_size,
            used_bytes,
        })
    }

    /// Store a block, replacing any block at the same height
    pub fn put(&mut self, block: &SignedBlock) -> Result<(), BlockStoreError> {
        let key = key_of(block.block_num());
        if let Some(old) = self.db.get(key)? {
            self.used_bytes = self.used_bytes.saturating_sub((key.len() + old.len()) as u64);
        }
        let bytes = block.to_bytes()?;
        self.used_bytes += (key.len() + bytes.len()) as u64;
        self.db.put(key, bytes)?;
        Ok(())
    }

    /// Block at a height
    pub fn get(&self, block_num: u32) -> Result<Option<SignedBlock>, BlockStoreError> {
        match self.db.get(key_of(block_num))? {
            Some(bytes) => Ok(Some(SignedBlock::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove the block at a height
    pub fn remove(&mut self, block_num: u32) -> Result<(), BlockStoreError> {
        let key = key_of(block_num);
        if let Some(old) = self.db.get(key)? {
            self.used_bytes = self.used_bytes.saturating_sub((key.len() + old.len()) as u64);
            self.db.delete(key)?;
        }
        Ok(())
    }

    /// Remove every block at or below a height
    pub fn remove_up_to(&mut self, block_num: u32) -> Result<(), BlockStoreError> {
        let mut batch = WriteBatch::default();
        let mut freed = 0u64;
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item?;
            if num_of(&key)? > block_num {
                break;
            }
            freed += (key.len() + value.len()) as u64;
            batch.delete(key);
        }
        self.db.write(batch)?;
        self.used_bytes = self.used_bytes.saturating_sub(freed);
        debug!("pruned reversible blocks up to {}", block_num);
        Ok(())
    }

    /// Lowest stored height
    pub fn first_block_num(&self) -> Result<Option<u32>, BlockStoreError> {
        match self.db.iterator(IteratorMode::Start).next() {
            Some(item) => Ok(Some(num_of(&item?.0)?)),
            None => Ok(None),
        }
    }

    /// Highest stored height
    pub fn last_block_num(&self) -> Result<Option<u32>, BlockStoreError> {
        match self.db.iterator(IteratorMode::End).next() {
            Some(item) => Ok(Some(num_of(&item?.0)?)),
            None => Ok(None),
        }
    }

    /// Blocks from a height upwards, in order
    pub fn blocks_from(&self, block_num: u32) -> Result<Vec<SignedBlock>, BlockStoreError> {
        let start = key_of(block_num);
        let mut blocks = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward))
        {
            let (_, value) = item?;
            blocks.push(SignedBlock::from_bytes(&value)?);
        }
        Ok(blocks)
    }

    /// Bytes stored
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    /// Bytes left before the configured capacity
    pub fn free_bytes(&self) -> u64 {
        self.cache_size.saturating_sub(self.used_bytes)
    }

    /// Force pending writes to disk
    pub fn flush(&self) -> Result<(), BlockStoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_models::{block::BlockHeader, block_id::BlockId};
    use cairn_hash::Hash;
    use tempfile::TempDir;

    fn block_at(num: u32) -> SignedBlock {
        SignedBlock::new(BlockHeader {
            previous: BlockId::new(Hash::compute_from(&num.to_le_bytes()), num - 1),
            ..Default::default()
        })
    }

    #[test]
    fn store_prune_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = ReversibleBlockStore::open(dir.path(), 1 << 20).unwrap();
            for num in 2..=6 {
                store.put(&block_at(num)).unwrap();
            }
            assert_eq!(store.first_block_num().unwrap(), Some(2));
            assert_eq!(store.last_block_num().unwrap(), Some(6));
            store.remove_up_to(3).unwrap();
            store.remove(6).unwrap();
            assert_eq!(store.get(3).unwrap(), None);
            assert_eq!(store.get(4).unwrap().unwrap(), block_at(4));
        }
        let store = ReversibleBlockStore::open(dir.path(), 1 << 20).unwrap();
        let nums: Vec<u32> = store
            .blocks_from(0)
            .unwrap()
            .iter()
            .map(|b| b.block_num())
            .collect();
        assert_eq!(nums, vec![4, 5]);
        assert!(store.used_bytes() > 0);
        assert!(store.free_bytes() < 1 << 20);
    }
}
