// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::BlockStoreError;
use cairn_models::{block::SignedBlock, block_id::BlockId, genesis::GenesisState};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Version written in the log header
pub const BLOCK_LOG_VERSION: u32 = 1;
/// Name of the log file
pub const BLOCK_LOG_FILE_NAME: &str = "blocks.log";
/// Name of the index file
pub const BLOCK_INDEX_FILE_NAME: &str = "blocks.index";

/// Append-only log of irreversible blocks.
///
/// `blocks.log`: header (`u32` version, `u32` first block number, `u32` genesis JSON length,
/// genesis JSON), then one entry per block (`u32` length, serialized block, `u64` offset of the
/// entry start). All integers are little-endian. The trailing offset lets a reader walk the log
/// backwards and detect a torn final entry.
///
/// `blocks.index`: the `u64` entry offset of every block, in order.
pub struct BlockLog {
    log_path: PathBuf,
    index_path: PathBuf,
    header: Option<LogHeader>,
    offsets: Vec<u64>,
    head: Option<SignedBlock>,
    head_id: Option<BlockId>,
}

#[derive(Clone, Debug)]
struct LogHeader {
    first_block_num: u32,
    genesis: GenesisState,
    /// offset of the first entry
    data_start: u64,
}

fn read_u32(file: &mut File) -> Result<u32, std::io::Error> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(file: &mut File) -> Result<u64, std::io::Error> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

impl BlockLog {
    /// Open the log in `dir`, truncating a torn trailing entry and rebuilding the index
    /// when it does not match the log
    pub fn open(dir: &Path) -> Result<Self, BlockStoreError> {
        std::fs::create_dir_all(dir)?;
        let mut log = BlockLog {
            log_path: dir.join(BLOCK_LOG_FILE_NAME),
            index_path: dir.join(BLOCK_INDEX_FILE_NAME),
            header: None,
            offsets: Vec::new(),
            head: None,
            head_id: None,
        };
        let log_len = match std::fs::metadata(&log.log_path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if log_len == 0 {
            return Ok(log);
        }

        let mut file = File::open(&log.log_path)?;
        let version = read_u32(&mut file)?;
        if version != BLOCK_LOG_VERSION {
            return Err(BlockStoreError::Corrupted(format!(
                "unsupported block log version {}",
                version
            )));
        }
        let first_block_num = read_u32(&mut file)?;
        let genesis_len = read_u32(&mut file)? as usize;
        let mut genesis_bytes = vec![0u8; genesis_len];
        file.read_exact(&mut genesis_bytes)?;
        let genesis_json = String::from_utf8(genesis_bytes)
            .map_err(|err| BlockStoreError::Corrupted(format!("genesis is not utf-8: {}", err)))?;
        let genesis = GenesisState::from_json(&genesis_json)?;
        let data_start = 12 + genesis_len as u64;

        // walk the entries forward
        let mut offsets = Vec::new();
        let mut pos = data_start;
        let mut valid_end = data_start;
        while pos + 4 <= log_len {
            file.seek(SeekFrom::Start(pos))?;
            let len = read_u32(&mut file)? as u64;
            let entry_end = pos + 4 + len + 8;
            if entry_end > log_len {
                break;
            }
            file.seek(SeekFrom::Start(pos + 4 + len))?;
            if read_u64(&mut file)? != pos {
                break;
            }
            offsets.push(pos);
            valid_end = entry_end;
            pos = entry_end;
        }
        drop(file);
        if valid_end < log_len {
            warn!(
                "truncating {} trailing bytes of a partial block log entry",
                log_len - valid_end
            );
            OpenOptions::new()
                .write(true)
                .open(&log.log_path)?
                .set_len(valid_end)?;
        }

        log.header = Some(LogHeader {
            first_block_num,
            genesis,
            data_start,
        });
        log.offsets = offsets;
        if !log.index_matches()? {
            info!("rebuilding block index ({} blocks)", log.offsets.len());
            log.write_index()?;
        }
        log.load_head()?;
        Ok(log)
    }

    fn index_matches(&self) -> Result<bool, BlockStoreError> {
        let bytes = match std::fs::read(&self.index_path) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        if bytes.len() != self.offsets.len() * 8 {
            return Ok(false);
        }
        Ok(bytes
            .chunks_exact(8)
            .zip(self.offsets.iter())
            .all(|(chunk, offset)| chunk == offset.to_le_bytes()))
    }

    fn write_index(&self) -> Result<(), BlockStoreError> {
        let mut bytes = Vec::with_capacity(self.offsets.len() * 8);
        for offset in &self.offsets {
            bytes.extend(offset.to_le_bytes());
        }
        std::fs::write(&self.index_path, bytes)?;
        Ok(())
    }

    fn load_head(&mut self) -> Result<(), BlockStoreError> {
        self.head = match self.offsets.last() {
            Some(offset) => Some(self.read_entry(*offset)?),
            None => None,
        };
        self.head_id = match &self.head {
            Some(block) => Some(block.calculate_id()?),
            None => None,
        };
        Ok(())
    }

    fn read_entry(&self, offset: u64) -> Result<SignedBlock, BlockStoreError> {
        let mut file = File::open(&self.log_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let len = read_u32(&mut file)? as usize;
        let mut bytes = vec![0u8; len];
        file.read_exact(&mut bytes)?;
        Ok(SignedBlock::from_bytes(&bytes)?)
    }

    /// Erase the log and start a new one for `genesis` whose first block is `first_block_num`,
    /// optionally appending `first_block`
    pub fn reset(
        &mut self,
        genesis: &GenesisState,
        first_block: Option<&SignedBlock>,
        first_block_num: u32,
    ) -> Result<(), BlockStoreError> {
        let genesis_json = genesis.to_json()?;
        let mut header_bytes = Vec::with_capacity(12 + genesis_json.len());
        header_bytes.extend(BLOCK_LOG_VERSION.to_le_bytes());
        header_bytes.extend(first_block_num.to_le_bytes());
        header_bytes.extend((genesis_json.len() as u32).to_le_bytes());
        header_bytes.extend(genesis_json.as_bytes());
        std::fs::write(&self.log_path, &header_bytes)?;
        std::fs::write(&self.index_path, b"")?;

        self.header = Some(LogHeader {
            first_block_num,
            genesis: genesis.clone(),
            data_start: header_bytes.len() as u64,
        });
        self.offsets.clear();
        self.head = None;
        self.head_id = None;
        if let Some(block) = first_block {
            self.append(block)?;
        }
        Ok(())
    }

    /// Append the next block and return its entry offset
    pub fn append(&mut self, block: &SignedBlock) -> Result<u64, BlockStoreError> {
        let header = self.header.as_ref().ok_or(BlockStoreError::NotInitialized)?;
        let expected = header.first_block_num + self.offsets.len() as u32;
        let block_num = block.block_num();
        if block_num != expected {
            return Err(BlockStoreError::UnexpectedBlockNum {
                expected,
                got: block_num,
            });
        }
        let bytes = block.to_bytes()?;
        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        let mut entry = Vec::with_capacity(bytes.len() + 12);
        entry.extend((bytes.len() as u32).to_le_bytes());
        entry.extend(&bytes);
        entry.extend(offset.to_le_bytes());
        file.write_all(&entry)?;
        file.flush()?;

        let mut index = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.index_path)?;
        index.write_all(&offset.to_le_bytes())?;
        index.flush()?;

        self.offsets.push(offset);
        self.head_id = Some(block.calculate_id()?);
        self.head = Some(block.clone());
        Ok(offset)
    }

    /// Read a block by number
    pub fn read_block_by_num(&self, block_num: u32) -> Result<Option<SignedBlock>, BlockStoreError> {
        let header = match &self.header {
            Some(header) => header,
            None => return Ok(None),
        };
        if block_num < header.first_block_num {
            return Ok(None);
        }
        match self
            .offsets
            .get((block_num - header.first_block_num) as usize)
        {
            Some(offset) => Ok(Some(self.read_entry(*offset)?)),
            None => Ok(None),
        }
    }

    /// Id of a block by number
    pub fn read_block_id_by_num(&self, block_num: u32) -> Result<Option<BlockId>, BlockStoreError> {
        match self.read_block_by_num(block_num)? {
            Some(block) => Ok(Some(block.calculate_id()?)),
            None => Ok(None),
        }
    }

    /// Last appended block
    pub fn head(&self) -> Option<&SignedBlock> {
        self.head.as_ref()
    }

    /// Id of the last appended block
    pub fn head_id(&self) -> Option<BlockId> {
        self.head_id
    }

    /// Number of the last appended block, if any
    pub fn head_block_num(&self) -> Option<u32> {
        self.head.as_ref().map(|block| block.block_num())
    }

    /// Number of the first block the log holds (or will hold)
    pub fn first_block_num(&self) -> u32 {
        self.header
            .as_ref()
            .map(|header| header.first_block_num)
            .unwrap_or(1)
    }

    /// Genesis the log was started with
    pub fn genesis(&self) -> Option<&GenesisState> {
        self.header.as_ref().map(|header| &header.genesis)
    }

    /// Whether the log has a header
    pub fn is_initialized(&self) -> bool {
        self.header.is_some()
    }

    /// Number of blocks held
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether no block was appended
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Size of the log header
    pub fn data_start(&self) -> u64 {
        self.header
            .as_ref()
            .map(|header| header.data_start)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cairn_hash::Hash;
    use cairn_models::{block::BlockHeader, name::Name, timestamp::BlockTimestamp};
    use cairn_signature::KeyPair;
    use tempfile::TempDir;

    fn genesis() -> GenesisState {
        GenesisState::new(
            BlockTimestamp::new(100),
            KeyPair::from_seed(&[1u8; 32]).get_public_key(),
        )
    }

    fn chain(len: u32) -> Vec<SignedBlock> {
        let mut blocks = Vec::new();
        let mut previous = BlockId::zero();
        for i in 0..len {
            let block = SignedBlock::new(BlockHeader {
                timestamp: BlockTimestamp::new(100 + i),
                producer: Name::from_static("cairn"),
                previous,
                transaction_mroot: Hash::compute_from(&i.to_le_bytes()),
                ..Default::default()
            });
            previous = block.calculate_id().unwrap();
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let blocks = chain(3);
        let mut log = BlockLog::open(dir.path()).unwrap();
        assert!(!log.is_initialized());
        assert_matches!(log.append(&blocks[0]), Err(BlockStoreError::NotInitialized));
        log.reset(&genesis(), Some(&blocks[0]), 1).unwrap();
        log.append(&blocks[1]).unwrap();
        assert_matches!(
            log.append(&blocks[1]),
            Err(BlockStoreError::UnexpectedBlockNum { expected: 3, got: 2 })
        );
        log.append(&blocks[2]).unwrap();

        assert_eq!(log.read_block_by_num(2).unwrap().unwrap(), blocks[1]);
        assert_eq!(log.read_block_by_num(4).unwrap(), None);
        assert_eq!(log.head_block_num(), Some(3));

        let reopened = BlockLog::open(dir.path()).unwrap();
        assert_eq!(reopened.head_id(), Some(blocks[2].calculate_id().unwrap()));
        assert_eq!(reopened.genesis(), Some(&genesis()));
        assert_eq!(reopened.first_block_num(), 1);
    }

    #[test]
    fn torn_entry_is_truncated_and_index_rebuilt() {
        let dir = TempDir::new().unwrap();
        let blocks = chain(3);
        {
            let mut log = BlockLog::open(dir.path()).unwrap();
            log.reset(&genesis(), None, 1).unwrap();
            for block in &blocks {
                log.append(block).unwrap();
            }
        }
        let log_path = dir.path().join(BLOCK_LOG_FILE_NAME);
        let len = std::fs::metadata(&log_path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&log_path)
            .unwrap()
            .set_len(len - 5)
            .unwrap();
        std::fs::remove_file(dir.path().join(BLOCK_INDEX_FILE_NAME)).unwrap();

        let log = BlockLog::open(dir.path()).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.head().unwrap(), &blocks[1]);
        assert_eq!(
            std::fs::metadata(dir.path().join(BLOCK_INDEX_FILE_NAME))
                .unwrap()
                .len(),
            16
        );
    }

    #[test]
    fn log_started_from_snapshot_height() {
        let dir = TempDir::new().unwrap();
        let blocks = chain(6);
        let mut log = BlockLog::open(dir.path()).unwrap();
        log.reset(&genesis(), None, 6).unwrap();
        assert!(log.is_empty());
        log.append(&blocks[5]).unwrap();
        assert_eq!(log.read_block_by_num(5).unwrap(), None);
        assert_eq!(log.read_block_by_num(6).unwrap().unwrap(), blocks[5]);
    }
}
