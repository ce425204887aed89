// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

//! Snapshot writers and readers.
//!
//! The in-memory pair keeps sections in a map, mostly for tests and for handing a snapshot to
//! another component of the same process. The file pair writes:
//!
//! ```text
//! magic (8 bytes) | version (u32 LE)
//! per section: name length (u32 LE) | name | row count (u64 LE)
//!              per row: key length (u32 LE) | key | value length (u32 LE) | value
//! hash of everything above (32 bytes)
//! ```

use cairn_chain_exports::{
    ChainError, ChainResult, SnapshotReader, SnapshotRow, SnapshotWriter, SNAPSHOT_VERSION,
};
use cairn_hash::{Hash, HASH_SIZE_BYTES};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// First bytes of a snapshot file
pub const SNAPSHOT_FILE_MAGIC: &[u8; 8] = b"CAIRNSNP";

/// Snapshot held in memory
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VariantSnapshot {
    sections: BTreeMap<String, Vec<SnapshotRow>>,
}

/// Writes into a [`VariantSnapshot`]
#[derive(Debug, Default)]
pub struct VariantSnapshotWriter {
    snapshot: VariantSnapshot,
    finalized: bool,
}

impl VariantSnapshotWriter {
    /// Empty writer
    pub fn new() -> Self {
        VariantSnapshotWriter::default()
    }

    /// The snapshot written so far
    pub fn into_snapshot(self) -> VariantSnapshot {
        self.snapshot
    }
}

impl SnapshotWriter for VariantSnapshotWriter {
    fn write_section(
        &mut self,
        name: &str,
        rows: &mut dyn Iterator<Item = SnapshotRow>,
    ) -> ChainResult<()> {
        if self.finalized {
            return Err(ChainError::SnapshotError(
                "cannot write to a finalized snapshot".to_string(),
            ));
        }
        if self.snapshot.sections.contains_key(name) {
            return Err(ChainError::SnapshotError(format!(
                "section {} written twice",
                name
            )));
        }
        self.snapshot
            .sections
            .insert(name.to_string(), rows.collect());
        Ok(())
    }

    fn finalize(&mut self) -> ChainResult<()> {
        self.finalized = true;
        Ok(())
    }
}

/// Reads a [`VariantSnapshot`]
#[derive(Debug)]
pub struct VariantSnapshotReader {
    snapshot: VariantSnapshot,
}

impl VariantSnapshotReader {
    /// Reader over `snapshot`
    pub fn new(snapshot: VariantSnapshot) -> Self {
        VariantSnapshotReader { snapshot }
    }
}

impl SnapshotReader for VariantSnapshotReader {
    fn validate(&self) -> ChainResult<()> {
        for section in [
            cairn_chain_exports::SNAPSHOT_HEADER_SECTION,
            cairn_chain_exports::SNAPSHOT_BLOCK_STATE_SECTION,
            cairn_chain_exports::SNAPSHOT_STATE_SECTION,
        ] {
            if !self.has_section(section) {
                return Err(ChainError::SnapshotError(format!(
                    "snapshot has no {} section",
                    section
                )));
            }
        }
        Ok(())
    }

    fn has_section(&self, name: &str) -> bool {
        self.snapshot.sections.contains_key(name)
    }

    fn read_section(&mut self, name: &str) -> ChainResult<Vec<SnapshotRow>> {
        self.snapshot
            .sections
            .get(name)
            .cloned()
            .ok_or_else(|| ChainError::SnapshotError(format!("snapshot has no {} section", name)))
    }
}

/// Writes a snapshot file
pub struct FileSnapshotWriter {
    path: PathBuf,
    out: BufWriter<File>,
    hashed: Vec<u8>,
}

impl std::fmt::Debug for FileSnapshotWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSnapshotWriter")
            .field("path", &self.path)
            .field("written", &self.hashed.len())
            .finish()
    }
}

impl FileSnapshotWriter {
    /// Create (or truncate) the file at `path` and write the header
    pub fn create(path: &Path) -> ChainResult<Self> {
        let file = File::create(path)?;
        let mut writer = FileSnapshotWriter {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            hashed: Vec::new(),
        };
        writer.write_bytes(SNAPSHOT_FILE_MAGIC)?;
        writer.write_bytes(&SNAPSHOT_VERSION.to_le_bytes())?;
        Ok(writer)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> ChainResult<()> {
        self.out.write_all(bytes)?;
        self.hashed.extend_from_slice(bytes);
        Ok(())
    }

    fn write_sized(&mut self, bytes: &[u8]) -> ChainResult<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| {
            ChainError::SnapshotError(format!("entry of {} bytes is too large", bytes.len()))
        })?;
        self.write_bytes(&len.to_le_bytes())?;
        self.write_bytes(bytes)
    }
}

impl SnapshotWriter for FileSnapshotWriter {
    fn write_section(
        &mut self,
        name: &str,
        rows: &mut dyn Iterator<Item = SnapshotRow>,
    ) -> ChainResult<()> {
        // the row count precedes the rows
        let rows: Vec<SnapshotRow> = rows.collect();
        self.write_sized(name.as_bytes())?;
        self.write_bytes(&(rows.len() as u64).to_le_bytes())?;
        for (key, value) in &rows {
            self.write_sized(key)?;
            self.write_sized(value)?;
        }
        debug!("snapshot section {} written with {} rows", name, rows.len());
        Ok(())
    }

    fn finalize(&mut self) -> ChainResult<()> {
        let digest = Hash::compute_from(&self.hashed);
        self.out.write_all(digest.to_bytes())?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }
}

/// Reads a snapshot file written by [`FileSnapshotWriter`]
#[derive(Debug)]
pub struct FileSnapshotReader {
    path: PathBuf,
    data: Vec<u8>,
    sections: BTreeMap<String, Vec<SnapshotRow>>,
    version: u32,
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> ChainResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ChainError::SnapshotError("truncated snapshot file".to_string()))?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> ChainResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> ChainResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn sized(&mut self) -> ChainResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

impl FileSnapshotReader {
    /// Load the file at `path`. Its integrity is checked by `validate`.
    pub fn open(path: &Path) -> ChainResult<Self> {
        let data = std::fs::read(path)?;
        let mut reader = FileSnapshotReader {
            path: path.to_path_buf(),
            data,
            sections: BTreeMap::new(),
            version: 0,
        };
        reader.parse()?;
        Ok(reader)
    }

    fn body(&self) -> ChainResult<&[u8]> {
        if self.data.len() < SNAPSHOT_FILE_MAGIC.len() + 4 + HASH_SIZE_BYTES {
            return Err(ChainError::SnapshotError(format!(
                "{} is too short to be a snapshot",
                self.path.display()
            )));
        }
        Ok(&self.data[..self.data.len() - HASH_SIZE_BYTES])
    }

    fn parse(&mut self) -> ChainResult<()> {
        let body = self.body()?;
        let mut cursor = Cursor {
            data: body,
            offset: 0,
        };
        if cursor.take(SNAPSHOT_FILE_MAGIC.len())? != SNAPSHOT_FILE_MAGIC {
            return Err(ChainError::SnapshotError(format!(
                "{} is not a snapshot file",
                self.path.display()
            )));
        }
        let version = cursor.u32()?;
        let mut sections = BTreeMap::new();
        while cursor.offset < body.len() {
            let name = String::from_utf8(cursor.sized()?.to_vec()).map_err(|_| {
                ChainError::SnapshotError("section name is not valid utf-8".to_string())
            })?;
            let count = cursor.u64()?;
            let mut rows = Vec::new();
            for _ in 0..count {
                let key = cursor.sized()?.to_vec();
                let value = cursor.sized()?.to_vec();
                rows.push((key, value));
            }
            sections.insert(name, rows);
        }
        self.version = version;
        self.sections = sections;
        Ok(())
    }
}

impl SnapshotReader for FileSnapshotReader {
    fn validate(&self) -> ChainResult<()> {
        let body = self.body()?;
        let expected = Hash::compute_from(body);
        if expected.to_bytes()[..] != self.data[body.len()..] {
            return Err(ChainError::SnapshotError(format!(
                "integrity hash mismatch in {}",
                self.path.display()
            )));
        }
        if self.version != SNAPSHOT_VERSION {
            return Err(ChainError::SnapshotError(format!(
                "unsupported snapshot version {}, expected {}",
                self.version, SNAPSHOT_VERSION
            )));
        }
        Ok(())
    }

    fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    fn read_section(&mut self, name: &str) -> ChainResult<Vec<SnapshotRow>> {
        self.sections
            .remove(name)
            .ok_or_else(|| ChainError::SnapshotError(format!("snapshot has no {} section", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn rows(n: u8) -> Vec<SnapshotRow> {
        (0..n).map(|i| (vec![i], vec![i; i as usize])).collect()
    }

    #[test]
    fn file_snapshot_keeps_sections_and_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.bin");
        let mut writer = FileSnapshotWriter::create(&path).unwrap();
        writer.write_section("first", &mut rows(3).into_iter()).unwrap();
        writer.write_section("empty", &mut std::iter::empty()).unwrap();
        writer.finalize().unwrap();

        let mut reader = FileSnapshotReader::open(&path).unwrap();
        reader.validate().unwrap();
        assert!(reader.has_section("empty"));
        assert!(!reader.has_section("missing"));
        assert_eq!(reader.read_section("first").unwrap(), rows(3));
        assert!(reader.read_section("empty").unwrap().is_empty());
        assert_matches!(reader.read_section("missing"), Err(ChainError::SnapshotError(_)));
    }

    #[test]
    fn corrupted_file_fails_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.bin");
        let mut writer = FileSnapshotWriter::create(&path).unwrap();
        writer.write_section("rows", &mut rows(4).into_iter()).unwrap();
        writer.finalize().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        // flip a byte of the last value, keeping the layout parseable
        let index = bytes.len() - HASH_SIZE_BYTES - 1;
        bytes[index] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();
        let reader = FileSnapshotReader::open(&path).unwrap();
        assert_matches!(reader.validate(), Err(ChainError::SnapshotError(_)));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.bin");
        std::fs::write(&path, b"CAIRN").unwrap();
        assert_matches!(FileSnapshotReader::open(&path), Err(ChainError::SnapshotError(_)));
    }

    #[test]
    fn variant_snapshot_requires_every_section() {
        let mut writer = VariantSnapshotWriter::new();
        writer
            .write_section(cairn_chain_exports::SNAPSHOT_HEADER_SECTION, &mut rows(1).into_iter())
            .unwrap();
        assert_matches!(
            writer.write_section(
                cairn_chain_exports::SNAPSHOT_HEADER_SECTION,
                &mut std::iter::empty()
            ),
            Err(ChainError::SnapshotError(_))
        );
        writer.finalize().unwrap();
        let reader = VariantSnapshotReader::new(writer.into_snapshot());
        assert_matches!(reader.validate(), Err(ChainError::SnapshotError(_)));
    }
}
