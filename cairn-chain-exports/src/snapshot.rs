// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::ChainResult;

/// Version of the snapshot layout
pub const SNAPSHOT_VERSION: u32 = 1;
/// Section holding the snapshot version
pub const SNAPSHOT_HEADER_SECTION: &str = "chain_snapshot_header";
/// Section holding the head block and its header state
pub const SNAPSHOT_BLOCK_STATE_SECTION: &str = "block_state";
/// Section holding every row of the state store
pub const SNAPSHOT_STATE_SECTION: &str = "state";

/// One key / value row
pub type SnapshotRow = (Vec<u8>, Vec<u8>);

/// Sink of an ordered sequence of named sections of rows
pub trait SnapshotWriter {
    /// Write a whole section
    fn write_section(
        &mut self,
        name: &str,
        rows: &mut dyn Iterator<Item = SnapshotRow>,
    ) -> ChainResult<()>;

    /// Flush everything written so far
    fn finalize(&mut self) -> ChainResult<()>;
}

/// Source of the sections written by a `SnapshotWriter`
pub trait SnapshotReader {
    /// Check the integrity and version of the snapshot
    fn validate(&self) -> ChainResult<()>;

    /// Whether a section exists
    fn has_section(&self, name: &str) -> bool;

    /// Rows of a section, in the order they were written
    fn read_section(&mut self, name: &str) -> ChainResult<Vec<SnapshotRow>>;
}
