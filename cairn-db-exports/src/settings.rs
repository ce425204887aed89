// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use std::path::PathBuf;

/// Config structure for a `CairnStateStore`
#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    /// Directory holding the persisted state file
    pub path: PathBuf,
    /// Capacity of the store in bytes (keys plus values)
    pub size: u64,
}
