// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

/// Hash size
pub const HASH_SIZE_BYTES: usize = 32;
