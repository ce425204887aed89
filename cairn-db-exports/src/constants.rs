// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

// Singletons
pub const GLOBAL_PROPERTY_KEY: &[u8] = b"global_property";
pub const DYNAMIC_GLOBAL_PROPERTY_KEY: &[u8] = b"dynamic_global_property";
pub const PROTOCOL_STATE_KEY: &[u8] = b"protocol_state";
pub const RESOURCE_LIMITS_CONFIG_KEY: &[u8] = b"resource_limits_config";
pub const RESOURCE_LIMITS_STATE_KEY: &[u8] = b"resource_limits_state";

// Prefixes
pub const ACCOUNT_PREFIX: &str = "account/";
pub const ACCOUNT_METADATA_PREFIX: &str = "account_metadata/";
pub const PERMISSION_PREFIX: &str = "permission/";
pub const PERMISSION_LINK_PREFIX: &str = "permission_link/";
pub const CONTRACT_ROW_PREFIX: &str = "contract_row/";
pub const BLOCK_SUMMARY_PREFIX: &str = "block_summary/";
pub const TRANSACTION_PREFIX: &str = "transaction/";
pub const GENERATED_TRANSACTION_PREFIX: &str = "generated_transaction/";
pub const RESOURCE_LIMITS_PREFIX: &str = "resource_limits/";
pub const RESOURCE_USAGE_PREFIX: &str = "resource_usage/";
pub const ACCOUNT_RAM_CORRECTION_PREFIX: &str = "account_ram_correction/";

// File names
pub const STATE_FILE_NAME: &str = "state.bin";

// Errors
pub const OBJECT_SER_ERROR: &str = "state object serialization failed";
pub const OBJECT_DESER_ERROR: &str = "state object deserialization failed";

/// Concatenate a prefix and key parts
pub fn make_key(prefix: &str, parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + parts.iter().map(|p| p.len()).sum::<usize>());
    key.extend_from_slice(prefix.as_bytes());
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}
