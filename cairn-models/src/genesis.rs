// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::error::ModelsError;
use crate::timestamp::BlockTimestamp;
use cairn_hash::Hash;
use cairn_signature::PublicKey;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Consensus parameters stored in the global properties
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ChainParameters {
    /// maximum net usage of a block, in bytes
    pub max_block_net_usage: u64,
    /// maximum net usage of a transaction, in bytes
    pub max_transaction_net_usage: u32,
    /// net usage billed to every transaction on top of its size
    pub base_per_transaction_net_usage: u32,
    /// maximum billable cpu time of a block
    pub max_block_cpu_usage: u32,
    /// maximum billable cpu time of a transaction
    pub max_transaction_cpu_usage: u32,
    /// minimum billable cpu time of a transaction
    pub min_transaction_cpu_usage: u32,
    /// maximum distance between a block time and a transaction expiration, in seconds
    pub max_transaction_lifetime: u32,
    /// lifetime of a deferred transaction once it may execute, in seconds
    pub deferred_trx_expiration_window: u32,
    /// maximum `delay_sec`
    pub max_transaction_delay: u32,
    /// maximum size of an inline action
    pub max_inline_action_size: u32,
    /// maximum depth of inline actions
    pub max_inline_action_depth: u16,
    /// maximum recursion when resolving permissions
    pub max_authority_depth: u16,
}

impl Default for ChainParameters {
    fn default() -> Self {
        ChainParameters {
            max_block_net_usage: 1024 * 1024,
            max_transaction_net_usage: 512 * 1024,
            base_per_transaction_net_usage: 12,
            max_block_cpu_usage: 200_000,
            max_transaction_cpu_usage: 150_000,
            min_transaction_cpu_usage: 100,
            max_transaction_lifetime: 60 * 60,
            deferred_trx_expiration_window: 10 * 60,
            max_transaction_delay: 45 * 24 * 3600,
            max_inline_action_size: 4 * 1024,
            max_inline_action_depth: 4,
            max_authority_depth: crate::constants::MAX_AUTHORITY_DEPTH,
        }
    }
}

impl ChainParameters {
    /// Reject parameter sets the chain cannot run with
    pub fn validate(&self) -> Result<(), ModelsError> {
        if self.max_transaction_cpu_usage > self.max_block_cpu_usage {
            return Err(ModelsError::InvalidTransaction(
                "max_transaction_cpu_usage must not exceed max_block_cpu_usage".to_string(),
            ));
        }
        if self.max_transaction_net_usage as u64 > self.max_block_net_usage {
            return Err(ModelsError::InvalidTransaction(
                "max_transaction_net_usage must not exceed max_block_net_usage".to_string(),
            ));
        }
        Ok(())
    }
}

/// Initial state of a chain
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GenesisState {
    /// timestamp of the genesis block
    pub initial_timestamp: BlockTimestamp,
    /// owner and active key of the system account, signing key of the initial producer
    pub initial_key: PublicKey,
    /// initial consensus parameters
    pub initial_configuration: ChainParameters,
}

impl GenesisState {
    /// Genesis with default parameters
    pub fn new(initial_timestamp: BlockTimestamp, initial_key: PublicKey) -> Self {
        GenesisState {
            initial_timestamp,
            initial_key,
            initial_configuration: ChainParameters::default(),
        }
    }

    /// Load a JSON genesis file
    pub fn from_json_file(path: &Path) -> Result<Self, ModelsError> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            ModelsError::JsonError(format!("cannot read {}: {}", path.display(), err))
        })?;
        GenesisState::from_json(&content)
    }

    /// Parse the JSON encoding
    pub fn from_json(content: &str) -> Result<Self, ModelsError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Canonical JSON encoding
    pub fn to_json(&self) -> Result<String, ModelsError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Chain id: digest of the canonical encoding
    pub fn compute_chain_id(&self) -> Result<Hash, ModelsError> {
        Ok(Hash::compute_from(self.to_json()?.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_signature::KeyPair;

    #[test]
    fn chain_id_depends_on_genesis() {
        let key = KeyPair::generate().get_public_key();
        let a = GenesisState::new(BlockTimestamp::new(10), key);
        let b = GenesisState::new(BlockTimestamp::new(11), key);
        assert_ne!(a.compute_chain_id().unwrap(), b.compute_chain_id().unwrap());
        let parsed: GenesisState = serde_json::from_str(&a.to_json().unwrap()).unwrap();
        assert_eq!(parsed, a);
    }
}
