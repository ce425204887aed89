// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>
//! Chain settings and configuration
//! --------------------------------
//!
//! * settings: what the operator writes in `chain.toml` (or overrides through `CAIRN__*`
//!   environment variables)
//! * config: settings merged with the genesis state and the values the node computes, handed
//!   to the controller at construction
//!
//! Sizes are in bytes. Lists of names are parsed with `Name::from_str`, keys with the
//! bs58-check public key format.

use crate::{ChainError, ChainResult, DbReadMode, ValidationMode};
use cairn_models::genesis::GenesisState;
use cairn_models::name::Name;
use cairn_signature::PublicKey;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default capacity of the state store
pub const DEFAULT_STATE_SIZE: u64 = 1024 * 1024 * 1024;
/// Default free space below which the state store refuses new work
pub const DEFAULT_STATE_GUARD_SIZE: u64 = 128 * 1024 * 1024;
/// Default capacity of the reversible block store
pub const DEFAULT_REVERSIBLE_CACHE_SIZE: u64 = 340 * 1024 * 1024;
/// Default free space below which the reversible store refuses new blocks
pub const DEFAULT_REVERSIBLE_GUARD_SIZE: u64 = 2 * 1024 * 1024;
/// Default size of the block verification pool
pub const DEFAULT_THREAD_POOL_SIZE: usize = 2;
/// Default limit of inline actions sent by non-privileged contracts
pub const DEFAULT_MAX_NONPRIVILEGED_INLINE_ACTION_SIZE: u32 = 4 * 1024;
/// Name of the environment prefix for settings overrides
pub const SETTINGS_ENV_PREFIX: &str = "CAIRN";
/// Sub-directory of the data directory holding the block log
pub const DEFAULT_BLOCKS_DIR_NAME: &str = "blocks";
/// Sub-directory of the data directory holding the state
pub const DEFAULT_STATE_DIR_NAME: &str = "state";

fn default_state_size() -> u64 {
    DEFAULT_STATE_SIZE
}
fn default_state_guard_size() -> u64 {
    DEFAULT_STATE_GUARD_SIZE
}
fn default_reversible_cache_size() -> u64 {
    DEFAULT_REVERSIBLE_CACHE_SIZE
}
fn default_reversible_guard_size() -> u64 {
    DEFAULT_REVERSIBLE_GUARD_SIZE
}
fn default_thread_pool_size() -> usize {
    DEFAULT_THREAD_POOL_SIZE
}
fn default_max_inline_action_size() -> u32 {
    DEFAULT_MAX_NONPRIVILEGED_INLINE_ACTION_SIZE
}

/// User facing chain settings
#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
    /// data directory; `blocks` and `state` default to sub-directories of it
    pub data_dir: PathBuf,
    /// block log directory
    pub blocks_dir: Option<PathBuf>,
    /// state directory
    pub state_dir: Option<PathBuf>,
    /// genesis JSON file, required when the block log does not exist yet
    pub genesis_json: Option<PathBuf>,
    /// state store capacity
    #[serde(default = "default_state_size")]
    pub state_size: u64,
    /// state store guard
    #[serde(default = "default_state_guard_size")]
    pub state_guard_size: u64,
    /// reversible store capacity
    #[serde(default = "default_reversible_cache_size")]
    pub reversible_cache_size: u64,
    /// reversible store guard
    #[serde(default = "default_reversible_guard_size")]
    pub reversible_guard_size: u64,
    /// refuse every state mutation except block application
    #[serde(default)]
    pub read_only: bool,
    /// `speculative`, `irreversible` or `read-only`
    #[serde(default)]
    pub read_mode: DbReadMode,
    /// `full` or `light`
    #[serde(default)]
    pub validation_mode: ValidationMode,
    /// check everything even on replay
    #[serde(default)]
    pub force_all_checks: bool,
    /// run every check on blocks replayed from the block log
    #[serde(default)]
    pub disable_replay_opts: bool,
    /// print contract console output
    #[serde(default)]
    pub contracts_console: bool,
    /// let notified contracts bill RAM
    #[serde(default)]
    pub allow_ram_billing_in_notify: bool,
    /// disable every subjective mitigation
    #[serde(default)]
    pub disable_all_subjective_mitigations: bool,
    /// size of the block verification pool
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    /// inline action size limit for non-privileged contracts
    #[serde(default = "default_max_inline_action_size")]
    pub max_nonprivileged_inline_action_size: u32,
    /// accounts whose transactions bypass the white and black lists
    #[serde(default)]
    pub sender_bypass_whiteblacklist: Vec<String>,
    /// only these actors may authorize transactions
    #[serde(default)]
    pub actor_whitelist: Vec<String>,
    /// these actors may not authorize transactions
    #[serde(default)]
    pub actor_blacklist: Vec<String>,
    /// only these contracts may be called
    #[serde(default)]
    pub contract_whitelist: Vec<String>,
    /// these contracts may not be called
    #[serde(default)]
    pub contract_blacklist: Vec<String>,
    /// `contract::action` pairs that may not be called
    #[serde(default)]
    pub action_blacklist: Vec<String>,
    /// keys that may not sign transactions
    #[serde(default)]
    pub key_blacklist: Vec<String>,
    /// accounts limited to their own resources
    #[serde(default)]
    pub resource_greylist: Vec<String>,
    /// producers whose blocks are applied with light validation
    #[serde(default)]
    pub trusted_producers: Vec<String>,
}

impl ChainSettings {
    /// Load settings from `path`, an optional override file, then `CAIRN__` environment
    /// variables (`CAIRN__READ_MODE=irreversible`)
    pub fn load(path: &Path, override_path: Option<&Path>) -> ChainResult<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from(path));
        if let Some(override_path) = override_path {
            builder = builder.add_source(config::File::from(override_path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(SETTINGS_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Runtime configuration of the controller
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// block log and reversible store directory
    pub blocks_dir: PathBuf,
    /// state store and fork database directory
    pub state_dir: PathBuf,
    /// state store capacity
    pub state_size: u64,
    /// state store guard
    pub state_guard_size: u64,
    /// reversible store capacity
    pub reversible_cache_size: u64,
    /// reversible store guard
    pub reversible_guard_size: u64,
    /// refuse transactions, only apply blocks
    pub read_only: bool,
    /// read mode
    pub read_mode: DbReadMode,
    /// validation mode
    pub block_validation_mode: ValidationMode,
    /// check everything even on replay
    pub force_all_checks: bool,
    /// run every check on blocks replayed from the block log
    pub disable_replay_opts: bool,
    /// print contract console output
    pub contracts_console: bool,
    /// let notified contracts bill RAM
    pub allow_ram_billing_in_notify: bool,
    /// disable every subjective mitigation
    pub disable_all_subjective_mitigations: bool,
    /// size of the block verification pool
    pub thread_pool_size: usize,
    /// inline action size limit for non-privileged contracts
    pub max_nonprivileged_inline_action_size: u32,
    /// genesis state, used when the block log is empty
    pub genesis: GenesisState,
    /// accounts bypassing the white and black lists
    pub sender_bypass_whiteblacklist: BTreeSet<Name>,
    /// actor whitelist
    pub actor_whitelist: BTreeSet<Name>,
    /// actor blacklist
    pub actor_blacklist: BTreeSet<Name>,
    /// contract whitelist
    pub contract_whitelist: BTreeSet<Name>,
    /// contract blacklist
    pub contract_blacklist: BTreeSet<Name>,
    /// `(contract, action)` blacklist
    pub action_blacklist: BTreeSet<(Name, Name)>,
    /// key blacklist
    pub key_blacklist: BTreeSet<PublicKey>,
    /// accounts limited to their own resources
    pub resource_greylist: BTreeSet<Name>,
    /// producers trusted for light validation
    pub trusted_producers: BTreeSet<Name>,
}

fn parse_names(values: &[String]) -> ChainResult<BTreeSet<Name>> {
    values
        .iter()
        .map(|value| {
            Name::from_str(value)
                .map_err(|err| ChainError::ConfigError(format!("invalid name {}: {}", value, err)))
        })
        .collect()
}

fn parse_actions(values: &[String]) -> ChainResult<BTreeSet<(Name, Name)>> {
    values
        .iter()
        .map(|value| {
            let (code, action) = value.split_once("::").ok_or_else(|| {
                ChainError::ConfigError(format!("action {} must be code::action", value))
            })?;
            let parse = |s: &str| {
                Name::from_str(s).map_err(|err| {
                    ChainError::ConfigError(format!("invalid name {}: {}", s, err))
                })
            };
            Ok((parse(code)?, parse(action)?))
        })
        .collect()
}

fn parse_keys(values: &[String]) -> ChainResult<BTreeSet<PublicKey>> {
    values
        .iter()
        .map(|value| PublicKey::from_bs58_check(value).map_err(ChainError::from))
        .collect()
}

impl ChainConfig {
    /// Build the configuration from user settings. The genesis state is read from the
    /// settings' genesis file when given, otherwise `genesis` is used.
    pub fn from_settings(settings: &ChainSettings, genesis: Option<GenesisState>) -> ChainResult<Self> {
        let genesis = match (&settings.genesis_json, genesis) {
            (Some(path), _) => GenesisState::from_json_file(path)?,
            (None, Some(genesis)) => genesis,
            (None, None) => {
                return Err(ChainError::ConfigError(
                    "a genesis state or genesis_json is required".to_string(),
                ))
            }
        };
        genesis.initial_configuration.validate()?;
        if settings.thread_pool_size == 0 {
            return Err(ChainError::ConfigError(
                "thread_pool_size must be at least 1".to_string(),
            ));
        }
        Ok(ChainConfig {
            blocks_dir: settings
                .blocks_dir
                .clone()
                .unwrap_or_else(|| settings.data_dir.join(DEFAULT_BLOCKS_DIR_NAME)),
            state_dir: settings
                .state_dir
                .clone()
                .unwrap_or_else(|| settings.data_dir.join(DEFAULT_STATE_DIR_NAME)),
            state_size: settings.state_size,
            state_guard_size: settings.state_guard_size,
            reversible_cache_size: settings.reversible_cache_size,
            reversible_guard_size: settings.reversible_guard_size,
            read_only: settings.read_only,
            read_mode: settings.read_mode,
            block_validation_mode: settings.validation_mode,
            force_all_checks: settings.force_all_checks,
            disable_replay_opts: settings.disable_replay_opts,
            contracts_console: settings.contracts_console,
            allow_ram_billing_in_notify: settings.allow_ram_billing_in_notify,
            disable_all_subjective_mitigations: settings.disable_all_subjective_mitigations,
            thread_pool_size: settings.thread_pool_size,
            max_nonprivileged_inline_action_size: settings.max_nonprivileged_inline_action_size,
            genesis,
            sender_bypass_whiteblacklist: parse_names(&settings.sender_bypass_whiteblacklist)?,
            actor_whitelist: parse_names(&settings.actor_whitelist)?,
            actor_blacklist: parse_names(&settings.actor_blacklist)?,
            contract_whitelist: parse_names(&settings.contract_whitelist)?,
            contract_blacklist: parse_names(&settings.contract_blacklist)?,
            action_blacklist: parse_actions(&settings.action_blacklist)?,
            key_blacklist: parse_keys(&settings.key_blacklist)?,
            resource_greylist: parse_names(&settings.resource_greylist)?,
            trusted_producers: parse_names(&settings.trusted_producers)?,
        })
    }

    /// Configuration with default values rooted at `dir`
    pub fn default_for_path(dir: &Path, genesis: GenesisState) -> Self {
        ChainConfig {
            blocks_dir: dir.join(DEFAULT_BLOCKS_DIR_NAME),
            state_dir: dir.join(DEFAULT_STATE_DIR_NAME),
            state_size: DEFAULT_STATE_SIZE,
            state_guard_size: DEFAULT_STATE_GUARD_SIZE,
            reversible_cache_size: DEFAULT_REVERSIBLE_CACHE_SIZE,
            reversible_guard_size: DEFAULT_REVERSIBLE_GUARD_SIZE,
            read_only: false,
            read_mode: DbReadMode::Speculative,
            block_validation_mode: ValidationMode::Full,
            force_all_checks: false,
            disable_replay_opts: false,
            contracts_console: false,
            allow_ram_billing_in_notify: false,
            disable_all_subjective_mitigations: false,
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            max_nonprivileged_inline_action_size: DEFAULT_MAX_NONPRIVILEGED_INLINE_ACTION_SIZE,
            genesis,
            sender_bypass_whiteblacklist: BTreeSet::new(),
            actor_whitelist: BTreeSet::new(),
            actor_blacklist: BTreeSet::new(),
            contract_whitelist: BTreeSet::new(),
            contract_blacklist: BTreeSet::new(),
            action_blacklist: BTreeSet::new(),
            key_blacklist: BTreeSet::new(),
            resource_greylist: BTreeSet::new(),
            trusted_producers: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_models::timestamp::BlockTimestamp;
    use cairn_signature::KeyPair;
    use std::io::Write;

    #[test]
    fn settings_file_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyPair::generate().get_public_key();
        let genesis = GenesisState::new(BlockTimestamp::new(10), key);
        let genesis_path = dir.path().join("genesis.json");
        std::fs::write(&genesis_path, genesis.to_json().unwrap()).unwrap();

        let settings_path = dir.path().join("chain.toml");
        let mut file = std::fs::File::create(&settings_path).unwrap();
        writeln!(
            file,
            "data_dir = {:?}\ngenesis_json = {:?}\nread_mode = \"irreversible\"\nactor_blacklist = [\"bob\"]\naction_blacklist = [\"token::transfer\"]\nkey_blacklist = [\"{}\"]",
            dir.path().join("data"),
            genesis_path,
            key
        )
        .unwrap();
        drop(file);

        let settings = ChainSettings::load(&settings_path, None).unwrap();
        assert_eq!(settings.state_size, DEFAULT_STATE_SIZE);
        let config = ChainConfig::from_settings(&settings, None).unwrap();
        assert_eq!(config.read_mode, DbReadMode::Irreversible);
        assert_eq!(config.genesis, genesis);
        assert_eq!(config.blocks_dir, dir.path().join("data").join("blocks"));
        assert!(config.actor_blacklist.contains(&Name::from_static("bob")));
        assert!(config
            .action_blacklist
            .contains(&(Name::from_static("token"), Name::from_static("transfer"))));
        assert!(config.key_blacklist.contains(&key));
    }

    #[test]
    fn missing_genesis_is_rejected() {
        let settings: ChainSettings = serde_json::from_str(r#"{"data_dir": "/tmp/x"}"#).unwrap();
        assert!(ChainConfig::from_settings(&settings, None).is_err());
    }
}
