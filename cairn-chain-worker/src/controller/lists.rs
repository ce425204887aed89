// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use super::Controller;
use cairn_chain_exports::{ChainError, ChainResult};
use cairn_models::name::Name;
use cairn_signature::PublicKey;
use std::collections::BTreeSet;

impl Controller {
    /// Fail when an actor is not whitelisted or is blacklisted
    pub fn check_actor_list(&self, actors: &BTreeSet<Name>) -> ChainResult<()> {
        if actors.is_empty() {
            return Ok(());
        }
        if !self.config.actor_whitelist.is_empty() {
            let missing: Vec<String> = actors
                .difference(&self.config.actor_whitelist)
                .map(|actor| actor.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(ChainError::ActorWhitelist(format!(
                    "authorizing actor(s) in transaction are not on the actor whitelist: {}",
                    missing.join(", ")
                )));
            }
        } else if !self.config.actor_blacklist.is_empty() {
            let blacklisted: Vec<String> = actors
                .intersection(&self.config.actor_blacklist)
                .map(|actor| actor.to_string())
                .collect();
            if !blacklisted.is_empty() {
                return Err(ChainError::ActorBlacklist(format!(
                    "authorizing actor(s) in transaction are on the actor blacklist: {}",
                    blacklisted.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Fail when a contract is not whitelisted or is blacklisted
    pub fn check_contract_list(&self, code: Name) -> ChainResult<()> {
        if !self.config.contract_whitelist.is_empty() {
            if !self.config.contract_whitelist.contains(&code) {
                return Err(ChainError::ContractWhitelist(format!(
                    "account '{}' is not on the contract whitelist",
                    code
                )));
            }
        } else if self.config.contract_blacklist.contains(&code) {
            return Err(ChainError::ContractBlacklist(format!(
                "account '{}' is on the contract blacklist",
                code
            )));
        }
        Ok(())
    }

    /// Fail when `code::action` is blacklisted
    pub fn check_action_list(&self, code: Name, action: Name) -> ChainResult<()> {
        if self.config.action_blacklist.contains(&(code, action)) {
            return Err(ChainError::ActionBlacklist(format!(
                "action '{}::{}' is on the action blacklist",
                code, action
            )));
        }
        Ok(())
    }

    /// Fail when a signing key is blacklisted
    pub fn check_key_list(&self, key: &PublicKey) -> ChainResult<()> {
        if self.config.key_blacklist.contains(key) {
            return Err(ChainError::KeyBlacklist(format!(
                "public key '{}' is on the key blacklist",
                key
            )));
        }
        Ok(())
    }

    /// Whether deferred transactions sent by `sender` skip the lists
    pub fn sender_avoids_whitelist_blacklist_enforcement(&self, sender: Name) -> bool {
        self.config.sender_bypass_whiteblacklist.contains(&sender)
    }

    pub fn set_actor_whitelist(&mut self, list: BTreeSet<Name>) {
        self.config.actor_whitelist = list;
    }

    pub fn set_actor_blacklist(&mut self, list: BTreeSet<Name>) {
        self.config.actor_blacklist = list;
    }

    pub fn set_contract_whitelist(&mut self, list: BTreeSet<Name>) {
        self.config.contract_whitelist = list;
    }

    pub fn set_contract_blacklist(&mut self, list: BTreeSet<Name>) {
        self.config.contract_blacklist = list;
    }

    pub fn set_action_blacklist(&mut self, list: BTreeSet<(Name, Name)>) {
        self.config.action_blacklist = list;
    }

    pub fn set_key_blacklist(&mut self, list: BTreeSet<PublicKey>) {
        self.config.key_blacklist = list;
    }

    pub fn get_actor_whitelist(&self) -> &BTreeSet<Name> {
        &self.config.actor_whitelist
    }

    pub fn get_actor_blacklist(&self) -> &BTreeSet<Name> {
        &self.config.actor_blacklist
    }

    pub fn get_contract_whitelist(&self) -> &BTreeSet<Name> {
        &self.config.contract_whitelist
    }

    pub fn get_contract_blacklist(&self) -> &BTreeSet<Name> {
        &self.config.contract_blacklist
    }

    pub fn get_action_blacklist(&self) -> &BTreeSet<(Name, Name)> {
        &self.config.action_blacklist
    }

    pub fn get_key_blacklist(&self) -> &BTreeSet<PublicKey> {
        &self.config.key_blacklist
    }

    /// Accounts whose cpu and net are limited to their own stake while producing
    pub fn add_resource_greylist(&mut self, name: Name) {
        self.config.resource_greylist.insert(name);
    }

    pub fn remove_resource_greylist(&mut self, name: Name) {
        self.config.resource_greylist.remove(&name);
    }

    pub fn is_resource_greylisted(&self, name: Name) -> bool {
        self.config.resource_greylist.contains(&name)
    }

    pub fn get_resource_greylist(&self) -> &BTreeSet<Name> {
        &self.config.resource_greylist
    }

    /// Record RAM to give back to `account` once `REPLACE_DEFERRED` activates
    pub fn add_to_ram_correction(&self, account: Name, ram_bytes: u64) -> ChainResult<()> {
        self.with_db(|db| {
            self.resource_limits
                .add_to_ram_correction(db, account, ram_bytes)
        })
    }
}
