// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

//! Per-account CPU, NET and RAM accounting.
//!
//! CPU and NET are rate limited: each account owns a share of a virtual capacity
//! proportional to its weight, and its usage is an exponential moving average over a window of
//! blocks. RAM is a quota: `ram_bytes` bounds the bytes of state billed to the account.
//! A negative limit or weight means unlimited.

use cairn_chain_exports::{ChainError, ChainResult};
use cairn_db_exports::{
    make_key, StateDb, ACCOUNT_RAM_CORRECTION_PREFIX, RESOURCE_LIMITS_CONFIG_KEY,
    RESOURCE_LIMITS_PREFIX, RESOURCE_LIMITS_STATE_KEY, RESOURCE_USAGE_PREFIX,
};
use cairn_models::genesis::ChainParameters;
use cairn_models::name::Name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Fixed point precision of the usage averages
pub const RATE_LIMITING_PRECISION: u64 = 1_000_000;
/// Averaging window of account usage: 24h of blocks
pub const ACCOUNT_USAGE_AVERAGE_WINDOW: u32 = 24 * 60 * 60 * 2;
/// How far the virtual capacity may exceed the block limits
pub const VIRTUAL_LIMIT_MULTIPLIER: u64 = 1000;

/// Resource limits of an account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsObject {
    pub owner: Name,
    pub ram_bytes: i64,
    pub net_weight: i64,
    pub cpu_weight: i64,
}

/// Exponential moving average of a usage, in `RATE_LIMITING_PRECISION` units
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAccumulator {
    pub last_ordinal: u32,
    pub value_ex: u64,
    pub consumed: u64,
}

impl UsageAccumulator {
    /// Average usage per window
    pub fn average(&self) -> u64 {
        self.value_ex.div_ceil(RATE_LIMITING_PRECISION)
    }

    /// Decay the average to `ordinal` then account `units`
    pub fn add(&mut self, units: u64, ordinal: u32, window_size: u32) {
        let window = window_size.max(1) as u128;
        if self.last_ordinal != ordinal {
            let elapsed = ordinal.saturating_sub(self.last_ordinal) as u128;
            if elapsed < window {
                let precision = RATE_LIMITING_PRECISION as u128;
                let decay = precision * elapsed / window;
                self.value_ex = (self.value_ex as u128 * (precision - decay) / precision) as u64;
            } else {
                self.value_ex = 0;
            }
            self.last_ordinal = ordinal;
            self.consumed = self.average();
        }
        self.consumed = self.consumed.saturating_add(units);
        let added = units as u128 * RATE_LIMITING_PRECISION as u128 / window;
        self.value_ex = self.value_ex.saturating_add(added as u64);
    }
}

/// Usage of an account
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageObject {
    pub owner: Name,
    pub net_usage: UsageAccumulator,
    pub cpu_usage: UsageAccumulator,
    pub ram_usage: u64,
}

/// Averaging windows
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsConfigObject {
    pub account_cpu_usage_average_window: u32,
    pub account_net_usage_average_window: u32,
}

impl Default for ResourceLimitsConfigObject {
    fn default() -> Self {
        ResourceLimitsConfigObject {
            account_cpu_usage_average_window: ACCOUNT_USAGE_AVERAGE_WINDOW,
            account_net_usage_average_window: ACCOUNT_USAGE_AVERAGE_WINDOW,
        }
    }
}

/// Chain wide totals
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsStateObject {
    /// usage of the pending block
    pub pending_cpu_usage: u64,
    pub pending_net_usage: u64,
    /// usage of the last finalized block
    pub last_block_cpu_usage: u64,
    pub last_block_net_usage: u64,
    pub total_cpu_weight: u64,
    pub total_net_weight: u64,
    pub total_ram_bytes: u64,
}

/// RAM billed twice by replaced deferred transactions before `REPLACE_DEFERRED`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRamCorrectionObject {
    pub name: Name,
    pub ram_correction: u64,
}

fn limits_key(owner: Name) -> Vec<u8> {
    make_key(RESOURCE_LIMITS_PREFIX, &[&owner.as_u64().to_be_bytes()])
}

fn usage_key(owner: Name) -> Vec<u8> {
    make_key(RESOURCE_USAGE_PREFIX, &[&owner.as_u64().to_be_bytes()])
}

fn ram_correction_key(owner: Name) -> Vec<u8> {
    make_key(ACCOUNT_RAM_CORRECTION_PREFIX, &[&owner.as_u64().to_be_bytes()])
}

/// Stateless view over the resource objects of the state store
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceLimitsManager;

impl ResourceLimitsManager {
    pub fn initialize_database(&self, db: &mut StateDb) -> ChainResult<()> {
        db.put_object(
            RESOURCE_LIMITS_CONFIG_KEY.to_vec(),
            &ResourceLimitsConfigObject::default(),
        )?;
        db.put_object(
            RESOURCE_LIMITS_STATE_KEY.to_vec(),
            &ResourceLimitsStateObject::default(),
        )?;
        Ok(())
    }

    /// Unlimited resources and no usage
    pub fn initialize_account(&self, db: &mut StateDb, owner: Name) -> ChainResult<()> {
        db.put_object(
            limits_key(owner),
            &ResourceLimitsObject {
                owner,
                ram_bytes: -1,
                net_weight: -1,
                cpu_weight: -1,
            },
        )?;
        db.put_object(
            usage_key(owner),
            &ResourceUsageObject {
                owner,
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn state(&self, db: &StateDb) -> ChainResult<ResourceLimitsStateObject> {
        db.get_object(RESOURCE_LIMITS_STATE_KEY)?.ok_or_else(|| {
            ChainError::Misc("resource limits state is not initialized".to_string())
        })
    }

    fn config(&self, db: &StateDb) -> ChainResult<ResourceLimitsConfigObject> {
        db.get_object(RESOURCE_LIMITS_CONFIG_KEY)?.ok_or_else(|| {
            ChainError::Misc("resource limits config is not initialized".to_string())
        })
    }

    fn limits(&self, db: &StateDb, owner: Name) -> ChainResult<ResourceLimitsObject> {
        db.get_object(&limits_key(owner))?.ok_or_else(|| {
            ChainError::ResourceExhausted(format!("account {} has no resource limits", owner))
        })
    }

    fn usage(&self, db: &StateDb, owner: Name) -> ChainResult<ResourceUsageObject> {
        db.get_object(&usage_key(owner))?.ok_or_else(|| {
            ChainError::ResourceExhausted(format!("account {} has no resource usage", owner))
        })
    }

    /// `(ram_bytes, net_weight, cpu_weight)`
    pub fn get_account_limits(&self, db: &StateDb, owner: Name) -> ChainResult<(i64, i64, i64)> {
        let limits = self.limits(db, owner)?;
        Ok((limits.ram_bytes, limits.net_weight, limits.cpu_weight))
    }

    /// Set the limits of an account. Returns whether its RAM quota shrank, in which case the
    /// caller must check the current usage still fits.
    pub fn set_account_limits(
        &self,
        db: &mut StateDb,
        owner: Name,
        ram_bytes: i64,
        net_weight: i64,
        cpu_weight: i64,
    ) -> ChainResult<bool> {
        let old = self.limits(db, owner)?;
        let mut state = self.state(db)?;
        let positive = |v: i64| if v > 0 { v as u64 } else { 0 };
        state.total_cpu_weight = state.total_cpu_weight.saturating_sub(positive(old.cpu_weight)) + positive(cpu_weight);
        state.total_net_weight = state.total_net_weight.saturating_sub(positive(old.net_weight)) + positive(net_weight);
        state.total_ram_bytes = state.total_ram_bytes.saturating_sub(positive(old.ram_bytes)) + positive(ram_bytes);
        let decreased = ram_bytes >= 0 && (old.ram_bytes < 0 || ram_bytes < old.ram_bytes);
        db.put_object(
            limits_key(owner),
            &ResourceLimitsObject {
                owner,
                ram_bytes,
                net_weight,
                cpu_weight,
            },
        )?;
        db.put_object(RESOURCE_LIMITS_STATE_KEY.to_vec(), &state)?;
        Ok(decreased)
    }

    pub fn get_account_ram_usage(&self, db: &StateDb, owner: Name) -> ChainResult<u64> {
        Ok(self.usage(db, owner)?.ram_usage)
    }

    /// Add `delta` bytes to the RAM billed to an account
    pub fn add_pending_ram_usage(&self, db: &mut StateDb, owner: Name, delta: i64) -> ChainResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut usage = self.usage(db, owner)?;
        usage.ram_usage = if delta > 0 {
            usage.ram_usage.checked_add(delta as u64).ok_or_else(|| {
                ChainError::ResourceExhausted(format!("ram usage of {} overflows", owner))
            })?
        } else {
            usage
                .ram_usage
                .checked_sub(delta.unsigned_abs())
                .ok_or_else(|| {
                    ChainError::ResourceExhausted(format!("ram usage of {} underflows", owner))
                })?
        };
        db.put_object(usage_key(owner), &usage)?;
        Ok(())
    }

    /// Fail if the RAM billed to an account exceeds its quota
    pub fn verify_account_ram_usage(&self, db: &StateDb, owner: Name) -> ChainResult<()> {
        let limits = self.limits(db, owner)?;
        if limits.ram_bytes < 0 {
            return Ok(());
        }
        let usage = self.usage(db, owner)?;
        if usage.ram_usage > limits.ram_bytes as u64 {
            return Err(ChainError::ResourceExhausted(format!(
                "account {} has insufficient ram; needs {} bytes has {} bytes",
                owner, usage.ram_usage, limits.ram_bytes
            )));
        }
        Ok(())
    }

    /// Capacity of the chain over a usage window
    fn virtual_capacity(block_limit: u64, window: u32, greylisted: bool) -> u128 {
        let per_block = if greylisted {
            block_limit
        } else {
            block_limit.saturating_mul(VIRTUAL_LIMIT_MULTIPLIER)
        };
        per_block as u128 * window as u128
    }

    fn check_account_share(
        owner: Name,
        resource: &str,
        weight: i64,
        total_weight: u64,
        capacity: u128,
        used: u64,
    ) -> ChainResult<()> {
        if weight < 0 {
            return Ok(());
        }
        let allowed = if total_weight == 0 {
            0
        } else {
            capacity * weight as u128 / total_weight as u128
        };
        if used as u128 > allowed {
            return Err(ChainError::ResourceExhausted(format!(
                "authorizing account {} has insufficient {} resources",
                owner, resource
            )));
        }
        Ok(())
    }

    /// Bill a transaction to the accounts that authorized it and to the pending block
    #[allow(clippy::too_many_arguments)]
    pub fn add_transaction_usage(
        &self,
        db: &mut StateDb,
        accounts: &BTreeSet<Name>,
        cpu_usage: u64,
        net_usage: u64,
        ordinal: u32,
        parameters: &ChainParameters,
        greylist: &BTreeSet<Name>,
    ) -> ChainResult<()> {
        let config = self.config(db)?;
        let mut state = self.state(db)?;
        for owner in accounts {
            let mut usage = self.usage(db, *owner)?;
            let limits = self.limits(db, *owner)?;
            usage
                .cpu_usage
                .add(cpu_usage, ordinal, config.account_cpu_usage_average_window);
            usage
                .net_usage
                .add(net_usage, ordinal, config.account_net_usage_average_window);
            let greylisted = greylist.contains(owner);
            Self::check_account_share(
                *owner,
                "cpu",
                limits.cpu_weight,
                state.total_cpu_weight,
                Self::virtual_capacity(
                    parameters.max_block_cpu_usage as u64,
                    config.account_cpu_usage_average_window,
                    greylisted,
                ),
                usage.cpu_usage.consumed,
            )?;
            Self::check_account_share(
                *owner,
                "net",
                limits.net_weight,
                state.total_net_weight,
                Self::virtual_capacity(
                    parameters.max_block_net_usage,
                    config.account_net_usage_average_window,
                    greylisted,
                ),
                usage.net_usage.consumed,
            )?;
            db.put_object(usage_key(*owner), &usage)?;
        }
        state.pending_cpu_usage += cpu_usage;
        state.pending_net_usage += net_usage;
        if state.pending_cpu_usage > parameters.max_block_cpu_usage as u64 {
            return Err(ChainError::BlockResourceExhausted(
                "block has insufficient cpu resources".to_string(),
            ));
        }
        if state.pending_net_usage > parameters.max_block_net_usage {
            return Err(ChainError::BlockResourceExhausted(
                "block has insufficient net resources".to_string(),
            ));
        }
        db.put_object(RESOURCE_LIMITS_STATE_KEY.to_vec(), &state)?;
        Ok(())
    }

    /// Close the accounting of the pending block
    pub fn process_block_usage(&self, db: &mut StateDb) -> ChainResult<()> {
        let mut state = self.state(db)?;
        state.last_block_cpu_usage = state.pending_cpu_usage;
        state.last_block_net_usage = state.pending_net_usage;
        state.pending_cpu_usage = 0;
        state.pending_net_usage = 0;
        db.put_object(RESOURCE_LIMITS_STATE_KEY.to_vec(), &state)?;
        Ok(())
    }

    /// CPU left in the pending block
    pub fn get_block_cpu_limit(&self, db: &StateDb, parameters: &ChainParameters) -> ChainResult<u64> {
        let state = self.state(db)?;
        Ok((parameters.max_block_cpu_usage as u64).saturating_sub(state.pending_cpu_usage))
    }

    /// NET left in the pending block
    pub fn get_block_net_limit(&self, db: &StateDb, parameters: &ChainParameters) -> ChainResult<u64> {
        let state = self.state(db)?;
        Ok(parameters.max_block_net_usage.saturating_sub(state.pending_net_usage))
    }

    /// Record RAM billed to `owner` that must be given back once `REPLACE_DEFERRED` activates
    pub fn add_to_ram_correction(&self, db: &mut StateDb, owner: Name, ram_bytes: u64) -> ChainResult<()> {
        let key = ram_correction_key(owner);
        let mut correction = db
            .get_object::<AccountRamCorrectionObject>(&key)?
            .unwrap_or(AccountRamCorrectionObject {
                name: owner,
                ram_correction: 0,
            });
        correction.ram_correction += ram_bytes;
        db.put_object(key, &correction)?;
        Ok(())
    }

    /// Give back every recorded RAM correction and forget them
    pub fn apply_ram_corrections(&self, db: &mut StateDb) -> ChainResult<()> {
        let corrections =
            db.prefix_objects::<AccountRamCorrectionObject>(ACCOUNT_RAM_CORRECTION_PREFIX.as_bytes())?;
        for (key, correction) in corrections {
            let current = self.get_account_ram_usage(db, correction.name)?;
            let mut amount = correction.ram_correction;
            if amount > current {
                warn!(
                    "ram correction of {} for {} exceeds its ram usage {}, clamping",
                    amount, correction.name, current
                );
                amount = current;
            }
            self.add_pending_ram_usage(db, correction.name, -(amount as i64))?;
            db.delete(&key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cairn_db_exports::StateStoreConfig;
    use cairn_db_worker::CairnStateStore;

    fn store() -> (tempfile::TempDir, CairnStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CairnStateStore::open(StateStoreConfig {
            path: dir.path().to_path_buf(),
            size: 1 << 20,
        })
        .unwrap();
        (dir, store)
    }

    #[test]
    fn usage_decays_over_the_window() {
        let mut acc = UsageAccumulator::default();
        acc.add(1000, 1, 10);
        assert_eq!(acc.average(), 100);
        acc.add(0, 6, 10);
        assert_eq!(acc.average(), 50);
        acc.add(0, 100, 10);
        assert_eq!(acc.average(), 0);
    }

    #[test]
    fn ram_quota_is_enforced() {
        let (_dir, mut store) = store();
        let db: &mut StateDb = &mut store;
        let rl = ResourceLimitsManager;
        let alice = Name::from_static("alice");
        rl.initialize_database(db).unwrap();
        rl.initialize_account(db, alice).unwrap();
        rl.add_pending_ram_usage(db, alice, 500).unwrap();
        rl.verify_account_ram_usage(db, alice).unwrap();
        assert!(rl.set_account_limits(db, alice, 400, -1, -1).unwrap());
        assert_matches!(
            rl.verify_account_ram_usage(db, alice),
            Err(ChainError::ResourceExhausted(_))
        );
        rl.add_pending_ram_usage(db, alice, -200).unwrap();
        rl.verify_account_ram_usage(db, alice).unwrap();
        assert_matches!(
            rl.add_pending_ram_usage(db, alice, -1000),
            Err(ChainError::ResourceExhausted(_))
        );
    }

    #[test]
    fn block_cpu_is_bounded() {
        let (_dir, mut store) = store();
        let db: &mut StateDb = &mut store;
        let rl = ResourceLimitsManager;
        let alice = Name::from_static("alice");
        let params = ChainParameters::default();
        rl.initialize_database(db).unwrap();
        rl.initialize_account(db, alice).unwrap();
        let accounts: BTreeSet<Name> = [alice].into_iter().collect();
        rl.add_transaction_usage(db, &accounts, 150_000, 100, 1, &params, &BTreeSet::new())
            .unwrap();
        assert_eq!(rl.get_block_cpu_limit(db, &params).unwrap(), 50_000);
        assert_matches!(
            rl.add_transaction_usage(db, &accounts, 60_000, 100, 1, &params, &BTreeSet::new()),
            Err(ChainError::ResourceExhausted(_))
        );
        rl.process_block_usage(db).unwrap();
        assert_eq!(rl.get_block_cpu_limit(db, &params).unwrap(), 200_000);
    }

    #[test]
    fn ram_corrections_are_given_back() {
        let (_dir, mut store) = store();
        let db: &mut StateDb = &mut store;
        let rl = ResourceLimitsManager;
        let alice = Name::from_static("alice");
        rl.initialize_database(db).unwrap();
        rl.initialize_account(db, alice).unwrap();
        rl.add_pending_ram_usage(db, alice, 300).unwrap();
        rl.add_to_ram_correction(db, alice, 100).unwrap();
        rl.add_to_ram_correction(db, alice, 50).unwrap();
        rl.apply_ram_corrections(db).unwrap();
        assert_eq!(rl.get_account_ram_usage(db, alice).unwrap(), 150);
        assert!(db
            .prefix_iter(ACCOUNT_RAM_CORRECTION_PREFIX.as_bytes())
            .next()
            .is_none());
    }
}
