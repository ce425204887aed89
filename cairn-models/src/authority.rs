// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::action::PermissionLevel;
use crate::error::ModelsError;
use cairn_signature::PublicKey;
use serde::{Deserialize, Serialize};

/// A key and the weight it contributes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct KeyWeight {
    /// key
    pub key: PublicKey,
    /// weight
    pub weight: u16,
}

/// Another account permission and the weight it contributes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct PermissionLevelWeight {
    /// delegated permission
    pub permission: PermissionLevel,
    /// weight
    pub weight: u16,
}

/// Weighted threshold over keys and other permissions
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Authority {
    /// total weight required
    pub threshold: u32,
    /// keys, sorted and unique
    pub keys: Vec<KeyWeight>,
    /// delegated permissions, sorted and unique
    pub accounts: Vec<PermissionLevelWeight>,
}

impl Authority {
    /// Authority satisfied by a single key
    pub fn from_key(key: PublicKey) -> Self {
        Authority {
            threshold: 1,
            keys: vec![KeyWeight { key, weight: 1 }],
            accounts: Vec::new(),
        }
    }

    /// Authority satisfied by `threshold` weight of the given permissions
    pub fn from_permissions(threshold: u32, mut accounts: Vec<PermissionLevelWeight>) -> Self {
        accounts.sort();
        Authority {
            threshold,
            keys: Vec::new(),
            accounts,
        }
    }

    /// Check that the authority is sorted, duplicate free and satisfiable
    pub fn validate(&self) -> Result<(), ModelsError> {
        if self.threshold == 0 {
            return Err(ModelsError::InvalidAuthority(
                "threshold must be positive".to_string(),
            ));
        }
        if self.keys.windows(2).any(|w| w[0].key >= w[1].key) {
            return Err(ModelsError::InvalidAuthority(
                "keys must be sorted and unique".to_string(),
            ));
        }
        if self
            .accounts
            .windows(2)
            .any(|w| w[0].permission >= w[1].permission)
        {
            return Err(ModelsError::InvalidAuthority(
                "accounts must be sorted and unique".to_string(),
            ));
        }
        let total: u64 = self.keys.iter().map(|k| k.weight as u64).sum::<u64>()
            + self.accounts.iter().map(|a| a.weight as u64).sum::<u64>();
        if total < self.threshold as u64 {
            return Err(ModelsError::InvalidAuthority(format!(
                "total weight {} below threshold {}",
                total, self.threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::Name;
    use assert_matches::assert_matches;
    use cairn_signature::KeyPair;

    #[test]
    fn unsatisfiable_authority_is_invalid() {
        let key = KeyPair::generate().get_public_key();
        assert!(Authority::from_key(key).validate().is_ok());
        let mut auth = Authority::from_key(key);
        auth.threshold = 2;
        assert_matches!(auth.validate(), Err(ModelsError::InvalidAuthority(_)));
        let perm = PermissionLevelWeight {
            permission: PermissionLevel::new(Name::from_static("bob"), Name::from_static("active")),
            weight: 1,
        };
        let dup = Authority::from_permissions(1, vec![perm, perm]);
        assert_matches!(dup.validate(), Err(ModelsError::InvalidAuthority(_)));
    }
}
