// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

//! Permissions, permission links and the check that a transaction carries the signatures its
//! declared authorizations require.

use crate::native_handlers::{
    decode_payload, CancelDelay, DeleteAuth, LinkAuth, UnlinkAuth, UpdateAuth, CANCELDELAY,
    DELETEAUTH, LINKAUTH, UNLINKAUTH, UPDATEAUTH,
};
use cairn_chain_exports::state_objects::{
    permission_key, permission_link_key, PermissionLinkObject, PermissionObject,
    PERMISSION_OVERHEAD,
};
use cairn_chain_exports::{ChainError, ChainResult};
use cairn_db_exports::StateDb;
use cairn_models::action::{Action, PermissionLevel};
use cairn_models::authority::Authority;
use cairn_models::constants::{ACTIVE_NAME, ANY_NAME, SYSTEM_ACCOUNT_NAME};
use cairn_models::name::Name;
use cairn_models::timestamp::BlockTimestamp;
use cairn_signature::PublicKey;
use std::collections::BTreeSet;

/// Bytes billed for a permission holding `auth`
pub fn permission_billable_size(auth: &Authority) -> u64 {
    PERMISSION_OVERHEAD + bincode::serialized_size(auth).unwrap_or(0)
}

/// Stateless view over the permissions of the state store
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthorizationManager;

impl AuthorizationManager {
    pub fn find_permission(
        &self,
        db: &StateDb,
        level: &PermissionLevel,
    ) -> ChainResult<Option<PermissionObject>> {
        Ok(db.get_object(&permission_key(level.actor, level.permission))?)
    }

    pub fn get_permission(&self, db: &StateDb, level: &PermissionLevel) -> ChainResult<PermissionObject> {
        self.find_permission(db, level)?
            .ok_or_else(|| ChainError::Authorization(format!("permission {} does not exist", level)))
    }

    /// Create a permission and return it with its billable size
    pub fn create_permission(
        &self,
        db: &mut StateDb,
        owner: Name,
        name: Name,
        parent: Name,
        auth: Authority,
        now: BlockTimestamp,
    ) -> ChainResult<(PermissionObject, u64)> {
        let size = permission_billable_size(&auth);
        let permission = PermissionObject {
            owner,
            name,
            parent,
            last_updated: now,
            auth,
        };
        db.put_object(permission_key(owner, name), &permission)?;
        Ok((permission, size))
    }

    /// Replace the authority of a permission and return the change of its billable size
    pub fn modify_permission(
        &self,
        db: &mut StateDb,
        mut permission: PermissionObject,
        auth: Authority,
        now: BlockTimestamp,
    ) -> ChainResult<i64> {
        let delta =
            permission_billable_size(&auth) as i64 - permission_billable_size(&permission.auth) as i64;
        permission.auth = auth;
        permission.last_updated = now;
        db.put_object(permission_key(permission.owner, permission.name), &permission)?;
        Ok(delta)
    }

    /// Remove a permission and return its billable size
    pub fn remove_permission(&self, db: &mut StateDb, permission: &PermissionObject) -> ChainResult<u64> {
        db.delete(&permission_key(permission.owner, permission.name))?;
        Ok(permission_billable_size(&permission.auth))
    }

    /// Whether `permission` is `minimum` or one of its ancestors
    pub fn satisfies(
        &self,
        db: &StateDb,
        permission: &PermissionObject,
        minimum: &PermissionObject,
    ) -> ChainResult<bool> {
        if permission.owner != minimum.owner {
            return Ok(false);
        }
        if permission.name == minimum.name || permission.name == minimum.parent {
            return Ok(true);
        }
        let mut current = minimum.parent;
        while !current.is_empty() {
            let parent = self.get_permission(db, &PermissionLevel::new(minimum.owner, current))?;
            if parent.parent == permission.name {
                return Ok(true);
            }
            current = parent.parent;
        }
        Ok(false)
    }

    /// Permission linked to `(account, code, action)`, falling back to the link covering every
    /// action of `code`
    pub fn lookup_linked_permission(
        &self,
        db: &StateDb,
        account: Name,
        code: Name,
        action: Name,
    ) -> ChainResult<Option<Name>> {
        if let Some(link) =
            db.get_object::<PermissionLinkObject>(&permission_link_key(account, code, action))?
        {
            return Ok(Some(link.required_permission));
        }
        Ok(db
            .get_object::<PermissionLinkObject>(&permission_link_key(account, code, Name::default()))?
            .map(|link| link.required_permission))
    }

    /// Minimum permission `account` must provide to authorize `code::action`, `None` when any
    /// permission will do
    pub fn lookup_minimum_permission(
        &self,
        db: &StateDb,
        account: Name,
        code: Name,
        action: Name,
    ) -> ChainResult<Option<Name>> {
        if code == SYSTEM_ACCOUNT_NAME && is_unlinkable_action(action) {
            return Err(ChainError::Authorization(format!(
                "cannot call lookup_minimum_permission on native action {}",
                action
            )));
        }
        match self.lookup_linked_permission(db, account, code, action)? {
            None => Ok(Some(ACTIVE_NAME)),
            Some(name) if name == ANY_NAME => Ok(None),
            Some(name) => Ok(Some(name)),
        }
    }

    fn require_satisfies(
        &self,
        db: &StateDb,
        declared: &PermissionLevel,
        minimum: &PermissionLevel,
    ) -> ChainResult<()> {
        let permission = self.get_permission(db, declared)?;
        let minimum_permission = self.get_permission(db, minimum)?;
        if !self.satisfies(db, &permission, &minimum_permission)? {
            return Err(ChainError::Authorization(format!(
                "{} does not satisfy the required permission {}",
                declared, minimum
            )));
        }
        Ok(())
    }

    fn check_single_authorizer(action: &Action, account: Name) -> ChainResult<&PermissionLevel> {
        match action.authorization.as_slice() {
            [auth] if auth.actor == account => Ok(auth),
            [_] => Err(ChainError::Authorization(format!(
                "{} must be authorized by {}",
                action.name, account
            ))),
            _ => Err(ChainError::Authorization(format!(
                "{} must carry exactly one authorization",
                action.name
            ))),
        }
    }

    fn check_updateauth_authorization(&self, db: &StateDb, action: &Action) -> ChainResult<()> {
        let update: UpdateAuth = decode_payload(action)?;
        let auth = Self::check_single_authorizer(action, update.account)?;
        let minimum = match self.find_permission(db, &PermissionLevel::new(update.account, update.permission))? {
            Some(_) => PermissionLevel::new(update.account, update.permission),
            None => PermissionLevel::new(update.account, update.parent),
        };
        self.require_satisfies(db, auth, &minimum)
    }

    fn check_deleteauth_authorization(&self, db: &StateDb, action: &Action) -> ChainResult<()> {
        let delete: DeleteAuth = decode_payload(action)?;
        let auth = Self::check_single_authorizer(action, delete.account)?;
        self.require_satisfies(db, auth, &PermissionLevel::new(delete.account, delete.permission))
    }

    fn check_linkauth_authorization(&self, db: &StateDb, action: &Action) -> ChainResult<()> {
        let link: LinkAuth = decode_payload(action)?;
        let auth = Self::check_single_authorizer(action, link.account)?;
        if link.code == SYSTEM_ACCOUNT_NAME && is_unlinkable_action(link.message_type) {
            return Err(ChainError::Authorization(format!(
                "cannot link native action {}",
                link.message_type
            )));
        }
        match self.lookup_minimum_permission(db, link.account, link.code, link.message_type)? {
            None => Ok(()),
            Some(linked) => {
                self.require_satisfies(db, auth, &PermissionLevel::new(link.account, linked))
            }
        }
    }

    fn check_unlinkauth_authorization(&self, db: &StateDb, action: &Action) -> ChainResult<()> {
        let unlink: UnlinkAuth = decode_payload(action)?;
        let auth = Self::check_single_authorizer(action, unlink.account)?;
        let linked = self
            .lookup_linked_permission(db, unlink.account, unlink.code, unlink.message_type)?
            .ok_or_else(|| {
                ChainError::Authorization(format!(
                    "cannot unlink non-existent permission link of {} to {}::{}",
                    unlink.account, unlink.code, unlink.message_type
                ))
            })?;
        if linked == ANY_NAME {
            return Ok(());
        }
        self.require_satisfies(db, auth, &PermissionLevel::new(unlink.account, linked))
    }

    fn check_canceldelay_authorization(&self, action: &Action) -> ChainResult<()> {
        let cancel: CancelDelay = decode_payload(action)?;
        match action.authorization.as_slice() {
            [auth] if *auth == cancel.canceling_auth => Ok(()),
            _ => Err(ChainError::Authorization(format!(
                "canceldelay must be authorized by the canceling authority {}",
                cancel.canceling_auth
            ))),
        }
    }

    /// Check every declared authorization of `actions` against the permission links and the
    /// signatures of `provided_keys`.
    ///
    /// Keys that satisfy no declared permission are rejected unless `allow_unused_keys`.
    pub fn check_authorization(
        &self,
        db: &StateDb,
        actions: &[Action],
        provided_keys: &BTreeSet<PublicKey>,
        max_authority_depth: u16,
        allow_unused_keys: bool,
    ) -> ChainResult<()> {
        let mut to_satisfy: BTreeSet<PermissionLevel> = BTreeSet::new();
        for action in actions {
            let special = action.account == SYSTEM_ACCOUNT_NAME;
            if special && action.name == UPDATEAUTH {
                self.check_updateauth_authorization(db, action)?;
            } else if special && action.name == DELETEAUTH {
                self.check_deleteauth_authorization(db, action)?;
            } else if special && action.name == LINKAUTH {
                self.check_linkauth_authorization(db, action)?;
            } else if special && action.name == UNLINKAUTH {
                self.check_unlinkauth_authorization(db, action)?;
            } else if special && action.name == CANCELDELAY {
                self.check_canceldelay_authorization(action)?;
            } else {
                for declared in &action.authorization {
                    if let Some(minimum) =
                        self.lookup_minimum_permission(db, declared.actor, action.account, action.name)?
                    {
                        self.require_satisfies(db, declared, &PermissionLevel::new(declared.actor, minimum))?;
                    }
                }
            }
            to_satisfy.extend(action.authorization.iter().copied());
        }

        let mut checker = AuthorityChecker::new(db, provided_keys, max_authority_depth);
        for level in &to_satisfy {
            let permission = self.get_permission(db, level)?;
            if !checker.satisfied(&permission.auth, 0)? {
                return Err(ChainError::Authorization(format!(
                    "transaction declares authority {} but does not have signatures for it",
                    level
                )));
            }
        }
        if !allow_unused_keys {
            let unused: Vec<String> = provided_keys
                .difference(&checker.used_keys)
                .map(|key| key.to_string())
                .collect();
            if !unused.is_empty() {
                return Err(ChainError::Authorization(format!(
                    "transaction bears irrelevant signatures from these keys: {}",
                    unused.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Native actions whose authorization is checked by dedicated rules instead of links
pub fn is_unlinkable_action(action: Name) -> bool {
    [UPDATEAUTH, DELETEAUTH, LINKAUTH, UNLINKAUTH, CANCELDELAY].contains(&action)
}

/// Weighs authorities against a set of keys, following account permissions up to a depth
struct AuthorityChecker<'a> {
    db: &'a StateDb,
    provided_keys: &'a BTreeSet<PublicKey>,
    max_depth: u16,
    used_keys: BTreeSet<PublicKey>,
}

impl<'a> AuthorityChecker<'a> {
    fn new(db: &'a StateDb, provided_keys: &'a BTreeSet<PublicKey>, max_depth: u16) -> Self {
        AuthorityChecker {
            db,
            provided_keys,
            max_depth,
            used_keys: BTreeSet::new(),
        }
    }

    fn satisfied(&mut self, authority: &Authority, depth: u16) -> ChainResult<bool> {
        let mut total: u64 = 0;
        let threshold = authority.threshold as u64;
        for key_weight in &authority.keys {
            if self.provided_keys.contains(&key_weight.key) {
                self.used_keys.insert(key_weight.key);
                total += key_weight.weight as u64;
                if total >= threshold {
                    return Ok(true);
                }
            }
        }
        if depth >= self.max_depth {
            return Ok(total >= threshold);
        }
        for account in &authority.accounts {
            let level = account.permission;
            let permission: Option<PermissionObject> =
                self.db.get_object(&permission_key(level.actor, level.permission))?;
            if let Some(permission) = permission {
                if self.satisfied(&permission.auth, depth + 1)? {
                    total += account.weight as u64;
                    if total >= threshold {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(total >= threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cairn_db_exports::StateStoreConfig;
    use cairn_db_worker::CairnStateStore;
    use cairn_models::authority::PermissionLevelWeight;
    use cairn_models::constants::OWNER_NAME;
    use cairn_signature::KeyPair;

    #[test]
    fn keys_and_nested_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CairnStateStore::open(StateStoreConfig {
            path: dir.path().to_path_buf(),
            size: 1 << 20,
        })
        .unwrap();
        let db: &mut StateDb = &mut store;
        let auth = AuthorizationManager;
        let alice = Name::from_static("alice");
        let bob = Name::from_static("bob");
        let alice_key = KeyPair::generate().get_public_key();
        let bob_key = KeyPair::generate().get_public_key();
        let now = BlockTimestamp::new(1);

        auth.create_permission(db, alice, OWNER_NAME, Name::default(), Authority::from_key(alice_key), now)
            .unwrap();
        auth.create_permission(db, alice, ACTIVE_NAME, OWNER_NAME, Authority::from_key(alice_key), now)
            .unwrap();
        auth.create_permission(db, bob, OWNER_NAME, Name::default(), Authority::from_key(bob_key), now)
            .unwrap();
        // bob@active delegates to alice@active
        auth.create_permission(
            db,
            bob,
            ACTIVE_NAME,
            OWNER_NAME,
            Authority::from_permissions(
                1,
                vec![PermissionLevelWeight {
                    permission: PermissionLevel::new(alice, ACTIVE_NAME),
                    weight: 1,
                }],
            ),
            now,
        )
        .unwrap();

        let transfer = Action::new(
            Name::from_static("token"),
            Name::from_static("transfer"),
            vec![PermissionLevel::new(bob, ACTIVE_NAME)],
            vec![],
        );
        let alice_keys: BTreeSet<PublicKey> = [alice_key].into_iter().collect();
        auth.check_authorization(db, &[transfer.clone()], &alice_keys, 6, false)
            .unwrap();

        let bob_keys: BTreeSet<PublicKey> = [bob_key].into_iter().collect();
        assert_matches!(
            auth.check_authorization(db, &[transfer.clone()], &bob_keys, 6, false),
            Err(ChainError::Authorization(_))
        );

        let both: BTreeSet<PublicKey> = [alice_key, bob_key].into_iter().collect();
        assert_matches!(
            auth.check_authorization(db, &[transfer.clone()], &both, 6, false),
            Err(ChainError::Authorization(_))
        );
        auth.check_authorization(db, &[transfer.clone()], &both, 6, true)
            .unwrap();

        // the owner permission satisfies the active minimum, not the reverse
        let owner = auth.get_permission(db, &PermissionLevel::new(bob, OWNER_NAME)).unwrap();
        let active = auth.get_permission(db, &PermissionLevel::new(bob, ACTIVE_NAME)).unwrap();
        assert!(auth.satisfies(db, &owner, &active).unwrap());
        assert!(!auth.satisfies(db, &active, &owner).unwrap());
    }
}
