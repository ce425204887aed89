// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

//! Actions of the system account handled by the controller itself.
//!
//! The dispatch table is keyed by `(receiver, contract, action)` and built once. Payloads are
//! `bincode` encoded structs.

use crate::apply_context::ApplyContext;
use crate::authorization::{is_unlinkable_action, AuthorizationManager};
use crate::resource_limits::ResourceLimitsManager;
use cairn_chain_exports::state_objects::{
    account_key, account_metadata_key, permission_link_key, permission_link_prefix,
    permission_prefix, AccountMetadataObject, AccountObject, PermissionLinkObject,
    PermissionObject, NEW_ACCOUNT_OVERHEAD, PERMISSION_LINK_OVERHEAD, SETCODE_RAM_BYTES_MULTIPLIER,
};
use cairn_chain_exports::{ActionContext, ChainError, ChainResult};
use cairn_db_exports::StateDb;
use cairn_hash::Hash;
use cairn_models::action::{Action, PermissionLevel};
use cairn_models::authority::Authority;
use cairn_models::constants::{ACTIVE_NAME, ANY_NAME, OWNER_NAME, SYSTEM_ACCOUNT_NAME};
use cairn_models::name::Name;
use cairn_models::transaction::TransactionId;
use cairn_protocol_features::BuiltinProtocolFeature;
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const NEWACCOUNT: Name = Name::from_static("newaccount");
pub const SETCODE: Name = Name::from_static("setcode");
pub const SETABI: Name = Name::from_static("setabi");
pub const UPDATEAUTH: Name = Name::from_static("updateauth");
pub const DELETEAUTH: Name = Name::from_static("deleteauth");
pub const LINKAUTH: Name = Name::from_static("linkauth");
pub const UNLINKAUTH: Name = Name::from_static("unlinkauth");
pub const CANCELDELAY: Name = Name::from_static("canceldelay");

/// Prefix of account and permission names reserved to privileged accounts
pub const RESERVED_NAME_PREFIX: &str = "cairn.";

/// Create an account with its `owner` and `active` permissions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub creator: Name,
    pub name: Name,
    pub owner: Authority,
    pub active: Authority,
}

/// Deploy or clear the code of an account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCode {
    pub account: Name,
    pub vm_type: u8,
    pub vm_version: u8,
    pub code: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAbi {
    pub account: Name,
    pub abi: Vec<u8>,
}

/// Create or update a permission
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAuth {
    pub account: Name,
    pub permission: Name,
    pub parent: Name,
    pub auth: Authority,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAuth {
    pub account: Name,
    pub permission: Name,
}

/// Require `requirement` for `code::message_type` (every action of `code` when empty)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAuth {
    pub account: Name,
    pub code: Name,
    pub message_type: Name,
    pub requirement: Name,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkAuth {
    pub account: Name,
    pub code: Name,
    pub message_type: Name,
}

/// Cancel a delayed transaction authorized by `canceling_auth`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelDelay {
    pub canceling_auth: PermissionLevel,
    pub trx_id: TransactionId,
}

/// Decode the payload of a native action
pub fn decode_payload<T: DeserializeOwned>(action: &Action) -> ChainResult<T> {
    bincode::deserialize(&action.data).map_err(|err| {
        ChainError::NativeAction(format!("malformed payload of {}: {}", action.name, err))
    })
}

/// Encode the payload of a native action
pub fn encode_payload<T: Serialize>(payload: &T) -> ChainResult<Vec<u8>> {
    bincode::serialize(payload)
        .map_err(|err| ChainError::NativeAction(format!("payload serialization failed: {}", err)))
}

/// Sender id under which a delayed input transaction is queued
pub fn transaction_id_to_sender_id(trx_id: &TransactionId) -> u128 {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&trx_id.to_bytes()[..16]);
    u128::from_be_bytes(bytes)
}

pub(crate) type NativeHandler = fn(&mut ApplyContext<'_, '_>) -> ChainResult<()>;

lazy_static! {
    static ref NATIVE_HANDLERS: BTreeMap<(Name, Name, Name), NativeHandler> = {
        let mut handlers: BTreeMap<(Name, Name, Name), NativeHandler> = BTreeMap::new();
        let mut set = |action: Name, handler: NativeHandler| {
            handlers.insert((SYSTEM_ACCOUNT_NAME, SYSTEM_ACCOUNT_NAME, action), handler);
        };
        set(NEWACCOUNT, apply_newaccount);
        set(SETCODE, apply_setcode);
        set(SETABI, apply_setabi);
        set(UPDATEAUTH, apply_updateauth);
        set(DELETEAUTH, apply_deleteauth);
        set(LINKAUTH, apply_linkauth);
        set(UNLINKAUTH, apply_unlinkauth);
        set(CANCELDELAY, apply_canceldelay);
        handlers
    };
}

/// Handler of `contract::action` when received by `receiver`
pub(crate) fn find_native_handler(receiver: Name, contract: Name, action: Name) -> Option<NativeHandler> {
    NATIVE_HANDLERS.get(&(receiver, contract, action)).copied()
}

fn check(condition: bool, message: impl FnOnce() -> String) -> ChainResult<()> {
    if condition {
        Ok(())
    } else {
        Err(ChainError::NativeAction(message()))
    }
}

fn account_exists(db: &StateDb, name: Name) -> bool {
    db.get(&account_key(name)).is_some()
}

fn get_metadata(db: &StateDb, name: Name) -> ChainResult<AccountMetadataObject> {
    db.get_object(&account_metadata_key(name))?
        .ok_or_else(|| ChainError::NativeAction(format!("account {} does not exist", name)))
}

/// Every account referenced by `auth` must exist, and every non default permission too
fn validate_authority_precondition(db: &StateDb, auth: &Authority) -> ChainResult<()> {
    for weight in &auth.accounts {
        let level = weight.permission;
        check(account_exists(db, level.actor), || {
            format!("account {} in authority does not exist", level.actor)
        })?;
        if level.permission == OWNER_NAME || level.permission == ACTIVE_NAME {
            continue;
        }
        AuthorizationManager.get_permission(db, &level).map_err(|_| {
            ChainError::NativeAction(format!("permission {} in authority does not exist", level))
        })?;
    }
    Ok(())
}

fn apply_newaccount(context: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let create: NewAccount = decode_payload(context.action())?;
    context.require_authorization(create.creator)?;
    create.owner.validate()?;
    create.active.validate()?;
    let name = create.name.to_string();
    check(!create.name.is_empty(), || "account name cannot be empty".to_string())?;
    check(name.len() <= 12, || "account names can only be 12 chars long".to_string())?;
    let now = context.block_time();
    let new_permissions_size = context.with_db(|db| {
        let creator = get_metadata(db, create.creator)?;
        if !creator.privileged {
            check(!name.starts_with(RESERVED_NAME_PREFIX), || {
                format!(
                    "only privileged accounts can have names that start with '{}'",
                    RESERVED_NAME_PREFIX
                )
            })?;
        }
        check(!account_exists(db, create.name), || {
            format!("cannot create account named {}, as that name is already taken", name)
        })?;
        db.put_object(
            account_key(create.name),
            &AccountObject {
                name: create.name,
                creation_date: now,
                abi: Vec::new(),
            },
        )?;
        db.put_object(
            account_metadata_key(create.name),
            &AccountMetadataObject {
                name: create.name,
                ..Default::default()
            },
        )?;
        validate_authority_precondition(db, &create.owner)?;
        validate_authority_precondition(db, &create.active)?;
        let auth = AuthorizationManager;
        let (_, owner_size) = auth.create_permission(
            db,
            create.name,
            OWNER_NAME,
            Name::default(),
            create.owner.clone(),
            now,
        )?;
        let (_, active_size) =
            auth.create_permission(db, create.name, ACTIVE_NAME, OWNER_NAME, create.active.clone(), now)?;
        ResourceLimitsManager.initialize_account(db, create.name)?;
        Ok(owner_size + active_size)
    })?;
    context.add_ram_usage(create.name, (NEW_ACCOUNT_OVERHEAD + new_permissions_size) as i64)
}

fn apply_setcode(context: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let act: SetCode = decode_payload(context.action())?;
    context.require_authorization(act.account)?;
    check(act.vm_type == 0, || "code should be 0".to_string())?;
    check(act.vm_version == 0, || "version should be 0".to_string())?;
    let code_hash = if act.code.is_empty() {
        Hash::zero()
    } else {
        Hash::compute_from(&act.code)
    };
    let now = context.block_time();
    let (old_size, new_size) = context.with_db(|db| {
        let mut metadata = get_metadata(db, act.account)?;
        let existing_code = !metadata.code_hash.is_zero();
        check(!act.code.is_empty() || existing_code, || {
            "contract is already cleared".to_string()
        })?;
        check(metadata.code_hash != code_hash, || {
            "contract is already running this version of code".to_string()
        })?;
        let old_size = metadata.code.len() as u64 * SETCODE_RAM_BYTES_MULTIPLIER;
        let new_size = act.code.len() as u64 * SETCODE_RAM_BYTES_MULTIPLIER;
        metadata.code_sequence += 1;
        metadata.code_hash = code_hash;
        metadata.code = act.code.clone();
        metadata.last_code_update = now;
        db.put_object(account_metadata_key(act.account), &metadata)?;
        Ok((old_size, new_size))
    })?;
    if new_size != old_size {
        context.add_ram_usage(act.account, new_size as i64 - old_size as i64)?;
    }
    Ok(())
}

fn apply_setabi(context: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let act: SetAbi = decode_payload(context.action())?;
    context.require_authorization(act.account)?;
    let (old_size, new_size) = context.with_db(|db| {
        let mut account: AccountObject = db
            .get_object(&account_key(act.account))?
            .ok_or_else(|| ChainError::NativeAction(format!("account {} does not exist", act.account)))?;
        let old_size = account.abi.len() as i64;
        account.abi = act.abi.clone();
        db.put_object(account_key(act.account), &account)?;
        let mut metadata = get_metadata(db, act.account)?;
        metadata.abi_sequence += 1;
        db.put_object(account_metadata_key(act.account), &metadata)?;
        Ok((old_size, act.abi.len() as i64))
    })?;
    if new_size != old_size {
        context.add_ram_usage(act.account, new_size - old_size)?;
    }
    Ok(())
}

fn apply_updateauth(context: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let update: UpdateAuth = decode_payload(context.action())?;
    context.require_authorization(update.account)?;
    check(!update.permission.is_empty(), || {
        "cannot create authority with empty name".to_string()
    })?;
    check(
        !update.permission.to_string().starts_with(RESERVED_NAME_PREFIX),
        || format!("permission names that start with '{}' are reserved", RESERVED_NAME_PREFIX),
    )?;
    check(update.permission != update.parent, || {
        "cannot set an authority as its own parent".to_string()
    })?;
    update.auth.validate()?;
    if update.permission == ACTIVE_NAME {
        check(update.parent == OWNER_NAME, || {
            "cannot change active authority's parent from owner".to_string()
        })?;
    }
    if update.permission == OWNER_NAME {
        check(update.parent.is_empty(), || "cannot change owner authority's parent".to_string())?;
    } else {
        check(!update.parent.is_empty(), || {
            "only owner permission can have empty parent".to_string()
        })?;
    }
    let now = context.block_time();
    let delta = context.with_db(|db| {
        check(account_exists(db, update.account), || {
            format!("account {} does not exist", update.account)
        })?;
        validate_authority_precondition(db, &update.auth)?;
        let auth = AuthorizationManager;
        if update.permission != OWNER_NAME {
            auth.get_permission(db, &PermissionLevel::new(update.account, update.parent))?;
        }
        match auth.find_permission(db, &PermissionLevel::new(update.account, update.permission))? {
            Some(permission) => {
                check(permission.parent == update.parent, || {
                    "changing parent authority is not currently supported".to_string()
                })?;
                auth.modify_permission(db, permission, update.auth.clone(), now)
            }
            None => {
                let (_, size) = auth.create_permission(
                    db,
                    update.account,
                    update.permission,
                    update.parent,
                    update.auth.clone(),
                    now,
                )?;
                Ok(size as i64)
            }
        }
    })?;
    context.add_ram_usage(update.account, delta)
}

fn apply_deleteauth(context: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let remove: DeleteAuth = decode_payload(context.action())?;
    context.require_authorization(remove.account)?;
    check(remove.permission != ACTIVE_NAME, || "cannot delete active authority".to_string())?;
    check(remove.permission != OWNER_NAME, || "cannot delete owner authority".to_string())?;
    let size = context.with_db(|db| {
        let links = db.prefix_objects::<PermissionLinkObject>(&permission_link_prefix(remove.account))?;
        if let Some((_, link)) = links
            .iter()
            .find(|(_, link)| link.required_permission == remove.permission)
        {
            return Err(ChainError::NativeAction(format!(
                "cannot delete a linked authority, unlink the authority first; this authority is linked to {}::{}",
                link.code, link.message_type
            )));
        }
        let auth = AuthorizationManager;
        let permission = auth.get_permission(db, &PermissionLevel::new(remove.account, remove.permission))?;
        let has_children = db
            .prefix_objects::<PermissionObject>(&permission_prefix(remove.account))?
            .iter()
            .any(|(_, p)| p.parent == remove.permission);
        check(!has_children, || {
            "cannot remove a permission which has children, remove the children first".to_string()
        })?;
        auth.remove_permission(db, &permission)
    })?;
    context.add_ram_usage(remove.account, -(size as i64))
}

fn apply_linkauth(context: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let requirement: LinkAuth = decode_payload(context.action())?;
    context.require_authorization(requirement.account)?;
    check(!requirement.requirement.is_empty(), || {
        "required permission cannot be empty".to_string()
    })?;
    check(
        requirement.code != SYSTEM_ACCOUNT_NAME || !is_unlinkable_action(requirement.message_type),
        || format!("cannot link native action {}", requirement.message_type),
    )?;
    let only_existing = context.is_builtin_activated(BuiltinProtocolFeature::OnlyLinkToExistingPermission);
    let created = context.with_db(|db| {
        check(account_exists(db, requirement.account), || {
            format!("failed to retrieve account: {}", requirement.account)
        })?;
        check(account_exists(db, requirement.code), || {
            format!("failed to retrieve code for account: {}", requirement.code)
        })?;
        if requirement.requirement != ANY_NAME {
            let found = if only_existing {
                AuthorizationManager
                    .find_permission(db, &PermissionLevel::new(requirement.account, requirement.requirement))?
                    .is_some()
            } else {
                // any account's permission of that name used to be accepted
                db.prefix_objects::<PermissionObject>(cairn_db_exports::PERMISSION_PREFIX.as_bytes())?
                    .iter()
                    .any(|(_, p)| p.name == requirement.requirement)
            };
            check(found, || {
                format!("failed to retrieve permission: {}", requirement.requirement)
            })?;
        }
        let key = permission_link_key(requirement.account, requirement.code, requirement.message_type);
        let existing: Option<PermissionLinkObject> = db.get_object(&key)?;
        let created = existing.is_none();
        if let Some(link) = existing {
            check(link.required_permission != requirement.requirement, || {
                "attempting to update required authority, but new requirement is same as old".to_string()
            })?;
        }
        db.put_object(
            key,
            &PermissionLinkObject {
                account: requirement.account,
                code: requirement.code,
                message_type: requirement.message_type,
                required_permission: requirement.requirement,
            },
        )?;
        Ok(created)
    })?;
    if created {
        context.add_ram_usage(requirement.account, PERMISSION_LINK_OVERHEAD as i64)?;
    }
    Ok(())
}

fn apply_unlinkauth(context: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let unlink: UnlinkAuth = decode_payload(context.action())?;
    context.require_authorization(unlink.account)?;
    context.with_db(|db| {
        let key = permission_link_key(unlink.account, unlink.code, unlink.message_type);
        check(db.get(&key).is_some(), || {
            "attempting to unlink authority, but no link found".to_string()
        })?;
        db.delete(&key)?;
        Ok(())
    })?;
    context.add_ram_usage(unlink.account, -(PERMISSION_LINK_OVERHEAD as i64))
}

fn apply_canceldelay(context: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let cancel: CancelDelay = decode_payload(context.action())?;
    context.require_authorization(cancel.canceling_auth.actor)?;
    let gto = context
        .control()
        .find_generated_transaction(&cancel.trx_id)?
        .filter(|gto| gto.sender.is_empty())
        .ok_or_else(|| {
            ChainError::NativeAction(format!(
                "cannot cancel trx_id={}, there is no deferred transaction with that transaction id",
                cancel.trx_id
            ))
        })?;
    let found = gto
        .trx
        .actions
        .iter()
        .any(|act| act.authorization.contains(&cancel.canceling_auth));
    check(found, || {
        "canceling_auth in canceldelay action was not found as authorization in the original delayed transaction".to_string()
    })?;
    context.cancel_deferred_transaction(gto.sender_id, Name::default())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_covers_native_actions() {
        for action in [
            NEWACCOUNT, SETCODE, SETABI, UPDATEAUTH, DELETEAUTH, LINKAUTH, UNLINKAUTH, CANCELDELAY,
        ] {
            assert!(find_native_handler(SYSTEM_ACCOUNT_NAME, SYSTEM_ACCOUNT_NAME, action).is_some());
        }
        // notifications of native actions go to the receiver's own code
        assert!(find_native_handler(Name::from_static("alice"), SYSTEM_ACCOUNT_NAME, NEWACCOUNT).is_none());
        assert!(find_native_handler(SYSTEM_ACCOUNT_NAME, SYSTEM_ACCOUNT_NAME, Name::from_static("onblock")).is_none());
    }

    #[test]
    fn sender_id_of_delayed_transaction() {
        let id = Hash::compute_from(b"trx");
        let sender_id = transaction_id_to_sender_id(&id);
        assert_eq!(sender_id.to_be_bytes(), id.to_bytes()[..16]);
    }
}
