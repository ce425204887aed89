// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::controller::Controller;
use crate::native_handlers::find_native_handler;
use crate::native_handlers::SETCODE;
use crate::transaction_context::{TransactionContext, TRANSACTION_ID_NET_USAGE};
use cairn_chain_exports::state_objects::{
    account_key, account_metadata_key, contract_row_key, generated_transaction_key,
    AccountMetadataObject, ContractRowObject, DynamicGlobalPropertyObject,
    GeneratedTransactionObject, CONTRACT_ROW_OVERHEAD,
};
use cairn_chain_exports::{
    ActionContext, ActionTrace, ChainError, ChainResult, ExecutionStatus,
};
use cairn_db_exports::{StateDb, DYNAMIC_GLOBAL_PROPERTY_KEY};
use cairn_hash::Hash;
use cairn_models::action::{Action, ActionReceipt};
use cairn_models::block_id::BlockId;
use cairn_models::constants::SYSTEM_ACCOUNT_NAME;
use cairn_models::name::Name;
use cairn_models::producer::ProducerKey;
use cairn_models::timestamp::{BlockTimestamp, TimePointSec};
use cairn_models::transaction::{Transaction, TransactionId};
use cairn_protocol_features::BuiltinProtocolFeature;
use std::collections::BTreeSet;

/// Execution of one action by its receiver and by every account it notifies.
///
/// Inline actions queued by the receivers run once all notifications are handled, one level
/// deeper.
pub struct ApplyContext<'c, 'a> {
    trx_context: &'c mut TransactionContext<'a>,
    act: Action,
    receiver: Name,
    recurse_depth: u32,
    creator_action_ordinal: u32,
    first_receiver_action_ordinal: u32,
    action_ordinal: u32,
    inline: bool,
    sender: Option<Name>,
    privileged: bool,
    notified: Vec<Name>,
    /// queued inline actions with the ordinal and receiver of the action that sent them
    inline_actions: Vec<(Action, u32, Name)>,
    console: String,
}

impl<'c, 'a> ApplyContext<'c, 'a> {
    pub(crate) fn new(
        trx_context: &'c mut TransactionContext<'a>,
        act: Action,
        receiver: Name,
        recurse_depth: u32,
        creator_action_ordinal: u32,
        inline: bool,
        sender: Option<Name>,
    ) -> Self {
        ApplyContext {
            trx_context,
            act,
            receiver,
            recurse_depth,
            creator_action_ordinal,
            first_receiver_action_ordinal: 0,
            action_ordinal: 0,
            inline,
            sender,
            privileged: false,
            notified: Vec::new(),
            inline_actions: Vec::new(),
            console: String::new(),
        }
    }

    /// The controller running the transaction
    pub(crate) fn control(&self) -> &'a Controller {
        self.trx_context.control
    }

    /// Read and write the state store
    pub(crate) fn with_db<R>(
        &mut self,
        f: impl FnOnce(&mut StateDb) -> ChainResult<R>,
    ) -> ChainResult<R> {
        self.control().with_db(f)
    }

    fn read_db<R>(&self, f: impl FnOnce(&StateDb) -> ChainResult<R>) -> ChainResult<R> {
        self.control().read_db(f)
    }

    /// Charge `delta` bytes of RAM to `account`
    pub(crate) fn add_ram_usage(&mut self, account: Name, delta: i64) -> ChainResult<()> {
        self.trx_context.add_ram_usage(account, delta)
    }

    /// Remove the deferred transaction `(sender, sender_id)` and refund its RAM
    pub(crate) fn cancel_deferred_transaction(
        &mut self,
        sender_id: u128,
        sender: Name,
    ) -> ChainResult<bool> {
        let key = generated_transaction_key(sender, sender_id);
        let removed = self.with_db(|db| {
            match db.get_object::<GeneratedTransactionObject>(&key)? {
                Some(gto) => {
                    db.delete(&key)?;
                    Ok(Some(gto))
                }
                None => Ok(None),
            }
        })?;
        match removed {
            Some(gto) => {
                self.add_ram_usage(gto.payer, -(gto.billable_size() as i64))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run the action for its receiver, then for the notified accounts, then the inline actions
    pub(crate) fn exec(mut self) -> ChainResult<()> {
        self.notified.push(self.receiver);
        self.exec_one()?;
        self.first_receiver_action_ordinal = self.action_ordinal;

        let mut index = 1;
        while index < self.notified.len() {
            self.receiver = self.notified[index];
            self.exec_one()?;
            index += 1;
        }

        if !self.inline_actions.is_empty() {
            let max_depth = self.trx_context.parameters.max_inline_action_depth as u32;
            if self.recurse_depth >= max_depth {
                return Err(ChainError::Transaction(
                    "max inline action depth per transaction reached".to_string(),
                ));
            }
        }
        let inline_actions = std::mem::take(&mut self.inline_actions);
        for (action, creator_ordinal, sender) in inline_actions {
            self.trx_context.execute_action(
                action,
                creator_ordinal,
                true,
                self.recurse_depth + 1,
                Some(sender),
            )?;
        }
        Ok(())
    }

    fn exec_one(&mut self) -> ChainResult<()> {
        let is_first_receiver = self.notified.first() == Some(&self.receiver)
            && self.first_receiver_action_ordinal == 0;
        let creator_action_ordinal = if is_first_receiver {
            self.creator_action_ordinal
        } else {
            self.first_receiver_action_ordinal
        };
        let traces = &mut self.trx_context.trace.action_traces;
        self.action_ordinal = traces.len() as u32 + 1;
        traces.push(ActionTrace {
            action_ordinal: self.action_ordinal,
            creator_action_ordinal,
            receiver: self.receiver,
            act: self.act.clone(),
            receipt: None,
            elapsed_us: 0,
            console: String::new(),
            inline: self.inline && is_first_receiver,
            except: None,
        });
        self.console.clear();

        let result = self.run_receiver();

        let index = (self.action_ordinal - 1) as usize;
        let console = std::mem::take(&mut self.console);
        let trace = &mut self.trx_context.trace.action_traces[index];
        trace.console = console;
        match result {
            Ok((receipt, cpu_usage_us)) => {
                trace.receipt = Some(receipt.clone());
                trace.elapsed_us = cpu_usage_us;
                self.trx_context.executed.push(receipt);
                Ok(())
            }
            Err(err) => {
                trace.except = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Run the native handler and the deployed code of the receiver, then issue the receipt
    fn run_receiver(&mut self) -> ChainResult<(ActionReceipt, u64)> {
        let control = self.control();
        let receiver = self.receiver;
        let metadata = self.metadata(receiver)?;
        self.privileged = metadata.privileged;

        if self.trx_context.enforce_whiteblacklist && control.is_producing_block() {
            control.check_contract_list(receiver)?;
            control.check_action_list(self.act.account, self.act.name)?;
        }

        if let Some(handler) = find_native_handler(receiver, self.act.account, self.act.name) {
            handler(self)?;
        }

        let mut cpu_usage_us = 0u64;
        let runs_code = !metadata.code_hash.is_zero()
            && !(self.act.account == SYSTEM_ACCOUNT_NAME
                && self.act.name == SETCODE
                && receiver == SYSTEM_ACCOUNT_NAME);
        if runs_code {
            let executor = control.executor.clone();
            let result = executor.execute(&metadata.code_hash, self)?;
            cpu_usage_us = result.cpu_usage_us as u64;
            self.trx_context.add_cpu_usage(cpu_usage_us);
            match result.status {
                ExecutionStatus::Success => {}
                ExecutionStatus::SoftFail(message) => return Err(ChainError::ActionFailed(message)),
                ExecutionStatus::HardFail(message) => {
                    return Err(ChainError::ExecutorFatal(message))
                }
            }
            self.trx_context.checktime()?;
        }

        let act_digest = self.act.digest()?;
        let authorizers: Vec<Name> = self.act.authorization.iter().map(|auth| auth.actor).collect();
        let receipt = self.with_db(|db| {
            let mut dgpo: DynamicGlobalPropertyObject = db
                .get_object(DYNAMIC_GLOBAL_PROPERTY_KEY)?
                .ok_or_else(|| {
                    ChainError::Misc("dynamic global properties are not initialized".to_string())
                })?;
            dgpo.global_action_sequence += 1;
            db.put_object(DYNAMIC_GLOBAL_PROPERTY_KEY.to_vec(), &dgpo)?;

            let mut receiver_metadata = load_metadata(db, receiver)?;
            receiver_metadata.recv_sequence += 1;
            db.put_object(account_metadata_key(receiver), &receiver_metadata)?;

            for actor in authorizers {
                let mut actor_metadata = load_metadata(db, actor)?;
                actor_metadata.auth_sequence += 1;
                db.put_object(account_metadata_key(actor), &actor_metadata)?;
            }

            Ok(ActionReceipt {
                receiver,
                act_digest,
                global_sequence: dgpo.global_action_sequence,
                recv_sequence: receiver_metadata.recv_sequence,
                code_sequence: receiver_metadata.code_sequence,
                abi_sequence: receiver_metadata.abi_sequence,
            })
        })?;
        Ok((receipt, cpu_usage_us))
    }

    fn metadata(&self, account: Name) -> ChainResult<AccountMetadataObject> {
        self.read_db(|db| load_metadata(db, account))
    }

    fn account_exists(&self, account: Name) -> ChainResult<bool> {
        self.read_db(|db| Ok(db.get(&account_key(account)).is_some()))
    }

    /// Bill a change of `delta` bytes of contract storage to `payer`
    fn update_db_usage(&mut self, payer: Name, delta: i64) -> ChainResult<()> {
        if delta > 0 && !(self.privileged || payer == self.receiver) {
            if !(self.control().is_ram_billing_in_notify_allowed() || self.receiver == self.act.account) {
                return Err(ChainError::SubjectiveBlockProduction(
                    "cannot charge RAM to other accounts during notify".to_string(),
                ));
            }
            self.require_authorization(payer)?;
        }
        self.add_ram_usage(payer, delta)
    }

    fn row_billable_size(value: &[u8]) -> i64 {
        (value.len() as u64 + CONTRACT_ROW_OVERHEAD) as i64
    }
}

fn load_metadata(db: &StateDb, account: Name) -> ChainResult<AccountMetadataObject> {
    db.get_object(&account_metadata_key(account))?
        .ok_or_else(|| ChainError::Transaction(format!("account {} does not exist", account)))
}

impl ActionContext for ApplyContext<'_, '_> {
    fn receiver(&self) -> Name {
        self.receiver
    }

    fn action(&self) -> &Action {
        &self.act
    }

    fn trx_id(&self) -> TransactionId {
        self.trx_context.id
    }

    fn block_num(&self) -> u32 {
        self.trx_context.trace.block_num
    }

    fn block_time(&self) -> BlockTimestamp {
        self.trx_context.trace.block_time
    }

    fn recurse_depth(&self) -> u32 {
        self.recurse_depth
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn get_sender(&self) -> Option<Name> {
        self.sender
    }

    fn has_authorization(&self, account: Name) -> bool {
        self.act.authorization.iter().any(|auth| auth.actor == account)
    }

    fn require_authorization(&self, account: Name) -> ChainResult<()> {
        if self.has_authorization(account) {
            Ok(())
        } else {
            Err(ChainError::Authorization(format!("missing authority of {}", account)))
        }
    }

    fn require_recipient(&mut self, account: Name) -> ChainResult<()> {
        if self.notified.contains(&account) {
            return Ok(());
        }
        if !self.account_exists(account)? {
            return Err(ChainError::Transaction(format!(
                "cannot notify {}: the account does not exist",
                account
            )));
        }
        self.notified.push(account);
        Ok(())
    }

    fn send_inline(&mut self, action: Action) -> ChainResult<()> {
        let control = self.control();
        self.read_db(|db| {
            if db.get(&account_key(action.account)).is_none() {
                return Err(ChainError::Transaction(format!(
                    "inline action's code account {} does not exist",
                    action.account
                )));
            }
            for auth in &action.authorization {
                if db.get(&account_key(auth.actor)).is_none() {
                    return Err(ChainError::Transaction(format!(
                        "inline action's authorizing actor {} does not exist",
                        auth.actor
                    )));
                }
                if control.authorization.find_permission(db, auth)?.is_none() {
                    return Err(ChainError::Transaction(format!(
                        "inline action's authorizations include a non-existent permission: {}",
                        auth
                    )));
                }
            }
            Ok(())
        })?;

        if control.is_producing_block() {
            let actors: BTreeSet<Name> = action.authorization.iter().map(|auth| auth.actor).collect();
            control.check_actor_list(&actors)?;
        }

        let size = bincode::serialized_size(&action).map_err(|err| {
            ChainError::Transaction(format!("inline action cannot be serialized: {}", err))
        })?;
        let max_size = self.trx_context.parameters.max_inline_action_size as u64;
        if size > max_size {
            return Err(ChainError::Transaction(format!(
                "inline action too big: {} > {}",
                size, max_size
            )));
        }
        let max_nonprivileged = control.config.max_nonprivileged_inline_action_size as u64;
        if !self.privileged && control.is_producing_block() && size > max_nonprivileged {
            return Err(ChainError::SubjectiveBlockProduction(format!(
                "inline action too big for nonprivileged account {}: {} > {}",
                self.receiver, size, max_nonprivileged
            )));
        }

        if !control.skip_auth_check() && !self.privileged {
            for auth in &action.authorization {
                if auth.actor != self.receiver && !self.act.authorization.contains(auth) {
                    return Err(ChainError::Authorization(format!(
                        "inline action of {} declares authority {} it was not given",
                        self.receiver, auth
                    )));
                }
            }
        }

        self.inline_actions
            .push((action, self.action_ordinal, self.receiver));
        Ok(())
    }

    fn get_row(&self, table: Name, primary_key: u64) -> ChainResult<Option<Vec<u8>>> {
        let key = contract_row_key(self.receiver, table, primary_key);
        self.read_db(|db| {
            Ok(db
                .get_object::<ContractRowObject>(&key)?
                .map(|row| row.value))
        })
    }

    fn set_row(&mut self, payer: Name, table: Name, primary_key: u64, value: Vec<u8>) -> ChainResult<()> {
        if payer.is_empty() {
            return Err(ChainError::Transaction("must specify a valid account to pay for new record".to_string()));
        }
        if !self.account_exists(payer)? {
            return Err(ChainError::Transaction(format!("payer {} does not exist", payer)));
        }
        let key = contract_row_key(self.receiver, table, primary_key);
        let previous = self.read_db(|db| Ok(db.get_object::<ContractRowObject>(&key)?))?;
        let new_size = Self::row_billable_size(&value);
        match previous {
            None => self.update_db_usage(payer, new_size)?,
            Some(old) => {
                let old_size = Self::row_billable_size(&old.value);
                if old.payer != payer {
                    self.update_db_usage(old.payer, -old_size)?;
                    self.update_db_usage(payer, new_size)?;
                } else {
                    self.update_db_usage(payer, new_size - old_size)?;
                }
            }
        }
        self.with_db(|db| {
            db.put_object(key, &ContractRowObject { payer, value })?;
            Ok(())
        })
    }

    fn remove_row(&mut self, table: Name, primary_key: u64) -> ChainResult<bool> {
        let key = contract_row_key(self.receiver, table, primary_key);
        let previous = self.with_db(|db| {
            let row = db.get_object::<ContractRowObject>(&key)?;
            if row.is_some() {
                db.delete(&key)?;
            }
            Ok(row)
        })?;
        match previous {
            Some(row) => {
                self.update_db_usage(row.payer, -Self::row_billable_size(&row.value))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn schedule_deferred(
        &mut self,
        sender_id: u128,
        payer: Name,
        mut trx: Transaction,
        replace_existing: bool,
    ) -> ChainResult<()> {
        let control = self.control();
        if trx.actions.is_empty() {
            return Err(ChainError::DeferredTransaction(
                "deferred transaction must have at least one action".to_string(),
            ));
        }
        let parameters = self.trx_context.parameters.clone();
        if trx.delay_sec > parameters.max_transaction_delay {
            return Err(ChainError::DeferredTransaction(format!(
                "delay of {} s exceeds the maximum transaction delay of {} s",
                trx.delay_sec, parameters.max_transaction_delay
            )));
        }

        let no_duplicate_deferred_id =
            control.is_builtin_activated(BuiltinProtocolFeature::NoDuplicateDeferredId);
        let trx_id = if no_duplicate_deferred_id {
            trx.expiration = TimePointSec::default();
            trx.ref_block_num = 0;
            trx.ref_block_prefix = 0;
            let inner_id = trx.id()?;
            Hash::compute_from_tuple(&[
                &inner_id.to_bytes()[..],
                &self.trx_context.id.to_bytes()[..],
                &self.receiver.as_u64().to_be_bytes(),
                &sender_id.to_be_bytes(),
            ])
        } else {
            let pending_time = self.trx_context.trace.block_time.to_time_point_sec();
            trx.expiration = pending_time.plus_secs(1);
            let head_id: BlockId = control.head_block_id();
            trx.set_reference_block(&head_id);
            trx.id()?
        };
        self.trx_context.add_net_usage(
            parameters.base_per_transaction_net_usage as u64 + TRANSACTION_ID_NET_USAGE,
        )?;

        if !control.skip_auth_check() && !self.privileged {
            if payer != self.receiver {
                self.require_authorization(payer)?;
            }
            for act in &trx.actions {
                for auth in &act.authorization {
                    if auth.actor != self.receiver && !self.act.authorization.contains(auth) {
                        return Err(ChainError::Authorization(format!(
                            "deferred transaction of {} declares authority {} it was not given",
                            self.receiver, auth
                        )));
                    }
                }
            }
        }

        let published = self.trx_context.trace.block_time.to_time_point_sec();
        let delay_until = published.plus_secs(trx.delay_sec);
        let mut gto = GeneratedTransactionObject {
            trx_id,
            sender: self.receiver,
            sender_id,
            payer,
            delay_until,
            expiration: delay_until.plus_secs(parameters.deferred_trx_expiration_window),
            published,
            trx,
        };

        let key = generated_transaction_key(self.receiver, sender_id);
        let existing = self.read_db(|db| Ok(db.get_object::<GeneratedTransactionObject>(&key)?))?;
        if let Some(existing) = existing {
            if !replace_existing {
                return Err(ChainError::DeferredTransaction(
                    "deferred transaction with the same sender_id and payer already exists"
                        .to_string(),
                ));
            }
            let replace_deferred_activated =
                control.is_builtin_activated(BuiltinProtocolFeature::ReplaceDeferred);
            if !replace_deferred_activated
                && control.is_producing_block()
                && !control.all_subjective_mitigations_disabled()
            {
                return Err(ChainError::SubjectiveBlockProduction(
                    "replacing a deferred transaction is temporarily disabled".to_string(),
                ));
            }
            let original_size = existing.billable_size();
            if replace_deferred_activated {
                self.add_ram_usage(existing.payer, -(original_size as i64))?;
            } else {
                control.add_to_ram_correction(existing.payer, original_size)?;
                gto.trx_id = existing.trx_id;
            }
        }

        if !(control.is_ram_billing_in_notify_allowed()
            || self.receiver == self.act.account
            || self.receiver == payer
            || self.privileged)
        {
            return Err(ChainError::SubjectiveBlockProduction(
                "cannot charge RAM to other accounts during notify".to_string(),
            ));
        }

        let size = gto.billable_size();
        self.with_db(|db| {
            db.put_object(key, &gto)?;
            Ok(())
        })?;
        self.add_ram_usage(payer, size as i64)
    }

    fn cancel_deferred(&mut self, sender_id: u128) -> ChainResult<bool> {
        let sender = self.receiver;
        self.cancel_deferred_transaction(sender_id, sender)
    }

    fn set_proposed_producers(&mut self, producers: Vec<ProducerKey>) -> ChainResult<i64> {
        if !self.privileged {
            return Err(ChainError::Authorization(format!(
                "{} is not privileged and cannot propose producers",
                self.receiver
            )));
        }
        self.control().set_proposed_producers(producers)
    }

    fn is_builtin_activated(&self, feature: BuiltinProtocolFeature) -> bool {
        self.control().is_builtin_activated(feature)
    }

    fn console_append(&mut self, text: &str) {
        self.console.push_str(text);
    }
}
