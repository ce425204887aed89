// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::apply_context::ApplyContext;
use crate::controller::Controller;
use crate::native_handlers::transaction_id_to_sender_id;
use cairn_chain_exports::state_objects::{
    account_key, generated_transaction_key, transaction_key, GeneratedTransactionObject,
    TransactionObject,
};
use cairn_chain_exports::{ChainError, ChainResult, TransactionTrace};
use cairn_db_exports::UndoSession;
use cairn_models::action::{Action, ActionReceipt};
use cairn_models::genesis::ChainParameters;
use cairn_models::name::Name;
use cairn_models::timestamp::TimePointSec;
use cairn_models::transaction::{Transaction, TransactionId};
use std::collections::BTreeSet;
use std::time::Instant;

/// Net usage billed for a transaction id, charged when a transaction is deferred
pub(crate) const TRANSACTION_ID_NET_USAGE: u64 = 32;

/// What a transaction left behind once it ran, successfully or not
#[derive(Debug)]
pub(crate) struct TransactionOutcome {
    /// writes of the transaction, still open
    pub session: UndoSession,
    pub trace: TransactionTrace,
    pub executed: Vec<ActionReceipt>,
    pub billed_cpu_time_us: u64,
    pub net_usage: u64,
}

/// Runs one transaction inside its own undo session and accounts its resources.
///
/// Limits are the tightest of what the block has left, what the chain allows per transaction
/// and what the transaction declares for itself. The `*_due_to_block` flags record whether the
/// block was the tightest one, in which case exceeding the limit is not the transaction's fault.
pub(crate) struct TransactionContext<'a> {
    pub(crate) control: &'a Controller,
    pub(crate) trx: Transaction,
    pub(crate) id: TransactionId,
    session: UndoSession,
    pub(crate) trace: TransactionTrace,
    start: Instant,
    deadline: Option<Instant>,
    pub(crate) published: TimePointSec,
    pub(crate) executed: Vec<ActionReceipt>,
    pub(crate) bill_to_accounts: BTreeSet<Name>,
    validate_ram_usage: BTreeSet<Name>,
    net_limit: u64,
    net_limit_due_to_block: bool,
    pub(crate) net_usage: u64,
    cpu_limit: u64,
    cpu_limit_due_to_block: bool,
    cpu_leeway_us: u64,
    executor_cpu_us: u64,
    pub(crate) billed_cpu_time_us: u64,
    pub(crate) explicit_billed_cpu_time: bool,
    pub(crate) enforce_whiteblacklist: bool,
    delay_sec: u32,
    is_input: bool,
    is_initialized: bool,
    pub(crate) parameters: ChainParameters,
}

impl<'a> TransactionContext<'a> {
    pub(crate) fn new(
        control: &'a Controller,
        trx: Transaction,
        id: TransactionId,
        deadline: Option<Instant>,
    ) -> ChainResult<Self> {
        let block_num = control.pending_block_num()?;
        let block_time = control.pending_block_time()?;
        let parameters = control.get_global_properties()?.configuration;
        let mut trace = TransactionTrace::new(id, block_num, block_time);
        trace.producer_block_id = control.pending_producer_block_id();
        let session = UndoSession::new(&control.store, !control.skip_db_sessions());
        Ok(TransactionContext {
            control,
            trx,
            id,
            session,
            trace,
            start: Instant::now(),
            deadline,
            published: block_time.to_time_point_sec(),
            executed: Vec::new(),
            bill_to_accounts: BTreeSet::new(),
            validate_ram_usage: BTreeSet::new(),
            net_limit: 0,
            net_limit_due_to_block: true,
            net_usage: 0,
            cpu_limit: 0,
            cpu_limit_due_to_block: true,
            cpu_leeway_us: 0,
            executor_cpu_us: 0,
            billed_cpu_time_us: 0,
            explicit_billed_cpu_time: false,
            enforce_whiteblacklist: true,
            delay_sec: 0,
            is_input: false,
            is_initialized: false,
            parameters,
        })
    }

    fn init(&mut self, initial_net_usage: u64) -> ChainResult<()> {
        if self.is_initialized {
            return Err(ChainError::Transaction(
                "cannot initialize a transaction context twice".to_string(),
            ));
        }
        let control = self.control;
        let (block_cpu_limit, block_net_limit) = control.read_db(|db| {
            Ok((
                control
                    .resource_limits
                    .get_block_cpu_limit(db, &self.parameters)?,
                control
                    .resource_limits
                    .get_block_net_limit(db, &self.parameters)?,
            ))
        })?;

        self.net_limit = block_net_limit;
        self.net_limit_due_to_block = true;
        let max_trx_net = self.parameters.max_transaction_net_usage as u64;
        if max_trx_net <= self.net_limit {
            self.net_limit = max_trx_net;
            self.net_limit_due_to_block = false;
        }
        if self.trx.max_net_usage_words > 0 {
            let declared = self.trx.max_net_usage_words as u64 * 8;
            if declared <= self.net_limit {
                self.net_limit = declared;
                self.net_limit_due_to_block = false;
            }
        }

        self.cpu_limit = block_cpu_limit;
        self.cpu_limit_due_to_block = true;
        let max_trx_cpu = self.parameters.max_transaction_cpu_usage as u64;
        if max_trx_cpu <= self.cpu_limit {
            self.cpu_limit = max_trx_cpu;
            self.cpu_limit_due_to_block = false;
        }
        if self.trx.max_cpu_usage_ms > 0 {
            let declared = self.trx.max_cpu_usage_ms as u64 * 1000;
            if declared <= self.cpu_limit {
                self.cpu_limit = declared;
                self.cpu_limit_due_to_block = false;
            }
        }

        if self.is_input && control.is_producing_block() && !self.explicit_billed_cpu_time {
            self.cpu_leeway_us = control.subjective_cpu_leeway.unwrap_or(0) as u64;
        }

        if self.explicit_billed_cpu_time {
            self.validate_cpu_usage_to_bill(self.billed_cpu_time_us, false)?;
        }

        self.bill_to_accounts = self
            .trx
            .actions
            .iter()
            .flat_map(|act| act.authorization.iter().map(|auth| auth.actor))
            .collect();

        self.net_usage += initial_net_usage;
        self.check_net_usage()?;
        self.is_initialized = true;
        Ok(())
    }

    /// Transaction created by the controller itself, such as `onblock`
    pub(crate) fn init_for_implicit_trx(&mut self) -> ChainResult<()> {
        self.enforce_whiteblacklist = false;
        self.init(0)
    }

    /// Transaction pushed by a user or carried by a block
    pub(crate) fn init_for_input_trx(
        &mut self,
        packed_trx_size: u64,
        skip_recording: bool,
    ) -> ChainResult<()> {
        if self.trx.actions.is_empty() {
            return Err(ChainError::Transaction(
                "there must be at least one action".to_string(),
            ));
        }
        if self.trx.delay_sec > self.parameters.max_transaction_delay {
            return Err(ChainError::Transaction(format!(
                "delay of {} s exceeds the maximum transaction delay of {} s",
                self.trx.delay_sec, self.parameters.max_transaction_delay
            )));
        }
        let base = self.parameters.base_per_transaction_net_usage as u64;
        let mut initial_net_usage = base + packed_trx_size;
        if self.trx.delay_sec > 0 {
            initial_net_usage += base + TRANSACTION_ID_NET_USAGE;
        }
        self.delay_sec = self.trx.delay_sec;
        self.is_input = true;

        let control = self.control;
        if !control.skip_trx_checks() {
            control.validate_expiration(&self.trx)?;
            control.validate_tapos(&self.trx)?;
            let enforce_actor_lists = self.enforce_whiteblacklist && control.is_producing_block();
            self.validate_referenced_accounts(enforce_actor_lists)?;
        }

        self.init(initial_net_usage)?;
        if !skip_recording {
            self.record_transaction()?;
        }
        Ok(())
    }

    /// Deferred transaction taken from the queue
    pub(crate) fn init_for_deferred_trx(&mut self, published: TimePointSec) -> ChainResult<()> {
        self.published = published;
        self.trace.scheduled = true;
        self.init(0)
    }

    /// Run the actions, or queue the transaction when it is delayed
    pub(crate) fn exec(&mut self) -> ChainResult<()> {
        if !self.is_initialized {
            return Err(ChainError::Transaction(
                "transaction context must be initialized before execution".to_string(),
            ));
        }
        if self.delay_sec == 0 {
            let actions = self.trx.actions.clone();
            for act in actions {
                self.execute_action(act, 0, false, 0, None)?;
            }
        } else {
            self.schedule_transaction()?;
        }
        Ok(())
    }

    /// Check the final usage and bill it
    pub(crate) fn finalize(&mut self) -> ChainResult<()> {
        if !self.is_initialized {
            return Err(ChainError::Transaction(
                "transaction context must be initialized before finalization".to_string(),
            ));
        }
        let control = self.control;
        for account in &self.validate_ram_usage {
            control.read_db(|db| control.resource_limits.verify_account_ram_usage(db, *account))?;
        }

        self.net_usage = self.net_usage.div_ceil(8) * 8;
        self.check_net_usage()?;

        self.trace.elapsed_us = self.start.elapsed().as_micros() as u64;
        if !self.explicit_billed_cpu_time {
            self.billed_cpu_time_us = self
                .executor_cpu_us
                .max(self.parameters.min_transaction_cpu_usage as u64);
        }
        self.validate_cpu_usage_to_bill(self.billed_cpu_time_us, true)?;
        self.trace.net_usage = self.net_usage;

        let ordinal = self.trace.block_time.slot;
        let greylist = if control.is_producing_block() {
            control.config.resource_greylist.clone()
        } else {
            BTreeSet::new()
        };
        let billed_cpu = self.billed_cpu_time_us;
        let net_usage = self.net_usage;
        control.with_db(|db| {
            control.resource_limits.add_transaction_usage(
                db,
                &self.bill_to_accounts,
                billed_cpu,
                net_usage,
                ordinal,
                &self.parameters,
                &greylist,
            )
        })
    }

    /// Close the context, handing over its session for the caller to squash or undo
    pub(crate) fn into_outcome(self) -> TransactionOutcome {
        TransactionOutcome {
            session: self.session,
            trace: self.trace,
            executed: self.executed,
            billed_cpu_time_us: self.billed_cpu_time_us,
            net_usage: self.net_usage,
        }
    }

    /// Bill cpu decided elsewhere instead of measuring it
    pub(crate) fn set_explicit_billed_cpu(&mut self, billed_cpu_time_us: u64) {
        self.billed_cpu_time_us = billed_cpu_time_us;
        self.explicit_billed_cpu_time = true;
    }

    pub(crate) fn add_net_usage(&mut self, usage: u64) -> ChainResult<()> {
        self.net_usage += usage;
        self.check_net_usage()
    }

    pub(crate) fn add_cpu_usage(&mut self, usage_us: u64) {
        self.executor_cpu_us += usage_us;
    }

    /// Charge `delta` bytes of RAM to `account`; increases are checked against its quota at
    /// finalization
    pub(crate) fn add_ram_usage(&mut self, account: Name, delta: i64) -> ChainResult<()> {
        self.control.with_db(|db| {
            self.control
                .resource_limits
                .add_pending_ram_usage(db, account, delta)
        })?;
        if delta > 0 {
            self.validate_ram_usage.insert(account);
        }
        Ok(())
    }

    /// Fail once the deadline passed or the cpu spent exceeds the limit
    pub(crate) fn checktime(&self) -> ChainResult<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(ChainError::DeadlineExceeded(format!(
                    "deadline exceeded after {} us",
                    self.start.elapsed().as_micros()
                )));
            }
        }
        if !self.explicit_billed_cpu_time
            && self.executor_cpu_us > self.cpu_limit + self.cpu_leeway_us
        {
            return Err(self.cpu_exhausted(self.executor_cpu_us));
        }
        Ok(())
    }

    fn cpu_exhausted(&self, billed: u64) -> ChainError {
        let message = format!(
            "billed CPU time ({} us) is greater than the maximum billable CPU time for the transaction ({} us)",
            billed, self.cpu_limit
        );
        if self.cpu_limit_due_to_block {
            ChainError::BlockResourceExhausted(message)
        } else {
            ChainError::ResourceExhausted(message)
        }
    }

    fn validate_cpu_usage_to_bill(&self, billed: u64, check_minimum: bool) -> ChainResult<()> {
        if self.control.skip_trx_checks() {
            return Ok(());
        }
        let minimum = self.parameters.min_transaction_cpu_usage as u64;
        if check_minimum && billed < minimum {
            return Err(ChainError::Transaction(format!(
                "cannot bill CPU time less than the minimum of {} us",
                minimum
            )));
        }
        if billed > self.cpu_limit {
            return Err(self.cpu_exhausted(billed));
        }
        Ok(())
    }

    fn check_net_usage(&self) -> ChainResult<()> {
        if self.control.skip_trx_checks() || self.net_usage <= self.net_limit {
            return Ok(());
        }
        let message = format!(
            "transaction net usage is too high: {} > {}",
            self.net_usage, self.net_limit
        );
        if self.net_limit_due_to_block {
            Err(ChainError::BlockResourceExhausted(message))
        } else {
            Err(ChainError::ResourceExhausted(message))
        }
    }

    /// Run `act` and everything it triggers
    pub(crate) fn execute_action(
        &mut self,
        act: Action,
        creator_action_ordinal: u32,
        inline: bool,
        recurse_depth: u32,
        sender: Option<Name>,
    ) -> ChainResult<()> {
        let receiver = act.account;
        ApplyContext::new(
            self,
            act,
            receiver,
            recurse_depth,
            creator_action_ordinal,
            inline,
            sender,
        )
        .exec()
    }

    /// Every account and permission named by the transaction must exist
    pub(crate) fn validate_referenced_accounts(&self, enforce_actor_lists: bool) -> ChainResult<()> {
        let control = self.control;
        let mut actors = BTreeSet::new();
        let mut one_auth = false;
        control.read_db(|db| {
            for act in &self.trx.actions {
                if db.get(&account_key(act.account)).is_none() {
                    return Err(ChainError::Transaction(format!(
                        "action's code account '{}' does not exist",
                        act.account
                    )));
                }
                for auth in &act.authorization {
                    one_auth = true;
                    if db.get(&account_key(auth.actor)).is_none() {
                        return Err(ChainError::Transaction(format!(
                            "action's authorizing actor '{}' does not exist",
                            auth.actor
                        )));
                    }
                    if control.authorization.find_permission(db, auth)?.is_none() {
                        return Err(ChainError::Transaction(format!(
                            "action's authorizations include a non-existent permission: {}",
                            auth
                        )));
                    }
                    if enforce_actor_lists {
                        actors.insert(auth.actor);
                    }
                }
            }
            Ok(())
        })?;
        if !one_auth {
            return Err(ChainError::Transaction(
                "transaction must have at least one authorization".to_string(),
            ));
        }
        if enforce_actor_lists {
            control.check_actor_list(&actors)?;
        }
        Ok(())
    }

    fn record_transaction(&mut self) -> ChainResult<()> {
        let record = TransactionObject {
            trx_id: self.id,
            expiration: self.trx.expiration,
        };
        self.control.with_db(|db| {
            let key = transaction_key(&record.trx_id);
            if db.get(&key).is_some() {
                return Err(ChainError::DuplicateTransaction(format!(
                    "duplicate transaction {}",
                    record.trx_id
                )));
            }
            db.put_object(key, &record)?;
            Ok(())
        })
    }

    /// Store a delayed input transaction in the deferred queue, paid by its first authorizer
    fn schedule_transaction(&mut self) -> ChainResult<()> {
        let payer = self.trx.first_authorizer().ok_or_else(|| {
            ChainError::Transaction("a delayed transaction needs an authorizer".to_string())
        })?;
        let sender_id = transaction_id_to_sender_id(&self.id);
        let delay_until = self.published.plus_secs(self.delay_sec);
        let gto = GeneratedTransactionObject {
            trx_id: self.id,
            sender: Name::default(),
            sender_id,
            payer,
            delay_until,
            expiration: delay_until.plus_secs(self.parameters.deferred_trx_expiration_window),
            published: self.published,
            trx: self.trx.clone(),
        };
        let size = gto.billable_size();
        self.control.with_db(|db| {
            db.put_object(generated_transaction_key(gto.sender, gto.sender_id), &gto)?;
            Ok(())
        })?;
        self.add_ram_usage(payer, size as i64)
    }
}
