// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::native_handlers::{encode_payload, NewAccount, SetCode, NEWACCOUNT, SETCODE};
use crate::Controller;
use cairn_chain_exports::test_exports::ScriptedActionExecutor;
use cairn_chain_exports::{BlockState, ChainConfig, ChainResult, DbReadMode, TransactionTrace};
use cairn_models::action::{Action, PermissionLevel};
use cairn_models::authority::Authority;
use cairn_models::block::SignedBlock;
use cairn_models::constants::{ACTIVE_NAME, SYSTEM_ACCOUNT_NAME};
use cairn_models::genesis::GenesisState;
use cairn_models::name::Name;
use cairn_models::timestamp::BlockTimestamp;
use cairn_models::transaction::{SignedTransaction, Transaction, TransactionMetadata};
use cairn_protocol_features::ProtocolFeatureSet;
use cairn_signature::KeyPair;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Slot of the genesis block of every test chain
pub const GENESIS_SLOT: u32 = 1_000_000;

/// Code deployed on test contracts, only its hash matters
pub const TEST_CODE: &[u8] = b"\0asm test contract";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Seed of the genesis producer key, shared by every test chain so they agree on the chain id
pub fn genesis_keypair() -> KeyPair {
    KeyPair::from_seed(&[7u8; cairn_signature::SECRET_KEY_SIZE_BYTES])
}

pub fn test_genesis() -> GenesisState {
    GenesisState::new(
        BlockTimestamp::new(GENESIS_SLOT),
        genesis_keypair().get_public_key(),
    )
}

/// A controller on a temporary directory, its executor and the keys of its producers
pub struct TestChain {
    pub control: Controller,
    pub executor: Arc<ScriptedActionExecutor>,
    pub keys: Vec<KeyPair>,
    pub dir: TempDir,
}

impl TestChain {
    pub fn new() -> Self {
        TestChain::with_read_mode(DbReadMode::Speculative)
    }

    pub fn with_read_mode(read_mode: DbReadMode) -> Self {
        init_logging();
        let dir = TempDir::new().expect("could not create temp dir");
        let executor = Arc::new(ScriptedActionExecutor::new());
        let control = open_controller(dir.path(), read_mode, executor.clone())
            .expect("could not start controller");
        TestChain {
            control,
            executor,
            keys: vec![genesis_keypair()],
            dir,
        }
    }

    /// Start a fresh controller from `dir`, as after a restart
    pub fn reopen(self) -> Self {
        let TestChain {
            control,
            executor,
            keys,
            dir,
        } = self;
        let read_mode = control.get_read_mode();
        drop(control);
        let control =
            open_controller(dir.path(), read_mode, executor.clone()).expect("could not reopen");
        TestChain {
            control,
            executor,
            keys,
            dir,
        }
    }

    /// Shut down cleanly then start again from `dir`
    pub fn close_and_reopen(self) -> Self {
        let TestChain {
            control,
            executor,
            keys,
            dir,
        } = self;
        let read_mode = control.get_read_mode();
        control.close().expect("could not close controller");
        let control =
            open_controller(dir.path(), read_mode, executor.clone()).expect("could not reopen");
        TestChain {
            control,
            executor,
            keys,
            dir,
        }
    }

    /// Key of the producer scheduled for the pending block
    pub fn signing_key(&self) -> KeyPair {
        let expected = self
            .control
            .pending_block_signing_key()
            .expect("no pending block");
        self.keys
            .iter()
            .find(|key| key.get_public_key() == expected)
            .cloned()
            .expect("no key for the scheduled producer")
    }

    /// Open a block on the slot following the head
    pub fn start_next_block(&mut self) {
        let when = self.control.head_block_time().next();
        self.control.start_block(when, 0).expect("start_block failed");
    }

    /// Finalize, sign and commit the pending block
    pub fn finish_block(&mut self) -> Arc<BlockState> {
        self.control.finalize_block().expect("finalize_block failed");
        let key = self.signing_key();
        self.control.sign_block(&key).expect("sign_block failed");
        self.control.commit_block().expect("commit_block failed");
        self.control.head_block_state()
    }

    pub fn produce_block(&mut self) -> Arc<BlockState> {
        self.start_next_block();
        self.finish_block()
    }

    /// Produce a block `skip + 1` slots after the head
    pub fn produce_block_after(&mut self, skip: u32) -> Arc<BlockState> {
        let when = self.control.head_block_time().plus_slots(skip + 1);
        self.control.start_block(when, 0).expect("start_block failed");
        self.finish_block()
    }

    pub fn produce_blocks(&mut self, count: usize) -> Vec<Arc<BlockState>> {
        (0..count).map(|_| self.produce_block()).collect()
    }

    /// Transaction on top of the head, expiring a minute after the pending block, signed with
    /// the genesis key
    pub fn make_transaction(&self, actions: Vec<Action>) -> Arc<TransactionMetadata> {
        self.make_transaction_with(actions, 0, &genesis_keypair())
    }

    pub fn make_transaction_with(
        &self,
        actions: Vec<Action>,
        delay_sec: u32,
        key: &KeyPair,
    ) -> Arc<TransactionMetadata> {
        let now = match self.control.pending_block_time() {
            Ok(time) => time,
            Err(_) => self.control.head_block_time().next(),
        };
        let mut trx = Transaction {
            expiration: now.to_time_point_sec().plus_secs(60),
            delay_sec,
            actions,
            ..Default::default()
        };
        trx.set_reference_block(&self.control.head_block_id());
        let mut signed = SignedTransaction::new(trx);
        signed
            .sign(key, &self.control.get_chain_id())
            .expect("could not sign transaction");
        Arc::new(TransactionMetadata::new(signed).expect("could not build transaction metadata"))
    }

    pub fn push(&mut self, trx: Arc<TransactionMetadata>) -> TransactionTrace {
        self.control
            .push_transaction(trx, None, 0, false)
            .expect("push_transaction aborted the block")
    }

    /// Push a transaction that must succeed
    pub fn push_ok(&mut self, actions: Vec<Action>) -> TransactionTrace {
        let trx = self.make_transaction(actions);
        let trace = self.push(trx);
        if let Some(err) = &trace.except {
            panic!("transaction failed: {}", err);
        }
        trace
    }

    /// Create `name` in its own block, controlled by the genesis key
    pub fn create_account(&mut self, name: Name) -> Arc<BlockState> {
        self.start_next_block();
        self.push_ok(vec![newaccount_action(name)]);
        self.finish_block()
    }

    /// Create `name` with code deployed, so the executor runs its actions
    pub fn create_contract(&mut self, name: Name) -> Arc<BlockState> {
        self.start_next_block();
        self.push_ok(vec![newaccount_action(name)]);
        // the permission checked by setcode only exists once the account does
        self.push_ok(vec![setcode_action(name)]);
        self.finish_block()
    }
}

/// Controller on `path` with the default builtin features, not started
pub fn new_controller(
    path: &Path,
    read_mode: DbReadMode,
    executor: Arc<ScriptedActionExecutor>,
) -> ChainResult<Controller> {
    let mut config = ChainConfig::default_for_path(path, test_genesis());
    config.read_mode = read_mode;
    let features = ProtocolFeatureSet::with_default_builtins()?;
    Controller::new(config, features, executor)
}

pub fn open_controller(
    path: &Path,
    read_mode: DbReadMode,
    executor: Arc<ScriptedActionExecutor>,
) -> ChainResult<Controller> {
    let mut control = new_controller(path, read_mode, executor)?;
    control.startup(None)?;
    Ok(control)
}

pub fn newaccount_action(name: Name) -> Action {
    let key = genesis_keypair().get_public_key();
    Action::new(
        SYSTEM_ACCOUNT_NAME,
        NEWACCOUNT,
        vec![PermissionLevel::new(SYSTEM_ACCOUNT_NAME, ACTIVE_NAME)],
        encode_payload(&NewAccount {
            creator: SYSTEM_ACCOUNT_NAME,
            name,
            owner: Authority::from_key(key),
            active: Authority::from_key(key),
        })
        .expect("could not encode newaccount"),
    )
}

pub fn setcode_action(account: Name) -> Action {
    Action::new(
        SYSTEM_ACCOUNT_NAME,
        SETCODE,
        vec![PermissionLevel::new(account, ACTIVE_NAME)],
        encode_payload(&SetCode {
            account,
            vm_type: 0,
            vm_version: 0,
            code: TEST_CODE.to_vec(),
        })
        .expect("could not encode setcode"),
    )
}

/// Action on a test contract, authorized by the contract itself
pub fn contract_action(contract: Name, action: Name, data: Vec<u8>) -> Action {
    Action::new(
        contract,
        action,
        vec![PermissionLevel::new(contract, ACTIVE_NAME)],
        data,
    )
}

/// Hand a block produced elsewhere to `control`
pub fn receive_block(control: &mut Controller, block: Arc<SignedBlock>) -> ChainResult<()> {
    let future = control.create_block_state_future(block)?;
    control.push_block(future)
}

/// Hand every block of `from` above the head of `to` to `to`
pub fn sync_chain(from: &Controller, to: &mut Controller) {
    let start = to.head_block_num() + 1;
    for num in start..=from.head_block_num() {
        let block = from
            .fetch_block_by_number(num)
            .expect("fetch failed")
            .expect("missing block");
        receive_block(to, block).expect("could not push block");
    }
}
