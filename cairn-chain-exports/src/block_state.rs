// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::{ChainError, ChainResult};
use cairn_hash::Hash;
use cairn_models::block::{BlockHeader, SignedBlock};
use cairn_models::block_id::BlockId;
use cairn_models::constants::{MAXIMUM_TRACKED_DPOS_CONFIRMATIONS, PRODUCER_REPETITIONS};
use cairn_models::name::Name;
use cairn_models::producer::{ProducerKey, ProducerSchedule, ProducerScheduleSerializer};
use cairn_models::timestamp::BlockTimestamp;
use cairn_models::transaction::TransactionMetadata;
use cairn_signature::PublicKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set of activated protocol features, shared between the states that do not change it
pub type ActivatedFeatures = Arc<BTreeSet<Hash>>;

/// Producer schedule waiting for the block that proposed it to become irreversible
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSchedule {
    /// block that recorded the schedule
    pub schedule_lib_num: u32,
    /// digest of the schedule
    pub schedule_hash: Hash,
    /// the schedule, empty when none is pending
    pub schedule: ProducerSchedule,
}

/// Checks the protocol features activated by a header:
/// `(block timestamp, features already active, features the header activates)`
pub type FeatureActivationValidator<'a> =
    &'a dyn Fn(BlockTimestamp, &BTreeSet<Hash>, &[Hash]) -> ChainResult<()>;

/// State derived from a chain of headers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderState {
    /// block id
    pub id: BlockId,
    /// block height
    pub block_num: u32,
    /// header of the block
    pub header: BlockHeader,
    /// highest block that two thirds of the producers confirmed
    pub dpos_proposed_irreversible_blocknum: u32,
    /// last irreversible block
    pub dpos_irreversible_blocknum: u32,
    /// schedule in effect for the next block
    pub active_schedule: ProducerSchedule,
    /// schedule waiting for promotion
    pub pending_schedule: PendingSchedule,
    /// activated protocol features, including the ones activated by this block
    pub activated_protocol_features: ActivatedFeatures,
    /// last block produced by each active producer
    pub producer_to_last_produced: BTreeMap<Name, u32>,
    /// irreversible height implied by the last block of each active producer
    pub producer_to_last_implied_irb: BTreeMap<Name, u32>,
    /// key that signed the block
    pub block_signing_key: PublicKey,
    /// remaining confirmations needed by each of the last blocks
    pub confirm_count: Vec<u8>,
}

/// Header state of the block being built on top of a `BlockHeaderState`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBlockHeaderState {
    /// height of the new block
    pub block_num: u32,
    /// parent id
    pub previous: BlockId,
    /// slot of the new block
    pub timestamp: BlockTimestamp,
    /// scheduled producer
    pub producer: Name,
    /// number of parent blocks the producer confirms
    pub confirmed: u16,
    /// version of the schedule the producer was chosen from
    pub active_schedule_version: u32,
    /// proposed irreversible height after this block
    pub dpos_proposed_irreversible_blocknum: u32,
    /// irreversible height after this block
    pub dpos_irreversible_blocknum: u32,
    /// schedule in effect after this block
    pub active_schedule: ProducerSchedule,
    /// pending schedule of the parent
    pub prev_pending_schedule: PendingSchedule,
    /// the parent's pending schedule became active with this block
    pub was_pending_promoted: bool,
    /// features active before this block
    pub prev_activated_protocol_features: ActivatedFeatures,
    /// see `BlockHeaderState`
    pub producer_to_last_produced: BTreeMap<Name, u32>,
    /// see `BlockHeaderState`
    pub producer_to_last_implied_irb: BTreeMap<Name, u32>,
    /// key expected to sign the block
    pub block_signing_key: PublicKey,
    /// see `BlockHeaderState`
    pub confirm_count: Vec<u8>,
}

/// Digest of a producer schedule, recorded with a pending schedule
pub fn schedule_digest(schedule: &ProducerSchedule) -> ChainResult<Hash> {
    use cairn_serialization::Serializer;
    let mut buffer = Vec::new();
    ProducerScheduleSerializer::new()
        .serialize(schedule, &mut buffer)
        .map_err(cairn_models::error::ModelsError::from)?;
    Ok(Hash::compute_from(&buffer))
}

impl BlockHeaderState {
    /// State of the genesis block
    pub fn genesis(
        timestamp: BlockTimestamp,
        initial_schedule: ProducerSchedule,
        block_signing_key: PublicKey,
    ) -> ChainResult<Self> {
        let header = BlockHeader {
            timestamp,
            producer: initial_schedule
                .producers
                .first()
                .map(|p| p.producer_name)
                .unwrap_or_default(),
            ..Default::default()
        };
        let id = header.calculate_id()?;
        Ok(BlockHeaderState {
            id,
            block_num: header.block_num(),
            header,
            dpos_proposed_irreversible_blocknum: 0,
            dpos_irreversible_blocknum: 0,
            active_schedule: initial_schedule.clone(),
            pending_schedule: PendingSchedule {
                schedule_lib_num: 0,
                schedule_hash: schedule_digest(&initial_schedule)?,
                schedule: initial_schedule,
            },
            activated_protocol_features: Arc::new(BTreeSet::new()),
            producer_to_last_produced: BTreeMap::new(),
            producer_to_last_implied_irb: BTreeMap::new(),
            block_signing_key,
            confirm_count: Vec::new(),
        })
    }

    /// Block timestamp
    pub fn timestamp(&self) -> BlockTimestamp {
        self.header.timestamp
    }

    /// Producer scheduled for the slot `t`
    pub fn get_scheduled_producer(&self, t: BlockTimestamp) -> ChainResult<ProducerKey> {
        let count = self.active_schedule.producers.len() as u64;
        if count == 0 {
            return Err(ChainError::ProducerSchedule(
                "active schedule is empty".to_string(),
            ));
        }
        let index = (t.slot as u64 % (count * PRODUCER_REPETITIONS as u64))
            / PRODUCER_REPETITIONS as u64;
        Ok(self.active_schedule.producers[index as usize])
    }

    /// Irreversible height after a block produced by `producer_of_next_block`: the height two
    /// thirds of the producers agree on
    pub fn calc_dpos_last_irreversible(&self, producer_of_next_block: Name) -> u32 {
        let mut blocknums: Vec<u32> = self
            .producer_to_last_implied_irb
            .iter()
            .map(|(producer, implied)| {
                if *producer == producer_of_next_block {
                    self.dpos_proposed_irreversible_blocknum
                } else {
                    *implied
                }
            })
            .collect();
        if blocknums.is_empty() {
            return 0;
        }
        let index = (blocknums.len() - 1) / 3;
        *blocknums.select_nth_unstable(index).1
    }

    /// Header state of the block produced at `when` on top of this one, confirming
    /// `num_prev_blocks_to_confirm` of its ancestors
    pub fn next(
        &self,
        when: BlockTimestamp,
        num_prev_blocks_to_confirm: u16,
    ) -> ChainResult<PendingBlockHeaderState> {
        // the default timestamp selects the slot right after this block
        let when = if when == BlockTimestamp::default() {
            self.header.timestamp.next()
        } else {
            if when <= self.header.timestamp {
                return Err(ChainError::BlockValidation(format!(
                    "next block must be in the future: {} <= {}",
                    when, self.header.timestamp
                )));
            }
            when
        };

        let proauth = self.get_scheduled_producer(when)?;
        let block_num = self.block_num + 1;
        if let Some(last) = self.producer_to_last_produced.get(&proauth.producer_name) {
            if *last >= block_num.saturating_sub(num_prev_blocks_to_confirm as u32) {
                return Err(ChainError::BlockValidation(format!(
                    "producer {} double confirming: last produced {}, confirming {}",
                    proauth.producer_name, last, num_prev_blocks_to_confirm
                )));
            }
        }

        let num_active_producers = self.active_schedule.producers.len();
        let required_confs = (num_active_producers * 2 / 3) as u8 + 1;
        let mut confirm_count = if self.confirm_count.len() < MAXIMUM_TRACKED_DPOS_CONFIRMATIONS {
            let mut counts = self.confirm_count.clone();
            counts.push(required_confs);
            counts
        } else {
            let mut counts = self.confirm_count[1..].to_vec();
            counts.push(required_confs);
            counts
        };

        let mut new_dpos_proposed_irreversible_blocknum = self.dpos_proposed_irreversible_blocknum;
        let mut i = confirm_count.len() as i64 - 1;
        let mut blocks_to_confirm = num_prev_blocks_to_confirm as u32 + 1;
        while i >= 0 && blocks_to_confirm > 0 {
            let idx = i as usize;
            confirm_count[idx] = confirm_count[idx].saturating_sub(1);
            if confirm_count[idx] == 0 {
                let block_num_for_i = block_num - (confirm_count.len() - 1 - idx) as u32;
                new_dpos_proposed_irreversible_blocknum = block_num_for_i;
                confirm_count.drain(..=idx);
                break;
            }
            i -= 1;
            blocks_to_confirm -= 1;
        }

        let dpos_irreversible_blocknum = self.calc_dpos_last_irreversible(proauth.producer_name);

        let mut result = PendingBlockHeaderState {
            block_num,
            previous: self.id,
            timestamp: when,
            producer: proauth.producer_name,
            confirmed: num_prev_blocks_to_confirm,
            active_schedule_version: self.active_schedule.version,
            dpos_proposed_irreversible_blocknum: new_dpos_proposed_irreversible_blocknum,
            dpos_irreversible_blocknum,
            active_schedule: self.active_schedule.clone(),
            prev_pending_schedule: self.pending_schedule.clone(),
            was_pending_promoted: false,
            prev_activated_protocol_features: self.activated_protocol_features.clone(),
            producer_to_last_produced: self.producer_to_last_produced.clone(),
            producer_to_last_implied_irb: self.producer_to_last_implied_irb.clone(),
            block_signing_key: proauth.block_signing_key,
            confirm_count,
        };

        if !self.pending_schedule.schedule.producers.is_empty()
            && dpos_irreversible_blocknum >= self.pending_schedule.schedule_lib_num
        {
            result.active_schedule = self.pending_schedule.schedule.clone();
            let mut last_produced = BTreeMap::new();
            let mut last_implied_irb = BTreeMap::new();
            for producer in &result.active_schedule.producers {
                let name = producer.producer_name;
                if name == proauth.producer_name {
                    last_produced.insert(name, block_num);
                    last_implied_irb.insert(name, self.dpos_proposed_irreversible_blocknum);
                } else {
                    last_produced.insert(
                        name,
                        self.producer_to_last_produced
                            .get(&name)
                            .copied()
                            .unwrap_or(dpos_irreversible_blocknum),
                    );
                    last_implied_irb.insert(
                        name,
                        self.producer_to_last_implied_irb
                            .get(&name)
                            .copied()
                            .unwrap_or(dpos_irreversible_blocknum),
                    );
                }
            }
            last_produced.insert(proauth.producer_name, block_num);
            result.producer_to_last_produced = last_produced;
            result.producer_to_last_implied_irb = last_implied_irb;
            result.was_pending_promoted = true;
        } else {
            result
                .producer_to_last_produced
                .insert(proauth.producer_name, block_num);
            result
                .producer_to_last_implied_irb
                .insert(proauth.producer_name, self.dpos_proposed_irreversible_blocknum);
        }
        Ok(result)
    }

    /// Header state of a received block, checking the header against the schedule and the
    /// protocol features (not the signature)
    pub fn next_from_header(
        &self,
        header: &BlockHeader,
        validator: FeatureActivationValidator<'_>,
    ) -> ChainResult<Self> {
        self.next(header.timestamp, header.confirmed)?
            .finish_next(header.clone(), validator)
    }

    /// Digest signed by the producer: header digest bound to the pending schedule
    pub fn sig_digest(&self) -> ChainResult<Hash> {
        let header_digest = self.header.digest()?;
        Ok(Hash::compute_from_tuple(&[
            header_digest.to_bytes(),
            self.pending_schedule.schedule_hash.to_bytes(),
        ]))
    }

    /// Check that `block` is signed by the scheduled producer
    pub fn verify_signee(&self, block: &SignedBlock) -> ChainResult<()> {
        block
            .verify_signee(&self.block_signing_key, &self.sig_digest()?)
            .map_err(|err| ChainError::InvalidSignature(format!("block {}: {}", self.id, err)))
    }
}

impl PendingBlockHeaderState {
    /// Header skeleton of the block being built
    pub fn make_block_header(
        &self,
        transaction_mroot: Hash,
        action_mroot: Hash,
        new_producers: Option<ProducerSchedule>,
        new_protocol_feature_activations: Vec<Hash>,
    ) -> BlockHeader {
        BlockHeader {
            timestamp: self.timestamp,
            producer: self.producer,
            confirmed: self.confirmed,
            previous: self.previous,
            transaction_mroot,
            action_mroot,
            schedule_version: self.active_schedule_version,
            new_producers,
            new_protocol_feature_activations,
        }
    }

    /// Turn the pending state into the state of the block with `header`
    pub fn finish_next(
        self,
        header: BlockHeader,
        validator: FeatureActivationValidator<'_>,
    ) -> ChainResult<BlockHeaderState> {
        if header.timestamp != self.timestamp {
            return Err(ChainError::BlockValidation(format!(
                "timestamp mismatch: expected {}, got {}",
                self.timestamp, header.timestamp
            )));
        }
        if header.previous != self.previous {
            return Err(ChainError::UnlinkableBlock(format!(
                "previous mismatch: expected {}, got {}",
                self.previous, header.previous
            )));
        }
        if header.producer != self.producer {
            return Err(ChainError::BlockValidation(format!(
                "wrong producer: expected {}, got {}",
                self.producer, header.producer
            )));
        }
        if header.schedule_version != self.active_schedule_version {
            return Err(ChainError::ProducerSchedule(format!(
                "schedule version mismatch: expected {}, got {}",
                self.active_schedule_version, header.schedule_version
            )));
        }
        if header.confirmed != self.confirmed {
            return Err(ChainError::BlockValidation(format!(
                "confirmed mismatch: expected {}, got {}",
                self.confirmed, header.confirmed
            )));
        }

        let pending_schedule = if let Some(new_producers) = &header.new_producers {
            if self.was_pending_promoted {
                return Err(ChainError::ProducerSchedule(
                    "cannot propose a schedule in the block promoting the pending one".to_string(),
                ));
            }
            if new_producers.version != self.active_schedule.version + 1 {
                return Err(ChainError::ProducerSchedule(format!(
                    "wrong proposed schedule version {}, expected {}",
                    new_producers.version,
                    self.active_schedule.version + 1
                )));
            }
            if !self.prev_pending_schedule.schedule.producers.is_empty() {
                return Err(ChainError::ProducerSchedule(
                    "cannot replace a pending schedule".to_string(),
                ));
            }
            PendingSchedule {
                schedule_lib_num: self.block_num,
                schedule_hash: schedule_digest(new_producers)?,
                schedule: new_producers.clone(),
            }
        } else if self.was_pending_promoted {
            let cleared = ProducerSchedule {
                version: self.prev_pending_schedule.schedule.version,
                producers: Vec::new(),
            };
            PendingSchedule {
                schedule_lib_num: self.prev_pending_schedule.schedule_lib_num,
                schedule_hash: schedule_digest(&cleared)?,
                schedule: cleared,
            }
        } else {
            self.prev_pending_schedule.clone()
        };

        validator(
            self.timestamp,
            &self.prev_activated_protocol_features,
            &header.new_protocol_feature_activations,
        )?;
        let activated_protocol_features = if header.new_protocol_feature_activations.is_empty() {
            self.prev_activated_protocol_features.clone()
        } else {
            let mut features = (*self.prev_activated_protocol_features).clone();
            for digest in &header.new_protocol_feature_activations {
                if !features.insert(*digest) {
                    return Err(ChainError::ProtocolFeatureBadBlock(format!(
                        "feature {} activated twice",
                        digest
                    )));
                }
            }
            Arc::new(features)
        };

        Ok(BlockHeaderState {
            id: header.calculate_id()?,
            block_num: self.block_num,
            header,
            dpos_proposed_irreversible_blocknum: self.dpos_proposed_irreversible_blocknum,
            dpos_irreversible_blocknum: self.dpos_irreversible_blocknum,
            active_schedule: self.active_schedule,
            pending_schedule,
            activated_protocol_features,
            producer_to_last_produced: self.producer_to_last_produced,
            producer_to_last_implied_irb: self.producer_to_last_implied_irb,
            block_signing_key: self.block_signing_key,
            confirm_count: self.confirm_count,
        })
    }
}

/// A block with its header state and, when known, the metadata of its transactions.
///
/// Immutable once built apart from the validity flag, which only the fork database flips, and
/// the transaction metadata, filled in when a received block is applied.
#[derive(Debug)]
pub struct BlockState {
    /// header state
    pub header_state: BlockHeaderState,
    /// the block
    pub block: Arc<SignedBlock>,
    trxs: RwLock<Vec<Arc<TransactionMetadata>>>,
    validated: AtomicBool,
}

impl BlockState {
    /// Block state of a received block, checking the producer signature
    pub fn from_signed_block(
        prev: &BlockHeaderState,
        block: Arc<SignedBlock>,
        validator: FeatureActivationValidator<'_>,
        skip_validate_signee: bool,
    ) -> ChainResult<Self> {
        let header_state = prev.next_from_header(&block.header, validator)?;
        if !skip_validate_signee {
            header_state.verify_signee(&block)?;
        }
        Ok(BlockState::new(header_state, block, Vec::new()))
    }

    /// Block state of a block built locally
    pub fn new(
        header_state: BlockHeaderState,
        block: Arc<SignedBlock>,
        trxs: Vec<Arc<TransactionMetadata>>,
    ) -> Self {
        BlockState {
            header_state,
            block,
            trxs: RwLock::new(trxs),
            validated: AtomicBool::new(false),
        }
    }

    /// Metadata of the transactions applied in the block, empty until the block is applied
    pub fn trxs(&self) -> Vec<Arc<TransactionMetadata>> {
        self.trxs.read().clone()
    }

    /// Record the metadata of the applied transactions
    pub fn set_trxs(&self, trxs: Vec<Arc<TransactionMetadata>>) {
        *self.trxs.write() = trxs;
    }

    /// Block id
    pub fn id(&self) -> BlockId {
        self.header_state.id
    }

    /// Block height
    pub fn block_num(&self) -> u32 {
        self.header_state.block_num
    }

    /// Parent id
    pub fn previous(&self) -> BlockId {
        self.header_state.header.previous
    }

    /// Block timestamp
    pub fn timestamp(&self) -> BlockTimestamp {
        self.header_state.header.timestamp
    }

    /// Last irreversible height according to this block
    pub fn dpos_irreversible_blocknum(&self) -> u32 {
        self.header_state.dpos_irreversible_blocknum
    }

    /// Whether the block was applied successfully
    pub fn is_valid(&self) -> bool {
        self.validated.load(Ordering::Acquire)
    }

    /// Record the outcome of applying the block
    pub fn set_valid(&self, valid: bool) {
        self.validated.store(valid, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cairn_signature::KeyPair;

    fn no_features(_: BlockTimestamp, _: &BTreeSet<Hash>, _: &[Hash]) -> ChainResult<()> {
        Ok(())
    }

    fn schedule(names: &[&str], keys: &[PublicKey], version: u32) -> ProducerSchedule {
        ProducerSchedule {
            version,
            producers: names
                .iter()
                .zip(keys)
                .map(|(name, key)| ProducerKey {
                    producer_name: name.parse().unwrap(),
                    block_signing_key: *key,
                })
                .collect(),
        }
    }

    fn produce(prev: &BlockHeaderState, keypair: &KeyPair) -> BlockHeaderState {
        let pending = prev.next(prev.timestamp().next(), 0).unwrap();
        let header = pending.make_block_header(Hash::zero(), Hash::zero(), None, Vec::new());
        let state = pending.finish_next(header, &no_features).unwrap();
        let mut block = SignedBlock::new(state.header.clone());
        block.sign(keypair, &state.sig_digest().unwrap());
        state.verify_signee(&block).unwrap();
        state
    }

    #[test]
    fn single_producer_lib_trails_head_by_one() {
        let keypair = KeyPair::generate();
        let genesis = BlockHeaderState::genesis(
            BlockTimestamp::new(100),
            schedule(&["cairn"], &[keypair.get_public_key()], 0),
            keypair.get_public_key(),
        )
        .unwrap();
        assert_eq!(genesis.block_num, 1);
        let mut state = genesis;
        for expected_head in 2..=6u32 {
            state = produce(&state, &keypair);
            assert_eq!(state.block_num, expected_head);
            assert_eq!(state.dpos_proposed_irreversible_blocknum, expected_head);
            let expected_lib = if expected_head == 2 { 0 } else { expected_head - 1 };
            assert_eq!(state.dpos_irreversible_blocknum, expected_lib);
        }
        let pending = state.next(state.timestamp().next(), 0).unwrap();
        assert_eq!(pending.dpos_irreversible_blocknum, 6);
    }

    #[test]
    fn scheduled_producer_rotates_every_repetition() {
        let keys: Vec<PublicKey> = (0..3).map(|_| KeyPair::generate().get_public_key()).collect();
        let state = BlockHeaderState::genesis(
            BlockTimestamp::new(0),
            schedule(&["alice", "bob", "carol"], &keys, 0),
            keys[0],
        )
        .unwrap();
        let at = |slot| state.get_scheduled_producer(BlockTimestamp::new(slot)).unwrap();
        assert_eq!(at(0).producer_name.to_string(), "alice");
        assert_eq!(at(11).producer_name.to_string(), "alice");
        assert_eq!(at(12).producer_name.to_string(), "bob");
        assert_eq!(at(35).producer_name.to_string(), "carol");
        assert_eq!(at(36).producer_name.to_string(), "alice");
    }

    #[test]
    fn proposed_schedule_promoted_once_irreversible() {
        let keypair = KeyPair::generate();
        let key = keypair.get_public_key();
        let genesis = BlockHeaderState::genesis(
            BlockTimestamp::new(100),
            schedule(&["cairn"], &[key], 0),
            key,
        )
        .unwrap();
        let genesis = BlockHeaderState {
            pending_schedule: PendingSchedule::default(),
            ..genesis
        };
        let first = produce(&genesis, &keypair);

        let pending = first.next(first.timestamp().next(), 0).unwrap();
        let proposal = schedule(&["cairn"], &[key], 1);
        let header =
            pending.make_block_header(Hash::zero(), Hash::zero(), Some(proposal.clone()), vec![]);
        let proposing = pending.finish_next(header, &no_features).unwrap();
        assert_eq!(proposing.pending_schedule.schedule, proposal);
        assert_eq!(proposing.active_schedule.version, 0);

        let mut state = proposing;
        let mut promoted_at = None;
        for _ in 0..4 {
            let pending = state.next(state.timestamp().next(), 0).unwrap();
            let promoted = pending.was_pending_promoted;
            let header = pending.make_block_header(Hash::zero(), Hash::zero(), None, vec![]);
            state = pending.finish_next(header, &no_features).unwrap();
            if promoted && promoted_at.is_none() {
                promoted_at = Some(state.block_num);
            }
        }
        assert_eq!(state.active_schedule.version, 1);
        assert!(state.pending_schedule.schedule.producers.is_empty());
        assert!(promoted_at.is_some());
    }

    #[test]
    fn received_header_is_checked() {
        let keypair = KeyPair::generate();
        let genesis = BlockHeaderState::genesis(
            BlockTimestamp::new(100),
            schedule(&["cairn"], &[keypair.get_public_key()], 0),
            keypair.get_public_key(),
        )
        .unwrap();
        let pending = genesis.next(BlockTimestamp::new(101), 0).unwrap();
        let mut header = pending.make_block_header(Hash::zero(), Hash::zero(), None, vec![]);
        header.producer = Name::from_static("mallory");
        assert_matches!(
            genesis.next_from_header(&header, &no_features),
            Err(ChainError::BlockValidation(_))
        );
        assert_matches!(
            genesis.next(BlockTimestamp::new(99), 0),
            Err(ChainError::BlockValidation(_))
        );
        assert_matches!(
            genesis.next(BlockTimestamp::new(100), 0),
            Err(ChainError::BlockValidation(_))
        );
        assert_eq!(
            genesis
                .next(BlockTimestamp::default(), 0)
                .unwrap()
                .timestamp,
            BlockTimestamp::new(101)
        );

        let other = KeyPair::generate();
        let header = pending.make_block_header(Hash::zero(), Hash::zero(), None, vec![]);
        let mut block = SignedBlock::new(header);
        let state = genesis.next_from_header(&block.header, &no_features).unwrap();
        block.sign(&other, &state.sig_digest().unwrap());
        assert_matches!(
            BlockState::from_signed_block(&genesis, Arc::new(block), &no_features, false),
            Err(ChainError::InvalidSignature(_))
        );
    }
}
