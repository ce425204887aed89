// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::action::{Action, ActionDeserializer, ActionSerializer};
use crate::block_id::BlockId;
use crate::constants::{MAX_TRANSACTION_ACTIONS, MAX_TRANSACTION_SIGNATURES};
use crate::error::ModelsError;
use crate::name::Name;
use crate::timestamp::TimePointSec;
use cairn_hash::Hash;
use cairn_serialization::{
    DeserializeError, Deserializer, SerializeError, Serializer, U32FixedDeserializer,
    U32FixedSerializer, U32VarIntDeserializer, U32VarIntSerializer, VecDeserializer,
    VecSerializer,
};
use cairn_signature::{
    KeyPair, PublicKey, PublicKeyDeserializer, PublicKeySerializer, Signature,
    SignatureDeserializer, SignatureSerializer,
};
use nom::{
    error::{context, ContextError, ParseError},
    sequence::tuple,
    IResult, Parser,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Bound::Included;

/// Transaction identifier: digest of the serialized unsigned transaction
pub type TransactionId = Hash;

/// Unsigned transaction
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Transaction {
    /// the transaction is rejected by blocks later than this
    pub expiration: TimePointSec,
    /// low 16 bits of the referenced block number (TaPoS)
    pub ref_block_num: u16,
    /// `ref_block_prefix` of the referenced block id
    pub ref_block_prefix: u32,
    /// upper bound of billed net usage, in 8 byte words (0 = chain limit)
    pub max_net_usage_words: u32,
    /// upper bound of billed cpu time in milliseconds (0 = chain limit)
    pub max_cpu_usage_ms: u8,
    /// seconds to wait before executing, turning it into a deferred transaction
    pub delay_sec: u32,
    /// actions executed in order
    pub actions: Vec<Action>,
}

impl Transaction {
    /// Compute the id
    pub fn id(&self) -> Result<TransactionId, ModelsError> {
        let mut buffer = Vec::new();
        TransactionSerializer::new().serialize(self, &mut buffer)?;
        Ok(Hash::compute_from(&buffer))
    }

    /// Point the TaPoS fields at the given block
    pub fn set_reference_block(&mut self, reference_block: &BlockId) {
        self.ref_block_num = (reference_block.block_num() & 0xffff) as u16;
        self.ref_block_prefix = reference_block.ref_block_prefix();
    }

    /// Whether the TaPoS fields match the given block
    pub fn verify_reference_block(&self, reference_block: &BlockId) -> bool {
        self.ref_block_num == (reference_block.block_num() & 0xffff) as u16
            && self.ref_block_prefix == reference_block.ref_block_prefix()
    }

    /// Actor of the first authorization of the first action
    pub fn first_authorizer(&self) -> Option<Name> {
        self.actions
            .iter()
            .flat_map(|act| act.authorization.iter())
            .map(|auth| auth.actor)
            .next()
    }

    /// Digest that signers sign: binds the id to the chain
    pub fn sig_digest(&self, chain_id: &Hash) -> Result<Hash, ModelsError> {
        Ok(Hash::compute_from_tuple(&[
            chain_id.to_bytes(),
            self.id()?.to_bytes(),
        ]))
    }
}

/// One signature with the key that produced it
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TransactionSignature {
    /// signing key
    pub public_key: PublicKey,
    /// signature over `Transaction::sig_digest`
    pub signature: Signature,
}

/// Transaction with its signatures
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// the transaction
    pub trx: Transaction,
    /// signatures
    pub signatures: Vec<TransactionSignature>,
}

impl SignedTransaction {
    /// Wrap an unsigned transaction
    pub fn new(trx: Transaction) -> Self {
        SignedTransaction {
            trx,
            signatures: Vec::new(),
        }
    }

    /// Add a signature for `chain_id`
    pub fn sign(&mut self, keypair: &KeyPair, chain_id: &Hash) -> Result<(), ModelsError> {
        let digest = self.trx.sig_digest(chain_id)?;
        self.signatures.push(TransactionSignature {
            public_key: keypair.get_public_key(),
            signature: keypair.sign(&digest),
        });
        Ok(())
    }

    /// Verify every signature and return the set of signing keys
    pub fn recover_keys(&self, chain_id: &Hash) -> Result<BTreeSet<PublicKey>, ModelsError> {
        let digest = self.trx.sig_digest(chain_id)?;
        let mut keys = BTreeSet::new();
        for sig in &self.signatures {
            sig.public_key.verify_signature(&digest, &sig.signature)?;
            if !keys.insert(sig.public_key) {
                return Err(ModelsError::InvalidTransaction(format!(
                    "duplicate signature by {}",
                    sig.public_key
                )));
            }
        }
        Ok(keys)
    }

    /// Serialized form
    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelsError> {
        let mut buffer = Vec::new();
        SignedTransactionSerializer::new().serialize(self, &mut buffer)?;
        Ok(buffer)
    }

    /// Parse the serialized form, rejecting trailing bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ModelsError> {
        let (rest, trx) = SignedTransactionDeserializer::new()
            .deserialize::<DeserializeError>(data)
            .map_err(|err| ModelsError::DeserializeError(err.to_string()))?;
        if !rest.is_empty() {
            return Err(ModelsError::DeserializeError(
                "trailing bytes after signed transaction".to_string(),
            ));
        }
        Ok(trx)
    }

    /// Digest of the serialized signed transaction
    pub fn signed_id(&self) -> Result<Hash, ModelsError> {
        Ok(Hash::compute_from(&self.to_bytes()?))
    }

    /// Billable size in bytes
    pub fn packed_size(&self) -> Result<usize, ModelsError> {
        Ok(self.to_bytes()?.len())
    }
}

/// Signed transaction with its precomputed identifiers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionMetadata {
    /// the transaction
    pub packed_trx: SignedTransaction,
    /// `Transaction::id`
    pub id: TransactionId,
    /// `SignedTransaction::signed_id`
    pub signed_id: Hash,
    /// generated by the chain itself (onblock)
    pub implicit: bool,
    /// executed from the deferred transaction queue
    pub scheduled: bool,
    /// serialized size
    pub packed_size: usize,
}

impl TransactionMetadata {
    /// Metadata of an input transaction
    pub fn new(packed_trx: SignedTransaction) -> Result<Self, ModelsError> {
        let bytes = packed_trx.to_bytes()?;
        Ok(TransactionMetadata {
            id: packed_trx.trx.id()?,
            signed_id: Hash::compute_from(&bytes),
            packed_size: bytes.len(),
            packed_trx,
            implicit: false,
            scheduled: false,
        })
    }

    /// Metadata of a chain generated transaction
    pub fn new_implicit(trx: Transaction) -> Result<Self, ModelsError> {
        let mut meta = TransactionMetadata::new(SignedTransaction::new(trx))?;
        meta.implicit = true;
        Ok(meta)
    }

    /// Metadata of a deferred transaction taken from the queue
    pub fn new_scheduled(trx: Transaction) -> Result<Self, ModelsError> {
        let mut meta = TransactionMetadata::new(SignedTransaction::new(trx))?;
        meta.scheduled = true;
        Ok(meta)
    }

    /// Unsigned transaction
    pub fn trx(&self) -> &Transaction {
        &self.packed_trx.trx
    }
}

/// Serializer for `Transaction`
pub struct TransactionSerializer {
    u32_serializer: U32VarIntSerializer,
    fixed_u32_serializer: U32FixedSerializer,
    actions_serializer: VecSerializer<Action, ActionSerializer>,
}

impl TransactionSerializer {
    /// Creates a `TransactionSerializer`
    pub fn new() -> Self {
        Self {
            u32_serializer: U32VarIntSerializer::new(),
            fixed_u32_serializer: U32FixedSerializer::new(),
            actions_serializer: VecSerializer::new(ActionSerializer::new()),
        }
    }
}

impl Default for TransactionSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<Transaction> for TransactionSerializer {
    fn serialize(&self, value: &Transaction, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.fixed_u32_serializer
            .serialize(&value.expiration.0, buffer)?;
        buffer.extend(value.ref_block_num.to_le_bytes());
        self.fixed_u32_serializer
            .serialize(&value.ref_block_prefix, buffer)?;
        self.u32_serializer
            .serialize(&value.max_net_usage_words, buffer)?;
        buffer.push(value.max_cpu_usage_ms);
        self.u32_serializer.serialize(&value.delay_sec, buffer)?;
        self.actions_serializer.serialize(&value.actions, buffer)
    }
}

/// Deserializer for `Transaction`
pub struct TransactionDeserializer {
    u32_deserializer: U32VarIntDeserializer,
    fixed_u32_deserializer: U32FixedDeserializer,
    actions_deserializer: VecDeserializer<Action, ActionDeserializer>,
}

impl TransactionDeserializer {
    /// Creates a `TransactionDeserializer`
    pub const fn new() -> Self {
        Self {
            u32_deserializer: U32VarIntDeserializer::new(Included(0), Included(u32::MAX)),
            fixed_u32_deserializer: U32FixedDeserializer::new(),
            actions_deserializer: VecDeserializer::new(
                ActionDeserializer::new(),
                MAX_TRANSACTION_ACTIONS,
            ),
        }
    }
}

impl Default for TransactionDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deserializer<Transaction> for TransactionDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Transaction, E> {
        context(
            "Failed Transaction deserialization",
            tuple((
                context("Failed expiration deserialization", |input| {
                    self.fixed_u32_deserializer.deserialize(input)
                }),
                context("Failed ref_block_num deserialization", |input| {
                    nom::number::complete::le_u16(input)
                }),
                context("Failed ref_block_prefix deserialization", |input| {
                    self.fixed_u32_deserializer.deserialize(input)
                }),
                context("Failed max_net_usage_words deserialization", |input| {
                    self.u32_deserializer.deserialize(input)
                }),
                context("Failed max_cpu_usage_ms deserialization", |input| {
                    nom::number::complete::u8(input)
                }),
                context("Failed delay_sec deserialization", |input| {
                    self.u32_deserializer.deserialize(input)
                }),
                context("Failed actions deserialization", |input| {
                    self.actions_deserializer.deserialize(input)
                }),
            )),
        )
        .map(
            |(
                expiration,
                ref_block_num,
                ref_block_prefix,
                max_net_usage_words,
                max_cpu_usage_ms,
                delay_sec,
                actions,
            )| Transaction {
                expiration: TimePointSec(expiration),
                ref_block_num,
                ref_block_prefix,
                max_net_usage_words,
                max_cpu_usage_ms,
                delay_sec,
                actions,
            },
        )
        .parse(buffer)
    }
}

/// Serializer for `SignedTransaction`
pub struct SignedTransactionSerializer {
    trx_serializer: TransactionSerializer,
    len_serializer: U32VarIntSerializer,
    public_key_serializer: PublicKeySerializer,
    signature_serializer: SignatureSerializer,
}

impl SignedTransactionSerializer {
    /// Creates a `SignedTransactionSerializer`
    pub fn new() -> Self {
        Self {
            trx_serializer: TransactionSerializer::new(),
            len_serializer: U32VarIntSerializer::new(),
            public_key_serializer: PublicKeySerializer::new(),
            signature_serializer: SignatureSerializer::new(),
        }
    }
}

impl Default for SignedTransactionSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<SignedTransaction> for SignedTransactionSerializer {
    fn serialize(
        &self,
        value: &SignedTransaction,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        self.trx_serializer.serialize(&value.trx, buffer)?;
        let count: u32 = value.signatures.len().try_into().map_err(|_| {
            SerializeError::NumberTooBig("too many transaction signatures".to_string())
        })?;
        self.len_serializer.serialize(&count, buffer)?;
        for sig in &value.signatures {
            self.public_key_serializer
                .serialize(&sig.public_key, buffer)?;
            self.signature_serializer.serialize(&sig.signature, buffer)?;
        }
        Ok(())
    }
}

/// Deserializer for `SignedTransaction`
pub struct SignedTransactionDeserializer {
    trx_deserializer: TransactionDeserializer,
    len_deserializer: U32VarIntDeserializer,
    public_key_deserializer: PublicKeyDeserializer,
    signature_deserializer: SignatureDeserializer,
}

impl SignedTransactionDeserializer {
    /// Creates a `SignedTransactionDeserializer`
    pub const fn new() -> Self {
        Self {
            trx_deserializer: TransactionDeserializer::new(),
            len_deserializer: U32VarIntDeserializer::new(
                Included(0),
                Included(MAX_TRANSACTION_SIGNATURES),
            ),
            public_key_deserializer: PublicKeyDeserializer::new(),
            signature_deserializer: SignatureDeserializer::new(),
        }
    }
}

impl Default for SignedTransactionDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deserializer<SignedTransaction> for SignedTransactionDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], SignedTransaction, E> {
        context("Failed SignedTransaction deserialization", |input: &'a [u8]| {
            let (rest, trx) = self.trx_deserializer.deserialize(input)?;
            let (mut rest, count) = self.len_deserializer.deserialize(rest)?;
            let mut signatures = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (next, (public_key, signature)) = tuple((
                    |input| self.public_key_deserializer.deserialize(input),
                    |input| self.signature_deserializer.deserialize(input),
                ))(rest)?;
                signatures.push(TransactionSignature {
                    public_key,
                    signature,
                });
                rest = next;
            }
            Ok((rest, SignedTransaction { trx, signatures }))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::PermissionLevel;
    use assert_matches::assert_matches;

    fn sample() -> Transaction {
        Transaction {
            expiration: TimePointSec(1_000),
            actions: vec![Action::new(
                Name::from_static("token"),
                Name::from_static("transfer"),
                vec![PermissionLevel::new(
                    Name::from_static("alice"),
                    Name::from_static("active"),
                )],
                vec![9; 16],
            )],
            ..Default::default()
        }
    }

    #[test]
    fn signatures_are_bound_to_the_chain() {
        let chain_a = Hash::compute_from(b"a");
        let chain_b = Hash::compute_from(b"b");
        let keypair = KeyPair::generate();
        let mut trx = SignedTransaction::new(sample());
        trx.sign(&keypair, &chain_a).unwrap();
        let keys = trx.recover_keys(&chain_a).unwrap();
        assert!(keys.contains(&keypair.get_public_key()));
        assert_matches!(
            trx.recover_keys(&chain_b),
            Err(ModelsError::SignatureError(_))
        );
    }

    #[test]
    fn signed_transaction_bytes_round_trip() {
        let keypair = KeyPair::generate();
        let mut trx = SignedTransaction::new(sample());
        trx.sign(&keypair, &Hash::zero()).unwrap();
        let bytes = trx.to_bytes().unwrap();
        assert_eq!(SignedTransaction::from_bytes(&bytes).unwrap(), trx);
        let meta = TransactionMetadata::new(trx.clone()).unwrap();
        assert_eq!(meta.id, trx.trx.id().unwrap());
        assert_ne!(meta.id, meta.signed_id);
    }

    #[test]
    fn tapos_matches_reference_block() {
        let block = BlockId::new(Hash::compute_from(b"block"), 70_000);
        let mut trx = sample();
        trx.set_reference_block(&block);
        assert_eq!(trx.ref_block_num, (70_000 & 0xffff) as u16);
        assert!(trx.verify_reference_block(&block));
        assert!(!trx.verify_reference_block(&BlockId::new(Hash::compute_from(b"x"), 70_000)));
    }
}
