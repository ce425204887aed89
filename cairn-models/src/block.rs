// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::block_id::{BlockId, BlockIdDeserializer, BlockIdSerializer};
use crate::constants::{MAX_BLOCK_FEATURE_ACTIVATIONS, MAX_BLOCK_TRANSACTIONS};
use crate::error::ModelsError;
use crate::name::{Name, NameDeserializer, NameSerializer};
use crate::producer::{ProducerSchedule, ProducerScheduleDeserializer, ProducerScheduleSerializer};
use crate::receipt::{
    TransactionReceipt, TransactionReceiptDeserializer, TransactionReceiptSerializer,
};
use crate::timestamp::{BlockTimestamp, BlockTimestampDeserializer, BlockTimestampSerializer};
use cairn_hash::{Hash, HashDeserializer, HashSerializer};
use cairn_serialization::{
    DeserializeError, Deserializer, OptionDeserializer, OptionSerializer, SerializeError,
    Serializer, U32VarIntDeserializer, U32VarIntSerializer, VecDeserializer, VecSerializer,
};
use cairn_signature::{
    KeyPair, PublicKey, Signature, SignatureDeserializer, SignatureSerializer,
};
use nom::{
    error::{context, ContextError, ParseError},
    sequence::tuple,
    IResult, Parser,
};
use serde::{Deserialize, Serialize};
use std::ops::Bound::Included;

/// Block header
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    /// slot of the block
    pub timestamp: BlockTimestamp,
    /// scheduled producer
    pub producer: Name,
    /// number of prior blocks this header confirms, in addition to itself
    pub confirmed: u16,
    /// parent block
    pub previous: BlockId,
    /// Merkle root of the transaction receipts
    pub transaction_mroot: Hash,
    /// Merkle root of the action receipts
    pub action_mroot: Hash,
    /// version of the schedule the producer belongs to
    pub schedule_version: u32,
    /// proposed schedule that became pending with this block
    pub new_producers: Option<ProducerSchedule>,
    /// protocol features activated starting with this block
    pub new_protocol_feature_activations: Vec<Hash>,
}

impl BlockHeader {
    /// Height of the block: one more than the parent
    pub fn block_num(&self) -> u32 {
        self.previous.block_num() + 1
    }

    /// Digest of the serialized header
    pub fn digest(&self) -> Result<Hash, ModelsError> {
        let mut buffer = Vec::new();
        BlockHeaderSerializer::new().serialize(self, &mut buffer)?;
        Ok(Hash::compute_from(&buffer))
    }

    /// Identifier of the block
    pub fn calculate_id(&self) -> Result<BlockId, ModelsError> {
        Ok(BlockId::new(self.digest()?, self.block_num()))
    }
}

/// A block: header, producer signature and transaction receipts
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SignedBlock {
    /// header
    pub header: BlockHeader,
    /// producer signature over the header signing digest; absent only on the genesis block
    pub producer_signature: Option<Signature>,
    /// transaction receipts in execution order
    pub transactions: Vec<TransactionReceipt>,
}

impl SignedBlock {
    /// Unsigned block with no transactions
    pub fn new(header: BlockHeader) -> Self {
        SignedBlock {
            header,
            producer_signature: None,
            transactions: Vec::new(),
        }
    }

    /// Height
    pub fn block_num(&self) -> u32 {
        self.header.block_num()
    }

    /// Identifier
    pub fn calculate_id(&self) -> Result<BlockId, ModelsError> {
        self.header.calculate_id()
    }

    /// Sign `digest` (see `BlockHeaderState::sig_digest`) with the producer key
    pub fn sign(&mut self, keypair: &KeyPair, digest: &Hash) {
        self.producer_signature = Some(keypair.sign(digest));
    }

    /// Check the producer signature over `digest`
    pub fn verify_signee(&self, key: &PublicKey, digest: &Hash) -> Result<(), ModelsError> {
        let signature = self.producer_signature.as_ref().ok_or_else(|| {
            ModelsError::SignatureError(format!("block {} is not signed", self.block_num()))
        })?;
        key.verify_signature(digest, signature)?;
        Ok(())
    }

    /// Serialized form
    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelsError> {
        let mut buffer = Vec::new();
        SignedBlockSerializer::new().serialize(self, &mut buffer)?;
        Ok(buffer)
    }

    /// Parse the serialized form, rejecting trailing bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ModelsError> {
        let (rest, block) = SignedBlockDeserializer::new()
            .deserialize::<DeserializeError>(data)
            .map_err(|err| ModelsError::DeserializeError(err.to_string()))?;
        if !rest.is_empty() {
            return Err(ModelsError::DeserializeError(
                "trailing bytes after signed block".to_string(),
            ));
        }
        Ok(block)
    }
}

/// Serializer for `BlockHeader`
pub struct BlockHeaderSerializer {
    timestamp_serializer: BlockTimestampSerializer,
    name_serializer: NameSerializer,
    block_id_serializer: BlockIdSerializer,
    hash_serializer: HashSerializer,
    u32_serializer: U32VarIntSerializer,
    schedule_serializer: OptionSerializer<ProducerSchedule, ProducerScheduleSerializer>,
    activations_serializer: VecSerializer<Hash, HashSerializer>,
}

impl BlockHeaderSerializer {
    /// Creates a `BlockHeaderSerializer`
    pub fn new() -> Self {
        Self {
            timestamp_serializer: BlockTimestampSerializer::new(),
            name_serializer: NameSerializer::new(),
            block_id_serializer: BlockIdSerializer::new(),
            hash_serializer: HashSerializer::new(),
            u32_serializer: U32VarIntSerializer::new(),
            schedule_serializer: OptionSerializer::new(ProducerScheduleSerializer::new()),
            activations_serializer: VecSerializer::new(HashSerializer::new()),
        }
    }
}

impl Default for BlockHeaderSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<BlockHeader> for BlockHeaderSerializer {
    fn serialize(&self, value: &BlockHeader, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.timestamp_serializer
            .serialize(&value.timestamp, buffer)?;
        self.name_serializer.serialize(&value.producer, buffer)?;
        buffer.extend(value.confirmed.to_le_bytes());
        self.block_id_serializer.serialize(&value.previous, buffer)?;
        self.hash_serializer
            .serialize(&value.transaction_mroot, buffer)?;
        self.hash_serializer.serialize(&value.action_mroot, buffer)?;
        self.u32_serializer
            .serialize(&value.schedule_version, buffer)?;
        self.schedule_serializer
            .serialize(&value.new_producers, buffer)?;
        self.activations_serializer
            .serialize(&value.new_protocol_feature_activations, buffer)
    }
}

/// Deserializer for `BlockHeader`
pub struct BlockHeaderDeserializer {
    timestamp_deserializer: BlockTimestampDeserializer,
    name_deserializer: NameDeserializer,
    block_id_deserializer: BlockIdDeserializer,
    hash_deserializer: HashDeserializer,
    u32_deserializer: U32VarIntDeserializer,
    schedule_deserializer: OptionDeserializer<ProducerSchedule, ProducerScheduleDeserializer>,
    activations_deserializer: VecDeserializer<Hash, HashDeserializer>,
}

impl BlockHeaderDeserializer {
    /// Creates a `BlockHeaderDeserializer`
    pub const fn new() -> Self {
        Self {
            timestamp_deserializer: BlockTimestampDeserializer::new(),
            name_deserializer: NameDeserializer::new(),
            block_id_deserializer: BlockIdDeserializer::new(),
            hash_deserializer: HashDeserializer::new(),
            u32_deserializer: U32VarIntDeserializer::new(Included(0), Included(u32::MAX)),
            schedule_deserializer: OptionDeserializer::new(ProducerScheduleDeserializer::new()),
            activations_deserializer: VecDeserializer::new(
                HashDeserializer::new(),
                MAX_BLOCK_FEATURE_ACTIVATIONS,
            ),
        }
    }
}

impl Default for BlockHeaderDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deserializer<BlockHeader> for BlockHeaderDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], BlockHeader, E> {
        context(
            "Failed BlockHeader deserialization",
            tuple((
                context("Failed timestamp deserialization", |input| {
                    self.timestamp_deserializer.deserialize(input)
                }),
                context("Failed producer deserialization", |input| {
                    self.name_deserializer.deserialize(input)
                }),
                context("Failed confirmed deserialization", |input| {
                    nom::number::complete::le_u16(input)
                }),
                context("Failed previous deserialization", |input| {
                    self.block_id_deserializer.deserialize(input)
                }),
                context("Failed transaction_mroot deserialization", |input| {
                    self.hash_deserializer.deserialize(input)
                }),
                context("Failed action_mroot deserialization", |input| {
                    self.hash_deserializer.deserialize(input)
                }),
                context("Failed schedule_version deserialization", |input| {
                    self.u32_deserializer.deserialize(input)
                }),
                context("Failed new_producers deserialization", |input| {
                    self.schedule_deserializer.deserialize(input)
                }),
                context("Failed activations deserialization", |input| {
                    self.activations_deserializer.deserialize(input)
                }),
            )),
        )
        .map(
            |(
                timestamp,
                producer,
                confirmed,
                previous,
                transaction_mroot,
                action_mroot,
                schedule_version,
                new_producers,
                new_protocol_feature_activations,
            )| BlockHeader {
                timestamp,
                producer,
                confirmed,
                previous,
                transaction_mroot,
                action_mroot,
                schedule_version,
                new_producers,
                new_protocol_feature_activations,
            },
        )
        .parse(buffer)
    }
}

/// Serializer for `SignedBlock`
pub struct SignedBlockSerializer {
    header_serializer: BlockHeaderSerializer,
    signature_serializer: OptionSerializer<Signature, SignatureSerializer>,
    receipts_serializer: VecSerializer<TransactionReceipt, TransactionReceiptSerializer>,
}

impl SignedBlockSerializer {
    /// Creates a `SignedBlockSerializer`
    pub fn new() -> Self {
        Self {
            header_serializer: BlockHeaderSerializer::new(),
            signature_serializer: OptionSerializer::new(SignatureSerializer::new()),
            receipts_serializer: VecSerializer::new(TransactionReceiptSerializer::new()),
        }
    }
}

impl Default for SignedBlockSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<SignedBlock> for SignedBlockSerializer {
    fn serialize(&self, value: &SignedBlock, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.header_serializer.serialize(&value.header, buffer)?;
        self.signature_serializer
            .serialize(&value.producer_signature, buffer)?;
        self.receipts_serializer
            .serialize(&value.transactions, buffer)
    }
}

/// Deserializer for `SignedBlock`
pub struct SignedBlockDeserializer {
    header_deserializer: BlockHeaderDeserializer,
    signature_deserializer: OptionDeserializer<Signature, SignatureDeserializer>,
    receipts_deserializer: VecDeserializer<TransactionReceipt, TransactionReceiptDeserializer>,
}

impl SignedBlockDeserializer {
    /// Creates a `SignedBlockDeserializer`
    pub const fn new() -> Self {
        Self {
            header_deserializer: BlockHeaderDeserializer::new(),
            signature_deserializer: OptionDeserializer::new(SignatureDeserializer::new()),
            receipts_deserializer: VecDeserializer::new(
                TransactionReceiptDeserializer::new(),
                MAX_BLOCK_TRANSACTIONS,
            ),
        }
    }
}

impl Default for SignedBlockDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deserializer<SignedBlock> for SignedBlockDeserializer {
    /// ```
    /// use cairn_models::block::{BlockHeader, SignedBlock};
    /// use cairn_models::name::Name;
    ///
    /// let block = SignedBlock::new(BlockHeader {
    ///     producer: Name::from_static("cairn"),
    ///     ..Default::default()
    /// });
    /// let bytes = block.to_bytes().unwrap();
    /// assert_eq!(SignedBlock::from_bytes(&bytes).unwrap(), block);
    /// ```
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], SignedBlock, E> {
        context(
            "Failed SignedBlock deserialization",
            tuple((
                |input| self.header_deserializer.deserialize(input),
                |input| self.signature_deserializer.deserialize(input),
                |input| self.receipts_deserializer.deserialize(input),
            )),
        )
        .map(|(header, producer_signature, transactions)| SignedBlock {
            header,
            producer_signature,
            transactions,
        })
        .parse(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::{ReceiptTransaction, TransactionReceiptHeader, TransactionStatus};

    #[test]
    fn genesis_header_is_block_one() {
        let header = BlockHeader::default();
        assert_eq!(header.block_num(), 1);
        assert_eq!(header.calculate_id().unwrap().block_num(), 1);
    }

    #[test]
    fn signed_block_round_trip_and_signature() {
        let keypair = KeyPair::generate();
        let mut block = SignedBlock::new(BlockHeader {
            producer: Name::from_static("cairn"),
            previous: BlockId::new(Hash::compute_from(b"parent"), 7),
            new_protocol_feature_activations: vec![Hash::compute_from(b"feature")],
            ..Default::default()
        });
        block.transactions.push(TransactionReceipt {
            header: TransactionReceiptHeader::new(TransactionStatus::Executed, 120, 3),
            trx: ReceiptTransaction::Id(Hash::compute_from(b"trx")),
        });
        let digest = block.header.digest().unwrap();
        block.sign(&keypair, &digest);
        block
            .verify_signee(&keypair.get_public_key(), &digest)
            .unwrap();
        let decoded = SignedBlock::from_bytes(&block.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.block_num(), 8);
    }
}
