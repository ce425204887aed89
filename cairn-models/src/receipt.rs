// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::error::ModelsError;
use crate::transaction::{
    SignedTransaction, SignedTransactionDeserializer, SignedTransactionSerializer, TransactionId,
};
use cairn_hash::{Hash, HashDeserializer, HashSerializer};
use cairn_serialization::{
    Deserializer, SerializeError, Serializer, U32VarIntDeserializer, U32VarIntSerializer,
};
use nom::{
    error::{context, ContextError, ErrorKind, ParseError},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::ops::Bound::Included;

/// Outcome recorded for a transaction in a block
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    /// succeeded, no error handler executed
    Executed = 0,
    /// objectively failed (not executed), error handler executed
    SoftFail = 1,
    /// objectively failed and error handler objectively failed, state unchanged
    HardFail = 2,
    /// transaction delayed, stored as a deferred transaction
    Delayed = 3,
    /// deferred transaction expired and was retired
    Expired = 4,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = ModelsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TransactionStatus::Executed),
            1 => Ok(TransactionStatus::SoftFail),
            2 => Ok(TransactionStatus::HardFail),
            3 => Ok(TransactionStatus::Delayed),
            4 => Ok(TransactionStatus::Expired),
            other => Err(ModelsError::DeserializeError(format!(
                "unknown transaction status {}",
                other
            ))),
        }
    }
}

/// Billing part of a receipt
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TransactionReceiptHeader {
    /// outcome
    pub status: TransactionStatus,
    /// billed cpu time
    pub cpu_usage_us: u32,
    /// billed net usage in 8 byte words
    pub net_usage_words: u32,
}

impl TransactionReceiptHeader {
    /// Build a receipt header
    pub fn new(status: TransactionStatus, cpu_usage_us: u32, net_usage_words: u32) -> Self {
        TransactionReceiptHeader {
            status,
            cpu_usage_us,
            net_usage_words,
        }
    }
}

/// Transaction referenced by a receipt: deferred transactions are referenced by id,
/// input transactions are embedded
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ReceiptTransaction {
    /// id of a deferred transaction
    Id(TransactionId),
    /// embedded input transaction
    Packed(SignedTransaction),
}

/// Per-transaction record included in a block
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TransactionReceipt {
    /// billing and outcome
    pub header: TransactionReceiptHeader,
    /// the transaction
    pub trx: ReceiptTransaction,
}

impl TransactionReceipt {
    /// Digest included in the block transaction Merkle root
    pub fn digest(&self) -> Result<Hash, ModelsError> {
        let trx_digest = match &self.trx {
            ReceiptTransaction::Id(id) => *id,
            ReceiptTransaction::Packed(trx) => trx.signed_id()?,
        };
        Ok(Hash::compute_from_tuple(&[
            &[self.header.status as u8],
            &self.header.cpu_usage_us.to_le_bytes(),
            &self.header.net_usage_words.to_le_bytes(),
            trx_digest.to_bytes(),
        ]))
    }
}

const RECEIPT_TRX_ID_TAG: u8 = 0;
const RECEIPT_TRX_PACKED_TAG: u8 = 1;

/// Serializer for `TransactionReceipt`
pub struct TransactionReceiptSerializer {
    u32_serializer: U32VarIntSerializer,
    hash_serializer: HashSerializer,
    trx_serializer: SignedTransactionSerializer,
}

impl TransactionReceiptSerializer {
    /// Creates a `TransactionReceiptSerializer`
    pub fn new() -> Self {
        Self {
            u32_serializer: U32VarIntSerializer::new(),
            hash_serializer: HashSerializer::new(),
            trx_serializer: SignedTransactionSerializer::new(),
        }
    }
}

impl Default for TransactionReceiptSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<TransactionReceipt> for TransactionReceiptSerializer {
    fn serialize(
        &self,
        value: &TransactionReceipt,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        buffer.push(value.header.status as u8);
        self.u32_serializer
            .serialize(&value.header.cpu_usage_us, buffer)?;
        self.u32_serializer
            .serialize(&value.header.net_usage_words, buffer)?;
        match &value.trx {
            ReceiptTransaction::Id(id) => {
                buffer.push(RECEIPT_TRX_ID_TAG);
                self.hash_serializer.serialize(id, buffer)
            }
            ReceiptTransaction::Packed(trx) => {
                buffer.push(RECEIPT_TRX_PACKED_TAG);
                self.trx_serializer.serialize(trx, buffer)
            }
        }
    }
}

/// Deserializer for `TransactionReceipt`
pub struct TransactionReceiptDeserializer {
    u32_deserializer: U32VarIntDeserializer,
    hash_deserializer: HashDeserializer,
    trx_deserializer: SignedTransactionDeserializer,
}

impl TransactionReceiptDeserializer {
    /// Creates a `TransactionReceiptDeserializer`
    pub const fn new() -> Self {
        Self {
            u32_deserializer: U32VarIntDeserializer::new(Included(0), Included(u32::MAX)),
            hash_deserializer: HashDeserializer::new(),
            trx_deserializer: SignedTransactionDeserializer::new(),
        }
    }
}

impl Default for TransactionReceiptDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deserializer<TransactionReceipt> for TransactionReceiptDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], TransactionReceipt, E> {
        context("Failed TransactionReceipt deserialization", |input: &'a [u8]| {
            let (rest, status_byte) = nom::number::complete::u8(input)?;
            let status = TransactionStatus::try_from(status_byte).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(input, ErrorKind::Verify))
            })?;
            let (rest, cpu_usage_us) = self.u32_deserializer.deserialize(rest)?;
            let (rest, net_usage_words) = self.u32_deserializer.deserialize(rest)?;
            let (rest, tag) = nom::number::complete::u8(rest)?;
            let (rest, trx) = match tag {
                RECEIPT_TRX_ID_TAG => {
                    let (rest, id) = self.hash_deserializer.deserialize(rest)?;
                    (rest, ReceiptTransaction::Id(id))
                }
                RECEIPT_TRX_PACKED_TAG => {
                    let (rest, trx) = self.trx_deserializer.deserialize(rest)?;
                    (rest, ReceiptTransaction::Packed(trx))
                }
                _ => {
                    return Err(nom::Err::Error(ParseError::from_error_kind(
                        rest,
                        ErrorKind::Verify,
                    )))
                }
            };
            Ok((
                rest,
                TransactionReceipt {
                    header: TransactionReceiptHeader {
                        status,
                        cpu_usage_us,
                        net_usage_words,
                    },
                    trx,
                },
            ))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_depends_on_status() {
        let id = Hash::compute_from(b"deferred");
        let executed = TransactionReceipt {
            header: TransactionReceiptHeader::new(TransactionStatus::Executed, 100, 0),
            trx: ReceiptTransaction::Id(id),
        };
        let mut failed = executed.clone();
        failed.header.status = TransactionStatus::HardFail;
        assert_ne!(executed.digest().unwrap(), failed.digest().unwrap());
    }
}
