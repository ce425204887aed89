// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::error::ModelsError;
use cairn_hash::{Hash, HashDeserializer, HashSerializer};
use cairn_serialization::{Deserializer, SerializeError, Serializer};
use nom::{
    error::{context, ContextError, ParseError},
    IResult, Parser,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Block identifier: the header digest with its first four bytes replaced by the
/// big-endian block number, so the height can be read back from the id alone.
#[derive(
    Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockId(pub Hash);

impl BlockId {
    /// Id of the given header digest at the given height
    pub fn new(digest: Hash, block_num: u32) -> Self {
        let mut bytes = digest.into_bytes();
        bytes[..4].copy_from_slice(&block_num.to_be_bytes());
        BlockId(Hash::from_bytes(&bytes))
    }

    /// The all-zero id, `previous` of the genesis header
    pub const fn zero() -> Self {
        BlockId(Hash::zero())
    }

    /// Height embedded in the id
    pub fn block_num(&self) -> u32 {
        let bytes = self.0.to_bytes();
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Underlying hash
    pub fn get_hash(&self) -> &Hash {
        &self.0
    }

    /// Whether this is the zero id
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Prefix referenced by transactions for TaPoS: bytes 8..12 of the id, little-endian
    pub fn ref_block_prefix(&self) -> u32 {
        let bytes = self.0.to_bytes();
        u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]])
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.block_num(), self.0)
    }
}

impl FromStr for BlockId {
    type Err = ModelsError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(BlockId(Hash::from_str(s)?))
    }
}

/// Serializer for `BlockId`
#[derive(Default, Clone)]
pub struct BlockIdSerializer {
    hash_serializer: HashSerializer,
}

impl BlockIdSerializer {
    /// Creates a `BlockIdSerializer`
    pub const fn new() -> Self {
        Self {
            hash_serializer: HashSerializer::new(),
        }
    }
}

impl Serializer<BlockId> for BlockIdSerializer {
    fn serialize(&self, value: &BlockId, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.hash_serializer.serialize(&value.0, buffer)
    }
}

/// Deserializer for `BlockId`
#[derive(Default, Clone)]
pub struct BlockIdDeserializer {
    hash_deserializer: HashDeserializer,
}

impl BlockIdDeserializer {
    /// Creates a `BlockIdDeserializer`
    pub const fn new() -> Self {
        Self {
            hash_deserializer: HashDeserializer::new(),
        }
    }
}

impl Deserializer<BlockId> for BlockIdDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], BlockId, E> {
        context("Failed BlockId deserialization", |input| {
            self.hash_deserializer.deserialize(input)
        })
        .map(BlockId)
        .parse(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_num_is_embedded() {
        let id = BlockId::new(Hash::compute_from(b"header"), 0x0102_0304);
        assert_eq!(id.block_num(), 0x0102_0304);
        assert_eq!(BlockId::zero().block_num(), 0);
    }
}
