// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::constants::MAX_PRODUCERS;
use crate::name::{Name, NameDeserializer, NameSerializer};
use cairn_serialization::{
    Deserializer, SerializeError, Serializer, U32VarIntDeserializer, U32VarIntSerializer,
    VecDeserializer, VecSerializer,
};
use cairn_signature::{PublicKey, PublicKeyDeserializer, PublicKeySerializer};
use nom::{
    error::{context, ContextError, ParseError},
    sequence::tuple,
    IResult, Parser,
};
use serde::{Deserialize, Serialize};
use std::ops::Bound::Included;

/// A producer and the key it signs blocks with
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct ProducerKey {
    /// producer account
    pub producer_name: Name,
    /// block signing key
    pub block_signing_key: PublicKey,
}

/// Ordered set of producers taking turns, identified by a version
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ProducerSchedule {
    /// incremented each time a new schedule is promoted
    pub version: u32,
    /// producers in round order
    pub producers: Vec<ProducerKey>,
}

impl ProducerSchedule {
    /// Signing key of a scheduled producer
    pub fn get_producer_key(&self, producer: Name) -> Option<PublicKey> {
        self.producers
            .iter()
            .find(|p| p.producer_name == producer)
            .map(|p| p.block_signing_key)
    }

    /// Same producers and keys, ignoring the version
    pub fn same_producers(&self, other: &ProducerSchedule) -> bool {
        self.producers == other.producers
    }
}

/// Serializer for `ProducerKey`
#[derive(Default, Clone)]
pub struct ProducerKeySerializer {
    name_serializer: NameSerializer,
    key_serializer: PublicKeySerializer,
}

impl ProducerKeySerializer {
    /// Creates a `ProducerKeySerializer`
    pub const fn new() -> Self {
        Self {
            name_serializer: NameSerializer::new(),
            key_serializer: PublicKeySerializer::new(),
        }
    }
}

impl Serializer<ProducerKey> for ProducerKeySerializer {
    fn serialize(&self, value: &ProducerKey, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.name_serializer.serialize(&value.producer_name, buffer)?;
        self.key_serializer
            .serialize(&value.block_signing_key, buffer)
    }
}

/// Deserializer for `ProducerKey`
#[derive(Default, Clone)]
pub struct ProducerKeyDeserializer {
    name_deserializer: NameDeserializer,
    key_deserializer: PublicKeyDeserializer,
}

impl ProducerKeyDeserializer {
    /// Creates a `ProducerKeyDeserializer`
    pub const fn new() -> Self {
        Self {
            name_deserializer: NameDeserializer::new(),
            key_deserializer: PublicKeyDeserializer::new(),
        }
    }
}

impl Deserializer<ProducerKey> for ProducerKeyDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], ProducerKey, E> {
        context(
            "Failed ProducerKey deserialization",
            tuple((
                |input| self.name_deserializer.deserialize(input),
                |input| self.key_deserializer.deserialize(input),
            )),
        )
        .map(|(producer_name, block_signing_key)| ProducerKey {
            producer_name,
            block_signing_key,
        })
        .parse(buffer)
    }
}

/// Serializer for `ProducerSchedule`
pub struct ProducerScheduleSerializer {
    version_serializer: U32VarIntSerializer,
    producers_serializer: VecSerializer<ProducerKey, ProducerKeySerializer>,
}

impl ProducerScheduleSerializer {
    /// Creates a `ProducerScheduleSerializer`
    pub fn new() -> Self {
        Self {
            version_serializer: U32VarIntSerializer::new(),
            producers_serializer: VecSerializer::new(ProducerKeySerializer::new()),
        }
    }
}

impl Default for ProducerScheduleSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<ProducerSchedule> for ProducerScheduleSerializer {
    fn serialize(
        &self,
        value: &ProducerSchedule,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        self.version_serializer.serialize(&value.version, buffer)?;
        self.producers_serializer.serialize(&value.producers, buffer)
    }
}

/// Deserializer for `ProducerSchedule`
pub struct ProducerScheduleDeserializer {
    version_deserializer: U32VarIntDeserializer,
    producers_deserializer: VecDeserializer<ProducerKey, ProducerKeyDeserializer>,
}

impl ProducerScheduleDeserializer {
    /// Creates a `ProducerScheduleDeserializer`
    pub const fn new() -> Self {
        Self {
            version_deserializer: U32VarIntDeserializer::new(Included(0), Included(u32::MAX)),
            producers_deserializer: VecDeserializer::new(
                ProducerKeyDeserializer::new(),
                MAX_PRODUCERS,
            ),
        }
    }
}

impl Default for ProducerScheduleDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deserializer<ProducerSchedule> for ProducerScheduleDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], ProducerSchedule, E> {
        context(
            "Failed ProducerSchedule deserialization",
            tuple((
                context("Failed version deserialization", |input| {
                    self.version_deserializer.deserialize(input)
                }),
                context("Failed producers deserialization", |input| {
                    self.producers_deserializer.deserialize(input)
                }),
            )),
        )
        .map(|(version, producers)| ProducerSchedule { version, producers })
        .parse(buffer)
    }
}
