// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::constants::{MAX_ACTION_AUTHORIZATIONS, MAX_ACTION_DATA_SIZE};
use crate::error::ModelsError;
use crate::name::{Name, NameDeserializer, NameSerializer};
use cairn_hash::Hash;
use cairn_serialization::{
    Deserializer, SerializeError, Serializer, VecDeserializer, VecSerializer, VecU8Deserializer,
    VecU8Serializer,
};
use nom::{
    error::{context, ContextError, ParseError},
    sequence::tuple,
    IResult, Parser,
};
use serde::{Deserialize, Serialize};
use std::ops::Bound::Included;

/// `actor@permission`
#[derive(
    Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct PermissionLevel {
    /// authorizing account
    pub actor: Name,
    /// permission of that account
    pub permission: Name,
}

impl PermissionLevel {
    /// Build a permission level
    pub fn new(actor: Name, permission: Name) -> Self {
        PermissionLevel { actor, permission }
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.actor, self.permission)
    }
}

/// A call to `name` on contract `account`, authorized by `authorization`
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Action {
    /// contract receiving the action
    pub account: Name,
    /// action name
    pub name: Name,
    /// declared authorizations
    pub authorization: Vec<PermissionLevel>,
    /// opaque payload
    pub data: Vec<u8>,
}

impl Action {
    /// Build an action
    pub fn new(account: Name, name: Name, authorization: Vec<PermissionLevel>, data: Vec<u8>) -> Self {
        Action {
            account,
            name,
            authorization,
            data,
        }
    }

    /// Digest of the serialized action
    pub fn digest(&self) -> Result<Hash, ModelsError> {
        let mut buffer = Vec::new();
        ActionSerializer::new().serialize(self, &mut buffer)?;
        Ok(Hash::compute_from(&buffer))
    }
}

/// Record of one executed action
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ActionReceipt {
    /// account whose handler ran
    pub receiver: Name,
    /// digest of the executed action
    pub act_digest: Hash,
    /// chain wide action sequence
    pub global_sequence: u64,
    /// per receiver action sequence
    pub recv_sequence: u64,
    /// code revision of the receiver
    pub code_sequence: u32,
    /// abi revision of the receiver
    pub abi_sequence: u32,
}

impl ActionReceipt {
    /// Digest included in the block action Merkle root
    pub fn digest(&self) -> Hash {
        Hash::compute_from_tuple(&[
            &self.receiver.as_u64().to_le_bytes(),
            self.act_digest.to_bytes(),
            &self.global_sequence.to_le_bytes(),
            &self.recv_sequence.to_le_bytes(),
            &self.code_sequence.to_le_bytes(),
            &self.abi_sequence.to_le_bytes(),
        ])
    }
}

/// Serializer for `PermissionLevel`
#[derive(Default, Clone)]
pub struct PermissionLevelSerializer {
    name_serializer: NameSerializer,
}

impl PermissionLevelSerializer {
    /// Creates a `PermissionLevelSerializer`
    pub const fn new() -> Self {
        Self {
            name_serializer: NameSerializer::new(),
        }
    }
}

impl Serializer<PermissionLevel> for PermissionLevelSerializer {
    fn serialize(
        &self,
        value: &PermissionLevel,
        buffer: &mut Vec<u8>,
    ) -> Result<(), SerializeError> {
        self.name_serializer.serialize(&value.actor, buffer)?;
        self.name_serializer.serialize(&value.permission, buffer)
    }
}

/// Deserializer for `PermissionLevel`
#[derive(Default, Clone)]
pub struct PermissionLevelDeserializer {
    name_deserializer: NameDeserializer,
}

impl PermissionLevelDeserializer {
    /// Creates a `PermissionLevelDeserializer`
    pub const fn new() -> Self {
        Self {
            name_deserializer: NameDeserializer::new(),
        }
    }
}

impl Deserializer<PermissionLevel> for PermissionLevelDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], PermissionLevel, E> {
        context(
            "Failed PermissionLevel deserialization",
            tuple((
                context("Failed actor deserialization", |input| {
                    self.name_deserializer.deserialize(input)
                }),
                context("Failed permission deserialization", |input| {
                    self.name_deserializer.deserialize(input)
                }),
            )),
        )
        .map(|(actor, permission)| PermissionLevel { actor, permission })
        .parse(buffer)
    }
}

/// Serializer for `Action`
pub struct ActionSerializer {
    name_serializer: NameSerializer,
    authorization_serializer: VecSerializer<PermissionLevel, PermissionLevelSerializer>,
    data_serializer: VecU8Serializer,
}

impl ActionSerializer {
    /// Creates an `ActionSerializer`
    pub fn new() -> Self {
        Self {
            name_serializer: NameSerializer::new(),
            authorization_serializer: VecSerializer::new(PermissionLevelSerializer::new()),
            data_serializer: VecU8Serializer::new(),
        }
    }
}

impl Default for ActionSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<Action> for ActionSerializer {
    fn serialize(&self, value: &Action, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.name_serializer.serialize(&value.account, buffer)?;
        self.name_serializer.serialize(&value.name, buffer)?;
        self.authorization_serializer
            .serialize(&value.authorization, buffer)?;
        self.data_serializer.serialize(&value.data, buffer)
    }
}

/// Deserializer for `Action`
pub struct ActionDeserializer {
    name_deserializer: NameDeserializer,
    authorization_deserializer: VecDeserializer<PermissionLevel, PermissionLevelDeserializer>,
    data_deserializer: VecU8Deserializer,
}

impl ActionDeserializer {
    /// Creates an `ActionDeserializer`
    pub const fn new() -> Self {
        Self {
            name_deserializer: NameDeserializer::new(),
            authorization_deserializer: VecDeserializer::new(
                PermissionLevelDeserializer::new(),
                MAX_ACTION_AUTHORIZATIONS,
            ),
            data_deserializer: VecU8Deserializer::new(Included(0), Included(MAX_ACTION_DATA_SIZE)),
        }
    }
}

impl Default for ActionDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deserializer<Action> for ActionDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Action, E> {
        context(
            "Failed Action deserialization",
            tuple((
                context("Failed account deserialization", |input| {
                    self.name_deserializer.deserialize(input)
                }),
                context("Failed name deserialization", |input| {
                    self.name_deserializer.deserialize(input)
                }),
                context("Failed authorization deserialization", |input| {
                    self.authorization_deserializer.deserialize(input)
                }),
                context("Failed data deserialization", |input| {
                    self.data_deserializer.deserialize(input)
                }),
            )),
        )
        .map(|(account, name, authorization, data)| Action {
            account,
            name,
            authorization,
            data,
        })
        .parse(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_serialization::DeserializeError;

    #[test]
    fn action_digest_covers_payload() {
        let auth = vec![PermissionLevel::new(
            Name::from_static("alice"),
            Name::from_static("active"),
        )];
        let a = Action::new(
            Name::from_static("token"),
            Name::from_static("transfer"),
            auth.clone(),
            vec![1, 2, 3],
        );
        let mut b = a.clone();
        b.data.push(4);
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());

        let mut buffer = Vec::new();
        ActionSerializer::new().serialize(&b, &mut buffer).unwrap();
        let (rest, decoded) = ActionDeserializer::new()
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, b);
    }
}
