// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::error::ModelsError;
use cairn_serialization::{Deserializer, SerializeError, Serializer};
use nom::{
    error::{context, ContextError, ParseError},
    IResult,
};
use std::str::FromStr;

const CHARMAP: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";
const MAX_NAME_LENGTH: usize = 13;

/// Account, permission and action identifier.
///
/// A name packs up to 13 characters of `.12345abcdefghijklmnopqrstuvwxyz` into 64 bits:
/// the first 12 characters use 5 bits each, the 13th only 4 bits (so it is limited to
/// `.12345abcdefghij`).
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(u64);

const fn char_to_symbol(c: u8) -> u64 {
    if c >= b'a' && c <= b'z' {
        (c - b'a') as u64 + 6
    } else if c >= b'1' && c <= b'5' {
        (c - b'1') as u64 + 1
    } else {
        0
    }
}

impl Name {
    /// Wrap a raw value
    pub const fn new(value: u64) -> Self {
        Name(value)
    }

    /// Encode a literal at compile time. Characters outside the alphabet encode as `.`,
    /// use `FromStr` to validate untrusted input.
    pub const fn from_static(s: &str) -> Self {
        let bytes = s.as_bytes();
        let mut value: u64 = 0;
        let mut i = 0;
        while i < bytes.len() && i < MAX_NAME_LENGTH {
            let mut c = char_to_symbol(bytes[i]);
            if i < 12 {
                c &= 0x1f;
                c <<= 64 - 5 * (i as u64 + 1);
            } else {
                c &= 0x0f;
            }
            value |= c;
            i += 1;
        }
        Name(value)
    }

    /// Raw 64 bit value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The empty name
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = [b'.'; MAX_NAME_LENGTH];
        let mut tmp = self.0;
        for i in 0..MAX_NAME_LENGTH {
            let (mask, shift) = if i == 0 { (0x0f, 4) } else { (0x1f, 5) };
            out[12 - i] = CHARMAP[(tmp & mask) as usize];
            tmp >>= shift;
        }
        let len = out
            .iter()
            .rposition(|c| *c != b'.')
            .map(|pos| pos + 1)
            .unwrap_or(0);
        // every byte comes from CHARMAP
        f.write_str(std::str::from_utf8(&out[..len]).map_err(|_| std::fmt::Error)?)
    }
}

impl std::fmt::Debug for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for Name {
    type Err = ModelsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_NAME_LENGTH {
            return Err(ModelsError::InvalidName(format!(
                "`{}` is longer than {} characters",
                s, MAX_NAME_LENGTH
            )));
        }
        for (i, c) in s.bytes().enumerate() {
            let allowed = if i < 12 {
                CHARMAP.contains(&c)
            } else {
                CHARMAP[..16].contains(&c)
            };
            if !allowed {
                return Err(ModelsError::InvalidName(format!(
                    "`{}` contains the invalid character `{}` at position {}",
                    s, c as char, i
                )));
            }
        }
        let name = Name::from_static(s);
        if name.to_string() != s {
            return Err(ModelsError::InvalidName(format!(
                "`{}` is not in canonical form",
                s
            )));
        }
        Ok(name)
    }
}

impl ::serde::Serialize for Name {
    fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.collect_str(self)
        } else {
            s.serialize_u64(self.0)
        }
    }
}

impl<'de> ::serde::Deserialize<'de> for Name {
    fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<Name, D::Error> {
        if d.is_human_readable() {
            let s = String::deserialize(d)?;
            Name::from_str(&s).map_err(::serde::de::Error::custom)
        } else {
            Ok(Name(u64::deserialize(d)?))
        }
    }
}

/// Serializer for `Name`, fixed 8 bytes little-endian
#[derive(Default, Clone)]
pub struct NameSerializer;

impl NameSerializer {
    /// Creates a `NameSerializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<Name> for NameSerializer {
    fn serialize(&self, value: &Name, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend(value.0.to_le_bytes());
        Ok(())
    }
}

/// Deserializer for `Name`
#[derive(Default, Clone)]
pub struct NameDeserializer;

impl NameDeserializer {
    /// Creates a `NameDeserializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<Name> for NameDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Name, E> {
        context("Failed Name deserialization", |input: &'a [u8]| {
            nom::number::complete::le_u64(input).map(|(rest, value)| (rest, Name(value)))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn name_round_trips_through_text() {
        for text in ["cairn", "cairn.prods", "alice", "a1b2c3d4e5", "zzzzzzzzzzzzj", ""] {
            let name: Name = text.parse().unwrap();
            assert_eq!(name.to_string(), text);
            assert_eq!(Name::from_static(text), name);
        }
    }

    #[test]
    fn name_ordering_follows_text_ordering() {
        let a: Name = "alice".parse().unwrap();
        let b: Name = "bob".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert_matches!("Alice".parse::<Name>(), Err(ModelsError::InvalidName(_)));
        assert_matches!("toolongname1234".parse::<Name>(), Err(ModelsError::InvalidName(_)));
        assert_matches!("zzzzzzzzzzzzz".parse::<Name>(), Err(ModelsError::InvalidName(_)));
        assert_matches!("trailing.".parse::<Name>(), Err(ModelsError::InvalidName(_)));
    }

    #[test]
    fn serde_uses_text_for_json() {
        let name: Name = "cairn".parse().unwrap();
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"cairn\"");
    }
}
