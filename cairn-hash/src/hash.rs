// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::error::HashError;
use crate::settings::HASH_SIZE_BYTES;
use cairn_serialization::{Deserializer, SerializeError, Serializer};
use nom::{
    error::{context, ContextError, ParseError},
    IResult,
};
use sha2::{Digest, Sha256};
use std::{convert::TryInto, str::FromStr};

/// SHA-256 digest
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash, Default)]
pub struct Hash([u8; HASH_SIZE_BYTES]);

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_bs58_check())
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_bs58_check())
    }
}

impl Hash {
    /// The all-zero hash, used as the `previous` of the genesis header and as an empty Merkle root.
    pub const fn zero() -> Self {
        Hash([0u8; HASH_SIZE_BYTES])
    }

    /// Compute a hash from data.
    ///
    /// # Example
    ///  ```
    /// # use cairn_hash::Hash;
    /// let hash = Hash::compute_from(&"hello world".as_bytes());
    /// ```
    pub fn compute_from(data: &[u8]) -> Self {
        Hash(Sha256::digest(data).into())
    }

    /// Compute a hash over the concatenation of several byte slices without copying them.
    ///
    /// # Example
    ///  ```
    /// # use cairn_hash::Hash;
    /// let hash = Hash::compute_from_tuple(&[b"hello ", b"world"]);
    /// assert_eq!(hash, Hash::compute_from(b"hello world"));
    /// ```
    pub fn compute_from_tuple(data: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in data {
            hasher.update(part);
        }
        Hash(hasher.finalize().into())
    }

    /// Whether every byte is zero
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Serialize a Hash using bs58 encoding with checksum.
    ///
    /// # Example
    ///  ```
    /// # use cairn_hash::Hash;
    /// let hash = Hash::compute_from(&"hello world".as_bytes());
    /// let serialized: String = hash.to_bs58_check();
    /// ```
    pub fn to_bs58_check(&self) -> String {
        bs58::encode(self.to_bytes()).with_check().into_string()
    }

    /// Serialize a Hash as bytes.
    pub fn to_bytes(&self) -> &[u8; HASH_SIZE_BYTES] {
        &self.0
    }

    /// Convert into bytes.
    pub fn into_bytes(self) -> [u8; HASH_SIZE_BYTES] {
        self.0
    }

    /// Deserialize using bs58 encoding with checksum.
    ///
    /// # Example
    ///  ```
    /// # use cairn_hash::Hash;
    /// let hash = Hash::compute_from(&"hello world".as_bytes());
    /// let serialized: String = hash.to_bs58_check();
    /// let deserialized: Hash = Hash::from_bs58_check(&serialized).unwrap();
    /// assert_eq!(hash, deserialized);
    /// ```
    pub fn from_bs58_check(data: &str) -> Result<Hash, HashError> {
        let decoded_bs58_check = bs58::decode(data)
            .with_check(None)
            .into_vec()
            .map_err(|err| HashError::ParsingError(format!("{}", err)))?;
        Hash::from_slice(&decoded_bs58_check)
    }

    /// Deserialize a Hash from a fixed size array.
    pub const fn from_bytes(data: &[u8; HASH_SIZE_BYTES]) -> Hash {
        Hash(*data)
    }

    /// Deserialize a Hash from a slice, checking its length.
    pub fn from_slice(data: &[u8]) -> Result<Hash, HashError> {
        let bytes: [u8; HASH_SIZE_BYTES] = data
            .try_into()
            .map_err(|_| HashError::WrongSize(HASH_SIZE_BYTES, data.len()))?;
        Ok(Hash(bytes))
    }
}

/// Binary Merkle root over a list of digests.
///
/// An empty list yields the zero hash; odd levels duplicate their last element.
pub fn merkle_root(mut digests: Vec<Hash>) -> Hash {
    if digests.is_empty() {
        return Hash::zero();
    }
    while digests.len() > 1 {
        if digests.len() % 2 == 1 {
            if let Some(last) = digests.last().copied() {
                digests.push(last);
            }
        }
        digests = digests
            .chunks(2)
            .map(|pair| Hash::compute_from_tuple(&[pair[0].to_bytes(), pair[1].to_bytes()]))
            .collect();
    }
    digests[0]
}

impl ::serde::Serialize for Hash {
    /// if the serializer is human readable, serialization is done using bs58 check,
    /// else it uses the raw bytes
    fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.collect_str(&self.to_bs58_check())
        } else {
            s.serialize_bytes(self.to_bytes())
        }
    }
}

impl<'de> ::serde::Deserialize<'de> for Hash {
    fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<Hash, D::Error> {
        if d.is_human_readable() {
            struct Base58CheckVisitor;

            impl<'de> ::serde::de::Visitor<'de> for Base58CheckVisitor {
                type Value = Hash;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("an ASCII base58check string")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
                where
                    E: ::serde::de::Error,
                {
                    if let Ok(v_str) = std::str::from_utf8(v) {
                        Hash::from_bs58_check(v_str).map_err(E::custom)
                    } else {
                        Err(E::invalid_value(::serde::de::Unexpected::Bytes(v), &self))
                    }
                }

                fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                where
                    E: ::serde::de::Error,
                {
                    Hash::from_bs58_check(v).map_err(E::custom)
                }
            }
            d.deserialize_str(Base58CheckVisitor)
        } else {
            struct BytesVisitor;

            impl<'de> ::serde::de::Visitor<'de> for BytesVisitor {
                type Value = Hash;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("a bytestring")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
                where
                    E: ::serde::de::Error,
                {
                    Hash::from_slice(v).map_err(E::custom)
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: ::serde::de::SeqAccess<'de>,
                {
                    let mut bytes = [0u8; HASH_SIZE_BYTES];
                    for (i, byte) in bytes.iter_mut().enumerate() {
                        *byte = seq
                            .next_element()?
                            .ok_or_else(|| ::serde::de::Error::invalid_length(i, &self))?;
                    }
                    Ok(Hash(bytes))
                }
            }

            d.deserialize_bytes(BytesVisitor)
        }
    }
}

impl FromStr for Hash {
    type Err = HashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_bs58_check(s)
    }
}

/// Serializer for `Hash`
#[derive(Default, Clone)]
pub struct HashSerializer;

impl HashSerializer {
    /// Creates a serializer for `Hash`
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<Hash> for HashSerializer {
    fn serialize(&self, value: &Hash, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend(value.to_bytes());
        Ok(())
    }
}

/// Deserializer for `Hash`
#[derive(Default, Clone)]
pub struct HashDeserializer;

impl HashDeserializer {
    /// Creates a deserializer for `Hash`
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<Hash> for HashDeserializer {
    /// ```
    /// use cairn_serialization::{Serializer, Deserializer, DeserializeError};
    /// use cairn_hash::{Hash, HashSerializer, HashDeserializer};
    ///
    /// let hash = Hash::compute_from(b"hello world");
    /// let mut buffer = Vec::new();
    /// HashSerializer::new().serialize(&hash, &mut buffer).unwrap();
    /// let (rest, deserialized) = HashDeserializer::new().deserialize::<DeserializeError>(&buffer).unwrap();
    /// assert!(rest.is_empty());
    /// assert_eq!(hash, deserialized);
    /// ```
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Hash, E> {
        context("Failed hash deserialization", |input: &'a [u8]| {
            let (rest, bytes) = nom::bytes::complete::take(HASH_SIZE_BYTES)(input)?;
            let hash = Hash::from_slice(bytes).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::LengthValue,
                ))
            })?;
            Ok((rest, hash))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn example() -> Hash {
        Hash::compute_from("hello world".as_bytes())
    }

    #[test]
    #[serial]
    fn test_serde_json() {
        let hash = example();
        let serialized = serde_json::to_string(&hash).unwrap();
        let deserialized = serde_json::from_str(&serialized).unwrap();
        assert_eq!(hash, deserialized)
    }

    #[test]
    #[serial]
    fn test_hash() {
        let data = "abc".as_bytes();
        let hash = Hash::compute_from(data);
        let hash_ref: [u8; HASH_SIZE_BYTES] = [
            186, 120, 22, 191, 143, 1, 207, 234, 65, 65, 64, 222, 93, 174, 34, 35, 176, 3, 97, 163,
            150, 23, 122, 156, 180, 16, 255, 97, 242, 0, 21, 173,
        ];
        assert_eq!(hash.to_bytes(), &hash_ref);
    }

    #[test]
    #[serial]
    fn test_bs58_rejects_wrong_length() {
        let encoded = bs58::encode([1u8, 2, 3]).with_check().into_string();
        assert!(Hash::from_bs58_check(&encoded).is_err());
    }

    #[test]
    fn merkle_root_of_odd_level_duplicates_last() {
        let a = Hash::compute_from(b"a");
        let b = Hash::compute_from(b"b");
        let c = Hash::compute_from(b"c");
        let ab = Hash::compute_from_tuple(&[a.to_bytes(), b.to_bytes()]);
        let cc = Hash::compute_from_tuple(&[c.to_bytes(), c.to_bytes()]);
        let expected = Hash::compute_from_tuple(&[ab.to_bytes(), cc.to_bytes()]);
        assert_eq!(merkle_root(vec![a, b, c]), expected);
        assert_eq!(merkle_root(vec![a]), a);
        assert_eq!(merkle_root(vec![]), Hash::zero());
    }
}
