// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::error::SignatureError;
use cairn_hash::Hash;
use cairn_serialization::{Deserializer, SerializeError, Serializer};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use nom::{
    error::{context, ContextError, ParseError},
    IResult,
};
use rand::rngs::OsRng;
use std::{cmp::Ordering, convert::TryInto, hash::Hasher, str::FromStr};

/// Size of a secret key
pub const SECRET_KEY_SIZE_BYTES: usize = ed25519_dalek::SECRET_KEY_LENGTH;
/// Size of a public key
pub const PUBLIC_KEY_SIZE_BYTES: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;
/// Size of a signature
pub const SIGNATURE_SIZE_BYTES: usize = ed25519_dalek::SIGNATURE_LENGTH;

fn decode_bs58_check<const N: usize>(data: &str) -> Result<[u8; N], SignatureError> {
    let decoded = bs58::decode(data)
        .with_check(None)
        .into_vec()
        .map_err(|err| SignatureError::ParsingError(format!("{}", err)))?;
    decoded.as_slice().try_into().map_err(|_| {
        SignatureError::ParsingError(format!("expected {} bytes, got {}", N, decoded.len()))
    })
}

/// Implements human readable (bs58 check) and binary serde for a key type exposing
/// `to_bs58_check`, `from_bs58_check`, `to_bytes` and `from_slice`.
macro_rules! impl_serde_bs58 {
    ($type:ident) => {
        impl ::serde::Serialize for $type {
            fn serialize<S: ::serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                if s.is_human_readable() {
                    s.collect_str(&self.to_bs58_check())
                } else {
                    s.serialize_bytes(&self.to_bytes()[..])
                }
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $type {
            fn deserialize<D: ::serde::Deserializer<'de>>(d: D) -> Result<$type, D::Error> {
                struct KeyVisitor;

                impl<'de> ::serde::de::Visitor<'de> for KeyVisitor {
                    type Value = $type;

                    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                        formatter.write_str("an ASCII base58check string or a bytestring")
                    }

                    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                    where
                        E: ::serde::de::Error,
                    {
                        $type::from_bs58_check(v).map_err(E::custom)
                    }

                    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
                    where
                        E: ::serde::de::Error,
                    {
                        $type::from_slice(v).map_err(E::custom)
                    }

                    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                    where
                        A: ::serde::de::SeqAccess<'de>,
                    {
                        let mut bytes = Vec::new();
                        while let Some(byte) = seq.next_element::<u8>()? {
                            bytes.push(byte);
                        }
                        $type::from_slice(&bytes).map_err(::serde::de::Error::custom)
                    }
                }

                if d.is_human_readable() {
                    d.deserialize_str(KeyVisitor)
                } else {
                    d.deserialize_bytes(KeyVisitor)
                }
            }
        }

        impl FromStr for $type {
            type Err = SignatureError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $type::from_bs58_check(s)
            }
        }

        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{}", self.to_bs58_check())
            }
        }

        impl std::fmt::Debug for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{}", self.to_bs58_check())
            }
        }
    };
}

/// `KeyPair` is used for signature and decryption
#[derive(Clone)]
pub struct KeyPair(SigningKey);

impl KeyPair {
    /// Generate a new `KeyPair`
    ///
    /// # Example
    /// ```
    /// # use cairn_signature::KeyPair;
    /// # use cairn_hash::Hash;
    /// let keypair = KeyPair::generate();
    /// let data = Hash::compute_from("Hello World!".as_bytes());
    /// let signature = keypair.sign(&data);
    ///
    /// let serialized: String = signature.to_bs58_check();
    /// ```
    pub fn generate() -> KeyPair {
        KeyPair(SigningKey::generate(&mut OsRng))
    }

    /// Deterministic `KeyPair` built from a 32 byte secret seed
    pub fn from_seed(seed: &[u8; SECRET_KEY_SIZE_BYTES]) -> KeyPair {
        KeyPair(SigningKey::from_bytes(seed))
    }

    /// Returns the Signature produced by signing data bytes with a `KeyPair`.
    pub fn sign(&self, hash: &Hash) -> Signature {
        Signature(self.0.sign(hash.to_bytes()))
    }

    /// Get the public key of the keypair
    pub fn get_public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Secret bytes of the keypair
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE_BYTES] {
        self.0.to_bytes()
    }

    /// Build a keypair back from its secret bytes
    pub fn from_slice(data: &[u8]) -> Result<Self, SignatureError> {
        let seed: [u8; SECRET_KEY_SIZE_BYTES] = data.try_into().map_err(|_| {
            SignatureError::ParsingError(format!(
                "expected {} bytes, got {}",
                SECRET_KEY_SIZE_BYTES,
                data.len()
            ))
        })?;
        Ok(KeyPair::from_seed(&seed))
    }

    /// Encode the secret key with bs58 check
    pub fn to_bs58_check(&self) -> String {
        bs58::encode(self.to_bytes()).with_check().into_string()
    }

    /// Decode a bs58 check secret key
    pub fn from_bs58_check(data: &str) -> Result<Self, SignatureError> {
        Ok(KeyPair::from_seed(&decode_bs58_check::<SECRET_KEY_SIZE_BYTES>(
            data,
        )?))
    }
}

impl_serde_bs58!(KeyPair);

/// Public key used to check if a message was encoded by the corresponding `KeyPair`.
#[derive(Copy, Clone)]
pub struct PublicKey(VerifyingKey);

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for PublicKey {}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state)
    }
}

impl PublicKey {
    /// Checks if the `Signature` associated with data bytes
    /// was produced with the `KeyPair` associated to given `PublicKey`
    pub fn verify_signature(
        &self,
        hash: &Hash,
        signature: &Signature,
    ) -> Result<(), SignatureError> {
        self.0
            .verify_strict(hash.to_bytes(), &signature.0)
            .map_err(SignatureError::EngineError)
    }

    /// Serialize a `PublicKey` using `bs58` encoding with checksum.
    pub fn to_bs58_check(&self) -> String {
        bs58::encode(self.to_bytes()).with_check().into_string()
    }

    /// Serialize a `PublicKey` as bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE_BYTES] {
        self.0.to_bytes()
    }

    /// Deserialize a `PublicKey` using `bs58` encoding with checksum.
    pub fn from_bs58_check(data: &str) -> Result<PublicKey, SignatureError> {
        PublicKey::from_slice(&decode_bs58_check::<PUBLIC_KEY_SIZE_BYTES>(data)?)
    }

    /// Deserialize a `PublicKey` from bytes.
    pub fn from_slice(data: &[u8]) -> Result<PublicKey, SignatureError> {
        let bytes: [u8; PUBLIC_KEY_SIZE_BYTES] = data.try_into().map_err(|_| {
            SignatureError::ParsingError(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_SIZE_BYTES,
                data.len()
            ))
        })?;
        Ok(PublicKey(VerifyingKey::from_bytes(&bytes)?))
    }
}

impl_serde_bs58!(PublicKey);

/// Serializer for `PublicKey`
#[derive(Default, Clone)]
pub struct PublicKeySerializer;

impl PublicKeySerializer {
    /// Creates a `PublicKeySerializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<PublicKey> for PublicKeySerializer {
    fn serialize(&self, value: &PublicKey, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend(value.to_bytes());
        Ok(())
    }
}

/// Deserializer for `PublicKey`
#[derive(Default, Clone)]
pub struct PublicKeyDeserializer;

impl PublicKeyDeserializer {
    /// Creates a `PublicKeyDeserializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<PublicKey> for PublicKeyDeserializer {
    /// ```
    /// use cairn_signature::{PublicKey, PublicKeyDeserializer, PublicKeySerializer, KeyPair};
    /// use cairn_serialization::{DeserializeError, Deserializer, Serializer};
    ///
    /// let keypair = KeyPair::generate();
    /// let public_key = keypair.get_public_key();
    /// let mut serialized = Vec::new();
    /// PublicKeySerializer::new().serialize(&public_key, &mut serialized).unwrap();
    /// let (rest, deserialized) = PublicKeyDeserializer::new().deserialize::<DeserializeError>(&serialized).unwrap();
    /// assert!(rest.is_empty());
    /// assert_eq!(public_key, deserialized);
    /// ```
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], PublicKey, E> {
        context("Failed PublicKey deserialization", |input: &'a [u8]| {
            let (rest, bytes) = nom::bytes::complete::take(PUBLIC_KEY_SIZE_BYTES)(input)?;
            let key = PublicKey::from_slice(bytes).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Verify,
                ))
            })?;
            Ok((rest, key))
        })(buffer)
    }
}

/// Signature generated from a message and a `KeyPair`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Serialize a `Signature` using `bs58` encoding with checksum.
    pub fn to_bs58_check(&self) -> String {
        bs58::encode(self.to_bytes()).with_check().into_string()
    }

    /// Serialize a Signature as bytes.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE_BYTES] {
        self.0.to_bytes()
    }

    /// Deserialize a `Signature` using `bs58` encoding with checksum.
    pub fn from_bs58_check(data: &str) -> Result<Signature, SignatureError> {
        Ok(Signature(ed25519_dalek::Signature::from_bytes(
            &decode_bs58_check::<SIGNATURE_SIZE_BYTES>(data)?,
        )))
    }

    /// Deserialize a Signature from bytes.
    pub fn from_slice(data: &[u8]) -> Result<Signature, SignatureError> {
        Ok(Signature(ed25519_dalek::Signature::from_slice(data)?))
    }
}

impl_serde_bs58!(Signature);

/// Serializer for `Signature`
#[derive(Default, Clone)]
pub struct SignatureSerializer;

impl SignatureSerializer {
    /// Creates a `SignatureSerializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<Signature> for SignatureSerializer {
    fn serialize(&self, value: &Signature, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend(value.to_bytes());
        Ok(())
    }
}

/// Deserializer for `Signature`
#[derive(Default, Clone)]
pub struct SignatureDeserializer;

impl SignatureDeserializer {
    /// Creates a `SignatureDeserializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<Signature> for SignatureDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Signature, E> {
        context("Failed Signature deserialization", |input: &'a [u8]| {
            let (rest, bytes) = nom::bytes::complete::take(SIGNATURE_SIZE_BYTES)(input)?;
            let signature = Signature::from_slice(bytes).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(
                    input,
                    nom::error::ErrorKind::Verify,
                ))
            })?;
            Ok((rest, signature))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_serialization::DeserializeError;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_example() {
        let keypair = KeyPair::generate();
        let message = "Hello World!".as_bytes();
        let hash = Hash::compute_from(message);
        let signature = keypair.sign(&hash);
        assert!(keypair
            .get_public_key()
            .verify_signature(&hash, &signature)
            .is_ok())
    }

    #[test]
    #[serial]
    fn test_wrong_message_is_rejected() {
        let keypair = KeyPair::from_seed(&[7u8; SECRET_KEY_SIZE_BYTES]);
        let signature = keypair.sign(&Hash::compute_from(b"signed"));
        assert!(keypair
            .get_public_key()
            .verify_signature(&Hash::compute_from(b"other"), &signature)
            .is_err());
    }

    #[test]
    #[serial]
    fn test_serde_keys() {
        let keypair = KeyPair::from_seed(&[3u8; SECRET_KEY_SIZE_BYTES]);
        let public_key = keypair.get_public_key();
        let json = serde_json::to_string(&public_key).unwrap();
        let decoded: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, public_key);
        let restored = KeyPair::from_bs58_check(&keypair.to_bs58_check()).unwrap();
        assert_eq!(restored.get_public_key(), public_key);
    }

    #[test]
    #[serial]
    fn test_signature_serializer() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(&Hash::compute_from(b"payload"));
        let mut buffer = Vec::new();
        SignatureSerializer::new()
            .serialize(&signature, &mut buffer)
            .unwrap();
        let (rest, decoded) = SignatureDeserializer::new()
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, signature);
    }
}
