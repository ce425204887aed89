// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>
//! Binary serialization primitives shared by every cairn crate.
//!
//! Values are written with a [`Serializer`] into a caller-provided buffer and read back with a
//! [`Deserializer`] built on `nom`, so deserializers compose with the `nom` combinators and
//! report the path of the failure through [`ContextError`].

#![warn(missing_docs)]
use displaydoc::Display;
use nom::{
    error::{context, ContextError, ErrorKind, ParseError},
    multi::length_data,
    IResult, Parser,
};
use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    ops::{Bound, RangeBounds},
};
use thiserror::Error;

#[non_exhaustive]
#[derive(Display, Error, Debug, Clone)]
pub enum SerializeError {
    /// Number {0} is too big to be serialized
    NumberTooBig(String),
    /// String too big {0}
    StringTooBig(String),
    /// General error {0}
    GeneralError(String),
}

/// Error type accumulating every context the failing parser went through.
#[derive(Clone, PartialEq, Eq)]
pub struct DeserializeError<'a> {
    errors: Vec<(&'a [u8], String)>,
}

impl<'a> ParseError<&'a [u8]> for DeserializeError<'a> {
    fn from_error_kind(input: &'a [u8], kind: ErrorKind) -> Self {
        DeserializeError {
            errors: vec![(input, kind.description().to_string())],
        }
    }

    fn append(input: &'a [u8], kind: ErrorKind, mut other: Self) -> Self {
        other.errors.push((input, kind.description().to_string()));
        other
    }
}

impl<'a> ContextError<&'a [u8]> for DeserializeError<'a> {
    fn add_context(input: &'a [u8], ctx: &'static str, mut other: Self) -> Self {
        other.errors.push((input, ctx.to_string()));
        other
    }
}

impl<'a> fmt::Display for DeserializeError<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.errors.len().saturating_sub(1);
        for (i, (input, error)) in self.errors.iter().rev().enumerate() {
            write!(f, "{} / Input: {:?}", error, input)?;
            if i != last {
                write!(f, "\n")?;
            }
        }
        Ok(())
    }
}

impl<'a> Debug for DeserializeError<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Trait that define the deserialize method.
pub trait Deserializer<T> {
    /// Deserialize a value `T` from a buffer of `u8`.
    ///
    /// ## Parameters
    /// * buffer: the buffer that contains the whole serialized data.
    ///
    /// ## Returns
    /// A nom result with the rest of the serialized data and the decoded value.
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], T, E>;
}

/// Trait that define the serialize method.
pub trait Serializer<T> {
    /// Serialize a value `T` by appending it to `buffer`.
    fn serialize(&self, value: &T, buffer: &mut Vec<u8>) -> Result<(), SerializeError>;
}

macro_rules! gen_varint {
    ($($type:ident, $s:ident, $bs:expr, $ds:ident, $d:expr);*) => {
        $(
            #[doc = " Serializer for "]
            #[doc = $d]
            #[doc = " in a varint form."]
            #[derive(Clone, Default)]
            pub struct $s;

            impl $s {
                #[doc = "Create a basic serializer for "]
                #[doc = $d]
                #[allow(dead_code)]
                pub const fn new() -> Self {
                    Self
                }
            }

            impl Serializer<$type> for $s {
                fn serialize(&self, value: &$type, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
                    buffer.extend_from_slice(unsigned_varint::encode::$type(*value, &mut $bs));
                    Ok(())
                }
            }

            #[doc = " Deserializer for "]
            #[doc = $d]
            #[doc = " in a varint form, checked against a range of accepted values."]
            #[derive(Clone)]
            pub struct $ds {
                range: (Bound<$type>, Bound<$type>),
            }

            impl $ds {
                #[doc = "Create a deserializer for "]
                #[doc = $d]
                #[doc = " accepting values in `[min, max]` as expressed by the bounds."]
                #[allow(dead_code)]
                pub const fn new(min: Bound<$type>, max: Bound<$type>) -> Self {
                    Self { range: (min, max) }
                }
            }

            impl Deserializer<$type> for $ds {
                fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
                    &self,
                    buffer: &'a [u8],
                ) -> IResult<&'a [u8], $type, E> {
                    context(concat!("Failed ", stringify!($type), " deserialization"), |input: &'a [u8]| {
                        let (rest, value) = unsigned_varint::nom::$type(input).map_err(|_| {
                            nom::Err::Error(ParseError::from_error_kind(input, ErrorKind::Fail))
                        })?;
                        if !self.range.contains(&value) {
                            return Err(nom::Err::Error(ParseError::from_error_kind(
                                input,
                                ErrorKind::Verify,
                            )));
                        }
                        Ok((rest, value))
                    })(buffer)
                }
            }
        )*
    };
}

gen_varint! {
    u16, U16VarIntSerializer, unsigned_varint::encode::u16_buffer(), U16VarIntDeserializer, "`u16`";
    u32, U32VarIntSerializer, unsigned_varint::encode::u32_buffer(), U32VarIntDeserializer, "`u32`";
    u64, U64VarIntSerializer, unsigned_varint::encode::u64_buffer(), U64VarIntDeserializer, "`u64`"
}

/// Serializer for fixed size little-endian `u32`, used where a constant width is required.
#[derive(Clone, Default)]
pub struct U32FixedSerializer;

impl U32FixedSerializer {
    /// Creates a `U32FixedSerializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<u32> for U32FixedSerializer {
    fn serialize(&self, value: &u32, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// Deserializer for fixed size little-endian `u32`.
#[derive(Clone, Default)]
pub struct U32FixedDeserializer;

impl U32FixedDeserializer {
    /// Creates a `U32FixedDeserializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<u32> for U32FixedDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], u32, E> {
        context("Failed fixed u32 deserialization", |input: &'a [u8]| {
            nom::number::complete::le_u32(input)
        })(buffer)
    }
}

/// Serializer for `bool` as a single byte.
#[derive(Clone, Default)]
pub struct BoolSerializer;

impl BoolSerializer {
    /// Creates a `BoolSerializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer<bool> for BoolSerializer {
    fn serialize(&self, value: &bool, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.push(u8::from(*value));
        Ok(())
    }
}

/// Deserializer for `bool` written as a single byte, rejecting values other than 0 and 1.
#[derive(Clone, Default)]
pub struct BoolDeserializer;

impl BoolDeserializer {
    /// Creates a `BoolDeserializer`
    pub const fn new() -> Self {
        Self
    }
}

impl Deserializer<bool> for BoolDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], bool, E> {
        context("Failed bool deserialization", |input: &'a [u8]| {
            let (rest, byte) = nom::number::complete::u8(input)?;
            match byte {
                0 => Ok((rest, false)),
                1 => Ok((rest, true)),
                _ => Err(nom::Err::Error(ParseError::from_error_kind(
                    input,
                    ErrorKind::Verify,
                ))),
            }
        })(buffer)
    }
}

/// Basic `Vec<u8>` serializer: varint length followed by the raw bytes.
#[derive(Clone, Default)]
pub struct VecU8Serializer {
    len_serializer: U64VarIntSerializer,
}

impl VecU8Serializer {
    /// Creates a new `VecU8Serializer`
    pub const fn new() -> Self {
        Self {
            len_serializer: U64VarIntSerializer::new(),
        }
    }
}

impl Serializer<Vec<u8>> for VecU8Serializer {
    fn serialize(&self, value: &Vec<u8>, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        let len: u64 = value.len().try_into().map_err(|err| {
            SerializeError::NumberTooBig(format!("too many entries data in VecU8: {}", err))
        })?;
        self.len_serializer.serialize(&len, buffer)?;
        buffer.extend(value);
        Ok(())
    }
}

/// Basic `Vec<u8>` deserializer
#[derive(Clone)]
pub struct VecU8Deserializer {
    varint_u64_deserializer: U64VarIntDeserializer,
}

impl VecU8Deserializer {
    /// Creates a new `VecU8Deserializer` accepting lengths within the bounds
    pub const fn new(min_length: Bound<u64>, max_length: Bound<u64>) -> Self {
        Self {
            varint_u64_deserializer: U64VarIntDeserializer::new(min_length, max_length),
        }
    }
}

impl Deserializer<Vec<u8>> for VecU8Deserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Vec<u8>, E> {
        context("Failed Vec<u8> deserialization", |input| {
            length_data(|input| self.varint_u64_deserializer.deserialize(input))(input)
        })
        .map(|res| res.to_vec())
        .parse(buffer)
    }
}

/// Serializer for `String`: varint byte length followed by UTF-8 bytes.
#[derive(Clone, Default)]
pub struct StringSerializer {
    len_serializer: U32VarIntSerializer,
}

impl StringSerializer {
    /// Creates a `StringSerializer`
    pub const fn new() -> Self {
        Self {
            len_serializer: U32VarIntSerializer::new(),
        }
    }
}

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        let len: u32 = value.len().try_into().map_err(|_| {
            SerializeError::StringTooBig("The string is too big to be serialized".to_string())
        })?;
        self.len_serializer.serialize(&len, buffer)?;
        buffer.extend(value.as_bytes());
        Ok(())
    }
}

/// Deserializer for `String`
#[derive(Clone)]
pub struct StringDeserializer {
    len_deserializer: U32VarIntDeserializer,
}

impl StringDeserializer {
    /// Creates a `StringDeserializer` accepting byte lengths up to `max_length`
    pub const fn new(max_length: u32) -> Self {
        Self {
            len_deserializer: U32VarIntDeserializer::new(
                Bound::Included(0),
                Bound::Included(max_length),
            ),
        }
    }
}

impl Deserializer<String> for StringDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], String, E> {
        context("Failed String deserialization", |input: &'a [u8]| {
            let (rest, data) = length_data(|input| self.len_deserializer.deserialize(input))(input)?;
            let value = String::from_utf8(data.to_vec()).map_err(|_| {
                nom::Err::Error(ParseError::from_error_kind(data, ErrorKind::Verify))
            })?;
            Ok((rest, value))
        })(buffer)
    }
}

/// Serializer for `Option<T>`: a presence byte followed by the value when present.
pub struct OptionSerializer<T, ST>
where
    ST: Serializer<T>,
{
    data_serializer: ST,
    phantom_t: PhantomData<T>,
}

impl<T, ST> OptionSerializer<T, ST>
where
    ST: Serializer<T>,
{
    /// Creates an `OptionSerializer` wrapping the serializer of the inner value
    pub fn new(data_serializer: ST) -> Self {
        Self {
            data_serializer,
            phantom_t: PhantomData,
        }
    }
}

impl<T, ST> Serializer<Option<T>> for OptionSerializer<T, ST>
where
    ST: Serializer<T>,
{
    fn serialize(&self, value: &Option<T>, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        match value {
            Some(data) => {
                buffer.push(b'1');
                self.data_serializer.serialize(data, buffer)?;
            }
            None => buffer.push(b'0'),
        }
        Ok(())
    }
}

/// Deserializer for `Option<T>`
pub struct OptionDeserializer<T, DT>
where
    DT: Deserializer<T>,
{
    data_deserializer: DT,
    phantom_t: PhantomData<T>,
}

impl<T, DT> OptionDeserializer<T, DT>
where
    DT: Deserializer<T>,
{
    /// Creates an `OptionDeserializer` wrapping the deserializer of the inner value
    pub const fn new(data_deserializer: DT) -> Self {
        Self {
            data_deserializer,
            phantom_t: PhantomData,
        }
    }
}

impl<T, DT> Deserializer<Option<T>> for OptionDeserializer<T, DT>
where
    DT: Deserializer<T>,
{
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Option<T>, E> {
        context("Failed Option deserialization", |input: &'a [u8]| {
            let (rest, flag) = nom::number::complete::u8(input)?;
            match flag {
                b'0' => Ok((rest, None)),
                b'1' => self
                    .data_deserializer
                    .deserialize(rest)
                    .map(|(rest, value)| (rest, Some(value))),
                _ => Err(nom::Err::Error(ParseError::from_error_kind(
                    input,
                    ErrorKind::Verify,
                ))),
            }
        })(buffer)
    }
}

/// Serializer for `Vec<T>`: varint element count followed by each element.
pub struct VecSerializer<T, ST>
where
    ST: Serializer<T>,
{
    len_serializer: U32VarIntSerializer,
    data_serializer: ST,
    phantom_t: PhantomData<T>,
}

impl<T, ST> VecSerializer<T, ST>
where
    ST: Serializer<T>,
{
    /// Creates a `VecSerializer` from the serializer of one element
    pub fn new(data_serializer: ST) -> Self {
        Self {
            len_serializer: U32VarIntSerializer::new(),
            data_serializer,
            phantom_t: PhantomData,
        }
    }
}

impl<T, ST> Serializer<Vec<T>> for VecSerializer<T, ST>
where
    ST: Serializer<T>,
{
    fn serialize(&self, value: &Vec<T>, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        let len: u32 = value.len().try_into().map_err(|err| {
            SerializeError::NumberTooBig(format!("too many elements in vector: {}", err))
        })?;
        self.len_serializer.serialize(&len, buffer)?;
        for item in value {
            self.data_serializer.serialize(item, buffer)?;
        }
        Ok(())
    }
}

/// Deserializer for `Vec<T>` with a bounded element count
pub struct VecDeserializer<T, DT>
where
    DT: Deserializer<T>,
{
    len_deserializer: U32VarIntDeserializer,
    data_deserializer: DT,
    phantom_t: PhantomData<T>,
}

impl<T, DT> VecDeserializer<T, DT>
where
    DT: Deserializer<T>,
{
    /// Creates a `VecDeserializer` accepting at most `max_length` elements
    pub const fn new(data_deserializer: DT, max_length: u32) -> Self {
        Self {
            len_deserializer: U32VarIntDeserializer::new(
                Bound::Included(0),
                Bound::Included(max_length),
            ),
            data_deserializer,
            phantom_t: PhantomData,
        }
    }
}

impl<T, DT> Deserializer<Vec<T>> for VecDeserializer<T, DT>
where
    DT: Deserializer<T>,
{
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], Vec<T>, E> {
        context("Failed Vec deserialization", |input: &'a [u8]| {
            let (mut rest, len) = self.len_deserializer.deserialize(input)?;
            let mut values = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                let (next, value) = self.data_deserializer.deserialize(rest)?;
                values.push(value);
                rest = next;
            }
            Ok((rest, values))
        })(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;
    use std::ops::Bound::Included;

    // This macro creates a suite of tests for all types of numbers declared as parameters. Ths list of the
    // tests for each type :
    // - Test with a normal case that everything works
    // - Test with a normal case but a more bigger number that everything works
    // - Test with a number that is out of the range of the deserializer
    macro_rules! gen_test_varint {
        ($($type:ident, $s:ident, $ds:ident);*) => {
            $(
                paste! {
                    #[test]
                    fn [<test_ $type _serializer>]() {
                        let serializer = $s::new();
                        let deserializer = $ds::new(Included($type::MIN), Included($type::MAX));
                        let mut buffer = Vec::new();
                        serializer.serialize(&7, &mut buffer).unwrap();
                        let (rest, value) = deserializer.deserialize::<DeserializeError>(&buffer).unwrap();
                        assert!(rest.is_empty());
                        assert_eq!(value, 7);
                    }

                    #[test]
                    fn [<test_ $type _serializer_max>]() {
                        let serializer = $s::new();
                        let deserializer = $ds::new(Included($type::MIN), Included($type::MAX));
                        let mut buffer = Vec::new();
                        serializer.serialize(&$type::MAX, &mut buffer).unwrap();
                        let (rest, value) = deserializer.deserialize::<DeserializeError>(&buffer).unwrap();
                        assert!(rest.is_empty());
                        assert_eq!(value, $type::MAX);
                    }

                    #[test]
                    fn [<test_ $type _out_of_range>]() {
                        let serializer = $s::new();
                        let deserializer = $ds::new(Included(0), Included(10));
                        let mut buffer = Vec::new();
                        serializer.serialize(&11, &mut buffer).unwrap();
                        assert!(deserializer.deserialize::<DeserializeError>(&buffer).is_err());
                    }
                }
            )*
        };
    }

    gen_test_varint! {
        u16, U16VarIntSerializer, U16VarIntDeserializer;
        u32, U32VarIntSerializer, U32VarIntDeserializer;
        u64, U64VarIntSerializer, U64VarIntDeserializer
    }

    #[test]
    fn vec_u8_truncated_length_is_rejected() {
        let mut serialized = Vec::new();
        U64VarIntSerializer::new()
            .serialize(&10, &mut serialized)
            .unwrap();
        serialized.extend([9, 8, 7]);
        let deserializer = VecU8Deserializer::new(Included(u64::MIN), Included(u64::MAX));
        deserializer
            .deserialize::<DeserializeError>(&serialized)
            .expect_err("Should fail too long size");
    }

    #[test]
    fn vec_of_options_keeps_order_and_rest() {
        let serializer = VecSerializer::new(OptionSerializer::new(U32VarIntSerializer::new()));
        let deserializer = VecDeserializer::new(
            OptionDeserializer::new(U32VarIntDeserializer::new(Included(0), Included(u32::MAX))),
            16,
        );
        let value = vec![Some(3u32), None, Some(300)];
        let mut buffer = Vec::new();
        serializer.serialize(&value, &mut buffer).unwrap();
        buffer.push(42);
        let (rest, decoded) = deserializer
            .deserialize::<DeserializeError>(&buffer)
            .unwrap();
        assert_eq!(rest, &[42]);
        assert_eq!(decoded, value);
    }

    #[test]
    fn vec_length_over_limit_is_rejected() {
        let serializer = VecSerializer::new(BoolSerializer::new());
        let deserializer = VecDeserializer::new(BoolDeserializer::new(), 2);
        let mut buffer = Vec::new();
        serializer
            .serialize(&vec![true, false, true], &mut buffer)
            .unwrap();
        assert!(deserializer
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let mut buffer = Vec::new();
        U32VarIntSerializer::new().serialize(&2, &mut buffer).unwrap();
        buffer.extend([0xff, 0xfe]);
        assert!(StringDeserializer::new(16)
            .deserialize::<DeserializeError>(&buffer)
            .is_err());
    }
}
