// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>
//! Signature management

#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]
mod error;
mod signature_impl;

pub use error::SignatureError;
pub use signature_impl::{
    KeyPair, PublicKey, PublicKeyDeserializer, PublicKeySerializer, Signature,
    SignatureDeserializer, SignatureSerializer, PUBLIC_KEY_SIZE_BYTES, SECRET_KEY_SIZE_BYTES,
    SIGNATURE_SIZE_BYTES,
};
