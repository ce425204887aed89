// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use displaydoc::Display;
use thiserror::Error;

/// Signature error
#[non_exhaustive]
#[derive(Display, Error, Debug)]
pub enum SignatureError {
    /// parsing error : {0}
    ParsingError(String),

    /// ed25519 engine error: {0}
    EngineError(#[from] ed25519_dalek::SignatureError),
}
