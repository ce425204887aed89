// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use cairn_hash::Hash;
use displaydoc::Display;
use thiserror::Error;

/// Protocol feature error
#[non_exhaustive]
#[derive(Display, Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFeatureError {
    /// unrecognized protocol feature {0}
    Unrecognized(Hash),
    /// protocol feature {0} is already activated
    AlreadyActivated(Hash),
    /// builtin protocol feature {0} is already part of the set
    DuplicateBuiltin(String),
    /// protocol feature {0} is already part of the set
    DuplicateFeature(Hash),
    /// protocol feature {0} depends on unrecognized feature {1}
    MissingDependency(Hash, Hash),
    /// activation at block {0} is older than the last activation at block {1}
    InvalidActivationOrder(u32, u32),
    /// builtin protocol feature {0} is not recognized
    MissingBuiltin(String),
}
