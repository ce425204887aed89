// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Origin of the block being applied
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// already irreversible, replayed from the block log
    Irreversible,
    /// signed by a trusted producer or validated earlier
    Validated,
    /// received from the network, must be fully checked
    Complete,
    /// being produced locally
    Incomplete,
}

/// How the controller materializes state
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbReadMode {
    /// state includes the head block and the speculative pending block
    #[default]
    Speculative,
    /// state only reflects irreversible blocks
    Irreversible,
    /// transactions are checked against the head state then discarded
    #[serde(alias = "read-only")]
    ReadOnly,
}

impl FromStr for DbReadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "speculative" => Ok(DbReadMode::Speculative),
            "irreversible" => Ok(DbReadMode::Irreversible),
            "read-only" | "read_only" | "readonly" => Ok(DbReadMode::ReadOnly),
            other => Err(format!("unknown read mode {}", other)),
        }
    }
}

impl std::fmt::Display for DbReadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbReadMode::Speculative => write!(f, "speculative"),
            DbReadMode::Irreversible => write!(f, "irreversible"),
            DbReadMode::ReadOnly => write!(f, "read-only"),
        }
    }
}

/// How much of a received block is re-checked
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// every block is fully validated
    #[default]
    Full,
    /// blocks of trusted producers skip authorization and transaction checks
    Light,
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ValidationMode::Full),
            "light" => Ok(ValidationMode::Light),
            other => Err(format!("unknown validation mode {}", other)),
        }
    }
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationMode::Full => write!(f, "full"),
            ValidationMode::Light => write!(f, "light"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_their_display() {
        for mode in [DbReadMode::Speculative, DbReadMode::Irreversible, DbReadMode::ReadOnly] {
            assert_eq!(mode.to_string().parse::<DbReadMode>().unwrap(), mode);
        }
        assert_eq!("light".parse::<ValidationMode>().unwrap(), ValidationMode::Light);
        assert!("fast".parse::<ValidationMode>().is_err());
    }
}
