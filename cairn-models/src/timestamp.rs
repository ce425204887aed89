// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use crate::constants::{BLOCK_INTERVAL_MS, BLOCK_TIMESTAMP_EPOCH_MS};
use cairn_serialization::{
    Deserializer, SerializeError, Serializer, U32FixedDeserializer, U32FixedSerializer,
};
use nom::{
    error::{context, ContextError, ParseError},
    IResult, Parser,
};
use serde::{Deserialize, Serialize};

/// Block slot: number of half-second intervals since 2000-01-01T00:00:00 UTC
#[derive(
    Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct BlockTimestamp {
    /// slot index
    pub slot: u32,
}

impl BlockTimestamp {
    /// Timestamp of a given slot
    pub const fn new(slot: u32) -> Self {
        BlockTimestamp { slot }
    }

    /// Slot containing the given unix time in milliseconds (clamped to the epoch)
    pub fn from_millis(unix_ms: u64) -> Self {
        let slot = unix_ms.saturating_sub(BLOCK_TIMESTAMP_EPOCH_MS) / BLOCK_INTERVAL_MS;
        BlockTimestamp {
            slot: u32::try_from(slot).unwrap_or(u32::MAX),
        }
    }

    /// Unix time in milliseconds of the start of the slot
    pub fn to_millis(&self) -> u64 {
        BLOCK_TIMESTAMP_EPOCH_MS + self.slot as u64 * BLOCK_INTERVAL_MS
    }

    /// Whole unix seconds of the slot
    pub fn to_time_point_sec(&self) -> TimePointSec {
        TimePointSec((self.to_millis() / 1000) as u32)
    }

    /// The following slot
    pub fn next(&self) -> Self {
        BlockTimestamp {
            slot: self.slot.saturating_add(1),
        }
    }

    /// `count` slots later
    pub fn plus_slots(&self, count: u32) -> Self {
        BlockTimestamp {
            slot: self.slot.saturating_add(count),
        }
    }

    /// Largest representable timestamp
    pub const fn maximum() -> Self {
        BlockTimestamp { slot: u32::MAX }
    }
}

impl std::fmt::Display for BlockTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot {} ({} ms)", self.slot, self.to_millis())
    }
}

/// Unix time with second precision, used for transaction expirations
#[derive(
    Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct TimePointSec(pub u32);

impl TimePointSec {
    /// Seconds since the unix epoch
    pub const fn secs(&self) -> u32 {
        self.0
    }

    /// `secs` seconds later
    pub fn plus_secs(&self, secs: u32) -> Self {
        TimePointSec(self.0.saturating_add(secs))
    }
}

/// Serializer for `BlockTimestamp`
#[derive(Default, Clone)]
pub struct BlockTimestampSerializer {
    u32_serializer: U32FixedSerializer,
}

impl BlockTimestampSerializer {
    /// Creates a `BlockTimestampSerializer`
    pub const fn new() -> Self {
        Self {
            u32_serializer: U32FixedSerializer::new(),
        }
    }
}

impl Serializer<BlockTimestamp> for BlockTimestampSerializer {
    fn serialize(&self, value: &BlockTimestamp, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        self.u32_serializer.serialize(&value.slot, buffer)
    }
}

/// Deserializer for `BlockTimestamp`
#[derive(Default, Clone)]
pub struct BlockTimestampDeserializer {
    u32_deserializer: U32FixedDeserializer,
}

impl BlockTimestampDeserializer {
    /// Creates a `BlockTimestampDeserializer`
    pub const fn new() -> Self {
        Self {
            u32_deserializer: U32FixedDeserializer::new(),
        }
    }
}

impl Deserializer<BlockTimestamp> for BlockTimestampDeserializer {
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], BlockTimestamp, E> {
        context("Failed BlockTimestamp deserialization", |input| {
            self.u32_deserializer.deserialize(input)
        })
        .map(BlockTimestamp::new)
        .parse(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_to_slot_start() {
        let ts = BlockTimestamp::from_millis(BLOCK_TIMESTAMP_EPOCH_MS + 1_250);
        assert_eq!(ts.slot, 2);
        assert_eq!(ts.to_millis(), BLOCK_TIMESTAMP_EPOCH_MS + 1_000);
        assert_eq!(ts.next().slot, 3);
        assert_eq!(BlockTimestamp::from_millis(0).slot, 0);
    }
}
