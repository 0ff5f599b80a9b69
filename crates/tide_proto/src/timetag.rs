//! Timetag codec.
//!
//! A timetag packs the write timestamp, the id of the cluster the write
//! originated from, and a from-duplication flag into a single `u64`:
//!
//! ```text
//! | 63 .. 8: timestamp (us) | 7 .. 1: cluster id | 0: from duplication |
//! ```
//!
//! Because the timestamp occupies the high bits, comparing the raw `u64`
//! orders timetags by `(timestamp, cluster_id, flag)`. That total order is
//! what duplicated writes are arbitrated with.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of low bits holding the cluster id and the duplication flag.
pub const TIMESTAMP_SHIFT: u32 = 8;
/// Largest timestamp that fits in the 56 high bits.
pub const MAX_TIMESTAMP: u64 = (1 << (64 - TIMESTAMP_SHIFT)) - 1;
/// Largest cluster id; the lowest bit of the id byte is the duplication flag.
pub const MAX_CLUSTER_ID: u8 = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimetagError {
    #[error("cluster id {0} exceeds the timetag id space (max {MAX_CLUSTER_ID})")]
    ClusterIdOutOfRange(u8),
    #[error("timestamp {0} does not fit in 56 bits")]
    TimestampOutOfRange(u64),
}

/// Packed `(timestamp, cluster_id, from_duplication)` stored with each record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timetag(u64);

/// Unpacked fields of a [`Timetag`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimetagParts {
    pub timestamp: u64,
    pub cluster_id: u8,
    pub from_duplication: bool,
}

impl Timetag {
    pub const ZERO: Timetag = Timetag(0);

    pub fn make(timestamp: u64, cluster_id: u8, from_duplication: bool) -> Result<Self, TimetagError> {
        if cluster_id > MAX_CLUSTER_ID {
            return Err(TimetagError::ClusterIdOutOfRange(cluster_id));
        }
        if timestamp > MAX_TIMESTAMP {
            return Err(TimetagError::TimestampOutOfRange(timestamp));
        }
        Ok(Self(
            (timestamp << TIMESTAMP_SHIFT) | (u64::from(cluster_id) << 1) | u64::from(from_duplication),
        ))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn decode(self) -> TimetagParts {
        TimetagParts {
            timestamp: self.timestamp(),
            cluster_id: self.cluster_id(),
            from_duplication: self.is_from_duplication(),
        }
    }

    pub const fn timestamp(self) -> u64 {
        self.0 >> TIMESTAMP_SHIFT
    }

    pub const fn cluster_id(self) -> u8 {
        ((self.0 >> 1) & MAX_CLUSTER_ID as u64) as u8
    }

    pub const fn is_from_duplication(self) -> bool {
        self.0 & 1 == 1
    }
}

/// Total order used for last-writer-wins arbitration.
pub fn compare(a: Timetag, b: Timetag) -> Ordering {
    a.cmp(&b)
}

impl fmt::Display for Timetag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}{}",
            self.timestamp(),
            self.cluster_id(),
            if self.is_from_duplication() { "+dup" } else { "" }
        )
    }
}
