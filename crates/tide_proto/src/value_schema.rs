//! Record value envelope: `[expire_ts: u32 BE][timetag: u64 BE][user value]`.
//!
//! `expire_ts` counts seconds since the store epoch (2016-01-01 UTC); zero
//! means the record never expires. The write service is the only writer of
//! this encoding and always rebuilds the whole envelope on write.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::timetag::Timetag;

/// Unix time of the store epoch, 2016-01-01T00:00:00Z.
pub const EPOCH_BEGIN: u64 = 1_451_606_400;
/// Size of the fixed envelope header.
pub const HEADER_LEN: usize = 4 + 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("value of {0} bytes is shorter than the {HEADER_LEN} byte envelope header")]
    ShortHeader(usize),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValueEnvelope {
    pub expire_ts: u32,
    pub timetag: Timetag,
    pub user_value: Vec<u8>,
}

impl ValueEnvelope {
    pub fn new(expire_ts: u32, timetag: Timetag, user_value: Vec<u8>) -> Self {
        Self {
            expire_ts,
            timetag,
            user_value,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_value(self.expire_ts, self.timetag, &self.user_value)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ValueError> {
        if data.len() < HEADER_LEN {
            return Err(ValueError::ShortHeader(data.len()));
        }
        let mut expire = [0u8; 4];
        expire.copy_from_slice(&data[..4]);
        let mut timetag = [0u8; 8];
        timetag.copy_from_slice(&data[4..HEADER_LEN]);
        Ok(Self {
            expire_ts: u32::from_be_bytes(expire),
            timetag: Timetag::from_raw(u64::from_be_bytes(timetag)),
            user_value: data[HEADER_LEN..].to_vec(),
        })
    }

    pub fn is_expired(&self, now: u32) -> bool {
        check_if_ts_expired(now, self.expire_ts)
    }
}

/// Encode without building an owned envelope first.
pub fn encode_value(expire_ts: u32, timetag: Timetag, user_value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + user_value.len());
    out.extend_from_slice(&expire_ts.to_be_bytes());
    out.extend_from_slice(&timetag.raw().to_be_bytes());
    out.extend_from_slice(user_value);
    out
}

pub fn check_if_ts_expired(now: u32, expire_ts: u32) -> bool {
    expire_ts > 0 && expire_ts <= now
}

/// Absolute expiry for a relative TTL; a zero TTL never expires.
pub fn expire_ts_from_ttl(now: u32, ttl_seconds: u32) -> u32 {
    if ttl_seconds == 0 {
        0
    } else {
        now.saturating_add(ttl_seconds)
    }
}

/// Seconds since the store epoch for a Unix timestamp in microseconds.
pub fn epoch_from_micros(unix_micros: u64) -> u32 {
    let secs = (unix_micros / 1_000_000).saturating_sub(EPOCH_BEGIN);
    secs.min(u64::from(u32::MAX)) as u32
}

/// Current time in seconds since the store epoch.
pub fn epoch_now() -> u32 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0);
    epoch_from_micros(micros)
}
