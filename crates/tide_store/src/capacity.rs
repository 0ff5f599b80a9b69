//! Read/write capacity-unit accounting.
//!
//! One capacity unit covers up to `unit_size` bytes of a touched record and
//! every touched record costs at least one unit. Handlers charge units after
//! the storage effect of a request is known; the charge is handed to a
//! [`CapacitySink`], whose failures are logged and otherwise ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tide_proto::{KeyValue, Mutate, Status};
use tracing::warn;

pub const DEFAULT_UNIT_SIZE: u64 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityConfig {
    pub read_unit_size: u64,
    pub write_unit_size: u64,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            read_unit_size: DEFAULT_UNIT_SIZE,
            write_unit_size: DEFAULT_UNIT_SIZE,
        }
    }
}

/// Units charged by one request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapacityUsage {
    pub read_units: u64,
    pub write_units: u64,
}

impl CapacityUsage {
    pub fn is_empty(&self) -> bool {
        self.read_units == 0 && self.write_units == 0
    }
}

/// Receiver of capacity charges, shared by every replica of a process.
pub trait CapacitySink: Send + Sync {
    fn record(&self, usage: CapacityUsage) -> anyhow::Result<()>;
}

/// Default sink: process-wide atomic totals.
#[derive(Debug, Default)]
pub struct CapacityUnitCounters {
    read_units: AtomicU64,
    write_units: AtomicU64,
    requests: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub read_units: u64,
    pub write_units: u64,
    pub requests: u64,
}

impl CapacityUnitCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            read_units: self.read_units.load(Ordering::Relaxed),
            write_units: self.write_units.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot_and_reset(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            read_units: self.read_units.swap(0, Ordering::Relaxed),
            write_units: self.write_units.swap(0, Ordering::Relaxed),
            requests: self.requests.swap(0, Ordering::Relaxed),
        }
    }
}

impl CapacitySink for CapacityUnitCounters {
    fn record(&self, usage: CapacityUsage) -> anyhow::Result<()> {
        self.read_units.fetch_add(usage.read_units, Ordering::Relaxed);
        self.write_units.fetch_add(usage.write_units, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Converts request shapes into capacity units and forwards them to the sink.
#[derive(Clone)]
pub struct CapacityUnitCalculator {
    config: CapacityConfig,
    sink: Arc<dyn CapacitySink>,
}

impl CapacityUnitCalculator {
    pub fn new(config: CapacityConfig, sink: Arc<dyn CapacitySink>) -> Self {
        Self { config, sink }
    }

    pub fn read_units(&self, bytes: usize) -> u64 {
        units(bytes, self.config.read_unit_size)
    }

    pub fn write_units(&self, bytes: usize) -> u64 {
        units(bytes, self.config.write_unit_size)
    }

    pub fn add_put_cu(&self, status: Status, key_len: usize, value_len: usize) {
        if !status.is_ok() {
            return;
        }
        self.notify(CapacityUsage {
            read_units: 0,
            write_units: self.write_units(key_len + value_len),
        });
    }

    pub fn add_remove_cu(&self, status: Status, key_len: usize) {
        if !status.is_ok() {
            return;
        }
        self.notify(CapacityUsage {
            read_units: 0,
            write_units: self.write_units(key_len),
        });
    }

    /// `kvs` are the records actually written; skipped ones cost nothing.
    pub fn add_multi_put_cu<'a>(
        &self,
        status: Status,
        hash_key: &[u8],
        kvs: impl IntoIterator<Item = &'a KeyValue>,
    ) {
        if !status.is_ok() {
            return;
        }
        let write_units = kvs
            .into_iter()
            .map(|kv| self.write_units(hash_key.len() + kv.sort_key.len() + kv.value.len()))
            .sum();
        self.notify(CapacityUsage {
            read_units: 0,
            write_units,
        });
    }

    pub fn add_multi_remove_cu(&self, status: Status, hash_key: &[u8], sort_keys: &[Vec<u8>]) {
        if !status.is_ok() {
            return;
        }
        let write_units = sort_keys
            .iter()
            .map(|sort_key| self.write_units(hash_key.len() + sort_key.len()))
            .sum();
        self.notify(CapacityUsage {
            read_units: 0,
            write_units,
        });
    }

    /// `read_bytes` is the size of the key plus the value read before the
    /// increment, `write_bytes` the size of the key plus the new value.
    pub fn add_incr_cu(&self, status: Status, read_bytes: usize, write_bytes: usize) {
        if !matches!(
            status,
            Status::Ok | Status::InvalidArgument | Status::Overflow
        ) {
            return;
        }
        let write_units = if status.is_ok() {
            self.write_units(write_bytes)
        } else {
            0
        };
        self.notify(CapacityUsage {
            read_units: self.read_units(read_bytes),
            write_units,
        });
    }

    pub fn add_check_and_set_cu(
        &self,
        status: Status,
        check_read_bytes: usize,
        hash_key: &[u8],
        set_sort_key: &[u8],
        set_value: &[u8],
    ) {
        if !counts_check(status) {
            return;
        }
        let write_units = if status.is_ok() {
            self.write_units(hash_key.len() + set_sort_key.len() + set_value.len())
        } else {
            0
        };
        self.notify(CapacityUsage {
            read_units: self.read_units(check_read_bytes),
            write_units,
        });
    }

    pub fn add_check_and_mutate_cu(
        &self,
        status: Status,
        check_read_bytes: usize,
        hash_key: &[u8],
        mutate_list: &[Mutate],
    ) {
        if !counts_check(status) {
            return;
        }
        let write_units = if status.is_ok() {
            mutate_list
                .iter()
                .map(|m| self.write_units(hash_key.len() + m.sort_key.len() + m.value.len()))
                .sum()
        } else {
            0
        };
        self.notify(CapacityUsage {
            read_units: self.read_units(check_read_bytes),
            write_units,
        });
    }

    /// Timetag verification of duplicated puts reads every target key.
    pub fn add_verify_read_cu(&self, keys_read: usize, bytes: usize) {
        if keys_read == 0 {
            return;
        }
        let read_units = self.read_units(bytes).max(keys_read as u64);
        self.notify(CapacityUsage {
            read_units,
            write_units: 0,
        });
    }

    fn notify(&self, usage: CapacityUsage) {
        if usage.is_empty() {
            return;
        }
        if let Err(err) = self.sink.record(usage) {
            warn!(
                read_units = usage.read_units,
                write_units = usage.write_units,
                error = ?err,
                "capacity sink rejected usage"
            );
        }
    }
}

fn counts_check(status: Status) -> bool {
    matches!(
        status,
        Status::Ok | Status::InvalidArgument | Status::TryAgain
    )
}

fn units(bytes: usize, unit_size: u64) -> u64 {
    let unit_size = unit_size.max(1);
    let bytes = bytes as u64;
    bytes.div_ceil(unit_size).max(1)
}
