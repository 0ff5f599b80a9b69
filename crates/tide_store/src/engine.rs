use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use tide_proto::key_schema::is_empty_write_key;
use tide_proto::ValueEnvelope;
use tracing::warn;

use crate::error::StorageError;

const DATA_PARTITION: &str = "tide_data";
const META_PARTITION: &str = "tide_meta";
const LAST_COMMITTED_DECREE_KEY: &[u8] = b"last_committed_decree";

/// Local ordered key-value engine the write service applies decrees to.
///
/// `write` must be atomic: either every operation of the batch and the
/// batch decree become durable together, or none of them do.
pub trait StorageEngine: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn write(&self, batch: &WriteBatch) -> Result<(), StorageError>;
    fn last_committed_decree(&self) -> Result<i64, StorageError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Operations committed atomically under one decree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    decree: i64,
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new(decree: i64) -> Self {
        Self {
            decree,
            ops: Vec::new(),
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { key });
    }

    pub fn decree(&self) -> i64 {
        self.decree
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Point lookup of a live envelope: absent and expired records read as `None`.
pub fn read_live_record(
    engine: &dyn StorageEngine,
    key: &[u8],
    now: u32,
) -> Result<Option<ValueEnvelope>, StorageError> {
    let Some(bytes) = engine.get(key)? else {
        return Ok(None);
    };
    let envelope = ValueEnvelope::decode(&bytes).map_err(|err| StorageError::Corruption {
        key: key.to_vec(),
        reason: err.to_string(),
    })?;
    if envelope.is_expired(now) {
        return Ok(None);
    }
    Ok(Some(envelope))
}

/// User-visible read of a raw key. The empty-write sentinel is never visible.
pub fn read_user_value(
    engine: &dyn StorageEngine,
    key: &[u8],
    now: u32,
) -> Result<Option<Vec<u8>>, StorageError> {
    if is_empty_write_key(key) {
        return Ok(None);
    }
    Ok(read_live_record(engine, key, now)?.map(|envelope| envelope.user_value))
}

/// In-memory engine for tests and embedding, with injectable write failures.
#[derive(Default)]
pub struct MemEngine {
    inner: RwLock<MemState>,
    failing_writes: AtomicU32,
}

#[derive(Default)]
struct MemState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    last_committed_decree: i64,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `write` fail without applying anything.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Copy of every stored raw key and encoded value.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.inner
            .read()
            .map(|guard| guard.data.clone())
            .unwrap_or_default()
    }

    /// Store an already-encoded value outside any decree, e.g. to seed an
    /// expired or corrupted record in tests.
    pub fn insert_raw(&self, key: Vec<u8>, value: Vec<u8>) {
        if let Ok(mut guard) = self.inner.write() {
            guard.data.insert(key, value);
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl StorageEngine for MemEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| StorageError::Io("memory engine lock poisoned".to_string()))?;
        Ok(guard.data.get(key).cloned())
    }

    fn write(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        if self.take_injected_failure() {
            return Err(StorageError::Io(format!(
                "injected write failure at decree {}",
                batch.decree()
            )));
        }
        let mut guard = self
            .inner
            .write()
            .map_err(|_| StorageError::Io("memory engine lock poisoned".to_string()))?;
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    guard.data.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    guard.data.remove(key);
                }
            }
        }
        guard.last_committed_decree = guard.last_committed_decree.max(batch.decree());
        Ok(())
    }

    fn last_committed_decree(&self) -> Result<i64, StorageError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| StorageError::Io("memory engine lock poisoned".to_string()))?;
        Ok(guard.last_committed_decree)
    }
}

/// fjall-backed engine: user records in one partition, the last committed
/// decree in a meta partition, both updated by a single keyspace batch.
pub struct FjallEngine {
    keyspace: Arc<Keyspace>,
    data: fjall::PartitionHandle,
    meta: fjall::PartitionHandle,
    persist_mode: Option<PersistMode>,
}

impl FjallEngine {
    pub fn open(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let data = keyspace
            .open_partition(DATA_PARTITION, PartitionCreateOptions::default())
            .context("open data partition")?;
        let meta = keyspace
            .open_partition(META_PARTITION, PartitionCreateOptions::default())
            .context("open meta partition")?;
        Ok(Self {
            keyspace,
            data,
            meta,
            persist_mode: None,
        })
    }

    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("create storage dir {}", path.display()))?;
        let keyspace = fjall::Config::new(path)
            .open()
            .context("open fjall keyspace")?;
        Self::open(Arc::new(keyspace))
    }

    /// Persist the journal as part of every committed batch.
    pub fn with_persist_mode(mut self, mode: Option<PersistMode>) -> Self {
        self.persist_mode = mode;
        self
    }
}

impl StorageEngine for FjallEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(key)?.map(|value| value.to_vec()))
    }

    /// Journal persistence runs inside the batch commit, before the batch
    /// becomes visible; a persist failure leaves neither data nor decree
    /// applied.
    fn write(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        let mut fjall_batch = self.keyspace.batch().durability(self.persist_mode);
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    fjall_batch.insert(&self.data, key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    fjall_batch.remove(&self.data, key.clone());
                }
            }
        }
        fjall_batch.insert(
            &self.meta,
            LAST_COMMITTED_DECREE_KEY.to_vec(),
            batch.decree().to_be_bytes().to_vec(),
        );
        if let Err(err) = fjall_batch.commit() {
            warn!(decree = batch.decree(), error = ?err, "fjall batch commit failed");
            return Err(err.into());
        }
        Ok(())
    }

    fn last_committed_decree(&self) -> Result<i64, StorageError> {
        let Some(bytes) = self.meta.get(LAST_COMMITTED_DECREE_KEY)? else {
            return Ok(0);
        };
        let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| StorageError::Corruption {
            key: LAST_COMMITTED_DECREE_KEY.to_vec(),
            reason: format!("expected 8 decree bytes, found {}", bytes.len()),
        })?;
        Ok(i64::from_be_bytes(raw))
    }
}
