//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use tide_proto::value_schema::EPOCH_BEGIN;
use tide_proto::{generate_key, PutRequest, ValueEnvelope};
use tide_store::{
    CapacitySink, CapacityUnitCounters, CapacityUsage, ClusterIdentity, ClusterRegistry,
    MemEngine, StorageEngine, WriteService, WriteServiceConfig,
};

/// Duplication group used by most tests: `a` is local, `b` is remote.
pub const GROUP: &str = "a=1,b=2";
pub const LOCAL_ID: u8 = 1;
pub const REMOTE_ID: u8 = 2;

pub struct Harness {
    pub service: WriteService,
    pub engine: Arc<MemEngine>,
    pub counters: Arc<CapacityUnitCounters>,
}

/// Write service for cluster `a` over a fresh in-memory engine.
pub fn harness() -> Harness {
    harness_for("a")
}

pub fn harness_for(cluster: &str) -> Harness {
    harness_with_engine(cluster, Arc::new(MemEngine::new()))
}

pub fn harness_with_engine(cluster: &str, engine: Arc<MemEngine>) -> Harness {
    let counters = Arc::new(CapacityUnitCounters::new());
    let service = WriteService::new(engine.clone(), config_for(cluster), counters.clone())
        .expect("open write service");
    Harness {
        service,
        engine,
        counters,
    }
}

pub fn config_for(cluster: &str) -> WriteServiceConfig {
    let registry = ClusterRegistry::parse(GROUP).expect("parse duplication group");
    WriteServiceConfig::new(ClusterIdentity::resolve(cluster, registry).expect("resolve cluster"))
}

/// Unix microseconds of `secs` seconds after the store epoch.
pub fn ts(secs: u64) -> u64 {
    (EPOCH_BEGIN + secs) * 1_000_000
}

pub fn key(hash_key: &str, sort_key: &str) -> Vec<u8> {
    generate_key(hash_key.as_bytes(), sort_key.as_bytes()).expect("generate key")
}

pub fn put(hash_key: &str, sort_key: &str, value: &str) -> PutRequest {
    PutRequest {
        key: key(hash_key, sort_key),
        value: value.as_bytes().to_vec(),
        ttl_seconds: 0,
    }
}

/// Stored envelope at `(hash_key, sort_key)`, expired or not.
pub fn stored(engine: &MemEngine, hash_key: &str, sort_key: &str) -> Option<ValueEnvelope> {
    engine
        .get(&key(hash_key, sort_key))
        .expect("engine get")
        .map(|raw| ValueEnvelope::decode(&raw).expect("decode envelope"))
}

pub fn stored_value(engine: &MemEngine, hash_key: &str, sort_key: &str) -> Option<String> {
    stored(engine, hash_key, sort_key)
        .map(|envelope| String::from_utf8(envelope.user_value).expect("utf-8 value"))
}

/// Sink that always fails, to check that accounting never changes results.
pub struct FailingSink;

impl CapacitySink for FailingSink {
    fn record(&self, _usage: CapacityUsage) -> anyhow::Result<()> {
        anyhow::bail!("capacity sink unavailable")
    }
}
