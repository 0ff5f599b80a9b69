//! Write service configuration and its command-line/environment surface.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use fjall::PersistMode;
use serde::{Deserialize, Serialize};
use tide_proto::MAX_CLUSTER_ID;

use crate::capacity::{CapacityConfig, DEFAULT_UNIT_SIZE};

/// Cluster names of one duplication group and their timetag cluster ids.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRegistry {
    clusters: BTreeMap<String, u8>,
}

impl ClusterRegistry {
    /// Parse `name=id,name=id`. Ids must be unique and at most 127.
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let mut registry = Self::default();
        for part in input.split(',').filter(|s| !s.trim().is_empty()) {
            let (name, id) = part
                .split_once('=')
                .with_context(|| format!("invalid cluster entry (expected name=id): {part}"))?;
            let id: u8 = id
                .trim()
                .parse()
                .with_context(|| format!("invalid cluster id for {}", name.trim()))?;
            registry.insert(name.trim(), id)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: &str, cluster_id: u8) -> anyhow::Result<()> {
        anyhow::ensure!(!name.is_empty(), "cluster name is empty");
        anyhow::ensure!(
            cluster_id <= MAX_CLUSTER_ID,
            "cluster id {cluster_id} of {name} exceeds {MAX_CLUSTER_ID}"
        );
        if let Some(existing) = self.name_of(cluster_id) {
            anyhow::ensure!(
                existing == name,
                "cluster id {cluster_id} is assigned to both {existing} and {name}"
            );
        }
        if let Some(existing) = self.clusters.get(name) {
            anyhow::ensure!(
                *existing == cluster_id,
                "cluster {name} is assigned both id {existing} and id {cluster_id}"
            );
        }
        self.clusters.insert(name.to_string(), cluster_id);
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.clusters.get(name).copied()
    }

    pub fn name_of(&self, cluster_id: u8) -> Option<&str> {
        self.clusters
            .iter()
            .find(|(_, id)| **id == cluster_id)
            .map(|(name, _)| name.as_str())
    }

    pub fn contains_id(&self, cluster_id: u8) -> bool {
        self.name_of(cluster_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// The local cluster and the duplication group it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub name: String,
    pub cluster_id: u8,
    pub registry: ClusterRegistry,
}

impl ClusterIdentity {
    /// Look up `name` in `registry`; the local cluster must be a member.
    pub fn resolve(name: &str, registry: ClusterRegistry) -> anyhow::Result<Self> {
        let cluster_id = registry
            .id_of(name)
            .with_context(|| format!("cluster {name} is not in the duplication group"))?;
        Ok(Self {
            name: name.to_string(),
            cluster_id,
            registry,
        })
    }

    /// A cluster duplicating with nobody.
    pub fn single(name: &str, cluster_id: u8) -> anyhow::Result<Self> {
        let mut registry = ClusterRegistry::default();
        registry.insert(name, cluster_id)?;
        Self::resolve(name, registry)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteServiceConfig {
    pub cluster: ClusterIdentity,
    /// TTL applied to writes that carry none; 0 disables it.
    pub default_ttl_seconds: u32,
    pub capacity: CapacityConfig,
}

impl WriteServiceConfig {
    pub fn new(cluster: ClusterIdentity) -> Self {
        Self {
            cluster,
            default_ttl_seconds: 0,
            capacity: CapacityConfig::default(),
        }
    }
}

/// Durability of each committed batch in the fjall journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum PersistModeArg {
    /// Leave flushing to fjall.
    Buffer,
    #[value(alias = "sync_data")]
    SyncData,
    #[value(alias = "sync_all")]
    SyncAll,
}

impl PersistModeArg {
    pub fn to_fjall(self) -> PersistMode {
        match self {
            PersistModeArg::Buffer => PersistMode::Buffer,
            PersistModeArg::SyncData => PersistMode::SyncData,
            PersistModeArg::SyncAll => PersistMode::SyncAll,
        }
    }
}

/// Options shared by every `tide-store` subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, env = "TIDE_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Name of the local cluster; must appear in the duplication group.
    #[arg(long, env = "TIDE_CLUSTER_NAME", default_value = "local")]
    pub cluster_name: String,

    /// Duplication group as `name=id,...`. Defaults to the local cluster
    /// alone with id 1.
    #[arg(long, env = "TIDE_DUPLICATION_GROUP", default_value = "")]
    pub duplication_group: String,

    #[arg(long, env = "TIDE_DEFAULT_TTL", default_value_t = 0)]
    pub default_ttl_seconds: u32,

    #[arg(long, env = "TIDE_READ_UNIT_SIZE", default_value_t = DEFAULT_UNIT_SIZE)]
    pub read_unit_size: u64,

    #[arg(long, env = "TIDE_WRITE_UNIT_SIZE", default_value_t = DEFAULT_UNIT_SIZE)]
    pub write_unit_size: u64,

    #[arg(long, env = "TIDE_PERSIST_MODE", default_value = "buffer")]
    pub persist_mode: PersistModeArg,
}

impl StoreArgs {
    pub fn service_config(&self) -> anyhow::Result<WriteServiceConfig> {
        let cluster = if self.duplication_group.trim().is_empty() {
            ClusterIdentity::single(&self.cluster_name, 1)?
        } else {
            let registry = ClusterRegistry::parse(&self.duplication_group)
                .context("parse duplication group")?;
            ClusterIdentity::resolve(&self.cluster_name, registry)?
        };
        anyhow::ensure!(self.read_unit_size > 0, "read unit size must be positive");
        anyhow::ensure!(self.write_unit_size > 0, "write unit size must be positive");
        Ok(WriteServiceConfig {
            cluster,
            default_ttl_seconds: self.default_ttl_seconds,
            capacity: CapacityConfig {
                read_unit_size: self.read_unit_size,
                write_unit_size: self.write_unit_size,
            },
        })
    }
}
